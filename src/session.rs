use crate::media::LocalMediaStream;
use crate::peer::engine::NegotiationEngine;
use crate::peer::state::{NegotiationState, Role};
use crate::utils::random_id;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;

/// Одна пара собеседников. Живёт от `partnerFound` до teardown.
pub struct Session {
    pub id: String,
    pub partner: Option<String>,
    pub paired_at: DateTime<Local>,
    pub local: Arc<LocalMediaStream>,
    pub engine: NegotiationEngine,
}

impl Session {
    pub fn new(
        partner: Option<String>,
        local: Arc<LocalMediaStream>,
        engine: NegotiationEngine,
    ) -> Self {
        Self {
            id: random_id(),
            partner,
            paired_at: Local::now(),
            local,
            engine,
        }
    }

    pub fn generation(&self) -> u64 {
        self.engine.generation()
    }

    pub fn role(&self) -> Role {
        self.engine.role()
    }

    pub fn state(&self) -> NegotiationState {
        self.engine.state()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            generation: self.generation(),
            partner: self.partner.clone(),
            role: self.role(),
            state: self.state(),
            paired_at: self.paired_at,
        }
    }
}

/// Снимок сессии для слоя представления
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub generation: u64,
    pub partner: Option<String>,
    pub role: Role,
    pub state: NegotiationState,
    pub paired_at: DateTime<Local>,
}
