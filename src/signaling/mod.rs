//! Канал до relay.
//!
//! Транспорт ([`RelayConnector`]) отдаёт пару текстовых очередей
//! ([`RelayLink`]); [`SignalingChannel`] поверх неё кодирует и декодирует
//! сообщения. Переподключение канал сам не делает.

pub mod protocol;
pub mod websocket;

use crate::error::{Error, Result};
use async_trait::async_trait;
use protocol::{RelayEvent, Signal, SignalCodec};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use protocol::TaggedCodec;
pub use websocket::WebSocketConnector;

/// Кадр от транспорта
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    Text(String),
    /// Транспорт закрыт; причина, если известна
    Closed(Option<String>),
}

/// Открытое соединение с relay
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkFrame>,
}

/// Открывает соединение с relay под именем пользователя
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<RelayLink>;
}

pub struct SignalingChannel {
    identity: String,
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<LinkFrame>,
    codec: Arc<dyn SignalCodec>,
    alive: bool,
}

impl SignalingChannel {
    pub async fn connect(
        connector: &dyn RelayConnector,
        identity: &str,
        codec: Arc<dyn SignalCodec>,
    ) -> Result<Self> {
        let link = connector.connect(identity).await?;
        info!("Signaling channel open for {identity}");
        Ok(Self::from_link(identity, link, codec))
    }

    pub fn from_link(identity: &str, link: RelayLink, codec: Arc<dyn SignalCodec>) -> Self {
        Self {
            identity: identity.to_string(),
            outbound: Some(link.outbound),
            inbound: link.inbound,
            codec,
            alive: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.alive && self.outbound.is_some()
    }

    /// Отправка никогда не падает: на закрытом канале это no-op,
    /// ошибки только логируются.
    pub fn send(&self, signal: &Signal) {
        let Some(outbound) = self.outbound.as_ref().filter(|_| self.alive) else {
            debug!("Channel closed, dropping outbound {}", signal.kind());
            return;
        };
        let text = match self.codec.encode(signal) {
            Ok(text) => text,
            Err(e) => {
                warn!(class = e.class(), "Error encoding message: {e}");
                return;
            }
        };
        if outbound.send(text).is_err() {
            warn!(class = "channel", "Error sending {}: link is gone", signal.kind());
        } else {
            debug!("Sent {}", signal.kind());
        }
    }

    /// Следующее событие в порядке relay.
    ///
    /// `Error::Protocol`: кадр не разобран, канал жив.
    /// `Error::Channel`: транспорт потерян; после этого события больше не
    /// приходят (future не завершается).
    pub async fn next_event(&mut self) -> Result<RelayEvent> {
        if !self.alive {
            return std::future::pending().await;
        }
        match self.inbound.recv().await {
            Some(LinkFrame::Text(text)) => self.codec.decode(&text),
            Some(LinkFrame::Closed(reason)) => {
                self.mark_dead();
                Err(Error::Channel(
                    reason.unwrap_or_else(|| "relay closed the connection".to_string()),
                ))
            }
            None => {
                self.mark_dead();
                Err(Error::Channel("relay link dropped".to_string()))
            }
        }
    }

    /// Закрывает канал; повторный вызов ничего не делает
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            info!("Signaling channel closed for {}", self.identity);
        }
        self.alive = false;
        self.inbound.close();
    }

    fn mark_dead(&mut self) {
        self.alive = false;
        self.outbound = None;
    }
}
