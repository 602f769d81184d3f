//! Сообщения relay и их JSON представление.
//!
//! Есть две версии relay. Одна пишет `{"type": "partnerFound", ...}` и
//! пересылает `offer`/`answer`/`ice-candidate`, другая пишет
//! `{"event": "paired", ...}` и пересылает `webrtc-offer`/`webrtc-answer`/
//! `webrtc-ice`. Движку всё равно: он работает с [`RelayEvent`] и [`Signal`],
//! а имена сообщений подставляет кодек.

use crate::config::ProtocolVariant;
use crate::error::{Error, Result};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// Входящие события (relay → клиент)
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    PartnerFound {
        partner: Option<String>,
        is_initiator: bool,
    },
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    PartnerSkipped,
    PartnerDisconnected,
    /// Партнёр ушёл, relay уже вернул нас в очередь сам
    PartnerLeft,
    System(String),
    Waiting,
    Searching,
}

/// Исходящие сообщения (клиент → relay)
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Next,
    Disconnect,
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
            Signal::Next => "next",
            Signal::Disconnect => "disconnect",
        }
    }
}

pub trait SignalCodec: Send + Sync {
    fn decode(&self, text: &str) -> Result<RelayEvent>;
    fn encode(&self, signal: &Signal) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Incoming {
    Paired,
    Offer,
    Answer,
    Candidate,
    Skipped,
    Disconnected,
    Left,
    System,
    Waiting,
    Searching,
}

/// Кодек для `{<tag>: kind, "data": payload}` со словарём своей версии relay
#[derive(Debug, Clone, Copy)]
pub struct TaggedCodec {
    variant: ProtocolVariant,
}

impl TaggedCodec {
    pub fn typed() -> Self {
        Self {
            variant: ProtocolVariant::Typed,
        }
    }

    pub fn evented() -> Self {
        Self {
            variant: ProtocolVariant::Evented,
        }
    }

    pub fn for_variant(variant: ProtocolVariant) -> Arc<dyn SignalCodec> {
        Arc::new(Self { variant })
    }

    fn tag(&self) -> &'static str {
        match self.variant {
            ProtocolVariant::Typed => "type",
            ProtocolVariant::Evented => "event",
        }
    }

    fn incoming(&self, kind: &str) -> Option<Incoming> {
        use ProtocolVariant::{Evented, Typed};
        let known = match (self.variant, kind) {
            (Typed, "partnerFound") | (Evented, "paired") => Incoming::Paired,
            (Typed, "offer") | (Evented, "webrtc-offer") => Incoming::Offer,
            (Typed, "answer") | (Evented, "webrtc-answer") => Incoming::Answer,
            (Typed, "ice-candidate") | (Evented, "webrtc-ice") => Incoming::Candidate,
            (Typed, "partnerSkipped") => Incoming::Skipped,
            (Typed, "partnerDisconnected") => Incoming::Disconnected,
            (Evented, "partner-left") => Incoming::Left,
            (Typed, "searching") => Incoming::Searching,
            (_, "system") => Incoming::System,
            (_, "waiting") => Incoming::Waiting,
            _ => return None,
        };
        Some(known)
    }

    fn outgoing(&self, signal: &Signal) -> &'static str {
        match (self.variant, signal) {
            (ProtocolVariant::Evented, Signal::Offer(_)) => "webrtc-offer",
            (ProtocolVariant::Evented, Signal::Answer(_)) => "webrtc-answer",
            (ProtocolVariant::Evented, Signal::IceCandidate(_)) => "webrtc-ice",
            _ => signal.kind(),
        }
    }
}

fn description(data: Value, expected: SdpKind) -> Result<SessionDescription> {
    let desc: SessionDescription = serde_json::from_value(data)
        .map_err(|e| Error::protocol(format!("bad session description: {e}")))?;
    if desc.kind != expected {
        return Err(Error::protocol(format!(
            "expected {expected:?} description, got {:?}",
            desc.kind
        )));
    }
    Ok(desc)
}

fn text_field<'a>(frame: &'a Value, data: &'a Value, key: &str) -> Option<&'a str> {
    frame
        .get(key)
        .and_then(Value::as_str)
        .or_else(|| data.get(key).and_then(Value::as_str))
}

impl SignalCodec for TaggedCodec {
    fn decode(&self, text: &str) -> Result<RelayEvent> {
        let frame: Value = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("malformed frame: {e}")))?;
        let tag = self.tag();
        let kind = frame
            .get(tag)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol(format!("frame without `{tag}`")))?;
        let known = self
            .incoming(kind)
            .ok_or_else(|| Error::protocol(format!("unknown message kind `{kind}`")))?;
        let data = frame.get("data").cloned().unwrap_or(Value::Null);

        let event = match known {
            Incoming::Paired => {
                let partner = text_field(&frame, &data, "from_user")
                    .or_else(|| text_field(&frame, &data, "partner"))
                    .map(str::to_string);
                let is_initiator = match ["is_initiator", "initiator"]
                    .iter()
                    .find_map(|key| frame.get(*key).or_else(|| data.get(*key)))
                    .and_then(Value::as_bool)
                {
                    Some(flag) => flag,
                    None => {
                        warn!("{kind} without initiator flag, acting as responder");
                        false
                    }
                };
                RelayEvent::PartnerFound {
                    partner,
                    is_initiator,
                }
            }
            Incoming::Offer => RelayEvent::Offer(description(data, SdpKind::Offer)?),
            Incoming::Answer => RelayEvent::Answer(description(data, SdpKind::Answer)?),
            Incoming::Candidate => RelayEvent::IceCandidate(
                serde_json::from_value(data)
                    .map_err(|e| Error::protocol(format!("bad ice candidate: {e}")))?,
            ),
            Incoming::Skipped => RelayEvent::PartnerSkipped,
            Incoming::Disconnected => RelayEvent::PartnerDisconnected,
            Incoming::Left => RelayEvent::PartnerLeft,
            Incoming::System => RelayEvent::System(
                text_field(&frame, &data, "message")
                    .unwrap_or("System update")
                    .to_string(),
            ),
            Incoming::Waiting => RelayEvent::Waiting,
            Incoming::Searching => RelayEvent::Searching,
        };
        Ok(event)
    }

    fn encode(&self, signal: &Signal) -> Result<String> {
        let data = match signal {
            Signal::Offer(desc) | Signal::Answer(desc) => Some(json!(desc)),
            Signal::IceCandidate(candidate) => Some(json!(candidate)),
            Signal::Next | Signal::Disconnect => None,
        };

        let mut frame = serde_json::Map::new();
        frame.insert(self.tag().to_string(), Value::from(self.outgoing(signal)));
        if let Some(data) = data {
            frame.insert("data".to_string(), data);
        }
        serde_json::to_string(&Value::Object(frame))
            .map_err(|e| Error::protocol(format!("cannot encode {}: {e}", signal.kind())))
    }
}
