//! Ошибки ядра видеочата

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Ошибки, которые может вернуть ядро
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Камера/микрофон недоступны или доступ запрещён
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Связь с relay потеряна или не установлена
    #[error("Signaling channel error: {0}")]
    Channel(String),

    /// Не удалось применить описание или кандидата
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Неизвестное или битое сообщение от relay
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn negotiation(msg: impl Into<String>) -> Self {
        Error::Negotiation(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Класс ошибки для логов
    pub fn class(&self) -> &'static str {
        match self {
            Error::MediaAccess(_) => "media",
            Error::Channel(_) => "channel",
            Error::Negotiation(_) | Error::WebRtc(_) => "negotiation",
            Error::Protocol(_) => "protocol",
            Error::InvalidConfig(_) => "config",
            Error::Io(_) => "io",
        }
    }

    /// Ошибка не даёт начать чат вообще
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::MediaAccess(_) | Error::InvalidConfig(_))
    }
}
