// Конфигурация приложения
// Уровень логирования по умолчанию зависит от режима сборки, RUST_LOG его перекрывает

use crate::error::{Error, Result};
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "sayonara=debug,sayonara_lib=debug,webrtc=warn"; // В режиме отладки подробные логи

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn"; // В продакшене только предупреждения

pub const DEV_RELAY_URL: &str = "ws://localhost:8000/ws-video";
pub const PROD_RELAY_URL: &str = "wss://sayonara-3.onrender.com/ws-video";

/// Куда подключаемся
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    Development,
    Production,
}

impl Deployment {
    pub fn current() -> Self {
        if cfg!(debug_assertions) {
            Deployment::Development
        } else {
            Deployment::Production
        }
    }

    pub fn relay_url(self) -> &'static str {
        match self {
            Deployment::Development => DEV_RELAY_URL,
            Deployment::Production => PROD_RELAY_URL,
        }
    }
}

/// Форма сообщений relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    /// `{"type": ..., "data": ...}`
    #[default]
    Typed,
    /// `{"event": ..., "data": ...}`
    Evented,
}

/// Политика переподключения к relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// false: переподключение только по команде пользователя
    pub automatic: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            automatic: false,
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Задержка перед попыткой `attempt` (с нуля), удваивается до `max_delay_ms`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub relay_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub media: MediaConstraints,
    pub protocol: ProtocolVariant,
    /// Сколько сессия может висеть в NEGOTIATING; None: без ограничения
    pub negotiation_timeout_secs: Option<u64>,
    /// Таймаут одного шага (create_offer, set_remote_description, ...)
    pub step_timeout_secs: u64,
    /// Сколько ждать восстановления после `disconnected`; None: сразу закрываем
    pub disconnect_grace_secs: Option<u64>,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            relay_url: Deployment::current().relay_url().to_string(),
            ice_servers: default_ice_servers(),
            media: MediaConstraints::default(),
            protocol: ProtocolVariant::Typed,
            negotiation_timeout_secs: Some(30),
            step_timeout_secs: 10,
            disconnect_grace_secs: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ChatConfig {
    pub fn for_deployment(deployment: Deployment) -> Self {
        Self {
            relay_url: deployment.relay_url().to_string(),
            ..Self::default()
        }
    }

    /// Читает JSON файл; отсутствующие поля берутся по умолчанию
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: ChatConfig = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Конфигурация по умолчанию с переопределениями из окружения
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SAYONARA_ENV").ok().as_deref() {
            Some("production") | Some("prod") => Self::for_deployment(Deployment::Production),
            Some("development") | Some("dev") => Self::for_deployment(Deployment::Development),
            Some(other) => {
                return Err(Error::InvalidConfig(format!("unknown SAYONARA_ENV `{other}`")))
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("SAYONARA_RELAY_URL") {
            self.relay_url = url;
        }
        match var("SAYONARA_PROTOCOL").as_deref() {
            Some("typed") => self.protocol = ProtocolVariant::Typed,
            Some("evented") => self.protocol = ProtocolVariant::Evented,
            Some(other) => {
                return Err(Error::InvalidConfig(format!("unknown SAYONARA_PROTOCOL `{other}`")))
            }
            None => {}
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_url.is_empty() {
            return Err(Error::InvalidConfig("relay_url cannot be empty".into()));
        }
        validate_ice_servers(&self.ice_servers)?;
        if self.step_timeout_secs == 0 {
            return Err(Error::InvalidConfig("step_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_secs.map(Duration::from_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Option<Duration> {
        self.disconnect_grace_secs.map(Duration::from_secs)
    }
}

/// Дефолтные STUN серверы
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

/// Валидация серверов
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<()> {
    for server in servers {
        if server.url.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "ICE server `{}`: URL cannot be empty",
                server.id
            )));
        }

        match server.r#type.as_str() {
            "stun" => {}
            "turn" => {
                if server.username.is_none() || server.credential.is_none() {
                    return Err(Error::InvalidConfig(format!(
                        "ICE server `{}`: TURN servers require username and credential",
                        server.id
                    )));
                }
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "ICE server `{}`: unknown type `{other}`",
                    server.id
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        assert_eq!(policy.delay(10), Duration::from_millis(10_000));
        assert_eq!(policy.delay(200), Duration::from_millis(10_000));
    }

    #[test]
    fn test_turn_requires_credentials() {
        let turn = ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "turn:turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: None,
        };
        assert!(validate_ice_servers(&[turn.clone()]).is_err());

        let turn = ServerConfig {
            credential: Some("secret".into()),
            ..turn
        };
        assert!(validate_ice_servers(&[turn]).is_ok());
    }

    #[test]
    fn test_empty_url_rejected() {
        let server = ServerConfig::stun("s", "");
        assert!(matches!(
            validate_ice_servers(&[server]),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SAYONARA_RELAY_URL", "ws://relay.test:9000/ws-video"),
            ("SAYONARA_PROTOCOL", "evented"),
        ]
        .into_iter()
        .collect();
        let mut config = ChatConfig::for_deployment(Deployment::Production);
        config
            .apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.relay_url, "ws://relay.test:9000/ws-video");
        assert_eq!(config.protocol, ProtocolVariant::Evented);

        let mut config = ChatConfig::default();
        let err = config
            .apply_env_overrides(|k| (k == "SAYONARA_PROTOCOL").then(|| "xml".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"relay_url": "ws://127.0.0.1:8000/ws-video", "negotiation_timeout_secs": null, "reconnect": {{"automatic": true}}}}"#
        )
        .unwrap();

        let config = ChatConfig::load(file.path()).unwrap();
        assert_eq!(config.relay_url, "ws://127.0.0.1:8000/ws-video");
        assert_eq!(config.negotiation_timeout(), None);
        assert!(config.reconnect.automatic);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.step_timeout(), Duration::from_secs(10));
        assert_eq!(config.ice_servers, default_ice_servers());
    }

    #[test]
    fn test_deployment_urls() {
        assert_eq!(
            ChatConfig::for_deployment(Deployment::Production).relay_url,
            PROD_RELAY_URL
        );
        assert_eq!(Deployment::Development.relay_url(), DEV_RELAY_URL);
    }
}
