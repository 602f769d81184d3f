use serde::{Deserialize, Serialize};

/// Тип SDP описания
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// SDP описание в том виде, в каком его шлёт браузер: `{type, sdp}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE кандидат для WebRTC соединения (формат `RTCIceCandidateInit`)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// host / srflx / prflx / relay, если удалось разобрать строку
    pub fn kind(&self) -> &'static str {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return match parts.next() {
                    Some("host") => "host",
                    Some("srflx") => "srflx",
                    Some("prflx") => "prflx",
                    Some("relay") => "relay",
                    _ => "unknown",
                };
            }
        }
        "unknown"
    }
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn stun(id: &str, url: &str) -> Self {
        Self {
            id: id.into(),
            r#type: "stun".into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 192.168.1.2 54400 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let cand: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(cand.sdp_mid.as_deref(), Some("0"));
        assert_eq!(cand.sdp_mline_index, Some(0));
        assert_eq!(cand.kind(), "host");

        let back = serde_json::to_value(&cand).unwrap();
        assert!(back.get("sdpMLineIndex").is_some());
        assert!(back.get("usernameFragment").is_none());
    }

    #[test]
    fn test_candidate_null_mid() {
        let json = r#"{"candidate":"candidate:2 1 udp 1686052607 1.2.3.4 61000 typ srflx raddr 0.0.0.0 rport 0","sdpMid":null,"sdpMLineIndex":null}"#;
        let cand: IceCandidate = serde_json::from_str(json).unwrap();
        assert!(cand.sdp_mid.is_none());
        assert_eq!(cand.kind(), "srflx");
    }

    #[test]
    fn test_description_shape() {
        let desc: SessionDescription =
            serde_json::from_str(r#"{"type":"answer","sdp":"v=0\r\n"}"#).unwrap();
        assert_eq!(desc, SessionDescription::answer("v=0\r\n"));
        assert!(serde_json::from_str::<SessionDescription>(r#"{"type":"bogus","sdp":""}"#).is_err());
    }
}
