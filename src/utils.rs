use crate::peer::types::ServerConfig;
use rand::RngCore;

const ICE_SCHEMES: [&str; 3] = ["stun:", "turn:", "turns:"];

/// `len` случайных байт в hex
pub fn random_hex(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Идентификатор сессии для логов
pub fn random_id() -> String {
    random_hex(8)
}

/// URL ICE сервера со схемой; без схемы она выводится из типа сервера
pub fn ice_url(server: &ServerConfig) -> String {
    if ICE_SCHEMES.iter().any(|s| server.url.starts_with(s)) {
        return server.url.clone();
    }
    match server.r#type.as_str() {
        "turn" => format!("turn:{}", server.url),
        _ => format!("stun:{}", server.url),
    }
}
