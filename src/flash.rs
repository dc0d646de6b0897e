//! One-shot user messages carried across a redirect in a signed cookie.

use axum::headers::Cookie;
use axum::http::HeaderValue;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_NAME: &str = "flash";

/// Longest message, in chars, carried in the cookie. Hex doubles the size, so this stays
/// well inside the 4 KB browsers allow per cookie.
pub const MESSAGE_MAX: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub level: Level,
    pub message: String,
}

impl Flash {
    pub fn success<S: Into<String>>(message: S) -> Self {
        Self {
            level: Level::Success,
            message: message.into(),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Self {
            level: Level::Error,
            message: message.into(),
        }
    }
}

/// Signs and verifies flash cookies with the application secret.
#[derive(Clone)]
pub struct FlashKey {
    secret: Arc<[u8]>,
}

impl FlashKey {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret.as_bytes()),
        }
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).ok()
    }

    /// Cookie value: `<hex json>.<hex mac>`.
    pub fn encode(&self, flash: &Flash) -> Option<String> {
        let flash = Flash {
            level: flash.level,
            message: truncate(&flash.message, MESSAGE_MAX),
        };
        let payload = hex::encode(serde_json::to_vec(&flash).ok()?);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Some(format!("{}.{}", payload, signature))
    }

    pub fn decode(&self, value: &str) -> Option<Flash> {
        let (payload, signature) = value.split_once('.')?;
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).ok()?;
        serde_json::from_slice(&hex::decode(payload).ok()?).ok()
    }

    pub fn set_cookie(&self, flash: &Flash) -> Option<HeaderValue> {
        let value = self.encode(flash)?;
        HeaderValue::from_str(&format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            COOKIE_NAME, value
        ))
        .ok()
    }

    pub fn read(&self, cookie: Option<&Cookie>) -> Option<Flash> {
        let value = cookie?.get(COOKIE_NAME)?;
        let flash = self.decode(value);
        if flash.is_none() {
            log::warn!("Ignoring flash cookie with a bad signature");
        }
        flash
    }
}

fn truncate(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &message[..cut]),
        None => message.to_string(),
    }
}

pub fn clear_cookie() -> HeaderValue {
    HeaderValue::from_static("flash=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_flash_decodes_with_same_key() {
        let key = FlashKey::new("s3cret");
        let flash = Flash::success("Student added");
        let encoded = key.encode(&flash).unwrap();
        assert_eq!(key.decode(&encoded), Some(flash));
    }

    #[test]
    fn rejects_foreign_or_tampered_cookies() {
        let key = FlashKey::new("s3cret");
        let encoded = key.encode(&Flash::error("Student not found")).unwrap();

        assert_eq!(FlashKey::new("other").decode(&encoded), None);

        let (payload, signature) = encoded.split_once('.').unwrap();
        let forged = hex::encode(serde_json::to_vec(&Flash::success("hi")).unwrap());
        assert_eq!(key.decode(&format!("{}.{}", forged, signature)), None);
        assert_eq!(key.decode(payload), None);
        assert_eq!(key.decode("zz.zz"), None);
    }

    #[test]
    fn cookie_header_shape() {
        let key = FlashKey::new("s3cret");
        let header = key.set_cookie(&Flash::success("ok")).unwrap();
        let header = header.to_str().unwrap();
        assert!(header.starts_with("flash="));
        assert!(header.ends_with("; Path=/; HttpOnly; SameSite=Lax"));
        assert!(clear_cookie().to_str().unwrap().contains("Max-Age=0"));
    }

    #[test]
    fn long_messages_are_cut_to_fit_a_cookie() {
        let key = FlashKey::new("s3cret");
        let long = "é".repeat(3_000);
        let header = key.set_cookie(&Flash::error(long)).unwrap();
        assert!(header.len() < 4096);

        let value = header.to_str().unwrap()["flash=".len()..]
            .split(';')
            .next()
            .unwrap();
        let decoded = key.decode(value).unwrap();
        assert_eq!(decoded.message.chars().count(), MESSAGE_MAX + 1);
        assert!(decoded.message.ends_with('…'));

        let short = key.encode(&Flash::success("Student added")).unwrap();
        assert_eq!(key.decode(&short).unwrap().message, "Student added");
    }

    #[test]
    fn level_serializes_lowercase() {
        let value = serde_json::to_value(Flash::error("nope")).unwrap();
        assert_eq!(value, serde_json::json!({ "level": "error", "message": "nope" }));
    }
}
