//! Signed attempt-session tokens.
//!
//! The server holds no state between quiz start and finalize; the start
//! timestamp the deadline check needs travels with the client inside an
//! HMAC-signed token instead of a session table.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSession {
    pub learner_id: Uuid,
    pub quiz_id: Uuid,
    pub attempt_session: i32,
    pub started_at: DateTime<Utc>,
}

impl AttemptSession {
    fn payload(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.learner_id,
            self.quiz_id,
            self.attempt_session,
            self.started_at.timestamp()
        )
    }
}

pub fn sign(session: &AttemptSession, secret: &str) -> String {
    let payload = session.payload();
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    let tag = mac.finalize().into_bytes();
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(payload.as_bytes()),
        URL_SAFE_NO_PAD.encode(tag)
    )
}

/// Decodes and authenticates a token. A malformed or tampered token is a
/// validation error, not a policy one: the client never legitimately holds
/// such a value.
pub fn verify(token: &str, secret: &str) -> Result<AttemptSession> {
    let bad = || Error::Validation("invalid session token".into());

    let (payload_b64, tag_b64) = token.split_once('.').ok_or_else(bad)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| bad())?;
    let tag = URL_SAFE_NO_PAD.decode(tag_b64).map_err(|_| bad())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(&payload);
    mac.verify_slice(&tag).map_err(|_| bad())?;

    let payload = String::from_utf8(payload).map_err(|_| bad())?;
    let mut parts = payload.split('.');
    let learner_id = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let quiz_id = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let attempt_session = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let started_unix: i64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    if parts.next().is_some() {
        return Err(bad());
    }
    let started_at = Utc
        .timestamp_opt(started_unix, 0)
        .single()
        .ok_or_else(bad)?;

    Ok(AttemptSession {
        learner_id,
        quiz_id,
        attempt_session,
        started_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AttemptSession {
        AttemptSession {
            learner_id: Uuid::new_v4(),
            quiz_id: Uuid::new_v4(),
            attempt_session: 2,
            started_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn round_trip() {
        let s = session();
        let token = sign(&s, "secret");
        assert_eq!(verify(&token, "secret").unwrap(), s);
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = sign(&session(), "secret");
        assert!(verify(&token, "other").is_err());
    }

    #[test]
    fn tampered_payload_rejected() {
        let s = session();
        let token = sign(&s, "secret");
        let (_, tag) = token.split_once('.').unwrap();
        let forged = AttemptSession {
            attempt_session: 1,
            ..s
        };
        let forged_payload = URL_SAFE_NO_PAD.encode(forged.payload().as_bytes());
        assert!(verify(&format!("{forged_payload}.{tag}"), "secret").is_err());
    }

    #[test]
    fn garbage_rejected() {
        assert!(verify("not-a-token", "secret").is_err());
        assert!(verify("a.b", "secret").is_err());
    }
}
