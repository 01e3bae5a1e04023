//! Signed invitation tokens for interview sessions.
//!
//! The relay mints a token when a session is created and verifies it when the
//! candidate joins. Tokens are `<claims>.<mac>` where both halves are
//! URL-safe base64 without padding: the claims are a small JSON document and
//! the MAC is HMAC-SHA256 over the raw claim bytes. The relay is both issuer
//! and verifier, so a symmetric secret is sufficient. Revocation is handled
//! server-side against session storage, not inside the token.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use thiserror::Error;

type HmacSha256 = Hmac<sha2::Sha256>;

/// Claims carried by an invitation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteClaims {
    pub session_id: String,
    pub candidate_id: String,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
}

impl InviteClaims {
    pub fn new(
        session_id: impl Into<String>,
        candidate_id: impl Into<String>,
        issued_at_ms: i64,
        ttl_ms: i64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            candidate_id: candidate_id.into(),
            issued_at_ms,
            expires_at_ms: issued_at_ms + ttl_ms,
        }
    }
}

#[derive(Debug, Error)]
pub enum InviteTokenError {
    #[error("malformed invite token: {0}")]
    Malformed(String),
    #[error("invite token signature mismatch")]
    BadSignature,
    #[error("invite token expired at {expired_at_ms}")]
    Expired { expired_at_ms: i64 },
}

/// Serialize, sign, and encode a set of claims.
pub fn issue(claims: &InviteClaims, secret: &[u8]) -> Result<String, InviteTokenError> {
    let body = serde_json::to_vec(claims)
        .map_err(|err| InviteTokenError::Malformed(err.to_string()))?;
    let mac = sign(secret, &body);
    Ok(format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&body),
        URL_SAFE_NO_PAD.encode(mac)
    ))
}

/// Decode a token and check its signature and expiry.
///
/// The MAC is checked before the claims are parsed, so a tampered token is
/// reported as `BadSignature` rather than leaking parse detail. An expired
/// token with a valid signature always reports `Expired`, whatever else the
/// claims contain.
pub fn verify(token: &str, secret: &[u8], now_ms: i64) -> Result<InviteClaims, InviteTokenError> {
    let (body, mac) = decode_parts(token)?;

    let mut verifier =
        HmacSha256::new_from_slice(secret).map_err(|_| InviteTokenError::BadSignature)?;
    verifier.update(&body);
    verifier
        .verify_slice(&mac)
        .map_err(|_| InviteTokenError::BadSignature)?;

    let claims: InviteClaims = serde_json::from_slice(&body)
        .map_err(|err| InviteTokenError::Malformed(err.to_string()))?;

    if now_ms >= claims.expires_at_ms {
        return Err(InviteTokenError::Expired {
            expired_at_ms: claims.expires_at_ms,
        });
    }

    Ok(claims)
}

/// Decode the claims without checking the signature.
///
/// This gives the client fast local feedback (session id, expiry) before the
/// relay's authoritative check; it must never be used to grant access.
pub fn peek(token: &str, now_ms: i64) -> Result<InviteClaims, InviteTokenError> {
    let (body, _) = decode_parts(token)?;
    let claims: InviteClaims = serde_json::from_slice(&body)
        .map_err(|err| InviteTokenError::Malformed(err.to_string()))?;
    if now_ms >= claims.expires_at_ms {
        return Err(InviteTokenError::Expired {
            expired_at_ms: claims.expires_at_ms,
        });
    }
    Ok(claims)
}

fn decode_parts(token: &str) -> Result<(Vec<u8>, Vec<u8>), InviteTokenError> {
    let (body_b64, mac_b64) = token
        .split_once('.')
        .ok_or_else(|| InviteTokenError::Malformed("missing signature separator".into()))?;
    let body = URL_SAFE_NO_PAD
        .decode(body_b64)
        .map_err(|err| InviteTokenError::Malformed(format!("claims: {err}")))?;
    let mac = URL_SAFE_NO_PAD
        .decode(mac_b64)
        .map_err(|err| InviteTokenError::Malformed(format!("signature: {err}")))?;
    Ok((body, mac))
}

fn sign(secret: &[u8], body: &[u8]) -> Vec<u8> {
    // HmacSha256 accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"greenroom-test-secret";

    fn claims_at(issued_at_ms: i64, ttl_ms: i64) -> InviteClaims {
        InviteClaims::new("sess-1", "cand-42", issued_at_ms, ttl_ms)
    }

    #[test]
    fn issue_then_verify_round_trips_identity() {
        let claims = claims_at(1_000, 60_000);
        let token = issue(&claims, SECRET).unwrap();
        let verified = verify(&token, SECRET, 2_000).unwrap();
        assert_eq!(verified.session_id, "sess-1");
        assert_eq!(verified.candidate_id, "cand-42");
        assert_eq!(verified, claims);
    }

    #[test]
    fn expired_token_reports_expiry_reason() {
        let claims = claims_at(1_000, 500);
        let token = issue(&claims, SECRET).unwrap();
        let err = verify(&token, SECRET, 10_000).unwrap_err();
        assert!(matches!(
            err,
            InviteTokenError::Expired {
                expired_at_ms: 1_500
            }
        ));
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let claims = claims_at(0, 1_000);
        let token = issue(&claims, SECRET).unwrap();
        assert!(verify(&token, SECRET, 999).is_ok());
        assert!(matches!(
            verify(&token, SECRET, 1_000),
            Err(InviteTokenError::Expired { .. })
        ));
    }

    #[test]
    fn tampered_claims_fail_signature_before_expiry() {
        let claims = claims_at(1_000, 500);
        let token = issue(&claims, SECRET).unwrap();
        let (_, mac) = token.split_once('.').unwrap();
        let forged_body = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims_at(1_000, i64::MAX / 2)).unwrap(),
        );
        let forged = format!("{forged_body}.{mac}");
        assert!(matches!(
            verify(&forged, SECRET, 10_000),
            Err(InviteTokenError::BadSignature)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue(&claims_at(1_000, 60_000), SECRET).unwrap();
        assert!(matches!(
            verify(&token, b"other-secret", 2_000),
            Err(InviteTokenError::BadSignature)
        ));
    }

    #[test]
    fn garbage_is_malformed_not_a_panic() {
        for junk in ["", "no-separator", "a.b", "!!!.###"] {
            match verify(junk, SECRET, 0) {
                Err(InviteTokenError::Malformed(_)) | Err(InviteTokenError::BadSignature) => {}
                other => panic!("unexpected result for {junk:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn peek_reads_claims_without_secret() {
        let claims = claims_at(1_000, 60_000);
        let token = issue(&claims, SECRET).unwrap();
        let peeked = peek(&token, 2_000).unwrap();
        assert_eq!(peeked.session_id, claims.session_id);
        assert!(matches!(
            peek(&token, claims.expires_at_ms),
            Err(InviteTokenError::Expired { .. })
        ));
    }
}
