//! Access-token minting.
//!
//! Mints the envd-scoped bearer token a caller uses to talk to a sandbox's
//! own agent daemon directly. Deterministic HMAC-SHA256 over the sandbox id
//! so the same sandbox always mints the same token for a given signing key
//! (no token storage needed), gated on the sandbox's build carrying at
//! least the configured minimum envd version. Uses `sha2`-backed HMAC
//! signing, the same hashing crate used elsewhere in this codebase.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

/// Mints an envd access token for a sandbox. Returns `PreconditionFailed`
/// when the sandbox's envd build predates what the platform requires to
/// trust the token scheme.
pub fn mint_access_token(signing_key: &[u8], sandbox_id: &str, envd_version: Option<&str>, min_envd_version: &str) -> ApiResult<String> {
    let version = envd_version.ok_or_else(|| ApiError::precondition_failed("sandbox has no envd version recorded"))?;
    if !version_at_least(version, min_envd_version) {
        return Err(ApiError::precondition_failed(format!(
            "envd {version} is older than the minimum supported {min_envd_version}"
        )));
    }

    let mut mac = HmacSha256::new_from_slice(signing_key).map_err(|e| ApiError::internal(format!("invalid signing key: {e}")))?;
    mac.update(sandbox_id.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(format!("sbxat_{}", hex_encode(&digest)))
}

/// Verifies a previously minted token without needing a lookup table.
pub fn verify_access_token(signing_key: &[u8], sandbox_id: &str, token: &str) -> bool {
    let Some(expected) = token.strip_prefix("sbxat_") else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(signing_key) else {
        return false;
    };
    mac.update(sandbox_id.as_bytes());
    let digest = mac.finalize().into_bytes();
    hex_encode(&digest) == expected
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Lenient `major.minor.patch` comparison; missing segments read as 0,
/// unparseable versions never satisfy the floor.
pub(crate) fn version_at_least(have: &str, want: &str) -> bool {
    fn parse(s: &str) -> Option<(u32, u32, u32)> {
        let mut parts = s.split('.');
        Some((
            parts.next()?.parse().ok()?,
            parts.next().unwrap_or("0").parse().ok()?,
            parts.next().unwrap_or("0").parse().ok()?,
        ))
    }
    match (parse(have), parse(want)) {
        (Some(h), Some(w)) => h >= w,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-signing-key";

    #[test]
    fn mint_is_deterministic_for_the_same_sandbox() {
        let a = mint_access_token(KEY, "sbx_1", Some("0.2.0"), "0.1.0").unwrap();
        let b = mint_access_token(KEY, "sbx_1", Some("0.2.0"), "0.1.0").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn mint_differs_across_sandboxes() {
        let a = mint_access_token(KEY, "sbx_1", Some("0.2.0"), "0.1.0").unwrap();
        let b = mint_access_token(KEY, "sbx_2", Some("0.2.0"), "0.1.0").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn mint_rejects_envd_older_than_floor() {
        let err = mint_access_token(KEY, "sbx_1", Some("0.0.5"), "0.1.0").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::PreconditionFailed);
    }

    #[test]
    fn mint_rejects_missing_envd_version() {
        let err = mint_access_token(KEY, "sbx_1", None, "0.1.0").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::PreconditionFailed);
    }

    #[test]
    fn verify_accepts_a_token_it_minted_and_rejects_tampering() {
        let token = mint_access_token(KEY, "sbx_1", Some("0.2.0"), "0.1.0").unwrap();
        assert!(verify_access_token(KEY, "sbx_1", &token));
        assert!(!verify_access_token(KEY, "sbx_2", &token));
        assert!(!verify_access_token(KEY, "sbx_1", "sbxat_deadbeef"));
    }
}
