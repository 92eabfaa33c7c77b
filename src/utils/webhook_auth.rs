use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify a channel-provider webhook signature: HMAC-SHA256 over the exact
/// raw request bytes, hex encoded, with an optional `sha256=` prefix.
/// Verification must run on the bytes as received; re-serializing a parsed
/// body changes field order and breaks the digest.
///
/// Fails closed: a missing header, empty secret, malformed digest, or
/// mismatch all reject the request.
pub fn verify_channel_signature(
    raw_body: &[u8],
    signature_header: Option<&str>,
    secret: &str,
) -> bool {
    let Some(signature) = signature_header else {
        return false;
    };
    let digest_hex = signature.trim();
    let digest_hex = digest_hex.strip_prefix("sha256=").unwrap_or(digest_hex);
    if secret.is_empty() || digest_hex.is_empty() {
        return false;
    }
    let Ok(provided) = hex::decode(digest_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&provided).is_ok()
}

/// Verify a merchant-platform webhook: the same raw-body HMAC scheme, but a
/// separate trust domain with its own secret — never conflated with the
/// channel-provider verification above.
pub fn verify_platform_signature(headers: &HeaderMap, raw_body: &[u8], secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(value) = headers.get("x-platform-signature") else {
        return false;
    };
    let Ok(provided) = value.to_str() else {
        return false;
    };
    let provided = provided.trim().to_ascii_lowercase();
    if provided.is_empty() {
        return false;
    }
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let expected = hex::encode(mac.finalize().into_bytes());
    ConstantTimeEq::ct_eq(provided.as_bytes(), expected.as_bytes()).into()
}
