use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex-encoded HMAC-SHA256 of a raw message.
///
/// Payment providers sign either a joined field string (e.g.
/// `"{order_id}|{payment_id}"`) or the raw request body with this scheme.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    mac.update(message.as_bytes());
    let result = mac.finalize();

    Ok(hex::encode(result.into_bytes()))
}

/// Verify a hex-encoded HMAC-SHA256 signature using constant-time comparison.
pub fn verify_hmac_sha256(
    secret: &str,
    message: &str,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected = hmac_sha256_hex(secret, message)?;
    Ok(secrets_match(&expected, signature))
}

/// Compare two secret strings in constant time.
///
/// Used both for HMAC digests and for pre-shared webhook secrets supplied
/// verbatim in a header. The length check short-circuits, which leaks only
/// the length, not the content.
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let provided_bytes = provided.as_bytes();

    if expected_bytes.len() != provided_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(provided_bytes).into()
}
