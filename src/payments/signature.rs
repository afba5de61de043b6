//! Signature engine for both gateway protocols.
//!
//! Checksum protocol: `SHA256(base64_payload + route_path + secret_key)` as
//! lowercase hex, suffixed with `###<key_index>`.
//!
//! Hosted-checkout protocol: `HMAC-SHA256(webhook_secret, raw_body)` as
//! lowercase hex.
//!
//! Signatures are compared as their hex text in constant time, so a supplied
//! signature differing in any byte (including letter case) is rejected.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Separator between the digest and the key index in checksum signatures.
pub const CHECKSUM_SEPARATOR: &str = "###";

/// Base64-encode a JSON payload the way the checksum protocol expects.
#[must_use]
pub fn encode_checksum_payload(payload: &[u8]) -> String {
    BASE64.encode(payload)
}

/// Hex digest over an already-encoded payload and the route it is sent to.
#[must_use]
pub fn checksum_digest(encoded_payload: &str, route_path: &str, secret_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(encoded_payload.as_bytes());
    hasher.update(route_path.as_bytes());
    hasher.update(secret_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Full `X-VERIFY` value for an encoded payload.
#[must_use]
pub fn sign_checksum_encoded(
    encoded_payload: &str,
    route_path: &str,
    secret_key: &str,
    key_index: &str,
) -> String {
    format!(
        "{}{}{}",
        checksum_digest(encoded_payload, route_path, secret_key),
        CHECKSUM_SEPARATOR,
        key_index
    )
}

/// Encode `payload` and sign it for `route_path`.
///
/// Returns `(encoded_payload, x_verify)`.
#[must_use]
pub fn sign_checksum_protocol(
    payload: &[u8],
    route_path: &str,
    secret_key: &str,
    key_index: &str,
) -> (String, String) {
    let encoded = encode_checksum_payload(payload);
    let signature = sign_checksum_encoded(&encoded, route_path, secret_key, key_index);
    (encoded, signature)
}

/// Signature for body-less requests (status checks): the route alone is signed.
#[must_use]
pub fn sign_checksum_route(route_path: &str, secret_key: &str, key_index: &str) -> String {
    sign_checksum_encoded("", route_path, secret_key, key_index)
}

/// Verify a checksum-protocol signature against the encoded payload exactly as received.
#[must_use]
pub fn verify_checksum_protocol(
    encoded_payload: &str,
    route_path: &str,
    secret_key: &str,
    key_index: &str,
    supplied: &str,
) -> bool {
    let Some((supplied_digest, supplied_index)) = supplied.split_once(CHECKSUM_SEPARATOR) else {
        tracing::debug!("Checksum signature missing key index separator");
        return false;
    };

    let expected = checksum_digest(encoded_payload, route_path, secret_key);
    let digest_ok = constant_time_compare(expected.as_bytes(), supplied_digest.as_bytes());
    let index_ok = constant_time_compare(key_index.as_bytes(), supplied_index.as_bytes());

    digest_ok & index_ok
}

/// Hex HMAC-SHA256 of `raw_body` under `secret`.
#[must_use]
pub fn sign_hosted_checkout(raw_body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any size"),
    };
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hosted-checkout webhook signature over the raw, unparsed body.
#[must_use]
pub fn verify_hosted_checkout(raw_body: &[u8], secret: &str, supplied: &str) -> bool {
    let expected = sign_hosted_checkout(raw_body, secret);
    constant_time_compare(expected.as_bytes(), supplied.as_bytes())
}

/// Constant-time byte comparison; lengths are not secret.
#[must_use]
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &str = "099eb0cd-02cf-4e2a-8aca-3e6c6aff0399";
    const PAY_PATH: &str = "/pg/v1/pay";

    #[test]
    fn checksum_signature_shape() {
        let (encoded, sig) = sign_checksum_protocol(br#"{"amount":100}"#, PAY_PATH, SALT, "1");
        assert_eq!(encoded, BASE64.encode(br#"{"amount":100}"#));

        let (digest, index) = sig.split_once("###").unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(index, "1");

        let mut hasher = Sha256::new();
        hasher.update(format!("{}{}{}", encoded, PAY_PATH, SALT));
        assert_eq!(digest, hex::encode(hasher.finalize()));
    }

    #[test]
    fn checksum_route_signature_signs_path_only() {
        let path = "/pg/v1/status/MERCHANTUAT/MT1";
        let sig = sign_checksum_route(path, SALT, "1");
        let mut hasher = Sha256::new();
        hasher.update(format!("{}{}", path, SALT));
        assert_eq!(sig, format!("{}###1", hex::encode(hasher.finalize())));
    }

    #[test]
    fn checksum_roundtrip_verifies() {
        let (encoded, sig) = sign_checksum_protocol(b"{}", PAY_PATH, SALT, "1");
        assert!(verify_checksum_protocol(&encoded, PAY_PATH, SALT, "1", &sig));
        assert!(!verify_checksum_protocol(&encoded, "/other", SALT, "1", &sig));
        assert!(!verify_checksum_protocol(&encoded, PAY_PATH, "other-salt", "1", &sig));
        assert!(!verify_checksum_protocol(&encoded, PAY_PATH, SALT, "2", &sig));
    }

    #[test]
    fn checksum_rejects_any_single_byte_mutation() {
        let (encoded, sig) = sign_checksum_protocol(br#"{"code":"PAYMENT_SUCCESS"}"#, PAY_PATH, SALT, "1");

        for i in 0..encoded.len() {
            let mut bytes = encoded.clone().into_bytes();
            bytes[i] ^= 0x01;
            let mutated = String::from_utf8_lossy(&bytes).into_owned();
            assert!(
                !verify_checksum_protocol(&mutated, PAY_PATH, SALT, "1", &sig),
                "payload mutation at {} verified",
                i
            );
        }

        for i in 0..sig.len() {
            let mut bytes = sig.clone().into_bytes();
            bytes[i] ^= 0x01;
            let mutated = String::from_utf8_lossy(&bytes).into_owned();
            assert!(
                !verify_checksum_protocol(&encoded, PAY_PATH, SALT, "1", &mutated),
                "signature mutation at {} verified",
                i
            );
        }
    }

    #[test]
    fn checksum_rejects_missing_separator_and_uppercase() {
        let (encoded, sig) = sign_checksum_protocol(b"{}", PAY_PATH, SALT, "1");
        let digest = sig.split_once("###").unwrap().0;
        assert!(!verify_checksum_protocol(&encoded, PAY_PATH, SALT, "1", digest));
        assert!(!verify_checksum_protocol(&encoded, PAY_PATH, SALT, "1", &sig.to_uppercase()));
        assert!(!verify_checksum_protocol(&encoded, PAY_PATH, SALT, "1", ""));
    }

    #[test]
    fn hosted_signature_is_hmac_hex() {
        let body = br#"{"event":"payment.captured"}"#;
        let sig = sign_hosted_checkout(body, "whsec");

        let mut mac = HmacSha256::new_from_slice(b"whsec").unwrap();
        mac.update(body);
        assert_eq!(sig, hex::encode(mac.finalize().into_bytes()));
        assert!(verify_hosted_checkout(body, "whsec", &sig));
        assert!(!verify_hosted_checkout(body, "other", &sig));
    }

    #[test]
    fn hosted_rejects_any_single_byte_mutation() {
        let body = br#"{"event":"payment_link.paid","payload":{}}"#.to_vec();
        let sig = sign_hosted_checkout(&body, "whsec");

        for i in 0..body.len() {
            let mut mutated = body.clone();
            mutated[i] ^= 0x01;
            assert!(!verify_hosted_checkout(&mutated, "whsec", &sig), "body mutation at {} verified", i);
        }

        for i in 0..sig.len() {
            let mut bytes = sig.clone().into_bytes();
            bytes[i] ^= 0x01;
            let mutated = String::from_utf8_lossy(&bytes).into_owned();
            assert!(!verify_hosted_checkout(&body, "whsec", &mutated), "signature mutation at {} verified", i);
        }
    }

    #[test]
    fn constant_time_compare_lengths() {
        assert!(constant_time_compare(b"abc", b"abc"));
        assert!(!constant_time_compare(b"abc", b"abd"));
        assert!(!constant_time_compare(b"abc", b"ab"));
        assert!(constant_time_compare(b"", b""));
    }
}
