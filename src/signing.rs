//! HMAC signing of outbound webhook payloads.
//!
//! The header name comes from group configuration; the value is the
//! lowercase-hex HMAC of the exact payload bytes. The wire bytes of
//! both must match what receivers already verify against, so there is
//! no timestamp or key-id decoration here.

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use crate::config::HashAlgorithm;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Compute the signature for a payload as a lowercase hex string.
pub fn compute_signature(hash: HashAlgorithm, secret: &str, payload: &[u8]) -> String {
    match hash {
        HashAlgorithm::Sha256 => {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any size");
            mac.update(payload);
            hex::encode(mac.finalize().into_bytes())
        }
        HashAlgorithm::Sha512 => {
            let mut mac = <HmacSha512 as Mac>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any size");
            mac.update(payload);
            hex::encode(mac.finalize().into_bytes())
        }
    }
}

/// Verify a received hex signature. Comparison is constant-time.
pub fn verify_signature(
    hash: HashAlgorithm,
    secret: &str,
    payload: &[u8],
    signature_hex: &str,
) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    match hash {
        HashAlgorithm::Sha256 => {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any size");
            mac.update(payload);
            mac.verify_slice(&signature).is_ok()
        }
        HashAlgorithm::Sha512 => {
            let mut mac = <HmacSha512 as Mac>::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts keys of any size");
            mac.update(payload);
            mac.verify_slice(&signature).is_ok()
        }
    }
}
