//! HMAC signatures over request bodies

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Digest used for a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
}

impl Algorithm {
    /// Parse a configured algorithm name; empty means sha256
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "sha256" => Some(Self::Sha256),
            "sha1" => Some(Self::Sha1),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1=",
            Self::Sha256 => "sha256=",
        }
    }
}

/// Text encoding of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Hex,
    Base64,
}

impl Encoding {
    /// Parse a configured encoding name; empty means hex
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "hex" => Some(Self::Hex),
            "base64" => Some(Self::Base64),
            _ => None,
        }
    }
}

/// Raw HMAC of `body` keyed with `secret`
pub fn hmac_digest(algorithm: Algorithm, secret: &[u8], body: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    match algorithm {
        Algorithm::Sha1 => match Hmac::<Sha1>::new_from_slice(secret) {
            Ok(mut mac) => {
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
        Algorithm::Sha256 => match Hmac::<Sha256>::new_from_slice(secret) {
            Ok(mut mac) => {
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
            Err(_) => Vec::new(),
        },
    }
}

/// Encoded signature the sender is expected to present
pub fn sign(algorithm: Algorithm, encoding: Encoding, secret: &[u8], body: &[u8]) -> String {
    let digest = hmac_digest(algorithm, secret, body);
    match encoding {
        Encoding::Hex => hex::encode(digest),
        Encoding::Base64 => base64::engine::general_purpose::STANDARD.encode(digest),
    }
}

/// Check a presented signature, with or without its `<algorithm>=` prefix
pub fn verify(
    algorithm: Algorithm,
    encoding: Encoding,
    secret: &[u8],
    body: &[u8],
    presented: &str,
) -> bool {
    let presented = presented.trim();
    let presented = presented.strip_prefix(algorithm.prefix()).unwrap_or(presented);
    let expected = sign(algorithm, encoding, secret, body);
    let presented = match encoding {
        Encoding::Hex => presented.to_ascii_lowercase(),
        Encoding::Base64 => presented.to_string(),
    };
    constant_time_eq(&expected, &presented)
}

/// Compare two strings without leaking where they differ
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        let _ = a.ct_eq(a);
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_sha256_digest() {
        // RFC 4231 test case 2
        let signature = sign(
            Algorithm::Sha256,
            Encoding::Hex,
            b"Jefe",
            b"what do ya want for nothing?",
        );
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_verify_with_prefix_and_encodings() {
        let body = br#"{"ref":"main"}"#;
        let hex_sig = sign(Algorithm::Sha1, Encoding::Hex, b"s3cret", body);
        assert!(verify(Algorithm::Sha1, Encoding::Hex, b"s3cret", body, &format!("sha1={}", hex_sig)));
        assert!(verify(Algorithm::Sha1, Encoding::Hex, b"s3cret", body, &hex_sig.to_uppercase()));
        assert!(!verify(Algorithm::Sha1, Encoding::Hex, b"other", body, &hex_sig));

        let b64_sig = sign(Algorithm::Sha256, Encoding::Base64, b"s3cret", body);
        assert!(verify(Algorithm::Sha256, Encoding::Base64, b"s3cret", body, &b64_sig));
        assert!(!verify(Algorithm::Sha256, Encoding::Base64, b"s3cret", b"tampered", &b64_sig));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(Algorithm::parse(""), Some(Algorithm::Sha256));
        assert_eq!(Algorithm::parse("SHA1"), Some(Algorithm::Sha1));
        assert_eq!(Algorithm::parse("md5"), None);
        assert_eq!(Encoding::parse("base64"), Some(Encoding::Base64));
        assert_eq!(Encoding::parse("base32"), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
