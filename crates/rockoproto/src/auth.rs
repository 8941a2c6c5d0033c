//! Challenge/response authentication.
//!
//! The server sends a fresh random nonce in its greeting; the client proves
//! knowledge of the password by returning `hex(H(nonce || password))` for
//! the algorithm the greeting named.

use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;

/// Hash algorithms the handshake supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown authorization algorithm {0:?}")]
pub struct UnknownAlgorithm(pub String);

impl std::str::FromStr for Algorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        })
    }
}

fn digest<D: Digest>(nonce: &[u8], password: &str) -> String {
    let mut h = D::new();
    h.update(nonce);
    h.update(password.as_bytes());
    hex::encode(h.finalize())
}

/// Compute the lowercase-hex authentication response.
pub fn hash_response(algorithm: Algorithm, nonce: &[u8], password: &str) -> String {
    match algorithm {
        Algorithm::Sha1 => digest::<Sha1>(nonce, password),
        Algorithm::Sha256 => digest::<Sha256>(nonce, password),
        Algorithm::Sha384 => digest::<Sha384>(nonce, password),
        Algorithm::Sha512 => digest::<Sha512>(nonce, password),
    }
}

/// A fresh 16-byte nonce from the thread RNG.
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_response_is_lowercase_hex() {
        let r = hash_response(Algorithm::Sha256, b"nonce", "password");
        assert_eq!(r.len(), 64);
        assert!(r.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_response_lengths_by_algorithm() {
        assert_eq!(hash_response(Algorithm::Sha1, b"n", "p").len(), 40);
        assert_eq!(hash_response(Algorithm::Sha256, b"n", "p").len(), 64);
        assert_eq!(hash_response(Algorithm::Sha384, b"n", "p").len(), 96);
        assert_eq!(hash_response(Algorithm::Sha512, b"n", "p").len(), 128);
    }

    #[test]
    fn test_response_depends_on_nonce_and_password() {
        let base = hash_response(Algorithm::Sha256, b"nonce", "password");
        assert_ne!(base, hash_response(Algorithm::Sha256, b"other", "password"));
        assert_ne!(base, hash_response(Algorithm::Sha256, b"nonce", "different"));
    }

    #[test]
    fn test_known_sha1_vector() {
        // sha1("np") with nonce "n", password "p"
        assert_eq!(
            hash_response(Algorithm::Sha1, b"n", "p"),
            "003fffd5649fc27c0fc0d15a402a4fe5b0444ce7"
        );
    }

    #[test]
    fn test_known_sha256_vector() {
        assert_eq!(
            hash_response(Algorithm::Sha256, b"nonce", "password"),
            "813c7639907afba393568662156439b303eb8bee9bfe884817f30c64a2fb8ac8"
        );
    }

    #[test]
    fn test_algorithm_round_trip() {
        for alg in [Algorithm::Sha1, Algorithm::Sha256, Algorithm::Sha384, Algorithm::Sha512] {
            assert_eq!(alg.to_string().parse::<Algorithm>().unwrap(), alg);
        }
        assert!("md5".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_nonces_are_distinct() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
