//! Signed login cookies.
//!
//! A cookie binds a username and a rights snapshot to a time window,
//! independent of any one TCP connection. Format:
//!
//! ```text
//! <hex issued>-<hex expires>-<user>-<hex hmac>
//! ```
//!
//! The MAC is HMAC-SHA256 over `issued\nexpires\nuser\nrights` with a
//! rotating server-side key. The previous key is retained across rotation
//! so freshly rotated servers keep accepting recently issued cookies.

use std::collections::VecDeque;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// How many signing keys verification accepts: the current one and its
/// predecessor.
const KEYS_RETAINED: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("malformed cookie")]
    Malformed,
    #[error("cookie has expired")]
    Expired,
    #[error("cookie signature mismatch")]
    BadSignature,
    #[error("cookie was revoked")]
    Revoked,
}

/// Extract the username a cookie claims to be for, without verifying
/// anything. Callers still have to [`CookieFactory::verify`].
pub fn parse_user(cookie: &str) -> Option<String> {
    let mut parts = cookie.splitn(3, '-');
    let _issued = parts.next()?;
    let _expires = parts.next()?;
    let (user, _mac) = parts.next()?.rsplit_once('-')?;
    (!user.is_empty()).then(|| user.to_string())
}

struct SigningKey {
    created: u64,
    secret: [u8; 32],
}

impl SigningKey {
    fn fresh(created: u64) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        SigningKey { created, secret }
    }

    fn mac(&self, issued: u64, expires: u64, user: &str, rights: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(format!("{:x}\n{:x}\n{}\n{}", issued, expires, user, rights).as_bytes());
        mac
    }
}

/// Issues and verifies cookies. All methods take `now` explicitly so the
/// rotation schedule is testable.
pub struct CookieFactory {
    keys: VecDeque<SigningKey>,
    key_lifetime: u64,
    login_lifetime: u64,
}

impl CookieFactory {
    pub fn new(key_lifetime: Duration, login_lifetime: Duration, now: u64) -> Self {
        let mut keys = VecDeque::with_capacity(KEYS_RETAINED);
        keys.push_front(SigningKey::fresh(now));
        CookieFactory {
            keys,
            key_lifetime: key_lifetime.as_secs(),
            login_lifetime: login_lifetime.as_secs(),
        }
    }

    fn rotate(&mut self, now: u64) {
        let current = self.keys.front().expect("at least one key");
        if now >= current.created.saturating_add(self.key_lifetime) {
            debug!("rotating cookie signing key");
            self.keys.push_front(SigningKey::fresh(now));
            self.keys.truncate(KEYS_RETAINED);
        }
    }

    /// Issue a cookie for `user` with the given rights snapshot.
    pub fn make(&mut self, now: u64, user: &str, rights: &str) -> String {
        self.rotate(now);
        let expires = now + self.login_lifetime;
        let mac = self
            .keys
            .front()
            .expect("at least one key")
            .mac(now, expires, user, rights)
            .finalize();
        format!(
            "{:x}-{:x}-{}-{}",
            now,
            expires,
            user,
            hex::encode(mac.into_bytes())
        )
    }

    /// Verify a cookie and return the username it is bound to.
    ///
    /// `rights` must be the user's *current* rights string: the MAC covers
    /// the snapshot at issue time, so a rights change invalidates old
    /// cookies. `revoked_at` is the user's revocation stamp; cookies issued
    /// before it are dead.
    pub fn verify(
        &mut self,
        now: u64,
        cookie: &str,
        rights: &str,
        revoked_at: Option<u64>,
    ) -> Result<String, CookieError> {
        self.rotate(now);
        let mut parts = cookie.splitn(3, '-');
        let issued = parts
            .next()
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .ok_or(CookieError::Malformed)?;
        let expires = parts
            .next()
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .ok_or(CookieError::Malformed)?;
        let rest = parts.next().ok_or(CookieError::Malformed)?;
        let (user, mac_hex) = rest.rsplit_once('-').ok_or(CookieError::Malformed)?;
        if user.is_empty() {
            return Err(CookieError::Malformed);
        }
        let mac_bytes = hex::decode(mac_hex).map_err(|_| CookieError::Malformed)?;

        if now >= expires {
            return Err(CookieError::Expired);
        }
        // Inclusive: stamps have second resolution, and a cookie issued in
        // the same second as the revocation must not survive it.
        if revoked_at.is_some_and(|stamp| issued <= stamp) {
            return Err(CookieError::Revoked);
        }
        let verified = self.keys.iter().any(|key| {
            key.mac(issued, expires, user, rights)
                .verify_slice(&mac_bytes)
                .is_ok()
        });
        if !verified {
            return Err(CookieError::BadSignature);
        }
        Ok(user.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn factory() -> CookieFactory {
        CookieFactory::new(Duration::from_secs(1000), Duration::from_secs(100), 0)
    }

    #[test]
    fn test_round_trip() {
        let mut f = factory();
        let cookie = f.make(10, "alice", "read,play");
        assert_eq!(f.verify(20, &cookie, "read,play", None), Ok("alice".to_string()));
    }

    #[test]
    fn test_expiry() {
        let mut f = factory();
        let cookie = f.make(10, "alice", "read");
        assert_eq!(f.verify(110, &cookie, "read", None), Err(CookieError::Expired));
    }

    #[test]
    fn test_rights_change_invalidates() {
        let mut f = factory();
        let cookie = f.make(10, "alice", "read,play");
        assert_eq!(
            f.verify(20, &cookie, "read,play,admin", None),
            Err(CookieError::BadSignature)
        );
    }

    #[test]
    fn test_revocation_stamp() {
        let mut f = factory();
        let cookie = f.make(10, "alice", "read");
        assert_eq!(f.verify(20, &cookie, "read", Some(15)), Err(CookieError::Revoked));
        // A cookie issued after the stamp is fine.
        let fresh = f.make(30, "alice", "read");
        assert!(f.verify(40, &fresh, "read", Some(15)).is_ok());
    }

    #[test]
    fn test_previous_key_accepted_after_one_rotation() {
        let mut f = CookieFactory::new(Duration::from_secs(50), Duration::from_secs(1000), 0);
        let cookie = f.make(10, "alice", "read");
        // Force one rotation; the old key is retained.
        assert!(f.verify(60, &cookie, "read", None).is_ok());
        // A second rotation drops the issuing key.
        assert_eq!(
            f.verify(160, &cookie, "read", None),
            Err(CookieError::BadSignature)
        );
    }

    #[test]
    fn test_username_with_dash_survives() {
        let mut f = factory();
        let cookie = f.make(10, "mary-jane", "read");
        assert_eq!(f.verify(20, &cookie, "read", None), Ok("mary-jane".to_string()));
    }

    #[test]
    fn test_parse_user() {
        let mut f = factory();
        let cookie = f.make(10, "mary-jane", "read");
        assert_eq!(parse_user(&cookie).as_deref(), Some("mary-jane"));
        assert_eq!(parse_user("nonsense"), None);
    }

    #[test]
    fn test_tampering_detected() {
        let mut f = factory();
        let cookie = f.make(10, "alice", "read");
        let tampered = cookie.replacen("alice", "admin", 1);
        assert!(f.verify(20, &tampered, "read", None).is_err());
        assert_eq!(f.verify(20, "gibberish", "read", None), Err(CookieError::Malformed));
    }
}
