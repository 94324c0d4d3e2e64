//! State cookies (RFC 4960 5.1.3).
//!
//! The responder commits no state when it answers an INIT. Everything it
//! needs to build the association later is packed into the cookie it sends
//! in INIT-ACK and authenticated with a keyed BLAKE2s MAC; a COOKIE-ECHO is
//! trusted only if the MAC verifies and the cookie is younger than its
//! lifetime.
//!
//! ```text
//! peer tag (4) | my tag (4) | peer initial TSN (4) | my initial TSN (4)
//! peer a_rwnd (4) | peer outbound (2) | peer inbound (2) | flags (1)
//! created, ms since epoch (8) | MAC (32)
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use blake2::digest::{KeyInit, Mac};
use blake2::Blake2sMac256;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::COOKIE_LIFETIME;

const COOKIE_BODY_SIZE: usize = 33;
const MAC_SIZE: usize = 32;
const SECRET_SIZE: usize = 32;

const FLAG_FORWARD_TSN: u8 = 0x01;

/// Why a COOKIE-ECHO was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CookieError {
    /// Wrong length.
    #[error("malformed state cookie")]
    Malformed,
    /// MAC mismatch: not a cookie this endpoint issued.
    #[error("state cookie authentication failed")]
    BadMac,
    /// Older than the cookie lifetime.
    #[error("stale state cookie ({staleness_us} us past lifetime)")]
    Stale {
        /// How far past its lifetime the cookie is.
        staleness_us: u32,
        /// Verification tag of the peer that echoed it.
        peer_tag: u32,
    },
}

/// Association parameters carried by a state cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCookie {
    /// Peer's verification tag (its INIT initiate tag).
    pub peer_tag: u32,
    /// Our verification tag as sent in INIT-ACK.
    pub my_tag: u32,
    /// Peer's first TSN.
    pub peer_initial_tsn: u32,
    /// Our first TSN as sent in INIT-ACK.
    pub my_initial_tsn: u32,
    /// Peer's advertised receiver window.
    pub peer_a_rwnd: u32,
    /// Peer's outbound stream count.
    pub peer_num_outbound_streams: u16,
    /// Peer's inbound stream count.
    pub peer_num_inbound_streams: u16,
    /// Both sides support FORWARD-TSN.
    pub use_forward_tsn: bool,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_ms: u64,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct CookieSecret([u8; SECRET_SIZE]);

/// Issues and verifies state cookies with a per-association secret.
pub struct CookieSigner {
    secret: CookieSecret,
}

impl std::fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSigner").finish_non_exhaustive()
    }
}

impl Default for CookieSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieSigner {
    /// Create a signer with a fresh random secret.
    pub fn new() -> Self {
        let mut secret = [0u8; SECRET_SIZE];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            secret: CookieSecret(secret),
        }
    }

    fn mac(&self) -> Blake2sMac256 {
        <Blake2sMac256 as KeyInit>::new((&self.secret.0).into())
    }

    /// Serialize and authenticate `cookie`.
    pub fn sign(&self, cookie: &StateCookie) -> Bytes {
        let mut buf = BytesMut::with_capacity(COOKIE_BODY_SIZE + MAC_SIZE);
        buf.put_u32(cookie.peer_tag);
        buf.put_u32(cookie.my_tag);
        buf.put_u32(cookie.peer_initial_tsn);
        buf.put_u32(cookie.my_initial_tsn);
        buf.put_u32(cookie.peer_a_rwnd);
        buf.put_u16(cookie.peer_num_outbound_streams);
        buf.put_u16(cookie.peer_num_inbound_streams);
        buf.put_u8(if cookie.use_forward_tsn { FLAG_FORWARD_TSN } else { 0 });
        buf.put_u64(cookie.created_ms);

        let mut mac = self.mac();
        mac.update(&buf);
        buf.put_slice(&mac.finalize().into_bytes());
        buf.freeze()
    }

    /// Authenticate and decode a cookie echoed back by the peer.
    pub fn verify(&self, raw: &[u8]) -> Result<StateCookie, CookieError> {
        if raw.len() != COOKIE_BODY_SIZE + MAC_SIZE {
            return Err(CookieError::Malformed);
        }
        let (body, tag) = raw.split_at(COOKIE_BODY_SIZE);

        let mut mac = self.mac();
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| CookieError::BadMac)?;

        let mut reader = body;
        let cookie = StateCookie {
            peer_tag: reader.get_u32(),
            my_tag: reader.get_u32(),
            peer_initial_tsn: reader.get_u32(),
            my_initial_tsn: reader.get_u32(),
            peer_a_rwnd: reader.get_u32(),
            peer_num_outbound_streams: reader.get_u16(),
            peer_num_inbound_streams: reader.get_u16(),
            use_forward_tsn: reader.get_u8() & FLAG_FORWARD_TSN != 0,
            created_ms: reader.get_u64(),
        };

        let age_ms = now_ms().saturating_sub(cookie.created_ms);
        let lifetime_ms = COOKIE_LIFETIME.as_millis() as u64;
        if age_ms > lifetime_ms {
            let staleness_us = (age_ms - lifetime_ms).saturating_mul(1000);
            return Err(CookieError::Stale {
                staleness_us: u32::try_from(staleness_us).unwrap_or(u32::MAX),
                peer_tag: cookie.peer_tag,
            });
        }
        Ok(cookie)
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
