//! # SASL DIGEST-MD5
//!
//! This crate implements the DIGEST-MD5 mechanism according to RFC 2831: a challenge-response
//! authentication that proves knowledge of a shared secret without sending it, authenticates the
//! server back to the client and can install an integrity or confidentiality layer for the
//! traffic that follows.
//!
//! # Usage
//!
//! Both ends implement the [`Exchange`](trait.Exchange.html) trait. Feed every message received
//! from the peer into [`step`](trait.Exchange.html#tymethod.step) and send back what it returns.
//! The server speaks first; the exchange is finished once `step` returns
//! [`Step::Done`](enum.Step.html#variant.Done). Any error aborts the authentication attempt.
//!
//! The server looks secrets up through a [`SecretProvider`](trait.SecretProvider.html). Both
//! sides bound the negotiated protection with a [`SecurityPolicy`](struct.SecurityPolicy.html).
//!
//! ```rust
//! use digest_md5::{DigestClient, DigestServer, Exchange, Secret, SecretProvider, SecurityPolicy,
//!                  Step};
//!
//! struct Users;
//!
//! impl SecretProvider for Users {
//!     fn lookup(&self, username: &str, _realm: &str) -> Option<Secret> {
//!         if username == "chris" {
//!             Some(Secret::password("secret"))
//!         } else {
//!             None
//!         }
//!     }
//! }
//!
//! let policy = SecurityPolicy::new("imap", "elwood.innosoft.com");
//! let server = DigestServer::new(Users, policy.clone());
//! let mut exchange = server.exchange();
//! let mut client = DigestClient::new("chris", "secret", None, policy);
//!
//! let challenge = match exchange.step(b"")? {
//!     Step::Continue(Some(challenge)) => challenge,
//!     _ => unreachable!(),
//! };
//! let response = match client.step(challenge.as_bytes())? {
//!     Step::Continue(Some(response)) => response,
//!     _ => unreachable!(),
//! };
//! let outcome = match exchange.step(response.as_bytes())? {
//!     Step::Done(Some(outcome)) => outcome,
//!     _ => unreachable!(),
//! };
//! // Fails unless the server proved that it knows the password as well.
//! assert_eq!(client.step(outcome.as_bytes())?, Step::Done(None));
//!
//! // The default policy negotiates the strongest confidentiality layer.
//! let mut client_layer = client.take_security_layer().unwrap();
//! let mut server_layer = exchange.take_security_layer().unwrap();
//! let frame = client_layer.encode(b"a001 LIST \"\" *")?;
//! assert_eq!(server_layer.decode(&frame)?, vec![b"a001 LIST \"\" *".to_vec()]);
//! # Ok::<(), digest_md5::Error>(())
//! ```

pub mod attrs;
mod cipher;
mod client;
mod error;
mod layer;
mod policy;
mod server;
mod utils;

pub use crate::cipher::{Cipher, CipherSpec, CIPHERS, MAC_LEN};
pub use crate::client::{DigestClient, ReauthCache, SessionContext};
pub use crate::error::{Error, Field, Framing, Kind, PolicyViolation, ResultCode};
pub use crate::layer::{Role, SecurityLayer};
pub use crate::policy::{Protection, Qop, SecurityPolicy, INTEGRITY_SSF};
pub use crate::server::{DigestServer, NonceTable, Secret, SecretProvider, ServerConfig,
                        ServerExchange};
pub use crate::utils::{compute_ha1, compute_ha1_from_secret, compute_response, compute_rspauth,
                       hash_secret, is_latin1, Ha1, Method, ResponseParams, DEFAULT_METHOD,
                       MD5_LEN};

/// The registered SASL mechanism name.
pub const MECHANISM_NAME: &str = "DIGEST-MD5";

/// The default size of the receive buffer advertised with `maxbuf`.
pub const DEFAULT_MAXBUF: u32 = 65536;

/// The upper limit for challenges and responses in bytes.
pub(crate) const MAX_MESSAGE_LEN: usize = 2048;

/// The number of random bytes in a nonce.
pub(crate) const NONCE_LENGTH: usize = 32;

/// The outcome of one step of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The exchange goes on. The message, if any, must be sent to the peer.
    Continue(Option<String>),
    /// Authentication succeeded. The message, if any, must be sent to the peer.
    Done(Option<String>),
}

/// The common interface of the client and server state machines.
pub trait Exchange {
    /// Processes one message from the peer. An empty `input` starts an exchange.
    ///
    /// Every error is terminal: the exchange rejects further input with `Error::InvalidState`.
    fn step(&mut self, input: &[u8]) -> Result<Step, Error>;

    /// The outcome of a successful exchange.
    fn negotiated(&self) -> Option<&Negotiated>;

    /// Hands out the security layer installed by a successful exchange, if one was negotiated.
    fn take_security_layer(&mut self) -> Option<SecurityLayer>;
}

/// What a successful exchange agreed on.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    /// The authenticated identity.
    pub authcid: String,
    /// The identity to act as, when it differs from `authcid`.
    pub authzid: Option<String>,
    /// The realm the identity was authenticated in.
    pub realm: String,
    /// The protection applied to the following traffic.
    pub protection: Protection,
    /// The largest payload the peer accepts in one frame.
    pub max_outbuf: u32,
}

impl Negotiated {
    /// The security strength factor of the negotiated layer.
    pub fn ssf(&self) -> u32 {
        self.protection.ssf()
    }
}
