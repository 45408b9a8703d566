use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::Error;
use crate::policy::Qop;
use crate::{MAX_MESSAGE_LEN, NONCE_LENGTH};

/// Length of an MD5 digest in bytes.
pub const MD5_LEN: usize = 16;

/// The verb hashed into A2 when the caller doesn't supply one.
pub const DEFAULT_METHOD: &str = "AUTHENTICATE";

/// Entity hash appended to A2 when a security layer is requested.
const ZERO_ENTITY_HASH: &str = "00000000000000000000000000000000";

type HmacMd5 = Hmac<Md5>;

/// MD5 over the concatenation of `parts`.
pub(crate) fn hash(parts: &[&[u8]]) -> [u8; MD5_LEN] {
    let mut ctx = Md5::new();
    for part in parts {
        ctx.update(part);
    }
    let mut output = [0u8; MD5_LEN];
    output.copy_from_slice(&ctx.finalize());
    output
}

/// HMAC-MD5 over the concatenation of `parts`.
pub(crate) fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; MD5_LEN] {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    let mut output = [0u8; MD5_LEN];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// Generates a printable nonce from `NONCE_LENGTH` random bytes.
pub(crate) fn generate_nonce<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut raw = Zeroizing::new([0u8; NONCE_LENGTH]);
    rng.fill_bytes(&mut raw[..]);
    base64::encode(&raw[..])
}

/// Checks the size limit and the encoding of an incoming mechanism message.
pub(crate) fn message_text(input: &[u8]) -> Result<&str, Error> {
    if input.len() > MAX_MESSAGE_LEN {
        return Err(Error::MessageTooLarge(input.len()));
    }
    std::str::from_utf8(input).map_err(|e| Error::Parse(e.valid_up_to()))
}

/// Whether every code point of `text` fits into ISO-8859-1.
pub fn is_latin1(text: &str) -> bool {
    text.chars().all(|chr| u32::from(chr) <= 0xff)
}

/// Returns the ISO-8859-1 encoding of `text` when every code point fits, its UTF-8 bytes
/// otherwise. This is the form in which identities and secrets enter the hash.
fn hash_input(text: &str) -> Zeroizing<Vec<u8>> {
    if is_latin1(text) {
        Zeroizing::new(text.chars().map(|chr| u32::from(chr) as u8).collect())
    } else {
        Zeroizing::new(text.as_bytes().to_vec())
    }
}

/// Hashes `username:realm:password` the way it enters HA1. Secret providers can store this value
/// instead of the cleartext password.
pub fn hash_secret(username: &str, realm: &str, password: &str) -> [u8; MD5_LEN] {
    let username = hash_input(username);
    let realm = hash_input(realm);
    let password = hash_input(password);
    hash(&[&username, b":", &realm, b":", &password])
}

/// The session key H(A1). It keys the response digests and every security layer key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ha1([u8; MD5_LEN]);

impl Ha1 {
    /// Wraps a raw session key.
    pub fn from_bytes(bytes: [u8; MD5_LEN]) -> Self {
        Ha1(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; MD5_LEN] {
        &self.0
    }

    fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }
}

impl std::fmt::Debug for Ha1 {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str("Ha1(..)")
    }
}

/// Computes HA1 from a stored `H(username:realm:password)` digest.
pub fn compute_ha1_from_secret(secret: &[u8; MD5_LEN],
                               nonce: &str,
                               cnonce: &str,
                               authzid: Option<&str>)
                               -> Ha1 {
    let ha1 = match authzid {
        Some(authzid) => {
            hash(&[secret, b":", nonce.as_bytes(), b":", cnonce.as_bytes(), b":", authzid.as_bytes()])
        }
        None => hash(&[secret, b":", nonce.as_bytes(), b":", cnonce.as_bytes()]),
    };
    Ha1(ha1)
}

/// Computes the session key
/// `HA1 = MD5(MD5(identity ":" realm ":" secret) ":" nonce ":" cnonce [":" authzid])`.
///
/// Identity, realm and secret are hashed in ISO-8859-1 when every code point allows it and as
/// UTF-8 otherwise, each input decided on its own.
pub fn compute_ha1(identity: &str,
                   realm: &str,
                   secret: &str,
                   nonce: &str,
                   cnonce: &str,
                   authzid: Option<&str>)
                   -> Ha1 {
    let mut inner = hash_secret(identity, realm, secret);
    let ha1 = compute_ha1_from_secret(&inner, nonce, cnonce, authzid);
    inner.zeroize();
    ha1
}

/// The A2 verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method<'a> {
    /// `AUTHENTICATE`, used for the client response.
    Default,
    /// An explicit verb. An empty string means `Default`.
    Named(&'a str),
    /// No verb at all, used for the server's `rspauth`.
    Proof,
}

impl<'a> Method<'a> {
    fn as_str(&self) -> &'a str {
        match *self {
            Method::Default => DEFAULT_METHOD,
            Method::Named(verb) if verb.is_empty() => DEFAULT_METHOD,
            Method::Named(verb) => verb,
            Method::Proof => "",
        }
    }
}

/// The per-exchange inputs of a response digest.
///
/// Leaving `qop` out selects the legacy computation that predates quality of protection; `nc` and
/// `cnonce` are ignored then.
#[derive(Debug, Clone, Copy)]
pub struct ResponseParams<'a> {
    /// The server nonce.
    pub nonce: &'a str,
    /// The nonce-count.
    pub nc: u32,
    /// The client nonce.
    pub cnonce: &'a str,
    /// The negotiated quality of protection.
    pub qop: Option<Qop>,
    /// `service/host[/serv-name]`.
    pub digest_uri: &'a str,
}

/// Computes the 32 hex digit response digest
/// `MD5(hex(HA1) ":" nonce ":" [nc ":" cnonce ":" qop ":"] hex(HA2))`.
pub fn compute_response(ha1: &Ha1, params: &ResponseParams, method: Method) -> String {
    let ha2 = match params.qop {
        Some(Qop::AuthInt) | Some(Qop::AuthConf) => {
            hash(&[method.as_str().as_bytes(),
                  b":",
                  params.digest_uri.as_bytes(),
                  b":",
                  ZERO_ENTITY_HASH.as_bytes()])
        }
        Some(Qop::Auth) | None => {
            hash(&[method.as_str().as_bytes(), b":", params.digest_uri.as_bytes()])
        }
    };
    let ha1_hex = ha1.to_hex();
    let ha2_hex = hex::encode(ha2);
    let response = match params.qop {
        Some(qop) => {
            let nc = format!("{:08x}", params.nc);
            hash(&[ha1_hex.as_bytes(),
                  b":",
                  params.nonce.as_bytes(),
                  b":",
                  nc.as_bytes(),
                  b":",
                  params.cnonce.as_bytes(),
                  b":",
                  qop.as_str().as_bytes(),
                  b":",
                  ha2_hex.as_bytes()])
        }
        None => hash(&[ha1_hex.as_bytes(), b":", params.nonce.as_bytes(), b":", ha2_hex.as_bytes()]),
    };
    hex::encode(response)
}

/// Computes the `rspauth` value a server sends to prove it knows the secret.
pub fn compute_rspauth(ha1: &Ha1, params: &ResponseParams) -> String {
    compute_response(ha1, params, Method::Proof)
}

/// Compares two digests without leaking where they differ.
pub(crate) fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}
