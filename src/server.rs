use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::attrs::{Attributes, Writer};
use crate::error::{Error, Field, Kind, PolicyViolation};
use crate::layer::{Role, SecurityLayer};
use crate::policy::{Offer, Protection, Qop, SecurityPolicy, MIN_MAXBUF};
use crate::utils::{compute_ha1, compute_ha1_from_secret, compute_response, compute_rspauth,
                   digests_equal, generate_nonce, message_text, Method, ResponseParams, MD5_LEN};
use crate::{Exchange, Negotiated, Step, DEFAULT_MAXBUF};

/// A stored user secret.
pub enum Secret {
    /// The cleartext password.
    Password(Zeroizing<String>),
    /// `H(username ":" realm ":" password)` as computed by
    /// [`hash_secret`](../fn.hash_secret.html).
    Digest(Zeroizing<[u8; MD5_LEN]>),
}

impl Secret {
    /// Wraps a cleartext password.
    pub fn password(password: &str) -> Self {
        Secret::Password(Zeroizing::new(password.to_string()))
    }

    /// Wraps a precomputed secret digest.
    pub fn digest(digest: [u8; MD5_LEN]) -> Self {
        Secret::Digest(Zeroizing::new(digest))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Secret::Password(_) => fmt.write_str("Password(..)"),
            Secret::Digest(_) => fmt.write_str("Digest(..)"),
        }
    }
}

/// A `SecretProvider` looks up the secret of a user, and also checks if a user is authorized to
/// act on another user's behalf. The authorization component is optional, and if not implemented
/// will simply allow users to act on their own behalf, and no one else's.
pub trait SecretProvider {
    /// Gets the [`Secret`](enum.Secret.html) of `username` in `realm`.
    fn lookup(&self, username: &str, realm: &str) -> Option<Secret>;

    /// Checks to see if the user given by `authcid` is authorized to act as the user given
    /// by `authzid`. The default implementation just checks if the two are equal.
    fn authorize(&self, authcid: &str, authzid: &str) -> bool {
        authcid == authzid
    }
}

/// Server settings beyond the security policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    realms: Vec<String>,
    nonce_lifetime: Duration,
    legacy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            realms: Vec::new(),
            nonce_lifetime: Duration::from_secs(300),
            legacy: false,
        }
    }
}

impl ServerConfig {
    /// Adds a realm to offer. Without any, the policy's host name is offered.
    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realms.push(realm.to_string());
        self
    }

    /// How long a nonce stays fresh after it was issued.
    pub fn with_nonce_lifetime(mut self, lifetime: Duration) -> Self {
        self.nonce_lifetime = lifetime;
        self
    }

    /// Challenges without `qop` and `algorithm`, for clients that predate them. No security
    /// layer can be negotiated this way.
    pub fn with_legacy(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    /// How long a nonce stays fresh.
    pub fn nonce_lifetime(&self) -> Duration {
        self.nonce_lifetime
    }
}

#[derive(Debug)]
struct NonceRecord {
    issued: Instant,
    next_nc: u32,
    username: Option<String>,
    cnonce: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceStatus {
    Fresh,
    Stale,
    Unknown,
}

/// The nonces issued by a server, shared by all of its exchanges.
///
/// Each record keeps the issue time and the next nonce-count expected. The first successful
/// response binds the username and client nonce to it.
#[derive(Debug, Default)]
pub struct NonceTable {
    records: DashMap<String, NonceRecord>,
}

impl NonceTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        NonceTable { records: DashMap::new() }
    }

    /// Number of nonces tracked.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no nonce is tracked.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `nonce` is tracked.
    pub fn contains(&self, nonce: &str) -> bool {
        self.records.contains_key(nonce)
    }

    /// Records a new nonce and drops records too old to be reported stale.
    fn issue(&self, nonce: &str, lifetime: Duration) {
        let horizon = lifetime * 2;
        self.records.retain(|_, record| record.issued.elapsed() < horizon);
        self.records.insert(nonce.to_string(),
                            NonceRecord {
                                issued: Instant::now(),
                                next_nc: 1,
                                username: None,
                                cnonce: None,
                            });
    }

    /// Validates a response against the record of its nonce without changing it.
    ///
    /// With `resume` set, only nonces of verified sessions count. A nonce still awaiting its
    /// first response belongs to the exchange that issued it and is reported unknown.
    fn check(&self,
             nonce: &str,
             lifetime: Duration,
             username: &str,
             cnonce: &str,
             nc: u32,
             resume: bool)
             -> Result<NonceStatus, Error> {
        let record = match self.records.get(nonce) {
            Some(record) => record,
            None => return Ok(NonceStatus::Unknown),
        };
        if resume && record.username.is_none() {
            return Ok(NonceStatus::Unknown);
        }
        if record.issued.elapsed() >= lifetime {
            return Ok(NonceStatus::Stale);
        }
        if nc != record.next_nc {
            return Err(Error::Protocol(Kind::NonceCount {
                expected: record.next_nc,
                received: nc,
            }));
        }
        if record.username.as_ref().map_or(false, |bound| bound != username) {
            return Err(Error::Protocol(Kind::Mismatch(Field::Username)));
        }
        if record.cnonce.as_ref().map_or(false, |bound| bound != cnonce) {
            return Err(Error::Protocol(Kind::Mismatch(Field::Cnonce)));
        }
        Ok(NonceStatus::Fresh)
    }

    /// Consumes the nonce-count of a verified response. Another exchange racing with the same
    /// nonce-count loses here.
    fn commit(&self, nonce: &str, nc: u32, username: &str, cnonce: &str) -> Result<(), Error> {
        let mut record = self.records
            .get_mut(nonce)
            .ok_or(Error::Protocol(Kind::InvalidNonce))?;
        if nc != record.next_nc {
            return Err(Error::Protocol(Kind::NonceCount {
                expected: record.next_nc,
                received: nc,
            }));
        }
        record.next_nc = nc.wrapping_add(1);
        record.username.get_or_insert_with(|| username.to_string());
        record.cnonce.get_or_insert_with(|| cnonce.to_string());
        Ok(())
    }

    fn forget(&self, nonce: &str) {
        self.records.remove(nonce);
    }
}

/// The entry point for the DIGEST-MD5 server side. It holds what all exchanges share: the secret
/// provider, the policy and the nonce table.
pub struct DigestServer<P: SecretProvider> {
    provider: P,
    policy: SecurityPolicy,
    config: ServerConfig,
    nonces: Arc<NonceTable>,
}

impl<P: SecretProvider> DigestServer<P> {
    /// Creates a server with the default configuration.
    pub fn new(provider: P, policy: SecurityPolicy) -> Self {
        DigestServer {
            provider: provider,
            policy: policy,
            config: ServerConfig::default(),
            nonces: Arc::new(NonceTable::new()),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares a nonce table with other servers, so that sessions can resume on any of them.
    pub fn with_nonce_table(mut self, nonces: Arc<NonceTable>) -> Self {
        self.nonces = nonces;
        self
    }

    /// The table of issued nonces.
    pub fn nonces(&self) -> &Arc<NonceTable> {
        &self.nonces
    }

    /// Starts an exchange with one client.
    pub fn exchange(&self) -> ServerExchange<'_, P> {
        self.exchange_with_rng(OsRng)
    }

    /// Starts an exchange that draws its nonce from `rng`. Please only use a cryptographically
    /// secure random number generator!
    pub fn exchange_with_rng<R>(&self, rng: R) -> ServerExchange<'_, P>
        where R: RngCore + Send + 'static
    {
        ServerExchange {
            server: self,
            rng: Box::new(rng),
            state: State::Start,
            issued_nonce: None,
            negotiated: None,
            layer: None,
        }
    }

    fn realms(&self) -> Vec<&str> {
        if self.config.realms.is_empty() {
            vec![self.policy.host()]
        } else {
            self.config.realms.iter().map(String::as_str).collect()
        }
    }
}

impl<P: SecretProvider> fmt::Debug for DigestServer<P> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("DigestServer")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("nonces", &self.nonces.len())
            .finish()
    }
}

enum State {
    Start,
    AwaitResponse { nonce: String, offer: Offer },
    Verified,
    Rejected,
}

/// One authentication exchange of a [`DigestServer`](struct.DigestServer.html).
///
/// The first step takes an empty input and returns the challenge. A client resuming an earlier
/// session sends its response right away instead; the exchange then verifies it against the
/// nonce table, or answers with a fresh challenge when the session can't be resumed.
pub struct ServerExchange<'a, P: SecretProvider> {
    server: &'a DigestServer<P>,
    rng: Box<dyn RngCore + Send>,
    state: State,
    /// The nonce of the pending challenge. Only this one is dropped when the exchange fails.
    issued_nonce: Option<String>,
    negotiated: Option<Negotiated>,
    layer: Option<SecurityLayer>,
}

impl<'a, P: SecretProvider> ServerExchange<'a, P> {
    fn challenge(&mut self, stale: bool) -> Result<Step, Error> {
        let server = self.server;
        let offer = server.policy.offer()?;
        let nonce = generate_nonce(&mut *self.rng);
        let legacy = server.config.legacy;

        let mut writer = Writer::new();
        for realm in server.realms() {
            writer.quoted("realm", realm);
        }
        writer.quoted("nonce", &nonce);
        if !legacy {
            let qops: Vec<_> = offer.qops.iter().map(|qop| qop.as_str()).collect();
            writer.quoted("qop", &qops.join(","));
        }
        if stale {
            writer.token("stale", "true");
        }
        if !legacy && !offer.ciphers.is_empty() {
            let ciphers: Vec<_> = offer.ciphers.iter().map(|cipher| cipher.name).collect();
            writer.quoted("cipher", &ciphers.join(","));
        }
        let maxbuf = server.policy.maxbuf();
        if maxbuf != DEFAULT_MAXBUF && maxbuf > MIN_MAXBUF {
            writer.token("maxbuf", &maxbuf.to_string());
        }
        writer.token("charset", "utf-8");
        if !legacy {
            writer.token("algorithm", "md5-sess");
        }
        let challenge = writer.finish()?;

        server.nonces.issue(&nonce, server.config.nonce_lifetime);
        debug!(stale, legacy, qops = ?offer.qops, "challenge issued");
        self.issued_nonce = Some(nonce.clone());
        self.state = State::AwaitResponse {
            nonce: nonce,
            offer: offer,
        };
        Ok(Step::Continue(Some(challenge)))
    }

    /// Verifies a response. `issued` is the nonce of this exchange's challenge; without one the
    /// response resumes an earlier session.
    fn handle_response(&mut self,
                       attrs: &Attributes,
                       issued: Option<&str>,
                       offer: &Offer)
                       -> Result<Step, Error> {
        let server = self.server;
        let legacy = server.config.legacy;

        let username = attrs.require(Field::Username)?;
        let nonce = attrs.require(Field::Nonce)?;
        let digest_uri = attrs.require(Field::DigestUri)?;
        let response = attrs.require(Field::Response)?;
        let realm = attrs.single(Field::Realm)?.unwrap_or("");
        let authzid = attrs.single(Field::Authzid)?.filter(|authzid| !authzid.is_empty());
        let (cnonce, nc, qop) = if legacy {
            (attrs.single(Field::Cnonce)?.unwrap_or(""), 1, None)
        } else {
            let cnonce = attrs.require(Field::Cnonce)?;
            let nc = u32::from_str_radix(attrs.require(Field::NonceCount)?, 16)
                .map_err(|_| Error::Protocol(Kind::InvalidField(Field::NonceCount)))?;
            let qop = match attrs.single(Field::Qop)? {
                Some(qop) => {
                    Qop::parse(qop).ok_or(Error::Protocol(Kind::InvalidField(Field::Qop)))?
                }
                None => Qop::Auth,
            };
            (cnonce, nc, Some(qop))
        };
        let max_outbuf = match attrs.single(Field::Maxbuf)? {
            Some(maxbuf) => {
                let maxbuf: u32 = maxbuf.parse()
                    .map_err(|_| Error::Protocol(Kind::InvalidField(Field::Maxbuf)))?;
                if maxbuf <= MIN_MAXBUF {
                    return Err(Error::Protocol(Kind::InvalidField(Field::Maxbuf)));
                }
                maxbuf
            }
            None => DEFAULT_MAXBUF,
        };
        match attrs.single(Field::Charset)? {
            Some(charset) if !charset.eq_ignore_ascii_case("utf-8") => {
                return Err(Error::Protocol(Kind::InvalidField(Field::Charset)));
            }
            _ => {}
        }
        let cipher = attrs.single(Field::Cipher)?;

        if let Some(issued) = issued {
            if nonce != issued {
                return Err(Error::Protocol(Kind::InvalidNonce));
            }
        }
        let service = digest_uri.split('/').next().unwrap_or("");
        if !service.eq_ignore_ascii_case(server.policy.service()) {
            return Err(Error::Protocol(Kind::InvalidField(Field::DigestUri)));
        }
        if !realm.is_empty() && !server.realms().contains(&realm) {
            return Err(Error::Protocol(Kind::InvalidField(Field::Realm)));
        }
        let protection = match qop {
            Some(qop) => server.policy.accept(offer, qop, cipher)?,
            None if offer.qops.contains(&Qop::Auth) => Protection::None,
            None => return Err(Error::Policy(PolicyViolation::NoAcceptableQop)),
        };

        let lifetime = server.config.nonce_lifetime;
        match server.nonces.check(nonce, lifetime, username, cnonce, nc, issued.is_none())? {
            NonceStatus::Fresh => {}
            NonceStatus::Stale => {
                debug!(username, "stale nonce, challenging again");
                server.nonces.forget(nonce);
                return self.challenge(true);
            }
            NonceStatus::Unknown if issued.is_none() => {
                debug!(username, "unknown session, challenging");
                return self.challenge(false);
            }
            NonceStatus::Unknown => return Err(Error::Protocol(Kind::InvalidNonce)),
        }

        let params = ResponseParams {
            nonce: nonce,
            nc: nc,
            cnonce: cnonce,
            qop: qop,
            digest_uri: digest_uri,
        };
        let secret = server.provider.lookup(username, realm);
        // An unknown user costs the same hashing as a wrong password.
        let ha1 = match secret {
            Some(Secret::Password(ref password)) => {
                compute_ha1(username, realm, password, nonce, cnonce, authzid)
            }
            Some(Secret::Digest(ref digest)) => {
                compute_ha1_from_secret(digest, nonce, cnonce, authzid)
            }
            None => compute_ha1(username, realm, "", nonce, cnonce, authzid),
        };
        let expected = Zeroizing::new(compute_response(&ha1, &params, Method::Default));
        let matches = digests_equal(expected.as_bytes(), response.to_ascii_lowercase().as_bytes());
        if secret.is_none() {
            warn!(username, realm, "no such user");
            return Err(Error::NoSuchUser(username.to_string()));
        }
        if !matches {
            warn!(username, realm, "response digest mismatch");
            return Err(Error::InvalidCredentials);
        }
        if let Some(authzid) = authzid {
            if !server.provider.authorize(username, authzid) {
                warn!(username, authzid, "authorization denied");
                return Err(Error::NotAuthorized {
                    authcid: username.to_string(),
                    authzid: authzid.to_string(),
                });
            }
        }
        server.nonces.commit(nonce, nc, username, cnonce)?;

        debug!(username, realm, nc, ssf = protection.ssf(), "authenticated");
        let rspauth = compute_rspauth(&ha1, &params);
        self.layer = SecurityLayer::new(Role::Server,
                                        protection,
                                        &ha1,
                                        server.policy.maxbuf(),
                                        max_outbuf);
        self.negotiated = Some(Negotiated {
            authcid: username.to_string(),
            authzid: authzid.map(str::to_string),
            realm: realm.to_string(),
            protection: protection,
            max_outbuf: max_outbuf,
        });
        self.issued_nonce = None;
        self.state = State::Verified;
        Ok(Step::Done(Some(format!("rspauth={}", rspauth))))
    }
}

impl<'a, P: SecretProvider> Exchange for ServerExchange<'a, P> {
    fn step(&mut self, input: &[u8]) -> Result<Step, Error> {
        let state = mem::replace(&mut self.state, State::Rejected);
        let result = message_text(input).and_then(|text| {
            match state {
                State::Start if text.is_empty() => self.challenge(false),
                State::Start => {
                    let attrs = Attributes::parse(text)?;
                    let offer = self.server.policy.offer()?;
                    trace!("response without challenge, resuming session");
                    self.handle_response(&attrs, None, &offer)
                }
                State::AwaitResponse { nonce, offer } => {
                    let attrs = Attributes::parse(text)?;
                    self.handle_response(&attrs, Some(nonce.as_str()), &offer)
                }
                State::Verified | State::Rejected => Err(Error::InvalidState),
            }
        });
        if result.is_err() {
            if let Some(nonce) = self.issued_nonce.take() {
                self.server.nonces.forget(&nonce);
            }
            self.layer = None;
            self.state = State::Rejected;
        }
        result
    }

    fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    fn take_security_layer(&mut self) -> Option<SecurityLayer> {
        self.layer.take()
    }
}

impl<'a, P: SecretProvider> fmt::Debug for ServerExchange<'a, P> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("ServerExchange")
            .field("negotiated", &self.negotiated)
            .field("layer", &self.layer)
            .finish()
    }
}
