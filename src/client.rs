use std::fmt;
use std::mem;
use std::sync::Arc;

use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::attrs::{split_list, Attributes, Writer};
use crate::cipher::CipherSpec;
use crate::error::{Error, Field, Kind};
use crate::layer::{Role, SecurityLayer};
use crate::policy::{Protection, Qop, SecurityPolicy, MIN_MAXBUF};
use crate::utils::{compute_ha1, compute_response, compute_rspauth, digests_equal, generate_nonce,
                   is_latin1, message_text, Ha1, Method, ResponseParams};
use crate::{Exchange, Negotiated, Step, DEFAULT_MAXBUF};

type RealmSelector = Box<dyn Fn(&[String]) -> Option<String> + Send>;

/// The parameters of a challenge the client acts on.
#[derive(Debug)]
struct Challenge {
    realms: Vec<String>,
    nonce: String,
    qops: Vec<Qop>,
    ciphers: Vec<&'static CipherSpec>,
    maxbuf: u32,
    utf8: bool,
    stale: bool,
    legacy: bool,
}

fn parse_maxbuf(value: Option<&str>) -> Result<u32, Error> {
    match value {
        Some(value) => {
            let maxbuf: u32 = value.parse()
                .map_err(|_| Error::Protocol(Kind::InvalidField(Field::Maxbuf)))?;
            if maxbuf <= MIN_MAXBUF {
                return Err(Error::Protocol(Kind::InvalidField(Field::Maxbuf)));
            }
            Ok(maxbuf)
        }
        None => Ok(DEFAULT_MAXBUF),
    }
}

/// Parses a server challenge.
fn parse_challenge(attrs: &Attributes) -> Result<Challenge, Error> {
    let nonce = attrs.require(Field::Nonce)?;
    let realms = attrs.get_all(Field::Realm.name()).map(str::to_string).collect();
    let qop = attrs.single(Field::Qop)?;
    let algorithm = attrs.single(Field::Algorithm)?;
    let maxbuf = parse_maxbuf(attrs.single(Field::Maxbuf)?)?;

    let utf8 = match attrs.single(Field::Charset)? {
        Some(charset) if charset.eq_ignore_ascii_case("utf-8") => true,
        Some(_) => return Err(Error::Protocol(Kind::InvalidField(Field::Charset))),
        None => false,
    };
    match algorithm {
        Some(algorithm) if !algorithm.eq_ignore_ascii_case("md5-sess") => {
            return Err(Error::Protocol(Kind::InvalidField(Field::Algorithm)));
        }
        _ => {}
    }
    let stale = attrs.single(Field::Stale)?.map_or(false, |stale| stale.eq_ignore_ascii_case("true"));

    // Unknown protections and ciphers are ignored. A missing qop means `auth`.
    let qops = match qop {
        Some(qop) => split_list(qop).filter_map(Qop::parse).collect(),
        None => vec![Qop::Auth],
    };
    let ciphers = match attrs.single(Field::Cipher)? {
        Some(ciphers) => split_list(ciphers).filter_map(CipherSpec::by_name).collect(),
        None => Vec::new(),
    };
    Ok(Challenge {
        realms: realms,
        nonce: nonce.to_string(),
        qops: qops,
        ciphers: ciphers,
        maxbuf: maxbuf,
        utf8: utf8,
        stale: stale,
        legacy: qop.is_none() && algorithm.is_none(),
    })
}

/// The state of an authenticated session that a later connection to the same server can resume
/// without a challenge round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    authcid: String,
    authzid: Option<String>,
    realm: String,
    nonce: String,
    cnonce: String,
    nc: u32,
    protection: Protection,
    max_outbuf: u32,
    digest_uri: String,
    utf8: bool,
    legacy: bool,
}

impl SessionContext {
    /// The authentication identity.
    pub fn authcid(&self) -> &str {
        &self.authcid
    }

    /// The realm.
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// The server nonce.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// The nonce-count of the last response sent.
    pub fn nonce_count(&self) -> u32 {
        self.nc
    }

    /// The negotiated protection.
    pub fn protection(&self) -> Protection {
        self.protection
    }
}

/// Sessions available for fast reauthentication, keyed by digest URI.
///
/// An entry is taken out while it is in use, so two connections never resume the same session.
/// A successful exchange puts its session back.
#[derive(Debug, Default)]
pub struct ReauthCache {
    sessions: DashMap<String, SessionContext>,
}

impl ReauthCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        ReauthCache { sessions: DashMap::new() }
    }

    /// Number of cached sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is cached.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A copy of the session cached for `digest_uri`.
    pub fn get(&self, digest_uri: &str) -> Option<SessionContext> {
        self.sessions.get(digest_uri).map(|entry| entry.value().clone())
    }

    /// Drops the session cached for `digest_uri`.
    pub fn forget(&self, digest_uri: &str) {
        self.sessions.remove(digest_uri);
    }

    fn take(&self,
            digest_uri: &str,
            authcid: &str,
            authzid: &Option<String>)
            -> Option<SessionContext> {
        self.sessions
            .remove_if(digest_uri,
                       |_, session| session.authcid == authcid && session.authzid == *authzid)
            .map(|(_, session)| session)
    }

    fn store(&self, session: SessionContext) {
        self.sessions.insert(session.digest_uri.clone(), session);
    }
}

enum State {
    Start,
    AwaitFinal {
        session: SessionContext,
        ha1: Ha1,
        rspauth: Zeroizing<String>,
        /// Whether a challenge in place of `rspauth` restarts the exchange.
        may_restart: bool,
        reauth: bool,
    },
    Done,
    Failed,
}

/// The client side of a DIGEST-MD5 exchange.
///
/// The server normally speaks first, so the first call to [`step`](#method.step) carries the
/// challenge. With a [`ReauthCache`](struct.ReauthCache.html) holding a session for the server,
/// an initial empty step resumes that session right away.
pub struct DigestClient {
    authcid: String,
    password: Zeroizing<String>,
    authzid: Option<String>,
    policy: SecurityPolicy,
    realm: Option<String>,
    realm_selector: Option<RealmSelector>,
    reauth: Option<Arc<ReauthCache>>,
    rng: Box<dyn RngCore + Send>,
    state: State,
    negotiated: Option<Negotiated>,
    layer: Option<SecurityLayer>,
}

impl DigestClient {
    /// Constructs a client for the provided credentials.
    ///
    /// # Arguments
    ///
    /// * authcid - An username used for authentication.
    /// * password - A password used to prove that the user is authentic.
    /// * authzid - An username used for authorization. If `authzid` is `None` the authorized
    /// username will be the same as the authenticated username.
    /// * policy - The protection bounds and the service to authenticate to.
    pub fn new(authcid: &str,
               password: &str,
               authzid: Option<&str>,
               policy: SecurityPolicy)
               -> Self {
        Self::with_rng(authcid, password, authzid, policy, OsRng)
    }

    /// Constructs a client like [`new`](#method.new) with a custom random number generator for
    /// the client nonce. Please only use a cryptographically secure random number generator!
    pub fn with_rng<R>(authcid: &str,
                       password: &str,
                       authzid: Option<&str>,
                       policy: SecurityPolicy,
                       rng: R)
                       -> Self
        where R: RngCore + Send + 'static
    {
        DigestClient {
            authcid: authcid.to_string(),
            password: Zeroizing::new(password.to_string()),
            authzid: authzid.filter(|authzid| !authzid.is_empty()).map(str::to_string),
            policy: policy,
            realm: None,
            realm_selector: None,
            reauth: None,
            rng: Box::new(rng),
            state: State::Start,
            negotiated: None,
            layer: None,
        }
    }

    /// The realm to use when the server offers it or offers none.
    pub fn with_realm(mut self, realm: &str) -> Self {
        self.realm = Some(realm.to_string());
        self
    }

    /// Picks a realm when the server offers more than one. Returning `None` falls back to the
    /// default choice.
    pub fn with_realm_selector<F>(mut self, selector: F) -> Self
        where F: Fn(&[String]) -> Option<String> + Send + 'static
    {
        self.realm_selector = Some(Box::new(selector));
        self
    }

    /// Resumes sessions from `cache` and stores successful ones in it.
    pub fn with_reauth_cache(mut self, cache: Arc<ReauthCache>) -> Self {
        self.reauth = Some(cache);
        self
    }

    fn select_realm(&self, offered: &[String]) -> String {
        if offered.len() > 1 {
            if let Some(realm) = self.realm_selector.as_ref().and_then(|select| select(offered)) {
                return realm;
            }
        }
        match self.realm {
            Some(ref realm) if offered.is_empty() || offered.contains(realm) => realm.clone(),
            _ => offered.first().cloned().unwrap_or_default(),
        }
    }

    fn handle_challenge(&mut self, attrs: &Attributes, may_restart: bool) -> Result<Step, Error> {
        let challenge = parse_challenge(attrs)?;
        let protection = if challenge.legacy {
            self.policy.choose(&[Qop::Auth], &[])?
        } else {
            self.policy.choose(&challenge.qops, &challenge.ciphers)?
        };
        let realm = self.select_realm(&challenge.realms);
        debug!(authcid = %self.authcid,
               realm = %realm,
               ssf = protection.ssf(),
               stale = challenge.stale,
               legacy = challenge.legacy,
               "responding to challenge");

        let session = SessionContext {
            authcid: self.authcid.clone(),
            authzid: self.authzid.clone(),
            realm: realm,
            nonce: challenge.nonce,
            cnonce: generate_nonce(&mut *self.rng),
            nc: 1,
            protection: protection,
            max_outbuf: challenge.maxbuf,
            digest_uri: self.policy.digest_uri(),
            utf8: challenge.utf8,
            legacy: challenge.legacy,
        };
        self.respond(session, may_restart, false)
    }

    /// Sends the response for `session` and waits for the server's verdict.
    fn respond(&mut self,
               session: SessionContext,
               may_restart: bool,
               reauth: bool)
               -> Result<Step, Error> {
        let needs_utf8 = !is_latin1(&session.authcid) || !is_latin1(&session.realm) ||
                         !is_latin1(&self.password);
        if needs_utf8 && !session.utf8 {
            return Err(Error::Protocol(Kind::InvalidField(Field::Charset)));
        }

        let ha1 = compute_ha1(&session.authcid,
                              &session.realm,
                              &self.password,
                              &session.nonce,
                              &session.cnonce,
                              session.authzid.as_ref().map(String::as_str));
        let qop = if session.legacy { None } else { Some(session.protection.qop()) };
        let params = ResponseParams {
            nonce: &session.nonce,
            nc: session.nc,
            cnonce: &session.cnonce,
            qop: qop,
            digest_uri: &session.digest_uri,
        };
        let response = compute_response(&ha1, &params, Method::Default);
        let rspauth = Zeroizing::new(compute_rspauth(&ha1, &params));

        let mut writer = Writer::new();
        writer.quoted("username", &session.authcid);
        if !session.realm.is_empty() {
            writer.quoted("realm", &session.realm);
        }
        writer.quoted("nonce", &session.nonce).quoted("cnonce", &session.cnonce);
        if let Some(qop) = qop {
            writer.token("nc", &format!("{:08x}", session.nc)).token("qop", qop.as_str());
        }
        if let Some(cipher) = session.protection.cipher() {
            writer.token("cipher", cipher.name);
        }
        if session.protection != Protection::None && self.policy.maxbuf() != DEFAULT_MAXBUF {
            writer.token("maxbuf", &self.policy.maxbuf().to_string());
        }
        if needs_utf8 {
            writer.token("charset", "utf-8");
        }
        writer.quoted("digest-uri", &session.digest_uri).token("response", &response);
        if let Some(ref authzid) = session.authzid {
            writer.quoted("authzid", authzid);
        }
        let message = writer.finish()?;
        trace!(nc = session.nc, reauth, "response sent");

        self.state = State::AwaitFinal {
            session: session,
            ha1: ha1,
            rspauth: rspauth,
            may_restart: may_restart,
            reauth: reauth,
        };
        Ok(Step::Continue(Some(message)))
    }

    fn handle_final(&mut self,
                    attrs: &Attributes,
                    session: SessionContext,
                    ha1: Ha1,
                    expected: &str,
                    may_restart: bool,
                    reauth: bool)
                    -> Result<Step, Error> {
        let rspauth = match attrs.single(Field::RspAuth)? {
            Some(rspauth) => rspauth,
            None => {
                // The server may refuse to resume a session or find the nonce stale and
                // challenge again instead.
                let is_challenge = attrs.get(Field::Nonce.name()).is_some();
                let stale = attrs.get(Field::Stale.name())
                    .map_or(false, |stale| stale.eq_ignore_ascii_case("true"));
                if is_challenge && may_restart && (reauth || stale) {
                    debug!(reauth, stale, "server challenged again, restarting exchange");
                    return self.handle_challenge(attrs, false);
                }
                return Err(Error::Protocol(Kind::ExpectedField(Field::RspAuth)));
            }
        };
        if !digests_equal(rspauth.to_ascii_lowercase().as_bytes(), expected.as_bytes()) {
            warn!(digest_uri = %session.digest_uri, "server failed to prove knowledge of the secret");
            return Err(Error::InvalidServer);
        }

        debug!(authcid = %session.authcid, ssf = session.protection.ssf(), "authenticated");
        self.layer = SecurityLayer::new(Role::Client,
                                        session.protection,
                                        &ha1,
                                        self.policy.maxbuf(),
                                        session.max_outbuf);
        self.negotiated = Some(Negotiated {
            authcid: session.authcid.clone(),
            authzid: session.authzid.clone(),
            realm: session.realm.clone(),
            protection: session.protection,
            max_outbuf: session.max_outbuf,
        });
        if !session.legacy {
            if let Some(ref cache) = self.reauth {
                cache.store(session);
            }
        }
        self.state = State::Done;
        Ok(Step::Done(None))
    }
}

impl Exchange for DigestClient {
    fn step(&mut self, input: &[u8]) -> Result<Step, Error> {
        let state = mem::replace(&mut self.state, State::Failed);
        let text = message_text(input)?;
        match state {
            State::Start if text.is_empty() => {
                let digest_uri = self.policy.digest_uri();
                let cached = self.reauth
                    .as_ref()
                    .and_then(|cache| cache.take(&digest_uri, &self.authcid, &self.authzid));
                match cached {
                    Some(mut session) => {
                        session.nc = session.nc.wrapping_add(1);
                        debug!(digest_uri = %digest_uri, nc = session.nc, "resuming session");
                        self.respond(session, true, true)
                    }
                    None => {
                        self.state = State::Start;
                        Ok(Step::Continue(None))
                    }
                }
            }
            State::Start => {
                let attrs = Attributes::parse(text)?;
                self.handle_challenge(&attrs, true)
            }
            State::AwaitFinal { session, ha1, rspauth, may_restart, reauth } => {
                let attrs = Attributes::parse(text)?;
                self.handle_final(&attrs, session, ha1, &rspauth, may_restart, reauth)
            }
            State::Done | State::Failed => Err(Error::InvalidState),
        }
    }

    fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    fn take_security_layer(&mut self) -> Option<SecurityLayer> {
        self.layer.take()
    }
}

impl fmt::Debug for DigestClient {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("DigestClient")
            .field("authcid", &self.authcid)
            .field("authzid", &self.authzid)
            .field("policy", &self.policy)
            .field("negotiated", &self.negotiated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyViolation;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const RFC_CHALLENGE: &str = "realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",\
                                 qop=\"auth\",algorithm=md5-sess,charset=utf-8";

    fn rfc_client() -> DigestClient {
        DigestClient::with_rng("chris",
                               "secret",
                               None,
                               SecurityPolicy::new("imap", "elwood.innosoft.com"),
                               StdRng::seed_from_u64(1))
    }

    fn respond(client: &mut DigestClient, challenge: &str) -> Attributes {
        match client.step(challenge.as_bytes()).unwrap() {
            Step::Continue(Some(response)) => Attributes::parse(&response).unwrap(),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_response_to_rfc_challenge() {
        let mut client = rfc_client();
        let response = respond(&mut client, RFC_CHALLENGE);
        assert_eq!(response.get("username"), Some("chris"));
        assert_eq!(response.get("realm"), Some("elwood.innosoft.com"));
        assert_eq!(response.get("nonce"), Some("OA6MG9tEQGm2hh"));
        assert_eq!(response.get("nc"), Some("00000001"));
        assert_eq!(response.get("qop"), Some("auth"));
        assert_eq!(response.get("digest-uri"), Some("imap/elwood.innosoft.com"));
        assert_eq!(response.get("cipher"), None);
        assert_eq!(response.get("charset"), None);
        assert_eq!(response.get("authzid"), None);

        let cnonce = response.get("cnonce").unwrap();
        let ha1 = compute_ha1("chris", "elwood.innosoft.com", "secret", "OA6MG9tEQGm2hh", cnonce, None);
        let params = ResponseParams {
            nonce: "OA6MG9tEQGm2hh",
            nc: 1,
            cnonce: cnonce,
            qop: Some(Qop::Auth),
            digest_uri: "imap/elwood.innosoft.com",
        };
        assert_eq!(response.get("response").unwrap(),
                   compute_response(&ha1, &params, Method::Default));

        let rspauth = format!("rspauth={}", compute_rspauth(&ha1, &params));
        assert_eq!(client.step(rspauth.as_bytes()).unwrap(), Step::Done(None));
        assert_eq!(client.negotiated().unwrap().ssf(), 0);
        assert!(client.take_security_layer().is_none());
        assert_eq!(client.step(b"").unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn test_wrong_rspauth() {
        let mut client = rfc_client();
        respond(&mut client, RFC_CHALLENGE);
        assert_eq!(client.step(b"rspauth=ea40f60335c427b5527b84dbabcdfffd").unwrap_err(),
                   Error::InvalidServer);
        assert_eq!(client.step(b"rspauth=x").unwrap_err(), Error::InvalidState);
    }

    #[test]
    fn test_missing_rspauth() {
        let mut client = rfc_client();
        respond(&mut client, RFC_CHALLENGE);
        assert_eq!(client.step(b"nonce=\"other\",qop=\"auth\"").unwrap_err(),
                   Error::Protocol(Kind::ExpectedField(Field::RspAuth)));
    }

    #[test]
    fn test_invalid_challenges() {
        let cases = [("realm=\"a\"", Kind::ExpectedField(Field::Nonce)),
                     ("nonce=\"a\",nonce=\"b\"", Kind::DuplicateField(Field::Nonce)),
                     ("nonce=\"a\",maxbuf=16", Kind::InvalidField(Field::Maxbuf)),
                     ("nonce=\"a\",maxbuf=1,maxbuf=2", Kind::DuplicateField(Field::Maxbuf)),
                     ("nonce=\"a\",maxbuf=lots", Kind::InvalidField(Field::Maxbuf)),
                     ("nonce=\"a\",charset=latin1", Kind::InvalidField(Field::Charset)),
                     ("nonce=\"a\",algorithm=md5", Kind::InvalidField(Field::Algorithm)),
                     ("nonce=\"a\",stale=true,stale=false", Kind::DuplicateField(Field::Stale))];
        for &(challenge, ref kind) in cases.iter() {
            let mut client = rfc_client();
            assert_eq!(client.step(challenge.as_bytes()).unwrap_err(),
                       Error::Protocol(kind.clone()),
                       "{}",
                       challenge);
        }
        assert_eq!(rfc_client().step(b"nonce=\"a").unwrap_err(), Error::Parse(8));
    }

    #[test]
    fn test_negotiates_strongest_layer() {
        let mut client = rfc_client();
        let response = respond(&mut client,
                               "nonce=\"n\",qop=\"auth,auth-int,auth-conf\",\
                                cipher=\"des,rc4-40,rc4,3des\",algorithm=md5-sess");
        assert_eq!(response.get("qop"), Some("auth-conf"));
        assert_eq!(response.get("cipher"), Some("rc4"));
        assert_eq!(response.get("realm"), None);
        assert_eq!(response.get("maxbuf"), None);
    }

    #[test]
    fn test_policy_too_weak() {
        let mut client = DigestClient::new("chris",
                                           "secret",
                                           None,
                                           SecurityPolicy::new("imap", "host").with_min_ssf(56));
        assert_eq!(client.step(b"nonce=\"n\",qop=\"auth,auth-int\",algorithm=md5-sess").unwrap_err(),
                   Error::Policy(PolicyViolation::NoAcceptableQop));
    }

    #[test]
    fn test_legacy_challenge() {
        let mut client = rfc_client();
        let response = respond(&mut client, "realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\"");
        assert_eq!(response.get("qop"), None);
        assert_eq!(response.get("nc"), None);
        let cnonce = response.get("cnonce").unwrap();
        let ha1 = compute_ha1("chris", "elwood.innosoft.com", "secret", "OA6MG9tEQGm2hh", cnonce, None);
        let params = ResponseParams {
            nonce: "OA6MG9tEQGm2hh",
            nc: 1,
            cnonce: cnonce,
            qop: None,
            digest_uri: "imap/elwood.innosoft.com",
        };
        assert_eq!(response.get("response").unwrap(),
                   compute_response(&ha1, &params, Method::Default));
    }

    #[test]
    fn test_realm_selection() {
        let challenge = "realm=\"a\",realm=\"b\",realm=\"c\",nonce=\"n\",algorithm=md5-sess";

        let mut client = rfc_client();
        assert_eq!(respond(&mut client, challenge).get("realm"), Some("a"));

        let mut client = rfc_client().with_realm("b");
        assert_eq!(respond(&mut client, challenge).get("realm"), Some("b"));

        let mut client = rfc_client().with_realm("z");
        assert_eq!(respond(&mut client, challenge).get("realm"), Some("a"));

        let mut client = rfc_client().with_realm("b").with_realm_selector(|realms| realms.last().cloned());
        assert_eq!(respond(&mut client, challenge).get("realm"), Some("c"));

        let mut client = rfc_client().with_realm("z");
        assert_eq!(respond(&mut client, "nonce=\"n\",algorithm=md5-sess").get("realm"), Some("z"));
    }

    #[test]
    fn test_charset_marker() {
        let policy = SecurityPolicy::new("imap", "host");
        let mut client = DigestClient::new("\u{3b1}lpha", "secret", None, policy.clone());
        let response = respond(&mut client, "nonce=\"n\",charset=utf-8,algorithm=md5-sess");
        assert_eq!(response.get("charset"), Some("utf-8"));
        assert_eq!(response.get("username"), Some("\u{3b1}lpha"));

        let mut client = DigestClient::new("\u{3b1}lpha", "secret", None, policy.clone());
        assert_eq!(client.step(b"nonce=\"n\",algorithm=md5-sess").unwrap_err(),
                   Error::Protocol(Kind::InvalidField(Field::Charset)));

        let mut client = DigestClient::new("ren\u{e9}", "secret", Some("admin"), policy);
        let response = respond(&mut client, "nonce=\"n\",charset=utf-8,algorithm=md5-sess");
        assert_eq!(response.get("charset"), None);
        assert_eq!(response.get("authzid"), Some("admin"));
    }

    #[test]
    fn test_empty_start_without_cache() {
        let mut client = rfc_client();
        assert_eq!(client.step(b"").unwrap(), Step::Continue(None));
        respond(&mut client, RFC_CHALLENGE);
    }
}
