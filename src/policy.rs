use std::fmt;

use crate::cipher::{CipherSpec, CIPHERS};
use crate::error::{Error, Field, Kind, PolicyViolation};
use crate::DEFAULT_MAXBUF;

/// Strength factor of the integrity layer.
pub const INTEGRITY_SSF: u32 = 1;

/// `maxbuf` values up to this one are invalid on the wire.
pub(crate) const MIN_MAXBUF: u32 = 16;

/// Quality of protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    /// Authentication only.
    Auth,
    /// Authentication with an integrity layer.
    AuthInt,
    /// Authentication with a confidentiality layer.
    AuthConf,
}

impl Qop {
    /// The wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
            Qop::AuthConf => "auth-conf",
        }
    }

    /// Parses a wire name, ignoring ASCII case.
    pub fn parse(value: &str) -> Option<Qop> {
        [Qop::Auth, Qop::AuthInt, Qop::AuthConf]
            .iter()
            .cloned()
            .find(|qop| qop.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for Qop {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// The protection negotiated for the traffic following authentication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Protection {
    /// No security layer.
    None,
    /// Every message carries a MAC.
    Integrity,
    /// Every message is encrypted with the cipher and carries a MAC.
    Confidentiality(&'static CipherSpec),
}

impl Protection {
    /// The quality of protection that selects this layer.
    pub fn qop(&self) -> Qop {
        match *self {
            Protection::None => Qop::Auth,
            Protection::Integrity => Qop::AuthInt,
            Protection::Confidentiality(_) => Qop::AuthConf,
        }
    }

    /// The security strength factor.
    pub fn ssf(&self) -> u32 {
        match *self {
            Protection::None => 0,
            Protection::Integrity => INTEGRITY_SSF,
            Protection::Confidentiality(cipher) => cipher.ssf,
        }
    }

    /// The cipher of a confidentiality layer.
    pub fn cipher(&self) -> Option<&'static CipherSpec> {
        match *self {
            Protection::Confidentiality(cipher) => Some(cipher),
            _ => None,
        }
    }
}

/// What a server puts into its challenge.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Offer {
    pub qops: Vec<Qop>,
    pub ciphers: Vec<&'static CipherSpec>,
}

/// Security properties shared by clients and servers: strength bounds, buffer size and the
/// identity of the service being authenticated to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    min_ssf: u32,
    max_ssf: u32,
    external_ssf: u32,
    maxbuf: u32,
    service: String,
    host: String,
    serv_name: Option<String>,
}

impl SecurityPolicy {
    /// A policy for `service` on `host` that accepts any protection layer.
    pub fn new(service: &str, host: &str) -> Self {
        SecurityPolicy {
            min_ssf: 0,
            max_ssf: 256,
            external_ssf: 0,
            maxbuf: DEFAULT_MAXBUF,
            service: service.to_string(),
            host: host.to_string(),
            serv_name: None,
        }
    }

    /// The minimal acceptable strength factor.
    pub fn with_min_ssf(mut self, min_ssf: u32) -> Self {
        self.min_ssf = min_ssf;
        self
    }

    /// The maximal strength factor worth negotiating.
    pub fn with_max_ssf(mut self, max_ssf: u32) -> Self {
        self.max_ssf = max_ssf;
        self
    }

    /// Strength already provided by an outer layer, e.g. TLS. It is subtracted from both bounds.
    pub fn with_external_ssf(mut self, external_ssf: u32) -> Self {
        self.external_ssf = external_ssf;
        self
    }

    /// The largest security layer payload this side accepts. Values up to 16 rule out any layer.
    pub fn with_maxbuf(mut self, maxbuf: u32) -> Self {
        self.maxbuf = maxbuf;
        self
    }

    /// A service name appended as third component of the digest URI, for replicated services.
    pub fn with_serv_name(mut self, serv_name: &str) -> Self {
        self.serv_name = Some(serv_name.to_string());
        self
    }

    /// The largest security layer payload this side accepts.
    pub fn maxbuf(&self) -> u32 {
        self.maxbuf
    }

    /// The service type, e.g. `imap`.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The server host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `service "/" host ["/" serv-name]`.
    pub fn digest_uri(&self) -> String {
        match self.serv_name {
            Some(ref serv_name) => format!("{}/{}/{}", self.service, self.host, serv_name),
            None => format!("{}/{}", self.service, self.host),
        }
    }

    /// Returns the (must have, limit) strength pair left after the external layer.
    fn bounds(&self) -> (u32, u32) {
        // A buffer that can't hold a frame trailer rules out any layer.
        if self.maxbuf <= MIN_MAXBUF {
            return (0, 0);
        }
        (self.min_ssf.saturating_sub(self.external_ssf),
         self.max_ssf.saturating_sub(self.external_ssf))
    }

    fn fits(&self, ssf: u32) -> bool {
        let (musthave, limit) = self.bounds();
        musthave <= ssf && ssf <= limit
    }

    /// Picks the strongest protection the challenge offers within the bounds, preferring
    /// confidentiality over integrity over none.
    pub(crate) fn choose(&self,
                         qops: &[Qop],
                         ciphers: &[&'static CipherSpec])
                         -> Result<Protection, Error> {
        let (musthave, limit) = self.bounds();
        if limit > INTEGRITY_SSF && qops.contains(&Qop::AuthConf) {
            let best = ciphers.iter()
                .cloned()
                .filter(|cipher| self.fits(cipher.ssf))
                .max_by_key(|cipher| cipher.ssf);
            if let Some(cipher) = best {
                return Ok(Protection::Confidentiality(cipher));
            }
        }
        if self.fits(INTEGRITY_SSF) && qops.contains(&Qop::AuthInt) {
            return Ok(Protection::Integrity);
        }
        if musthave == 0 && qops.contains(&Qop::Auth) {
            return Ok(Protection::None);
        }
        Err(Error::Policy(PolicyViolation::NoAcceptableQop))
    }

    /// Computes the qop and cipher lists a server offers.
    pub(crate) fn offer(&self) -> Result<Offer, Error> {
        let (musthave, limit) = self.bounds();
        let mut qops = Vec::new();
        let mut ciphers = Vec::new();
        if musthave == 0 {
            qops.push(Qop::Auth);
        }
        if self.fits(INTEGRITY_SSF) {
            qops.push(Qop::AuthInt);
        }
        if limit > INTEGRITY_SSF {
            ciphers.extend(CIPHERS.iter().filter(|cipher| self.fits(cipher.ssf)));
            if !ciphers.is_empty() {
                qops.push(Qop::AuthConf);
            }
        }
        if qops.is_empty() {
            return Err(Error::Policy(PolicyViolation::NoAcceptableQop));
        }
        Ok(Offer { qops: qops, ciphers: ciphers })
    }

    /// Checks the protection a client requested against what was offered and the bounds.
    pub(crate) fn accept(&self,
                         offer: &Offer,
                         qop: Qop,
                         cipher: Option<&str>)
                         -> Result<Protection, Error> {
        if !offer.qops.contains(&qop) {
            return Err(Error::Protocol(Kind::InvalidField(Field::Qop)));
        }
        match qop {
            Qop::Auth => Ok(Protection::None),
            Qop::AuthInt => Ok(Protection::Integrity),
            Qop::AuthConf => {
                let name = cipher.ok_or(Error::Protocol(Kind::ExpectedField(Field::Cipher)))?;
                let spec = offer.ciphers
                    .iter()
                    .cloned()
                    .find(|spec| spec.name.eq_ignore_ascii_case(name))
                    .ok_or_else(|| PolicyViolation::CipherNotOffered(name.to_string()))?;
                if !self.fits(spec.ssf) {
                    return Err(PolicyViolation::CipherStrength {
                            cipher: spec.name,
                            ssf: spec.ssf,
                        }
                        .into());
                }
                Ok(Protection::Confidentiality(spec))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherSpec;

    fn all_ciphers() -> Vec<&'static CipherSpec> {
        CIPHERS.iter().collect()
    }

    const ALL_QOPS: [Qop; 3] = [Qop::Auth, Qop::AuthInt, Qop::AuthConf];

    #[test]
    fn test_prefers_strongest_cipher() {
        let policy = SecurityPolicy::new("imap", "localhost");
        let protection = policy.choose(&ALL_QOPS, &all_ciphers()).unwrap();
        assert_eq!(protection.cipher().unwrap().name, "rc4");
        assert_eq!(protection.ssf(), 128);
    }

    #[test]
    fn test_bounded_cipher_choice() {
        let policy = SecurityPolicy::new("imap", "localhost").with_max_ssf(56);
        let protection = policy.choose(&ALL_QOPS, &all_ciphers()).unwrap();
        assert_eq!(protection.cipher().unwrap().name, "rc4-56");

        let policy = SecurityPolicy::new("imap", "localhost").with_min_ssf(100);
        let des = CipherSpec::by_name("des").unwrap();
        assert_eq!(policy.choose(&ALL_QOPS, &[des]).unwrap_err(),
                   Error::Policy(PolicyViolation::NoAcceptableQop));
    }

    #[test]
    fn test_falls_back_to_integrity_and_none() {
        let policy = SecurityPolicy::new("imap", "localhost");
        assert_eq!(policy.choose(&ALL_QOPS, &[]).unwrap(), Protection::Integrity);
        assert_eq!(policy.choose(&[Qop::Auth], &all_ciphers()).unwrap(), Protection::None);

        let policy = SecurityPolicy::new("imap", "localhost").with_max_ssf(1);
        assert_eq!(policy.choose(&ALL_QOPS, &all_ciphers()).unwrap(), Protection::Integrity);

        let policy = SecurityPolicy::new("imap", "localhost").with_maxbuf(0);
        assert_eq!(policy.choose(&ALL_QOPS, &all_ciphers()).unwrap(), Protection::None);
    }

    #[test]
    fn test_external_ssf() {
        let policy = SecurityPolicy::new("imap", "localhost").with_min_ssf(56).with_external_ssf(128);
        assert_eq!(policy.choose(&[Qop::Auth], &[]).unwrap(), Protection::None);

        let policy = SecurityPolicy::new("imap", "localhost").with_max_ssf(128).with_external_ssf(128);
        assert_eq!(policy.offer().unwrap().qops, vec![Qop::Auth]);
    }

    #[test]
    fn test_offer() {
        let offer = SecurityPolicy::new("imap", "localhost").offer().unwrap();
        assert_eq!(offer.qops, ALL_QOPS.to_vec());
        assert_eq!(offer.ciphers.len(), CIPHERS.len());

        let offer = SecurityPolicy::new("imap", "localhost").with_min_ssf(2).with_max_ssf(60).offer().unwrap();
        assert_eq!(offer.qops, vec![Qop::AuthConf]);
        let names: Vec<_> = offer.ciphers.iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["des", "rc4-56", "rc4-40"]);

        let policy = SecurityPolicy::new("imap", "localhost").with_min_ssf(200);
        assert!(policy.offer().is_err());
    }

    #[test]
    fn test_accept() {
        let policy = SecurityPolicy::new("imap", "localhost").with_max_ssf(60);
        let offer = policy.offer().unwrap();
        assert_eq!(policy.accept(&offer, Qop::AuthConf, Some("DES")).unwrap().ssf(), 55);
        assert_eq!(policy.accept(&offer, Qop::AuthConf, Some("rc4")).unwrap_err(),
                   Error::Policy(PolicyViolation::CipherNotOffered("rc4".into())));
        assert_eq!(policy.accept(&offer, Qop::AuthConf, None).unwrap_err(),
                   Error::Protocol(Kind::ExpectedField(Field::Cipher)));
        assert_eq!(policy.accept(&offer, Qop::AuthInt, Some("rc4")).unwrap(), Protection::Integrity);

        let strict = SecurityPolicy::new("imap", "localhost").with_min_ssf(56);
        assert_eq!(strict.accept(&offer, Qop::AuthConf, Some("des")).unwrap_err(),
                   Error::Policy(PolicyViolation::CipherStrength { cipher: "des", ssf: 55 }));
        assert_eq!(strict.accept(&Offer { qops: vec![Qop::AuthConf], ciphers: vec![] },
                                 Qop::Auth,
                                 None)
                       .unwrap_err(),
                   Error::Protocol(Kind::InvalidField(Field::Qop)));
    }

    #[test]
    fn test_digest_uri() {
        let policy = SecurityPolicy::new("imap", "elwood.innosoft.com");
        assert_eq!(policy.digest_uri(), "imap/elwood.innosoft.com");
        assert_eq!(policy.with_serv_name("innosoft.com").digest_uri(),
                   "imap/elwood.innosoft.com/innosoft.com");
    }

    #[test]
    fn test_qop_names() {
        assert_eq!(Qop::parse("AUTH-CONF"), Some(Qop::AuthConf));
        assert_eq!(Qop::parse("auth-int"), Some(Qop::AuthInt));
        assert_eq!(Qop::parse("token"), None);
        assert_eq!(Qop::AuthInt.to_string(), "auth-int");
    }
}
