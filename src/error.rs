use thiserror::Error;

/// The DIGEST-MD5 mechanism error cases.
///
/// Every variant is terminal for the exchange or security layer that produced it. A stale nonce
/// is not an error: the server answers it with a fresh challenge instead.
#[derive(Debug, PartialEq, Error)]
pub enum Error {
    /// A message didn't follow the `name=value` list grammar. The value is the byte offset where
    /// parsing stopped.
    #[error("malformed attribute list near byte {0}")]
    Parse(usize),
    /// A message was well formed but its content violates the protocol. `Kind` contains further
    /// information.
    ///
    /// RFC 2831 section 2 describes the format of the exchanged messages.
    #[error("protocol violation: {0}")]
    Protocol(Kind),
    /// The negotiated or requested protection is outside the configured strength bounds.
    #[error("security policy violation: {0}")]
    Policy(PolicyViolation),
    /// The client's response digest didn't match the one computed from the stored secret.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The secret provider doesn't know the user.
    ///
    /// On the wire this is indistinguishable from `InvalidCredentials`.
    #[error("no such user: '{0}'")]
    NoSuchUser(String),
    /// The user authenticated but may not act as the requested authorization identity.
    #[error("user '{authcid}' not authorized to act as '{authzid}'")]
    NotAuthorized {
        /// The authenticated identity.
        authcid: String,
        /// The requested authorization identity.
        authzid: String,
    },
    /// The server couldn't be validated. It failed to prove knowledge of the shared secret in its
    /// `rspauth` value.
    #[error("server failed validation")]
    InvalidServer,
    /// A security layer frame couldn't be decoded. The layer is unusable afterwards.
    #[error("security layer failure: {0}")]
    Framing(Framing),
    /// A message exceeds the size the peer accepts.
    #[error("message of {0} bytes is too large")]
    MessageTooLarge(usize),
    /// The exchange already finished, successfully or not.
    #[error("exchange already completed")]
    InvalidState,
}

/// The kinds of protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Kind {
    /// The nonce doesn't belong to this exchange.
    #[error("invalid nonce")]
    InvalidNonce,
    /// The nonce-count isn't the one expected for the nonce.
    #[error("nonce-count {received:08x} where {expected:08x} was expected")]
    NonceCount {
        /// The nonce-count the receiver expected.
        expected: u32,
        /// The nonce-count the peer sent.
        received: u32,
    },
    /// The content of the field `Field` is invalid.
    #[error("invalid field {0:?}")]
    InvalidField(Field),
    /// The field `Field` was expected but not found.
    #[error("expected field {0:?}")]
    ExpectedField(Field),
    /// The single-valued field `Field` occurred more than once.
    #[error("duplicate field {0:?}")]
    DuplicateField(Field),
    /// The field `Field` differs from the value bound to the session earlier.
    #[error("field {0:?} differs from the session")]
    Mismatch(Field),
}

/// The directives used in the exchanged messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Realm
    Realm,
    /// Nonce
    Nonce,
    /// Quality of protection
    Qop,
    /// Cipher
    Cipher,
    /// Charset
    Charset,
    /// Maximum buffer size
    Maxbuf,
    /// Algorithm
    Algorithm,
    /// Stale
    Stale,
    /// Authentication identity
    Username,
    /// Authorization identity
    Authzid,
    /// Client nonce
    Cnonce,
    /// Nonce-count
    NonceCount,
    /// Digest URI
    DigestUri,
    /// Response digest
    Response,
    /// Response authentication
    RspAuth,
}

impl Field {
    /// The directive name as it appears on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Field::Realm => "realm",
            Field::Nonce => "nonce",
            Field::Qop => "qop",
            Field::Cipher => "cipher",
            Field::Charset => "charset",
            Field::Maxbuf => "maxbuf",
            Field::Algorithm => "algorithm",
            Field::Stale => "stale",
            Field::Username => "username",
            Field::Authzid => "authzid",
            Field::Cnonce => "cnonce",
            Field::NonceCount => "nc",
            Field::DigestUri => "digest-uri",
            Field::Response => "response",
            Field::RspAuth => "rspauth",
        }
    }
}

/// Why a negotiation fell outside the security policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyViolation {
    /// No quality of protection satisfies both the peer and the configured bounds.
    #[error("no acceptable protection layer")]
    NoAcceptableQop,
    /// The client asked for a cipher the server didn't offer.
    #[error("cipher '{0}' was not offered")]
    CipherNotOffered(String),
    /// The cipher's strength lies outside the configured bounds.
    #[error("cipher '{cipher}' with strength {ssf} is outside the policy bounds")]
    CipherStrength {
        /// Cipher name.
        cipher: &'static str,
        /// Its strength factor.
        ssf: u32,
    },
}

/// Security layer decoding failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Framing {
    /// The length prefix is outside the acceptable range.
    #[error("frame length {0} out of range")]
    Length(u32),
    /// The frame is too short to hold its own trailer.
    #[error("frame of {0} bytes is truncated")]
    Truncated(usize),
    /// The trailer carries an unknown version tag.
    #[error("unsupported frame version {0}")]
    Version(u16),
    /// The frame's sequence number isn't the next expected one.
    #[error("sequence number {received} where {expected} was expected")]
    Sequence {
        /// The receiver's counter.
        expected: u32,
        /// The number carried by the frame.
        received: u32,
    },
    /// The message authentication code didn't verify.
    #[error("MAC mismatch")]
    Mac,
    /// Block cipher padding is malformed.
    #[error("bad padding")]
    Padding,
    /// An earlier failure disabled the layer.
    #[error("security layer disabled by an earlier failure")]
    Poisoned,
}

/// The SASL result a failure maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The peer doesn't speak the protocol.
    BadProtocol,
    /// Authentication failed.
    BadAuth,
    /// The user doesn't exist.
    NoUser,
    /// Authorization was denied.
    NoAuthz,
    /// The server couldn't be validated.
    BadServer,
    /// The security policy can't be satisfied.
    TooWeak,
    /// A message or frame exceeds the negotiated buffer.
    BufferOverflow,
    /// Generic failure.
    Fail,
}

impl Error {
    /// Classifies the error into the coarse result a SASL framework reports.
    pub fn code(&self) -> ResultCode {
        match *self {
            Error::Parse(_) => ResultCode::BadProtocol,
            Error::Protocol(Kind::ExpectedField(_))
            | Error::Protocol(Kind::InvalidField(Field::Maxbuf))
            | Error::Protocol(Kind::InvalidField(Field::Charset))
            | Error::Protocol(Kind::InvalidField(Field::DigestUri)) => ResultCode::BadAuth,
            Error::Protocol(_) => ResultCode::Fail,
            Error::Policy(_) => ResultCode::TooWeak,
            Error::InvalidCredentials => ResultCode::BadAuth,
            Error::NoSuchUser(_) => ResultCode::NoUser,
            Error::NotAuthorized { .. } => ResultCode::NoAuthz,
            Error::InvalidServer => ResultCode::BadServer,
            Error::Framing(_) => ResultCode::Fail,
            Error::MessageTooLarge(_) => ResultCode::BufferOverflow,
            Error::InvalidState => ResultCode::Fail,
        }
    }
}

impl From<Kind> for Error {
    fn from(kind: Kind) -> Self {
        Error::Protocol(kind)
    }
}

impl From<PolicyViolation> for Error {
    fn from(violation: PolicyViolation) -> Self {
        Error::Policy(violation)
    }
}

impl From<Framing> for Error {
    fn from(framing: Framing) -> Self {
        Error::Framing(framing)
    }
}
