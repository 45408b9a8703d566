//! The integrity and confidentiality layers negotiated by `auth-int` and `auth-conf`.
//!
//! Every message travels in one frame: a four byte big-endian length followed by the payload.
//! The payload ends with a 16 byte trailer made of the first ten bytes of an HMAC-MD5 over the
//! sequence number and the message, the version tag `0x0001` and the sequence number. With
//! confidentiality the message, the block padding and the MAC are encrypted; the version tag
//! and the sequence number stay in the clear.

use std::{fmt, mem};

use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cipher::{Cipher, MAC_LEN};
use crate::error::{Error, Framing};
use crate::policy::Protection;
use crate::utils::{digests_equal, hash, hmac_md5, Ha1, MD5_LEN};

const VERSION: u16 = 1;
const LENGTH_LEN: usize = 4;
/// Version tag plus sequence number.
const TAG_LEN: usize = 6;
const TRAILER_LEN: usize = MAC_LEN + TAG_LEN;

const CLIENT_SIGN_MAGIC: &[u8] = b"Digest session key to client-to-server signing key magic constant";
const SERVER_SIGN_MAGIC: &[u8] = b"Digest session key to server-to-client signing key magic constant";
const CLIENT_SEAL_MAGIC: &[u8] = b"Digest H(A1) to client-to-server sealing key magic constant";
const SERVER_SEAL_MAGIC: &[u8] = b"Digest H(A1) to server-to-client sealing key magic constant";

/// Which end of the exchange a layer belongs to. It decides which derived key protects which
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The authenticating party.
    Client,
    /// The authenticated service.
    Server,
}

/// Signing and sealing keys for both directions.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKeys {
    sign_send: [u8; MD5_LEN],
    sign_receive: [u8; MD5_LEN],
    seal_send: [u8; MD5_LEN],
    seal_receive: [u8; MD5_LEN],
}

impl SessionKeys {
    /// Derives the keys from HA1. `seal_len` is the number of HA1 bytes the negotiated cipher
    /// feeds into its sealing keys; without a cipher the sealing keys stay zero.
    pub fn derive(ha1: &Ha1, seal_len: Option<usize>, role: Role) -> Self {
        let ha1 = ha1.as_bytes();
        let client_sign = hash(&[ha1, CLIENT_SIGN_MAGIC]);
        let server_sign = hash(&[ha1, SERVER_SIGN_MAGIC]);
        let (client_seal, server_seal) = match seal_len {
            Some(len) => {
                (hash(&[&ha1[..len], CLIENT_SEAL_MAGIC]), hash(&[&ha1[..len], SERVER_SEAL_MAGIC]))
            }
            None => ([0u8; MD5_LEN], [0u8; MD5_LEN]),
        };
        match role {
            Role::Client => {
                SessionKeys {
                    sign_send: client_sign,
                    sign_receive: server_sign,
                    seal_send: client_seal,
                    seal_receive: server_seal,
                }
            }
            Role::Server => {
                SessionKeys {
                    sign_send: server_sign,
                    sign_receive: client_sign,
                    seal_send: server_seal,
                    seal_receive: client_seal,
                }
            }
        }
    }
}

fn message_mac(key: &[u8; MD5_LEN], seq: u32, message: &[u8]) -> [u8; MAC_LEN] {
    let mut digest = hmac_md5(key, &[&seq.to_be_bytes(), message]);
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&digest[..MAC_LEN]);
    digest.zeroize();
    mac
}

/// Accumulates transport bytes until a complete frame is available.
#[derive(Debug)]
struct FrameReader {
    buffer: Vec<u8>,
    /// Bytes the current step still waits for: the length prefix or the payload.
    needed: usize,
    reading_length: bool,
}

impl FrameReader {
    fn new() -> Self {
        FrameReader {
            buffer: Vec::with_capacity(LENGTH_LEN),
            needed: LENGTH_LEN,
            reading_length: true,
        }
    }

    /// Buffers as much of `input` as the current step needs and returns the rest.
    fn fill<'a>(&mut self, input: &'a [u8]) -> &'a [u8] {
        let take = (self.needed - self.buffer.len()).min(input.len());
        self.buffer.extend_from_slice(&input[..take]);
        &input[take..]
    }

    fn is_complete(&self) -> bool {
        self.buffer.len() == self.needed
    }

    fn expect_payload(&mut self, len: usize) {
        self.buffer.clear();
        self.buffer.reserve_exact(len);
        self.needed = len;
        self.reading_length = false;
    }

    fn take_payload(&mut self) -> Vec<u8> {
        let payload = mem::replace(&mut self.buffer, Vec::with_capacity(LENGTH_LEN));
        self.needed = LENGTH_LEN;
        self.reading_length = true;
        payload
    }

    fn clear(&mut self) {
        self.buffer.zeroize();
        self.needed = LENGTH_LEN;
        self.reading_length = true;
    }
}

/// An active security layer. It frames outgoing messages with [`encode`](#method.encode) and
/// recovers incoming ones with [`decode`](#method.decode).
///
/// Any decoding failure disables the layer for good, since the peers can't resynchronize.
pub struct SecurityLayer {
    role: Role,
    protection: Protection,
    keys: SessionKeys,
    cipher: Option<Box<dyn Cipher>>,
    send_seq: u32,
    receive_seq: u32,
    max_inbuf: u32,
    max_outbuf: u32,
    reader: FrameReader,
    failed: bool,
}

impl SecurityLayer {
    /// Sets up the layer for `protection`, or returns `None` when no layer was negotiated.
    ///
    /// `max_inbuf` is the payload limit this side advertised, `max_outbuf` the peer's.
    pub fn new(role: Role,
               protection: Protection,
               ha1: &Ha1,
               max_inbuf: u32,
               max_outbuf: u32)
               -> Option<SecurityLayer> {
        let cipher_spec = match protection {
            Protection::None => return None,
            Protection::Integrity => None,
            Protection::Confidentiality(spec) => Some(spec),
        };
        let keys = SessionKeys::derive(ha1, cipher_spec.map(|spec| spec.key_len), role);
        let cipher = cipher_spec.map(|spec| spec.init(&keys.seal_send, &keys.seal_receive));
        debug!(?role, ssf = protection.ssf(), max_inbuf, max_outbuf, "security layer installed");
        Some(SecurityLayer {
            role: role,
            protection: protection,
            keys: keys,
            cipher: cipher,
            send_seq: 0,
            receive_seq: 0,
            max_inbuf: max_inbuf,
            max_outbuf: max_outbuf,
            reader: FrameReader::new(),
            failed: false,
        })
    }

    /// The protection this layer applies.
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// The security strength factor.
    pub fn ssf(&self) -> u32 {
        self.protection.ssf()
    }

    /// The largest message [`encode`](#method.encode) accepts without exceeding the peer's buffer.
    pub fn max_message_size(&self) -> usize {
        let max_outbuf = self.max_outbuf as usize;
        match self.protection.cipher() {
            Some(spec) if spec.is_block() => {
                // Padding always adds at least one byte and fills up to a whole block.
                let blocks = max_outbuf.saturating_sub(TAG_LEN) / spec.block_len * spec.block_len;
                blocks.saturating_sub(MAC_LEN + 1)
            }
            _ => max_outbuf.saturating_sub(TRAILER_LEN),
        }
    }

    /// Protects one message and returns its frame.
    pub fn encode(&mut self, message: &[u8]) -> Result<Vec<u8>, Error> {
        if self.failed {
            return Err(Error::Framing(Framing::Poisoned));
        }
        if message.len() > self.max_message_size() {
            return Err(Error::MessageTooLarge(message.len()));
        }
        let seq = self.send_seq;
        let mac = message_mac(&self.keys.sign_send, seq, message);
        let body = match self.cipher {
            Some(ref mut cipher) => cipher.encode(message, &mac),
            None => {
                let mut body = Vec::with_capacity(message.len() + MAC_LEN);
                body.extend_from_slice(message);
                body.extend_from_slice(&mac);
                body
            }
        };

        let payload_len = body.len() + TAG_LEN;
        let mut frame = Vec::with_capacity(LENGTH_LEN + payload_len);
        frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&VERSION.to_be_bytes());
        frame.extend_from_slice(&seq.to_be_bytes());
        self.send_seq = self.send_seq.wrapping_add(1);
        Ok(frame)
    }

    /// Feeds transport bytes into the layer and returns every message completed by them, in
    /// order. Partial frames stay buffered for the next call, so an empty result is normal.
    pub fn decode(&mut self, mut input: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        if self.failed {
            return Err(Error::Framing(Framing::Poisoned));
        }
        let mut messages = Vec::new();
        while !input.is_empty() {
            input = self.reader.fill(input);
            if !self.reader.is_complete() {
                break;
            }
            if self.reader.reading_length {
                let mut prefix = [0u8; LENGTH_LEN];
                prefix.copy_from_slice(&self.reader.buffer);
                let len = u32::from_be_bytes(prefix);
                if (len as usize) < TRAILER_LEN || len > self.max_inbuf {
                    return Err(self.fail(Framing::Length(len)));
                }
                self.reader.expect_payload(len as usize);
            } else {
                let payload = self.reader.take_payload();
                match self.open(&payload) {
                    Ok(message) => messages.push(message),
                    Err(framing) => return Err(self.fail(framing)),
                }
            }
        }
        Ok(messages)
    }

    fn open(&mut self, payload: &[u8]) -> Result<Vec<u8>, Framing> {
        let (body, tag) = payload.split_at(payload.len() - TAG_LEN);
        let version = u16::from_be_bytes([tag[0], tag[1]]);
        if version != VERSION {
            return Err(Framing::Version(version));
        }
        let seq = u32::from_be_bytes([tag[2], tag[3], tag[4], tag[5]]);
        if seq != self.receive_seq {
            return Err(Framing::Sequence {
                expected: self.receive_seq,
                received: seq,
            });
        }

        let (message, mac) = match self.cipher {
            Some(ref mut cipher) => cipher.decode(body)?,
            None => {
                if body.len() < MAC_LEN {
                    return Err(Framing::Truncated(payload.len()));
                }
                let (message, mac) = body.split_at(body.len() - MAC_LEN);
                let mut received = [0u8; MAC_LEN];
                received.copy_from_slice(mac);
                (message.to_vec(), received)
            }
        };
        let expected = message_mac(&self.keys.sign_receive, seq, &message);
        if !digests_equal(&expected, &mac) {
            return Err(Framing::Mac);
        }
        self.receive_seq = self.receive_seq.wrapping_add(1);
        Ok(message)
    }

    /// Disables the layer and scrubs its key material.
    fn fail(&mut self, framing: Framing) -> Error {
        warn!(role = ?self.role, error = %framing, "security layer failure, disabling layer");
        self.failed = true;
        self.keys.zeroize();
        self.cipher = None;
        self.reader.clear();
        Error::Framing(framing)
    }
}

impl fmt::Debug for SecurityLayer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("SecurityLayer")
            .field("role", &self.role)
            .field("protection", &self.protection)
            .field("send_seq", &self.send_seq)
            .field("receive_seq", &self.receive_seq)
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherSpec;

    fn ha1() -> Ha1 {
        Ha1::from_bytes(*b"0123456789abcdef")
    }

    fn pair(protection: Protection) -> (SecurityLayer, SecurityLayer) {
        (SecurityLayer::new(Role::Client, protection, &ha1(), 4096, 4096).unwrap(),
         SecurityLayer::new(Role::Server, protection, &ha1(), 4096, 4096).unwrap())
    }

    #[test]
    fn test_no_layer_without_protection() {
        assert!(SecurityLayer::new(Role::Client, Protection::None, &ha1(), 4096, 4096).is_none());
    }

    #[test]
    fn test_directional_keys() {
        let client = SessionKeys::derive(&ha1(), Some(16), Role::Client);
        let server = SessionKeys::derive(&ha1(), Some(16), Role::Server);
        assert_eq!(client.sign_send, server.sign_receive);
        assert_eq!(client.seal_send, server.seal_receive);
        assert!(client.sign_send != client.sign_receive);
        assert!(client.seal_send != client.seal_receive);
        assert!(client.sign_send != client.seal_send);

        let short = SessionKeys::derive(&ha1(), Some(5), Role::Client);
        assert_eq!(short.sign_send, client.sign_send);
        assert!(short.seal_send != client.seal_send);
    }

    #[test]
    fn test_integrity_frame_layout() {
        let (mut client, _) = pair(Protection::Integrity);
        let frame = client.encode(b"hello").unwrap();
        assert_eq!(frame.len(), 4 + 5 + 16);
        assert_eq!(&frame[..4], &[0, 0, 0, 21]);
        assert_eq!(&frame[4..9], b"hello");
        assert_eq!(&frame[19..21], &[0, 1]);
        assert_eq!(&frame[21..], &[0, 0, 0, 0]);
        let second = client.encode(b"hello").unwrap();
        assert_eq!(&second[21..], &[0, 0, 0, 1]);
        assert!(frame[9..19] != second[9..19]);
    }

    #[test]
    fn test_incremental_decode() {
        let (mut client, mut server) = pair(Protection::Integrity);
        let frame = client.encode(b"split across many calls").unwrap();
        for byte in &frame[..frame.len() - 1] {
            assert!(server.decode(&[*byte]).unwrap().is_empty());
        }
        assert_eq!(server.decode(&frame[frame.len() - 1..]).unwrap(),
                   vec![b"split across many calls".to_vec()]);
        assert!(server.decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let (mut client, mut server) = pair(Protection::Confidentiality(CipherSpec::by_name("des")
            .unwrap()));
        let mut stream = client.encode(b"one").unwrap();
        stream.extend(client.encode(b"two").unwrap());
        let third = client.encode(b"three").unwrap();
        stream.extend_from_slice(&third[..3]);
        assert_eq!(server.decode(&stream).unwrap(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(server.decode(&third[3..]).unwrap(), vec![b"three".to_vec()]);
    }

    #[test]
    fn test_tampered_frame_poisons_layer() {
        let (mut client, mut server) = pair(Protection::Integrity);
        let mut frame = client.encode(b"payload").unwrap();
        frame[5] ^= 1;
        assert_eq!(server.decode(&frame).unwrap_err(), Error::Framing(Framing::Mac));
        let good = client.encode(b"payload").unwrap();
        assert_eq!(server.decode(&good).unwrap_err(), Error::Framing(Framing::Poisoned));
        assert_eq!(server.encode(b"x").unwrap_err(), Error::Framing(Framing::Poisoned));
    }

    #[test]
    fn test_bad_version() {
        let (mut client, mut server) = pair(Protection::Integrity);
        let mut frame = client.encode(b"payload").unwrap();
        let at = frame.len() - 5;
        frame[at] = 2;
        assert_eq!(server.decode(&frame).unwrap_err(), Error::Framing(Framing::Version(2)));
    }

    #[test]
    fn test_length_limits() {
        let (_, mut server) = pair(Protection::Integrity);
        assert_eq!(server.decode(&[0, 0, 0, 15]).unwrap_err(), Error::Framing(Framing::Length(15)));

        let (_, mut server) = pair(Protection::Integrity);
        assert_eq!(server.decode(&[0, 0, 16, 1]).unwrap_err(),
                   Error::Framing(Framing::Length(4097)));
    }

    #[test]
    fn test_message_size_limit() {
        for protection in [Protection::Integrity,
                           Protection::Confidentiality(CipherSpec::by_name("rc4").unwrap()),
                           Protection::Confidentiality(CipherSpec::by_name("3des").unwrap())]
            .iter() {
            let (mut client, mut server) = pair(*protection);
            let max = client.max_message_size();
            let frame = client.encode(&vec![1u8; max]).unwrap();
            assert!(frame.len() - LENGTH_LEN <= 4096);
            assert_eq!(server.decode(&frame).unwrap(), vec![vec![1u8; max]]);
            assert_eq!(client.encode(&vec![1u8; max + 1]).unwrap_err(),
                       Error::MessageTooLarge(max + 1));
        }
    }
}
