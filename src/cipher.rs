//! Ciphers usable for the confidentiality layer.
//!
//! Each cipher gets one encryption and one decryption key, 16 bytes each, derived per direction
//! from the session key. The cipher state carries over from one message to the next: the RC4
//! keystream continues and the DES modes chain their CBC state.

use std::fmt;

use des::cipher::consts::{U16, U8};
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit, StreamCipher};
use des::{Des, TdesEde2};
use rc4::Rc4;
use zeroize::{Zeroize, Zeroizing};

use crate::error::Framing;

/// Length of the truncated HMAC carried by every protected message.
pub const MAC_LEN: usize = 10;

const DES_BLOCK_LEN: usize = 8;

/// A keyed cipher instance for one security layer. Dropping it disposes of the key material.
pub trait Cipher: Send {
    /// Encrypts `plaintext` together with its MAC.
    fn encode(&mut self, plaintext: &[u8], mac: &[u8; MAC_LEN]) -> Vec<u8>;

    /// Decrypts a message, separating plaintext and MAC.
    fn decode(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, [u8; MAC_LEN]), Framing>;
}

/// A registry entry describing one cipher.
pub struct CipherSpec {
    /// The name used in `cipher` directives.
    pub name: &'static str,
    /// Security strength factor.
    pub ssf: u32,
    /// How many bytes of HA1 feed the sealing key derivation.
    pub key_len: usize,
    /// Cipher block size; 1 for stream ciphers.
    pub block_len: usize,
    init: fn(&[u8; 16], &[u8; 16]) -> Box<dyn Cipher>,
}

/// The registered ciphers, in the order they are offered.
pub static CIPHERS: [CipherSpec; 5] = [CipherSpec {
                                           name: "3des",
                                           ssf: 112,
                                           key_len: 16,
                                           block_len: DES_BLOCK_LEN,
                                           init: init_3des,
                                       },
                                       CipherSpec {
                                           name: "rc4",
                                           ssf: 128,
                                           key_len: 16,
                                           block_len: 1,
                                           init: init_rc4,
                                       },
                                       CipherSpec {
                                           name: "des",
                                           ssf: 55,
                                           key_len: 7,
                                           block_len: DES_BLOCK_LEN,
                                           init: init_des,
                                       },
                                       CipherSpec {
                                           name: "rc4-56",
                                           ssf: 56,
                                           key_len: 7,
                                           block_len: 1,
                                           init: init_rc4,
                                       },
                                       CipherSpec {
                                           name: "rc4-40",
                                           ssf: 40,
                                           key_len: 5,
                                           block_len: 1,
                                           init: init_rc4,
                                       }];

impl CipherSpec {
    /// Looks a cipher up by name, ignoring ASCII case.
    pub fn by_name(name: &str) -> Option<&'static CipherSpec> {
        CIPHERS.iter().find(|spec| spec.name.eq_ignore_ascii_case(name))
    }

    /// Keys a cipher instance.
    pub fn init(&self, encrypt_key: &[u8; 16], decrypt_key: &[u8; 16]) -> Box<dyn Cipher> {
        (self.init)(encrypt_key, decrypt_key)
    }

    /// Whether the cipher pads to full blocks.
    pub fn is_block(&self) -> bool {
        self.block_len > 1
    }
}

impl PartialEq for CipherSpec {
    fn eq(&self, other: &CipherSpec) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for CipherSpec {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("CipherSpec")
            .field("name", &self.name)
            .field("ssf", &self.ssf)
            .finish()
    }
}

struct Rc4Cipher {
    encryptor: Rc4<U16>,
    decryptor: Rc4<U16>,
}

fn init_rc4(encrypt_key: &[u8; 16], decrypt_key: &[u8; 16]) -> Box<dyn Cipher> {
    Box::new(Rc4Cipher {
        encryptor: Rc4::new(GenericArray::from_slice(encrypt_key)),
        decryptor: Rc4::new(GenericArray::from_slice(decrypt_key)),
    })
}

impl Cipher for Rc4Cipher {
    fn encode(&mut self, plaintext: &[u8], mac: &[u8; MAC_LEN]) -> Vec<u8> {
        let mut output = Vec::with_capacity(plaintext.len() + MAC_LEN);
        output.extend_from_slice(plaintext);
        output.extend_from_slice(mac);
        self.encryptor.apply_keystream(&mut output);
        output
    }

    fn decode(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, [u8; MAC_LEN]), Framing> {
        if ciphertext.len() < MAC_LEN {
            return Err(Framing::Truncated(ciphertext.len()));
        }
        let mut output = ciphertext.to_vec();
        self.decryptor.apply_keystream(&mut output);
        let mut mac = [0u8; MAC_LEN];
        let text_len = output.len() - MAC_LEN;
        mac.copy_from_slice(&output[text_len..]);
        output.truncate(text_len);
        Ok((output, mac))
    }
}

/// Spreads 56 key bits over 8 bytes, leaving the low bit of each for parity.
fn expand_des_key(bits: &[u8]) -> Zeroizing<[u8; 8]> {
    let mut key = Zeroizing::new([0u8; 8]);
    key[0] = bits[0];
    for i in 1..7 {
        key[i] = (bits[i - 1] << (8 - i)) | (bits[i] >> i);
    }
    key[7] = bits[6] << 1;
    for byte in key.iter_mut() {
        *byte &= 0xfe;
        if byte.count_ones() % 2 == 0 {
            *byte |= 1;
        }
    }
    key
}

/// DES or two-key triple DES in CBC mode with PKCS-style padding placed before the MAC.
struct CbcCipher<C> {
    encryptor: C,
    encrypt_iv: [u8; DES_BLOCK_LEN],
    decryptor: C,
    decrypt_iv: [u8; DES_BLOCK_LEN],
}

fn init_des(encrypt_key: &[u8; 16], decrypt_key: &[u8; 16]) -> Box<dyn Cipher> {
    let des = |key: &[u8; 16]| Des::new(GenericArray::from_slice(&expand_des_key(&key[..7])[..]));
    Box::new(CbcCipher::new(des(encrypt_key), encrypt_key, des(decrypt_key), decrypt_key))
}

fn init_3des(encrypt_key: &[u8; 16], decrypt_key: &[u8; 16]) -> Box<dyn Cipher> {
    let tdes = |key: &[u8; 16]| {
        let mut material = Zeroizing::new([0u8; 16]);
        material[..8].copy_from_slice(&expand_des_key(&key[..7])[..]);
        material[8..].copy_from_slice(&expand_des_key(&key[7..14])[..]);
        TdesEde2::new(GenericArray::from_slice(&material[..]))
    };
    Box::new(CbcCipher::new(tdes(encrypt_key), encrypt_key, tdes(decrypt_key), decrypt_key))
}

impl<C> CbcCipher<C> {
    fn new(encryptor: C, encrypt_key: &[u8; 16], decryptor: C, decrypt_key: &[u8; 16]) -> Self {
        let mut encrypt_iv = [0u8; DES_BLOCK_LEN];
        encrypt_iv.copy_from_slice(&encrypt_key[8..]);
        let mut decrypt_iv = [0u8; DES_BLOCK_LEN];
        decrypt_iv.copy_from_slice(&decrypt_key[8..]);
        CbcCipher {
            encryptor: encryptor,
            encrypt_iv: encrypt_iv,
            decryptor: decryptor,
            decrypt_iv: decrypt_iv,
        }
    }
}

impl<C> Drop for CbcCipher<C> {
    fn drop(&mut self) {
        self.encrypt_iv.zeroize();
        self.decrypt_iv.zeroize();
    }
}

impl<C> Cipher for CbcCipher<C>
    where C: BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U8> + Send
{
    fn encode(&mut self, plaintext: &[u8], mac: &[u8; MAC_LEN]) -> Vec<u8> {
        let padding = DES_BLOCK_LEN - (plaintext.len() + MAC_LEN) % DES_BLOCK_LEN;
        let mut output = Vec::with_capacity(plaintext.len() + padding + MAC_LEN);
        output.extend_from_slice(plaintext);
        output.resize(plaintext.len() + padding, padding as u8);
        output.extend_from_slice(mac);
        for block in output.chunks_exact_mut(DES_BLOCK_LEN) {
            for (byte, iv) in block.iter_mut().zip(self.encrypt_iv.iter()) {
                *byte ^= iv;
            }
            self.encryptor.encrypt_block(GenericArray::from_mut_slice(block));
            self.encrypt_iv.copy_from_slice(block);
        }
        output
    }

    fn decode(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, [u8; MAC_LEN]), Framing> {
        if ciphertext.len() < MAC_LEN + 1 || ciphertext.len() % DES_BLOCK_LEN != 0 {
            return Err(Framing::Padding);
        }
        let mut output = ciphertext.to_vec();
        for block in output.chunks_exact_mut(DES_BLOCK_LEN) {
            let mut chained = [0u8; DES_BLOCK_LEN];
            chained.copy_from_slice(block);
            self.decryptor.decrypt_block(GenericArray::from_mut_slice(block));
            for (byte, iv) in block.iter_mut().zip(self.decrypt_iv.iter()) {
                *byte ^= iv;
            }
            self.decrypt_iv = chained;
        }

        let text_len = output.len() - MAC_LEN;
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&output[text_len..]);
        let padding = usize::from(output[text_len - 1]);
        if padding == 0 || padding > DES_BLOCK_LEN || padding > text_len ||
           output[text_len - padding..text_len].iter().any(|&byte| usize::from(byte) != padding) {
            output.zeroize();
            return Err(Framing::Padding);
        }
        output.truncate(text_len - padding);
        Ok((output, mac))
    }
}
