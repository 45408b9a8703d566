//! The comma separated `name=value` lists exchanged by the mechanism.
//!
//! A value is either a bare token or a quoted string in which a backslash escapes the next
//! character. Whitespace around names, values and separators is insignificant, and empty list
//! elements are skipped.

use crate::error::{Error, Field, Kind};
use crate::MAX_MESSAGE_LEN;

const DELIMITERS: &[u8] = b"\"(),;:\\/[]?={}";

fn is_space(byte: u8) -> bool {
    byte == b' ' || byte == b'\t' || byte == b'\r' || byte == b'\n'
}

fn is_token(byte: u8) -> bool {
    byte > 0x20 && byte != 0x7f && !DELIMITERS.contains(&byte)
}

fn skip_space(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && is_space(bytes[pos]) {
        pos += 1;
    }
    pos
}

fn skip_token(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && is_token(bytes[pos]) {
        pos += 1;
    }
    pos
}

/// Parses a list into its `(name, value)` pairs in message order. Quoted values are unescaped.
pub fn parse(text: &str) -> Result<Vec<(String, String)>, Error> {
    let bytes = text.as_bytes();
    let mut pairs = Vec::new();
    let mut pos = 0;
    loop {
        pos = skip_space(bytes, pos);
        if pos == bytes.len() {
            break;
        }
        if bytes[pos] == b',' {
            pos += 1;
            continue;
        }

        let name_start = pos;
        pos = skip_token(bytes, pos);
        if pos == name_start {
            return Err(Error::Parse(pos));
        }
        // Tokens end on an ASCII byte, so this slice lies on character boundaries.
        let name = &text[name_start..pos];
        pos = skip_space(bytes, pos);
        if pos == bytes.len() || bytes[pos] != b'=' {
            return Err(Error::Parse(pos));
        }
        pos = skip_space(bytes, pos + 1);

        let value = if pos < bytes.len() && bytes[pos] == b'"' {
            pos += 1;
            let mut value = Vec::new();
            loop {
                match bytes.get(pos) {
                    None => return Err(Error::Parse(pos)),
                    Some(&b'"') => {
                        pos += 1;
                        break;
                    }
                    Some(&b'\\') => {
                        let escaped = *bytes.get(pos + 1).ok_or(Error::Parse(pos + 1))?;
                        value.push(escaped);
                        pos += 2;
                    }
                    Some(&byte) => {
                        value.push(byte);
                        pos += 1;
                    }
                }
            }
            String::from_utf8(value).map_err(|_| Error::Parse(pos))?
        } else {
            let value_start = pos;
            pos = skip_token(bytes, pos);
            text[value_start..pos].to_string()
        };

        pos = skip_space(bytes, pos);
        if pos < bytes.len() {
            if bytes[pos] != b',' {
                return Err(Error::Parse(pos));
            }
            pos += 1;
        }
        pairs.push((name.to_string(), value));
    }
    Ok(pairs)
}

/// Serializes pairs into a list, quoting every value that isn't a bare token.
///
/// Fails with `MessageTooLarge` when the result exceeds the 2048 byte message limit.
pub fn serialize<'a, I>(pairs: I) -> Result<String, Error>
    where I: IntoIterator<Item = (&'a str, &'a str)>
{
    let mut writer = Writer::new();
    for (name, value) in pairs {
        writer.token(name, value);
    }
    writer.finish()
}

/// Incrementally builds an outgoing message.
#[derive(Debug, Default)]
pub(crate) struct Writer {
    out: String,
}

impl Writer {
    pub fn new() -> Self {
        Writer { out: String::new() }
    }

    fn start(&mut self, name: &str) {
        if !self.out.is_empty() {
            self.out.push(',');
        }
        self.out.push_str(name);
        self.out.push('=');
    }

    /// Appends a value in quotes, as RFC 2831 demands for realms, nonces, identities and URIs.
    pub fn quoted(&mut self, name: &str, value: &str) -> &mut Self {
        self.start(name);
        self.out.push('"');
        for chr in value.chars() {
            if chr == '"' || chr == '\\' {
                self.out.push('\\');
            }
            self.out.push(chr);
        }
        self.out.push('"');
        self
    }

    /// Appends a value bare when it is a token, quoted otherwise.
    pub fn token(&mut self, name: &str, value: &str) -> &mut Self {
        if value.is_empty() || !value.bytes().all(is_token) {
            return self.quoted(name, value);
        }
        self.start(name);
        self.out.push_str(value);
        self
    }

    pub fn finish(self) -> Result<String, Error> {
        if self.out.len() > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLarge(self.out.len()));
        }
        Ok(self.out)
    }
}

/// A parsed message with lookups by directive name. Names compare case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pairs: Vec<(String, String)>,
}

impl Attributes {
    /// Parses a message.
    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(Attributes { pairs: parse(text)? })
    }

    /// All pairs in message order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|&(ref name, ref value)| (name.as_str(), value.as_str()))
    }

    /// Every value given for `name`.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.iter().filter(move |&(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value)
    }

    /// The first value given for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|&&(ref key, _)| key.eq_ignore_ascii_case(name))
            .map(|&(_, ref value)| value.as_str())
    }

    /// The value of a single-valued directive, rejecting repetitions.
    pub(crate) fn single(&self, field: Field) -> Result<Option<&str>, Error> {
        let mut values = self.get_all(field.name());
        let first = values.next();
        if values.next().is_some() {
            return Err(Error::Protocol(Kind::DuplicateField(field)));
        }
        Ok(first)
    }

    /// The value of a mandatory single-valued directive.
    pub(crate) fn require(&self, field: Field) -> Result<&str, Error> {
        self.single(field)?.ok_or(Error::Protocol(Kind::ExpectedField(field)))
    }
}

/// Splits a quoted list value such as `qop="auth,auth-int"` into its trimmed, non-empty items.
pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',')
        .map(|item| item.trim_matches(|chr: char| chr == ' ' || chr == '\t'))
        .filter(|item| !item.is_empty())
}
