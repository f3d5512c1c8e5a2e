//! Text encodings supported for payloads and exchange bodies

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CharsetError {
    #[error("unsupported charset '{0}'")]
    Unsupported(String),

    #[error("character {ch:?} cannot be encoded as {charset}")]
    Unmappable { ch: char, charset: Charset },

    #[error("input is not valid {0}")]
    Malformed(Charset),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Utf16Le,
    Utf16Be,
    Iso8859_1,
    UsAscii,
}

impl Charset {
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Utf16Le => "UTF-16LE",
            Charset::Utf16Be => "UTF-16BE",
            Charset::Iso8859_1 => "ISO-8859-1",
            Charset::UsAscii => "US-ASCII",
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u8>, CharsetError> {
        match self {
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
            Charset::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            Charset::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
            Charset::Iso8859_1 | Charset::UsAscii => {
                let limit = if *self == Charset::UsAscii { 0x7f } else { 0xff };
                text.chars()
                    .map(|ch| {
                        u8::try_from(u32::from(ch))
                            .ok()
                            .filter(|b| u32::from(*b) <= limit)
                            .ok_or(CharsetError::Unmappable { ch, charset: *self })
                    })
                    .collect()
            }
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<String, CharsetError> {
        match self {
            Charset::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| CharsetError::Malformed(*self)),
            Charset::Utf16Le | Charset::Utf16Be => {
                if bytes.len() % 2 != 0 {
                    return Err(CharsetError::Malformed(*self));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| {
                        let pair = [pair[0], pair[1]];
                        if *self == Charset::Utf16Le {
                            u16::from_le_bytes(pair)
                        } else {
                            u16::from_be_bytes(pair)
                        }
                    })
                    .collect();
                String::from_utf16(&units).map_err(|_| CharsetError::Malformed(*self))
            }
            Charset::Iso8859_1 => Ok(bytes.iter().map(|b| char::from(*b)).collect()),
            Charset::UsAscii => {
                if bytes.is_ascii() {
                    Ok(bytes.iter().map(|b| char::from(*b)).collect())
                } else {
                    Err(CharsetError::Malformed(*self))
                }
            }
        }
    }
}

impl FromStr for Charset {
    type Err = CharsetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "utf-16le" | "utf16le" => Ok(Charset::Utf16Le),
            "utf-16be" | "utf16be" | "utf-16" => Ok(Charset::Utf16Be),
            "iso-8859-1" | "latin1" | "latin-1" => Ok(Charset::Iso8859_1),
            "us-ascii" | "ascii" => Ok(Charset::UsAscii),
            _ => Err(CharsetError::Unsupported(s.to_string())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Charset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Charset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("UTF-8".parse::<Charset>().unwrap(), Charset::Utf8);
        assert_eq!("iso_8859_1".parse::<Charset>().unwrap(), Charset::Iso8859_1);
        assert!("EBCDIC".parse::<Charset>().is_err());
    }

    #[test]
    fn test_latin1_and_ascii() {
        assert_eq!(Charset::Iso8859_1.encode("café").unwrap(), vec![b'c', b'a', b'f', 0xe9]);
        assert_eq!(Charset::Iso8859_1.decode(&[b'c', 0xe9]).unwrap(), "cé");
        assert!(matches!(
            Charset::UsAscii.encode("café"),
            Err(CharsetError::Unmappable { ch: 'é', .. })
        ));
        assert!(Charset::Iso8859_1.encode("€").is_err());
    }

    #[test]
    fn test_utf16() {
        let bytes = Charset::Utf16Le.encode("hé").unwrap();
        assert_eq!(bytes, vec![b'h', 0, 0xe9, 0]);
        assert_eq!(Charset::Utf16Le.decode(&bytes).unwrap(), "hé");
        assert!(Charset::Utf16Be.decode(&[0]).is_err());
    }
}
