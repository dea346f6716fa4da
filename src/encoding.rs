//! Text encodings for [`Store::write_str`](crate::Store::write_str) and
//! [`Store::read_to_string`](crate::Store::read_to_string).

use base64::Engine;
use std::str::FromStr;

use crate::error::{Error, Result};

/// How text maps to stored bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// UTF-8; invalid sequences read back as U+FFFD.
    #[default]
    Utf8,
    /// 7-bit ASCII; the high bit is dropped.
    Ascii,
    /// One byte per char (ISO-8859-1). Also accepted as `binary`.
    Latin1,
    /// Text is hexadecimal digits.
    Hex,
    /// Text is standard base64.
    Base64,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Ascii => "ascii",
            Self::Latin1 => "latin1",
            Self::Hex => "hex",
            Self::Base64 => "base64",
        }
    }

    /// Bytes to store for `text`.
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Ascii => Ok(text.chars().map(|c| (c as u32 & 0x7f) as u8).collect()),
            Self::Latin1 => Ok(text.chars().map(|c| c as u32 as u8).collect()),
            Self::Hex => hex::decode(text.trim()).map_err(|e| self.invalid(e)),
            Self::Base64 => base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| self.invalid(e)),
        }
    }

    /// Text for stored `bytes`.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Ascii => bytes.iter().map(|b| (b & 0x7f) as char).collect(),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Self::Hex => hex::encode(bytes),
            Self::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    fn invalid(self, err: impl std::fmt::Display) -> Error {
        Error::Encoding {
            encoding: self.as_str(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "ascii" => Ok(Self::Ascii),
            "latin1" | "binary" => Ok(Self::Latin1),
            "hex" => Ok(Self::Hex),
            "base64" => Ok(Self::Base64),
            other => anyhow::bail!("Unknown encoding: {other}"),
        }
    }
}
