//! Stripe-style prefixed short IDs (C1).
//!
//! IDs look like `fa_8Jk3mQp2Wz1` — a short, lowercase prefix naming the
//! entity kind, an underscore, then a random base62 body. Bodies are 12
//! characters by default, which at this alphabet size keeps collision odds
//! astronomically small for any fleet this control plane will ever manage.

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const BODY_LEN: usize = 12;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Entity-kind prefix carried by a [`ShortId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prefix {
    Agent,
    Rule,
    ResourceGroup,
}

impl Prefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Prefix::Agent => "fa",
            Prefix::Rule => "fr",
            Prefix::ResourceGroup => "rg",
        }
    }

    fn from_str_tag(s: &str) -> Option<Self> {
        match s {
            "fa" => Some(Prefix::Agent),
            "fr" => Some(Prefix::Rule),
            "rg" => Some(Prefix::ResourceGroup),
            _ => None,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prefixed short ID, e.g. `fa_8Jk3mQp2Wz1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShortId {
    prefix: Prefix,
    body: String,
}

/// Errors parsing a [`ShortId`] from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShortIdError {
    #[error("short id missing '_' separator: {0}")]
    MissingSeparator(String),
    #[error("unknown short id prefix: {0}")]
    UnknownPrefix(String),
    #[error("short id body has wrong length or invalid characters: {0}")]
    InvalidBody(String),
}

impl ShortId {
    /// Generates a new random short ID with the given prefix.
    pub fn generate(prefix: Prefix) -> Self {
        let mut rng = rand::rng();
        Self::generate_with(prefix, || rng.random_range(0..ALPHABET.len()))
    }

    /// Generates a short ID using a caller-supplied index source, so tests
    /// can drive deterministic bodies without depending on the global RNG.
    pub fn generate_with(prefix: Prefix, mut next_index: impl FnMut() -> usize) -> Self {
        let body: String = (0..BODY_LEN)
            .map(|_| ALPHABET[next_index() % ALPHABET.len()] as char)
            .collect();
        Self { prefix, body }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.prefix, self.body)
    }
}

impl FromStr for ShortId {
    type Err = ShortIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, body) = s
            .split_once('_')
            .ok_or_else(|| ShortIdError::MissingSeparator(s.to_string()))?;
        let prefix =
            Prefix::from_str_tag(tag).ok_or_else(|| ShortIdError::UnknownPrefix(tag.to_string()))?;
        if body.len() != BODY_LEN || !body.bytes().all(|b| ALPHABET.contains(&b)) {
            return Err(ShortIdError::InvalidBody(body.to_string()));
        }
        Ok(Self {
            prefix,
            body: body.to_string(),
        })
    }
}

impl Serialize for ShortId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ShortId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

use serde::Serialize;
