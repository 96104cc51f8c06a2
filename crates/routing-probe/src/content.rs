//! Content items announced and looked up during measurement rounds.
//!
//! Every round provides a freshly generated random payload, so a retrieval can
//! never be answered from a cache warmed by an earlier round. Content ids are
//! CIDv1 strings (raw codec, sha2-256 multihash, base32 multibase).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const CID_V1: u8 = 0x01;
const CODEC_RAW: u8 = 0x55;
const CODEC_DAG_PB: u8 = 0x70;
const MULTIHASH_SHA2_256: u8 = 0x12;
const SHA2_256_LEN: usize = 32;
const CID_PREFIX_LEN: usize = 4;
const MULTIBASE_BASE32_LOWER: char = 'b';

/// Errors produced when parsing a content id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentIdError {
    #[error("content id is empty")]
    Empty,
    #[error("unsupported multibase prefix {0:?}")]
    UnsupportedMultibase(char),
    #[error("invalid base32 encoding: {0}")]
    InvalidEncoding(String),
    #[error("unsupported cid prefix 0x{0}")]
    UnsupportedPrefix(String),
    #[error("expected {expected} cid bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Content-derived address of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Derive the CIDv1 (raw, sha2-256) of `payload`.
    pub fn from_payload(payload: &[u8]) -> Self {
        let digest = Sha256::digest(payload);

        let mut raw = Vec::with_capacity(CID_PREFIX_LEN + SHA2_256_LEN);
        raw.extend_from_slice(&[CID_V1, CODEC_RAW, MULTIHASH_SHA2_256, SHA2_256_LEN as u8]);
        raw.extend_from_slice(&digest);

        Self::encode(&raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The sha2-256 digest this id addresses.
    pub fn digest(&self) -> Vec<u8> {
        // Parsing guarantees the string decodes to prefix + digest.
        Self::decode(&self.0)
            .map(|raw| raw[CID_PREFIX_LEN..].to_vec())
            .unwrap_or_default()
    }

    fn encode(raw: &[u8]) -> Self {
        let mut s = String::with_capacity(1 + raw.len() * 8 / 5 + 1);
        s.push(MULTIBASE_BASE32_LOWER);
        s.push_str(&BASE32_NOPAD.encode(raw).to_ascii_lowercase());
        Self(s)
    }

    fn decode(s: &str) -> Result<Vec<u8>, ContentIdError> {
        let mut chars = s.chars();
        let base = chars.next().ok_or(ContentIdError::Empty)?;
        if base != MULTIBASE_BASE32_LOWER {
            return Err(ContentIdError::UnsupportedMultibase(base));
        }

        let raw = BASE32_NOPAD
            .decode(chars.as_str().to_ascii_uppercase().as_bytes())
            .map_err(|e| ContentIdError::InvalidEncoding(e.to_string()))?;

        let expected = CID_PREFIX_LEN + SHA2_256_LEN;
        if raw.len() != expected {
            return Err(ContentIdError::InvalidLength {
                expected,
                actual: raw.len(),
            });
        }

        let prefix = &raw[..CID_PREFIX_LEN];
        let codec_ok = prefix[1] == CODEC_RAW || prefix[1] == CODEC_DAG_PB;
        if prefix[0] != CID_V1
            || !codec_ok
            || prefix[2] != MULTIHASH_SHA2_256
            || prefix[3] as usize != SHA2_256_LEN
        {
            return Err(ContentIdError::UnsupportedPrefix(hex::encode(prefix)));
        }

        Ok(raw)
    }
}

impl FromStr for ContentId {
    type Err = ContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = Self::decode(s)?;
        Ok(Self::encode(&raw))
    }
}

impl TryFrom<String> for ContentId {
    type Error = ContentIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentId> for String {
    fn from(cid: ContentId) -> Self {
        cid.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A piece of content owned by the scheduler for the lifetime of one round.
#[derive(Debug, Clone)]
pub struct Content {
    pub cid: ContentId,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
}

impl Content {
    pub fn from_payload(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            cid: ContentId::from_payload(&payload),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Generate random content of `1..=max_size` bytes.
    pub fn random(max_size: usize) -> Self {
        let mut rng = rand::thread_rng();
        let len = rng.gen_range(1..=max_size.max(1));

        let mut payload = vec![0u8; len];
        rng.fill_bytes(&mut payload);

        Self::from_payload(payload)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
