//! Wire types of the agent HTTP API.
//!
//! ```text
//! POST /provide          ProvideRequest  -> ProvideResponse
//! POST /retrieve/{cid}   RetrieveRequest -> RetrievalResponse
//! GET  /readiness                        -> ReadinessResponse
//! ```
//!
//! Routing-layer failures travel inside the response bodies as `error`;
//! only malformed requests get a non-2xx status.

use crate::build_info::BuildInfo;
use crate::content::{Content, ContentId};
use crate::routing::{PeerId, RoutingStrategy};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Header carrying the id of the scheduler run that issued a request.
pub const HEADER_SCHEDULER_ID: &str = "x-scheduler-id";

/// Error string of a lookup that completed without a provider.
pub const NOT_FOUND: &str = "not found";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvideRequest {
    /// Base64 encoded payload.
    pub content: String,
}

impl ProvideRequest {
    pub fn new(content: &Content) -> Self {
        Self {
            content: STANDARD.encode(&content.payload),
        }
    }

    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvideResponse {
    pub cid: ContentId,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub routing_table_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub routing: RoutingStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub cid: ContentId,
    pub routing: RoutingStrategy,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub routing_table_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Classification of a retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Found,
    NotFound,
    Failed,
}

impl RetrievalResponse {
    pub fn outcome(&self) -> Outcome {
        match self.error.as_deref() {
            None => Outcome::Found,
            Some(NOT_FOUND) => Outcome::NotFound,
            Some(_) => Outcome::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub healthy: bool,
    pub peer_id: PeerId,
    pub build: BuildInfo,
    /// Host name of the machine running the agent.
    #[serde(default)]
    pub host: String,
}
