//! Measurement agent HTTP server.
//!
//! Each request performs exactly one routing call, times it, and answers
//! with a structured result. Routing failures are part of the result; only
//! malformed requests produce an error status.

use super::api::{
    HEADER_SCHEDULER_ID, NOT_FOUND, ProvideRequest, ProvideResponse, ReadinessResponse,
    RetrievalResponse, RetrieveRequest,
};
use crate::build_info::BuildInfo;
use crate::content::ContentId;
use crate::routing::{ContentRouting, RoutingStrategy};
use crate::shutdown::ShutdownSignal;
use crate::telemetry::{EventKind, TelemetryEvent, TelemetrySink};
use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Default bound of a single provider or index lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Agent {
    routing: Arc<dyn ContentRouting>,
    telemetry: TelemetrySink,
    build: BuildInfo,
    host: String,
    lookup_timeout: Duration,
}

impl Agent {
    pub fn new(
        routing: Arc<dyn ContentRouting>,
        telemetry: TelemetrySink,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            routing,
            telemetry,
            build: BuildInfo::current(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            lookup_timeout,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/provide", post(provide))
            .route("/retrieve/{cid}", post(retrieve))
            .route("/readiness", get(readiness))
            .layer(middleware::from_fn(log_request))
            .with_state(self)
    }

    /// Serve the agent API until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: ShutdownSignal,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            peer_id = %self.routing.local_peer_id().short(),
            "Agent API listening on {}", addr
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
            .context("serve agent API")?;

        info!("Agent API stopped");
        Ok(())
    }

    pub fn readiness(&self) -> ReadinessResponse {
        ReadinessResponse {
            healthy: self.routing.is_ready(),
            peer_id: self.routing.local_peer_id(),
            build: self.build.clone(),
            host: self.host.clone(),
        }
    }

    /// Announce `payload` through the DHT and time the call.
    pub async fn provide(&self, payload: &[u8], scheduler_id: Option<String>) -> ProvideResponse {
        let cid = ContentId::from_payload(payload);
        let routing_table_size = self.routing.routing_table_size();
        info!(cid = %cid, rt_size = routing_table_size, "Start providing content");

        let start = Instant::now();
        let result = self.routing.provide(&cid).await;
        let duration = start.elapsed();

        let error = match result {
            Ok(()) => {
                info!(cid = %cid, dur = duration.as_secs_f64(), "Provided content");
                None
            }
            Err(e) => {
                warn!(cid = %cid, dur = duration.as_secs_f64(), "Failed to provide content: {}", e);
                Some(e.to_string())
            }
        };

        self.telemetry.emit(TelemetryEvent {
            kind: EventKind::Provide,
            peer_id: self.routing.local_peer_id(),
            cid: cid.clone(),
            routing: None,
            duration,
            routing_table_size,
            error: error.clone(),
            scheduler_id,
            timestamp: Utc::now(),
        });

        ProvideResponse {
            cid,
            duration,
            routing_table_size,
            error,
        }
    }

    /// Look `cid` up through the selected routing path and time it.
    pub async fn retrieve(
        &self,
        cid: ContentId,
        routing: RoutingStrategy,
        scheduler_id: Option<String>,
    ) -> RetrievalResponse {
        let routing_table_size = self.routing.routing_table_size();
        info!(cid = %cid, rt_size = routing_table_size, %routing, "Start finding providers");

        let (duration, error) = match routing {
            RoutingStrategy::Dht => self.first_provider(&cid).await,
            RoutingStrategy::Indexer => self.index_lookup(&cid).await,
        };

        self.telemetry.emit(TelemetryEvent {
            kind: EventKind::Retrieval,
            peer_id: self.routing.local_peer_id(),
            cid: cid.clone(),
            routing: Some(routing),
            duration,
            routing_table_size,
            error: error.clone(),
            scheduler_id,
            timestamp: Utc::now(),
        });

        RetrievalResponse {
            cid,
            routing,
            duration,
            routing_table_size,
            error,
        }
    }

    async fn first_provider(&self, cid: &ContentId) -> (Duration, Option<String>) {
        let start = Instant::now();
        let result =
            tokio::time::timeout(self.lookup_timeout, self.routing.find_first_provider(cid)).await;
        let duration = start.elapsed();
        let dur = duration.as_secs_f64();

        match result {
            Err(_) => {
                info!(cid = %cid, dur, "Provider lookup timed out");
                (duration, Some(NOT_FOUND.to_string()))
            }
            Ok(Err(e)) => {
                warn!(cid = %cid, dur, "Failed finding provider: {}", e);
                (duration, Some(e.to_string()))
            }
            Ok(Ok(provider)) if provider.validate().is_err() => {
                info!(cid = %cid, dur, "Didn't find provider");
                (duration, Some(NOT_FOUND.to_string()))
            }
            Ok(Ok(provider)) => {
                // Keep later rounds from reusing this connection.
                self.routing.forget_peer(&provider);
                info!(cid = %cid, dur, provider = %provider.short(), "Found provider");
                (duration, None)
            }
        }
    }

    async fn index_lookup(&self, cid: &ContentId) -> (Duration, Option<String>) {
        let start = Instant::now();
        let result =
            tokio::time::timeout(self.lookup_timeout, self.routing.indexer_lookup(cid)).await;
        let duration = start.elapsed();
        let dur = duration.as_secs_f64();

        match result {
            Err(_) => {
                warn!(cid = %cid, dur, "Indexer lookup timed out");
                (
                    duration,
                    Some(format!(
                        "indexer lookup timed out after {}",
                        humantime_serde::re::humantime::format_duration(self.lookup_timeout)
                    )),
                )
            }
            Ok(Err(e)) => {
                warn!(cid = %cid, dur, "Failed looking up provider: {}", e);
                (duration, Some(e.to_string()))
            }
            Ok(Ok(resp)) if resp.is_empty() => {
                info!(cid = %cid, dur, "Indexer returned no results");
                (duration, Some(NOT_FOUND.to_string()))
            }
            Ok(Ok(_)) => {
                info!(cid = %cid, dur, "Indexer found provider");
                (duration, None)
            }
        }
    }
}

fn scheduler_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HEADER_SCHEDULER_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn log_request(req: Request, next: Next) -> Response {
    info!(
        method = %req.method(),
        url = %req.uri(),
        scheduler_id = %scheduler_id(req.headers()).unwrap_or_default(),
        "Received request"
    );
    next.run(req).await
}

async fn provide(State(agent): State<Arc<Agent>>, headers: HeaderMap, body: Bytes) -> Response {
    let request: ProvideRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let payload = match request.payload() {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    Json(agent.provide(&payload, scheduler_id(&headers)).await).into_response()
}

async fn retrieve(
    State(agent): State<Arc<Agent>>,
    Path(cid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: RetrieveRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let cid: ContentId = match cid.parse() {
        Ok(cid) => cid,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid cid: {e}")).into_response(),
    };

    Json(
        agent
            .retrieve(cid, request.routing, scheduler_id(&headers))
            .await,
    )
    .into_response()
}

async fn readiness(State(agent): State<Arc<Agent>>) -> Response {
    let readiness = agent.readiness();
    let status = if readiness.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::api::Outcome;
    use crate::routing::memory::{MemoryNetwork, MemoryNetworkConfig};
    use crate::routing::{IndexerResponse, PeerId, RoutingError};
    use async_trait::async_trait;

    /// Routing stub whose lookups return fixed answers.
    struct Fixed {
        provider: PeerId,
        index: IndexerResponse,
        fail_index: bool,
        hang: bool,
    }

    impl Fixed {
        fn empty() -> Self {
            Self {
                provider: PeerId::empty(),
                index: IndexerResponse::default(),
                fail_index: false,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl ContentRouting for Fixed {
        fn local_peer_id(&self) -> PeerId {
            PeerId::new("stub")
        }

        fn routing_table_size(&self) -> usize {
            42
        }

        async fn provide(&self, _cid: &ContentId) -> Result<(), RoutingError> {
            Err(RoutingError::Provide("no peers".to_string()))
        }

        async fn find_first_provider(&self, _cid: &ContentId) -> Result<PeerId, RoutingError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(self.provider.clone())
        }

        async fn indexer_lookup(&self, _cid: &ContentId) -> Result<IndexerResponse, RoutingError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail_index {
                return Err(RoutingError::Lookup("connection refused".to_string()));
            }
            Ok(self.index.clone())
        }

        fn forget_peer(&self, _peer: &PeerId) {}
    }

    fn agent(routing: impl ContentRouting + 'static) -> Agent {
        Agent::new(
            Arc::new(routing),
            TelemetrySink::noop(),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_dht_empty_provider_is_not_found() {
        let agent = agent(Fixed::empty());
        let cid = ContentId::from_payload(b"x");

        let resp = agent.retrieve(cid.clone(), RoutingStrategy::Dht, None).await;

        assert_eq!(resp.cid, cid);
        assert_eq!(resp.error.as_deref(), Some(NOT_FOUND));
        assert_eq!(resp.outcome(), Outcome::NotFound);
        assert_eq!(resp.routing_table_size, 42);
    }

    #[tokio::test]
    async fn test_indexer_zero_results_is_not_found() {
        let agent = agent(Fixed::empty());
        let resp = agent
            .retrieve(ContentId::from_payload(b"y"), RoutingStrategy::Indexer, None)
            .await;
        assert_eq!(resp.error.as_deref(), Some(NOT_FOUND));
    }

    #[tokio::test]
    async fn test_indexer_failure_is_recorded_not_raised() {
        let agent = agent(Fixed {
            fail_index: true,
            ..Fixed::empty()
        });
        let resp = agent
            .retrieve(ContentId::from_payload(b"z"), RoutingStrategy::Indexer, None)
            .await;
        assert_eq!(resp.outcome(), Outcome::Failed);
        assert!(resp.error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_lookups_bounded_by_timeout() {
        let agent = agent(Fixed {
            hang: true,
            ..Fixed::empty()
        });
        let cid = ContentId::from_payload(b"slow");

        let dht = agent.retrieve(cid.clone(), RoutingStrategy::Dht, None).await;
        assert_eq!(dht.error.as_deref(), Some(NOT_FOUND));
        assert!(dht.duration >= Duration::from_millis(100));

        let index = agent.retrieve(cid, RoutingStrategy::Indexer, None).await;
        assert_eq!(index.outcome(), Outcome::Failed);
        assert!(index.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_provide_failure_is_in_body() {
        let agent = agent(Fixed::empty());
        let resp = agent.provide(b"payload", None).await;
        assert_eq!(resp.cid, ContentId::from_payload(b"payload"));
        assert!(resp.error.unwrap().contains("no peers"));
    }

    #[tokio::test]
    async fn test_found_provider_is_forgotten() {
        let network = MemoryNetwork::new(MemoryNetworkConfig {
            max_lookup_latency: Duration::ZERO,
            ..MemoryNetworkConfig::default()
        });
        let provider = Arc::new(network.join());
        let retriever = Arc::new(network.join());

        let providing = Agent::new(provider.clone(), TelemetrySink::noop(), DEFAULT_LOOKUP_TIMEOUT);
        let retrieving =
            Agent::new(retriever.clone(), TelemetrySink::noop(), DEFAULT_LOOKUP_TIMEOUT);

        let provided = providing.provide(b"round", None).await;
        assert!(provided.error.is_none());

        let resp = retrieving
            .retrieve(provided.cid.clone(), RoutingStrategy::Dht, None)
            .await;
        assert_eq!(resp.outcome(), Outcome::Found);
        assert!(!retriever.knows(&provider.local_peer_id()));
        assert_eq!(retriever.forgotten(), 1);

        // Repeating the lookup is measured again independently.
        let again = retrieving
            .retrieve(provided.cid, RoutingStrategy::Dht, None)
            .await;
        assert_eq!(again.outcome(), Outcome::Found);
        assert_eq!(retriever.forgotten(), 2);
    }

    #[tokio::test]
    async fn test_http_rejects_malformed_requests() {
        let agent = Arc::new(agent(Fixed::empty()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, agent.router()).await.unwrap();
        });

        let client = reqwest::Client::new();
        let bad_cid = client
            .post(format!("http://{addr}/retrieve/not-a-cid"))
            .body(r#"{"routing":"dht"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(bad_cid.status(), reqwest::StatusCode::BAD_REQUEST);

        let cid = ContentId::from_payload(b"ok");
        let bad_body = client
            .post(format!("http://{addr}/retrieve/{cid}"))
            .body(r#"{"routing":"carrier-pigeon"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(bad_body.status(), reqwest::StatusCode::BAD_REQUEST);

        let ok = client
            .post(format!("http://{addr}/retrieve/{cid}"))
            .body(r#"{"routing":"dht"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::OK);
        let body: RetrievalResponse = ok.json().await.unwrap();
        assert_eq!(body.error.as_deref(), Some(NOT_FOUND));
    }
}
