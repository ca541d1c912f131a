//! HTTP front door for the replicated KV service.
//!
//! Each request is proposed straight into the consensus engine from the
//! handler that carries it and then waits for the log index the proposal
//! was promised. The response tells the client which of the engine's
//! states it hit: committed and applied, refused because this node is not
//! the leader (try another node), superseded because leadership moved
//! before the entry committed (the command may or may not ever commit —
//! retry only if it is idempotent), or simply not committed in time.
//!
//! `PUT /kv/{key}?expect=old` turns the write into a conditional one that
//! is checked at its log position. `GET /status` reports the node's term
//! and role.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::kv::{KvCommand, KvResult};
use crate::server::{NodeService, Outcome, Proposal};

/// How long to wait for a proposal's index to commit before giving up.
const COMMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the HTTP listener on a background thread.
pub fn start(addr: SocketAddr, service: Arc<NodeService>) {
    thread::spawn(move || match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(serve(addr, service)),
        Err(e) => error!(error = %e, "client api: tokio runtime failed to start"),
    });
}

async fn serve(addr: SocketAddr, service: Arc<NodeService>) {
    let app = Router::new()
        .route("/kv/{key}", get(read).put(write).delete(remove))
        .route("/status", get(status))
        .with_state(service);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "client api: bind failed");
            return;
        }
    };

    info!(%addr, "client api listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "client api: server error");
    }
}

#[derive(Serialize)]
struct Status {
    term: u64,
    leader: bool,
}

async fn status(State(service): State<Arc<NodeService>>) -> Json<Status> {
    let (term, leader) = service.status();
    Json(Status {
        term: term.get(),
        leader,
    })
}

async fn read(
    State(service): State<Arc<NodeService>>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    propose(service, KvCommand::Get { key }).await
}

#[derive(Deserialize)]
struct WriteParams {
    /// Present: only write if the key currently holds this value.
    expect: Option<String>,
}

async fn write(
    State(service): State<Arc<NodeService>>,
    Path(key): Path<String>,
    Query(params): Query<WriteParams>,
    body: Bytes,
) -> (StatusCode, String) {
    let value = String::from_utf8_lossy(&body).into_owned();
    let command = match params.expect {
        Some(expect) => KvCommand::SetIf {
            key,
            expect: Some(expect),
            value,
        },
        None => KvCommand::Set { key, value },
    };
    propose(service, command).await
}

async fn remove(
    State(service): State<Arc<NodeService>>,
    Path(key): Path<String>,
) -> (StatusCode, String) {
    propose(service, KvCommand::Delete { key }).await
}

/// Propose the command and wait out its promised log index.
async fn propose(service: Arc<NodeService>, command: KvCommand) -> (StatusCode, String) {
    match service.propose(command) {
        Proposal::NotLeader { term } => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("not the leader in term {}", term.get()),
        ),
        Proposal::Accepted {
            index,
            term,
            outcome,
        } => {
            debug!(
                index = index.get(),
                term = term.get(),
                "awaiting commit for client request"
            );
            match tokio::time::timeout(COMMIT_TIMEOUT, outcome).await {
                Ok(Ok(Outcome::Applied(result))) => render(result),
                Ok(Ok(Outcome::Superseded)) => (
                    StatusCode::CONFLICT,
                    format!("leadership changed before index {} committed", index.get()),
                ),
                Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "shutting down".into()),
                Err(_) => (
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("index {} did not commit in time", index.get()),
                ),
            }
        }
    }
}

fn render(result: KvResult) -> (StatusCode, String) {
    match result {
        KvResult::Written { revision } => (StatusCode::OK, format!("ok r{revision}")),
        KvResult::Value { value: Some(v), .. } => (StatusCode::OK, v),
        KvResult::Value { value: None, .. } => (StatusCode::NOT_FOUND, String::new()),
        KvResult::Conflict { actual: Some(v) } => (
            StatusCode::PRECONDITION_FAILED,
            format!("expectation failed, value is '{v}'"),
        ),
        KvResult::Conflict { actual: None } => (
            StatusCode::PRECONDITION_FAILED,
            "expectation failed, key is absent".into(),
        ),
    }
}
