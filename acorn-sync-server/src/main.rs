//! HTTP sync endpoint exposing one schema-less Tree.
//!
//! Routes: `POST /stash` (one nut, LWW), `DELETE /toss/{id}`,
//! `GET /export?since=<RFC3339>`, `POST /import` (batch, per-item outcomes),
//! `GET /health`, `GET /stats`. Backend comes from the environment:
//! `ACORN_DATA_DIR` selects an append-log trunk in that directory, otherwise
//! records live in memory.

use std::net::SocketAddr;

use acorn_core::{AcornResult, ImportOutcome, Nut, Tree};
use acorn_trunk_log::AppendLogTrunk;
use acorn_trunk_mem::MemoryTrunk;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let tree = tree_from_env()?;
    let app = router(tree);

    let addr: SocketAddr = std::env::var("ACORN_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:8080".into())
        .parse()?;
    tracing::info!("acorn-sync-server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn tree_from_env() -> AcornResult<Tree<Value>> {
    match std::env::var("ACORN_DATA_DIR") {
        Ok(dir) => {
            tracing::info!(%dir, "using append-log trunk");
            Tree::open(AppendLogTrunk::open(dir)?)
        }
        Err(_) => {
            tracing::info!("using in-memory trunk");
            Tree::open(MemoryTrunk::new())
        }
    }
}

fn router(tree: Tree<Value>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/stash", post(stash))
        .route("/toss/{id}", delete(toss))
        .route("/export", get(export))
        .route("/import", post(import))
        .layer(TraceLayer::new_for_http())
        .with_state(tree)
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(tree): State<Tree<Value>>) -> Json<acorn_core::TreeStats> {
    Json(tree.stats())
}

#[derive(Debug, serde::Serialize)]
struct StashResponse {
    outcome: ImportOutcome,
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    error: String,
}

type Failure = (StatusCode, Json<ErrorResponse>);

fn internal_error(err: impl std::fmt::Display) -> Failure {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

async fn stash(
    State(tree): State<Tree<Value>>,
    Json(nut): Json<Nut<Value>>,
) -> Result<Json<StashResponse>, Failure> {
    let outcome = tree.import(nut).map_err(internal_error)?;
    Ok(Json(StashResponse { outcome }))
}

async fn toss(
    State(tree): State<Tree<Value>>,
    Path(id): Path<String>,
) -> Result<StatusCode, Failure> {
    tree.toss(&id).map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, serde::Deserialize)]
struct ExportQuery {
    since: Option<String>,
}

async fn export(
    State(tree): State<Tree<Value>>,
    Query(query): Query<ExportQuery>,
) -> Result<Json<Vec<Nut<Value>>>, Failure> {
    let since = match query.since {
        Some(raw) => Some(OffsetDateTime::parse(&raw, &Rfc3339).map_err(|err| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("invalid since timestamp: {err}"),
                }),
            )
        })?),
        None => None,
    };
    let nuts = tree.export_changes_since(since).map_err(internal_error)?;
    Ok(Json(nuts))
}

async fn import(
    State(tree): State<Tree<Value>>,
    Json(nuts): Json<Vec<Nut<Value>>>,
) -> Result<Json<Vec<ImportOutcome>>, Failure> {
    let outcomes = tree.import_batch(nuts).map_err(internal_error)?;
    Ok(Json(outcomes))
}
