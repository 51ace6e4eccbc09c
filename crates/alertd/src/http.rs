//! The HTTP inspection API: four read-only routes over the
//! Alert Log and the overlay's connected-peer gauge.

use alertd_core::{codec, AlertStore, StoreError};
use alertd_net::ConnectedPeers;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AlertStore>,
    pub connected: ConnectedPeers,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/alerts", get(alerts))
        .route("/alert/:sequence", get(alert_by_sequence))
        .route("/peers", get(peers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    latest_sequence: u32,
    synced: bool,
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.latest().await {
        Ok(row) => Json(HealthResponse {
            latest_sequence: row.sequence,
            synced: state.connected.is_connected(),
        })
        .into_response(),
        Err(StoreError::NotFound(_)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "genesis not yet bootstrapped").into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Serialize)]
struct AlertsResponse {
    latest_sequence: u32,
    alerts: Vec<ParsedAlert>,
}

#[derive(Serialize)]
struct ParsedAlert {
    sequence: u32,
    hash: String,
    alert_type: u32,
    processed: bool,
}

async fn alerts(State(state): State<AppState>) -> Response {
    let latest = match state.store.latest().await {
        Ok(row) => row.sequence,
        Err(StoreError::NotFound(_)) => {
            return Json(AlertsResponse {
                latest_sequence: 0,
                alerts: vec![],
            })
            .into_response()
        }
        Err(e) => return internal_error(e),
    };

    let mut out = Vec::with_capacity(latest as usize + 1);
    for seq in 0..=latest {
        match state.store.get_by_sequence(seq).await {
            Ok(row) => {
                let alert_type = hex::decode(&row.raw)
                    .ok()
                    .and_then(|raw| codec::decode(&raw).ok())
                    .map(|env| env.payload.alert_type().as_u32())
                    .unwrap_or_default();
                out.push(ParsedAlert {
                    sequence: row.sequence,
                    hash: row.hash,
                    alert_type,
                    processed: row.processed,
                });
            }
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => return internal_error(e),
        }
    }

    Json(AlertsResponse {
        latest_sequence: latest,
        alerts: out,
    })
    .into_response()
}

async fn alert_by_sequence(State(state): State<AppState>, Path(sequence): Path<String>) -> Response {
    let sequence: u32 = match sequence.parse() {
        Ok(n) => n,
        Err(_) => return (StatusCode::BAD_REQUEST, "sequence must be a non-negative integer").into_response(),
    };

    match state.store.get_by_sequence(sequence).await {
        Ok(row) => {
            let raw = match hex::decode(&row.raw) {
                Ok(bytes) => bytes,
                Err(_) => return internal_error_msg("stored raw alert is not valid hex"),
            };
            match codec::decode(&raw) {
                Ok(envelope) => Json(envelope).into_response(),
                Err(_) => internal_error_msg("stored alert failed to decode"),
            }
        }
        Err(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, "unknown sequence").into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Serialize)]
struct PeersResponse {
    connected_count: usize,
}

async fn peers(State(state): State<AppState>) -> Response {
    Json(PeersResponse {
        connected_count: state.connected.load(),
    })
    .into_response()
}

fn internal_error(e: StoreError) -> Response {
    tracing::error!(error = %e, "http: internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn internal_error_msg(msg: &'static str) -> Response {
    tracing::error!(msg, "http: internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
}
