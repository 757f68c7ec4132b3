//! MinIO webhook target.
//!
//! Deliveries are acknowledged as soon as they are queued; profiling runs in
//! background tasks so MinIO never waits on raster decoding. A full backlog
//! answers 503 and MinIO redelivers later.

use crate::{errors::AppError, services::minio_events, state::AppState};
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub accepted: usize,
    pub ignored: usize,
}

/// Check the `Authorization` header against the configured token.
///
/// MinIO sends `Bearer <token>`; older releases send the bare token.
pub fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    let presented = presented.map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim());

    match presented {
        Some(token) if tokens_match(token, expected) => Ok(()),
        Some(_) => Err(AppError::unauthorized("invalid authorization token")),
        None => Err(AppError::unauthorized("missing authorization token")),
    }
}

/// Constant-time comparison over fixed-length digests, so neither the token
/// contents nor its length leak through response timing.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let presented = md5::compute(presented.as_bytes());
    let expected = md5::compute(expected.as_bytes());
    presented.0[..].ct_eq(&expected.0[..]).into()
}

/// `POST /webhook` (and `POST /`)
pub async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &headers)?;

    if body.iter().all(u8::is_ascii_whitespace) {
        debug!("empty webhook delivery");
        return Ok((
            StatusCode::ACCEPTED,
            Json(WebhookAck {
                accepted: 0,
                ignored: 0,
            }),
        ));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::bad_request(format!("invalid webhook payload: {}", err)))?;

    let parsed = minio_events::parse_payload(payload);
    let mut ignored = parsed.ignored;
    let accepted: Vec<_> = parsed
        .events
        .into_iter()
        .filter(|event| match state.events.skip_reason(event) {
            Some(reason) => {
                debug!(bucket = %event.bucket, key = %event.key, ?reason, "ignoring object event");
                ignored += 1;
                false
            }
            None => true,
        })
        .collect();

    let ack = WebhookAck {
        accepted: accepted.len(),
        ignored,
    };
    if !accepted.is_empty() {
        info!(accepted = ack.accepted, ignored = ack.ignored, "webhook delivery received");
        state.events.dispatch(accepted)?;
    }

    Ok((StatusCode::ACCEPTED, Json(ack)))
}
