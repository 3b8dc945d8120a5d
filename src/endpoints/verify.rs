use std::sync::Arc;

use axum::{body::Bytes, extract::State, response::{IntoResponse, Response}};
use tracing::Instrument;

use crate::{gate::Gate, telemetry::new_request_id};

/// Axum handler function for the `/api/verify` endpoint.
///
/// Body: `{ "idToken": "<Firebase ID token>" }`. The raw body is taken so a
/// missing or mistyped field is answered with 400 instead of axum's own
/// JSON rejections.
pub async fn verify(
  State(gate): State<Arc<Gate>>,
  body: Bytes
) -> Response {
  let span = tracing::info_span!("verify", request_id = %new_request_id());

  gate.decide(&body)
    .instrument(span)
    .await
    .into_response()
}
