use std::{future::Future, sync::Arc, time::Duration};

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use futures_util::future::{self, BoxFuture, Either};
use serde_json::{json, Value};

use crate::{allow_list::AllowListSource, consts::NO_STORE_HEADER, verifier::{TokenVerifier, VerificationError, VerifiedClaims}};

/// Request body field carrying the assertion.
pub const ID_TOKEN_FIELD: &str = "idToken";

/// Returns a future that completes after the given duration. Supplied by
/// the runtime so the gate works both in a worker and under tokio.
pub type Sleep = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Outcome of a single verification request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
  /// Body missing, not JSON, or without a string `idToken`.
  MalformedRequest,
  /// The assertion failed verification. Says nothing about why.
  InvalidAssertion,
  /// Verified identity that isn't on the allow-list.
  Forbidden,
  Authorized,
  /// The key service or allow-list store failed, or verification timed out.
  ServiceUnavailable
}

impl Decision {
  pub fn status(self) -> StatusCode {
    match self {
      Decision::MalformedRequest => StatusCode::BAD_REQUEST,
      Decision::InvalidAssertion => StatusCode::UNAUTHORIZED,
      Decision::Forbidden => StatusCode::FORBIDDEN,
      Decision::Authorized => StatusCode::OK,
      Decision::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE
    }
  }

  fn message(self) -> &'static str {
    match self {
      Decision::MalformedRequest => "Missing token",
      Decision::InvalidAssertion => "Invalid token",
      Decision::Forbidden => "Forbidden",
      Decision::Authorized => "ok",
      Decision::ServiceUnavailable => "Service unavailable"
    }
  }
}

impl IntoResponse for Decision {
  fn into_response(self) -> Response {
    match self {
      Decision::Authorized => (
        self.status(),
        Json(json!({ "ok": true }))
      ).into_response(),
      _ => (
        self.status(),
        NO_STORE_HEADER,
        self.message()
      ).into_response()
    }
  }
}

/// Decides whether the holder of an identity assertion is allowed in.
///
/// Per request: parse the body, verify the assertion, extract the email
/// claim, load the allow-list, check membership. Nothing inside the
/// assertion is trusted until the verifier accepts it, and every failure
/// path denies.
pub struct Gate {
  verifier: Arc<dyn TokenVerifier>,
  allow_list: Arc<dyn AllowListSource>,
  timeout: Option<(Duration, Sleep)>
}

impl Gate {
  pub fn new(
    verifier: Arc<dyn TokenVerifier>,
    allow_list: Arc<dyn AllowListSource>
  ) -> Self {
    Gate { verifier, allow_list, timeout: None }
  }

  /// Bound the verification call and the allow-list load, each on its own.
  /// Running out of time is a service failure, never an authorization.
  pub fn with_timeout(mut self, limit: Duration, sleep: Sleep) -> Self {
    self.timeout = Some((limit, sleep));
    self
  }

  pub async fn decide(&self, body: &[u8]) -> Decision {
    let Some(id_token) = parse_id_token(body) else {
      tracing::debug!("request has no {ID_TOKEN_FIELD}");
      return Decision::MalformedRequest
    };

    let claims = match self.verify(id_token.as_str()).await {
      Ok(claims) => claims,
      Err(e) if e.is_unavailable() => {
        tracing::error!(error = %e, "could not verify token");
        return Decision::ServiceUnavailable
      },
      Err(e) => {
        tracing::warn!(reason = %e, "rejected token");
        return Decision::InvalidAssertion
      }
    };

    let email = claims.email();

    let allow_list = match self.within_limit(self.allow_list.load()).await {
      Ok(Ok(allow_list)) => allow_list,
      Ok(Err(e)) => {
        // fail closed
        tracing::error!(error = %e, "could not load allow-list");
        return Decision::ServiceUnavailable
      },
      Err(limit) => {
        tracing::error!(?limit, "allow-list load timed out");
        return Decision::ServiceUnavailable
      }
    };

    if allow_list.is_empty() {
      tracing::warn!("allow-list is empty, denying everyone");
    }

    let subject = claims.subject();
    let email_verified = claims.email_verified();

    if !allow_list.contains(email) {
      tracing::info!(subject, email, email_verified, "identity not on allow-list");
      return Decision::Forbidden
    }

    tracing::info!(
      subject,
      email,
      email_verified,
      issued_at = %claims.issued_at(),
      expires_at = %claims.expires_at(),
      "authorized"
    );
    Decision::Authorized
  }

  async fn verify(&self, id_token: &str) -> Result<VerifiedClaims, VerificationError> {
    self.within_limit(self.verifier.verify(id_token))
      .await
      .unwrap_or_else(|limit| Err(VerificationError::TimedOut(limit)))
  }

  /// Run `work` under the configured limit. `Err` carries the limit when
  /// it ran out.
  async fn within_limit<F>(&self, work: F) -> Result<F::Output, Duration>
  where
    F: Future + Unpin
  {
    let Some((limit, sleep)) = &self.timeout else {
      return Ok(work.await)
    };

    match future::select(work, sleep(*limit)).await {
      Either::Left((output, _)) => Ok(output),
      Either::Right(((), _)) => Err(*limit)
    }
  }
}

/// The assertion from a `{"idToken": "<jwt>"}` body. Anything else,
/// including an empty string, is a malformed request.
pub fn parse_id_token(body: &[u8]) -> Option<String> {
  let body: Value = serde_json::from_slice(body).ok()?;

  body.get(ID_TOKEN_FIELD)?
    .as_str()
    .filter(|token| !token.is_empty())
    .map(str::to_string)
}
