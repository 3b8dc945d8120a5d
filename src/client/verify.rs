use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{Identity, SignInError};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
  id_token: &'a str
}

#[derive(Deserialize)]
struct VerifyResponse {
  ok: bool
}

/// What the user should be told after a failed verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserAction {
  /// "Please sign in again"
  SignInAgain,
  /// "Try again"
  TryAgain
}

/// Every non-2xx response body is kept as detail.
#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
  #[error("malformed verification request: {0}")]
  MalformedRequest(String),
  #[error("identity token was rejected: {0}")]
  InvalidAssertion(String),
  #[error("not allowed: {0}")]
  Forbidden(String),
  #[error("verification failed with HTTP {status}: {body}")]
  UnexpectedStatus {
    status: u16,
    body: String
  },
  #[error(transparent)]
  Http(#[from] reqwest::Error),
  #[error(transparent)]
  SignIn(#[from] SignInError)
}

impl VerifyError {
  pub fn user_action(&self) -> UserAction {
    match self {
      VerifyError::InvalidAssertion(_)
        | VerifyError::Forbidden(_)
        | VerifyError::SignIn(_) => UserAction::SignInAgain,
      VerifyError::MalformedRequest(_)
        | VerifyError::UnexpectedStatus { .. }
        | VerifyError::Http(_) => UserAction::TryAgain
    }
  }
}

/// Submits identity tokens to the server's verification endpoint.
pub struct VerifyClient {
  endpoint: Url,
  client: Client
}

impl VerifyClient {
  /// `endpoint` is the full url of `POST /api/verify`.
  pub fn new(endpoint: Url) -> Self {
    VerifyClient { endpoint, client: Client::new() }
  }

  /// Mint a fresh token from `identity` and ask the server whether it's
  /// allowed in.
  pub async fn submit_for_verification(
    &self,
    identity: &impl Identity
  ) -> Result<(), VerifyError> {
    let id_token = identity.id_token()?;

    let response = self.client
      .post(self.endpoint.clone())
      .json(&VerifyRequest { id_token: &id_token })
      .send()
      .await?;

    let status = response.status().as_u16();
    let body = response.text().await?;

    classify(status, body)
  }
}

fn classify(status: u16, body: String) -> Result<(), VerifyError> {
  match status {
    200..=299 => match serde_json::from_str::<VerifyResponse>(&body) {
      Ok(VerifyResponse { ok: true }) => Ok(()),
      _ => Err(VerifyError::UnexpectedStatus { status, body })
    },
    400 => Err(VerifyError::MalformedRequest(body)),
    401 => Err(VerifyError::InvalidAssertion(body)),
    403 => Err(VerifyError::Forbidden(body)),
    _ => Err(VerifyError::UnexpectedStatus { status, body })
  }
}
