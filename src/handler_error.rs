use std::io;

use surrealdb_jsonwebtoken::errors::Error as JwtError;
use worker::{kv::KvError, send::SendWrapper};

/// Failures talking to the collaborators behind the gate: KV, the
/// Google key endpoint, the OAuth token endpoint and Firestore.
/// None of these are ever shown to the caller.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub enum HandlerError {
  // Storage
  Kv(SendWrapper<KvError>),
  CborSerialize(#[from] ciborium::ser::Error<io::Error>),
  CborDeserialize(#[from] ciborium::de::Error<io::Error>),
  // Parse JSON documents
  JsonDeserialize(#[from] serde_json::Error),
  // Outbound HTTP
  ParseUrl(#[from] url::ParseError),
  Http(#[from] reqwest::Error),
  #[error("{url} responded with HTTP {status}")]
  HttpStatus {
    url: String,
    status: u16
  },
  // Service account OAuth assertion
  JwtServiceAccount(#[from] JwtError)
}

/// Convert KvError to HandlerError
impl From<KvError> for HandlerError {
  fn from(err: KvError) -> Self {
    HandlerError::Kv(SendWrapper::new(err))
  }
}

/// Fail on non-2xx responses, keeping the url for the logs.
pub fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HandlerError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response)
  }

  Err(HandlerError::HttpStatus {
    url: response.url().to_string(),
    status: status.as_u16()
  })
}
