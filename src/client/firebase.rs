use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{google::GoogleCredential, Identity, SignInError};

// Source: https://cloud.google.com/identity-platform/docs/reference/rest/v1/accounts/signInWithIdp
const SIGN_IN_WITH_IDP_URL: &str = "https://identitytoolkit.googleapis.com/v1/accounts:signInWithIdp";
const GOOGLE_PROVIDER_ID: &str = "google.com";
/// Stop handing out a token this long before it expires so it's still
/// valid when the server checks it.
const EXPIRY_MARGIN_SECONDS: i64 = 30;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpRequest<'a> {
  post_body: String,
  request_uri: &'a str,
  return_secure_token: bool,
  return_idp_credential: bool
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpResponse {
  id_token: String,
  local_id: String,
  email: Option<String>,
  // seconds, as a string
  expires_in: String
}

#[derive(Deserialize)]
struct ApiErrorResponse {
  error: ApiError
}
#[derive(Deserialize)]
struct ApiError {
  message: String
}

/// Firebase Authentication REST client for one web app.
pub struct FirebaseAuth {
  api_key: String,
  request_uri: String,
  client: Client
}

impl FirebaseAuth {
  /// `request_uri` is the app origin registered with the project.
  pub fn new(api_key: String, request_uri: String) -> Self {
    FirebaseAuth { api_key, request_uri, client: Client::new() }
  }

  /// Sign the Google user into the Firebase project.
  pub async fn sign_in_with_google(
    &self,
    credential: &GoogleCredential
  ) -> Result<FirebaseUser, SignInError> {
    let url = Url::parse_with_params(SIGN_IN_WITH_IDP_URL, &[("key", &self.api_key)])?;

    let response = self.client
      .post(url)
      .json(&SignInWithIdpRequest {
        post_body: google_post_body(&credential.id_token)?,
        request_uri: &self.request_uri,
        return_secure_token: true,
        return_idp_credential: false
      })
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let message = response.json::<ApiErrorResponse>()
        .await
        .map(|e| e.error.message)
        .unwrap_or_else(|_| status.to_string());
      return Err(SignInError::Provider(message))
    }

    FirebaseUser::from_response(response.json().await?, Utc::now())
  }
}

fn google_post_body(id_token: &str) -> Result<String, SignInError> {
  serde_urlencoded::to_string([
    ("id_token", id_token),
    ("providerId", GOOGLE_PROVIDER_ID)
  ]).map_err(|e| SignInError::Provider(e.to_string()))
}

/// A user signed into Firebase. Holds the ID token Firebase minted at
/// sign-in; there is no refresh, so once it lapses the user signs in again.
#[derive(Debug)]
pub struct FirebaseUser {
  pub uid: String,
  pub email: Option<String>,
  id_token: String,
  expires_at: DateTime<Utc>
}

impl FirebaseUser {
  fn from_response(
    response: SignInWithIdpResponse,
    now: DateTime<Utc>
  ) -> Result<Self, SignInError> {
    let expires_in = response.expires_in
      .parse::<i64>()
      .map_err(|_| SignInError::Provider(format!(
        r#"unexpected expiresIn "{}""#,
        response.expires_in
      )))?;

    Ok(FirebaseUser {
      uid: response.local_id,
      email: response.email,
      id_token: response.id_token,
      expires_at: now + Duration::seconds(expires_in)
    })
  }

  pub fn expires_at(&self) -> DateTime<Utc> {
    self.expires_at
  }

  fn id_token_at(&self, now: DateTime<Utc>) -> Result<String, SignInError> {
    if now + Duration::seconds(EXPIRY_MARGIN_SECONDS) >= self.expires_at {
      return Err(SignInError::SessionExpired)
    }
    Ok(self.id_token.clone())
  }
}

impl Identity for FirebaseUser {
  fn id_token(&self) -> Result<String, SignInError> {
    self.id_token_at(Utc::now())
  }
}
