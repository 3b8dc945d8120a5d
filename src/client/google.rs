use openidconnect::{core::{CoreAuthErrorResponseType, CoreClient, CoreProviderMetadata, CoreResponseType}, reqwest::async_http_client, AuthenticationFlow, AuthorizationCode, ClientId, ClientSecret, CsrfToken, IssuerUrl, Nonce, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope};
use serde::Deserialize;
use url::Url;

use super::SignInError;

const GOOGLE_ISSUER: &str = "https://accounts.google.com";

// Source: https://www.rfc-editor.org/rfc/rfc6749.html#section-4.1.2
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum CallbackResult {
  Code {
    code: AuthorizationCode
  },
  Error {
    error: CoreAuthErrorResponseType,
    error_description: Option<String>
  }
}
/// Query parameters Google appends to the redirect uri once the consent
/// popup closes.
#[derive(Deserialize, Debug)]
pub struct CallbackParams {
  #[serde(flatten)]
  pub result: CallbackResult,
  pub state: String
}

impl CallbackParams {
  /// Parse the query string of the redirect, without the leading `?`.
  pub fn from_query(query: &str) -> Result<Self, SignInError> {
    serde_urlencoded::from_str(query)
      .map_err(|e| SignInError::Provider(format!("unreadable callback: {e}")))
  }
}

/// Phase one of sign-in: where to send the user, plus what we need to
/// check the answer.
pub struct PendingSignIn {
  pub authorize_url: Url,
  csrf: CsrfToken,
  nonce: Nonce,
  pkce_verifier: PkceCodeVerifier
}

/// A verified Google ID token, ready to be exchanged with Firebase.
#[derive(Debug)]
pub struct GoogleCredential {
  pub id_token: String,
  pub email: Option<String>
}

/// Google OpenID Connect client for the consent flow.
pub struct GoogleSignIn {
  client: CoreClient
}

impl GoogleSignIn {
  /// Fetch Google's discovery document and set up the client.
  pub async fn discover(
    client_id: String,
    client_secret: Option<String>,
    redirect_url: String
  ) -> Result<Self, SignInError> {
    let provider_metadata = CoreProviderMetadata::discover_async(
      IssuerUrl::new(GOOGLE_ISSUER.to_string())?,
      async_http_client
    ).await?;

    Ok(GoogleSignIn {
      client: CoreClient::from_provider_metadata(
        provider_metadata,
        ClientId::new(client_id),
        client_secret.map(ClientSecret::new)
      )
      .set_redirect_uri(RedirectUrl::new(redirect_url)?)
    })
  }

  /// Build the consent url to open in a popup or redirect.
  pub fn begin(&self) -> PendingSignIn {
    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let (authorize_url, csrf, nonce) = self.client
      .authorize_url(
        AuthenticationFlow::<CoreResponseType>::AuthorizationCode,
        CsrfToken::new_random,
        Nonce::new_random
      )
      .add_scope(Scope::new("email".to_string()))
      .add_scope(Scope::new("profile".to_string()))
      .set_pkce_challenge(pkce_challenge)
      .url();

    PendingSignIn { authorize_url, csrf, nonce, pkce_verifier }
  }

  /// Phase two: turn the redirect parameters into a verified Google ID
  /// token.
  pub async fn complete(
    &self,
    pending: PendingSignIn,
    callback: CallbackParams
  ) -> Result<GoogleCredential, SignInError> {
    let PendingSignIn { csrf, nonce, pkce_verifier, .. } = pending;

    let code = authorization_code(&csrf, callback)?;

    let response = self.client
      .exchange_code(code)
      .set_pkce_verifier(pkce_verifier)
      .request_async(async_http_client)
      .await?;

    let Some(id_token) = response.extra_fields().id_token() else {
      return Err(SignInError::MissingIdToken)
    };

    let claims = id_token.claims(&self.client.id_token_verifier(), &nonce)?;

    Ok(GoogleCredential {
      id_token: id_token.to_string(),
      email: claims.email().map(|e| e.to_string())
    })
  }
}

/// Check the callback belongs to our request and pull out the code.
fn authorization_code(
  csrf: &CsrfToken,
  CallbackParams { result, state }: CallbackParams
) -> Result<AuthorizationCode, SignInError> {
  if state != *csrf.secret() {
    return Err(SignInError::StateMismatch)
  }

  match result {
    CallbackResult::Code { code } => Ok(code),
    CallbackResult::Error { error: CoreAuthErrorResponseType::AccessDenied, .. } =>
      Err(SignInError::UserCancelled),
    CallbackResult::Error { error, error_description } => Err(SignInError::Provider(
      match error_description {
        Some(desc) => format!("{}: {desc}", error.as_ref()),
        None => error.as_ref().to_string()
      }
    ))
  }
}
