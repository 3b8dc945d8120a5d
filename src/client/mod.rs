mod firebase;
mod google;
mod verify;

use openidconnect::{core::CoreRequestTokenError, reqwest::AsyncHttpClientError, ClaimsVerificationError, DiscoveryError};

pub use firebase::{FirebaseAuth, FirebaseUser};
pub use google::{CallbackParams, CallbackResult, GoogleCredential, GoogleSignIn, PendingSignIn};
pub use verify::{UserAction, VerifyClient, VerifyError};

#[derive(thiserror::Error, Debug)]
pub enum SignInError {
  #[error("Sign-in was cancelled.")]
  UserCancelled,
  #[error("Identity provider error: {0}")]
  Provider(String),
  #[error("Callback state does not match the pending sign-in.")]
  StateMismatch,
  #[error("Session expired, sign in again.")]
  SessionExpired,
  // OIDC Client
  #[error(transparent)]
  Discovery(#[from] DiscoveryError<AsyncHttpClientError>),
  #[error(transparent)]
  ParseUrl(#[from] url::ParseError),
  #[error(transparent)]
  GoogleToken(#[from] CoreRequestTokenError<AsyncHttpClientError>),
  #[error("Google Oauth response did not contain an id_token.")]
  MissingIdToken,
  #[error(transparent)]
  InvalidClaims(#[from] ClaimsVerificationError),
  // Firebase REST
  #[error(transparent)]
  Http(#[from] reqwest::Error)
}

/// A signed-in user that can mint an identity assertion on demand.
pub trait Identity {
  fn id_token(&self) -> Result<String, SignInError>;
}

/// Google consent followed by Firebase sign-in.
///
/// Sign-in is two-phase. [`SignInInitiator::begin`] returns the consent url
/// for the embedding app to open; once the provider redirects back,
/// [`SignInInitiator::finish`] turns the redirect parameters into a
/// [`FirebaseUser`] whose token goes to `POST /api/verify`.
pub struct SignInInitiator {
  google: GoogleSignIn,
  firebase: FirebaseAuth
}

impl SignInInitiator {
  pub fn new(google: GoogleSignIn, firebase: FirebaseAuth) -> Self {
    SignInInitiator { google, firebase }
  }

  /// Start a sign-in; open `authorize_url` of the result for the user.
  pub fn begin(&self) -> PendingSignIn {
    self.google.begin()
  }

  /// Finish a sign-in with the parameters Google redirected back with.
  pub async fn finish(
    &self,
    pending: PendingSignIn,
    callback: CallbackParams
  ) -> Result<FirebaseUser, SignInError> {
    let credential = self.google.complete(pending, callback).await?;
    tracing::debug!(email = ?credential.email, "google consent complete");

    self.firebase.sign_in_with_google(&credential).await
  }
}
