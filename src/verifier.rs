use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{header::CACHE_CONTROL, Client};
use serde::{Deserialize, Serialize};
use surrealdb_jsonwebtoken::{decode, decode_header, errors::{Error as JwtError, ErrorKind}, Algorithm, DecodingKey, Validation};
use worker::{kv::KvStore, send::SendFuture, Env};

use crate::{consts::{KEY_SECURETOKEN_JWKS, KV_CACHE, SECURETOKEN_ISSUER_PREFIX, SECURETOKEN_JWKS_URL}, handler_error::{check_status, HandlerError}, state::{kv_get, kv_put}};

/// Used when Google omits `Cache-Control: max-age` from the key response.
const DEFAULT_JWKS_TTL_SECONDS: i64 = 3600;
/// Firebase rejects subjects longer than this.
const MAX_SUBJECT_LEN: usize = 128;

/// Why an assertion was rejected. Only ever logged, never returned to
/// the caller.
#[derive(thiserror::Error, Debug)]
pub enum VerificationError {
  #[error("token is not a well-formed JWT: {0}")]
  Malformed(JwtError),
  #[error("token is signed with {0:?}, expected RS256")]
  UnsupportedAlgorithm(Algorithm),
  #[error("token header has no kid")]
  MissingKeyId,
  #[error(r#"no public key with kid "{0}""#)]
  UnknownKeyId(String),
  #[error("signature does not match")]
  InvalidSignature,
  #[error("token has expired")]
  Expired,
  #[error("token was issued in the future")]
  IssuedInFuture,
  #[error("audience does not match the project")]
  InvalidAudience,
  #[error("issuer does not match the project")]
  InvalidIssuer,
  #[error("subject is empty or too long")]
  InvalidSubject,
  #[error("token rejected: {0}")]
  Rejected(JwtError),
  // Not the caller's fault: keys could not be fetched or the check timed out.
  #[error("public keys unavailable: {0}")]
  KeysUnavailable(#[source] HandlerError),
  #[error("verification timed out after {0:?}")]
  TimedOut(std::time::Duration)
}

impl VerificationError {
  /// True when the verification service itself failed rather than the
  /// assertion.
  pub fn is_unavailable(&self) -> bool {
    matches!(
      self,
      VerificationError::KeysUnavailable(_) | VerificationError::TimedOut(_)
    )
  }
}

impl From<JwtError> for VerificationError {
  fn from(err: JwtError) -> Self {
    match err.kind() {
      ErrorKind::InvalidSignature => return VerificationError::InvalidSignature,
      ErrorKind::ExpiredSignature => return VerificationError::Expired,
      ErrorKind::ImmatureSignature => return VerificationError::IssuedInFuture,
      ErrorKind::InvalidAudience => return VerificationError::InvalidAudience,
      ErrorKind::InvalidIssuer => return VerificationError::InvalidIssuer,
      ErrorKind::InvalidSubject => return VerificationError::InvalidSubject,
      _ => ()
    }

    let malformed = matches!(
      err.kind(),
      ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
    );

    if malformed {
      VerificationError::Malformed(err)
    } else {
      VerificationError::Rejected(err)
    }
  }
}

/// The decoded payload of an assertion that passed verification.
/// Only verifiers construct it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedClaims {
  subject: String,
  email: Option<String>,
  email_verified: bool,
  issued_at: DateTime<Utc>,
  expires_at: DateTime<Utc>
}

impl VerifiedClaims {
  pub(crate) fn new(
    subject: String,
    email: Option<String>,
    email_verified: bool,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>
  ) -> Self {
    VerifiedClaims { subject, email, email_verified, issued_at, expires_at }
  }

  pub fn subject(&self) -> &str {
    &self.subject
  }

  /// The email claim, or `""` when the token carries none.
  pub fn email(&self) -> &str {
    self.email.as_deref().unwrap_or_default()
  }

  pub fn email_verified(&self) -> bool {
    self.email_verified
  }

  pub fn issued_at(&self) -> DateTime<Utc> {
    self.issued_at
  }

  pub fn expires_at(&self) -> DateTime<Utc> {
    self.expires_at
  }
}

/// Identity verification service.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
  async fn verify(&self, id_token: &str) -> Result<VerifiedClaims, VerificationError>;
}

// ---------- PUBLIC KEYS ----------

/// Source: https://www.rfc-editor.org/rfc/rfc7517#section-4
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
  pub kid: String,
  pub kty: String,
  #[serde(default)]
  pub alg: Option<String>,
  pub n: String,
  pub e: String
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
  pub keys: Vec<Jwk>
}

impl JwkSet {
  pub fn find(&self, kid: &str) -> Option<&Jwk> {
    self.keys.iter().find(|k| k.kid == kid)
  }
}

/// Where the current Google signing keys come from.
#[async_trait]
pub trait KeySource: Send + Sync {
  async fn keys(&self) -> Result<JwkSet, HandlerError>;
}

/// Somewhere to keep a fetched key set until it goes stale.
#[async_trait]
pub trait KeyCache: Send + Sync {
  async fn get(&self) -> Result<Option<JwkSet>, HandlerError>;
  async fn put(&self, jwks: &JwkSet, ttl: Duration) -> Result<(), HandlerError>;
}

/// Fetches the current key set and how long it may be cached for.
#[async_trait]
pub trait KeyFetch: Send + Sync {
  async fn fetch(&self) -> Result<(JwkSet, Duration), HandlerError>;
}

/// Serves keys from the cache, re-fetching once they expire.
pub struct CachedKeys<C, F> {
  cache: C,
  fetch: F
}

impl<C: KeyCache, F: KeyFetch> CachedKeys<C, F> {
  pub fn new(cache: C, fetch: F) -> Self {
    CachedKeys { cache, fetch }
  }
}

#[async_trait]
impl<C: KeyCache, F: KeyFetch> KeySource for CachedKeys<C, F> {
  async fn keys(&self) -> Result<JwkSet, HandlerError> {
    if let Some(jwks) = self.cache.get().await? {
      return Ok(jwks)
    }

    // re-cache the key set
    let (jwks, ttl) = self.fetch.fetch().await?;
    self.cache.put(&jwks, ttl).await?;

    Ok(jwks)
  }
}

/// `KEY_SECURETOKEN_JWKS` in the `KV_CACHE` store.
pub struct KvKeyCache {
  env: Env
}

impl KvKeyCache {
  pub fn new(env: Env) -> Self {
    KvKeyCache { env }
  }
}

#[async_trait]
impl KeyCache for KvKeyCache {
  async fn get(&self) -> Result<Option<JwkSet>, HandlerError> {
    let env = self.env.clone();

    SendFuture::new(async move {
      let kv = KvStore::from_this(&env, KV_CACHE)?;
      kv_get(&kv, KEY_SECURETOKEN_JWKS).await
    }).await
  }

  async fn put(&self, jwks: &JwkSet, ttl: Duration) -> Result<(), HandlerError> {
    let env = self.env.clone();
    let jwks = jwks.clone();

    SendFuture::new(async move {
      let kv = KvStore::from_this(&env, KV_CACHE)?;
      kv_put(&kv, KEY_SECURETOKEN_JWKS, &jwks, ttl).await
    }).await
  }
}

/// Google's securetoken keys, good for as long as Google's
/// `Cache-Control` says.
pub struct SecureTokenKeys;

#[async_trait]
impl KeyFetch for SecureTokenKeys {
  async fn fetch(&self) -> Result<(JwkSet, Duration), HandlerError> {
    SendFuture::new(async move {
      tracing::debug!("fetching securetoken public keys");

      let response = check_status(
        Client::new()
          .get(SECURETOKEN_JWKS_URL)
          .send()
          .await?
      )?;

      let ttl = cache_max_age(
        response.headers()
          .get(CACHE_CONTROL)
          .and_then(|v| v.to_str().ok())
      ).unwrap_or_else(|| Duration::seconds(DEFAULT_JWKS_TTL_SECONDS));

      Ok((response.json().await?, ttl))
    }).await
  }
}

/// Extract `max-age` from a `Cache-Control` header value.
pub fn cache_max_age(cache_control: Option<&str>) -> Option<Duration> {
  cache_control?
    .split(',')
    .filter_map(|directive| directive.trim().strip_prefix("max-age="))
    .find_map(|secs| secs.trim_matches('"').parse::<i64>().ok())
    .filter(|secs| *secs > 0)
    .map(Duration::seconds)
}

// ---------- FIREBASE ----------

/// Source: https://firebase.google.com/docs/auth/admin/verify-id-tokens#verify_id_tokens_using_a_third-party_jwt_library
#[derive(Deserialize)]
struct FirebaseIdClaims {
  sub: String,
  iat: i64,
  exp: i64,
  auth_time: Option<i64>,
  email: Option<String>,
  #[serde(default)]
  email_verified: bool
}

/// Verifies Firebase ID tokens issued for one project.
pub struct FirebaseVerifier<K> {
  project_id: String,
  keys: K
}

impl<K: KeySource> FirebaseVerifier<K> {
  pub fn new(project_id: impl Into<String>, keys: K) -> Self {
    FirebaseVerifier { project_id: project_id.into(), keys }
  }
}

#[async_trait]
impl<K: KeySource> TokenVerifier for FirebaseVerifier<K> {
  async fn verify(&self, id_token: &str) -> Result<VerifiedClaims, VerificationError> {
    // reject garbage before touching the network
    let header = decode_header(id_token).map_err(VerificationError::Malformed)?;
    if header.alg != Algorithm::RS256 {
      return Err(VerificationError::UnsupportedAlgorithm(header.alg))
    }

    let jwks = self.keys
      .keys()
      .await
      .map_err(VerificationError::KeysUnavailable)?;

    verify_with_keys(id_token, &jwks, &self.project_id, Utc::now())
  }
}

/// Verify `id_token` against an already fetched key set.
pub fn verify_with_keys(
  id_token: &str,
  jwks: &JwkSet,
  project_id: &str,
  now: DateTime<Utc>
) -> Result<VerifiedClaims, VerificationError> {
  let header = decode_header(id_token).map_err(VerificationError::Malformed)?;
  if header.alg != Algorithm::RS256 {
    return Err(VerificationError::UnsupportedAlgorithm(header.alg))
  }

  let Some(kid) = header.kid else {
    return Err(VerificationError::MissingKeyId)
  };

  let Some(jwk) = jwks.find(&kid) else {
    return Err(VerificationError::UnknownKeyId(kid))
  };

  let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
    .map_err(VerificationError::Rejected)?;

  // Time claims are checked below against `now` rather than the system
  // clock, which isn't available inside a worker.
  let mut validation = Validation::new(Algorithm::RS256);
  validation.validate_exp = false;
  validation.validate_nbf = false;
  validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);
  validation.set_audience(&[project_id]);
  validation.set_issuer(&[format!("{SECURETOKEN_ISSUER_PREFIX}{project_id}")]);

  let claims = decode::<FirebaseIdClaims>(id_token, &key, &validation)?.claims;

  let now = now.timestamp();
  if claims.exp <= now {
    return Err(VerificationError::Expired)
  }
  if claims.iat > now || claims.auth_time.is_some_and(|t| t > now) {
    return Err(VerificationError::IssuedInFuture)
  }
  if claims.sub.is_empty() || claims.sub.len() > MAX_SUBJECT_LEN {
    return Err(VerificationError::InvalidSubject)
  }

  let (Some(issued_at), Some(expires_at)) = (
    DateTime::from_timestamp(claims.iat, 0),
    DateTime::from_timestamp(claims.exp, 0)
  ) else {
    return Err(VerificationError::Expired)
  };

  Ok(VerifiedClaims::new(
    claims.sub,
    claims.email,
    claims.email_verified,
    issued_at,
    expires_at
  ))
}

#[cfg(test)]
mod tests {
  use std::sync::{atomic::{AtomicUsize, Ordering}, Mutex};

  use serde_json::json;

  use super::*;
  use crate::test_support::{claims_for, jwks, sign, sign_with, StaticKeys, FORGED_KEY_PEM, PROJECT_ID, TEST_KID};

  fn verify(token: &str) -> Result<VerifiedClaims, VerificationError> {
    verify_with_keys(token, &jwks(), PROJECT_ID, Utc::now())
  }

  #[test]
  fn accepts_a_valid_token() {
    let claims = verify(&sign(&claims_for(Some("alice@x.com")))).unwrap();
    assert_eq!(claims.subject(), "uid-alice");
    assert_eq!(claims.email(), "alice@x.com");
    assert!(claims.email_verified());
    assert!(claims.expires_at() > claims.issued_at());
  }

  #[test]
  fn missing_email_is_empty() {
    let claims = verify(&sign(&claims_for(None))).unwrap();
    assert_eq!(claims.email(), "");
  }

  #[test]
  fn rejects_garbage() {
    assert!(matches!(verify("garbage"), Err(VerificationError::Malformed(_))));
    assert!(matches!(verify(""), Err(VerificationError::Malformed(_))));
  }

  #[test]
  fn rejects_forged_signature() {
    // same kid, different private key, allowed email
    let token = sign_with(FORGED_KEY_PEM, Some(TEST_KID), &claims_for(Some("alice@x.com")));
    assert!(matches!(verify(&token), Err(VerificationError::InvalidSignature)));
  }

  #[test]
  fn rejects_unknown_or_missing_kid() {
    let token = sign_with(crate::test_support::SIGNING_KEY_PEM, Some("rotated"), &claims_for(Some("a@x.com")));
    assert!(matches!(verify(&token), Err(VerificationError::UnknownKeyId(kid)) if kid == "rotated"));

    let token = sign_with(crate::test_support::SIGNING_KEY_PEM, None, &claims_for(Some("a@x.com")));
    assert!(matches!(verify(&token), Err(VerificationError::MissingKeyId)));
  }

  #[test]
  fn rejects_expired_token() {
    let mut claims = claims_for(Some("alice@x.com"));
    let now = Utc::now().timestamp();
    claims["iat"] = json!(now - 7200);
    claims["auth_time"] = json!(now - 7200);
    claims["exp"] = json!(now - 3600);
    assert!(matches!(verify(&sign(&claims)), Err(VerificationError::Expired)));
  }

  #[test]
  fn rejects_token_from_the_future() {
    let mut claims = claims_for(Some("alice@x.com"));
    claims["iat"] = json!(Utc::now().timestamp() + 600);
    assert!(matches!(verify(&sign(&claims)), Err(VerificationError::IssuedInFuture)));
  }

  #[test]
  fn rejects_other_projects() {
    let mut claims = claims_for(Some("alice@x.com"));
    claims["aud"] = json!("someone-else");
    assert!(matches!(verify(&sign(&claims)), Err(VerificationError::InvalidAudience)));

    let mut claims = claims_for(Some("alice@x.com"));
    claims["iss"] = json!("https://securetoken.google.com/someone-else");
    assert!(matches!(verify(&sign(&claims)), Err(VerificationError::InvalidIssuer)));
  }

  #[test]
  fn rejects_empty_subject() {
    let mut claims = claims_for(Some("alice@x.com"));
    claims["sub"] = json!("");
    assert!(matches!(verify(&sign(&claims)), Err(VerificationError::InvalidSubject)));
  }

  #[test]
  fn rejects_symmetric_algorithms() {
    let token = surrealdb_jsonwebtoken::encode(
      &surrealdb_jsonwebtoken::Header::new(Algorithm::HS256),
      &claims_for(Some("alice@x.com")),
      &surrealdb_jsonwebtoken::EncodingKey::from_secret(b"secret")
    ).unwrap();
    assert!(matches!(
      verify(&token),
      Err(VerificationError::UnsupportedAlgorithm(Algorithm::HS256))
    ));
  }

  #[test]
  fn parses_cache_control_max_age() {
    assert_eq!(
      cache_max_age(Some("public, max-age=19800, must-revalidate, no-transform")),
      Some(Duration::seconds(19800))
    );
    assert_eq!(cache_max_age(Some("no-cache")), None);
    assert_eq!(cache_max_age(Some("max-age=0")), None);
    assert_eq!(cache_max_age(None), None);
  }

  #[tokio::test]
  async fn firebase_verifier_uses_key_source() {
    let verifier = FirebaseVerifier::new(PROJECT_ID, StaticKeys::ok(jwks()));
    let claims = verifier.verify(&sign(&claims_for(Some("bob@x.com")))).await.unwrap();
    assert_eq!(claims.email(), "bob@x.com");
  }

  #[tokio::test]
  async fn key_outage_is_unavailable_not_invalid() {
    let verifier = FirebaseVerifier::new(PROJECT_ID, StaticKeys::unavailable());
    let err = verifier.verify(&sign(&claims_for(Some("bob@x.com")))).await.unwrap_err();
    assert!(err.is_unavailable());

    // garbage never reaches the key source
    let err = verifier.verify("garbage").await.unwrap_err();
    assert!(!err.is_unavailable());
  }

  #[derive(Default)]
  struct MemoryCache(Mutex<Option<(JwkSet, Duration)>>);

  #[async_trait]
  impl KeyCache for MemoryCache {
    async fn get(&self) -> Result<Option<JwkSet>, HandlerError> {
      Ok(self.0.lock().unwrap().as_ref().map(|(jwks, _)| jwks.clone()))
    }

    async fn put(&self, jwks: &JwkSet, ttl: Duration) -> Result<(), HandlerError> {
      *self.0.lock().unwrap() = Some((jwks.clone(), ttl));
      Ok(())
    }
  }

  struct CountingFetch {
    fetches: AtomicUsize,
    ttl: Duration
  }

  #[async_trait]
  impl KeyFetch for CountingFetch {
    async fn fetch(&self) -> Result<(JwkSet, Duration), HandlerError> {
      self.fetches.fetch_add(1, Ordering::SeqCst);
      Ok((jwks(), self.ttl))
    }
  }

  #[tokio::test]
  async fn keys_are_cached_for_max_age() {
    let keys = CachedKeys::new(
      MemoryCache::default(),
      CountingFetch { fetches: AtomicUsize::new(0), ttl: Duration::seconds(19800) }
    );

    assert_eq!(keys.keys().await.unwrap(), jwks());
    assert_eq!(keys.keys().await.unwrap(), jwks());

    assert_eq!(keys.fetch.fetches.load(Ordering::SeqCst), 1);
    let cached = keys.cache.0.lock().unwrap().clone();
    assert_eq!(cached, Some((jwks(), Duration::seconds(19800))));
  }

  #[tokio::test]
  async fn cached_keys_skip_the_fetch() {
    let cache = MemoryCache::default();
    cache.put(&jwks(), Duration::seconds(60)).await.unwrap();

    let keys = CachedKeys::new(
      cache,
      CountingFetch { fetches: AtomicUsize::new(0), ttl: Duration::seconds(60) }
    );
    let verifier = FirebaseVerifier::new(PROJECT_ID, keys);

    let claims = verifier.verify(&sign(&claims_for(Some("bob@x.com")))).await.unwrap();
    assert_eq!(claims.email(), "bob@x.com");
    assert_eq!(verifier.keys.fetch.fetches.load(Ordering::SeqCst), 0);
  }
}
