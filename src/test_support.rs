use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use surrealdb_jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

use crate::{allow_list::{AllowList, AllowListSource}, config::EmailMatch, handler_error::HandlerError, verifier::{Jwk, JwkSet, KeySource}};

pub const PROJECT_ID: &str = "myapp-12345";
pub const TEST_KID: &str = "test-key";

pub const SIGNING_KEY_PEM: &str = include_str!("testdata/signing_key.pem");
pub const FORGED_KEY_PEM: &str = include_str!("testdata/forged_key.pem");

// public half of testdata/signing_key.pem
const SIGNING_KEY_N: &str = "p5Fr3vjSLez1iG4AvxBubrBuJ7Nr9U20BGn9PYv0GlzIMESkLOIMnfexkyjcijhz_rtWiIwNLsYKhJCx2Y9sk35_8LCeC69qeByGhM-od6UAnlpn-W-0UsHDgZY-fYaP0nEyAmk1pRy0jSAwAwZtsQCYYaCwx5zWZ3z2WTrXj58Y5xU0LxHkso5zeoTdKIl4To0oMI_X6tvziv7sgWVvvsZlPtS2yx0NInpsRBm2_xuH0D4GzKY1GXGC5k99M2qN8OgzST5fZHgY4TkIZgSz030D6_2WNf2wWMQs2c-MsAUN4mqv9W39Q6554z-Oa6BV1ce2kJWiKNh6gWpAASX03w";
const SIGNING_KEY_E: &str = "AQAB";

pub fn jwks() -> JwkSet {
  JwkSet {
    keys: vec![Jwk {
      kid: TEST_KID.to_string(),
      kty: "RSA".to_string(),
      alg: Some("RS256".to_string()),
      n: SIGNING_KEY_N.to_string(),
      e: SIGNING_KEY_E.to_string()
    }]
  }
}

/// Firebase-shaped claims, valid for the next hour.
pub fn claims_for(email: Option<&str>) -> Value {
  let now = Utc::now().timestamp();
  let uid = email
    .and_then(|e| e.split('@').next())
    .unwrap_or("anonymous");

  let mut claims = json!({
    "iss": format!("https://securetoken.google.com/{PROJECT_ID}"),
    "aud": PROJECT_ID,
    "sub": format!("uid-{uid}"),
    "user_id": format!("uid-{uid}"),
    "iat": now - 10,
    "auth_time": now - 10,
    "exp": now + 3600,
    "firebase": { "sign_in_provider": "google.com" }
  });

  if let Some(email) = email {
    claims["email"] = json!(email);
    claims["email_verified"] = json!(true);
  }

  claims
}

pub fn sign(claims: &Value) -> String {
  sign_with(SIGNING_KEY_PEM, Some(TEST_KID), claims)
}

pub fn sign_with(pem: &str, kid: Option<&str>, claims: &Value) -> String {
  let mut header = Header::new(Algorithm::RS256);
  header.kid = kid.map(str::to_string);

  encode(
    &header,
    claims,
    &EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap()
  ).unwrap()
}

/// Key source that never touches the network.
pub struct StaticKeys(Option<JwkSet>);

impl StaticKeys {
  pub fn ok(jwks: JwkSet) -> Self {
    StaticKeys(Some(jwks))
  }

  pub fn unavailable() -> Self {
    StaticKeys(None)
  }
}

#[async_trait]
impl KeySource for StaticKeys {
  async fn keys(&self) -> Result<JwkSet, HandlerError> {
    match &self.0 {
      Some(jwks) => Ok(jwks.clone()),
      None => Err(HandlerError::HttpStatus {
        url: "https://keys.test".to_string(),
        status: 503
      })
    }
  }
}

/// Allow-list source that counts loads and can be made to fail.
pub struct FakeAllowList {
  entries: Option<Vec<String>>,
  pub loads: Arc<AtomicUsize>
}

impl FakeAllowList {
  pub fn of(entries: &[&str]) -> Self {
    FakeAllowList {
      entries: Some(entries.iter().map(|e| e.to_string()).collect()),
      loads: Arc::default()
    }
  }

  pub fn failing() -> Self {
    FakeAllowList { entries: None, loads: Arc::default() }
  }
}

#[async_trait]
impl AllowListSource for FakeAllowList {
  async fn load(&self) -> Result<AllowList, HandlerError> {
    self.loads.fetch_add(1, Ordering::SeqCst);
    match &self.entries {
      Some(entries) => Ok(AllowList::new(entries, EmailMatch::CaseInsensitive)),
      None => Err(HandlerError::HttpStatus {
        url: "https://allowlist.test".to_string(),
        status: 500
      })
    }
  }
}
