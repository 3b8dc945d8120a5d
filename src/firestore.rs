use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use surrealdb_jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use url::Url;
use worker::{kv::KvStore, send::SendFuture, Env};

use crate::{allow_list::EmailStore, config::ServiceAccount, consts::{FIRESTORE_COLLECTION, FIRESTORE_SCOPE, GOOGLE_TOKEN_URL, KEY_SERVICEACCOUNT_OAUTH_TOKEN, KV_CACHE}, handler_error::{check_status, HandlerError}, state::{kv_get, kv_put}};

/// Document field holding the allowed emails.
const EMAILS_FIELD: &str = "emails";

#[derive(Serialize, Deserialize)]
struct Claims<'a> {
  iss: &'a str,
  scope: &'a str,
  aud: &'a str,
  exp: i64,
  iat: i64
}

#[derive(Deserialize)]
struct TokenResponse {
  access_token: String
}

// Source: https://cloud.google.com/firestore/docs/reference/rest/v1/projects.databases.documents#Document
#[derive(Deserialize, Default)]
struct FirestoreDocument {
  #[serde(default)]
  fields: BTreeMap<String, FirestoreValue>
}
// Source: https://cloud.google.com/firestore/docs/reference/rest/Shared.Types/ArrayValue#Value
// Only the two value kinds the allow-list uses; the rest are ignored.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FirestoreValue {
  string_value: Option<String>,
  array_value: Option<ArrayValue>
}
#[derive(Deserialize, Default)]
struct ArrayValue {
  #[serde(default)]
  values: Vec<FirestoreValue>
}

/// The Firestore document `allowlists/<key>`, read with the deployment's
/// service account.
pub struct FirestoreEmails {
  env: Env,
  project_id: String,
  key: String,
  service_account: ServiceAccount
}

impl FirestoreEmails {
  pub fn new(
    env: Env,
    project_id: String,
    key: String,
    service_account: ServiceAccount
  ) -> Self {
    FirestoreEmails { env, project_id, key, service_account }
  }
}

#[async_trait]
impl EmailStore for FirestoreEmails {
  async fn fetch(&self) -> Result<Option<Vec<String>>, HandlerError> {
    let env = self.env.clone();
    let service_account = self.service_account.clone();
    let url = document_url(&self.project_id, &self.key)?;

    SendFuture::new(async move {
      let client = Client::new();

      let access_token = get_access_token(&env, &client, &service_account).await?;

      let response = client.get(url.clone())
        .bearer_auth(&access_token)
        .send()
        .await?;

      let status = response.status();
      let body = response.text().await?;

      emails_from_response(&url, status, &body)
    }).await
  }
}

/// `None` when the document doesn't exist.
fn emails_from_response(
  url: &Url,
  status: StatusCode,
  body: &str
) -> Result<Option<Vec<String>>, HandlerError> {
  if status == StatusCode::NOT_FOUND {
    return Ok(None)
  }

  if !status.is_success() {
    return Err(HandlerError::HttpStatus {
      url: url.to_string(),
      status: status.as_u16()
    })
  }

  let document: FirestoreDocument = serde_json::from_str(body)?;

  Ok(Some(emails_from_document(document)))
}

// Source: https://cloud.google.com/firestore/docs/reference/rest/v1/projects.databases.documents/get
fn document_url(project_id: &str, key: &str) -> Result<Url, HandlerError> {
  let mut url = Url::parse("https://firestore.googleapis.com/v1")?;

  url.path_segments_mut()
    .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
    .extend([
      "projects", project_id,
      "databases", "(default)",
      "documents", FIRESTORE_COLLECTION, key
    ]);

  Ok(url)
}

/// Pull the string entries out of the `emails` array field. Entries of
/// any other type are skipped.
fn emails_from_document(mut document: FirestoreDocument) -> Vec<String> {
  let Some(ArrayValue { values }) = document.fields
    .remove(EMAILS_FIELD)
    .and_then(|field| field.array_value)
    else {
      tracing::warn!("allow-list document has no {EMAILS_FIELD} array");
      return Vec::new()
    };

  values.into_iter()
    .filter_map(|value| {
      if value.string_value.is_none() {
        // Nonfatal
        tracing::warn!("skipping non-string allow-list entry");
      }
      value.string_value
    })
    .collect()
}

/// Source: https://developers.google.com/identity/protocols/oauth2/service-account#httprest
async fn get_access_token(
  env: &Env,
  client: &Client,
  service_account: &ServiceAccount
) -> Result<String, HandlerError> {
  let kv = KvStore::from_this(env, KV_CACHE)?;

  if let Some(token) = kv_get(&kv, KEY_SERVICEACCOUNT_OAUTH_TOKEN).await? {
    return Ok(token)
  }

  // get a new token from oauth2.googleapis.com

  let token_ttl = Duration::hours(1);

  let now = Utc::now();
  let claims = Claims {
    iss: &service_account.client_email,
    scope: FIRESTORE_SCOPE,
    aud: GOOGLE_TOKEN_URL,
    exp: (now + token_ttl).timestamp(),
    iat: now.timestamp(),
  };

  let jwt = encode(
    &Header::new(Algorithm::RS256),
    &claims,
    &EncodingKey::from_rsa_pem(service_account.private_key.as_bytes())?
  )?;

  let TokenResponse { access_token } = check_status(
    client
      .post(GOOGLE_TOKEN_URL)
      .form(&[
        ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
        ("assertion", &jwt),
      ])
      .send()
      .await?
  )?
    .json()
    .await?;

  // cache it
  kv_put(
    &kv,
    KEY_SERVICEACCOUNT_OAUTH_TOKEN,
    &access_token,
    token_ttl - Duration::minutes(1)
  ).await?;

  Ok(access_token)
}
