use std::io;

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use worker::kv::KvStore;

use crate::handler_error::HandlerError;

/// Cloudflare rejects expiration TTLs under one minute.
const MIN_KV_TTL_SECONDS: u64 = 60;

// ---------- KV ----------

pub async fn kv_get<D: DeserializeOwned>(
  kv: &KvStore,
  key: &str
) -> Result<Option<D>, HandlerError> {
  Ok(
    match kv.get(key)
      .bytes()
      .await? {
        Some(bytes) => cbor_deserialize(&bytes)?,
        None => None,
      }
  )
}

pub async fn kv_put<S: Serialize>(
  kv: &KvStore,
  key: &str,
  value: &S,
  ttl: Duration
) -> Result<(), HandlerError> {
  Ok(
    kv.put_bytes(
      key,
      &cbor_serialize(value)?
    )?.expiration_ttl(
      kv_ttl_seconds(ttl)
    ).execute()
    .await?
  )
}

/// Allow-list documents are written by operators with `wrangler kv`,
/// so they are plain JSON rather than CBOR.
pub async fn kv_get_json<D: DeserializeOwned>(
  kv: &KvStore,
  key: &str
) -> Result<Option<D>, HandlerError> {
  Ok(
    match kv.get(key)
      .text()
      .await? {
        Some(text) => Some(serde_json::from_str(&text)?),
        None => None,
      }
  )
}

fn kv_ttl_seconds(ttl: Duration) -> u64 {
  u64::try_from(ttl.num_seconds())
    .unwrap_or(0)
    .max(MIN_KV_TTL_SECONDS)
}

// ---------- CBOR ----------

fn cbor_serialize<T: Serialize>(data: &T) -> Result<Vec<u8>, ciborium::ser::Error<io::Error>> {
  let mut buffer = Vec::new();
  ciborium::into_writer(data, &mut buffer)?;
  Ok(buffer)
}

fn cbor_deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ciborium::de::Error<io::Error>> {
  ciborium::from_reader(bytes)
}
