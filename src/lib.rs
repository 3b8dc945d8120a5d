pub mod allow_list;
pub mod client;
pub mod config;
mod consts;
mod endpoints;
mod firestore;
pub mod gate;
mod handler_error;
mod state;
mod telemetry;
pub mod verifier;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use allow_list::{AllowList, AllowListSource, KvEmails, StaticAllowList, StoredAllowList};
use axum::{body::Body, http::Response};
use config::{AllowListConfig, GateConfig};
use firestore::FirestoreEmails;
use gate::{Gate, Sleep};
use tower_service::Service;
use verifier::{CachedKeys, FirebaseVerifier, KvKeyCache, SecureTokenKeys};
use worker::{event, send::SendFuture, Context, Delay, Env, HttpRequest};

pub use consts::Secret;
pub use endpoints::router;
pub use handler_error::HandlerError;

const DEFAULT_LOG_FILTER: &str = "info";

// Program entrypoint. Essentially the `main` function.
#[event(fetch)]
async fn fetch(req: HttpRequest, env: Env, _: Context) -> worker::Result<Response<Body>> {
  console_error_panic_hook::set_once();

  telemetry::init_console_logging(
    &env.var("RUST_LOG")
      .map(|v| v.to_string())
      .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string())
  );

  // refuse to serve with a broken deployment
  let config = GateConfig::from_env(&env).map_err(|e| {
    tracing::error!("{e}");
    worker::Error::RustError(e.to_string())
  })?;

  Ok(
    router(Arc::new(init_gate(env, config)))
      .call(req)
      .await?
  )
}

/// Build the gate for a deployment. Does no I/O, so calling it again with
/// the same config yields an equivalent gate.
pub fn init_gate(env: Env, config: GateConfig) -> Gate {
  let GateConfig {
    project_id,
    allow_list,
    email_match,
    verify_timeout
  } = config;

  let allow_list: Arc<dyn AllowListSource> = match allow_list {
    AllowListConfig::Env { emails } => {
      let allow_list = AllowList::parse(&emails, email_match);
      if allow_list.is_empty() {
        tracing::warn!("ALLOWED_EMAILS is empty, every request will be forbidden");
      }
      Arc::new(StaticAllowList::new(allow_list))
    },
    AllowListConfig::Kv { key } => Arc::new(StoredAllowList::new(
      KvEmails::new(env.clone(), key),
      email_match
    )),
    AllowListConfig::Firestore { key, service_account } => Arc::new(StoredAllowList::new(
      FirestoreEmails::new(env.clone(), project_id.clone(), key, service_account),
      email_match
    ))
  };

  let sleep: Sleep = Arc::new(|duration| Box::pin(SendFuture::new(Delay::from(duration))));

  Gate::new(
    Arc::new(FirebaseVerifier::new(
      project_id,
      CachedKeys::new(KvKeyCache::new(env), SecureTokenKeys)
    )),
    allow_list
  ).with_timeout(verify_timeout, sleep)
}
