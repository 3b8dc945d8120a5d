use std::collections::BTreeSet;

use async_trait::async_trait;
use worker::{kv::KvStore, send::SendFuture, Env};

use crate::{config::EmailMatch, consts::KV_ALLOWLIST, handler_error::HandlerError, state::kv_get_json};

/// The set of identities allowed through the gate. Never contains the
/// empty string, so a token without an email can't match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList {
  entries: BTreeSet<String>,
  matching: EmailMatch
}

impl AllowList {
  pub fn new<I, S>(entries: I, matching: EmailMatch) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>
  {
    AllowList {
      entries: entries.into_iter()
        .filter_map(|e| normalize(e.as_ref(), matching))
        .collect(),
      matching
    }
  }

  /// Parse a comma-separated list, e.g. `ALLOWED_EMAILS`.
  pub fn parse(raw: &str, matching: EmailMatch) -> Self {
    Self::new(raw.split(','), matching)
  }

  /// Exact matching compares the claim as given; only the entries are
  /// trimmed.
  pub fn contains(&self, email: &str) -> bool {
    let email = match self.matching {
      EmailMatch::CaseInsensitive => email.trim().to_ascii_lowercase(),
      EmailMatch::Exact => email.to_string()
    };

    !email.is_empty() && self.entries.contains(&email)
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

fn normalize(email: &str, matching: EmailMatch) -> Option<String> {
  let email = match matching {
    EmailMatch::CaseInsensitive => email.trim().to_ascii_lowercase(),
    EmailMatch::Exact => email.trim().to_string()
  };

  (!email.is_empty()).then_some(email)
}

/// Where the gate reads its policy from.
#[async_trait]
pub trait AllowListSource: Send + Sync {
  async fn load(&self) -> Result<AllowList, HandlerError>;
}

/// An allow-list fixed at startup.
pub struct StaticAllowList(AllowList);

impl StaticAllowList {
  pub fn new(allow_list: AllowList) -> Self {
    StaticAllowList(allow_list)
  }
}

#[async_trait]
impl AllowListSource for StaticAllowList {
  async fn load(&self) -> Result<AllowList, HandlerError> {
    Ok(self.0.clone())
  }
}

/// Raw read of a stored allow-list document. `None` when there is no
/// document at all.
#[async_trait]
pub trait EmailStore: Send + Sync {
  async fn fetch(&self) -> Result<Option<Vec<String>>, HandlerError>;
}

/// Allow-list read from a store on every request. A missing document is
/// an empty allow-list.
pub struct StoredAllowList<S> {
  store: S,
  matching: EmailMatch
}

impl<S: EmailStore> StoredAllowList<S> {
  pub fn new(store: S, matching: EmailMatch) -> Self {
    StoredAllowList { store, matching }
  }
}

#[async_trait]
impl<S: EmailStore> AllowListSource for StoredAllowList<S> {
  async fn load(&self) -> Result<AllowList, HandlerError> {
    let emails = self.store
      .fetch()
      .await?
      .unwrap_or_else(|| {
        tracing::warn!("no allow-list document found");
        Vec::new()
      });

    Ok(AllowList::new(emails, self.matching))
  }
}

/// JSON array of emails stored in `KV_ALLOWLIST` under a per-deployment key.
pub struct KvEmails {
  env: Env,
  key: String
}

impl KvEmails {
  pub fn new(env: Env, key: String) -> Self {
    KvEmails { env, key }
  }
}

#[async_trait]
impl EmailStore for KvEmails {
  async fn fetch(&self) -> Result<Option<Vec<String>>, HandlerError> {
    let env = self.env.clone();
    let key = self.key.clone();

    SendFuture::new(async move {
      let kv = KvStore::from_this(&env, KV_ALLOWLIST)?;
      tracing::debug!(key = %key, "reading allow-list from KV");
      kv_get_json(&kv, &key).await
    }).await
  }
}
