use std::{fmt, str::FromStr, time::Duration};

use serde::Deserialize;
use worker::Env;

use crate::consts::Secret;

const DEFAULT_ALLOWLIST_KEY: &str = "default";
const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Missing required configuration: {}", .0.join(", "))]
  Missing(Vec<&'static str>),
  #[error(r#"Invalid value for {key}: "{value}""#)]
  Invalid {
    key: &'static str,
    value: String
  },
  #[error("FIREBASE_SERVICE_ACCOUNT_JSON is not a service account key: {0}")]
  ServiceAccount(#[source] serde_json::Error)
}

/// How allow-list entries are compared against the email claim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmailMatch {
  /// ASCII-lowercased and trimmed on both sides.
  #[default]
  CaseInsensitive,
  /// The claim byte-for-byte as the token carries it, against trimmed
  /// entries.
  Exact
}
impl FromStr for EmailMatch {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "insensitive" => Ok(EmailMatch::CaseInsensitive),
      "exact" => Ok(EmailMatch::Exact),
      _ => Err(())
    }
  }
}

/// Source: https://developers.google.com/identity/protocols/oauth2/service-account#httprest
#[derive(Clone, Deserialize)]
pub struct ServiceAccount {
  pub client_email: String,
  pub private_key: String
}
// never print the private key
impl fmt::Debug for ServiceAccount {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ServiceAccount")
      .field("client_email", &self.client_email)
      .finish_non_exhaustive()
  }
}

/// Where the allow-list is loaded from.
#[derive(Clone, Debug)]
pub enum AllowListConfig {
  /// Comma-separated `ALLOWED_EMAILS`.
  Env {
    emails: String
  },
  /// JSON array of strings in the `KV_ALLOWLIST` store.
  Kv {
    key: String
  },
  /// `allowlists/<key>` Firestore document.
  Firestore {
    key: String,
    service_account: ServiceAccount
  }
}

/// Everything the verification gate needs, validated once up front.
#[derive(Clone, Debug)]
pub struct GateConfig {
  pub project_id: String,
  pub allow_list: AllowListConfig,
  pub email_match: EmailMatch,
  pub verify_timeout: Duration
}

impl GateConfig {
  /// Read the config from worker secrets, falling back to plain vars.
  pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
    Self::from_lookup(|secret| {
      env.secret(secret.name())
        .map(|s| s.to_string())
        .or_else(|_| env.var(secret.name()).map(|v| v.to_string()))
        .ok()
    })
  }

  /// Build the config from any key lookup. Every missing required key is
  /// reported at once, ahead of any value that fails to parse.
  pub fn from_lookup(
    lookup: impl Fn(Secret) -> Option<String>
  ) -> Result<Self, ConfigError> {
    // blank values count as unset
    let get = |secret: Secret| lookup(secret)
      .map(|v| v.trim().to_string())
      .filter(|v| !v.is_empty());

    let mut missing = Vec::new();
    // first bad value, surfaced only once nothing is missing
    let mut invalid = None;

    let project_id = get(Secret::FIREBASE_PROJECT_ID);
    if project_id.is_none() {
      missing.push(Secret::FIREBASE_PROJECT_ID.name());
    }

    let source = get(Secret::ALLOWLIST_SOURCE)
      .unwrap_or_else(|| "env".to_string());
    let key = get(Secret::ALLOWLIST_KEY)
      .unwrap_or_else(|| DEFAULT_ALLOWLIST_KEY.to_string());

    let allow_list = match source.as_str() {
      // present but blank is a valid (empty) allow-list
      "env" => match lookup(Secret::ALLOWED_EMAILS) {
        Some(emails) => Some(AllowListConfig::Env { emails }),
        None => {
          missing.push(Secret::ALLOWED_EMAILS.name());
          None
        }
      },
      "kv" => Some(AllowListConfig::Kv { key }),
      "firestore" => match get(Secret::FIREBASE_SERVICE_ACCOUNT_JSON) {
        Some(json) => match serde_json::from_str(&json) {
          Ok(service_account) => Some(AllowListConfig::Firestore { key, service_account }),
          Err(e) => {
            invalid.get_or_insert(ConfigError::ServiceAccount(e));
            None
          }
        },
        None => {
          missing.push(Secret::FIREBASE_SERVICE_ACCOUNT_JSON.name());
          None
        }
      },
      _ => {
        invalid.get_or_insert(ConfigError::Invalid {
          key: Secret::ALLOWLIST_SOURCE.name(),
          value: source
        });
        None
      }
    };

    let email_match = match get(Secret::ALLOWLIST_MATCH) {
      None => EmailMatch::default(),
      Some(value) => value.parse().unwrap_or_else(|()| {
        invalid.get_or_insert(ConfigError::Invalid {
          key: Secret::ALLOWLIST_MATCH.name(),
          value
        });
        EmailMatch::default()
      })
    };

    let verify_timeout = match get(Secret::VERIFY_TIMEOUT_MS) {
      None => DEFAULT_VERIFY_TIMEOUT,
      Some(value) => match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Duration::from_millis(ms),
        _ => {
          invalid.get_or_insert(ConfigError::Invalid {
            key: Secret::VERIFY_TIMEOUT_MS.name(),
            value
          });
          DEFAULT_VERIFY_TIMEOUT
        }
      }
    };

    if !missing.is_empty() {
      return Err(ConfigError::Missing(missing))
    }
    if let Some(err) = invalid {
      return Err(err)
    }

    match (project_id, allow_list) {
      (Some(project_id), Some(allow_list)) => Ok(GateConfig {
        project_id,
        allow_list,
        email_match,
        verify_timeout
      }),
      _ => Err(ConfigError::Missing(missing))
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use super::*;

  fn config(pairs: &[(&str, &str)]) -> Result<GateConfig, ConfigError> {
    let map: BTreeMap<String, String> = pairs.iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    GateConfig::from_lookup(|secret| map.get(secret.name()).cloned())
  }

  #[test]
  fn env_source_is_the_default() {
    let config = config(&[
      ("FIREBASE_PROJECT_ID", "myapp-12345"),
      ("ALLOWED_EMAILS", "alice@x.com, bob@x.com")
    ]).unwrap();

    assert_eq!(config.project_id, "myapp-12345");
    assert_eq!(config.email_match, EmailMatch::CaseInsensitive);
    assert_eq!(config.verify_timeout, Duration::from_millis(5000));
    assert!(matches!(
      config.allow_list,
      AllowListConfig::Env { ref emails } if emails == "alice@x.com, bob@x.com"
    ));
  }

  #[test]
  fn reports_every_missing_key() {
    let err = config(&[]).unwrap_err();
    match err {
      ConfigError::Missing(keys) => assert_eq!(
        keys,
        vec!["FIREBASE_PROJECT_ID", "ALLOWED_EMAILS"]
      ),
      other => panic!("unexpected error: {other}")
    }
  }

  #[test]
  fn blank_allowed_emails_is_accepted() {
    let config = config(&[
      ("FIREBASE_PROJECT_ID", "p"),
      ("ALLOWED_EMAILS", "")
    ]).unwrap();
    assert!(matches!(config.allow_list, AllowListConfig::Env { ref emails } if emails.is_empty()));
  }

  #[test]
  fn blank_project_id_is_missing() {
    let err = config(&[
      ("FIREBASE_PROJECT_ID", "   "),
      ("ALLOWED_EMAILS", "a@x.com")
    ]).unwrap_err();
    assert!(matches!(err, ConfigError::Missing(ref keys) if keys == &vec!["FIREBASE_PROJECT_ID"]));
  }

  #[test]
  fn kv_source_uses_key() {
    let config = config(&[
      ("FIREBASE_PROJECT_ID", "p"),
      ("ALLOWLIST_SOURCE", "kv"),
      ("ALLOWLIST_KEY", "tenant-a"),
      ("ALLOWLIST_MATCH", "exact"),
      ("VERIFY_TIMEOUT_MS", "250")
    ]).unwrap();

    assert!(matches!(config.allow_list, AllowListConfig::Kv { ref key } if key == "tenant-a"));
    assert_eq!(config.email_match, EmailMatch::Exact);
    assert_eq!(config.verify_timeout, Duration::from_millis(250));
  }

  #[test]
  fn firestore_source_requires_service_account() {
    let err = config(&[
      ("FIREBASE_PROJECT_ID", "p"),
      ("ALLOWLIST_SOURCE", "firestore")
    ]).unwrap_err();
    assert!(matches!(err, ConfigError::Missing(ref keys) if keys == &vec!["FIREBASE_SERVICE_ACCOUNT_JSON"]));

    let err = config(&[
      ("FIREBASE_PROJECT_ID", "p"),
      ("ALLOWLIST_SOURCE", "firestore"),
      ("FIREBASE_SERVICE_ACCOUNT_JSON", "{}")
    ]).unwrap_err();
    assert!(matches!(err, ConfigError::ServiceAccount(_)));

    let config = config(&[
      ("FIREBASE_PROJECT_ID", "p"),
      ("ALLOWLIST_SOURCE", "firestore"),
      (
        "FIREBASE_SERVICE_ACCOUNT_JSON",
        r#"{"client_email":"svc@p.iam.gserviceaccount.com","private_key":"pem","type":"service_account"}"#
      )
    ]).unwrap();
    match config.allow_list {
      AllowListConfig::Firestore { key, service_account } => {
        assert_eq!(key, "default");
        assert_eq!(service_account.client_email, "svc@p.iam.gserviceaccount.com");
        assert!(!format!("{service_account:?}").contains("pem"));
      },
      other => panic!("unexpected source: {other:?}")
    }
  }

  #[test]
  fn rejects_unknown_values() {
    let base = [("FIREBASE_PROJECT_ID", "p"), ("ALLOWED_EMAILS", "a@x.com")];

    let err = config(&[base[0], base[1], ("ALLOWLIST_SOURCE", "ldap")]).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "ALLOWLIST_SOURCE", .. }));

    let err = config(&[base[0], base[1], ("ALLOWLIST_MATCH", "fuzzy")]).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "ALLOWLIST_MATCH", .. }));

    let err = config(&[base[0], base[1], ("VERIFY_TIMEOUT_MS", "0")]).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "VERIFY_TIMEOUT_MS", .. }));
  }

  #[test]
  fn missing_keys_are_reported_before_bad_values() {
    let err = config(&[
      ("ALLOWLIST_SOURCE", "firestore"),
      ("FIREBASE_SERVICE_ACCOUNT_JSON", "{}")
    ]).unwrap_err();
    assert!(matches!(err, ConfigError::Missing(ref keys) if keys == &vec!["FIREBASE_PROJECT_ID"]));

    let err = config(&[
      ("ALLOWLIST_SOURCE", "ldap"),
      ("ALLOWLIST_MATCH", "fuzzy"),
      ("VERIFY_TIMEOUT_MS", "soon")
    ]).unwrap_err();
    assert!(matches!(err, ConfigError::Missing(ref keys) if keys == &vec!["FIREBASE_PROJECT_ID"]));
  }
}
