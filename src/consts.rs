use axum::http::{header, HeaderName};

// ---------- SECRETS ----------

/// Adds all provided secret keys to the public `Secret` enum along
/// with an array of every variant, used for validation and lookup.
macro_rules! secrets {
  (
    // number of secrets
    $count:expr,
    // comma delimited secret names (same as their values)
    $($name:ident),+
    // optional trailing comma
    $(,)?
  ) => {
    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Secret {
      // create an enum value for each secret
      $($name,)+
    }

    impl Secret {
      /// Every declared secret, in declaration order.
      pub const ALL: [Secret; $count] = [$(Secret::$name,)+];

      /// Name of the secret / var as it appears in the deployment.
      pub const fn name(self) -> &'static str {
        match self {
          $(Secret::$name => stringify!($name),)+
        }
      }
    }
  };
}

// Implicitly creates the public `Secret` enum.
secrets!(
  7,
  FIREBASE_PROJECT_ID,
  ALLOWED_EMAILS,
  ALLOWLIST_SOURCE,
  ALLOWLIST_KEY,
  ALLOWLIST_MATCH,
  FIREBASE_SERVICE_ACCOUNT_JSON,
  VERIFY_TIMEOUT_MS
);

// ---------- CONSTANTS ----------

/// force var name to be the same as its string value
macro_rules! constant {
  ($name:ident) => {
    pub const $name: &str = stringify!($name);
  }
}

// KV

// store for allow-list documents, keyed by deployment
constant!(KV_ALLOWLIST);

// KV store for computed values shared by all workers
constant!(KV_CACHE);
constant!(KEY_SECURETOKEN_JWKS);
constant!(KEY_SERVICEACCOUNT_OAUTH_TOKEN);

// ---------- FIREBASE ----------

/// Source: https://firebase.google.com/docs/auth/admin/verify-id-tokens#verify_id_tokens_using_a_third-party_jwt_library
pub const SECURETOKEN_JWKS_URL: &str =
  "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";
pub const SECURETOKEN_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
pub const FIRESTORE_COLLECTION: &str = "allowlists";

// ---------- RESPONSE HEADER ----------

pub const NO_STORE_HEADER: [(HeaderName, &str); 2] = [
  (header::CACHE_CONTROL, "no-store"),
  (header::PRAGMA, "no-cache")
];

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn secret_names_match_variants() {
    assert_eq!(Secret::FIREBASE_PROJECT_ID.name(), "FIREBASE_PROJECT_ID");
    assert_eq!(Secret::ALL.len(), 7);
    assert_eq!(Secret::ALL[6], Secret::VERIFY_TIMEOUT_MS);
  }

  #[test]
  fn constants_are_their_own_names() {
    assert_eq!(KV_CACHE, "KV_CACHE");
    assert_eq!(KEY_SECURETOKEN_JWKS, "KEY_SECURETOKEN_JWKS");
  }
}
