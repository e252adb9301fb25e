use crate::error::{endpoint_label, RemoteError, SECOPS};
use crate::types::now_unix_s;
use anyhow::Context;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const INGESTION_SCOPE: &str = "https://www.googleapis.com/auth/malachite-ingestion";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_S: i64 = 3600;
const EXPIRY_SKEW_S: i64 = 60;
const TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Supplies the bearer credential for ingestion calls.
pub trait TokenProvider {
  /// A currently valid token, refreshing it first if needed.
  fn bearer(&mut self) -> Result<String, RemoteError>;

  /// Drops the cached token so the next call fetches a new one.
  fn invalidate(&mut self);
}

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
  pub client_email: String,
  pub private_key: String,
  #[serde(default)]
  pub private_key_id: Option<String>,
  #[serde(default = "default_token_uri")]
  pub token_uri: String,
}

fn default_token_uri() -> String {
  DEFAULT_TOKEN_URI.to_string()
}

impl std::fmt::Debug for ServiceAccountKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ServiceAccountKey")
      .field("client_email", &self.client_email)
      .field("private_key", &"<redacted>")
      .field("token_uri", &self.token_uri)
      .finish()
  }
}

impl ServiceAccountKey {
  pub fn from_file(path: &Path) -> anyhow::Result<Self> {
    let raw = std::fs::read(path)
      .with_context(|| format!("read service account credentials {}", path.display()))?;
    serde_json::from_slice(&raw)
      .with_context(|| format!("parse service account credentials {}", path.display()))
  }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
  iss: &'a str,
  scope: &'a str,
  aud: &'a str,
  iat: i64,
  exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  access_token: String,
  #[serde(default = "default_expires_in")]
  expires_in: i64,
}

fn default_expires_in() -> i64 {
  ASSERTION_LIFETIME_S
}

#[derive(Debug, Clone)]
struct AccessToken {
  value: String,
  expires_at: i64,
}

impl AccessToken {
  fn is_valid_at(&self, now: i64) -> bool {
    now + EXPIRY_SKEW_S < self.expires_at
  }
}

/// OAuth2 JWT-bearer flow for a service-account key.
pub struct ServiceAccountTokens {
  key: ServiceAccountKey,
  signing_key: EncodingKey,
  token_url: Url,
  http: Client,
  cached: Option<AccessToken>,
}

impl ServiceAccountTokens {
  pub fn new(key: ServiceAccountKey) -> anyhow::Result<Self> {
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
      .context("service account private_key is not a valid RSA PEM key")?;
    let token_url = Url::parse(&key.token_uri)
      .with_context(|| format!("invalid token_uri: {}", key.token_uri))?;
    let http = Client::builder()
      .timeout(TOKEN_TIMEOUT)
      .build()
      .context("build HTTP client")?;

    Ok(Self {
      key,
      signing_key,
      token_url,
      http,
      cached: None,
    })
  }

  pub fn from_file(path: &Path) -> anyhow::Result<Self> {
    Self::new(ServiceAccountKey::from_file(path)?)
  }

  fn assertion(&self, now: i64) -> Result<String, RemoteError> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = self.key.private_key_id.clone();
    let claims = Claims {
      iss: &self.key.client_email,
      scope: INGESTION_SCOPE,
      aud: &self.key.token_uri,
      iat: now,
      exp: now + ASSERTION_LIFETIME_S,
    };
    jsonwebtoken::encode(&header, &claims, &self.signing_key).map_err(|e| {
      RemoteError::Credentials {
        service: SECOPS,
        detail: format!("unable to sign token request: {e}"),
      }
    })
  }

  fn exchange(&self, now: i64) -> Result<AccessToken, RemoteError> {
    let label = endpoint_label(&self.token_url);
    let assertion = self.assertion(now)?;
    let response = self
      .http
      .post(self.token_url.clone())
      .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
      .send()
      .map_err(|e| RemoteError::transport(SECOPS, &label, e))?;

    let status = response.status().as_u16();
    if status != 200 {
      let body = response.text().unwrap_or_default();
      return Err(RemoteError::from_status(SECOPS, &label, status, &body));
    }

    let token: TokenResponse = response.json().map_err(|e| RemoteError::Malformed {
      service: SECOPS,
      endpoint: label,
      detail: e.without_url().to_string(),
    })?;

    tracing::debug!(expires_in = token.expires_in, "obtained ingestion access token");
    Ok(AccessToken {
      value: token.access_token,
      expires_at: now.saturating_add(token.expires_in),
    })
  }
}

impl TokenProvider for ServiceAccountTokens {
  fn bearer(&mut self) -> Result<String, RemoteError> {
    let now = now_unix_s();
    if let Some(tok) = self.cached.as_ref().filter(|t| t.is_valid_at(now)) {
      return Ok(tok.value.clone());
    }
    let fresh = self.exchange(now)?;
    let value = fresh.value.clone();
    self.cached = Some(fresh);
    Ok(value)
  }

  fn invalidate(&mut self) {
    self.cached = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{body_string_contains, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  const TEST_KEY: &str = include_str!("testdata/test-sa-key.pem");

  fn key(token_uri: String) -> ServiceAccountKey {
    ServiceAccountKey {
      client_email: "forwarder@project.iam.gserviceaccount.com".to_string(),
      private_key: TEST_KEY.to_string(),
      private_key_id: Some("kid-1".to_string()),
      token_uri,
    }
  }

  #[test]
  fn token_validity_respects_skew() {
    let t = AccessToken {
      value: "x".to_string(),
      expires_at: 1_000,
    };
    assert!(t.is_valid_at(900));
    assert!(!t.is_valid_at(940));
    assert!(!t.is_valid_at(1_000));
  }

  #[test]
  fn key_file_parses_and_redacts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sa.json");
    let raw = json!({
      "type": "service_account",
      "client_email": "a@b.iam.gserviceaccount.com",
      "private_key": TEST_KEY,
    });
    std::fs::write(&path, raw.to_string()).unwrap();
    let key = ServiceAccountKey::from_file(&path).unwrap();
    assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
    assert!(!format!("{key:?}").contains("BEGIN PRIVATE KEY"));
  }

  #[test]
  fn invalid_private_key_is_rejected_up_front() {
    let mut k = key(DEFAULT_TOKEN_URI.to_string());
    k.private_key = "not a key".to_string();
    assert!(ServiceAccountTokens::new(k).is_err());
  }

  #[test]
  fn token_is_fetched_once_and_cached() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    rt.block_on(
      Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
          "access_token": "tok-1",
          "expires_in": 3600,
          "token_type": "Bearer",
        })))
        .mount(&server),
    );

    let mut tokens = ServiceAccountTokens::new(key(format!("{}/token", server.uri()))).unwrap();
    assert_eq!(tokens.bearer().unwrap(), "tok-1");
    assert_eq!(tokens.bearer().unwrap(), "tok-1");
    let calls = rt.block_on(server.received_requests()).unwrap_or_default().len();
    assert_eq!(calls, 1);

    tokens.invalidate();
    assert_eq!(tokens.bearer().unwrap(), "tok-1");
    let calls = rt.block_on(server.received_requests()).unwrap_or_default().len();
    assert_eq!(calls, 2);
  }

  #[test]
  fn oversized_expiry_saturates() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    rt.block_on(
      Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
          "access_token": "long-lived",
          "expires_in": i64::MAX,
        })))
        .mount(&server),
    );

    let mut tokens = ServiceAccountTokens::new(key(format!("{}/token", server.uri()))).unwrap();
    assert_eq!(tokens.bearer().unwrap(), "long-lived");
    assert_eq!(tokens.cached.as_ref().map(|t| t.expires_at), Some(i64::MAX));
    assert_eq!(tokens.bearer().unwrap(), "long-lived");
    let calls = rt.block_on(server.received_requests()).unwrap_or_default().len();
    assert_eq!(calls, 1);
  }

  #[test]
  fn rejected_grant_is_classified() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    rt.block_on(
      Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
        .mount(&server),
    );
    let mut tokens = ServiceAccountTokens::new(key(format!("{}/token", server.uri()))).unwrap();
    let err = tokens.bearer().unwrap_err();
    assert!(err.is_authorization());
  }
}
