pub mod auth;

use crate::config::SinkConfig;
use crate::error::{endpoint_label, RemoteError, SECOPS};
use crate::retry::RetryPolicy;
use crate::types::NormalizedEntity;
use anyhow::Context;
use auth::TokenProvider;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;

const INGESTION_TIMEOUT: Duration = Duration::from_secs(60);

pub trait EntitySink {
  /// Delivers one batch in a single call. An empty batch is a no-op.
  fn send(&mut self, batch: &[NormalizedEntity]) -> Result<(), RemoteError>;
}

#[derive(Debug, Serialize)]
struct IngestionRequest<'a> {
  #[serde(rename = "customerId")]
  customer_id: &'a str,
  log_type: &'a str,
  entities: &'a [NormalizedEntity],
}

/// Entity-context ingestion into Google SecOps.
pub struct SecOpsClient {
  http: Client,
  url: Url,
  customer_id: String,
  log_type: String,
  tokens: Box<dyn TokenProvider>,
  retry: RetryPolicy,
}

impl SecOpsClient {
  pub fn new(cfg: &SinkConfig, tokens: Box<dyn TokenProvider>) -> anyhow::Result<Self> {
    let url = Url::parse(&cfg.ingestion_url)
      .with_context(|| format!("invalid ingestion URL: {}", cfg.ingestion_url))?;
    let http = Client::builder()
      .timeout(INGESTION_TIMEOUT)
      .build()
      .context("build HTTP client")?;
    tracing::info!(
      endpoint = %endpoint_label(&url),
      customer_id = %cfg.customer_id,
      project_id = %cfg.project_id,
      "Google SecOps ingestion configured"
    );

    Ok(Self {
      http,
      url,
      customer_id: cfg.customer_id.clone(),
      log_type: cfg.log_type.clone(),
      tokens,
      retry: RetryPolicy::sink(),
    })
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  fn post_once(&mut self, body: &IngestionRequest<'_>) -> Result<(), RemoteError> {
    let label = endpoint_label(&self.url);
    let token = self.tokens.bearer()?;
    let response = self
      .http
      .post(self.url.clone())
      .header(AUTHORIZATION, format!("Bearer {token}"))
      .header(ACCEPT, "application/json")
      .header(USER_AGENT, concat!("misp-forwarder/", env!("CARGO_PKG_VERSION")))
      .json(body)
      .send()
      .map_err(|e| RemoteError::transport(SECOPS, &label, e))?;

    let status = response.status().as_u16();
    if status == 200 {
      return Ok(());
    }
    if status == 401 {
      self.tokens.invalidate();
    }
    let text = response.text().unwrap_or_default();
    Err(RemoteError::from_status(SECOPS, &label, status, &text))
  }
}

impl EntitySink for SecOpsClient {
  fn send(&mut self, batch: &[NormalizedEntity]) -> Result<(), RemoteError> {
    if batch.is_empty() {
      return Ok(());
    }

    let customer_id = self.customer_id.clone();
    let log_type = self.log_type.clone();
    let body = IngestionRequest {
      customer_id: &customer_id,
      log_type: &log_type,
      entities: batch,
    };

    let retry = self.retry.clone();
    retry.run("secops ingestion", |_| self.post_once(&body))?;
    tracing::info!(count = batch.len(), "forwarded entities to Google SecOps");
    Ok(())
  }
}
