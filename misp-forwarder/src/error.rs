use crate::retry::{RetryClass, Retryable};

pub const MISP: &str = "MISP";
pub const SECOPS: &str = "Google SecOps";

/// Failure of a call to one of the two remote services.
///
/// `endpoint` is always host + path; query strings and credentials never reach
/// an error message.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
  #[error("{service}: request to {endpoint} failed: {source}")]
  Transport {
    service: &'static str,
    endpoint: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("{service}: server error (HTTP {status}) from {endpoint}")]
  Server {
    service: &'static str,
    endpoint: String,
    status: u16,
  },

  #[error("{service}: rate limit exceeded (HTTP 429) at {endpoint}")]
  RateLimited {
    service: &'static str,
    endpoint: String,
  },

  #[error("{service}: authentication failed (HTTP 401) at {endpoint}; credentials may be invalid or expired")]
  Unauthorized {
    service: &'static str,
    endpoint: String,
  },

  #[error("{service}: access forbidden (HTTP 403) at {endpoint}; the account lacks the required permissions")]
  Forbidden {
    service: &'static str,
    endpoint: String,
  },

  #[error("{service}: request rejected (HTTP 400) by {endpoint}: {detail}")]
  BadRequest {
    service: &'static str,
    endpoint: String,
    detail: String,
  },

  #[error("{service}: unexpected HTTP {status} from {endpoint}")]
  UnexpectedStatus {
    service: &'static str,
    endpoint: String,
    status: u16,
  },

  #[error("{service}: malformed response from {endpoint}: {detail}")]
  Malformed {
    service: &'static str,
    endpoint: String,
    detail: String,
  },

  #[error("{service}: credential problem: {detail}")]
  Credentials { service: &'static str, detail: String },
}

impl RemoteError {
  /// Maps a non-200 status to its error class and logs it at the matching level.
  pub fn from_status(service: &'static str, endpoint: &str, status: u16, body: &str) -> Self {
    let endpoint = endpoint.to_string();
    let err = match status {
      400 => RemoteError::BadRequest {
        service,
        endpoint,
        detail: short_body(body),
      },
      401 => RemoteError::Unauthorized { service, endpoint },
      403 => RemoteError::Forbidden { service, endpoint },
      429 => RemoteError::RateLimited { service, endpoint },
      s if s >= 500 => RemoteError::Server {
        service,
        endpoint,
        status: s,
      },
      s => RemoteError::UnexpectedStatus {
        service,
        endpoint,
        status: s,
      },
    };

    if status == 429 {
      tracing::warn!(status, "{err}");
    } else {
      tracing::error!(status, "{err}");
    }
    err
  }

  pub fn transport(service: &'static str, endpoint: &str, source: reqwest::Error) -> Self {
    RemoteError::Transport {
      service,
      endpoint: endpoint.to_string(),
      source: source.without_url(),
    }
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      RemoteError::Server { status, .. } | RemoteError::UnexpectedStatus { status, .. } => {
        Some(*status)
      }
      RemoteError::RateLimited { .. } => Some(429),
      RemoteError::Unauthorized { .. } => Some(401),
      RemoteError::Forbidden { .. } => Some(403),
      RemoteError::BadRequest { .. } => Some(400),
      RemoteError::Transport { .. }
      | RemoteError::Malformed { .. }
      | RemoteError::Credentials { .. } => None,
    }
  }

  pub fn is_authorization(&self) -> bool {
    matches!(
      self,
      RemoteError::Unauthorized { .. } | RemoteError::Forbidden { .. }
    )
  }
}

impl Retryable for RemoteError {
  fn retry_class(&self) -> RetryClass {
    match self {
      RemoteError::Transport { .. } | RemoteError::Server { .. } => RetryClass::Transient,
      RemoteError::RateLimited { .. } => RetryClass::RateLimited,
      _ => RetryClass::Fatal,
    }
  }
}

fn short_body(body: &str) -> String {
  let body = body.trim();
  if body.chars().count() <= 180 {
    return body.to_string();
  }
  let prefix: String = body.chars().take(180).collect();
  format!("{prefix}...")
}

/// host + path of a URL, for log and error labels.
pub fn endpoint_label(url: &reqwest::Url) -> String {
  let host = url.host_str().unwrap_or("<no-host>");
  let mut path = url.path().to_string();
  if path.is_empty() {
    path = "/".to_string();
  }
  match url.port() {
    Some(port) => format!("{host}:{port}{path}"),
    None => format!("{host}{path}"),
  }
}
