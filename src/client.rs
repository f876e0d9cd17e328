//! Blocking JSON-over-HTTP helper shared by the geocoding and weather adapters.
//!
//! - Blocking client using `ureq` (no async), gzip-capable.
//! - One global timeout per call; no retry here, callers decide.
//! - Bodies are decoded through `serde_path_to_error` so a malformed payload
//!   reports the offending JSON path.

use http::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Debug)]
pub enum ClientError {
    Transport(String),
    Http { status: u16, url: String },
    Json { path: String, message: String },
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, url } => {
                let reason = StatusCode::from_u16(*status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("unknown status");
                write!(f, "http {} ({}) from {}", status, reason, url)
            }
            ClientError::Json { path, message } => write!(f, "json error at `{}`: {}", path, message),
        }
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    /// Whether repeating the same request may succeed: transport failures,
    /// rate limiting and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Http { status, .. } => StatusCode::from_u16(*status)
                .map(|s| s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error())
                .unwrap_or(false),
            ClientError::Json { .. } => false,
        }
    }
}

pub struct JsonClient {
    agent: ureq::Agent,
    user_agent: String,
}

impl JsonClient {
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        JsonClient {
            agent,
            user_agent: user_agent.into(),
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, ClientError> {
        let mut req = self
            .agent
            .get(url)
            .header("Accept", "application/json")
            .header("User-Agent", self.user_agent.as_str());
        for (k, v) in query {
            req = req.query(*k, v);
        }

        let mut res = req.call().map_err(|e| match e {
            ureq::Error::StatusCode(status) => ClientError::Http {
                status,
                url: url.to_string(),
            },
            other => ClientError::Transport(other.to_string()),
        })?;
        let body = res
            .body_mut()
            .read_to_string()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        decode_json(&body)
    }
}

/// Decode a JSON document, keeping the path of the first failing field.
pub fn decode_json<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|e| ClientError::Json {
        path: e.path().to_string(),
        message: e.inner().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Payload {
        #[allow(dead_code)]
        items: Vec<Item>,
    }

    #[derive(Debug, Deserialize)]
    struct Item {
        #[allow(dead_code)]
        value: f64,
    }

    #[test]
    fn json_errors_carry_the_path() {
        let err = decode_json::<Payload>(r#"{"items":[{"value":1.0},{"value":"x"}]}"#).unwrap_err();
        match err {
            ClientError::Json { path, .. } => assert_eq!(path, "items[1].value"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn retry_classification() {
        let http = |status| ClientError::Http {
            status,
            url: "http://localhost".into(),
        };
        assert!(http(429).is_retryable());
        assert!(http(503).is_retryable());
        assert!(!http(404).is_retryable());
        assert!(ClientError::Transport("reset".into()).is_retryable());
        assert!(
            !ClientError::Json {
                path: ".".into(),
                message: "bad".into()
            }
            .is_retryable()
        );
        assert!(http(503).to_string().contains("Service Unavailable"));
    }
}
