//! Request envelope: one newline-terminated JSON object per connection.
//!
//! The flat view keeps every key so accounting can mirror the original
//! request; validation only constrains `Service`, `Throttle`, `Server`
//! and `Port`.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request is not a JSON object")]
    NotObject,

    #[error("missing or empty Service")]
    MissingService,

    #[error("Throttle must be a positive integer")]
    BadThrottle,

    #[error("Server supplied without Port")]
    ServerWithoutPort,
}

/// Validated request envelope.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub service: String,
    pub throttle: usize,
    /// Explicit backend, when the client pinned one. Port stays a string:
    /// resolution decides whether it names a real port.
    pub server: Option<(String, String)>,
    /// Flat view of every key in the envelope.
    pub fields: BTreeMap<String, String>,
}

impl ParsedRequest {
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let value: Value = serde_json::from_str(line)?;
        let object = value.as_object().ok_or(RequestError::NotObject)?;

        let mut fields = BTreeMap::new();
        for (key, value) in object {
            fields.insert(key.clone(), flatten_value(value));
        }

        let service = fields
            .get("Service")
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or(RequestError::MissingService)?;

        let throttle = fields
            .get("Throttle")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .ok_or(RequestError::BadThrottle)?;

        let server = match fields.get("Server").filter(|s| !s.is_empty()) {
            Some(server) => {
                let port = fields
                    .get("Port")
                    .filter(|s| !s.is_empty())
                    .ok_or(RequestError::ServerWithoutPort)?;
                Some((server.clone(), port.clone()))
            }
            None => None,
        };

        Ok(Self {
            service,
            throttle,
            server,
            fields,
        })
    }
}

fn flatten_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
