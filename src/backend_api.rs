//! Plugin backend transport
//!
//! Low-level client for calling server methods exposed by the LuaTools
//! plugin backend, either over its Unix socket or over HTTP. Every call is
//! `POST /plugins/{plugin}/{Method}` with a JSON object of arguments.

use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum BackendApiError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] hyper::Error),
    #[error("HTTP builder error: {0}")]
    HttpBuilderError(#[from] hyper::http::Error),
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Socket not found: {0}")]
    SocketNotFound(String),
}

/// Where the plugin backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Socket(PathBuf),
    Http(Url),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Socket(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Http(url) => write!(f, "{}", url),
        }
    }
}

/// Standard socket locations, most specific first.
pub fn socket_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        candidates.push(Path::new(&runtime_dir).join("luatools/backend.sock"));
    }
    candidates.push(PathBuf::from("/run/luatools/backend.sock"));
    candidates.push(PathBuf::from("/tmp/luatools-backend.sock"));
    candidates
}

pub fn discover_socket() -> Result<PathBuf, BackendApiError> {
    socket_candidates()
        .into_iter()
        .find(|path| path.exists())
        .ok_or_else(|| {
            BackendApiError::SocketNotFound(
                "LuaTools backend socket not found at standard locations".to_string(),
            )
        })
}

enum Transport {
    Socket {
        client: Client<UnixConnector>,
        socket_path: PathBuf,
    },
    Http {
        client: reqwest::Client,
        base: Url,
    },
}

pub struct BackendApiClient {
    transport: Transport,
    plugin: String,
}

impl BackendApiClient {
    pub fn new(endpoint: Endpoint, plugin: impl Into<String>) -> Result<Self, BackendApiError> {
        let transport = match endpoint {
            Endpoint::Socket(socket_path) => {
                if !socket_path.exists() {
                    return Err(BackendApiError::SocketNotFound(
                        socket_path.display().to_string(),
                    ));
                }
                Transport::Socket {
                    client: Client::unix(),
                    socket_path,
                }
            }
            Endpoint::Http(base) => Transport::Http {
                client: reqwest::ClientBuilder::new()
                    .timeout(REQUEST_TIMEOUT)
                    .build()?,
                base,
            },
        };

        Ok(Self {
            transport,
            plugin: plugin.into(),
        })
    }

    fn method_path(&self, method: &str) -> String {
        format!("/plugins/{}/{}", self.plugin, method)
    }

    /// Call `method` and return its decoded JSON object.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, BackendApiError> {
        let path = self.method_path(method);
        let text = match &self.transport {
            Transport::Socket {
                client,
                socket_path,
            } => {
                let uri: hyper::Uri = Uri::new(socket_path, &path).into();
                let req = Request::builder()
                    .method(Method::POST)
                    .uri(uri)
                    .header("Content-Type", "application/json")
                    .body(Body::from(serde_json::to_string(&args)?))?;

                let response = timeout(REQUEST_TIMEOUT, client.request(req))
                    .await
                    .map_err(|_| BackendApiError::Timeout(method.to_string()))??;
                let status = response.status();
                let body = hyper::body::to_bytes(response.into_body()).await?;
                let text = String::from_utf8_lossy(&body).into_owned();
                if !status.is_success() {
                    return Err(BackendApiError::ApiError(format!(
                        "{} returned HTTP {}: {}",
                        method,
                        status.as_u16(),
                        text.trim()
                    )));
                }
                text
            }
            Transport::Http { client, base } => {
                let url = base.join(path.trim_start_matches('/'))?;
                let response = client.post(url).json(&args).send().await?;
                let status = response.status();
                let text = response.text().await?;
                if !status.is_success() {
                    return Err(BackendApiError::ApiError(format!(
                        "{} returned HTTP {}: {}",
                        method,
                        status.as_u16(),
                        text.trim()
                    )));
                }
                text
            }
        };

        decode_payload(&text)
    }
}

/// Server methods return either a JSON object or a JSON string that itself
/// holds the object.
pub fn decode_payload(text: &str) -> Result<Value, BackendApiError> {
    let value: Value = serde_json::from_str(text)?;
    let value = match value {
        Value::String(inner) => serde_json::from_str(&inner)?,
        other => other,
    };

    if value.is_object() {
        Ok(value)
    } else {
        Err(BackendApiError::InvalidPayload(format!(
            "expected an object, got {}",
            value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_and_string_wrapped_objects_decode_the_same() {
        let plain = decode_payload(r#"{"success": true, "exists": false}"#).unwrap();
        let wrapped = decode_payload(r#""{\"success\": true, \"exists\": false}""#).unwrap();
        assert_eq!(plain, wrapped);
        assert_eq!(plain, json!({"success": true, "exists": false}));
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(matches!(
            decode_payload("[1, 2]"),
            Err(BackendApiError::InvalidPayload(_))
        ));
        assert!(matches!(
            decode_payload(r#""not json""#),
            Err(BackendApiError::JsonError(_))
        ));
    }

    #[test]
    fn http_endpoint_builds_plugin_paths() {
        let base = Url::parse("http://127.0.0.1:8787/").unwrap();
        let client = BackendApiClient::new(Endpoint::Http(base.clone()), "luatools").unwrap();
        assert_eq!(
            client.method_path("GetApplyFixStatus"),
            "/plugins/luatools/GetApplyFixStatus"
        );
        assert_eq!(
            base.join(client.method_path("GetApplyFixStatus").trim_start_matches('/'))
                .unwrap()
                .as_str(),
            "http://127.0.0.1:8787/plugins/luatools/GetApplyFixStatus"
        );
    }

    #[test]
    fn missing_socket_is_reported() {
        let result = BackendApiClient::new(
            Endpoint::Socket(PathBuf::from("/nonexistent/luatools.sock")),
            "luatools",
        );
        assert!(matches!(result, Err(BackendApiError::SocketNotFound(_))));
    }
}
