//! HTTP client for the Jupyter server's session and kernel REST API.
//!
//! All endpoints live under `{base_url}/api/`. The base URL may carry a
//! path prefix (as behind a hub), so endpoints are joined relative to it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::settings::RelaySettings;

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// A running kernel as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<u64>,
}

/// A session binds a document path to a kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub session_type: String,
    #[serde(default)]
    pub kernel: Option<KernelModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecInfo {
    pub display_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecEntry {
    pub name: String,
    pub spec: KernelSpecInfo,
    #[serde(default)]
    pub resources: HashMap<String, String>,
}

/// Response of `GET /api/kernelspecs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecs {
    pub default: String,
    pub kernelspecs: HashMap<String, KernelSpecEntry>,
}

/// Client for one Jupyter server.
#[derive(Debug, Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ServerClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, RestError> {
        Self::with_timeout(base_url, token, Duration::from_secs(30))
    }

    pub fn from_settings(settings: &RelaySettings) -> Result<Self, RestError> {
        Self::with_timeout(
            &settings.server_url,
            settings.token.as_deref(),
            settings.request_timeout(),
        )
    }

    pub fn with_timeout(
        base_url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, RestError> {
        let mut base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            other => return Err(RestError::UnsupportedScheme(other.to_string())),
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("token {}", token))
                .map_err(|e| RestError::InvalidToken(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, RestError> {
        Ok(self.base_url.join(path)?)
    }

    /// WebSocket URL for a kernel's channels: `http` becomes `ws` and
    /// `https` becomes `wss`.
    pub fn kernel_channels_url(&self, kernel_id: &str, session_id: &str) -> Result<Url, RestError> {
        let mut url = self.endpoint(&format!("api/kernels/{}/channels", kernel_id))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| RestError::UnsupportedScheme(scheme.to_string()))?;
        url.query_pairs_mut().append_pair("session_id", session_id);
        Ok(url)
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Response, RestError> {
        let url = self.endpoint(path)?;
        debug!("[rest] {} {}", method, url.path());
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        check_status(request.send().await?).await
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, RestError> {
        Ok(self.call(method, path, body).await?.json().await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionModel>, RestError> {
        self.call_json(Method::GET, "api/sessions", None).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionModel, RestError> {
        self.call_json(Method::GET, &format!("api/sessions/{}", session_id), None)
            .await
    }

    /// Create a session, starting a kernel of `kernel_name` for it. The
    /// server returns the existing session if one is already open for `path`.
    pub async fn create_session(
        &self,
        path: &str,
        name: &str,
        session_type: &str,
        kernel_name: &str,
    ) -> Result<SessionModel, RestError> {
        let body = json!({
            "path": path,
            "name": name,
            "type": session_type,
            "kernel": { "name": kernel_name },
        });
        self.call_json(Method::POST, "api/sessions", Some(body)).await
    }

    /// Move a session to a new path and name.
    pub async fn rename_session(
        &self,
        session_id: &str,
        path: &str,
        name: &str,
    ) -> Result<SessionModel, RestError> {
        self.call_json(
            Method::PATCH,
            &format!("api/sessions/{}", session_id),
            Some(json!({ "path": path, "name": name })),
        )
        .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), RestError> {
        self.call(Method::DELETE, &format!("api/sessions/{}", session_id), None)
            .await?;
        Ok(())
    }

    pub async fn list_kernels(&self) -> Result<Vec<KernelModel>, RestError> {
        self.call_json(Method::GET, "api/kernels", None).await
    }

    pub async fn start_kernel(&self, kernel_name: &str) -> Result<KernelModel, RestError> {
        self.call_json(
            Method::POST,
            "api/kernels",
            Some(json!({ "name": kernel_name })),
        )
        .await
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), RestError> {
        self.call(
            Method::POST,
            &format!("api/kernels/{}/interrupt", kernel_id),
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel, RestError> {
        self.call_json(
            Method::POST,
            &format!("api/kernels/{}/restart", kernel_id),
            None,
        )
        .await
    }

    pub async fn delete_kernel(&self, kernel_id: &str) -> Result<(), RestError> {
        self.call(Method::DELETE, &format!("api/kernels/{}", kernel_id), None)
            .await?;
        Ok(())
    }

    pub async fn list_kernelspecs(&self) -> Result<KernelSpecs, RestError> {
        self.call_json(Method::GET, "api/kernelspecs", None).await
    }
}

async fn check_status(response: Response) -> Result<Response, RestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RestError::Status {
        status: status.as_u16(),
        message: error_message(status, &body),
    })
}

/// The server's `message` field if the body is JSON, else the raw body.
fn error_message(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .filter(|m| !m.is_empty());

    match from_json {
        Some(message) => message,
        None if !body.trim().is_empty() => body.trim().to_string(),
        None => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_url_maps_scheme() {
        let client = ServerClient::new("http://localhost:8888", None).unwrap();
        let url = client.kernel_channels_url("k1", "s1").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:8888/api/kernels/k1/channels?session_id=s1"
        );

        let client = ServerClient::new("https://hub.example.org/user/ada", Some("t")).unwrap();
        let url = client.kernel_channels_url("k2", "s2").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://hub.example.org/user/ada/api/kernels/k2/channels?session_id=s2"
        );
    }

    #[test]
    fn test_rejects_non_http_base() {
        let err = ServerClient::new("ftp://example.org", None).unwrap_err();
        assert!(matches!(err, RestError::UnsupportedScheme(s) if s == "ftp"));
        assert!(matches!(
            ServerClient::new("not a url", None),
            Err(RestError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(StatusCode::NOT_FOUND, r#"{"message": "Kernel does not exist: k9"}"#),
            "Kernel does not exist: k9"
        );
        assert_eq!(
            error_message(StatusCode::BAD_GATEWAY, "upstream down\n"),
            "upstream down"
        );
        assert_eq!(error_message(StatusCode::FORBIDDEN, ""), "Forbidden");
    }

    #[test]
    fn test_session_model_parses_server_json() {
        let json = r#"{
            "id": "s1",
            "path": "notebooks/demo.ipynb",
            "name": "demo.ipynb",
            "type": "notebook",
            "kernel": {
                "id": "k1",
                "name": "python3",
                "last_activity": "2024-03-01T12:00:00.000000Z",
                "execution_state": "idle",
                "connections": 1
            }
        }"#;
        let session: SessionModel = serde_json::from_str(json).unwrap();
        assert_eq!(session.session_type, "notebook");
        let kernel = session.kernel.unwrap();
        assert_eq!(kernel.execution_state.as_deref(), Some("idle"));
        assert!(kernel.last_activity.is_some());
    }

    #[test]
    fn test_kernelspecs_parse() {
        let json = r#"{
            "default": "python3",
            "kernelspecs": {
                "python3": {
                    "name": "python3",
                    "spec": {"display_name": "Python 3", "language": "python", "argv": ["python"]},
                    "resources": {"logo-64x64": "/kernelspecs/python3/logo-64x64.png"}
                }
            }
        }"#;
        let specs: KernelSpecs = serde_json::from_str(json).unwrap();
        assert_eq!(specs.default, "python3");
        assert_eq!(specs.kernelspecs["python3"].spec.display_name, "Python 3");
    }
}
