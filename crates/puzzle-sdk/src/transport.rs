use std::sync::Arc;
use std::time::Duration;

use puzzle_proto::{SESSION_FIELD, SESSION_HEADER};
use reqwest::{multipart, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::session_store::SessionStore;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not encode request body: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("could not decode reply from {path} (status {status}): {source}")]
    Decode {
        path: String,
        status: StatusCode,
        body: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Body variants the game server accepts.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Form(Vec<(&'static str, String)>),
    Multipart(Vec<(&'static str, String)>),
    Json(Value),
}

#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
}

impl RequestSpec {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: RequestBody::Empty,
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// Used when the caller does not pick a request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply status together with the decoded body. The body is decoded even
/// for non-2xx replies since the server reports domain errors in JSON.
#[derive(Debug, Clone)]
pub struct TransportResponse<T> {
    pub status: StatusCode,
    pub ok: bool,
    pub body: T,
}

/// Wraps every call to the game server: attaches the cached session id and
/// caches whatever id the server hands back.
#[derive(Clone)]
pub struct SessionTransport {
    http: Client,
    base_url: String,
    sessions: Arc<dyn SessionStore>,
}

impl SessionTransport {
    /// Requests that take longer than `request_timeout` fail with
    /// [`TransportError::Http`].
    pub fn new(
        base_url: impl Into<String>,
        sessions: Arc<dyn SessionStore>,
        request_timeout: Duration,
    ) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|err| {
                warn!(target: "puzzle::transport", error = %err, "falling back to a default http client");
                Client::new()
            });
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            sessions,
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub async fn send<T>(&self, request: RequestSpec) -> Result<TransportResponse<T>, TransportError>
    where
        T: DeserializeOwned,
    {
        let RequestSpec { method, path, body } = request;
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method.clone(), url);

        let session_id = self.sessions.get().unwrap_or_default();
        if !session_id.is_empty() {
            builder = builder.header(SESSION_HEADER, session_id.as_str());
        }

        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Multipart(fields) => {
                let form = fields
                    .into_iter()
                    .fold(multipart::Form::new(), |form, (name, value)| {
                        form.text(name, value)
                    });
                builder.multipart(form)
            }
            RequestBody::Json(value) => builder.json(&value),
        };

        trace!(
            target: "puzzle::transport",
            method = %method,
            path = %path,
            with_session = !session_id.is_empty(),
            "sending request"
        );
        let res = builder.send().await?;
        let status = res.status();
        let text = res.text().await?;

        let value: Value = serde_json::from_str(&text).map_err(|source| TransportError::Decode {
            path: path.clone(),
            status,
            body: text.clone(),
            source,
        })?;

        if let Some(issued) = value.get(SESSION_FIELD).and_then(Value::as_str) {
            if issued != session_id {
                debug!(
                    target: "puzzle::transport",
                    path = %path,
                    rotated = !session_id.is_empty(),
                    "caching session id issued by server"
                );
            }
            self.sessions.set(issued.to_string());
        }

        let body = serde_json::from_value(value).map_err(|source| TransportError::Decode {
            path,
            status,
            body: text,
            source,
        })?;

        Ok(TransportResponse {
            status,
            ok: status.is_success(),
            body,
        })
    }
}
