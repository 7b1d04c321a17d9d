//! Asynchronous client for the puzzle game server.
//!
//! Every call goes through [`SessionTransport`], which attaches the cached
//! session identifier and caches the one the server issues. Replies are
//! returned as-is; deciding what an `error` field means is left to the
//! caller.

mod session_store;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use puzzle_proto::{
    CheckAnswersReply, CheckAnswersRequest, ImageReply, NextLevelReply, QuestionsReply,
    RegisterReply, SaveScoreReply, SaveScoreRequest, ShuffleReply, SwapReply, SwapRequest,
    ValidateReply, WinnersReply,
};
use serde::Serialize;

pub use session_store::{MemorySessionStore, SessionStore};
pub use transport::{
    RequestBody, RequestSpec, SessionTransport, TransportError, TransportResponse,
    DEFAULT_REQUEST_TIMEOUT,
};

pub type Reply<T> = Result<TransportResponse<T>, TransportError>;

#[derive(Clone)]
pub struct GameClient {
    transport: SessionTransport,
}

impl GameClient {
    pub fn new(base_url: impl Into<String>, sessions: Arc<dyn SessionStore>) -> Self {
        Self::with_timeout(base_url, sessions, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        sessions: Arc<dyn SessionStore>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport: SessionTransport::new(base_url, sessions, request_timeout),
        }
    }

    pub fn transport(&self) -> &SessionTransport {
        &self.transport
    }

    pub fn session_id(&self) -> Option<String> {
        self.transport.sessions().get()
    }

    /// Drops the cached session so the next request starts a fresh one.
    pub fn clear_session(&self) {
        self.transport.sessions().clear();
    }

    pub async fn register(&self, username: &str) -> Reply<RegisterReply> {
        let body = RequestBody::Form(vec![("username", username.to_string())]);
        self.transport
            .send(RequestSpec::post("/register").with_body(body))
            .await
    }

    pub async fn image(&self) -> Reply<ImageReply> {
        self.transport.send(RequestSpec::get("/image")).await
    }

    pub async fn questions(&self) -> Reply<QuestionsReply> {
        self.transport.send(RequestSpec::get("/questions")).await
    }

    pub async fn shuffle(&self) -> Reply<ShuffleReply> {
        self.transport.send(RequestSpec::post("/shuffle")).await
    }

    pub async fn swap(&self, request: SwapRequest) -> Reply<SwapReply> {
        let body = RequestBody::Multipart(vec![
            ("index1", request.index1.to_string()),
            ("index2", request.index2.to_string()),
        ]);
        self.transport
            .send(RequestSpec::post("/swap").with_body(body))
            .await
    }

    pub async fn validate(&self) -> Reply<ValidateReply> {
        self.transport.send(RequestSpec::post("/validate")).await
    }

    pub async fn check_answers(&self, request: &CheckAnswersRequest) -> Reply<CheckAnswersReply> {
        self.post_json("/check_answers", request).await
    }

    pub async fn save_score(&self, request: &SaveScoreRequest) -> Reply<SaveScoreReply> {
        self.post_json("/save_score", request).await
    }

    pub async fn next_level(&self) -> Reply<NextLevelReply> {
        self.transport.send(RequestSpec::post("/next_level")).await
    }

    pub async fn winners(&self) -> Reply<WinnersReply> {
        self.transport.send(RequestSpec::get("/winner")).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Reply<T>
    where
        B: Serialize,
        T: serde::de::DeserializeOwned,
    {
        let value = serde_json::to_value(body).map_err(TransportError::Encode)?;
        self.transport
            .send(RequestSpec::post(path).with_body(RequestBody::Json(value)))
            .await
    }
}
