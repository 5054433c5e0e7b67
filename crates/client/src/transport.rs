use std::io;

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::auth::BoxFuture;
use crate::request::{CHAT_PATH, ChatRequest};

pub const HEALTH_PATH: &str = "/health";

/// Raw response body as it arrives off the wire, one chunk per item.
pub type BodyStream = BoxStream<'static, io::Result<Vec<u8>>>;

/// Status, content type and an unread body.
pub struct ChatResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: BodyStream,
}

impl ChatResponse {
    pub fn new(status: StatusCode, content_type: Option<String>, body: BodyStream) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    /// Builds a response whose body yields the given chunks in order.
    pub fn from_chunks<I>(status: StatusCode, content_type: Option<&str>, chunks: I) -> Self
    where
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
        I::IntoIter: Send + 'static,
    {
        Self::new(
            status,
            content_type.map(str::to_string),
            stream::iter(chunks).boxed(),
        )
    }
}

impl std::fmt::Debug for ChatResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ChatResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("invalid service url '{url}': {details}"))]
    InvalidUrl {
        stage: &'static str,
        url: String,
        details: String,
    },
    #[snafu(display("http request failed on `{stage}`: {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("i/o failed on `{stage}`: {source}"))]
    Io {
        stage: &'static str,
        source: io::Error,
    },
    #[snafu(display("health endpoint returned status {status}"))]
    HealthRejected { stage: &'static str, status: u16 },
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Sends one chat request and hands back the unread response.
pub trait ChatTransport: Send + Sync {
    fn send<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, TransportResult<ChatResponse>>;
}

/// `GET /health` report from the answering service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub vector_store_initialized: Option<bool>,
    #[serde(default)]
    pub retriever_initialized: Option<bool>,
    #[serde(default)]
    pub chain_initialized: Option<bool>,
    #[serde(default)]
    pub embedding_model: Option<String>,
}

impl HealthStatus {
    /// True when the service says it is healthy and no component reports itself down.
    pub fn is_ready(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
            && [
                self.vector_store_initialized,
                self.retriever_initialized,
                self.chain_initialized,
            ]
            .into_iter()
            .all(|flag| flag.unwrap_or(true))
    }
}

/// HTTP transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    chat_url: reqwest::Url,
    health_url: reqwest::Url,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu {
                stage: "build-http-client",
            })?;

        let base_url = base_url.trim().trim_end_matches('/');
        let chat_url = join_url(base_url, CHAT_PATH)?;
        let health_url = join_url(base_url, HEALTH_PATH)?;

        Ok(Self {
            client,
            chat_url,
            health_url,
        })
    }

    pub fn chat_url(&self) -> &reqwest::Url {
        &self.chat_url
    }

    pub async fn check_health(&self) -> TransportResult<HealthStatus> {
        let response = self
            .client
            .get(self.health_url.clone())
            .send()
            .await
            .context(HttpSnafu {
                stage: "send-health-request",
            })?;

        let status = response.status();
        if !status.is_success() {
            return HealthRejectedSnafu {
                stage: "health-http-status",
                status: status.as_u16(),
            }
            .fail();
        }

        response.json::<HealthStatus>().await.context(HttpSnafu {
            stage: "read-health-response",
        })
    }
}

impl ChatTransport for HttpTransport {
    fn send<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, TransportResult<ChatResponse>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.chat_url.clone())
                .headers(request.headers)
                .json(&request.payload)
                .send()
                .await
                .context(HttpSnafu {
                    stage: "send-chat-request",
                })?;

            let status = response.status();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            tracing::debug!(
                status = status.as_u16(),
                content_type = ?content_type,
                "chat response headers received"
            );

            let body = response
                .bytes_stream()
                .map_ok(|bytes| bytes.to_vec())
                .map_err(io::Error::other)
                .boxed();

            Ok(ChatResponse::new(status, content_type, body))
        })
    }
}

fn join_url(base_url: &str, path: &str) -> TransportResult<reqwest::Url> {
    let raw = format!("{base_url}{path}");
    reqwest::Url::parse(&raw).map_err(|error| TransportError::InvalidUrl {
        stage: "parse-service-url",
        details: error.to_string(),
        url: raw.clone(),
    })
}
