use std::future::Future;
use std::io;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::decode::Utf8StreamDecoder;
use crate::error::{
    DecodeSnafu, ExchangeError, ExchangeResult, FailureKind, NetworkTimeoutSnafu, StreamFault,
};
use crate::transcript::{Role, TranscriptStore, Turn, TurnId};
use crate::transport::{BodyStream, ChatResponse, TransportError};

/// Rendered in place of an answer the service did not deliver in usable form.
pub const FALLBACK_ANSWER: &str = "I'm sorry, I couldn't process that request.";

/// How a successful response body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseShape {
    /// Decide per response from its `Content-Type`.
    #[default]
    Auto,
    /// Raw text chunks, no envelope.
    Streaming,
    /// One buffered JSON object carrying `answer`.
    WholePayload,
}

impl ResponseShape {
    /// Resolves `Auto` against a response's content type. JSON media types select
    /// the whole-payload shape, everything else is read as a text stream.
    pub fn resolve(self, content_type: Option<&str>) -> Self {
        match self {
            Self::Auto if content_type.is_some_and(is_json_media_type) => Self::WholePayload,
            Self::Auto => Self::Streaming,
            explicit => explicit,
        }
    }
}

fn is_json_media_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Why a whole-payload body could not supply an answer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PayloadError {
    #[snafu(display("response body is not the expected JSON object: {source}"))]
    Parse {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("response body has no `answer` field (service error: {service_error:?})"))]
    MissingAnswer {
        stage: &'static str,
        service_error: Option<String>,
    },
}

impl PayloadError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::MalformedPayload
    }
}

/// Answer text plus whatever metadata the service attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatAnswer {
    pub text: String,
    pub authenticated: Option<bool>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnswerBody {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    authenticated: Option<bool>,
    #[serde(default)]
    user_id: Option<String>,
}

/// Interpretation of one buffered response body.
#[derive(Debug)]
pub enum PayloadOutcome {
    Answer(ChatAnswer),
    Fallback(PayloadError),
    Rejected(String),
}

/// Classifies a fully buffered response without touching the transcript.
pub fn interpret_payload(status: StatusCode, body: &[u8]) -> PayloadOutcome {
    if !status.is_success() {
        return PayloadOutcome::Rejected(rejection_message(status, body));
    }

    let parsed = match serde_json::from_slice::<AnswerBody>(body).context(ParseSnafu {
        stage: "parse-answer-body",
    }) {
        Ok(parsed) => parsed,
        Err(error) => return PayloadOutcome::Fallback(error),
    };

    match parsed.answer {
        Some(text) => PayloadOutcome::Answer(ChatAnswer {
            text,
            authenticated: parsed.authenticated,
            user_id: parsed.user_id,
        }),
        None => PayloadOutcome::Fallback(PayloadError::MissingAnswer {
            stage: "extract-answer-field",
            service_error: parsed.error,
        }),
    }
}

/// Human-readable message from an error body: `detail`, then `error`, then the raw
/// text when the body is not JSON, then the status reason phrase.
pub fn rejection_message(status: StatusCode, body: &[u8]) -> String {
    let message = match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => json_message(&value),
        Err(_) => non_blank(&String::from_utf8_lossy(body)),
    };

    message.unwrap_or_else(|| {
        status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
    })
}

fn json_message(value: &serde_json::Value) -> Option<String> {
    if let serde_json::Value::String(text) = value {
        return non_blank(text);
    }

    ["detail", "error"]
        .into_iter()
        .find_map(|field| match value.get(field)? {
            serde_json::Value::String(text) => non_blank(text),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        })
}

fn non_blank(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// What one successful reconciliation did to the transcript.
#[derive(Debug)]
pub enum Reconciled {
    /// `turn` is `None` when the stream ended without any text.
    Streamed {
        turn: Option<TurnId>,
        chunk_count: usize,
        char_count: usize,
    },
    Answered {
        turn: TurnId,
        answer: ChatAnswer,
    },
    Fallback {
        turn: TurnId,
        reason: PayloadError,
    },
}

/// Running state of one streamed reply: the accumulator and the turn it feeds.
struct StreamReconciler<'a> {
    store: &'a TranscriptStore,
    assistant_text: String,
    pending_turn: Option<TurnId>,
    chunk_count: usize,
}

impl<'a> StreamReconciler<'a> {
    fn new(store: &'a TranscriptStore) -> Self {
        Self {
            store,
            assistant_text: String::new(),
            pending_turn: None,
            chunk_count: 0,
        }
    }

    fn apply(&mut self, text: &str) {
        self.chunk_count += 1;
        if text.is_empty() {
            return;
        }

        self.assistant_text.push_str(text);
        let turn = self
            .store
            .replace_or_append(Role::Assistant, self.assistant_text.clone());

        if let Some(pending) = self.pending_turn
            && pending != turn
        {
            tracing::error!(
                pending = %pending,
                written = %turn,
                "streamed text landed on a different assistant turn"
            );
        }
        self.pending_turn = Some(turn);
    }

    fn retained_chars(&self) -> usize {
        self.assistant_text.chars().count()
    }

    fn interrupted(&self, stage: &'static str, fault: StreamFault) -> ExchangeError {
        let retained_chars = self.retained_chars();
        tracing::warn!(
            stage,
            chunk_count = self.chunk_count,
            retained_chars,
            error = %fault,
            "stream interrupted; keeping partial answer"
        );
        ExchangeError::StreamInterrupted {
            stage,
            retained_chars,
            source: fault,
        }
    }

    fn finish(self) -> Reconciled {
        Reconciled::Streamed {
            turn: self.pending_turn,
            chunk_count: self.chunk_count,
            char_count: self.retained_chars(),
        }
    }
}

/// Reconciles one response into the transcript.
pub struct ResponseConsumer<'a> {
    store: &'a TranscriptStore,
    shape: ResponseShape,
    idle_timeout: Option<Duration>,
}

impl<'a> ResponseConsumer<'a> {
    pub fn new(store: &'a TranscriptStore, shape: ResponseShape) -> Self {
        Self {
            store,
            shape,
            idle_timeout: None,
        }
    }

    /// Bounds the wait for each body chunk. `None` waits forever.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub async fn consume(&self, response: ChatResponse) -> ExchangeResult<Reconciled> {
        let ChatResponse {
            status,
            content_type,
            mut body,
        } = response;

        if !status.is_success() {
            let bytes = match self.read_to_end(&mut body).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::debug!(error = %error, "failed to read error body");
                    Vec::new()
                }
            };
            return Err(ExchangeError::RemoteRejected {
                stage: "check-response-status",
                status: status.as_u16(),
                message: rejection_message(status, &bytes),
            });
        }

        match self.shape.resolve(content_type.as_deref()) {
            ResponseShape::WholePayload => self.consume_whole_payload(status, body).await,
            ResponseShape::Streaming | ResponseShape::Auto => self.consume_stream(body).await,
        }
    }

    async fn consume_stream(&self, mut body: BodyStream) -> ExchangeResult<Reconciled> {
        let mut decoder = Utf8StreamDecoder::new();
        let mut reconciler = StreamReconciler::new(self.store);
        tracing::debug!("reading streamed answer");

        loop {
            let next = match bounded(self.idle_timeout, body.next()).await {
                Ok(next) => next,
                Err(after) => {
                    return Err(
                        reconciler.interrupted("await-stream-chunk", StreamFault::Stalled { after })
                    );
                }
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(source)) => {
                    return Err(
                        reconciler.interrupted("read-stream-chunk", StreamFault::Read { source })
                    );
                }
                None => break,
            };

            let text = match decoder.decode(&chunk) {
                Ok(text) => text,
                Err(source) => {
                    reconciler.apply(source.decoded_prefix());
                    return Err(
                        reconciler.interrupted("decode-stream-chunk", StreamFault::Decode { source })
                    );
                }
            };
            reconciler.apply(&text);
        }

        if let Err(fault) = decoder.finish().context(DecodeSnafu) {
            return Err(reconciler.interrupted("finish-stream-decode", fault));
        }

        let reconciled = reconciler.finish();
        tracing::debug!(outcome = ?reconciled, "stream reached end of data");
        Ok(reconciled)
    }

    async fn consume_whole_payload(
        &self,
        status: StatusCode,
        mut body: BodyStream,
    ) -> ExchangeResult<Reconciled> {
        let bytes = self.read_to_end(&mut body).await?;

        match interpret_payload(status, &bytes) {
            PayloadOutcome::Answer(answer) => {
                tracing::debug!(
                    authenticated = ?answer.authenticated,
                    user_id = ?answer.user_id,
                    "whole-payload answer received"
                );
                let turn = self.store.append(Turn::assistant(answer.text.clone()));
                Ok(Reconciled::Answered { turn, answer })
            }
            PayloadOutcome::Fallback(reason) => {
                tracing::warn!(
                    kind = ?reason.kind(),
                    error = %reason,
                    "answer payload unusable; substituting fallback"
                );
                let turn = self.store.append(Turn::assistant(FALLBACK_ANSWER));
                Ok(Reconciled::Fallback { turn, reason })
            }
            PayloadOutcome::Rejected(message) => Err(ExchangeError::RemoteRejected {
                stage: "interpret-payload",
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn read_to_end(&self, body: &mut BodyStream) -> ExchangeResult<Vec<u8>> {
        let mut bytes = Vec::new();
        loop {
            let next = bounded(self.idle_timeout, body.next())
                .await
                .map_err(|after| {
                    NetworkTimeoutSnafu {
                        stage: "read-response-body",
                        after,
                    }
                    .build()
                })?;

            match next {
                Some(chunk) => bytes.extend_from_slice(&read_chunk(chunk)?),
                None => return Ok(bytes),
            }
        }
    }
}

fn read_chunk(chunk: io::Result<Vec<u8>>) -> ExchangeResult<Vec<u8>> {
    chunk.map_err(|source| ExchangeError::NetworkFailure {
        stage: "read-response-body",
        source: TransportError::Io {
            stage: "read-body-chunk",
            source,
        },
    })
}

/// Awaits `future`, giving up after `limit` when one is set.
pub(crate) async fn bounded<F>(limit: Option<Duration>, future: F) -> Result<F::Output, Duration>
where
    F: Future,
{
    match limit {
        Some(after) => tokio::time::timeout(after, future)
            .await
            .map_err(|_| after),
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_chunks(chunks: &[&[u8]]) -> ChatResponse {
        let chunks = chunks
            .iter()
            .map(|chunk| Ok(chunk.to_vec()))
            .collect::<Vec<_>>();
        ChatResponse::from_chunks(StatusCode::OK, Some("text/plain; charset=utf-8"), chunks)
    }

    fn json_body(status: StatusCode, body: &str) -> ChatResponse {
        ChatResponse::from_chunks(
            status,
            Some("application/json"),
            vec![Ok(body.as_bytes().to_vec())],
        )
    }

    #[test]
    fn shape_resolution_follows_content_type() {
        assert_eq!(
            ResponseShape::Auto.resolve(Some("application/json; charset=utf-8")),
            ResponseShape::WholePayload
        );
        assert_eq!(
            ResponseShape::Auto.resolve(Some("application/problem+json")),
            ResponseShape::WholePayload
        );
        assert_eq!(
            ResponseShape::Auto.resolve(Some("text/plain")),
            ResponseShape::Streaming
        );
        assert_eq!(ResponseShape::Auto.resolve(None), ResponseShape::Streaming);
        assert_eq!(
            ResponseShape::Streaming.resolve(Some("application/json")),
            ResponseShape::Streaming
        );
    }

    #[test]
    fn rejection_message_prefers_detail_then_error_then_text() {
        let status = StatusCode::UNAUTHORIZED;
        assert_eq!(
            rejection_message(status, br#"{"detail":"Token expired","error":"x"}"#),
            "Token expired"
        );
        assert_eq!(rejection_message(status, br#"{"error":"boom"}"#), "boom");
        assert_eq!(rejection_message(status, b"  gateway down "), "gateway down");
        assert_eq!(rejection_message(status, b""), "Unauthorized");
        assert_eq!(rejection_message(status, br#"{"detail":""}"#), "Unauthorized");
        assert_eq!(
            rejection_message(status, br#"{"detail":"  ","error":null}"#),
            "Unauthorized"
        );
        assert_eq!(
            rejection_message(status, br#"{"detail":"","error":"expired"}"#),
            "expired"
        );
        assert_eq!(
            rejection_message(StatusCode::UNPROCESSABLE_ENTITY, br#"{"detail":[{"loc":["body"]}]}"#),
            r#"[{"loc":["body"]}]"#
        );
    }

    #[test]
    fn payload_interpretation_is_explicit() {
        assert!(matches!(
            interpret_payload(StatusCode::OK, br#"{"answer":"Engineering","authenticated":true,"user_id":"u1"}"#),
            PayloadOutcome::Answer(ChatAnswer { ref text, authenticated: Some(true), .. }) if text == "Engineering"
        ));
        assert!(matches!(
            interpret_payload(StatusCode::OK, b"{}"),
            PayloadOutcome::Fallback(PayloadError::MissingAnswer { service_error: None, .. })
        ));
        assert!(matches!(
            interpret_payload(StatusCode::OK, br#"{"error":"chain not initialized"}"#),
            PayloadOutcome::Fallback(PayloadError::MissingAnswer { service_error: Some(_), .. })
        ));
        assert!(matches!(
            interpret_payload(StatusCode::OK, b"not json"),
            PayloadOutcome::Fallback(PayloadError::Parse { .. })
        ));
        assert!(matches!(
            interpret_payload(StatusCode::INTERNAL_SERVER_ERROR, br#"{"detail":"down"}"#),
            PayloadOutcome::Rejected(ref message) if message == "down"
        ));
    }

    #[tokio::test]
    async fn streamed_chunks_are_concatenated_in_order() {
        let store = TranscriptStore::new();
        store.append(Turn::user("What majors are available?"));

        let reconciled = ResponseConsumer::new(&store, ResponseShape::Auto)
            .consume(text_chunks(&[b"Eng", b"ineer", b"ing"]))
            .await
            .expect("stream completes");

        assert!(matches!(
            reconciled,
            Reconciled::Streamed { turn: Some(_), chunk_count: 3, char_count: 11 }
        ));
        assert_eq!(
            store.snapshot().entries(),
            vec![
                (Role::User, "What majors are available?"),
                (Role::Assistant, "Engineering"),
            ]
        );
    }

    #[tokio::test]
    async fn multibyte_split_across_chunks_is_not_mangled() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));
        let bytes = "Ingeniería".as_bytes();
        let accent = "Ingenier".len();

        ResponseConsumer::new(&store, ResponseShape::Streaming)
            .consume(text_chunks(&[&bytes[..accent + 1], &bytes[accent + 1..]]))
            .await
            .expect("stream completes");

        assert_eq!(
            store.snapshot().last().map(|turn| turn.content.as_str()),
            Some("Ingeniería")
        );
    }

    #[tokio::test]
    async fn empty_stream_creates_no_assistant_turn() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));

        let reconciled = ResponseConsumer::new(&store, ResponseShape::Streaming)
            .consume(text_chunks(&[]))
            .await
            .expect("empty stream is a success");

        assert!(matches!(
            reconciled,
            Reconciled::Streamed { turn: None, chunk_count: 0, .. }
        ));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn read_error_keeps_committed_prefix() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));
        let response = ChatResponse::from_chunks(
            StatusCode::OK,
            None,
            vec![
                Ok(b"Hel".to_vec()),
                Ok(b"lo".to_vec()),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
                Ok(b" never".to_vec()),
            ],
        );

        let error = ResponseConsumer::new(&store, ResponseShape::Auto)
            .consume(response)
            .await
            .expect_err("read error interrupts the stream");

        assert_eq!(error.kind(), FailureKind::StreamInterrupted);
        assert!(error.retained_partial_answer());
        assert_eq!(
            store.snapshot().entries(),
            vec![(Role::User, "q"), (Role::Assistant, "Hello")]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_interrupts_with_decode_fault() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));

        let error = ResponseConsumer::new(&store, ResponseShape::Streaming)
            .consume(text_chunks(&[b"ok ", b"\xff"]))
            .await
            .expect_err("invalid byte");

        assert!(matches!(
            error,
            ExchangeError::StreamInterrupted {
                retained_chars: 3,
                source: StreamFault::Decode { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn whole_payload_appends_even_after_previous_assistant_turn() {
        let store = TranscriptStore::new();
        store.append(Turn::user("first"));
        store.append(Turn::assistant("first answer"));

        ResponseConsumer::new(&store, ResponseShape::Auto)
            .consume(json_body(StatusCode::OK, r#"{"answer":"second answer"}"#))
            .await
            .expect("payload parses");

        assert_eq!(
            store.snapshot().entries(),
            vec![
                (Role::User, "first"),
                (Role::Assistant, "first answer"),
                (Role::Assistant, "second answer"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_answer_field_renders_fallback() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));

        let reconciled = ResponseConsumer::new(&store, ResponseShape::Auto)
            .consume(json_body(StatusCode::OK, "{}"))
            .await
            .expect("fallback is not a failure");

        assert!(matches!(reconciled, Reconciled::Fallback { .. }));
        assert_eq!(
            store.snapshot().last().map(|turn| turn.content.as_str()),
            Some(FALLBACK_ANSWER)
        );
    }

    #[tokio::test]
    async fn non_success_status_writes_nothing() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));

        let error = ResponseConsumer::new(&store, ResponseShape::Auto)
            .consume(json_body(StatusCode::UNAUTHORIZED, r#"{"detail":"Invalid token"}"#))
            .await
            .expect_err("401 is rejected");

        assert!(matches!(
            error,
            ExchangeError::RemoteRejected { status: 401, ref message, .. } if message == "Invalid token"
        ));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn stalled_stream_times_out_with_partial_text() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));
        let body = futures::stream::iter(vec![Ok(b"partial".to_vec())])
            .chain(futures::stream::pending())
            .boxed();
        let response = ChatResponse::new(StatusCode::OK, None, body);

        let error = ResponseConsumer::new(&store, ResponseShape::Streaming)
            .with_idle_timeout(Some(Duration::from_millis(20)))
            .consume(response)
            .await
            .expect_err("stalled stream");

        assert!(matches!(
            error,
            ExchangeError::StreamInterrupted {
                source: StreamFault::Stalled { .. },
                ..
            }
        ));
        assert_eq!(
            store.snapshot().last().map(|turn| turn.content.as_str()),
            Some("partial")
        );
    }

    #[tokio::test]
    async fn text_before_an_invalid_byte_is_kept() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));

        let error = ResponseConsumer::new(&store, ResponseShape::Streaming)
            .consume(text_chunks(&[b"Hel", b"lo\xff"]))
            .await
            .expect_err("invalid byte");

        assert!(matches!(
            error,
            ExchangeError::StreamInterrupted {
                retained_chars: 5,
                source: StreamFault::Decode { .. },
                ..
            }
        ));
        assert!(error.retained_partial_answer());
        assert_eq!(
            store.snapshot().entries(),
            vec![(Role::User, "q"), (Role::Assistant, "Hello")]
        );
    }

    #[tokio::test]
    async fn stalled_whole_payload_body_times_out() {
        let store = TranscriptStore::new();
        store.append(Turn::user("q"));
        let body = futures::stream::iter(vec![Ok(br#"{"answer":"#.to_vec())])
            .chain(futures::stream::pending())
            .boxed();
        let response = ChatResponse::new(StatusCode::OK, Some("application/json".to_string()), body);

        let error = ResponseConsumer::new(&store, ResponseShape::Auto)
            .with_idle_timeout(Some(Duration::from_millis(20)))
            .consume(response)
            .await
            .expect_err("stalled body");

        assert!(matches!(
            error,
            ExchangeError::NetworkTimeout {
                stage: "read-response-body",
                ..
            }
        ));
        assert_eq!(error.kind(), FailureKind::NetworkFailure);
        assert_eq!(store.snapshot().len(), 1);
    }
}
