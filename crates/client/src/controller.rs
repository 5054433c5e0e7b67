use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;

use crate::auth::{AccessToken, TokenProvider};
use crate::consumer::{Reconciled, ResponseConsumer, ResponseShape, bounded};
use crate::error::{ExchangeError, ExchangeResult, NetworkFailureSnafu, NetworkTimeoutSnafu};
use crate::request::{self, ProfileHint};
use crate::settings::ClientSettings;
use crate::transcript::{PresentationSink, Transcript, TranscriptStore, Turn};
use crate::transport::{ChatTransport, HttpTransport, TransportResult};

/// The only text a user ever sees for a failed exchange.
pub const APOLOGY: &str = "Something went wrong.";

/// Where the controller is in its per-submit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExchangePhase {
    #[default]
    Idle,
    Sending,
    Reconciling,
}

impl ExchangePhase {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Sending => 1,
            Self::Reconciling => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Sending,
            2 => Self::Reconciling,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IgnoreReason {
    /// Another exchange is still in flight.
    Busy,
    /// Nothing but whitespace was submitted.
    BlankInput,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Ignored(IgnoreReason),
    Completed(Reconciled),
    /// The apology turn has been written (or a partial answer kept); the error is for diagnostics.
    Failed(ExchangeError),
}

impl SubmitOutcome {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// Knobs that shape one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExchangeOptions {
    pub response_shape: ResponseShape,
    pub request_timeout: Option<Duration>,
    pub stream_idle_timeout: Option<Duration>,
}

impl ExchangeOptions {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            response_shape: settings.response_shape,
            request_timeout: settings.request_timeout(),
            stream_idle_timeout: settings.stream_idle_timeout(),
        }
    }
}

/// Owns the transcript and runs at most one exchange at a time.
pub struct ExchangeController {
    transport: Arc<dyn ChatTransport>,
    tokens: Arc<dyn TokenProvider>,
    profile: ProfileHint,
    options: ExchangeOptions,
    transcript: TranscriptStore,
    busy: AtomicBool,
    phase: AtomicU8,
}

impl ExchangeController {
    pub fn new(transport: Arc<dyn ChatTransport>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            transport,
            tokens,
            profile: ProfileHint::anonymous(),
            options: ExchangeOptions::default(),
            transcript: TranscriptStore::new(),
            busy: AtomicBool::new(false),
            phase: AtomicU8::new(ExchangePhase::Idle.as_u8()),
        }
    }

    /// Wires an HTTP transport, static token source and profile hint from settings.
    pub fn from_settings(settings: &ClientSettings) -> TransportResult<Self> {
        let transport = HttpTransport::new(&settings.base_url)?;
        Ok(Self::new(Arc::new(transport), Arc::new(settings.token_provider()))
            .with_profile(settings.profile_hint())
            .with_options(ExchangeOptions::from_settings(settings)))
    }

    pub fn with_profile(mut self, profile: ProfileHint) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_options(mut self, options: ExchangeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.snapshot()
    }

    pub fn subscribe(&self, sink: Arc<dyn PresentationSink>) {
        self.transcript.subscribe(sink);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ExchangePhase {
        ExchangePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Runs one exchange for `user_text`.
    ///
    /// Returns immediately with [`SubmitOutcome::Ignored`] while another exchange is in
    /// flight. Failures never propagate: they become a single apology turn.
    pub async fn submit(&self, user_text: &str) -> SubmitOutcome {
        if user_text.trim().is_empty() {
            return SubmitOutcome::Ignored(IgnoreReason::BlankInput);
        }

        let Some(guard) = BusyGuard::acquire(self) else {
            tracing::debug!("submit ignored while an exchange is in flight");
            return SubmitOutcome::Ignored(IgnoreReason::Busy);
        };

        self.transcript.append(Turn::user(user_text));

        match self.run_exchange(user_text, &guard).await {
            Ok(reconciled) => SubmitOutcome::Completed(reconciled),
            Err(error) => {
                self.recover(&error);
                SubmitOutcome::Failed(error)
            }
        }
    }

    async fn run_exchange(
        &self,
        user_text: &str,
        guard: &BusyGuard<'_>,
    ) -> ExchangeResult<Reconciled> {
        let token = self.resolve_token().await;
        let request = request::build(user_text, token.as_ref(), &self.profile);
        tracing::debug!(
            authenticated = request.is_authenticated(),
            personalized = request.payload.user_name.is_some(),
            "dispatching chat request"
        );

        let response = bounded(self.options.request_timeout, self.transport.send(request))
            .await
            .map_err(|after| {
                NetworkTimeoutSnafu {
                    stage: "await-response-headers",
                    after,
                }
                .build()
            })?
            .context(NetworkFailureSnafu {
                stage: "send-chat-request",
            })?;

        guard.advance(ExchangePhase::Reconciling);

        ResponseConsumer::new(&self.transcript, self.options.response_shape)
            .with_idle_timeout(self.options.stream_idle_timeout)
            .consume(response)
            .await
    }

    async fn resolve_token(&self) -> Option<AccessToken> {
        match self.tokens.get_token().await {
            Ok(token) => token,
            Err(error) => {
                tracing::warn!(error = %error, "token provider failed; sending unauthenticated");
                None
            }
        }
    }

    fn recover(&self, error: &ExchangeError) {
        tracing::warn!(kind = ?error.kind(), error = %error, "exchange failed");

        if error.retained_partial_answer() {
            return;
        }
        self.transcript.append(Turn::assistant(APOLOGY));
    }
}

/// Holds the busy flag for the lifetime of one exchange.
///
/// Dropping it, including when a `submit` future is dropped mid-flight, returns the
/// controller to `Idle`.
struct BusyGuard<'a> {
    controller: &'a ExchangeController,
}

impl<'a> BusyGuard<'a> {
    fn acquire(controller: &'a ExchangeController) -> Option<Self> {
        controller
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        let guard = Self { controller };
        guard.advance(ExchangePhase::Sending);
        Some(guard)
    }

    fn advance(&self, phase: ExchangePhase) {
        self.controller.phase.store(phase.as_u8(), Ordering::Release);
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.advance(ExchangePhase::Idle);
        self.controller.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use futures::StreamExt;
    use reqwest::StatusCode;
    use tokio::sync::Notify;

    use super::*;
    use crate::auth::{BoxFuture, NoToken};
    use crate::request::ChatRequest;
    use crate::transcript::Role;
    use crate::transport::{ChatResponse, TransportError};

    struct Unreachable;

    impl ChatTransport for Unreachable {
        fn send<'a>(&'a self, _request: ChatRequest) -> BoxFuture<'a, TransportResult<ChatResponse>> {
            Box::pin(async {
                Err(TransportError::Io {
                    stage: "connect",
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
                })
            })
        }
    }

    struct Never;

    impl ChatTransport for Never {
        fn send<'a>(&'a self, _request: ChatRequest) -> BoxFuture<'a, TransportResult<ChatResponse>> {
            Box::pin(futures::future::pending())
        }
    }

    struct Echo;

    impl ChatTransport for Echo {
        fn send<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, TransportResult<ChatResponse>> {
            Box::pin(async move {
                Ok(ChatResponse::from_chunks(
                    StatusCode::OK,
                    Some("text/plain"),
                    vec![Ok(request.payload.question.into_bytes())],
                ))
            })
        }
    }

    /// Holds the exchange in `send` until `send_gate` fires, then in the body until `body_gate` does.
    struct Gated {
        send_gate: Arc<Notify>,
        body_gate: Arc<Notify>,
    }

    impl ChatTransport for Gated {
        fn send<'a>(&'a self, _request: ChatRequest) -> BoxFuture<'a, TransportResult<ChatResponse>> {
            Box::pin(async move {
                self.send_gate.notified().await;
                let body_gate = Arc::clone(&self.body_gate);
                let body = futures::stream::once(async move {
                    body_gate.notified().await;
                    Ok::<_, io::Error>(b"done".to_vec())
                })
                .boxed();
                Ok(ChatResponse::new(StatusCode::OK, Some("text/plain".to_string()), body))
            })
        }
    }

    async fn wait_for_phase(controller: &ExchangeController, phase: ExchangePhase) {
        while controller.phase() != phase {
            tokio::task::yield_now().await;
        }
    }

    fn controller(transport: impl ChatTransport + 'static) -> ExchangeController {
        ExchangeController::new(Arc::new(transport), Arc::new(NoToken))
    }

    #[tokio::test]
    async fn network_failure_becomes_single_apology_and_clears_busy() {
        let controller = controller(Unreachable);

        let outcome = controller.submit("hello").await;
        assert!(matches!(
            outcome,
            SubmitOutcome::Failed(ref error) if error.kind() == crate::FailureKind::NetworkFailure
        ));
        assert_eq!(
            controller.transcript().entries(),
            vec![(Role::User, "hello"), (Role::Assistant, APOLOGY)]
        );
        assert!(!controller.is_busy());
        assert_eq!(controller.phase(), ExchangePhase::Idle);
    }

    #[tokio::test]
    async fn blank_input_is_ignored_without_touching_transcript() {
        let controller = controller(Echo);
        assert!(matches!(
            controller.submit("   ").await,
            SubmitOutcome::Ignored(IgnoreReason::BlankInput)
        ));
        assert!(controller.transcript().is_empty());
    }

    #[tokio::test]
    async fn request_timeout_is_a_network_failure() {
        let controller = controller(Never).with_options(ExchangeOptions {
            request_timeout: Some(Duration::from_millis(20)),
            ..ExchangeOptions::default()
        });

        let outcome = controller.submit("hello").await;
        assert!(matches!(
            outcome,
            SubmitOutcome::Failed(ExchangeError::NetworkTimeout { .. })
        ));
        assert_eq!(
            controller.transcript().last().map(|turn| turn.content.as_str()),
            Some(APOLOGY)
        );
    }

    #[tokio::test]
    async fn dropped_submit_releases_busy_flag() {
        let controller = controller(Never);
        let pending = controller.submit("hello");
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert!(!controller.is_busy());
        assert_eq!(controller.phase(), ExchangePhase::Idle);
    }

    #[tokio::test]
    async fn consecutive_exchanges_each_get_their_own_reply() {
        let controller = controller(Echo);
        controller.submit("one").await;
        controller.submit("two").await;

        assert_eq!(
            controller.transcript().entries(),
            vec![
                (Role::User, "one"),
                (Role::Assistant, "one"),
                (Role::User, "two"),
                (Role::Assistant, "two"),
            ]
        );
    }

    #[tokio::test]
    async fn phase_moves_through_sending_and_reconciling() {
        let send_gate = Arc::new(Notify::new());
        let body_gate = Arc::new(Notify::new());
        let controller = controller(Gated {
            send_gate: Arc::clone(&send_gate),
            body_gate: Arc::clone(&body_gate),
        });
        assert_eq!(controller.phase(), ExchangePhase::Idle);

        let (outcome, ()) = tokio::join!(controller.submit("hello"), async {
            wait_for_phase(&controller, ExchangePhase::Sending).await;
            assert!(controller.is_busy());
            send_gate.notify_one();

            wait_for_phase(&controller, ExchangePhase::Reconciling).await;
            assert!(controller.is_busy());
            body_gate.notify_one();
        });

        assert!(matches!(outcome, SubmitOutcome::Completed(_)));
        assert_eq!(controller.phase(), ExchangePhase::Idle);
        assert!(!controller.is_busy());
        assert_eq!(
            controller.transcript().last().map(|turn| turn.content.as_str()),
            Some("done")
        );
    }
}
