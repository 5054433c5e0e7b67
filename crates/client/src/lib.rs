#![deny(unsafe_code)]

//! Conversational exchange controller for the CollegeGPT answering service.
//!
//! [`ExchangeController`] owns the transcript and turns each `submit` into one
//! request/response exchange, reconciling either a streamed text body or a
//! single JSON payload into the transcript. Rendering is left to whatever
//! [`PresentationSink`] is subscribed.

pub mod auth;
pub mod consumer;
pub mod controller;
pub mod decode;
pub mod error;
pub mod request;
pub mod settings;
pub mod transcript;
pub mod transport;

pub use auth::{AccessToken, BoxFuture, NoToken, StaticToken, TokenError, TokenProvider};
pub use consumer::{
    ChatAnswer, FALLBACK_ANSWER, PayloadError, PayloadOutcome, Reconciled, ResponseConsumer,
    ResponseShape, interpret_payload,
};
pub use controller::{
    APOLOGY, ExchangeController, ExchangeOptions, ExchangePhase, IgnoreReason, SubmitOutcome,
};
pub use decode::{DecodeError, Utf8StreamDecoder};
pub use error::{ExchangeError, ExchangeResult, FailureKind, StreamFault};
pub use request::{ChatPayload, ChatRequest, ProfileHint};
pub use settings::{ClientSettings, SettingsError};
pub use transcript::{
    PresentationSink, Role, Transcript, TranscriptError, TranscriptStore, Turn, TurnId,
};
pub use transport::{
    BodyStream, ChatResponse, ChatTransport, HealthStatus, HttpTransport, TransportError,
};
