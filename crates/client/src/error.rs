use std::io;
use std::time::Duration;

use snafu::Snafu;

use crate::decode::DecodeError;
use crate::transport::TransportError;

/// Diagnostic classification of a failed or degraded exchange.
///
/// Never shown to the end user; every kind renders as the same apology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NetworkFailure,
    RemoteRejected,
    StreamInterrupted,
    MalformedPayload,
}

/// Why a streaming body stopped before end-of-data.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamFault {
    #[snafu(display("failed to read stream chunk: {source}"))]
    Read { source: io::Error },
    #[snafu(display("failed to decode stream chunk: {source}"))]
    Decode { source: DecodeError },
    #[snafu(display("no stream data for {after:?}"))]
    Stalled { after: Duration },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExchangeError {
    #[snafu(display("network failure on `{stage}`: {source}"))]
    NetworkFailure {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("network timed out after {after:?} on `{stage}`"))]
    NetworkTimeout {
        stage: &'static str,
        after: Duration,
    },
    #[snafu(display("remote service rejected the request with status {status}: {message}"))]
    RemoteRejected {
        stage: &'static str,
        status: u16,
        message: String,
    },
    #[snafu(display("stream interrupted after {retained_chars} characters on `{stage}`: {source}"))]
    StreamInterrupted {
        stage: &'static str,
        retained_chars: usize,
        source: StreamFault,
    },
}

impl ExchangeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NetworkFailure { .. } | Self::NetworkTimeout { .. } => FailureKind::NetworkFailure,
            Self::RemoteRejected { .. } => FailureKind::RemoteRejected,
            Self::StreamInterrupted { .. } => FailureKind::StreamInterrupted,
        }
    }

    /// True when a streamed partial answer from this exchange is already in the transcript.
    pub fn retained_partial_answer(&self) -> bool {
        matches!(self, Self::StreamInterrupted { retained_chars, .. } if *retained_chars > 0)
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
