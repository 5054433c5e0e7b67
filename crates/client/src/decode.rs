use snafu::Snafu;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    #[snafu(display("invalid UTF-8 sequence at stream byte {offset}"))]
    InvalidSequence {
        stage: &'static str,
        offset: u64,
        /// Complete text from the failing chunk that precedes the bad byte.
        decoded_before_error: String,
    },
    #[snafu(display("stream ended inside a UTF-8 sequence ({pending} dangling bytes)"))]
    TruncatedSequence { stage: &'static str, pending: usize },
}

impl DecodeError {
    /// Text that was decodable before the failure and has not been returned yet.
    pub fn decoded_prefix(&self) -> &str {
        match self {
            Self::InvalidSequence {
                decoded_before_error,
                ..
            } => decoded_before_error,
            Self::TruncatedSequence { .. } => "",
        }
    }
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte character split across two chunks is held back until its
/// remaining bytes arrive, so every returned string is complete.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
    consumed: u64,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes one chunk, returning all text that is complete so far.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String, DecodeError> {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let (valid_up_to, invalid) = match std::str::from_utf8(&bytes) {
            Ok(_) => (bytes.len(), false),
            Err(error) => (error.valid_up_to(), error.error_len().is_some()),
        };

        // Validated above, so nothing is ever substituted.
        let decoded = String::from_utf8_lossy(&bytes[..valid_up_to]).into_owned();
        self.consumed += valid_up_to as u64;

        if invalid {
            return InvalidSequenceSnafu {
                stage: "decode-stream-chunk",
                offset: self.consumed,
                decoded_before_error: decoded,
            }
            .fail();
        }

        // Whatever follows is an incomplete tail; keep it for the next chunk.
        self.pending = bytes.split_off(valid_up_to);
        Ok(decoded)
    }

    /// Checks that the stream did not end in the middle of a character.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            TruncatedSequenceSnafu {
                stage: "decode-stream-end",
                pending: self.pending.len(),
            }
            .fail()
        }
    }
}
