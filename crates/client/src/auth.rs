use std::fmt;
use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Bearer token issued by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Returns `None` for blank input so an empty setting never becomes an empty header.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into().trim().to_string();
        if raw.is_empty() { None } else { Some(Self(raw)) }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("AccessToken(<redacted>)")
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TokenError {
    #[snafu(display("identity provider failed on `{stage}`: {details}"))]
    Unavailable {
        stage: &'static str,
        details: String,
    },
}

pub type TokenResult<T> = Result<T, TokenError>;

/// Identity-provider seam. Token issuance and validation live elsewhere.
///
/// Errors are never fatal to an exchange; the caller proceeds unauthenticated.
pub trait TokenProvider: Send + Sync {
    fn get_token<'a>(&'a self) -> BoxFuture<'a, TokenResult<Option<AccessToken>>>;
}

/// Anonymous access.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

impl TokenProvider for NoToken {
    fn get_token<'a>(&'a self) -> BoxFuture<'a, TokenResult<Option<AccessToken>>> {
        Box::pin(async { Ok(None) })
    }
}

/// A token configured up front, e.g. from settings.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: Option<AccessToken>,
}

impl StaticToken {
    pub fn new(token: Option<AccessToken>) -> Self {
        Self { token }
    }

    pub fn from_setting(raw: Option<&str>) -> Self {
        Self::new(raw.and_then(AccessToken::new))
    }
}

impl TokenProvider for StaticToken {
    fn get_token<'a>(&'a self) -> BoxFuture<'a, TokenResult<Option<AccessToken>>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }
}
