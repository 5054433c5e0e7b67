use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;

use crate::auth::AccessToken;

pub const CHAT_PATH: &str = "/api/chat";

/// Cosmetic personalisation derived from the caller's profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileHint {
    pub display_name: Option<String>,
}

impl ProfileHint {
    pub fn new(display_name: Option<String>) -> Self {
        let display_name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        Self { display_name }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// JSON body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatPayload {
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

/// One fully assembled outgoing request, independent of the transport that sends it.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub headers: HeaderMap,
    pub payload: ChatPayload,
}

impl ChatRequest {
    pub fn is_authenticated(&self) -> bool {
        self.headers.contains_key(AUTHORIZATION)
    }
}

/// Assembles the request for one user turn.
///
/// A missing token is not an error: the remote service decides whether to reject.
pub fn build(user_text: &str, token: Option<&AccessToken>, profile: &ProfileHint) -> ChatRequest {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(token) = token {
        match HeaderValue::from_str(&format!("Bearer {}", token.expose())) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(error) => {
                tracing::warn!(
                    stage = "build-authorization-header",
                    error = %error,
                    "token is not a valid header value; sending unauthenticated"
                );
            }
        }
    }

    ChatRequest {
        headers,
        payload: ChatPayload {
            question: user_text.to_string(),
            user_name: profile.display_name.clone(),
        },
    }
}
