//! OAuth2 pieces: token set and store, the token endpoint seam, and the
//! interactive authorization-code flow.

pub mod flow;
pub mod token;

pub use token::{FileTokenStore, StoreError, TokenResponse, TokenSet, TokenStore};

#[derive(Debug)]
pub enum AuthError {
    Transport(String),
    /// Token endpoint answered with something other than 200.
    Exchange { status: u16, body: String },
    Json(serde_json::Error),
    InvalidToken(String),
    Url(url::ParseError),
    Listener(std::io::Error),
    TimedOut,
    Cancelled,
}

impl core::fmt::Display for AuthError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AuthError::Transport(s) => write!(f, "transport error: {}", s),
            AuthError::Exchange { status, body } => write!(f, "token endpoint http {}: {}", status, body),
            AuthError::Json(e) => write!(f, "json error: {}", e),
            AuthError::InvalidToken(s) => write!(f, "invalid token response: {}", s),
            AuthError::Url(e) => write!(f, "invalid authorization url: {}", e),
            AuthError::Listener(e) => write!(f, "redirect listener failed: {}", e),
            AuthError::TimedOut => write!(f, "no valid authorization callback before timeout"),
            AuthError::Cancelled => write!(f, "authorization cancelled"),
        }
    }
}

impl std::error::Error for AuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::Json(e) => Some(e),
            AuthError::Url(e) => Some(e),
            AuthError::Listener(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(value: serde_json::Error) -> Self {
        AuthError::Json(value)
    }
}

impl From<url::ParseError> for AuthError {
    fn from(value: url::ParseError) -> Self {
        AuthError::Url(value)
    }
}

/// The provider's token endpoint. Both grants authenticate with the client
/// credentials; neither retries.
pub trait TokenEndpoint: Send + Sync {
    /// `grant_type=authorization_code`
    fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet, AuthError>;

    /// `grant_type=refresh_token`
    fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError>;
}
