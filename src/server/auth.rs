//! Handshake-time authentication.

use std::collections::HashMap;

use parking_lot::RwLock;
use tungstenite::{handshake::server::Request, http::header as http_header};

use crate::{state::AuthInfo, utils::error::WebSocketError};

/// Turns an upgrade request into an identity, or refuses it.
///
/// Runs inside the handshake, before any WebSocket frame is exchanged, so it
/// must not block for long.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &Request) -> Result<AuthInfo, WebSocketError>;
}

impl<F> Authenticator for F
where
    F: Fn(&Request) -> Result<AuthInfo, WebSocketError> + Send + Sync,
{
    fn authenticate(&self, request: &Request) -> Result<AuthInfo, WebSocketError> {
        self(request)
    }
}

/// Extracts a bearer token from the `Authorization` header, falling back to a
/// `token` query parameter for browsers that cannot set headers on upgrades.
pub fn bearer_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(http_header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty());
    if from_header.is_some() {
        return from_header;
    }

    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

/// Maps fixed tokens to identities. Useful for tests and internal tools.
#[derive(Debug, Default)]
pub struct StaticTokenAuthenticator {
    tokens: RwLock<HashMap<String, AuthInfo>>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: AuthInfo) -> Self {
        self.tokens.get_mut().insert(token.into(), identity);
        self
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, request: &Request) -> Result<AuthInfo, WebSocketError> {
        let token = bearer_token(request)
            .ok_or_else(|| WebSocketError::AuthenticationError("missing token".into()))?;
        self.tokens
            .read()
            .get(&token)
            .cloned()
            .ok_or_else(|| WebSocketError::AuthenticationError("invalid token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn token_from_header_or_query() {
        assert_eq!(
            bearer_token(&request("/ws", Some("Bearer abc"))).as_deref(),
            Some("abc")
        );
        assert_eq!(
            bearer_token(&request("/ws?room=x&token=q%20t", None)).as_deref(),
            Some("q t")
        );
        assert_eq!(bearer_token(&request("/ws", Some("Basic xyz"))), None);
        assert_eq!(bearer_token(&request("/ws", None)), None);
    }

    #[test]
    fn static_tokens() {
        let auth = StaticTokenAuthenticator::new()
            .with_token("secret", AuthInfo::new("u1").with_role("admin"));
        let identity = auth.authenticate(&request("/ws", Some("Bearer secret"))).unwrap();
        assert_eq!(identity.user_id, "u1");
        assert!(auth.authenticate(&request("/ws", Some("Bearer nope"))).is_err());

        assert!(auth.revoke("secret"));
        assert!(auth.authenticate(&request("/ws", Some("Bearer secret"))).is_err());
    }

    #[test]
    fn closures_are_authenticators() {
        let allow_all = |_: &Request| -> Result<AuthInfo, WebSocketError> { Ok(AuthInfo::new("anyone")) };
        let identity = allow_all.authenticate(&request("/ws", None)).unwrap();
        assert_eq!(identity.user_id, "anyone");
    }
}
