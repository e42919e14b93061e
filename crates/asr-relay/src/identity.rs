//! Client identity: who is on the other end of a browser socket.
//!
//! Identities come from a token presented during the WebSocket handshake,
//! either as `?token=...` or an `Authorization: Bearer ...` header. Tokens are
//! looked up in the static table first, then verified as signed tokens.
//!
//! Signed token format: `hex(user_id:role:expiry).hex(hmac_sha256)`.

use asr_core::{AsrError, AsrResult};
use ring::hmac;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tracing::debug;

use crate::config::AuthSection;

/// Authorized user attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
    /// Unix seconds; `None` never expires.
    pub expires_at: Option<u64>,
}

impl Identity {
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }
}

/// What the server saw during the upgrade request.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub remote_addr: SocketAddr,
    pub path: String,
    pub query_token: Option<String>,
    pub bearer_token: Option<String>,
}

impl HandshakeContext {
    pub fn from_request(request: &Request, remote_addr: SocketAddr) -> Self {
        let uri = request.uri();
        let query_token = uri.query().and_then(|q| query_param(q, "token"));
        let bearer_token = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            })
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self {
            remote_addr,
            path: uri.path().to_string(),
            query_token,
            bearer_token,
        }
    }

    /// The presented token. The query parameter wins over the header.
    pub fn token(&self) -> Option<&str> {
        self.query_token
            .as_deref()
            .or(self.bearer_token.as_deref())
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

/// Resolves a handshake into an [`Identity`].
pub trait IdentityProvider: Send + Sync {
    /// `None` means the connection is not authorized.
    fn resolve(&self, ctx: &HandshakeContext) -> Option<Identity>;
}

/// Static token table plus optional HMAC-signed tokens.
pub struct TokenIdentityProvider {
    static_tokens: HashMap<String, Identity>,
    secret: Option<Vec<u8>>,
}

impl TokenIdentityProvider {
    pub fn new(static_tokens: HashMap<String, Identity>, secret: Option<Vec<u8>>) -> Self {
        Self {
            static_tokens,
            secret,
        }
    }

    pub fn from_config(auth: &AuthSection) -> AsrResult<Self> {
        let secret = auth
            .token_secret
            .as_deref()
            .map(|s| {
                hex::decode(s.trim())
                    .map_err(|e| AsrError::Config(format!("token_secret is not valid hex: {e}")))
            })
            .transpose()?;

        let static_tokens = auth
            .static_tokens
            .iter()
            .map(|(token, entry)| {
                (
                    token.clone(),
                    Identity {
                        user_id: entry.user_id.clone(),
                        role: entry.role.clone(),
                        expires_at: None,
                    },
                )
            })
            .collect();

        Ok(Self::new(static_tokens, secret))
    }

    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.static_tokens.is_empty() && self.secret.is_none()
    }
}

impl IdentityProvider for TokenIdentityProvider {
    fn resolve(&self, ctx: &HandshakeContext) -> Option<Identity> {
        let token = ctx.token()?;
        if let Some(identity) = self.static_tokens.get(token) {
            return Some(identity.clone());
        }
        let secret = self.secret.as_deref()?;
        match verify_token(secret, token) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!(remote = %ctx.remote_addr, error = %e, "token rejected");
                None
            }
        }
    }
}

/// Issue a signed token for `user_id` valid for `ttl_secs`.
pub fn create_token(secret: &[u8], user_id: &str, role: &str, ttl_secs: u64) -> String {
    let expiry = now_secs() + ttl_secs;
    let payload = format!("{user_id}:{role}:{expiry}");
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, payload.as_bytes());
    format!("{}.{}", hex::encode(payload), hex::encode(tag.as_ref()))
}

/// Check signature and expiry of a signed token.
pub fn verify_token(secret: &[u8], token: &str) -> AsrResult<Identity> {
    let (payload_hex, tag_hex) = token
        .split_once('.')
        .ok_or_else(|| AsrError::AuthFailed("malformed token".into()))?;
    let payload =
        hex::decode(payload_hex).map_err(|_| AsrError::AuthFailed("malformed token".into()))?;
    let tag = hex::decode(tag_hex).map_err(|_| AsrError::AuthFailed("malformed token".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &payload, &tag)
        .map_err(|_| AsrError::AuthFailed("invalid token signature".into()))?;

    let payload = String::from_utf8(payload)
        .map_err(|_| AsrError::AuthFailed("malformed token".into()))?;
    let mut parts = payload.rsplitn(3, ':');
    let (Some(expiry), Some(role), Some(user_id)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AsrError::AuthFailed("malformed token".into()));
    };
    let expiry: u64 = expiry
        .parse()
        .map_err(|_| AsrError::AuthFailed("malformed token".into()))?;
    if user_id.is_empty() {
        return Err(AsrError::AuthFailed("token has no user".into()));
    }

    let identity = Identity {
        user_id: user_id.to_string(),
        role: role.to_string(),
        expires_at: Some(expiry),
    };
    if identity.is_expired() {
        return Err(AsrError::AuthFailed("token expired".into()));
    }
    Ok(identity)
}

/// Generate a random 32-byte secret.
pub fn generate_secret() -> AsrResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let mut secret = vec![0u8; 32];
    SystemRandom::new()
        .fill(&mut secret)
        .map_err(|_| AsrError::Other("RNG failure".into()))?;
    Ok(secret)
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(query: Option<&str>, bearer: Option<&str>) -> HandshakeContext {
        HandshakeContext {
            remote_addr: "127.0.0.1:5000".parse().unwrap(),
            path: "/asr".into(),
            query_token: query.map(String::from),
            bearer_token: bearer.map(String::from),
        }
    }

    fn signed_token(secret: &[u8], user_id: &str, expiry: u64) -> String {
        let payload = format!("{user_id}:user:{expiry}");
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        let tag = hmac::sign(&key, payload.as_bytes());
        format!("{}.{}", hex::encode(payload), hex::encode(tag.as_ref()))
    }

    #[test]
    fn create_and_verify() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "alice", "admin", 3600);
        let identity = verify_token(&secret, &token).unwrap();
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.role, "admin");
        assert!(!identity.is_expired());
    }

    #[test]
    fn user_id_may_contain_colons() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "org:alice", "user", 60);
        assert_eq!(verify_token(&secret, &token).unwrap().user_id, "org:alice");
    }

    #[test]
    fn wrong_secret() {
        let token = create_token(&generate_secret().unwrap(), "alice", "user", 3600);
        let err = verify_token(&generate_secret().unwrap(), &token).unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn expired_token() {
        let secret = generate_secret().unwrap();
        let token = signed_token(&secret, "alice", now_secs() - 10);
        let err = verify_token(&secret, &token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn malformed_tokens() {
        let secret = generate_secret().unwrap();
        for token in ["", "nodot", "zz.zz", "00.00"] {
            assert!(verify_token(&secret, token).is_err(), "{token}");
        }
    }

    #[test]
    fn provider_prefers_static_tokens() {
        let mut table = HashMap::new();
        table.insert(
            "dev".to_string(),
            Identity {
                user_id: "dev-user".into(),
                role: "user".into(),
                expires_at: None,
            },
        );
        let provider = TokenIdentityProvider::new(table, None);

        assert_eq!(provider.resolve(&ctx(Some("dev"), None)).unwrap().user_id, "dev-user");
        assert_eq!(provider.resolve(&ctx(None, Some("dev"))).unwrap().user_id, "dev-user");
        assert!(provider.resolve(&ctx(Some("nope"), None)).is_none());
        assert!(provider.resolve(&ctx(None, None)).is_none());
    }

    #[test]
    fn provider_verifies_signed_tokens() {
        let secret = generate_secret().unwrap();
        let provider = TokenIdentityProvider::new(HashMap::new(), Some(secret.clone()));
        let token = create_token(&secret, "bob", "user", 60);
        assert_eq!(provider.resolve(&ctx(Some(&token), None)).unwrap().user_id, "bob");

        let stale = signed_token(&secret, "bob", now_secs() - 1);
        assert!(provider.resolve(&ctx(Some(&stale), None)).is_none());
    }

    #[test]
    fn handshake_context_from_request() {
        let request = Request::builder()
            .uri("/asr?lang=en&token=abc123")
            .header("Authorization", "Bearer header-token")
            .body(())
            .unwrap();
        let ctx = HandshakeContext::from_request(&request, "10.0.0.1:4000".parse().unwrap());
        assert_eq!(ctx.path, "/asr");
        assert_eq!(ctx.query_token.as_deref(), Some("abc123"));
        assert_eq!(ctx.bearer_token.as_deref(), Some("header-token"));
        assert_eq!(ctx.token(), Some("abc123"));
    }

    #[test]
    fn expiry_boundary() {
        let identity = Identity {
            user_id: "u".into(),
            role: "user".into(),
            expires_at: Some(100),
        };
        assert!(!identity.is_expired_at(100));
        assert!(identity.is_expired_at(101));
    }
}
