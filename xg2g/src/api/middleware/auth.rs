//! Scoped bearer-token authentication.
//!
//! The middleware only authenticates: it resolves the presented token to a
//! [`Principal`] and stores it in the request extensions. Handlers check the
//! scope they need with [`Principal::require`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::{Error, Result};

/// Header accepted as an alternative to `Authorization: Bearer`.
pub const TOKEN_HEADER: &str = "x-api-token";

/// Access level. Each scope implies the ones below it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Scope {
    Read,
    Write,
    Admin,
}

/// One configured token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiToken {
    #[serde(default)]
    pub name: Option<String>,
    pub token: String,
    pub scopes: Vec<Scope>,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub scope: Scope,
}

impl Principal {
    /// Caller used when no tokens are configured.
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
            scope: Scope::Admin,
        }
    }

    pub fn require(&self, scope: Scope) -> std::result::Result<(), ApiError> {
        if self.scope >= scope {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("{scope} scope required")))
        }
    }
}

/// Token table shared by every request.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    tokens: Arc<HashMap<String, Principal>>,
}

impl TokenAuth {
    pub fn new(tokens: &[ApiToken]) -> Self {
        let tokens = tokens
            .iter()
            .enumerate()
            .filter_map(|(index, t)| {
                let scope = t.scopes.iter().copied().max()?;
                let name = t.name.clone().unwrap_or_else(|| format!("token-{index}"));
                Some((t.token.clone(), Principal { name, scope }))
            })
            .collect();
        Self {
            tokens: Arc::new(tokens),
        }
    }

    /// With no tokens configured every request is let through.
    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn authenticate(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).cloned()
    }
}

fn extract_token(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        return value.strip_prefix("Bearer ").map(str::trim);
    }
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

/// Resolve the caller and attach a [`Principal`] to the request.
pub async fn token_auth(
    State(auth): State<TokenAuth>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let principal = if auth.is_enabled() {
        let token = extract_token(request.headers())
            .ok_or_else(|| ApiError::unauthorized("Missing API token"))?;
        auth.authenticate(token).ok_or_else(|| {
            tracing::warn!(path = %request.uri().path(), "Invalid API token provided");
            ApiError::unauthorized("Invalid API token")
        })?
    } else {
        Principal::anonymous()
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Parse `XG2G_API_TOKENS`.
///
/// Accepts a JSON array of [`ApiToken`] or the legacy
/// `token=read,write;other=admin` form.
pub fn parse_api_tokens(raw: &str) -> Result<Vec<ApiToken>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let tokens = if raw.starts_with('[') {
        serde_json::from_str::<Vec<ApiToken>>(raw)
            .map_err(|e| Error::config(format!("XG2G_API_TOKENS: invalid JSON: {e}")))?
    } else {
        if raw.contains(['[', '{']) {
            return Err(Error::config(
                "XG2G_API_TOKENS: mixes JSON and legacy token syntax",
            ));
        }
        raw.split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (token, scopes) = entry.split_once('=').ok_or_else(|| {
                    Error::config(format!("XG2G_API_TOKENS: entry without '=': '{entry}'"))
                })?;
                Ok(ApiToken {
                    name: None,
                    token: token.trim().to_string(),
                    scopes: parse_scopes(scopes)?,
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    for token in &tokens {
        if token.token.is_empty() {
            return Err(Error::config("XG2G_API_TOKENS: empty token"));
        }
        if token.scopes.is_empty() {
            return Err(Error::config("XG2G_API_TOKENS: token without scopes"));
        }
    }
    Ok(tokens)
}

/// Parse a comma-separated scope list such as `read,write`.
pub fn parse_scopes(raw: &str) -> Result<Vec<Scope>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Scope>()
                .map_err(|_| Error::config(format!("unknown API scope '{s}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_scope_ordering() {
        let writer = Principal {
            name: "w".into(),
            scope: Scope::Write,
        };
        assert!(writer.require(Scope::Read).is_ok());
        assert!(writer.require(Scope::Write).is_ok());
        assert!(writer.require(Scope::Admin).is_err());
    }

    #[test]
    fn test_parse_json_tokens() {
        let tokens = parse_api_tokens(
            r#"[{"token": "abc", "scopes": ["read"]}, {"name": "ops", "token": "def", "scopes": ["admin"]}]"#,
        )
        .unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].name.as_deref(), Some("ops"));

        let auth = TokenAuth::new(&tokens);
        assert_eq!(auth.authenticate("abc").unwrap().scope, Scope::Read);
        assert_eq!(auth.authenticate("def").unwrap().name, "ops");
        assert!(auth.authenticate("nope").is_none());
    }

    #[test]
    fn test_parse_legacy_tokens() {
        let tokens = parse_api_tokens("tok=read,write; tok2=admin").unwrap();
        assert_eq!(tokens[0].scopes, vec![Scope::Read, Scope::Write]);
        assert_eq!(tokens[1].scopes, vec![Scope::Admin]);

        let auth = TokenAuth::new(&tokens);
        assert_eq!(auth.authenticate("tok").unwrap().scope, Scope::Write);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_api_tokens("tok=read,bogus").is_err());
        assert!(parse_api_tokens("tok").is_err());
        assert!(parse_api_tokens(r#"tok=read;[{"token":"x","scopes":["read"]}]"#).is_err());
        assert!(parse_api_tokens(r#"[{"token": "", "scopes": ["read"]}]"#).is_err());
        assert!(parse_api_tokens("  ").unwrap().is_empty());
    }

    #[test]
    fn test_extract_token() {
        let mut headers = HeaderMap::new();
        assert!(extract_token(&headers).is_none());

        headers.insert(TOKEN_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(extract_token(&headers), Some("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_token(&headers), Some("xyz"));
    }
}
