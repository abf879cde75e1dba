use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::request::Parts;
use axum_extra::headers::{authorization::Bearer, Authorization, HeaderMapExt};

/// The authenticated identity a request was made under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    name: String,
    scheme: &'static str,
}

impl Principal {
    pub fn new(name: impl Into<String>, scheme: &'static str) -> Self {
        Self {
            name: name.into(),
            scheme,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }
}

/// Derives a principal from request metadata.
///
/// Returning `None` does not reject the request; the handler sees no
/// principal and decides for itself.
#[async_trait]
pub trait PrincipalSource: Send + Sync {
    async fn authenticate(&self, parts: &Parts) -> Option<Principal>;
}

/// Maps static bearer tokens to principal names.
#[derive(Debug, Clone, Default)]
pub struct BearerTokens {
    tokens: HashMap<String, String>,
}

impl BearerTokens {
    pub fn new<I, N, T>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, T)>,
        N: Into<String>,
        T: Into<String>,
    {
        let tokens = entries
            .into_iter()
            .map(|(name, token)| (token.into(), name.into()))
            .collect();
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl PrincipalSource for BearerTokens {
    async fn authenticate(&self, parts: &Parts) -> Option<Principal> {
        let auth = parts.headers.typed_get::<Authorization<Bearer>>()?;
        self.tokens
            .get(auth.token())
            .map(|name| Principal::new(name.clone(), "Bearer"))
    }
}
