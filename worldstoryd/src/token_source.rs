use std::future::{Future, ready};
use std::path::PathBuf;
use std::pin::Pin;

use tracing::warn;

pub const ACCESS_TOKEN_ENV: &str = "WORLDSTORY_ACCESS_TOKEN";

/// Supplies the bearer token attached to replayed requests.
///
/// Consulted once per request, so rotated credentials are picked up without a restart.
/// `None` sends the request without an `Authorization` header.
pub trait AccessTokenSource: Send + Sync {
    fn access_token(&self) -> TokenFuture<'_>;
}

pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(non_empty(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl AccessTokenSource for StaticToken {
    fn access_token(&self) -> TokenFuture<'_> {
        Box::pin(ready(self.0.clone()))
    }
}

/// Reads the token from an environment variable on every request.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvToken {
    fn default() -> Self {
        Self::new(ACCESS_TOKEN_ENV)
    }
}

impl AccessTokenSource for EnvToken {
    fn access_token(&self) -> TokenFuture<'_> {
        Box::pin(ready(std::env::var(&self.var).ok().and_then(non_empty)))
    }
}

/// Reads the token from a file, e.g. one written by the web app's login flow.
#[derive(Debug, Clone)]
pub struct FileToken {
    path: PathBuf,
}

impl FileToken {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AccessTokenSource for FileToken {
    fn access_token(&self) -> TokenFuture<'_> {
        Box::pin(async move {
            match tokio::fs::read_to_string(&self.path).await {
                Ok(contents) => non_empty(contents),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
                Err(err) => {
                    warn!(path = %self.path.display(), error = %err, "failed to read access token file");
                    None
                }
            }
        })
    }
}

fn non_empty(token: String) -> Option<String> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
