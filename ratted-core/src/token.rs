//! Credential seam: the session asks a provider for the bearer token instead of reading global state.

/// Supplies the bearer token sent with `auth`.
pub trait TokenProvider: Send + Sync {
    /// `None` when no token is configured.
    fn token(&self) -> Option<String>;
}

/// A token known up front.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        let t = self.0.trim();
        (!t.is_empty()).then(|| t.to_string())
    }
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}
