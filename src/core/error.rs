use thiserror::Error;

/// Failure classes surfaced by the generation pipeline.
///
/// Functions in this crate return `anyhow::Result`; a `StoryError` is attached
/// wherever the caller needs to branch on the kind of failure (retry, abort,
/// report to the user).
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not parse model output: {0}")]
    Parse(String),

    #[error("request blocked by content policy: {0}")]
    ContentPolicy(String),

    #[error("service temporarily unavailable: {0}")]
    TransientService(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The provider refused the request itself (bad parameter, payload too large).
    #[error("request rejected: {0}")]
    Request(String),

    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Parse,
    ContentPolicy,
    Transient,
    Precondition,
    NotFound,
    Request,
    Other,
}

impl StoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoryError::Configuration(_) => ErrorClass::Configuration,
            StoryError::Parse(_) => ErrorClass::Parse,
            StoryError::ContentPolicy(_) => ErrorClass::ContentPolicy,
            StoryError::TransientService(_) => ErrorClass::Transient,
            StoryError::Precondition(_) => ErrorClass::Precondition,
            StoryError::NotFound(_) => ErrorClass::NotFound,
            StoryError::Request(_) => ErrorClass::Request,
        }
    }

    /// Finds the first `StoryError` in an error chain and reports its class.
    pub fn classify(err: &anyhow::Error) -> ErrorClass {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<StoryError>())
            .map(StoryError::class)
            .unwrap_or(ErrorClass::Other)
    }

    /// Maps an HTTP failure from a provider onto the taxonomy.
    ///
    /// An unknown model or endpoint (404) is a configuration problem; any
    /// other unlisted 4xx is a rejected request and is not retried.
    pub fn from_http(provider: &str, status: u16, body: &str) -> Self {
        let message = format!("{} returned {}: {}", provider, status, body.trim());
        match status {
            401 | 403 if !is_policy_text(body) => StoryError::Configuration(message),
            404 => StoryError::Configuration(message),
            408 | 429 | 500..=599 => StoryError::TransientService(message),
            _ if is_policy_text(body) => StoryError::ContentPolicy(message),
            _ => StoryError::Request(message),
        }
    }
}

/// Moderation markers used by the supported providers. Gemini reports a
/// block as the bare `"SAFETY"` finish or block reason, which is matched
/// case-sensitively so parameter names like `safety_settings` do not count.
fn is_policy_text(body: &str) -> bool {
    let lowered = body.to_lowercase();
    [
        "content_policy",
        "content policy",
        "moderation_blocked",
        "prohibited_content",
        "image_safety",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
        || body.contains("\"SAFETY\"")
        || body.contains("\"BLOCKLIST\"")
}
