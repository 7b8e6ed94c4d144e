use thiserror::Error;

/// Recoverable failures the session controller handles at its boundary.
///
/// Nothing here escapes to the transport as a panic or a poisoned chat:
/// every variant maps to either a user-visible notice or a silent drop.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The generation lane is at capacity. The user should retry shortly.
    #[error("the request queue is full, try again shortly")]
    QueueSaturated,

    /// Retries against the completion service are exhausted.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// A fenced-off result arrived after being superseded. Never surfaced.
    #[error("stale generation result discarded")]
    StaleResult,

    /// The wizard rejected an input; the state is unchanged and the hint
    /// is re-prompted to the user.
    #[error("{0}")]
    InvalidWizardInput(String),

    /// A store operation failed. The pending action is aborted; in-memory
    /// session state is left as it was.
    #[error("persistence error: {0}")]
    Persistence(anyhow::Error),
}

// anyhow::Error is not std::error::Error, so this conversion is written out
// instead of derived with #[from].
impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Persistence(err)
    }
}

impl CoreError {
    /// Whether the error should be shown to the user at all.
    pub fn is_silent(&self) -> bool {
        matches!(self, CoreError::StaleResult)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_results_are_silent() {
        assert!(CoreError::StaleResult.is_silent());
        assert!(!CoreError::QueueSaturated.is_silent());
        assert!(!CoreError::GenerationFailed("timeout".into()).is_silent());
    }

    #[test]
    fn wizard_rejection_carries_the_hint_verbatim() {
        let err = CoreError::InvalidWizardInput("Please pick one of the options.".into());
        assert_eq!(err.to_string(), "Please pick one of the options.");
    }
}
