use std::fmt;

/// How a supervised run (or a whole operation) ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// The cancellation signal was observed; this is a normal terminal state.
    Cancelled,
    /// The tool could not be started (`code` is `None`) or exited unsuccessfully.
    /// `diagnostic` carries the tool's own error output verbatim.
    Failed {
        code: Option<i32>,
        diagnostic: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    pub(crate) fn failed(code: Option<i32>, diagnostic: impl Into<String>) -> Self {
        Outcome::Failed {
            code,
            diagnostic: diagnostic.into(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Cancelled => write!(f, "cancelled"),
            Outcome::Failed {
                code: Some(code),
                diagnostic,
            } => write!(f, "failed (exit code {code}): {diagnostic}"),
            Outcome::Failed {
                code: None,
                diagnostic,
            } => write!(f, "failed: {diagnostic}"),
        }
    }
}
