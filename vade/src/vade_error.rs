use std::fmt;

/// Usage errors surfaced by model construction and inference calls.
///
/// Both kinds are programming errors, not transient faults, so callers
/// should not retry. They travel inside `anyhow::Error` and can be
/// recovered with `downcast_ref::<VadeError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadeError {
    /// Rejected hyperparameters or incompatible feature modules
    Configuration(String),

    /// Input tensor that disagrees with the configured shapes
    ShapeMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },
}

impl VadeError {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape_mismatch<E, F>(what: &'static str, expected: E, found: F) -> Self
    where
        E: fmt::Debug,
        F: fmt::Debug,
    {
        Self::ShapeMismatch {
            what,
            expected: format!("{:?}", expected),
            found: format!("{:?}", found),
        }
    }
}

impl fmt::Display for VadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {}", msg),
            Self::ShapeMismatch {
                what,
                expected,
                found,
            } => write!(
                f,
                "shape mismatch in {}: expected {}, found {}",
                what, expected, found
            ),
        }
    }
}

impl std::error::Error for VadeError {}
