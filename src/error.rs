//! Error taxonomy.

use std::sync::Arc;

/// Errors surfaced by graph operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// The identifier is not registered in this checkout, or was removed.
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    /// A calculation issued a request the engine cannot answer for it, such
    /// as a plain read of its own identifier.
    #[error("unsupported read effect in calculation of {name}")]
    UnsupportedReadEffect {
        /// The identifier whose calculation issued the request.
        name: String,
    },

    /// A calculation depends on itself, directly or transitively. The path
    /// starts and ends with the same identifier.
    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected {
        /// Identifier names along the cycle, first equals last.
        path: Vec<String>,
    },

    /// `propagate` was called from inside a running propagation.
    #[error("propagation is already running")]
    NestedPropagation,

    /// A user calculation returned a failure.
    #[error("calculation failed: {0}")]
    Calculation(Arc<anyhow::Error>),
}

impl GraphError {
    pub(crate) fn calculation(error: anyhow::Error) -> Self {
        Self::Calculation(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_display_joins_path() {
        let error = GraphError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(error.to_string(), "cycle detected: a -> b -> a");
    }
}
