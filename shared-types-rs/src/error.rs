// shared-types-rs/src/error.rs

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse classification every crate error maps onto.
///
/// The orchestrator records it on failed stages and the API layer uses it
/// to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad caller input: unknown ids, malformed windows, invalid transitions.
    Input,
    /// A collaborator (transcript source, completion service) failed or timed out.
    ExternalService,
    /// A collaborator answered with something we could not interpret.
    Parse,
    /// Stored state violates an invariant, or lost a compare-and-swap.
    Consistency,
    Storage,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Input => "input",
            ErrorClass::ExternalService => "external_service",
            ErrorClass::Parse => "parse",
            ErrorClass::Consistency => "consistency",
            ErrorClass::Storage => "storage",
        }
    }

    pub fn is_alerting(&self) -> bool {
        matches!(self, ErrorClass::Consistency)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
