use std::fmt;

/// Domain error taxonomy shared by the aggregation, ranking, lifecycle and
/// promotion engines. Converted to `{code, message}` objects at the IPC
/// boundary.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed input: out-of-range score, missing required id.
    Validation(String),
    /// A lifecycle or gating rule rejected the operation. The message is the
    /// specific user-facing reason.
    StateConflict(String),
    /// Promotion eligibility / next-grade lookup failure for one student.
    NotEligible(String),
    /// Unknown entity id.
    NotFound(String),
    /// Underlying storage failure. Rolled back; surfaced generically.
    Persistence(rusqlite::Error),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::StateConflict(_) => "state_conflict",
            EngineError::NotEligible(_) => "not_eligible",
            EngineError::NotFound(_) => "not_found",
            EngineError::Persistence(_) => "db_failed",
        }
    }

    /// User-facing message. Storage detail stays out of it; the handler logs
    /// the underlying error instead.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::Validation(m)
            | EngineError::StateConflict(m)
            | EngineError::NotEligible(m)
            | EngineError::NotFound(m) => m.clone(),
            EngineError::Persistence(_) => "storage failure".to_string(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(m) => write!(f, "validation: {}", m),
            EngineError::StateConflict(m) => write!(f, "state conflict: {}", m),
            EngineError::NotEligible(m) => write!(f, "not eligible: {}", m),
            EngineError::NotFound(m) => write!(f, "not found: {}", m),
            EngineError::Persistence(e) => write!(f, "storage failure: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Persistence(e)
    }
}
