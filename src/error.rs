use thiserror::Error;

/// The engine's closed error taxonomy (spec §7). Every fallible operation in
/// the runtime returns one of these; there is no open-ended "Other(String)"
/// escape hatch, since this taxonomy is itself closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The memory manager has no free pages, a hash index ran out of entry
    /// slots, or a plan descriptor names more operators/queues/stores than
    /// the engine was configured to hold. Fatal; surfaced to the caller.
    #[error("resource exhaustion: {0}")]
    OutOfMemory(String),

    /// A schema mismatch between producer and consumer, a scan id that
    /// references an unconfigured scan, a stub id out of range, or any other
    /// condition that should have been impossible after a successful
    /// `initialize`. Fatal at wiring time.
    #[error("plan violation: {0}")]
    PlanViolation(String),

    /// An external record source produced a record whose length didn't
    /// match the schema, whose timestamp regressed, or whose sign byte was
    /// neither `+` nor `-`. Operator-local: the scheduler terminates the
    /// query that hit it.
    #[error("source error: {0}")]
    SourceError(String),

    /// Boundary I/O failure (reading a plan descriptor file, etc).
    #[error("I/O error: {0}")]
    Io(String),

    /// Plan descriptor (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for EngineError {
    fn from(e: bincode::error::EncodeError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for EngineError {
    fn from(e: bincode::error::DecodeError) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_displays_reason() {
        let e = EngineError::OutOfMemory("no free pages".into());
        assert_eq!(e.to_string(), "resource exhaustion: no free pages");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: EngineError = io.into();
        assert!(matches!(e, EngineError::Io(_)));
    }
}
