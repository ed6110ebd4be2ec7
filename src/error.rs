use thiserror::Error;

/// Errors raised by compilation, serialization, and execution.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Unknown operation type: '{0}'")]
    UnknownOperationType(String),

    #[error("Unknown placement type: '{0}'")]
    UnknownPlacementType(String),

    #[error("Type mismatch for '{slot}': expected {expected}, found {actual}")]
    TypeMismatch {
        slot: String,
        expected: String,
        actual: String,
    },

    #[error("Operation '{op}' is missing input '{slot}'")]
    MissingInput { op: String, slot: String },

    #[error("Missing argument '{0}'")]
    MissingArgument(String),

    #[error("Name '{0}' already exists in computation")]
    DuplicateName(String),

    #[error("Cycle detected in computation graph")]
    CycleDetected,

    #[error("No kernel found for operation '{0}'")]
    KernelNotFound(String),

    #[error("Networking error: {0}")]
    Networking(String),

    #[error("Timed out waiting for rendezvous '{rendezvous_key}' from '{sender}'")]
    RendezvousTimeout {
        rendezvous_key: String,
        sender: String,
    },

    #[error("No value found in storage under key '{key}'")]
    StorageMiss { key: String },

    #[error("Foreign process exited with code {exit_code}: {stderr}")]
    ForeignProcessFailure { exit_code: i32, stderr: String },

    #[error("Malformed computation: {0}")]
    MalformedComputation(String),

    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error("Kernel error: {0}")]
    KernelError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization failed: {0}")]
    SerializationError(String),

    #[error("Unimplemented operator: {0}")]
    UnimplementedOperator(String),

    #[error("Operation '{op}' failed: {source}")]
    OperationFailed {
        op: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the name of the failing operation, as surfaced to the session runner.
    pub(crate) fn in_operation(self, op: &str) -> Error {
        Error::OperationFailed {
            op: op.to_string(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
