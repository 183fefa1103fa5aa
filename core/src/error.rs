use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Ambiguous install target: {0}")]
    AmbiguousTarget(String),

    #[error("No install candidate: {0}")]
    NoCandidate(String),

    #[error("A partition table already exists on device '{0}', and force install isn't set")]
    ExistingPartitionTable(String),

    #[error("Invalid device id '{0}': must be a path under the stable-ID namespace")]
    InvalidDeviceId(String),

    #[error("Expected a 32 byte raw encryption key, got {0} bytes")]
    InvalidKeyLength(usize),

    #[error("Invalid payload for seed '{seed}': {reason}")]
    InvalidSeedPayload { seed: String, reason: String },

    #[error("Only read {read} of {expected} bytes for seed file '{name}'")]
    TruncatedArchiveEntry {
        name: String,
        read: u64,
        expected: u64,
    },

    #[error("External command `{command}` failed (exit code {status:?}): {diagnostic}")]
    SubprocessFailure {
        command: String,
        status: Option<i32>,
        diagnostic: String,
    },

    #[error("Incomplete copy of {path}: copied {copied} of {expected} bytes")]
    IncompleteCopy {
        path: String,
        copied: u64,
        expected: u64,
    },

    #[error("Target device {target} is smaller than the {minimum} byte minimum. Detected devices: {detected}")]
    TargetTooSmall {
        target: String,
        minimum: u64,
        detected: String,
    },

    #[error("{step} failed after changes were made: {source}")]
    Interrupted {
        step: String,
        #[source]
        source: Box<StrataError>,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl StrataError {
    /// Mark an error raised after a device was modified. Already marked
    /// errors keep the step they were first raised in.
    pub fn interrupted(self, step: &str) -> Self {
        match self {
            StrataError::Interrupted { .. } => self,
            source => StrataError::Interrupted {
                step: step.to_string(),
                source: Box::new(source),
            },
        }
    }

    /// The error underneath any [`StrataError::Interrupted`] marker.
    pub fn root_cause(&self) -> &StrataError {
        match self {
            StrataError::Interrupted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// True unless the error was raised after a device was modified.
    pub fn is_pre_mutation(&self) -> bool {
        !matches!(self, StrataError::Interrupted { .. })
    }
}
