//! Engine error taxonomy
//!
//! Recoverable conditions are typed here; plugin-level failures use
//! `anyhow::Error` with context, and fatal invariant violations go through
//! [`crate::platform::fatal_error`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid command line or option combination. Exits with code 2 before
    /// any thread starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Plugin name not found in the registry.
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    /// A plugin failed to start.
    #[error("plugin '{name}' failed to start: {source}")]
    PluginStart {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// Sync byte mismatch on the input stream.
    #[error("synchronization lost after {packets} packets, got {got:#04X} instead of 0x47")]
    SyncLost { packets: u64, got: u8 },

    /// PSI identifier announced by two different inputs.
    #[error("{kind} conflict, {id:#06X} ({id}) exists in input #{first} and #{second}")]
    PsiConflict {
        kind: &'static str,
        id: u16,
        first: usize,
        second: usize,
    },

    /// Malformed PSI section.
    #[error("invalid PSI section: {0}")]
    SectionSyntax(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Final status of a pipeline run, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal termination (exit 0)
    Success,
    /// Processing error (exit 1)
    ProcessingError,
    /// Command line error (exit 2)
    UsageError,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::ProcessingError => 1,
            ExitStatus::UsageError => 2,
        }
    }
}
