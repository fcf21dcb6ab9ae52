//! Error types for cxxrt-runtime.

use thiserror::Error;

/// Errors raised while decoding a frame's language-specific data area.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsdaError {
    /// The pointer encoding byte is not one we know how to read.
    #[error("unsupported DWARF pointer encoding {0:#04x}")]
    UnsupportedEncoding(u8),

    /// A fixed-size read was requested for a variable-length encoding.
    #[error("type table encoding {0:#04x} has no fixed size")]
    VariableSizeTypeEntry(u8),

    /// A value was required but the table marks it as omitted.
    #[error("required value is omitted")]
    Omitted,

    /// A LEB128 value does not fit in 64 bits.
    #[error("LEB128 value overflows 64 bits")]
    LebOverflow,

    /// A filter referenced the type table but the LSDA has none.
    #[error("action record references a missing type table")]
    MissingTypeTable,
}

/// Errors from the exception allocator.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Thrown size plus envelope header does not fit in `usize`.
    #[error("exception of {0} bytes is too large")]
    TooLarge(usize),

    /// The request does not fit in one emergency slot.
    #[error("{0} bytes exceeds the emergency slot size")]
    ExceedsSlot(usize),

    /// The calling thread already holds its share of emergency slots.
    #[error("thread already holds {0} emergency buffers")]
    ThreadLimit(u32),
}

/// Errors from loading the runtime configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file: {0}")]
    ReadConfig(#[from] std::io::Error),

    /// Failed to parse the TOML configuration.
    #[error("Failed to parse TOML config: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// An environment override holds something other than a boolean.
    #[error("invalid value {value:?} for {name}")]
    InvalidOverride { name: &'static str, value: String },

    /// The process-wide configuration was already installed.
    #[error("runtime configuration is already installed")]
    AlreadyInstalled,
}

/// Status codes of the external demangling service.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemangleError {
    #[error("memory allocation failure")]
    AllocationFailure,
    #[error("invalid mangled name")]
    InvalidMangledName,
    #[error("invalid arguments")]
    InvalidArguments,
}

impl DemangleError {
    /// The `__cxa_demangle` status code for this error.
    pub fn status(self) -> i32 {
        match self {
            DemangleError::AllocationFailure => -1,
            DemangleError::InvalidMangledName => -2,
            DemangleError::InvalidArguments => -3,
        }
    }
}

/// Conditions that end the process through `terminate`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    #[error("out of memory attempting to allocate exception of {size} bytes")]
    OutOfMemory { size: usize },

    #[error("exception destructor raised during cleanup")]
    DestructorUnwound,

    #[error("uncaught exception")]
    Uncaught,

    #[error("exception raised inside cleanup code with no enclosing handler")]
    UnhandledInCleanup,

    #[error("fatal error during phase 1 unwinding")]
    FatalPhase1,

    #[error("fatal error during phase 2 unwinding")]
    FatalPhase2,

    #[error("attempting to rethrow an exception that doesn't exist")]
    NoActiveException,

    #[error("ending catch when no exception is on the stack")]
    EndCatchWithoutException,

    #[error("malformed exception table: {0}")]
    MalformedLsda(LsdaError),

    #[error("exception state unavailable during thread exit")]
    ThreadStateUnavailable,

    #[error("unexpected handler returned")]
    UnexpectedReturned,
}
