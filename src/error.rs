//! Error types for gossip-consensus
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Classification into fatal and disconnect failures
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::topology::Token;

/// Result type alias for consensus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,
    TopologyInvalid = 110,
    UnknownToken = 111,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,
    RegistrationRejected = 304,

    // Protocol errors (4xx)
    ProtocolVersion = 400,
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,
    FrameTooLarge = 403,
    VectorLengthMismatch = 410,

    // Consensus errors (5xx)
    PoisonedData = 500,
    ConvergenceTimeout = 501,
    Cancelled = 502,
    NotRegistered = 503,

    // Telemetry errors (6xx)
    TelemetrySink = 600,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Consensus errors
            600..=699 => 60, // Telemetry errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the master and agents
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Malformed topology description
    #[error("Invalid topology (line {line}): {message}")]
    Topology { line: usize, message: String },

    /// Token that does not appear in the topology
    #[error("Token {token} is not part of the topology")]
    UnknownToken { token: Token },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {addr}: {message}")]
    ConnectionFailed { addr: String, message: String },

    /// Connection timeout
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    /// Connection lost
    #[error("Lost connection to {peer}: {message}")]
    ConnectionLost { peer: String, message: String },

    /// The master refused this agent
    #[error("Master rejected registration [{code}]: {message}")]
    RegistrationRejected { code: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion { expected: String, actual: String },

    /// Frame could not be decoded
    #[error("Malformed frame: {message}")]
    ProtocolMalformed { message: String },

    /// A well-formed message arrived where it is not allowed
    #[error("Unexpected {got} message: {message}")]
    ProtocolUnexpected { got: &'static str, message: String },

    /// Frame exceeds the configured size limit
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A peer sent a vector whose length differs from ours
    #[error("Vector length mismatch from agent {peer}: expected {expected}, got {actual}")]
    VectorLengthMismatch {
        peer: Token,
        expected: usize,
        actual: usize,
    },

    // ─────────────────────────────────────────────────────────────
    // Consensus Errors
    // ─────────────────────────────────────────────────────────────

    /// A peer sent NaN or infinite values
    #[error("Poisoned vector from agent {peer} in round {round}")]
    PoisonedData { peer: Token, round: u64 },

    /// `run_round` hit its step cap before converging
    #[error("No convergence after {steps} steps (residual {residual:e})")]
    ConvergenceTimeout { steps: u32, residual: f32 },

    /// Shutdown released a pending wait
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// The agent has not received its neighbor table yet
    #[error("Agent {token} is not registered with the master")]
    NotRegistered { token: Token },

    // ─────────────────────────────────────────────────────────────
    // Telemetry Errors
    // ─────────────────────────────────────────────────────────────

    /// Error raised by a telemetry sink
    #[error("Telemetry sink error: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Topology { .. } => ErrorCode::TopologyInvalid,
            Error::UnknownToken { .. } => ErrorCode::UnknownToken,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Error::RegistrationRejected { .. } => ErrorCode::RegistrationRejected,

            Error::ProtocolVersion { .. } => ErrorCode::ProtocolVersion,
            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::ProtocolUnexpected { .. } => ErrorCode::ProtocolUnexpected,
            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Error::VectorLengthMismatch { .. } => ErrorCode::VectorLengthMismatch,

            Error::PoisonedData { .. } => ErrorCode::PoisonedData,
            Error::ConvergenceTimeout { .. } => ErrorCode::ConvergenceTimeout,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::NotRegistered { .. } => ErrorCode::NotRegistered,

            Error::Telemetry(_) => ErrorCode::TelemetrySink,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is fatal (process should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Topology { .. }
                | Error::UnknownToken { .. }
                | Error::RegistrationRejected { .. }
                | Error::ProtocolVersion { .. }
                | Error::Internal(_)
        )
    }

    /// Check if the error means the remote side went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            Error::ConnectionLost { .. } => true,
            _ => false,
        }
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'gossip-consensus config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'gossip-consensus config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::Topology { .. } => Some(
                "Each topology line must hold two non-negative integer tokens separated by whitespace."
            ),
            Error::UnknownToken { .. } => Some(
                "Start the agent with a token that appears in the master's topology file."
            ),

            Error::ConnectionFailed { .. } => Some(
                "Check that the master is running and the host/port are correct."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The peer may be down or unreachable. Check your firewall settings."
            ),
            Error::ConnectionLost { .. } => Some(
                "The connection was interrupted. Links reconnect automatically."
            ),
            Error::RegistrationRejected { .. } => Some(
                "Check the agent token and that master and agent run the same version."
            ),

            Error::ProtocolVersion { .. } => Some(
                "Master and agents must run the same gossip-consensus version."
            ),
            Error::VectorLengthMismatch { .. } => Some(
                "All agents must train the same model architecture."
            ),
            Error::ConvergenceTimeout { .. } => Some(
                "Raise 'agent.round_cap' or 'agent.epsilon', or check that the topology is connected."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a topology error for a given line
    pub fn topology(line: usize, message: impl Into<String>) -> Self {
        Error::Topology {
            line,
            message: message.into(),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            addr: addr.to_string(),
            message: message.into(),
        }
    }

    /// Create a malformed frame error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }

    /// Create an unexpected message error
    pub fn unexpected(got: &'static str, message: impl Into<String>) -> Self {
        Error::ProtocolUnexpected {
            got,
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
