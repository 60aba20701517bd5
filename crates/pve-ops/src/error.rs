//! Error types shared by every provisioning stage.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

/// Errors that can occur while provisioning or configuring a VM.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// One or more request parameters are missing or malformed.
    #[error("invalid parameters:\n  - {}", .problems.join("\n  - "))]
    Validation { problems: Vec<String> },

    /// A local command could not be spawned at all.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A local command ran and exited non-zero.
    #[error("{program} {} failed ({}): {stderr}", .args.join(" "), exit_status(.exit_code.as_ref()))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A command executed over SSH/SCP exited non-zero.
    #[error("remote command on {host} failed (exit code {exit_code}): {command}")]
    RemoteCommandFailed {
        command: String,
        host: String,
        exit_code: i32,
    },

    /// The cluster could not hand out a free VM id.
    #[error("hypervisor did not return a usable VM id: {0}")]
    NoVmId(String),

    /// The id allocation lock could not be taken.
    #[error("failed to lock {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Base image download failed.
    #[error("failed to download {url}: {message}")]
    Download { url: String, message: String },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Downloaded image does not match the configured digest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// The VM did not accept connections in time.
    #[error("{host} not reachable on port {port} after {timeout_secs}s")]
    ReadinessTimeout {
        host: String,
        port: u16,
        timeout_secs: u64,
    },

    /// Template rendering failed.
    #[error("template error: {0}")]
    Template(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn exit_status(code: Option<&i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"))
}

impl ProvisionError {
    /// Build a validation error from a single problem.
    #[must_use]
    pub fn invalid(problem: impl Into<String>) -> Self {
        Self::Validation {
            problems: vec![problem.into()],
        }
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<handlebars::RenderError> for ProvisionError {
    fn from(e: handlebars::RenderError) -> Self {
        Self::Template(e.to_string())
    }
}

impl From<handlebars::TemplateError> for ProvisionError {
    fn from(e: handlebars::TemplateError) -> Self {
        Self::Template(e.to_string())
    }
}
