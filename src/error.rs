// Copyright (c) 2024, VURM Contributors.
// All rights reserved.
//
// This VURM Software is licensed under the BSD-3-Clause license.
// Please see the LICENSE file for more details.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced anywhere in this crate.
///
/// Five variants belong to the wire-visible `RemoteVurmException` family:
/// [`Error::InsufficientResources`], [`Error::ReconfigurationError`],
/// [`Error::InvalidClusterName`], [`Error::UnknownDomain`] and
/// [`Error::ConnectError`]. A client sees these verbatim; everything else
/// collapses to a generic internal failure unless the server runs in debug
/// mode. See [`Error::is_remotable`].
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("not enough resources to satisfy request ({obtained}/{min_size})")]
    InsufficientResources { obtained: usize, min_size: usize },

    #[error("local slurm instance could not be reconfigured (exit code: {0})")]
    ReconfigurationError(i32),

    #[error("no such cluster: {0:?}")]
    InvalidClusterName(String),

    #[error("domain {0:?} not found")]
    UnknownDomain(String),

    #[error("could not connect: {0}")]
    ConnectError(String),

    #[error("image clone command exited with status {exit_code} (stderr: {stderr})")]
    CloneFailed { exit_code: i32, stderr: String },

    #[error("timed out waiting for the guest to report its IP address")]
    IpExchangeTimeout,

    #[error("node state violation: {0}")]
    NodeStateViolation(String),

    #[error("command `{binary}` failed (exit code {exit_code:?})")]
    ExternalCommandFailed {
        binary: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("missing '{key}' in the [{section}] config section")]
    MissingConfigKey { section: String, key: String },

    #[error("invalid value for '{key}' in the [{section}] config section: {value:?}")]
    InvalidConfigValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("could not locate a config file (checked {0:?})")]
    ConfigNotFound(Vec<std::path::PathBuf>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),

    #[error(transparent)]
    AddrParse(#[from] std::net::AddrParseError),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),

    #[error("ssh error: {0}")]
    Ssh(String),

    #[error("sftp error: {0}")]
    Sftp(String),

    #[error("libvirt error: {0}")]
    Libvirt(String),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Rpc(#[from] tonic::Status),

    #[error("the connection pool has already been started")]
    PoolAlreadyStarted,

    #[error("endpoint descriptor {0:?} could not be parsed")]
    InvalidEndpoint(String),

    #[error("malformed domain description: {0}")]
    InvalidDomainDescription(String),
}

impl Error {
    /// Whether this error belongs to the `RemoteVurmException` family and is
    /// therefore safe to relay to a client verbatim.
    pub fn is_remotable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientResources { .. }
                | Error::ReconfigurationError(_)
                | Error::InvalidClusterName(_)
                | Error::UnknownDomain(_)
                | Error::ConnectError(_)
        )
    }

    /// Stable tag used as the `<Kind>:` prefix of the wire message.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::InsufficientResources { .. } => "InsufficientResources",
            Error::ReconfigurationError(_) => "ReconfigurationError",
            Error::InvalidClusterName(_) => "InvalidClusterName",
            Error::UnknownDomain(_) => "UnknownDomain",
            Error::ConnectError(_) => "ConnectError",
            _ => "Internal",
        }
    }
}

impl Error {
    /// Maps this error onto the `tonic::Status` sent back to the RPC caller.
    ///
    /// `RemoteVurmException` members always carry their detail, per the
    /// wire taxonomy. Everything else is internal: its detail only crosses
    /// the boundary when `debug` is set, per §7's debug-mode policy — with
    /// `debug` off, a caller only ever sees `"Internal: internal error"`.
    pub fn into_status(self, debug: bool) -> tonic::Status {
        use tonic::Code;

        let code = match &self {
            Error::InsufficientResources { .. } | Error::ReconfigurationError(_) => {
                Code::FailedPrecondition
            }
            Error::InvalidClusterName(_) | Error::UnknownDomain(_) => Code::NotFound,
            Error::ConnectError(_) => Code::Unavailable,
            _ => Code::Internal,
        };

        let message = if self.is_remotable() || debug {
            format!("{}: {}", self.kind_name(), self)
        } else {
            format!("{}: internal error", self.kind_name())
        };

        tonic::Status::new(code, message)
    }
}

/// Reconstructs an [`Error`] from a `tonic::Status` produced by
/// `Error::into::<tonic::Status>`, recovering the original taxonomy member
/// where possible. Variants whose payload can't be losslessly recovered from
/// the flattened message (such as the two counts in
/// [`Error::InsufficientResources`]) fall back to [`Error::ConnectError`]
/// carrying the full message, which at least preserves the text for display.
pub fn error_from_status(status: tonic::Status) -> Error {
    let message = status.message();
    if let Some(rest) = message.strip_prefix("InvalidClusterName: ") {
        return Error::InvalidClusterName(rest.trim_matches('"').to_string());
    }
    if let Some(rest) = message.strip_prefix("UnknownDomain: ") {
        return Error::UnknownDomain(rest.trim_matches('"').to_string());
    }
    if let Some(rest) = message.strip_prefix("ConnectError: ") {
        return Error::ConnectError(rest.to_string());
    }
    if message.starts_with("InsufficientResources: ") || message.starts_with("ReconfigurationError: ") {
        return Error::ConnectError(message.to_string());
    }
    Error::Rpc(status)
}
