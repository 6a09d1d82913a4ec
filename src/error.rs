use ipnet::IpNet;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("At least one upstream host must be configured")]
    EmptyHostPool,
    #[error("Duplicate network CIDR in allowed subnets: {0}")]
    DuplicateNetworkCidr(IpNet),
}

// Reasons why a requested working directory cannot be used for a session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum DirectoryError {
    #[error("Invalid Characters")]
    InvalidCharacters,
    #[error("Missing Directory")]
    Missing,
    #[error("Not A Directory")]
    NotADirectory,
    #[error("Permission Denied")]
    PermissionDenied,
    #[error("Unable to determine the default directory: {0}")]
    DefaultDirectory(String),
    #[error("Directory check failed: {0}")]
    Filesystem(String),
}

impl DirectoryError {
    // Whether the user can fix the error by requesting a different path.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DirectoryError::InvalidCharacters
                | DirectoryError::Missing
                | DirectoryError::NotADirectory
                | DirectoryError::PermissionDenied
        )
    }
}

// Every way a gateway session can end.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionError {
    #[error("Missing username or credentials")]
    MissingCredentials,
    #[error("Requested host {0} is outside the allowed subnets")]
    HostNotAllowed(String),
    #[error("Unable to resolve host {host}: {message}")]
    HostUnresolvable { host: String, message: String },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("All configured authentication methods failed")]
    UpstreamAuthFailure,
    #[error("{0}")]
    UpstreamProtocol(String),
    #[error("{0}")]
    UpstreamConnectionClosed(String),
    #[error("{0}")]
    ShellClosed(String),
    #[error("{0}")]
    ClientDisconnect(String),
    #[error("{0}")]
    ClientError(String),
    #[error("{0}")]
    Internal(String),
}

impl SessionError {
    // Label of the event that ended the session, as shown to the browser.
    pub(crate) fn event(&self) -> &'static str {
        match self {
            SessionError::MissingCredentials => "WEBSOCKET ERROR",
            SessionError::HostNotAllowed(_) | SessionError::HostUnresolvable { .. } => {
                "401 UNAUTHORIZED"
            }
            SessionError::Directory(_) => "DIRECTORY CHECK",
            SessionError::UpstreamAuthFailure | SessionError::UpstreamProtocol(_) => "CONN ERROR",
            SessionError::UpstreamConnectionClosed(_) => "CONN CLOSE",
            SessionError::ShellClosed(_) => "STREAM CLOSE",
            SessionError::ClientDisconnect(_) => "CLIENT SOCKET DISCONNECT",
            SessionError::ClientError(_) => "SOCKET ERROR",
            SessionError::Internal(_) => "EXEC ERROR",
        }
    }

    // Planned endings move the session to Closed, everything else to Errored.
    pub(crate) fn is_planned(&self) -> bool {
        matches!(
            self,
            SessionError::ShellClosed(_) | SessionError::ClientDisconnect(_)
        )
    }

    // Errors raised before any upstream connection exists are reported verbatim,
    // without the SSH event prefix.
    pub(crate) fn is_preflight(&self) -> bool {
        matches!(
            self,
            SessionError::MissingCredentials
                | SessionError::HostNotAllowed(_)
                | SessionError::HostUnresolvable { .. }
        )
    }
}
