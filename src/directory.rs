use std::future::Future;

#[cfg(not(coverage_nightly))]
use tracing::debug;

use crate::{error::DirectoryError, session_config::is_path_safe};

// Failure reported by a remote filesystem operation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum FilesystemError {
    #[error("No such file")]
    NoSuchFile,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("{0}")]
    Other(String),
}

// The subset of a remote file-transfer sub-channel needed to check directories.
pub(crate) trait RemoteFilesystem: Send {
    fn canonicalize(
        &mut self,
        path: &str,
    ) -> impl Future<Output = Result<String, FilesystemError>> + Send;

    fn is_directory(
        &mut self,
        path: &str,
    ) -> impl Future<Output = Result<bool, FilesystemError>> + Send;

    // Opens the directory for listing and releases it right away.
    fn open_directory(
        &mut self,
        path: &str,
    ) -> impl Future<Output = Result<(), FilesystemError>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirectoryResolution {
    pub(crate) pwd: String,
    // Only set once the requested directory passed every check.
    pub(crate) cwd: Option<String>,
}

// Determines the home directory of the session and validates the requested
// working directory against the remote filesystem.
//
// `open_filesystem` is only awaited once the requested path is known to be safe,
// so a rejected path never opens a sub-channel.
pub(crate) async fn resolve_directory<F, O>(
    requested: Option<&str>,
    open_filesystem: O,
) -> Result<DirectoryResolution, DirectoryError>
where
    F: RemoteFilesystem,
    O: Future<Output = Result<F, FilesystemError>>,
{
    let requested = requested.filter(|directory| !directory.is_empty());
    if requested.is_some_and(|directory| !is_path_safe(directory)) {
        return Err(DirectoryError::InvalidCharacters);
    }
    let mut filesystem = open_filesystem
        .await
        .map_err(|error| DirectoryError::DefaultDirectory(error.to_string()))?;
    let result = check_directory(&mut filesystem, requested).await;
    filesystem.close().await;
    result
}

async fn check_directory<F: RemoteFilesystem>(
    filesystem: &mut F,
    requested: Option<&str>,
) -> Result<DirectoryResolution, DirectoryError> {
    let pwd = filesystem
        .canonicalize(".")
        .await
        .map_err(|error| DirectoryError::DefaultDirectory(error.to_string()))?;
    let Some(requested) = requested else {
        return Ok(DirectoryResolution { pwd, cwd: None });
    };
    let path = filesystem
        .canonicalize(requested)
        .await
        .map_err(missing_or_failure)?;
    // The canonical path may come from a link and is typed into the shell later.
    if !is_path_safe(&path) {
        return Err(DirectoryError::InvalidCharacters);
    }
    if !filesystem
        .is_directory(&path)
        .await
        .map_err(missing_or_failure)?
    {
        return Err(DirectoryError::NotADirectory);
    }
    filesystem
        .open_directory(&path)
        .await
        .map_err(|_| DirectoryError::PermissionDenied)?;
    #[cfg(not(coverage_nightly))]
    debug!(%pwd, cwd = %path, "Resolved working directory.");
    Ok(DirectoryResolution {
        pwd,
        cwd: Some(path),
    })
}

fn missing_or_failure(error: FilesystemError) -> DirectoryError {
    match error {
        FilesystemError::NoSuchFile => DirectoryError::Missing,
        FilesystemError::PermissionDenied => DirectoryError::PermissionDenied,
        FilesystemError::Other(message) => DirectoryError::Filesystem(message),
    }
}
