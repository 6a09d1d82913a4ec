use std::{borrow::Cow, future::Future, sync::Arc};

use bytes::Bytes;
use russh::{
    ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, Preferred,
    client::{self, Handle, KeyboardInteractiveAuthResponse, Msg, Session},
    keys::{HashAlg, PublicKey, key::PrivateKeyWithHashAlg},
};
use russh_sftp::{client::SftpSession, protocol::StatusCode};
use tokio::{sync::mpsc, time::timeout};
#[cfg(not(coverage_nightly))]
use tracing::{debug, warn};

use crate::{
    browser::{BrowserEvent, BrowserHandle, Geometry, to_crlf},
    config::AlgorithmPreferences,
    directory::{FilesystemError, RemoteFilesystem},
    error::SessionError,
    session_config::{Credentials, SessionConfig},
};

const SHELL_OUTPUT_BUFFER: usize = 64;
// Upper bound on keyboard-interactive rounds before giving up.
const MAX_KEYBOARD_INTERACTIVE_ROUNDS: usize = 5;

// Opens authenticated connections to upstream SSH hosts.
pub(crate) trait UpstreamConnector: Send + Sync + 'static {
    type Connection: UpstreamConnection;

    // Out-of-band text sent by the host before authentication is forwarded to the browser.
    fn connect(
        &self,
        config: &SessionConfig,
        browser: &BrowserHandle,
    ) -> impl Future<Output = Result<Self::Connection, SessionError>> + Send;
}

// An authenticated upstream SSH connection.
pub(crate) trait UpstreamConnection: Send + Sync + 'static {
    type Filesystem: RemoteFilesystem;

    fn open_filesystem(
        &self,
    ) -> impl Future<Output = Result<Self::Filesystem, FilesystemError>> + Send;

    fn open_shell(
        &self,
        term: &str,
        geometry: Geometry,
    ) -> impl Future<Output = Result<ShellStream, SessionError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShellInput {
    Data(Bytes),
    Resize(Geometry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShellOutput {
    Data(Bytes),
    Stderr(Bytes),
    Closed {
        code: Option<u32>,
        signal: Option<String>,
    },
    ConnectionLost(String),
}

impl ShellOutput {
    // Mentions only the parts that carry information, such as `CODE: 1 SIGNAL: TERM`.
    pub(crate) fn close_reason(code: Option<u32>, signal: Option<&str>) -> String {
        let mut parts = Vec::with_capacity(2);
        if let Some(code) = code.filter(|code| *code != 0) {
            parts.push(format!("CODE: {code}"));
        }
        if let Some(signal) = signal {
            parts.push(format!("SIGNAL: {signal}"));
        }
        parts.join(" ")
    }
}

// Both directions of an interactive shell.
#[derive(Debug)]
pub(crate) struct ShellStream {
    pub(crate) input: mpsc::UnboundedSender<ShellInput>,
    pub(crate) output: mpsc::Receiver<ShellOutput>,
}

pub(crate) struct UpstreamHandler {
    browser: BrowserHandle,
}

impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        #[cfg(not(coverage_nightly))]
        debug!(fingerprint = %key.fingerprint(HashAlg::Sha256), "Accepting upstream host key.");
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.browser.emit(BrowserEvent::Data(to_crlf(banner)));
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RusshConnector;

impl UpstreamConnector for RusshConnector {
    type Connection = RusshConnection;

    async fn connect(
        &self,
        config: &SessionConfig,
        browser: &BrowserHandle,
    ) -> Result<Self::Connection, SessionError> {
        let handler = UpstreamHandler {
            browser: browser.clone(),
        };
        // The ready timeout covers both the handshake and authentication.
        let handle = timeout(config.ready_timeout, async {
            let mut handle = client::connect(
                Arc::new(client_config(config)),
                (config.host.as_str(), config.port),
                handler,
            )
            .await
            .map_err(protocol_error)?;
            if authenticate(&mut handle, config).await? {
                Ok(handle)
            } else {
                Err(SessionError::UpstreamAuthFailure)
            }
        })
        .await
        .map_err(|_| {
            SessionError::UpstreamProtocol("Timed out while waiting for handshake".into())
        })??;
        Ok(RusshConnection { handle })
    }
}

async fn authenticate(
    handle: &mut Handle<UpstreamHandler>,
    config: &SessionConfig,
) -> Result<bool, SessionError> {
    let username = config.username.as_str();
    match &config.credentials {
        Credentials::PrivateKey(key) => {
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(protocol_error)?
                .flatten();
            Ok(handle
                .authenticate_publickey(
                    username,
                    PrivateKeyWithHashAlg::new(Arc::clone(key), hash_alg),
                )
                .await
                .map_err(protocol_error)?
                .success())
        }
        Credentials::Password(password) => {
            if handle
                .authenticate_password(username, password)
                .await
                .map_err(protocol_error)?
                .success()
            {
                return Ok(true);
            }
            if !config.keyboard_interactive {
                return Ok(false);
            }
            keyboard_interactive(handle, username, password).await
        }
    }
}

// Answers every prompt with the password.
async fn keyboard_interactive(
    handle: &mut Handle<UpstreamHandler>,
    username: &str,
    password: &str,
) -> Result<bool, SessionError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await
        .map_err(protocol_error)?;
    for _ in 0..MAX_KEYBOARD_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                response = handle
                    .authenticate_keyboard_interactive_respond(
                        prompts.iter().map(|_| password.to_string()).collect(),
                    )
                    .await
                    .map_err(protocol_error)?;
            }
            _ => return Ok(false),
        }
    }
    Ok(matches!(response, KeyboardInteractiveAuthResponse::Success))
}

fn protocol_error(error: russh::Error) -> SessionError {
    SessionError::UpstreamProtocol(error.to_string())
}

pub(crate) fn client_config(config: &SessionConfig) -> client::Config {
    client::Config {
        keepalive_interval: config.keepalive_interval,
        keepalive_max: config.keepalive_count_max,
        preferred: preferred_algorithms(&config.algorithms),
        ..Default::default()
    }
}

// Keeps the configured order, dropping names the client doesn't implement.
// A category with no known names falls back to the library defaults.
pub(crate) fn preferred_algorithms(algorithms: &AlgorithmPreferences) -> Preferred {
    let defaults = Preferred::default();
    Preferred {
        kex: filter_known(&algorithms.kex, russh::kex::ALL_KEX_ALGORITHMS, defaults.kex),
        cipher: filter_known(&algorithms.cipher, russh::cipher::ALL_CIPHERS, defaults.cipher),
        mac: filter_known(&algorithms.hmac, russh::mac::ALL_MAC_ALGORITHMS, defaults.mac),
        compression: filter_known(
            &algorithms.compress,
            russh::compression::ALL_COMPRESSION_ALGORITHMS,
            defaults.compression,
        ),
        ..defaults
    }
}

fn filter_known<N>(
    requested: &[String],
    known: &[&N],
    fallback: Cow<'static, [N]>,
) -> Cow<'static, [N]>
where
    N: AsRef<str> + Copy,
    [N]: ToOwned<Owned = Vec<N>>,
{
    let names: Vec<N> = requested
        .iter()
        .filter_map(|name| {
            let found = known.iter().find(|candidate| {
                let candidate: &str = (***candidate).as_ref();
                candidate == name
            });
            #[cfg(not(coverage_nightly))]
            if found.is_none() {
                warn!(algorithm = %name, "Ignoring unsupported algorithm.");
            }
            found.map(|known| **known)
        })
        .collect();
    if names.is_empty() {
        fallback
    } else {
        Cow::Owned(names)
    }
}

pub(crate) struct RusshConnection {
    handle: Handle<UpstreamHandler>,
}

impl UpstreamConnection for RusshConnection {
    type Filesystem = SftpFilesystem;

    async fn open_filesystem(&self) -> Result<Self::Filesystem, FilesystemError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|error| FilesystemError::Other(error.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|error| FilesystemError::Other(error.to_string()))?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(sftp_error)?;
        Ok(SftpFilesystem(session))
    }

    async fn open_shell(&self, term: &str, geometry: Geometry) -> Result<ShellStream, SessionError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(protocol_error)?;
        channel
            .request_pty(false, term, geometry.cols, geometry.rows, 0, 0, &[])
            .await
            .map_err(protocol_error)?;
        channel.request_shell(true).await.map_err(protocol_error)?;
        let mut early = Vec::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => {
                    return Err(SessionError::Internal("Shell request was rejected".into()));
                }
                Some(ChannelMsg::Close) | None => {
                    return Err(SessionError::UpstreamConnectionClosed(
                        "Channel closed before the shell started".into(),
                    ));
                }
                Some(ChannelMsg::Data { data }) => early.push(Bytes::copy_from_slice(&data)),
                Some(_) => (),
            }
        }
        let (read_half, write_half) = channel.split();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(SHELL_OUTPUT_BUFFER);
        tokio::spawn(read_shell(read_half, early, output_tx.clone()));
        tokio::spawn(write_shell(write_half, input_rx, output_tx));
        Ok(ShellStream {
            input: input_tx,
            output: output_rx,
        })
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

// Forwards shell output to the session until the channel closes.
async fn read_shell(
    mut channel: ChannelReadHalf,
    early: Vec<Bytes>,
    output: mpsc::Sender<ShellOutput>,
) {
    for data in early {
        if output.send(ShellOutput::Data(data)).await.is_err() {
            return;
        }
    }
    let mut code = None;
    let mut signal = None;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                if output
                    .send(ShellOutput::Data(Bytes::copy_from_slice(&data)))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Some(ChannelMsg::ExtendedData { data, .. }) => {
                let _ = output
                    .send(ShellOutput::Stderr(Bytes::copy_from_slice(&data)))
                    .await;
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => code = Some(exit_status),
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                signal = Some(format!("{signal_name:?}"));
            }
            Some(ChannelMsg::Close) => {
                let _ = output.send(ShellOutput::Closed { code, signal }).await;
                break;
            }
            Some(_) => (),
            None => {
                let _ = output
                    .send(ShellOutput::ConnectionLost("Upstream connection closed".into()))
                    .await;
                break;
            }
        }
    }
}

// Writes session input to the shell, independently of the output direction.
async fn write_shell(
    channel: ChannelWriteHalf<Msg>,
    mut input: mpsc::UnboundedReceiver<ShellInput>,
    output: mpsc::Sender<ShellOutput>,
) {
    while let Some(message) = input.recv().await {
        match message {
            ShellInput::Data(data) => {
                if let Err(error) = channel.data(&data[..]).await {
                    let _ = output
                        .send(ShellOutput::ConnectionLost(error.to_string()))
                        .await;
                    return;
                }
            }
            ShellInput::Resize(Geometry { cols, rows }) => {
                if let Err(error) = channel.window_change(cols, rows, 0, 0).await {
                    #[cfg(not(coverage_nightly))]
                    debug!(%error, "Unable to resize shell.");
                }
            }
        }
    }
    let _ = channel.close().await;
}

pub(crate) struct SftpFilesystem(SftpSession);

impl RemoteFilesystem for SftpFilesystem {
    async fn canonicalize(&mut self, path: &str) -> Result<String, FilesystemError> {
        self.0.canonicalize(path).await.map_err(sftp_error)
    }

    async fn is_directory(&mut self, path: &str) -> Result<bool, FilesystemError> {
        Ok(self.0.metadata(path).await.map_err(sftp_error)?.is_dir())
    }

    async fn open_directory(&mut self, path: &str) -> Result<(), FilesystemError> {
        self.0.read_dir(path).await.map_err(sftp_error)?;
        Ok(())
    }

    async fn close(self) {
        let _ = self.0.close().await;
    }
}

fn sftp_error(error: russh_sftp::client::error::Error) -> FilesystemError {
    match error {
        russh_sftp::client::error::Error::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => FilesystemError::NoSuchFile,
            StatusCode::PermissionDenied => FilesystemError::PermissionDenied,
            _ => FilesystemError::Other(status.error_message),
        },
        error => FilesystemError::Other(error.to_string()),
    }
}


#[cfg(test)]
mod upstream_tests {
    use crate::config::AlgorithmPreferences;

    use super::{ShellOutput, preferred_algorithms};

    #[test]
    fn keeps_order_of_supported_algorithms() {
        let preferred = preferred_algorithms(&AlgorithmPreferences {
            kex: vec![],
            cipher: vec![
                "aes256-ctr".into(),
                "aes128-gcm".into(),
                "aes128-ctr".into(),
            ],
            hmac: vec!["hmac-md5".into()],
            compress: vec!["none".into()],
        });
        let ciphers: Vec<&str> = preferred.cipher.iter().map(|name| name.as_ref()).collect();
        assert_eq!(ciphers, ["aes256-ctr", "aes128-ctr"]);
        let compression: Vec<&str> = preferred
            .compression
            .iter()
            .map(|name| name.as_ref())
            .collect();
        assert_eq!(compression, ["none"]);
        assert!(!preferred.kex.is_empty(), "empty list uses defaults");
        assert!(!preferred.mac.is_empty(), "unknown names use defaults");
    }

    #[test]
    fn formats_shell_close_reason() {
        assert_eq!(ShellOutput::close_reason(Some(0), None), "");
        assert_eq!(ShellOutput::close_reason(Some(127), None), "CODE: 127");
        assert_eq!(
            ShellOutput::close_reason(Some(1), Some("KILL")),
            "CODE: 1 SIGNAL: KILL"
        );
    }
}
