use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bon::Builder;
use bytes::Bytes;
use tokio::sync::mpsc;
#[cfg(not(coverage_nightly))]
use tracing::{debug, error, info, warn};

use crate::{
    allowlist::{HostAllowlist, HostResolver},
    browser::{BrowserEvent, BrowserHandle, BrowserMessage, Geometry},
    directory::{DirectoryResolution, resolve_directory},
    error::SessionError,
    session_config::{Identity, SessionConfig, SessionConfigBuilder, SessionRequest},
    shutdown::ShutdownCoordinator,
    upstream::{ShellInput, ShellOutput, ShellStream, UpstreamConnection, UpstreamConnector},
};

pub(crate) const STATUS_SOCKET_CONFIGURED: &str = "SOCKET CONFIGURED";
pub(crate) const STATUS_CONNECTION_ESTABLISHED: &str = "SSH CONNECTION ESTABLISHED";
pub(crate) const STATUS_SHELL_ESTABLISHED: &str = "SSH SHELL ESTABLISHED";

static NEXT_SESSION_ID: AtomicUsize = AtomicUsize::new(1);

// Process-unique identifier for a browser channel.
pub(crate) fn next_session_id() -> usize {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Created,
    Authenticated,
    Connecting,
    DirectoryChecking,
    Shelling,
    Streaming,
    Closed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionOutcome {
    pub(crate) state: SessionState,
    pub(crate) error: Option<SessionError>,
}

// Process-scoped components shared by every session.
#[derive(Builder)]
pub(crate) struct GatewayContext<C, R> {
    pub(crate) config_builder: SessionConfigBuilder,
    pub(crate) allowlist: HostAllowlist<R>,
    pub(crate) connector: C,
    pub(crate) shutdown: Arc<ShutdownCoordinator>,
}

impl<C, R> GatewayContext<C, R>
where
    C: UpstreamConnector,
    R: HostResolver + Send + Sync + 'static,
{
    // Builds the session configuration and applies the host policy to it.
    pub(crate) async fn authorize(
        &self,
        identity: &Identity,
        request: &SessionRequest,
    ) -> Result<SessionConfig, SessionError> {
        let config = self.config_builder.build(identity, request)?;
        match self
            .allowlist
            .is_allowed(&config.host, &config.allowed_subnets)
            .await
        {
            Ok(true) => Ok(config),
            Ok(false) => {
                #[cfg(not(coverage_nightly))]
                warn!(user = %config.username, host = %config.host, "Requested host outside configured subnets.");
                Err(SessionError::HostNotAllowed(config.host))
            }
            Err(resolution_error) => {
                #[cfg(not(coverage_nightly))]
                error!(host = %config.host, error = %resolution_error, "Unable to resolve requested host.");
                Err(SessionError::HostUnresolvable {
                    host: config.host,
                    message: resolution_error.to_string(),
                })
            }
        }
    }
}

// One browser channel bridged to one upstream shell.
pub(crate) struct GatewaySession<C: UpstreamConnector, R> {
    id: usize,
    peer: SocketAddr,
    context: Arc<GatewayContext<C, R>>,
    browser: BrowserHandle,
    inbound: mpsc::UnboundedReceiver<BrowserMessage>,
    state: SessionState,
    geometry: Geometry,
    // Keystrokes received before the shell is ready.
    pending_input: Vec<Bytes>,
    connection: Option<Arc<C::Connection>>,
    username: Option<String>,
    destination: Option<String>,
    first_error: Option<SessionError>,
    torn_down: bool,
}

impl<C, R> GatewaySession<C, R>
where
    C: UpstreamConnector,
    R: HostResolver + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: usize,
        peer: SocketAddr,
        context: Arc<GatewayContext<C, R>>,
        browser: BrowserHandle,
        inbound: mpsc::UnboundedReceiver<BrowserMessage>,
    ) -> Self {
        GatewaySession {
            id,
            peer,
            context,
            browser,
            inbound,
            state: SessionState::Created,
            geometry: Geometry::default(),
            pending_input: Vec::new(),
            connection: None,
            username: None,
            destination: None,
            first_error: None,
            torn_down: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        identity: Option<Identity>,
        request: SessionRequest,
    ) -> SessionOutcome {
        self.context
            .shutdown
            .on_session_open(self.id, self.browser.clone());
        self.browser
            .emit(BrowserEvent::Status(STATUS_SOCKET_CONFIGURED.into()));
        let error = match self.drive(identity, request).await {
            Ok(()) => SessionError::ShellClosed(String::new()),
            Err(error) => error,
        };
        self.terminate(error).await;
        SessionOutcome {
            state: self.state,
            error: self.first_error,
        }
    }

    async fn drive(
        &mut self,
        identity: Option<Identity>,
        request: SessionRequest,
    ) -> Result<(), SessionError> {
        let identity = identity
            .filter(|identity| identity.credentials().is_some())
            .ok_or(SessionError::MissingCredentials)?;
        self.username = Some(identity.username.clone());
        self.state = SessionState::Authenticated;

        let context = Arc::clone(&self.context);
        let config = self
            .while_pending(context.authorize(&identity, &request))
            .await??;
        self.destination = Some(config.destination().to_string());
        self.state = SessionState::Connecting;

        let browser = self.browser.clone();
        let connection = Arc::new(
            self.while_pending(context.connector.connect(&config, &browser))
                .await??,
        );
        self.connection = Some(Arc::clone(&connection));
        #[cfg(not(coverage_nightly))]
        info!(
            session = %self.id,
            user = %config.username,
            peer = %self.peer,
            host = %config.host,
            port = %config.port,
            correlation = %config.correlation_token,
            directory = ?config.requested_directory,
            term = %config.term,
            "Login."
        );
        self.browser
            .emit(BrowserEvent::Status(STATUS_CONNECTION_ESTABLISHED.into()));

        let resolution = match config.requested_directory.as_deref() {
            Some(directory) => {
                self.state = SessionState::DirectoryChecking;
                Some(
                    self.while_pending(resolve_directory(
                        Some(directory),
                        connection.open_filesystem(),
                    ))
                    .await??,
                )
            }
            None => None,
        };

        self.state = SessionState::Shelling;
        #[cfg(not(coverage_nightly))]
        debug!(session = %self.id, term = %config.term, cols = %self.geometry.cols, rows = %self.geometry.rows, "Opening shell.");
        let geometry = self.geometry;
        let shell = self
            .while_pending(connection.open_shell(&config.term, geometry))
            .await??;
        self.stream(shell, resolution).await
    }

    // Waits on a pipeline step while tracking the browser channel.
    //
    // Keystrokes are buffered until the shell exists, and a browser going away
    // abandons the step.
    async fn while_pending<F: Future>(&mut self, future: F) -> Result<F::Output, SessionError> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return Ok(output),
                message = self.inbound.recv() => match message {
                    Some(BrowserMessage::Data(data)) => self.pending_input.push(data),
                    Some(BrowserMessage::Geometry(geometry) | BrowserMessage::Resize(geometry)) => {
                        self.geometry = geometry;
                    }
                    Some(BrowserMessage::Disconnect(reason)) => {
                        return Err(SessionError::ClientDisconnect(reason));
                    }
                    Some(BrowserMessage::Error(error)) => return Err(SessionError::ClientError(error)),
                    None => return Err(SessionError::ClientDisconnect("transport close".into())),
                }
            }
        }
    }

    async fn stream(
        &mut self,
        shell: ShellStream,
        resolution: Option<DirectoryResolution>,
    ) -> Result<(), SessionError> {
        let ShellStream { input, mut output } = shell;
        let closed = |_| SessionError::UpstreamConnectionClosed("Shell stream closed".into());
        if let Some(cwd) = resolution.and_then(|resolution| resolution.cwd) {
            input
                .send(ShellInput::Data(Bytes::from(format!("cd \"{cwd}\"\n"))))
                .map_err(closed)?;
        }
        for data in std::mem::take(&mut self.pending_input) {
            input.send(ShellInput::Data(data)).map_err(closed)?;
        }
        self.browser
            .emit(BrowserEvent::Status(STATUS_SHELL_ESTABLISHED.into()));
        self.state = SessionState::Streaming;
        loop {
            tokio::select! {
                message = output.recv() => match message {
                    Some(ShellOutput::Data(data)) => self.browser.write(data),
                    Some(ShellOutput::Stderr(data)) => {
                        #[cfg(not(coverage_nightly))]
                        debug!(session = %self.id, stderr = %String::from_utf8_lossy(&data), "Shell stderr.");
                        let _ = data;
                    }
                    Some(ShellOutput::Closed { code, signal }) => {
                        return Err(SessionError::ShellClosed(ShellOutput::close_reason(
                            code,
                            signal.as_deref(),
                        )));
                    }
                    Some(ShellOutput::ConnectionLost(message)) => {
                        return Err(SessionError::UpstreamConnectionClosed(message));
                    }
                    None => return Err(SessionError::UpstreamConnectionClosed("Shell stream closed".into())),
                },
                message = self.inbound.recv() => match message {
                    Some(BrowserMessage::Data(data)) => {
                        input.send(ShellInput::Data(data)).map_err(closed)?;
                    }
                    Some(BrowserMessage::Geometry(geometry) | BrowserMessage::Resize(geometry)) => {
                        self.geometry = geometry;
                        input.send(ShellInput::Resize(geometry)).map_err(closed)?;
                    }
                    Some(BrowserMessage::Disconnect(reason)) => {
                        return Err(SessionError::ClientDisconnect(reason));
                    }
                    Some(BrowserMessage::Error(error)) => return Err(SessionError::ClientError(error)),
                    None => return Err(SessionError::ClientDisconnect("transport close".into())),
                },
            }
        }
    }

    // Ends the session. Only the first call has any effect beyond remembering
    // the first error.
    pub(crate) async fn terminate(&mut self, error: SessionError) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let Some(error) = self.first_error.clone() else {
            return;
        };
        self.state = if error.is_planned() {
            SessionState::Closed
        } else {
            SessionState::Errored
        };
        let user = self.username.as_deref().unwrap_or_default();
        let destination = self.destination.as_deref().unwrap_or_default();
        if error == SessionError::UpstreamAuthFailure {
            #[cfg(not(coverage_nightly))]
            warn!(session = %self.id, %user, peer = %self.peer, %destination, "Authentication failure.");
            self.browser.emit(BrowserEvent::Reauth);
        } else if !error.is_preflight() {
            #[cfg(not(coverage_nightly))]
            info!(session = %self.id, %user, peer = %self.peer, %destination, %error, "Logout.");
        }
        self.browser
            .emit(BrowserEvent::Ssherror(error_message(&error)));
        self.context.shutdown.on_session_close(self.id);
        self.browser.disconnect();
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

// Text of the single error event shown to the browser.
fn error_message(error: &SessionError) -> String {
    if error.is_preflight() {
        return error.event().into();
    }
    let message = error.to_string();
    if message.is_empty() {
        format!("SSH {}", error.event())
    } else {
        format!("SSH {}: {message}", error.event())
    }
}


#[cfg(test)]
mod gateway_session_tests {
    use std::{
        net::SocketAddr,
        sync::{Arc, atomic::Ordering},
        time::Duration,
    };

    use bytes::Bytes;
    use tokio::{sync::mpsc, time::timeout};

    use crate::{
        allowlist::test_resolver::StaticResolver,
        browser::{BrowserCommand, BrowserEvent, BrowserHandle, BrowserMessage, Geometry},
        directory::test_filesystem::{Entry, FakeFilesystem},
        error::{DirectoryError, SessionError},
        session_config::{SessionRequest, test_config::password_identity},
        upstream::{ShellInput, ShellOutput, test_upstream::FakeConnector},
    };

    use super::{GatewaySession, SessionState, test_context::context};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<BrowserCommand>) -> Vec<BrowserCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    fn status(text: &str) -> BrowserCommand {
        BrowserCommand::Event(BrowserEvent::Status(text.into()))
    }

    fn ssherror(text: &str) -> BrowserCommand {
        BrowserCommand::Event(BrowserEvent::Ssherror(text.into()))
    }

    #[test_log::test(tokio::test)]
    async fn rejects_host_outside_allowed_subnets() {
        let connector = FakeConnector::default();
        let connects = Arc::clone(&connector.connects);
        let context = context(
            connector,
            StaticResolver::with(&[("node01", "192.168.1.1")]),
            &["10.0.0.0/8"],
        );
        let (browser, mut browser_rx) = BrowserHandle::new();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let outcome = GatewaySession::new(1, peer(), Arc::clone(&context), browser, inbound_rx)
            .run(
                Some(password_identity("alice", "secret")),
                SessionRequest::default(),
            )
            .await;
        assert_eq!(outcome.state, SessionState::Errored);
        assert_eq!(
            outcome.error,
            Some(SessionError::HostNotAllowed("node01".into()))
        );
        assert_eq!(connects.load(Ordering::SeqCst), 0, "no upstream attempt");
        assert_eq!(
            drain(&mut browser_rx),
            [
                status("SOCKET CONFIGURED"),
                ssherror("401 UNAUTHORIZED"),
                BrowserCommand::Disconnect
            ]
        );
        assert_eq!(context.shutdown.live_sessions(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn tears_down_without_credentials() {
        let connector = FakeConnector::default();
        let connects = Arc::clone(&connector.connects);
        let context = context(connector, StaticResolver::default(), &[]);
        let (browser, mut browser_rx) = BrowserHandle::new();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let outcome = GatewaySession::new(2, peer(), context, browser, inbound_rx)
            .run(None, SessionRequest::default())
            .await;
        assert_eq!(outcome.error, Some(SessionError::MissingCredentials));
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert_eq!(
            drain(&mut browser_rx),
            [
                status("SOCKET CONFIGURED"),
                ssherror("WEBSOCKET ERROR"),
                BrowserCommand::Disconnect
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn asks_for_new_credentials_on_authentication_failure() {
        let connector = FakeConnector {
            fail_with: Some(SessionError::UpstreamAuthFailure),
            banner: Some("Authorized users only\r\n".into()),
            ..Default::default()
        };
        let context = context(connector, StaticResolver::default(), &[]);
        let (browser, mut browser_rx) = BrowserHandle::new();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let outcome = GatewaySession::new(3, peer(), context, browser, inbound_rx)
            .run(
                Some(password_identity("alice", "wrong")),
                SessionRequest::default(),
            )
            .await;
        assert_eq!(outcome.state, SessionState::Errored);
        assert_eq!(
            drain(&mut browser_rx),
            [
                status("SOCKET CONFIGURED"),
                BrowserCommand::Event(BrowserEvent::Data("Authorized users only\r\n".into())),
                BrowserCommand::Event(BrowserEvent::Reauth),
                ssherror("SSH CONN ERROR: All configured authentication methods failed"),
                BrowserCommand::Disconnect
            ]
        );
    }

    #[test_log::test(tokio::test)]
    async fn changes_directory_before_forwarding_keystrokes() {
        let (connector, mut shells) = FakeConnector::with_shells(FakeFilesystem::new(
            "/home/alice",
            &[("/home/alice/data", Entry::Directory)],
        ));
        let geometry = Arc::clone(&connector.shell_geometry);
        let closes = Arc::clone(&connector.closes);
        let context = context(connector, StaticResolver::default(), &[]);
        let (browser, mut browser_rx) = BrowserHandle::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        inbound_tx
            .send(BrowserMessage::Geometry(Geometry {
                cols: 120,
                rows: 40,
            }))
            .unwrap();
        inbound_tx
            .send(BrowserMessage::Data(Bytes::from_static(b"ls\n")))
            .unwrap();
        let session = tokio::spawn(
            GatewaySession::new(4, peer(), context, browser, inbound_rx).run(
                Some(password_identity("alice", "secret")),
                SessionRequest {
                    directory: Some("/home/alice/data".into()),
                    ..Default::default()
                },
            ),
        );
        let mut shell = timeout(Duration::from_secs(1), shells.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            shell.input.recv().await.unwrap(),
            ShellInput::Data(Bytes::from_static(b"cd \"/home/alice/data\"\n"))
        );
        // Geometry may arrive before or after the shell was opened.
        let next = shell.input.recv().await.unwrap();
        let keystrokes = match next {
            ShellInput::Resize(_) => shell.input.recv().await.unwrap(),
            other => other,
        };
        assert_eq!(keystrokes, ShellInput::Data(Bytes::from_static(b"ls\n")));
        shell
            .output
            .send(ShellOutput::Data(Bytes::from_static(b"data.csv\r\n")))
            .await
            .unwrap();
        shell
            .output
            .send(ShellOutput::Closed {
                code: Some(0),
                signal: None,
            })
            .await
            .unwrap();
        let outcome = session.await.unwrap();
        assert_eq!(outcome.state, SessionState::Closed);
        assert_eq!(outcome.error, Some(SessionError::ShellClosed(String::new())));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        let shell_geometry = geometry.lock().unwrap().unwrap();
        assert!(shell_geometry == Geometry { cols: 120, rows: 40 } || shell_geometry == Geometry::default());
        let commands = drain(&mut browser_rx);
        assert_eq!(
            commands.iter().filter(|command| matches!(command, BrowserCommand::Event(BrowserEvent::Status(_)))).count(),
            3
        );
        assert!(commands.contains(&BrowserCommand::Output(Bytes::from_static(b"data.csv\r\n"))));
        assert_eq!(
            &commands[commands.len() - 2..],
            [ssherror("SSH STREAM CLOSE"), BrowserCommand::Disconnect]
        );
    }

    #[test_log::test(tokio::test)]
    async fn fails_on_missing_directory() {
        let (connector, mut shells) =
            FakeConnector::with_shells(FakeFilesystem::new("/home/alice", &[]));
        let context = context(connector, StaticResolver::default(), &[]);
        let (browser, mut browser_rx) = BrowserHandle::new();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let outcome = GatewaySession::new(5, peer(), context, browser, inbound_rx)
            .run(
                Some(password_identity("alice", "secret")),
                SessionRequest {
                    directory: Some("/tmp/nonexistent".into()),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(
            outcome.error,
            Some(SessionError::Directory(DirectoryError::Missing))
        );
        assert!(shells.try_recv().is_err(), "no shell should be opened");
        assert!(
            drain(&mut browser_rx)
                .contains(&ssherror("SSH DIRECTORY CHECK: Missing Directory"))
        );
    }

    #[test_log::test(tokio::test)]
    async fn closes_upstream_when_browser_disconnects() {
        let (connector, mut shells) =
            FakeConnector::with_shells(FakeFilesystem::new("/home/alice", &[]));
        let closes = Arc::clone(&connector.closes);
        let context = context(connector, StaticResolver::default(), &[]);
        let (browser, mut browser_rx) = BrowserHandle::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = tokio::spawn(
            GatewaySession::new(6, peer(), Arc::clone(&context), browser, inbound_rx).run(
                Some(password_identity("alice", "secret")),
                SessionRequest::default(),
            ),
        );
        let mut shell = timeout(Duration::from_secs(1), shells.recv())
            .await
            .unwrap()
            .unwrap();
        inbound_tx
            .send(BrowserMessage::Resize(Geometry { cols: 100, rows: 30 }))
            .unwrap();
        assert_eq!(
            shell.input.recv().await.unwrap(),
            ShellInput::Resize(Geometry { cols: 100, rows: 30 })
        );
        inbound_tx
            .send(BrowserMessage::Disconnect("transport close".into()))
            .unwrap();
        let outcome = session.await.unwrap();
        assert_eq!(outcome.state, SessionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(context.shutdown.live_sessions(), 0);
        assert_eq!(
            drain(&mut browser_rx).last(),
            Some(&BrowserCommand::Disconnect)
        );
    }

    #[test_log::test(tokio::test)]
    async fn forwards_output_while_shell_input_piles_up() {
        let (connector, mut shells) =
            FakeConnector::with_shells(FakeFilesystem::new("/home/alice", &[]));
        let context = context(connector, StaticResolver::default(), &[]);
        let (browser, mut browser_rx) = BrowserHandle::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = tokio::spawn(
            GatewaySession::new(8, peer(), context, browser, inbound_rx).run(
                Some(password_identity("alice", "secret")),
                SessionRequest::default(),
            ),
        );
        let mut shell = timeout(Duration::from_secs(1), shells.recv())
            .await
            .unwrap()
            .unwrap();
        for _ in 0..1000 {
            inbound_tx
                .send(BrowserMessage::Data(Bytes::from_static(&[b'x'; 100])))
                .unwrap();
        }
        // The shell never reads its input while writing output.
        timeout(Duration::from_secs(5), async {
            for _ in 0..1000 {
                shell
                    .output
                    .send(ShellOutput::Data(Bytes::from_static(&[b'y'; 100])))
                    .await
                    .unwrap();
            }
        })
        .await
        .expect("session stopped reading shell output");
        let mut inputs = 0;
        while inputs < 1000 {
            let input = timeout(Duration::from_secs(5), shell.input.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(input, ShellInput::Data(_)) {
                inputs += 1;
            }
        }
        shell
            .output
            .send(ShellOutput::Closed {
                code: Some(0),
                signal: None,
            })
            .await
            .unwrap();
        let outcome = timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.error, Some(SessionError::ShellClosed(String::new())));
        let outputs = drain(&mut browser_rx)
            .into_iter()
            .filter(|command| matches!(command, BrowserCommand::Output(_)))
            .count();
        assert_eq!(outputs, 1000);
    }

    #[test_log::test(tokio::test)]
    async fn terminates_only_once() {
        let context = context(FakeConnector::default(), StaticResolver::default(), &[]);
        let (browser, mut browser_rx) = BrowserHandle::new();
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut session = GatewaySession::new(7, peer(), context, browser, inbound_rx);
        session.terminate(SessionError::UpstreamAuthFailure).await;
        session
            .terminate(SessionError::UpstreamConnectionClosed("Connection reset".into()))
            .await;
        assert_eq!(session.first_error, Some(SessionError::UpstreamAuthFailure));
        assert_eq!(
            drain(&mut browser_rx),
            [
                BrowserCommand::Event(BrowserEvent::Reauth),
                ssherror("SSH CONN ERROR: All configured authentication methods failed"),
                BrowserCommand::Disconnect
            ]
        );
    }
}
