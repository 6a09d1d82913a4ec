use std::{net::SocketAddr, sync::Arc};

use color_eyre::eyre::Context;
use russh::keys::decode_secret_key;
use tokio::{fs, net::TcpListener, pin};
use tokio_util::sync::CancellationToken;
#[cfg(not(coverage_nightly))]
use tracing::{debug, error, info};

use crate::{
    allowlist::{AllowedSubnets, DnsResolver, HostAllowlist},
    config::ApplicationConfig,
    destination::DestinationSelector,
    droppable_handle::DroppableHandle,
    error::ServerError,
    session::GatewayContext,
    session_config::{SessionConfigBuilder, SessionDefaults},
    shutdown::{CancellationShutdown, ShutdownCoordinator},
    transport::router,
    upstream::RusshConnector,
};

#[doc(hidden)]
// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    #[cfg(not(coverage_nightly))]
    info!("Starting shellgate...");
    // Check configuration flags for issues
    if config.term.trim().is_empty() {
        return Err(ServerError::InvalidConfig("Terminal type cannot be empty".into()).into());
    }
    if config.ready_timeout.is_zero() {
        return Err(ServerError::InvalidConfig("Ready timeout must be positive".into()).into());
    }
    let private_key = match config.private_key_file.as_ref() {
        Some(path) => {
            let key = fs::read_to_string(path)
                .await
                .with_context(|| "Error reading secret key")?;
            Some(Arc::new(
                decode_secret_key(&key, None).with_context(|| "Error decoding secret key")?,
            ))
        }
        None => None,
    };
    let selector = DestinationSelector::from_hosts(&config.hosts, config.default_port)
        .with_context(|| "Error setting up upstream hosts")?;
    let allowed_subnets = AllowedSubnets::new(config.allowed_subnets.clone())
        .with_context(|| "Error setting up allowed subnets")?;
    let defaults = SessionDefaults::builder()
        .term(config.term.clone())
        .ready_timeout(config.ready_timeout.into())
        .keepalive_interval(config.keepalive_interval.into())
        .keepalive_count_max(config.keepalive_count_max)
        .algorithms(config.algorithms())
        .allowed_subnets(Arc::new(allowed_subnets))
        .maybe_private_key(private_key)
        .build();
    let resolver = DnsResolver::new().with_context(|| "Error setting up DNS resolver")?;

    let stop_token = CancellationToken::new();
    let shutdown = ShutdownCoordinator::new(
        config.safe_shutdown_duration,
        Box::new(CancellationShutdown(stop_token.clone())),
    );
    let context = Arc::new(
        GatewayContext::builder()
            .config_builder(SessionConfigBuilder::new(Arc::new(selector), defaults))
            .allowlist(HostAllowlist::new(resolver))
            .connector(RusshConnector)
            .shutdown(Arc::clone(&shutdown))
            .build(),
    );

    let listener = TcpListener::bind((config.listen_address.clone(), config.port))
        .await
        .with_context(|| "Error listening to HTTP port and address")?;
    #[cfg(not(coverage_nightly))]
    info!(address = %config.listen_address, port = %config.port, "Listening for browser connections.");
    let app = router(context).into_make_service_with_connect_info::<SocketAddr>();
    // Dropping the handle stops accepting new connections.
    let mut join_handle_http = DroppableHandle(tokio::spawn(async move {
        axum::serve(listener, app).await
    }));

    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    loop {
        tokio::select! {
            result = &mut signal_handler => {
                if let Err(error) = result {
                    #[cfg(not(coverage_nightly))]
                    error!(%error, "Unable to listen for signals.");
                    break;
                }
                shutdown.request_shutdown();
                signal_handler.set(wait_for_signal());
            }
            _ = stop_token.cancelled() => {
                break;
            }
            result = &mut join_handle_http.0 => {
                match result {
                    Ok(Ok(())) => (),
                    Ok(Err(error)) => {
                        #[cfg(not(coverage_nightly))]
                        error!(%error, "HTTP server stopped unexpectedly.");
                    }
                    Err(error) => {
                        #[cfg(not(coverage_nightly))]
                        error!(%error, "HTTP server task failed.");
                    }
                }
                break;
            }
        }
    }
    #[cfg(not(coverage_nightly))]
    info!("shellgate is shutting down.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate())?;
    let mut signal_interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = signal_terminate.recv() => {
            #[cfg(not(coverage_nightly))]
            debug!("Received SIGTERM.");
        }
        _ = signal_interrupt.recv() => {
            #[cfg(not(coverage_nightly))]
            debug!("Received SIGINT.");
        }
    };
    Ok(())
}

#[cfg(windows)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c()?;
    let mut signal_break = windows::ctrl_break()?;
    let mut signal_close = windows::ctrl_close()?;
    let mut signal_shutdown = windows::ctrl_shutdown()?;

    tokio::select! {
        _ = signal_c.recv() => {
            #[cfg(not(coverage_nightly))]
            debug!("Received CTRL_C.");
        }
        _ = signal_break.recv() => {
            #[cfg(not(coverage_nightly))]
            debug!("Received CTRL_BREAK.");
        }
        _ = signal_close.recv() => {
            #[cfg(not(coverage_nightly))]
            debug!("Received CTRL_CLOSE.");
        }
        _ = signal_shutdown.recv() => {
            #[cfg(not(coverage_nightly))]
            debug!("Received CTRL_SHUTDOWN.");
        }
    };
    Ok(())
}
