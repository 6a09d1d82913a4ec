use std::{fmt::Debug, net::IpAddr, sync::Arc, time::Duration};

use bon::Builder;
use russh::keys::PrivateKey;
use rustls_pki_types::DnsName;
#[cfg(not(coverage_nightly))]
use tracing::debug;

use crate::{
    allowlist::AllowedSubnets,
    config::AlgorithmPreferences,
    destination::{Destination, DestinationSelector},
    error::SessionError,
};

const MAX_READY_TIMEOUT_MS: u64 = 300_000;
const NO_CORRELATION_TOKEN: &str = "none";

// Secret used to authenticate against the upstream host.
#[derive(Clone)]
pub(crate) enum Credentials {
    Password(String),
    PrivateKey(Arc<PrivateKey>),
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password([REDACTED])"),
            Credentials::PrivateKey(_) => f.write_str("PrivateKey([REDACTED])"),
        }
    }
}

// Identity bound to a browser channel by the authentication layer.
#[derive(Clone, Default)]
pub(crate) struct Identity {
    pub(crate) username: String,
    pub(crate) password: Option<String>,
    pub(crate) private_key: Option<Arc<PrivateKey>>,
}

impl Identity {
    // A private key takes precedence over a password when both are present.
    pub(crate) fn credentials(&self) -> Option<Credentials> {
        if self.username.is_empty() {
            return None;
        }
        if let Some(key) = self.private_key.as_ref() {
            return Some(Credentials::PrivateKey(Arc::clone(key)));
        }
        self.password
            .as_ref()
            .filter(|password| !password.is_empty())
            .map(|password| Credentials::Password(password.clone()))
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

// Untrusted, per-request fields as received by the transport.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionRequest {
    pub(crate) host: Option<String>,
    pub(crate) port: Option<String>,
    pub(crate) term: Option<String>,
    pub(crate) ready_timeout: Option<String>,
    pub(crate) correlation_token: Option<String>,
    pub(crate) directory: Option<String>,
}

// Trusted, process-wide defaults for every session.
#[derive(Debug, Builder)]
pub(crate) struct SessionDefaults {
    #[builder(into)]
    term: String,
    ready_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_count_max: usize,
    #[builder(default)]
    algorithms: AlgorithmPreferences,
    #[builder(default)]
    allowed_subnets: Arc<AllowedSubnets>,
    private_key: Option<Arc<PrivateKey>>,
}

impl SessionDefaults {
    pub(crate) fn private_key(&self) -> Option<Arc<PrivateKey>> {
        self.private_key.clone()
    }
}

// Everything needed to open one upstream connection. Never mutated once built.
#[derive(Clone)]
pub(crate) struct SessionConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: String,
    pub(crate) credentials: Credentials,
    pub(crate) term: String,
    pub(crate) ready_timeout: Duration,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_count_max: usize,
    // Whether keyboard-interactive challenges are answered with the password.
    pub(crate) keyboard_interactive: bool,
    pub(crate) algorithms: AlgorithmPreferences,
    pub(crate) allowed_subnets: Arc<AllowedSubnets>,
    pub(crate) correlation_token: String,
    // Raw requested directory; validated later against the upstream filesystem.
    pub(crate) requested_directory: Option<String>,
}

impl SessionConfig {
    pub(crate) fn destination(&self) -> Destination {
        Destination {
            host: self.host.clone(),
            port: self.port,
        }
    }

    // Short-lived connections only authenticate and disconnect.
    pub(crate) fn without_interaction(self) -> Self {
        SessionConfig {
            keepalive_interval: None,
            keyboard_interactive: false,
            ..self
        }
    }
}

impl Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("credentials", &self.credentials)
            .field("term", &self.term)
            .field("ready_timeout", &self.ready_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_count_max", &self.keepalive_count_max)
            .field("keyboard_interactive", &self.keyboard_interactive)
            .field("allowed_subnets", &self.allowed_subnets)
            .field("correlation_token", &self.correlation_token)
            .field("requested_directory", &self.requested_directory)
            .finish_non_exhaustive()
    }
}

// Assembles session configurations from untrusted request data.
//
// Malformed optional fields are silently replaced by their defaults; only missing
// credentials are fatal.
pub(crate) struct SessionConfigBuilder {
    selector: Arc<DestinationSelector>,
    defaults: SessionDefaults,
}

impl SessionConfigBuilder {
    pub(crate) fn new(selector: Arc<DestinationSelector>, defaults: SessionDefaults) -> Self {
        SessionConfigBuilder { selector, defaults }
    }

    pub(crate) fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    pub(crate) fn build(
        &self,
        identity: &Identity,
        request: &SessionRequest,
    ) -> Result<SessionConfig, SessionError> {
        let credentials = identity
            .credentials()
            .ok_or(SessionError::MissingCredentials)?;
        let Destination { host, port } = self.selector.select(request.host.as_deref());
        let config = SessionConfig {
            host,
            port: validate_port(request.port.as_deref()).unwrap_or(port),
            username: identity.username.clone(),
            credentials,
            term: validate_term(request.term.as_deref())
                .unwrap_or_else(|| self.defaults.term.clone()),
            ready_timeout: validate_ready_timeout(request.ready_timeout.as_deref())
                .unwrap_or(self.defaults.ready_timeout),
            keepalive_interval: Some(self.defaults.keepalive_interval),
            keepalive_count_max: self.defaults.keepalive_count_max,
            keyboard_interactive: true,
            algorithms: self.defaults.algorithms.clone(),
            allowed_subnets: Arc::clone(&self.defaults.allowed_subnets),
            correlation_token: validate_correlation_token(request.correlation_token.as_deref()),
            requested_directory: request
                .directory
                .as_ref()
                .filter(|directory| !directory.is_empty())
                .cloned(),
        };
        #[cfg(not(coverage_nightly))]
        debug!(?config, "Built session configuration.");
        Ok(config)
    }
}

// Valid IP address, fully-qualified domain name, or restricted name.
pub(crate) fn is_valid_host(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
        || (host.contains('.') && DnsName::try_from(host).is_ok())
        || is_restricted_name(host)
}

// Alphanumerics and `!^(){}-_~`, ending in a word character.
pub(crate) fn is_restricted_name(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "!^(){}-_~".contains(c))
        && value
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Characters allowed in a requested directory.
pub(crate) fn is_path_safe(directory: &str) -> bool {
    directory
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_ ./-".contains(c))
}

pub(crate) fn validate_port(port: Option<&str>) -> Option<u16> {
    port?.parse::<u16>().ok().filter(|port| *port >= 1)
}

pub(crate) fn validate_term(term: Option<&str>) -> Option<String> {
    term.filter(|term| is_restricted_name(term)).map(Into::into)
}

pub(crate) fn validate_ready_timeout(ready_timeout: Option<&str>) -> Option<Duration> {
    ready_timeout?
        .parse::<u64>()
        .ok()
        .filter(|ms| (1..=MAX_READY_TIMEOUT_MS).contains(ms))
        .map(Duration::from_millis)
}

pub(crate) fn validate_correlation_token(token: Option<&str>) -> String {
    token
        .filter(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(NO_CORRELATION_TOKEN)
        .into()
}
