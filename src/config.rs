use std::{fmt::Display, path::PathBuf, str::FromStr};

use clap::Parser;
use humantime::Duration;
use ipnet::IpNet;

pub(crate) const DEFAULT_SSH_PORT: u16 = 22;

// A configured upstream destination, parsed from `HOST[:PORT]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

impl FromStr for HostPort {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Bracketed IPv6 literals may carry a port, bare ones cannot.
        if let Some(rest) = value.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| "missing closing bracket".to_string())?;
            let port = match rest.strip_prefix(':') {
                Some(port) => Some(validate_port(port)?),
                None if rest.is_empty() => None,
                None => return Err("unexpected characters after address".into()),
            };
            return Ok(HostPort {
                host: host.into(),
                port,
            });
        }
        match value.split_once(':') {
            Some((host, port)) if !port.contains(':') => {
                if host.is_empty() {
                    return Err("host cannot be empty".into());
                }
                Ok(HostPort {
                    host: host.into(),
                    port: Some(validate_port(port)?),
                })
            }
            _ if value.is_empty() => Err("host cannot be empty".into()),
            _ => Ok(HostPort {
                host: value.into(),
                port: None,
            }),
        }
    }
}

impl Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

// Preferred algorithm names for the upstream SSH handshake, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AlgorithmPreferences {
    pub(crate) kex: Vec<String>,
    pub(crate) cipher: Vec<String>,
    pub(crate) hmac: Vec<String>,
    pub(crate) compress: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen for browser connections.
    #[arg(long, default_value_t = String::from("0.0.0.0"), value_name = "ADDRESS")]
    pub listen_address: String,

    /// Port to listen for browser connections.
    #[arg(long, default_value_t = 6312, value_parser = validate_port, value_name = "PORT")]
    pub port: u16,

    /// Upstream SSH host, optionally with a port. Can be repeated to build a pool of hosts,
    /// which will be used in round-robin order for requests that don't name a valid host.
    ///
    /// The first host is used as the default destination.
    #[arg(long = "host", required = true, value_name = "HOST[:PORT]")]
    pub hosts: Vec<HostPort>,

    /// Port used for hosts configured or requested without one.
    #[arg(long, default_value_t = DEFAULT_SSH_PORT, value_parser = validate_port, value_name = "PORT")]
    pub default_port: u16,

    /// File path to the private key that is offered to every upstream host.
    /// If set, it takes precedence over passwords provided by users.
    #[arg(long, value_name = "FILE")]
    pub private_key_file: Option<PathBuf>,

    /// Default terminal type requested for shells.
    #[arg(long, default_value_t = String::from("xterm-color"), value_name = "TERM")]
    pub term: String,

    /// Default time to wait for the upstream handshake and authentication to complete.
    #[arg(long, default_value = "20s", value_name = "DURATION")]
    pub ready_timeout: Duration,

    /// Interval between keepalive messages sent to the upstream host.
    #[arg(long, default_value = "120s", value_name = "DURATION")]
    pub keepalive_interval: Duration,

    /// How many unanswered keepalive messages are tolerated before disconnecting.
    #[arg(long, default_value_t = 10, value_name = "COUNT")]
    pub keepalive_count_max: usize,

    /// Network (in CIDR notation) that upstream hosts must resolve into.
    /// Can be repeated. By default, all hosts are allowed.
    #[arg(long = "allowed-subnet", value_name = "CIDR")]
    pub allowed_subnets: Vec<IpNet>,

    /// Comma-separated key exchange algorithms, in order of preference.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "ecdh-sha2-nistp256,ecdh-sha2-nistp384,ecdh-sha2-nistp521,diffie-hellman-group-exchange-sha256,diffie-hellman-group14-sha1",
        value_name = "ALGORITHMS"
    )]
    pub kex: Vec<String>,

    /// Comma-separated ciphers, in order of preference.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "aes128-ctr,aes192-ctr,aes256-ctr,aes128-gcm,aes128-gcm@openssh.com,aes256-gcm,aes256-gcm@openssh.com,aes256-cbc",
        value_name = "ALGORITHMS"
    )]
    pub cipher: Vec<String>,

    /// Comma-separated MAC algorithms, in order of preference.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "hmac-sha2-256,hmac-sha2-512,hmac-sha1",
        value_name = "ALGORITHMS"
    )]
    pub hmac: Vec<String>,

    /// Comma-separated compression algorithms, in order of preference.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "none,zlib@openssh.com,zlib",
        value_name = "ALGORITHMS"
    )]
    pub compress: Vec<String>,

    /// How long (in seconds) connected sessions are given to finish after a termination signal.
    /// A second signal stops the server immediately.
    #[arg(long, default_value_t = 3, value_name = "SECONDS")]
    pub safe_shutdown_duration: u64,
}

impl ApplicationConfig {
    pub(crate) fn algorithms(&self) -> AlgorithmPreferences {
        AlgorithmPreferences {
            kex: self.kex.clone(),
            cipher: self.cipher.clone(),
            hmac: self.hmac.clone(),
            compress: self.compress.clone(),
        }
    }
}

fn validate_port(port: &str) -> Result<u16, String> {
    match port.parse::<u16>() {
        Err(err) => Err(format!("{err}")),
        Ok(0) => Err("port cannot be zero".into()),
        Ok(port) => Ok(port),
    }
}
