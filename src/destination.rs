use std::{fmt::Display, sync::Mutex};

use crate::{config::HostPort, error::ServerError, session_config::is_valid_host};

// A concrete upstream address for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Destination {
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// Picks upstream destinations from the configured host pool.
//
// The pool is shared by every session, so the round-robin cursor is only ever
// touched while holding its lock.
#[derive(Debug)]
pub(crate) struct DestinationSelector {
    pool: Vec<Destination>,
    // Index of the most recently rotated-to entry.
    cursor: Mutex<usize>,
    default_port: u16,
}

impl DestinationSelector {
    pub(crate) fn new(pool: Vec<Destination>, default_port: u16) -> Result<Self, ServerError> {
        if pool.is_empty() {
            return Err(ServerError::EmptyHostPool);
        }
        Ok(DestinationSelector {
            cursor: Mutex::new(pool.len() - 1),
            pool,
            default_port,
        })
    }

    pub(crate) fn from_hosts(hosts: &[HostPort], default_port: u16) -> Result<Self, ServerError> {
        Self::new(
            hosts
                .iter()
                .map(|HostPort { host, port }| Destination {
                    host: host.clone(),
                    port: port.unwrap_or(default_port),
                })
                .collect(),
            default_port,
        )
    }

    // Choose where a session should connect to.
    //
    // A valid requested host that is part of the pool uses the pool's port. With a
    // single configured host, any other valid host is passed through with the default
    // port. Everything else rotates through the pool.
    pub(crate) fn select(&self, requested_host: Option<&str>) -> Destination {
        if let Some(host) = requested_host.filter(|host| is_valid_host(host)) {
            if let Some(entry) = self.pool.iter().find(|entry| entry.host == host) {
                return entry.clone();
            }
            if self.pool.len() == 1 {
                return Destination {
                    host: host.into(),
                    port: self.default_port,
                };
            }
        }
        self.rotate()
    }

    fn rotate(&self) -> Destination {
        let mut cursor = self.cursor.lock().unwrap();
        *cursor = (*cursor + 1) % self.pool.len();
        self.pool[*cursor].clone()
    }
}

#[cfg(test)]
mod destination_selector_tests {
    use std::sync::Arc;

    use crate::config::HostPort;

    use super::{Destination, DestinationSelector};

    fn pool(entries: &[(&str, u16)]) -> Vec<Destination> {
        entries
            .iter()
            .map(|(host, port)| Destination {
                host: host.to_string(),
                port: *port,
            })
            .collect()
    }

    #[test]
    fn fails_on_empty_pool() {
        assert!(DestinationSelector::new(vec![], 22).is_err());
    }

    #[test]
    fn single_host_is_passthrough() {
        let selector = DestinationSelector::new(pool(&[("node01", 2222)]), 22).unwrap();
        assert_eq!(selector.select(None), pool(&[("node01", 2222)])[0]);
        assert_eq!(selector.select(None), pool(&[("node01", 2222)])[0]);
        assert_eq!(
            selector.select(Some("node01")),
            pool(&[("node01", 2222)])[0]
        );
        assert_eq!(
            selector.select(Some("10.0.0.4")),
            pool(&[("10.0.0.4", 22)])[0],
            "valid unknown host should be passed through"
        );
        assert_eq!(
            selector.select(Some("bad host;rm")),
            pool(&[("node01", 2222)])[0],
            "invalid host should fall back to the pool"
        );
    }

    #[test]
    fn wraps_around_after_pool_size_selections() {
        let selector = DestinationSelector::new(
            pool(&[("node01", 22), ("node02", 22), ("node03", 2222)]),
            22,
        )
        .unwrap();
        let first = selector.select(None);
        let second = selector.select(None);
        let third = selector.select(None);
        let fourth = selector.select(None);
        assert_eq!(first.host, "node01");
        assert_eq!(second.host, "node02");
        assert_eq!(third, pool(&[("node03", 2222)])[0]);
        assert_eq!(fourth, first);
    }

    #[test]
    fn matching_host_does_not_advance_rotation() {
        let selector =
            DestinationSelector::new(pool(&[("node01", 22), ("node02", 2200)]), 22).unwrap();
        assert_eq!(selector.select(Some("node02")).port, 2200);
        assert_eq!(selector.select(Some("node02")).port, 2200);
        assert_eq!(selector.select(None).host, "node01");
        assert_eq!(selector.select(Some("other.example.com")).host, "node02");
        assert_eq!(selector.select(Some("bad host")).host, "node01");
    }

    #[test]
    fn uses_default_port_for_configured_hosts_without_one() {
        let selector = DestinationSelector::from_hosts(
            &[
                "node01".parse::<HostPort>().unwrap(),
                "node02:2200".parse::<HostPort>().unwrap(),
            ],
            2022,
        )
        .unwrap();
        assert_eq!(selector.select(None), pool(&[("node01", 2022)])[0]);
        assert_eq!(selector.select(None), pool(&[("node02", 2200)])[0]);
    }

    #[test]
    fn concurrent_selections_spread_evenly() {
        let selector = Arc::new(
            DestinationSelector::new(pool(&[("node01", 22), ("node02", 22)]), 22).unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let selector = Arc::clone(&selector);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| selector.select(None).host)
                        .filter(|host| host == "node01")
                        .count()
                })
            })
            .collect();
        let node01: usize = handles.into_iter().map(|handle| handle.join().unwrap()).sum();
        assert_eq!(node01, 100);
    }
}
