use std::{future::Future, net::IpAddr};

use hickory_resolver::TokioResolver;
use ipnet::IpNet;
use ipnet_trie::IpnetTrie;
#[cfg(not(coverage_nightly))]
use tracing::debug;

use crate::error::ServerError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub(crate) struct ResolutionError(pub(crate) String);

// Turns a destination hostname into the address that will actually be dialed.
pub(crate) trait HostResolver {
    fn resolve(&self, host: &str) -> impl Future<Output = Result<IpAddr, ResolutionError>> + Send;
}

// Resolver backed by the system DNS configuration (including the hosts file).
pub(crate) struct DnsResolver(TokioResolver);

impl DnsResolver {
    pub(crate) fn new() -> color_eyre::Result<Self> {
        Ok(DnsResolver(TokioResolver::builder_tokio()?.build()))
    }
}

impl HostResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, ResolutionError> {
        if let Ok(address) = host.parse::<IpAddr>() {
            return Ok(address);
        }
        let lookup = self
            .0
            .lookup_ip(host)
            .await
            .map_err(|error| ResolutionError(error.to_string()))?;
        lookup
            .iter()
            .next()
            .ok_or_else(|| ResolutionError(format!("no addresses found for {host}")))
    }
}

// Set of networks that upstream hosts must belong to. Empty means unrestricted.
pub(crate) struct AllowedSubnets {
    networks: Vec<IpNet>,
    data: IpnetTrie<()>,
}

impl AllowedSubnets {
    pub(crate) fn new(networks: Vec<IpNet>) -> color_eyre::Result<Self> {
        let mut data = IpnetTrie::new();
        for network in networks.iter() {
            if data.insert(*network, ()).is_some() {
                return Err(ServerError::DuplicateNetworkCidr(*network).into());
            }
        }
        Ok(AllowedSubnets { networks, data })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub(crate) fn contains(&self, address: IpAddr) -> bool {
        self.data
            .longest_match(&IpNet::from(address.to_canonical()))
            .is_some()
    }
}

impl Default for AllowedSubnets {
    fn default() -> Self {
        AllowedSubnets {
            networks: Vec::new(),
            data: IpnetTrie::new(),
        }
    }
}

impl std::fmt::Debug for AllowedSubnets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.networks.iter()).finish()
    }
}

// Policy gate applied to every destination before any upstream connection is attempted.
pub(crate) struct HostAllowlist<R> {
    resolver: R,
}

impl<R: HostResolver> HostAllowlist<R> {
    pub(crate) fn new(resolver: R) -> Self {
        HostAllowlist { resolver }
    }

    // Resolution failures are returned as errors, so that callers can tell
    // an unresolvable host apart from a denied one.
    pub(crate) async fn is_allowed(
        &self,
        host: &str,
        subnets: &AllowedSubnets,
    ) -> Result<bool, ResolutionError> {
        if subnets.is_empty() {
            return Ok(true);
        }
        let address = self.resolver.resolve(host).await?;
        #[cfg(not(coverage_nightly))]
        debug!(%host, %address, ?subnets, "Validating host against allowed subnets.");
        Ok(subnets.contains(address))
    }
}
