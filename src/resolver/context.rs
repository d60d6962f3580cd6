//! resolver context: configuration, server table and the public surface
//!
//! `ResolverContext` owns the pieces a host application interacts with: the
//! shared server table, the method registry with its DNS and LLMNR
//! registrations, the domain controller locator and the dynamic update
//! publisher. One context per configuration; there is no process-global
//! state.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use parking_lot::Mutex;

use crate::resolver::engine::{EngineError, MethodKind, MethodRegistry};
use crate::resolver::locator::{DcLocator, LocatorError};
use crate::resolver::method::DnsMethod;
use crate::resolver::netutil::{DNS_PORT, LLMNR_PORT};
use crate::resolver::security::{AddressEnumerator, CredentialSource, SecurityProvider};
use crate::resolver::update::{UpdateError, UpdatePublisher};

/// The server table holds at most this many DNS servers.
pub const MAX_DNS_SERVERS: usize = 8;

/// LLMNR multicast group, IPv4.
pub const LLMNR_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 252);

/// LLMNR multicast group, IPv6.
pub const LLMNR_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0x0001, 0x0003);

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    /// More servers than the table can hold; the previous list is untouched.
    TableFull,
    Engine(EngineError),
    Locator(LocatorError),
    Update(UpdateError),
}

type Result<T> = std::result::Result<T, ContextError>;

/// Everything the resolver needs to know about its host environment.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// This host's own (unqualified) name; empty disables registration.
    pub host_name: String,
    /// Suffix appended to bare lookup names and used as the update zone.
    pub domain_suffix: String,
    pub dns_servers: Vec<IpAddr>,
    /// Runtime switch for dynamic registration of this host's records.
    pub register_self: bool,
    pub timeout: Duration,
    pub dns_port: u16,
    pub llmnr_port: u16,
}

impl Default for ResolverConfig {
    fn default() -> ResolverConfig {
        ResolverConfig {
            host_name: String::new(),
            domain_suffix: String::new(),
            dns_servers: Vec::new(),
            register_self: false,
            timeout: Duration::from_secs(3),
            dns_port: DNS_PORT,
            llmnr_port: LLMNR_PORT,
        }
    }
}

struct TableInner {
    servers: Vec<IpAddr>,
    suffix: String,
    next_id: u16,
    overridden: bool,
}

/// Shared state behind every exchange: the ordered server list, the domain
/// suffix and the transaction-id counter, all behind one mutex. The ports
/// and timeout are immutable for the life of the context.
pub struct ServerTable {
    inner: Mutex<TableInner>,
    host_name: String,
    register_self: bool,
    timeout: Duration,
    dns_port: u16,
    llmnr_port: u16,
}

impl ServerTable {
    pub fn new(config: &ResolverConfig) -> ServerTable {
        ServerTable {
            inner: Mutex::new(TableInner {
                servers: config.dns_servers.clone(),
                suffix: config.domain_suffix.clone(),
                next_id: rand::random(),
                overridden: false,
            }),
            host_name: config.host_name.clone(),
            register_self: config.register_self,
            timeout: config.timeout,
            dns_port: config.dns_port,
            llmnr_port: config.llmnr_port,
        }
    }

    /// Allocate the next transaction id.
    pub fn next_id(&self) -> u16 {
        let mut inner = self.inner.lock();
        inner.next_id = inner.next_id.wrapping_add(1);
        inner.next_id
    }

    pub fn servers(&self) -> Vec<IpAddr> {
        self.inner.lock().servers.clone()
    }

    /// Replace the server list wholesale. Overlong lists are rejected before
    /// anything changes.
    pub fn set_servers(&self, servers: Vec<IpAddr>, overridden: bool) -> Result<Vec<IpAddr>> {
        if servers.len() > MAX_DNS_SERVERS {
            return Err(ContextError::TableFull);
        }

        let mut inner = self.inner.lock();
        let old = std::mem::replace(&mut inner.servers, servers);
        inner.overridden = overridden;
        Ok(old)
    }

    pub fn is_overridden(&self) -> bool {
        self.inner.lock().overridden
    }

    pub fn suffix(&self) -> String {
        self.inner.lock().suffix.clone()
    }

    pub fn set_suffix(&self, suffix: &str) {
        self.inner.lock().suffix = suffix.to_string();
    }

    /// Append the domain suffix to names that carry no dot of their own.
    pub fn qualify(&self, name: &str) -> String {
        let suffix = self.suffix();
        if name.contains('.') || suffix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", name, suffix)
        }
    }

    pub fn is_llmnr_group(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => v4 == LLMNR_GROUP_V4,
            IpAddr::V6(v6) => v6 == LLMNR_GROUP_V6,
        }
    }

    pub fn host_name(&self) -> String {
        self.host_name.clone()
    }

    pub fn register_self(&self) -> bool {
        self.register_self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn dns_port(&self) -> u16 {
        self.dns_port
    }

    pub fn llmnr_port(&self) -> u16 {
        self.llmnr_port
    }
}

/// The resolver's public surface.
pub struct ResolverContext {
    table: Arc<ServerTable>,
    registry: Arc<MethodRegistry>,
    locator: DcLocator,
    publisher: UpdatePublisher,
}

impl ResolverContext {
    /// Build a context from the configuration: the DNS method is registered
    /// once per server at unicast priority, the LLMNR fallback once per
    /// multicast group.
    pub fn new(
        config: ResolverConfig,
        credentials: Arc<dyn CredentialSource>,
        security: Arc<dyn SecurityProvider>,
    ) -> Result<ResolverContext> {
        if config.dns_servers.len() > MAX_DNS_SERVERS {
            return Err(ContextError::TableFull);
        }

        let table = Arc::new(ServerTable::new(&config));
        let registry = Arc::new(MethodRegistry::new());

        for server in table.servers() {
            let method = Arc::new(DnsMethod::unicast(table.clone()));
            registry.register(method.descriptor(), server, method);
        }

        for group in [IpAddr::V4(LLMNR_GROUP_V4), IpAddr::V6(LLMNR_GROUP_V6)] {
            let method = Arc::new(DnsMethod::llmnr(table.clone()));
            registry.register(method.descriptor(), group, method);
        }

        let locator = DcLocator::new(table.clone());
        let publisher = UpdatePublisher::new(table.clone(), credentials, security);

        Ok(ResolverContext {
            table,
            registry,
            locator,
            publisher,
        })
    }

    /// Forward lookup through the registered methods.
    pub fn resolve_host(&self, name: &str) -> Result<Vec<IpAddr>> {
        Ok(self.registry.resolve_name(name)?)
    }

    /// Reverse lookup through the registered methods.
    pub fn resolve_address(&self, addr: IpAddr) -> Result<String> {
        Ok(self.registry.resolve_addr(addr)?)
    }

    /// SRV-based domain controller discovery; `domain` defaults to the
    /// configured suffix when empty.
    pub fn locate_domain_controllers(&self, domain: &str) -> Result<Vec<String>> {
        Ok(self.locator.locate(domain)?)
    }

    /// Register this host's records on the configured servers.
    pub fn publish_self(&self, enumerator: &dyn AddressEnumerator) -> Result<()> {
        Ok(self.publisher.publish(&enumerator.self_addresses())?)
    }

    /// Delete this host's records, if any publication ever succeeded.
    pub fn retract_self(&self) -> Result<()> {
        Ok(self.publisher.retract()?)
    }

    /// Replace the DNS server list: old DNS registrations are removed before
    /// the new servers are registered, so a failed validation leaves the
    /// registry untouched.
    pub fn set_dns_servers(&self, servers: Vec<IpAddr>) -> Result<()> {
        let old = self.table.set_servers(servers, true)?;

        for server in old {
            self.registry.remove(MethodKind::Dns, false, server);
        }
        for server in self.table.servers() {
            let method = Arc::new(DnsMethod::unicast(self.table.clone()));
            self.registry.register(method.descriptor(), server, method);
        }

        Ok(())
    }

    pub fn set_domain_suffix(&self, suffix: &str) {
        self.table.set_suffix(suffix);
    }

    /// Retract published records and deregister every method.
    pub fn shutdown(&self) {
        if let Err(e) = self.publisher.retract() {
            log::warn!("retracting published records failed: {}", e);
        }

        for server in self.table.servers() {
            self.registry.remove(MethodKind::Dns, false, server);
        }
        for group in [IpAddr::V4(LLMNR_GROUP_V4), IpAddr::V6(LLMNR_GROUP_V6)] {
            self.registry.remove(MethodKind::Llmnr, true, group);
        }
    }

    pub fn table(&self) -> &Arc<ServerTable> {
        &self.table
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }
}
