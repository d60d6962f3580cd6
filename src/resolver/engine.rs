//! method registry and arbitration for pluggable name resolution
//!
//! Resolution methods (DNS, LLMNR, directory-service discovery, NetBIOS in
//! stacks that carry it) register here keyed by (kind, multicast, server).
//! The arbitration loop issues every registered request up front, then
//! collects responses in activation-priority order: unicast methods are
//! registered at a numerically lower priority than multicast ones and are
//! therefore tried earlier. A method registered with `wait_anyway` keeps its
//! socket draining until its own timeout expires even after another method
//! already answered, so late or duplicate multicast replies cannot leak into
//! a later exchange.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use parking_lot::Mutex;

use crate::resolver::netutil;

/// Activation priority for unicast DNS registrations.
pub const PRIORITY_UNICAST_DNS: u8 = 1;

/// Activation priority for multicast LLMNR registrations; higher number,
/// tried later.
pub const PRIORITY_MULTICAST_LLMNR: u8 = 2;

#[derive(Debug, Display, From, Error)]
pub enum MethodError {
    Io(std::io::Error),
    Protocol(crate::resolver::protocol::ProtocolError),
    /// Server answered REFUSED; the engine escalates to a more
    /// comprehensive method instead of failing the query.
    Refused,
    NotFound,
    Timeout,
}

type Result<T> = std::result::Result<T, MethodError>;

#[derive(Debug, Display, Error)]
pub enum EngineError {
    NotResolved,
    NoMethods,
}

/// The kind tag a registration is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    NetBios,
    Dns,
    DnsDc,
    Llmnr,
}

/// Per-registration behavior the arbitration loop honors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub kind: MethodKind,
    pub multicast: bool,
    pub priority: u8,
    pub timeout: Duration,
    pub wait_anyway: bool,
}

/// State for one in-flight exchange: the transaction ids issued by the
/// request and how many independent responses remain outstanding before the
/// method can declare the query failed.
#[derive(Debug)]
pub struct Exchange {
    pub ids: Vec<u16>,
    pub expected: usize,
}

impl Exchange {
    pub fn new(ids: Vec<u16>) -> Exchange {
        let expected = ids.len();
        Exchange { ids, expected }
    }
}

/// A successful plugin response. `MoreData` asks the loop for another
/// receive round on the same exchange.
#[derive(Debug, PartialEq, Eq)]
pub enum Answer {
    Addresses(Vec<IpAddr>),
    Name(String),
    MoreData,
}

/// A pluggable resolution strategy. The engine owns the per-exchange socket
/// and calls request once, then response until the method produces a result
/// or its timeout runs out.
pub trait ResolutionMethod: Send + Sync {
    fn request_by_name(&self, name: &str, server: IpAddr, socket: &UdpSocket) -> Result<Exchange>;
    fn response_by_name(&self, socket: &UdpSocket, exchange: &mut Exchange) -> Result<Answer>;
    fn request_by_ip(&self, addr: IpAddr, server: IpAddr, socket: &UdpSocket) -> Result<Exchange>;
    fn response_by_ip(&self, socket: &UdpSocket, exchange: &mut Exchange) -> Result<Answer>;
}

struct Registration {
    descriptor: MethodDescriptor,
    server: IpAddr,
    method: Arc<dyn ResolutionMethod>,
}

/// Registry of resolution methods keyed by (kind, multicast, server).
/// Multiple registrations with the same key may coexist; removal deletes
/// the first match only.
pub struct MethodRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl MethodRegistry {
    pub fn new() -> MethodRegistry {
        MethodRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(
        &self,
        descriptor: MethodDescriptor,
        server: IpAddr,
        method: Arc<dyn ResolutionMethod>,
    ) {
        log::info!(
            "registering {:?} method for server {} at priority {}",
            descriptor.kind,
            server,
            descriptor.priority
        );
        self.entries.lock().push(Registration {
            descriptor,
            server,
            method,
        });
    }

    /// Remove the first registration matching the key. Returns whether an
    /// entry was removed; calling again with the same key is harmless.
    pub fn remove(&self, kind: MethodKind, multicast: bool, server: IpAddr) -> bool {
        let mut entries = self.entries.lock();
        if let Some(idx) = entries.iter().position(|r| {
            r.descriptor.kind == kind && r.descriptor.multicast == multicast && r.server == server
        }) {
            entries.remove(idx);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn count_kind(&self, kind: MethodKind) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|r| r.descriptor.kind == kind)
            .count()
    }

    /// Resolve a host name to its addresses through the registered methods.
    pub fn resolve_name(&self, name: &str) -> std::result::Result<Vec<IpAddr>, EngineError> {
        match self.run(Query::Name(name))? {
            Answer::Addresses(addrs) => Ok(addrs),
            _ => Err(EngineError::NotResolved),
        }
    }

    /// Resolve an address back to a host name (reverse lookup).
    pub fn resolve_addr(&self, addr: IpAddr) -> std::result::Result<String, EngineError> {
        match self.run(Query::Addr(addr))? {
            Answer::Name(name) => Ok(name),
            _ => Err(EngineError::NotResolved),
        }
    }

    fn run(&self, query: Query<'_>) -> std::result::Result<Answer, EngineError> {
        let snapshot: Vec<(MethodDescriptor, IpAddr, Arc<dyn ResolutionMethod>)> = {
            let entries = self.entries.lock();
            if entries.is_empty() {
                return Err(EngineError::NoMethods);
            }
            let mut methods: Vec<_> = entries
                .iter()
                .map(|r| (r.descriptor, r.server, r.method.clone()))
                .collect();
            // stable: unicast sorts before multicast at equal priority
            methods.sort_by_key(|(d, _, _)| (d.priority, d.multicast));
            methods
        };

        struct Attempt {
            descriptor: MethodDescriptor,
            server: IpAddr,
            socket: UdpSocket,
            method: Arc<dyn ResolutionMethod>,
            exchange: Exchange,
        }

        // issue every request up front; responses are collected in
        // priority order below
        let mut attempts = Vec::new();
        for (descriptor, server, method) in snapshot {
            let socket = match netutil::bind_udp(server, descriptor.timeout) {
                Ok(socket) => socket,
                Err(e) => {
                    log::warn!("socket for {:?} via {} failed: {}", descriptor.kind, server, e);
                    continue;
                }
            };

            let sent = match query {
                Query::Name(name) => method.request_by_name(name, server, &socket),
                Query::Addr(addr) => method.request_by_ip(addr, server, &socket),
            };

            match sent {
                Ok(exchange) => attempts.push(Attempt {
                    descriptor,
                    server,
                    socket,
                    method,
                    exchange,
                }),
                Err(e) => {
                    log::warn!("request via {:?} to {} failed: {}", descriptor.kind, server, e)
                }
            }
        }

        let mut result: Option<Answer> = None;

        for attempt in &mut attempts {
            // once resolved, only methods that demand draining are waited out
            if result.is_some() && !attempt.descriptor.wait_anyway {
                continue;
            }

            let deadline = Instant::now() + attempt.descriptor.timeout;

            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }

                // bound each receive by what is left of this attempt's
                // timeout, so a stray datagram cannot stretch the wait to
                // almost twice the budget
                if let Err(e) = attempt.socket.set_read_timeout(Some(deadline - now)) {
                    log::warn!(
                        "adjusting receive timeout for {:?} failed: {}",
                        attempt.descriptor.kind,
                        e
                    );
                    break;
                }

                let response = match query {
                    Query::Name(_) => attempt
                        .method
                        .response_by_name(&attempt.socket, &mut attempt.exchange),
                    Query::Addr(_) => attempt
                        .method
                        .response_by_ip(&attempt.socket, &mut attempt.exchange),
                };

                match response {
                    Ok(Answer::MoreData) => continue,
                    Ok(answer) => {
                        if result.is_none() {
                            result = Some(answer);
                        }
                        if !attempt.descriptor.wait_anyway {
                            break;
                        }
                        // keep draining duplicates until the timeout expires
                    }
                    Err(MethodError::Timeout) => break,
                    Err(MethodError::Refused) => {
                        log::info!(
                            "{:?} via {} answered no-access, escalating",
                            attempt.descriptor.kind,
                            attempt.server
                        );
                        break;
                    }
                    Err(e) => {
                        log::info!(
                            "{:?} via {} failed: {}",
                            attempt.descriptor.kind,
                            attempt.server,
                            e
                        );
                        break;
                    }
                }
            }
        }

        result.ok_or(EngineError::NotResolved)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        MethodRegistry::new()
    }
}

#[derive(Clone, Copy)]
enum Query<'a> {
    Name(&'a str),
    Addr(IpAddr),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct StaticMethod {
        addrs: Vec<IpAddr>,
    }

    impl ResolutionMethod for StaticMethod {
        fn request_by_name(
            &self,
            _name: &str,
            _server: IpAddr,
            _socket: &UdpSocket,
        ) -> Result<Exchange> {
            Ok(Exchange::new(vec![1]))
        }

        fn response_by_name(
            &self,
            _socket: &UdpSocket,
            _exchange: &mut Exchange,
        ) -> Result<Answer> {
            if self.addrs.is_empty() {
                Err(MethodError::Timeout)
            } else {
                Ok(Answer::Addresses(self.addrs.clone()))
            }
        }

        fn request_by_ip(
            &self,
            _addr: IpAddr,
            _server: IpAddr,
            _socket: &UdpSocket,
        ) -> Result<Exchange> {
            Ok(Exchange::new(vec![1]))
        }

        fn response_by_ip(&self, _socket: &UdpSocket, _exchange: &mut Exchange) -> Result<Answer> {
            Err(MethodError::Timeout)
        }
    }

    fn descriptor(kind: MethodKind, multicast: bool, priority: u8) -> MethodDescriptor {
        MethodDescriptor {
            kind,
            multicast,
            priority,
            timeout: Duration::from_millis(50),
            wait_anyway: false,
        }
    }

    fn server(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_remove_is_idempotent_and_first_match_only() {
        let registry = MethodRegistry::new();
        let method: Arc<dyn ResolutionMethod> = Arc::new(StaticMethod { addrs: Vec::new() });

        registry.register(descriptor(MethodKind::Dns, false, 1), server(1), method.clone());
        registry.register(descriptor(MethodKind::Dns, false, 1), server(1), method.clone());
        registry.register(descriptor(MethodKind::Llmnr, true, 2), server(2), method);
        assert_eq!(3, registry.len());

        // first matching entry only
        assert!(registry.remove(MethodKind::Dns, false, server(1)));
        assert_eq!(2, registry.len());

        assert!(registry.remove(MethodKind::Dns, false, server(1)));
        assert_eq!(1, registry.len());

        // second removal of a now-absent key changes nothing
        assert!(!registry.remove(MethodKind::Dns, false, server(1)));
        assert_eq!(1, registry.len());
        assert_eq!(1, registry.count_kind(MethodKind::Llmnr));
    }

    #[test]
    fn test_lower_priority_number_wins() {
        let registry = MethodRegistry::new();
        let slow: Arc<dyn ResolutionMethod> = Arc::new(StaticMethod {
            addrs: vec![server(99)],
        });
        let fast: Arc<dyn ResolutionMethod> = Arc::new(StaticMethod {
            addrs: vec![server(5)],
        });

        registry.register(descriptor(MethodKind::Llmnr, true, 2), server(2), slow);
        registry.register(descriptor(MethodKind::Dns, false, 1), server(1), fast);

        let addrs = registry.resolve_name("fs1").unwrap();
        assert_eq!(vec![server(5)], addrs);
    }

    #[test]
    fn test_empty_registry_reports_no_methods() {
        let registry = MethodRegistry::new();
        assert!(matches!(
            registry.resolve_name("fs1"),
            Err(EngineError::NoMethods)
        ));
    }
}
