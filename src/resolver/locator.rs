//! SRV-based domain controller discovery
//!
//! Directory-capable servers publish themselves under the well-known
//! `_ldap._tcp.dc._msdcs.<domain>` owner name. The locator walks the
//! configured server list in order and returns the SRV targets from the
//! first server that answers; per-server failures are logged and the loop
//! moves on.

use std::net::IpAddr;
use std::sync::Arc;

use derive_more::{Display, Error, From};

use crate::resolver::buffer::BytePacketBuffer;
use crate::resolver::context::ServerTable;
use crate::resolver::netutil::{bind_udp, is_timeout, send_datagram};
use crate::resolver::protocol::{DnsPacket, DnsRecord, QueryType, ResultCode};

#[derive(Debug, Display, From, Error)]
pub enum LocatorError {
    Io(std::io::Error),
    Protocol(crate::resolver::protocol::ProtocolError),
    /// Every configured server either failed or knew no controllers.
    NoControllers,
}

type Result<T> = std::result::Result<T, LocatorError>;

/// Well-known SRV owner prefix for domain controller discovery.
pub const DC_SRV_PREFIX: &str = "_ldap._tcp.dc._msdcs";

pub struct DcLocator {
    table: Arc<ServerTable>,
}

impl DcLocator {
    pub fn new(table: Arc<ServerTable>) -> DcLocator {
        DcLocator { table }
    }

    /// Discover domain controllers for `domain` (the configured suffix when
    /// empty). Returns the SRV target host names from the first server that
    /// produces any.
    pub fn locate(&self, domain: &str) -> Result<Vec<String>> {
        let domain = if domain.is_empty() {
            self.table.suffix()
        } else {
            domain.to_string()
        };
        let qname = format!("{}.{}", DC_SRV_PREFIX, domain);

        for server in self.table.servers() {
            match self.query_one(&qname, server) {
                Ok(targets) if !targets.is_empty() => {
                    log::info!(
                        "{} controller(s) for {} found via {}",
                        targets.len(),
                        domain,
                        server
                    );
                    return Ok(targets);
                }
                Ok(_) => {
                    log::info!("{} knows no controllers for {}", server, domain);
                }
                Err(e) => {
                    log::warn!("controller discovery via {} failed: {}", server, e);
                }
            }
        }

        Err(LocatorError::NoControllers)
    }

    fn query_one(&self, qname: &str, server: IpAddr) -> Result<Vec<String>> {
        let socket = bind_udp(server, self.table.timeout())?;
        let id = self.table.next_id();

        let mut packet = DnsPacket::query(id, qname, QueryType::Srv);
        let buffer = packet.to_buffer()?;
        send_datagram(&socket, &buffer.buffer, server, self.table.dns_port(), false)?;

        // wait out stray datagrams with mismatched ids, bounded by the
        // socket timeout
        loop {
            let mut response = BytePacketBuffer::new();
            if let Err(e) = socket.recv_from(&mut response.buf) {
                if is_timeout(&e) {
                    return Ok(Vec::new());
                }
                return Err(LocatorError::Io(e));
            }

            let parsed = DnsPacket::from_buffer(&mut response)?;
            if parsed.header.id != id {
                continue;
            }

            if parsed.header.rescode != ResultCode::NOERROR {
                log::info!(
                    "SRV query for {} answered {:?} by {}",
                    qname,
                    parsed.header.rescode,
                    server
                );
                return Ok(Vec::new());
            }

            let targets = parsed
                .answers
                .iter()
                .filter_map(|rec| match rec {
                    DnsRecord::Srv { host, .. } => Some(host.clone()),
                    _ => None,
                })
                .collect();

            return Ok(targets);
        }
    }
}
