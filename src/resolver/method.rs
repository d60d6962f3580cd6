//! the DNS lookup plugin: forward queries, reverse queries, LLMNR fallback
//!
//! One `DnsMethod` instance backs both transports. A forward exchange issues
//! two independent queries on the same socket (type A, then type AAAA), so
//! the caller knows to wait for two responses before declaring the name
//! unresolved. Destination selection is driven entirely by the server
//! address: the registered LLMNR multicast group routes the datagram to port
//! 5355, anything else is ordinary unicast DNS on port 53.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;

use crate::resolver::buffer::BytePacketBuffer;
use crate::resolver::context::ServerTable;
use crate::resolver::engine::{
    Answer, Exchange, MethodDescriptor, MethodError, MethodKind, ResolutionMethod,
    PRIORITY_MULTICAST_LLMNR, PRIORITY_UNICAST_DNS,
};
use crate::resolver::netutil::send_datagram;
use crate::resolver::protocol::{DnsPacket, DnsRecord, QueryType, ResultCode};

type Result<T> = std::result::Result<T, MethodError>;

/// At most this many addresses are extracted from one response.
pub const MAX_HOST_ADDRESSES: usize = 10;

pub struct DnsMethod {
    table: Arc<ServerTable>,
    descriptor: MethodDescriptor,
}

impl DnsMethod {
    /// Unicast DNS method, registered once per configured server.
    pub fn unicast(table: Arc<ServerTable>) -> DnsMethod {
        let timeout = table.timeout();
        DnsMethod {
            table,
            descriptor: MethodDescriptor {
                kind: MethodKind::Dns,
                multicast: false,
                priority: PRIORITY_UNICAST_DNS,
                timeout,
                wait_anyway: false,
            },
        }
    }

    /// LLMNR fallback method, registered once per multicast group. It waits
    /// out its own timeout even after DNS answered, draining duplicates.
    pub fn llmnr(table: Arc<ServerTable>) -> DnsMethod {
        let timeout = table.timeout();
        DnsMethod {
            table,
            descriptor: MethodDescriptor {
                kind: MethodKind::Llmnr,
                multicast: true,
                priority: PRIORITY_MULTICAST_LLMNR,
                timeout,
                wait_anyway: true,
            },
        }
    }

    pub fn descriptor(&self) -> MethodDescriptor {
        self.descriptor
    }

    fn send_query(
        &self,
        socket: &UdpSocket,
        name: &str,
        qtype: QueryType,
        server: IpAddr,
    ) -> Result<u16> {
        let id = self.table.next_id();
        let mut packet = DnsPacket::query(id, name, qtype);
        if self.table.is_llmnr_group(server) {
            // LLMNR queries carry no recursion bit
            packet.header.recursion_desired = false;
        }
        let buffer = packet.to_buffer()?;

        let (port, multicast) = if self.table.is_llmnr_group(server) {
            (self.table.llmnr_port(), true)
        } else {
            (self.table.dns_port(), false)
        };

        send_datagram(socket, &buffer.buffer, server, port, multicast)?;
        Ok(id)
    }

    fn receive(&self, socket: &UdpSocket) -> Result<DnsPacket> {
        let mut buffer = BytePacketBuffer::new();
        let (_len, _src) = socket.recv_from(&mut buffer.buf).map_err(|e| {
            if crate::resolver::netutil::is_timeout(&e) {
                MethodError::Timeout
            } else {
                MethodError::Io(e)
            }
        })?;

        Ok(DnsPacket::from_buffer(&mut buffer)?)
    }
}

impl ResolutionMethod for DnsMethod {
    /// Issue the A and AAAA queries for `name`, qualified with the domain
    /// suffix when it carries no dot of its own.
    fn request_by_name(&self, name: &str, server: IpAddr, socket: &UdpSocket) -> Result<Exchange> {
        let qname = self.table.qualify(name);

        let id_a = self.send_query(socket, &qname, QueryType::A, server)?;
        let id_aaaa = self.send_query(socket, &qname, QueryType::Aaaa, server)?;

        log::info!(
            "{:?} query for {} sent to {} (ids {}/{})",
            self.descriptor.kind,
            qname,
            server,
            id_a,
            id_aaaa
        );

        Ok(Exchange::new(vec![id_a, id_aaaa]))
    }

    /// Parse exactly one inbound datagram. Up to `MAX_HOST_ADDRESSES` A
    /// answers are taken; when the packet carries none, the same answers are
    /// rescanned for AAAA. Datagrams whose id does not belong to this
    /// exchange are discarded and the wait continues.
    fn response_by_name(&self, socket: &UdpSocket, exchange: &mut Exchange) -> Result<Answer> {
        let packet = self.receive(socket)?;

        if !exchange.ids.contains(&packet.header.id) {
            log::info!("discarding stray response id {}", packet.header.id);
            return Ok(Answer::MoreData);
        }

        exchange.expected = exchange.expected.saturating_sub(1);

        match packet.header.rescode {
            ResultCode::REFUSED => return Err(MethodError::Refused),
            ResultCode::NXDOMAIN => {
                return if exchange.expected == 0 {
                    Err(MethodError::NotFound)
                } else {
                    Ok(Answer::MoreData)
                };
            }
            _ => {}
        }

        let mut addrs: Vec<IpAddr> = packet
            .answers
            .iter()
            .filter_map(|rec| match rec {
                DnsRecord::A { addr, .. } => Some(IpAddr::V4(*addr)),
                _ => None,
            })
            .take(MAX_HOST_ADDRESSES)
            .collect();

        if addrs.is_empty() {
            addrs = packet
                .answers
                .iter()
                .filter_map(|rec| match rec {
                    DnsRecord::Aaaa { addr, .. } => Some(IpAddr::V6(*addr)),
                    _ => None,
                })
                .take(MAX_HOST_ADDRESSES)
                .collect();
        }

        if addrs.is_empty() {
            if exchange.expected == 0 {
                Err(MethodError::NotFound)
            } else {
                Ok(Answer::MoreData)
            }
        } else {
            Ok(Answer::Addresses(addrs))
        }
    }

    /// Issue a PTR query for the reverse name of `addr`.
    fn request_by_ip(&self, addr: IpAddr, server: IpAddr, socket: &UdpSocket) -> Result<Exchange> {
        let qname = reverse_name(addr);
        let id = self.send_query(socket, &qname, QueryType::Ptr, server)?;

        log::info!(
            "{:?} reverse query for {} sent to {} (id {})",
            self.descriptor.kind,
            qname,
            server,
            id
        );

        Ok(Exchange::new(vec![id]))
    }

    /// Decode a single host name from the PTR answer.
    fn response_by_ip(&self, socket: &UdpSocket, exchange: &mut Exchange) -> Result<Answer> {
        let packet = self.receive(socket)?;

        if !exchange.ids.contains(&packet.header.id) {
            return Ok(Answer::MoreData);
        }

        exchange.expected = exchange.expected.saturating_sub(1);

        match packet.header.rescode {
            ResultCode::REFUSED => return Err(MethodError::Refused),
            ResultCode::NXDOMAIN => return Err(MethodError::NotFound),
            _ => {}
        }

        for rec in &packet.answers {
            if let DnsRecord::Ptr { host, .. } = rec {
                return Ok(Answer::Name(host.clone()));
            }
        }

        Err(MethodError::NotFound)
    }
}

/// Build the reverse-lookup owner name: dotted octets reversed under
/// `in-addr.arpa` for IPv4, one hex nibble per label reversed under
/// `ip6.arpa` for IPv6.
pub fn reverse_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut labels = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                labels.push(format!("{:x}", byte & 0x0F));
                labels.push(format!("{:x}", byte >> 4));
            }
            format!("{}.ip6.arpa", labels.join("."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::context::{ResolverConfig, ServerTable};
    use crate::resolver::protocol::{DnsHeader, DnsQuestion, TransientTtl};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_table() -> Arc<ServerTable> {
        let mut config = ResolverConfig::default();
        config.domain_suffix = "example.com".to_string();
        config.timeout = Duration::from_millis(200);
        Arc::new(ServerTable::new(&config))
    }

    fn local_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        a.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let b = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        (a, b)
    }

    #[test]
    fn test_reverse_name_v4() {
        assert_eq!(
            "4.3.2.1.in-addr.arpa",
            reverse_name("1.2.3.4".parse().unwrap())
        );
    }

    #[test]
    fn test_reverse_name_v6() {
        let name = reverse_name("2001:db8::1".parse().unwrap());
        assert!(name.ends_with(".ip6.arpa"));
        assert!(name.starts_with("1.0.0.0."));
        // 32 nibble labels plus ip6 and arpa
        assert_eq!(34, name.split('.').count());
    }

    #[test]
    fn test_suffix_appended_to_bare_names() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let sender = UdpSocket::bind(("127.0.0.1", 0)).unwrap();

        // route the "unicast" query at the local receiver
        let mut config = ResolverConfig::default();
        config.domain_suffix = "example.com".to_string();
        config.dns_port = receiver.local_addr().unwrap().port();
        config.timeout = Duration::from_millis(200);
        let table = Arc::new(ServerTable::new(&config));
        let method = DnsMethod::unicast(table);

        let exchange = method
            .request_by_name("host", "127.0.0.1".parse().unwrap(), &sender)
            .unwrap();
        assert_eq!(2, exchange.expected);

        let mut buffer = BytePacketBuffer::new();
        receiver.recv_from(&mut buffer.buf).unwrap();
        let packet = DnsPacket::from_buffer(&mut buffer).unwrap();

        assert_eq!("host.example.com", packet.questions[0].name);
        assert_eq!(QueryType::A, packet.questions[0].qtype);
    }

    #[test]
    fn test_single_a_answer() {
        let table = test_table();
        let method = DnsMethod::unicast(table);
        let (socket, responder) = local_pair();

        let mut response = DnsPacket::new();
        response.header = DnsHeader::new();
        response.header.id = 77;
        response.header.response = true;
        response
            .questions
            .push(DnsQuestion::new("host.example.com".to_string(), QueryType::A));
        response.answers.push(DnsRecord::A {
            domain: "host.example.com".to_string(),
            addr: Ipv4Addr::new(10, 0, 0, 5),
            ttl: TransientTtl(300),
        });
        let buffer = response.to_buffer().unwrap();
        responder
            .send_to(&buffer.buffer, socket.local_addr().unwrap())
            .unwrap();

        let mut exchange = Exchange::new(vec![77, 78]);
        match method.response_by_name(&socket, &mut exchange).unwrap() {
            Answer::Addresses(addrs) => {
                assert_eq!(1, addrs.len());
                assert_eq!("10.0.0.5".parse::<IpAddr>().unwrap(), addrs[0]);
            }
            other => panic!("unexpected answer: {:?}", other),
        }
    }

    #[test]
    fn test_name_not_found() {
        let table = test_table();
        let method = DnsMethod::unicast(table);
        let (socket, responder) = local_pair();

        let mut response = DnsPacket::new();
        response.header.id = 5;
        response.header.response = true;
        response.header.rescode = ResultCode::NXDOMAIN;
        let buffer = response.to_buffer().unwrap();
        responder
            .send_to(&buffer.buffer, socket.local_addr().unwrap())
            .unwrap();

        // last outstanding response of the exchange
        let mut exchange = Exchange::new(vec![5]);
        assert!(matches!(
            method.response_by_name(&socket, &mut exchange),
            Err(MethodError::NotFound)
        ));
    }

    #[test]
    fn test_stray_response_is_discarded() {
        let table = test_table();
        let method = DnsMethod::unicast(table);
        let (socket, responder) = local_pair();

        let mut response = DnsPacket::new();
        response.header.id = 999;
        response.header.response = true;
        let buffer = response.to_buffer().unwrap();
        responder
            .send_to(&buffer.buffer, socket.local_addr().unwrap())
            .unwrap();

        let mut exchange = Exchange::new(vec![1, 2]);
        assert_eq!(
            Answer::MoreData,
            method.response_by_name(&socket, &mut exchange).unwrap()
        );
        assert_eq!(2, exchange.expected);
    }
}
