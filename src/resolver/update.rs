//! dynamic registration of this host's address records
//!
//! Publication builds an RFC2136-style update per address family and offers
//! it to every configured server: a SOA zone question, a CNAME-absence
//! prerequisite for the host, a delete of the existing RRset and one add per
//! address. A server answering REFUSED gets a second, signed attempt after a
//! TKEY negotiation; any other rejection fails that server only. Publication
//! succeeds when at least one server accepted either form.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use derive_more::{Display, Error, From};

use crate::resolver::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::resolver::context::ServerTable;
use crate::resolver::netutil::{bind_udp, is_timeout, send_datagram};
use crate::resolver::protocol::{
    DnsHeader, DnsPacket, QueryClass, QueryType, ResultCode, OPCODE_UPDATE,
};
use crate::resolver::security::{CredentialSource, SecurityError, SecurityProvider};
use crate::resolver::tkey::{TkeySession, TkeySignature};

#[derive(Debug, Display, From, Error)]
pub enum UpdateError {
    Io(std::io::Error),
    Buffer(crate::resolver::buffer::BufferError),
    Protocol(crate::resolver::protocol::ProtocolError),
    Tkey(crate::resolver::tkey::TkeyError),
    Security(SecurityError),
    /// The server answered something other than success or REFUSED.
    Rejected,
    Timeout,
    /// Every configured server rejected both the plain and the signed form.
    NoServerAccepted,
}

type Result<T> = std::result::Result<T, UpdateError>;

/// One update message: registers (or, with an empty address list, merely
/// deletes) the RRset of `qtype` at `host` in `zone`.
pub struct UpdateMessage {
    pub zone: String,
    pub host: String,
    pub qtype: QueryType,
    pub addrs: Vec<IpAddr>,
}

impl UpdateMessage {
    /// Serialize under a fresh transaction id, appending `signature` when
    /// this is the signed retry. Record classes are written by hand since
    /// update sections repurpose them: NONE marks the absence prerequisite,
    /// ANY the RRset delete, IN each addition.
    pub fn write(&self, id: u16, signature: Option<&TkeySignature>) -> Result<VectorPacketBuffer> {
        let mut buffer = VectorPacketBuffer::new();

        let mut header = DnsHeader::new();
        header.id = id;
        header.opcode = OPCODE_UPDATE;
        header.questions = 1; // zone
        header.answers = 1; // prerequisite
        header.authoritative_entries = 1 + self.addrs.len() as u16; // delete + adds
        header.resource_entries = signature.is_some() as u16;
        header.write(&mut buffer)?;

        // zone section
        buffer.write_qname(&self.zone)?;
        buffer.write_u16(QueryType::Soa.to_num())?;
        buffer.write_u16(QueryClass::In.to_num())?;

        // prerequisite: no CNAME may exist at the host name
        buffer.write_qname(&self.host)?;
        buffer.write_u16(QueryType::Cname.to_num())?;
        buffer.write_u16(QueryClass::None.to_num())?;
        buffer.write_u32(0)?;
        buffer.write_u16(0)?;

        // update: drop the whole RRset, then add each address
        buffer.write_qname(&self.host)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(QueryClass::Any.to_num())?;
        buffer.write_u32(0)?;
        buffer.write_u16(0)?;

        for addr in &self.addrs {
            buffer.write_qname(&self.host)?;
            buffer.write_u16(self.qtype.to_num())?;
            buffer.write_u16(QueryClass::In.to_num())?;
            buffer.write_u32(0)?;

            match addr {
                IpAddr::V4(v4) => {
                    buffer.write_u16(4)?;
                    for octet in &v4.octets() {
                        buffer.write_u8(*octet)?;
                    }
                }
                IpAddr::V6(v6) => {
                    buffer.write_u16(16)?;
                    for segment in &v6.segments() {
                        buffer.write_u16(*segment)?;
                    }
                }
            }
        }

        if let Some(signature) = signature {
            signature.write(&mut buffer, id)?;
        }

        Ok(buffer)
    }
}

/// Publishes and retracts this host's A/AAAA records.
pub struct UpdatePublisher {
    table: Arc<ServerTable>,
    credentials: Arc<dyn CredentialSource>,
    security: Arc<dyn SecurityProvider>,
    published: AtomicBool,
}

impl UpdatePublisher {
    pub fn new(
        table: Arc<ServerTable>,
        credentials: Arc<dyn CredentialSource>,
        security: Arc<dyn SecurityProvider>,
    ) -> UpdatePublisher {
        UpdatePublisher {
            table,
            credentials,
            security,
            published: AtomicBool::new(false),
        }
    }

    /// Registration is configured off, or there is no name to register.
    /// Either way publication and retraction are successful no-ops.
    fn enabled(&self) -> bool {
        self.table.register_self() && !self.table.host_name().is_empty()
    }

    /// Register the given addresses, one update per address family. The two
    /// family rounds are independent: an A failure never suppresses the
    /// AAAA round. The first failure is reported after both rounds ran.
    pub fn publish(&self, addrs: &[IpAddr]) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        let v4: Vec<IpAddr> = addrs.iter().filter(|a| a.is_ipv4()).cloned().collect();
        let v6: Vec<IpAddr> = addrs.iter().filter(|a| a.is_ipv6()).cloned().collect();

        let mut outcome = Ok(());

        if !v4.is_empty() {
            match self.update_servers(QueryType::A, v4) {
                Ok(()) => self.published.store(true, Ordering::SeqCst),
                Err(e) => outcome = Err(e),
            }
        }
        if !v6.is_empty() {
            match self.update_servers(QueryType::Aaaa, v6) {
                Ok(()) => self.published.store(true, Ordering::SeqCst),
                Err(e) => {
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
        }

        outcome
    }

    /// Delete previously registered records. A no-op unless some earlier
    /// publication actually succeeded. Both family rounds always run; the
    /// published flag is cleared only once both deletes went through, so a
    /// failed retraction can be retried.
    pub fn retract(&self) -> Result<()> {
        if !self.enabled() || !self.published.load(Ordering::SeqCst) {
            return Ok(());
        }

        let v4 = self.update_servers(QueryType::A, Vec::new());
        let v6 = self.update_servers(QueryType::Aaaa, Vec::new());

        match (v4, v6) {
            (Ok(()), Ok(())) => {
                self.published.store(false, Ordering::SeqCst);
                Ok(())
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    /// Offer one update to every configured server. Per-server failures are
    /// isolated; at least one acceptance makes the round a success.
    fn update_servers(&self, qtype: QueryType, addrs: Vec<IpAddr>) -> Result<()> {
        let message = UpdateMessage {
            zone: self.table.suffix(),
            host: self.table.qualify(&self.table.host_name()),
            qtype,
            addrs,
        };

        let mut accepted = 0;
        for server in self.table.servers() {
            match self.update_one(server, &message) {
                Ok(()) => {
                    log::info!("{:?} update for {} accepted by {}", qtype, message.host, server);
                    accepted += 1;
                }
                Err(e) => {
                    log::warn!("{:?} update for {} via {} failed: {}", qtype, message.host, server, e);
                }
            }
        }

        if accepted > 0 {
            Ok(())
        } else {
            Err(UpdateError::NoServerAccepted)
        }
    }

    /// Plain attempt first; REFUSED escalates to the TKEY-secured form.
    fn update_one(&self, server: IpAddr, message: &UpdateMessage) -> Result<()> {
        let id = self.table.next_id();
        let buffer = message.write(id, None)?;
        let response = self.send_update(server, &buffer.buffer, id)?;

        match response.header.rescode {
            ResultCode::NOERROR => Ok(()),
            ResultCode::REFUSED => self.secure_update(server, message),
            _ => Err(UpdateError::Rejected),
        }
    }

    fn secure_update(&self, server: IpAddr, message: &UpdateMessage) -> Result<()> {
        let credentials = self
            .credentials
            .machine_credentials()
            .ok_or(UpdateError::Security(SecurityError::NoCredentials))?;

        let signature = {
            let mut session = TkeySession::connect(self.table.clone(), server)?;
            let (signature, _keys) = session.negotiate(self.security.as_ref(), &credentials)?;
            // session drops here: TCP stream and key blobs released
            signature
        };

        let id = self.table.next_id();
        let buffer = message.write(id, Some(&signature))?;
        let response = self.send_update(server, &buffer.buffer, id)?;

        match response.header.rescode {
            ResultCode::NOERROR => Ok(()),
            _ => Err(UpdateError::Rejected),
        }
    }

    fn send_update(&self, server: IpAddr, buf: &[u8], id: u16) -> Result<DnsPacket> {
        let socket = bind_udp(server, self.table.timeout())?;
        send_datagram(&socket, buf, server, self.table.dns_port(), false)?;

        loop {
            let mut response = BytePacketBuffer::new();
            if let Err(e) = socket.recv_from(&mut response.buf) {
                if is_timeout(&e) {
                    return Err(UpdateError::Timeout);
                }
                return Err(UpdateError::Io(e));
            }

            let parsed = DnsPacket::from_buffer(&mut response)?;
            if parsed.header.id == id {
                return Ok(parsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(buf: &[u8], off: usize) -> u16 {
        ((buf[off] as u16) << 8) | (buf[off + 1] as u16)
    }

    #[test]
    fn test_update_message_layout() {
        let message = UpdateMessage {
            zone: "corp.local".to_string(),
            host: "ws1.corp.local".to_string(),
            qtype: QueryType::A,
            addrs: vec!["10.0.0.9".parse().unwrap()],
        };

        let buffer = message.write(0x0102, None).unwrap();
        let buf = &buffer.buffer;

        // header: id, opcode 5, counts 1/1/2/0
        assert_eq!(0x0102, word(buf, 0));
        assert_eq!(OPCODE_UPDATE, (buf[2] >> 3) & 0x0F);
        assert_eq!(1, word(buf, 4));
        assert_eq!(1, word(buf, 6));
        assert_eq!(2, word(buf, 8));
        assert_eq!(0, word(buf, 10));

        // zone question: "corp.local" SOA IN
        let mut off = 12;
        assert_eq!(4, buf[off]); // "corp"
        off += 1 + 4 + 1 + 5 + 1; // corp, local, root
        assert_eq!(QueryType::Soa.to_num(), word(buf, off));
        assert_eq!(QueryClass::In.to_num(), word(buf, off + 2));
        off += 4;

        // prerequisite: CNAME, class NONE, ttl 0, empty rdata
        off += 1 + 3 + 1 + 4 + 1 + 5 + 1; // ws1.corp.local
        assert_eq!(QueryType::Cname.to_num(), word(buf, off));
        assert_eq!(QueryClass::None.to_num(), word(buf, off + 2));
        assert_eq!(0, word(buf, off + 4));
        assert_eq!(0, word(buf, off + 6));
        assert_eq!(0, word(buf, off + 8));
        off += 10;

        // delete: A, class ANY, empty rdata
        off += 1 + 3 + 1 + 4 + 1 + 5 + 1;
        assert_eq!(QueryType::A.to_num(), word(buf, off));
        assert_eq!(QueryClass::Any.to_num(), word(buf, off + 2));
        assert_eq!(0, word(buf, off + 8));
        off += 10;

        // add: A, class IN, ttl 0, the address
        off += 1 + 3 + 1 + 4 + 1 + 5 + 1;
        assert_eq!(QueryType::A.to_num(), word(buf, off));
        assert_eq!(QueryClass::In.to_num(), word(buf, off + 2));
        assert_eq!(4, word(buf, off + 8));
        assert_eq!(&[10, 0, 0, 9], &buf[off + 10..off + 14]);
        assert_eq!(buf.len(), off + 14);
    }

    #[test]
    fn test_signature_appended_with_message_id() {
        let message = UpdateMessage {
            zone: "corp.local".to_string(),
            host: "ws1.corp.local".to_string(),
            qtype: QueryType::A,
            addrs: Vec::new(),
        };

        let signature = TkeySignature {
            body: vec![0x55; 8],
            original_id: 0,
            error: 0,
            other_len: 0,
        };

        let buffer = message.write(0xABCD, Some(&signature)).unwrap();
        let buf = &buffer.buffer;

        // additional count reflects the signature
        assert_eq!(1, word(buf, 10));
        // trailing record: body, then id/error/other_len
        let tail = buf.len() - 14;
        assert_eq!(&[0x55; 8][..], &buf[tail..tail + 8]);
        assert_eq!(0xABCD, word(buf, buf.len() - 6));
        assert_eq!(0, word(buf, buf.len() - 4));
        assert_eq!(0, word(buf, buf.len() - 2));
    }
}
