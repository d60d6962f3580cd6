//! TKEY key exchange for secured dynamic updates
//!
//! When a server refuses an unsigned update, a short-lived TCP session
//! negotiates a shared key with it. The GSS logon itself is driven by the
//! `SecurityProvider` collaborator; this module supplies the wire transport:
//! each negotiation leg wraps the provider's token in a TKEY query, sends it
//! with a 2-byte length prefix, and hands back the token from the server's
//! TKEY answer. The raw bytes of the answer's trailing record are retained
//! and decomposed into the signature that authorizes the signed retry.
//!
//! The TCP stream and both key blobs live only as long as the session value;
//! dropping it releases everything, on success and failure alike.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use derive_more::{Display, Error, From};

use crate::resolver::buffer::{BytePacketBuffer, PacketBuffer};
use crate::resolver::context::ServerTable;
use crate::resolver::netutil::{read_packet_length, write_packet_length};
use crate::resolver::protocol::{
    DnsHeader, DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl,
};
use crate::resolver::security::{
    Credentials, SecurityError, SecurityProvider, SessionKeys, TkeyTransport,
};

/// Algorithm name carried in every TKEY record of the exchange.
pub const TKEY_ALGORITHM: &str = "gss-tsig";

/// TKEY mode field for GSS-API negotiation.
pub const TKEY_MODE_GSSAPI: u16 = 3;

/// Negotiated keys are requested for one day.
pub const TKEY_LIFETIME_SECS: u32 = 86_400;

static KEY_SERIAL: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Display, From, Error)]
pub enum TkeyError {
    Io(std::io::Error),
    Protocol(crate::resolver::protocol::ProtocolError),
    Security(SecurityError),
    /// The server's TKEY answer carried a nonzero error field or the wrong
    /// algorithm.
    Rejected,
    /// The answer carried no usable trailing signature record.
    MalformedSignature,
}

type Result<T> = std::result::Result<T, TkeyError>;

/// The server's signature over the exchange, decomposed from the raw bytes
/// of the trailing record of the final TKEY answer. The last three 16-bit
/// words of that record are the original transaction id, the error field and
/// the (empty) other-data length; everything before them is carried opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TkeySignature {
    pub body: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other_len: u16,
}

impl TkeySignature {
    /// Decompose a raw record. The record must be at least 6 bytes and its
    /// other-data length must be zero, otherwise the layout assumption does
    /// not hold and the signature is unusable.
    pub fn from_record_bytes(raw: &[u8]) -> Result<TkeySignature> {
        if raw.len() < 6 {
            return Err(TkeyError::MalformedSignature);
        }

        let tail = raw.len() - 6;
        let word = |off: usize| ((raw[off] as u16) << 8) | (raw[off + 1] as u16);

        let signature = TkeySignature {
            body: raw[..tail].to_vec(),
            original_id: word(tail),
            error: word(tail + 2),
            other_len: word(tail + 4),
        };

        if signature.other_len != 0 {
            return Err(TkeyError::MalformedSignature);
        }

        Ok(signature)
    }

    /// Append the signature as the trailing record of an update message,
    /// stamped with that message's transaction id.
    pub fn write<T: PacketBuffer>(&self, buffer: &mut T, original_id: u16) -> Result<usize> {
        let start = buffer.pos();

        for b in &self.body {
            buffer.write_u8(*b).map_err(to_protocol)?;
        }
        buffer.write_u16(original_id).map_err(to_protocol)?;
        buffer.write_u16(self.error).map_err(to_protocol)?;
        buffer.write_u16(self.other_len).map_err(to_protocol)?;

        Ok(buffer.pos() - start)
    }
}

fn to_protocol(e: crate::resolver::buffer::BufferError) -> TkeyError {
    TkeyError::Protocol(e.into())
}

/// One TKEY negotiation with one server. Implements `TkeyTransport` so a
/// `SecurityProvider` can drive as many legs as its mechanism needs.
pub struct TkeySession {
    table: Arc<ServerTable>,
    server: IpAddr,
    stream: TcpStream,
    key_name: String,
    signature: Option<TkeySignature>,
}

impl TkeySession {
    /// Connect to the server's DNS TCP port and synthesize a locally-unique
    /// key name for the exchange.
    pub fn connect(table: Arc<ServerTable>, server: IpAddr) -> Result<TkeySession> {
        let addr = SocketAddr::new(server, table.dns_port());
        let timeout = table.timeout();

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let serial = KEY_SERIAL.fetch_add(1, Ordering::SeqCst);
        let key_name = format!("k{}-{}", serial, Utc::now().timestamp());

        log::info!("TKEY session with {} as {}", server, key_name);

        Ok(TkeySession {
            table,
            server,
            stream,
            key_name,
            signature: None,
        })
    }

    /// Run the provider's logon over this session and hand back the captured
    /// signature together with the negotiated keys.
    pub fn negotiate(
        &mut self,
        provider: &dyn SecurityProvider,
        credentials: &Credentials,
    ) -> Result<(TkeySignature, SessionKeys)> {
        let keys = provider.establish(credentials, self)?;
        let signature = self.signature.take().ok_or(TkeyError::MalformedSignature)?;

        Ok((signature, keys))
    }

    fn round_trip(&mut self, token: &[u8]) -> Result<Vec<u8>> {
        let now = Utc::now().timestamp() as u32;
        let id = self.table.next_id();

        let mut packet = DnsPacket::new();
        packet.header = DnsHeader::new();
        packet.header.id = id;
        packet
            .questions
            .push(DnsQuestion::new(self.key_name.clone(), QueryType::Tkey));
        packet.resources.push(DnsRecord::Tkey {
            domain: self.key_name.clone(),
            algorithm: TKEY_ALGORITHM.to_string(),
            inception: now,
            expiration: now.wrapping_add(TKEY_LIFETIME_SECS),
            mode: TKEY_MODE_GSSAPI,
            error: 0,
            key: token.to_vec(),
            other: Vec::new(),
            ttl: TransientTtl(0),
        });

        let buffer = packet.to_buffer()?;
        write_packet_length(&mut self.stream, buffer.buffer.len())?;
        {
            use std::io::Write;
            self.stream.write_all(&buffer.buffer)?;
        }

        let len = read_packet_length(&mut self.stream)? as usize;
        let mut response = BytePacketBuffer::new();
        if len > response.buf.len() {
            return Err(TkeyError::MalformedSignature);
        }
        {
            use std::io::Read;
            self.stream.read_exact(&mut response.buf[..len])?;
        }

        self.parse_answer(&mut response, len)
    }

    /// Parse a TKEY answer while tracking the byte span of the trailing
    /// record. That span becomes the signature once the negotiation ends.
    fn parse_answer(&mut self, buffer: &mut BytePacketBuffer, len: usize) -> Result<Vec<u8>> {
        let mut header = DnsHeader::new();
        header.read(buffer)?;

        if header.rescode != ResultCode::NOERROR {
            log::warn!(
                "TKEY exchange with {} answered {:?}",
                self.server,
                header.rescode
            );
            return Err(TkeyError::Rejected);
        }

        for _ in 0..header.questions {
            buffer.skip_qname().map_err(to_protocol)?;
            buffer.step(4).map_err(to_protocol)?;
        }

        let record_count = header.answers as u32
            + header.authoritative_entries as u32
            + header.resource_entries as u32;

        let mut server_token: Option<Vec<u8>> = None;
        let mut last_span: Option<(usize, usize)> = None;

        for _ in 0..record_count {
            let start = buffer.pos();
            let record = DnsRecord::read(buffer)?;
            last_span = Some((start, buffer.pos()));

            if let DnsRecord::Tkey {
                algorithm,
                error,
                key,
                ..
            } = record
            {
                if algorithm != TKEY_ALGORITHM || error != 0 {
                    log::warn!(
                        "TKEY answer from {} rejected: algorithm {} error {}",
                        self.server,
                        algorithm,
                        error
                    );
                    return Err(TkeyError::Rejected);
                }
                server_token = Some(key);
            }
        }

        // everything from the last record's start to the end of the message
        // is the candidate signature
        if let Some((start, end)) = last_span {
            if end <= len {
                let raw = buffer.get_range(start, end - start).map_err(to_protocol)?;
                self.signature = Some(TkeySignature::from_record_bytes(raw)?);
            }
        }

        server_token.ok_or(TkeyError::Rejected)
    }
}

impl TkeyTransport for TkeySession {
    fn exchange(&mut self, token: &[u8]) -> std::result::Result<Vec<u8>, SecurityError> {
        self.round_trip(token).map_err(|e| {
            log::warn!("TKEY leg with {} failed: {}", self.server, e);
            SecurityError::ExchangeFailed
        })
    }
}
