//! blocking socket helpers shared by the lookup and update paths
//!
//! Every UDP exchange runs on a short-lived, per-call socket with a bounded
//! read timeout; there is no cancellation beyond timeout expiry. TCP framing
//! uses the standard 2-byte length prefix.

use std::io::{Read, Result, Write};
use std::net::{IpAddr, TcpStream, UdpSocket};
use std::time::Duration;

/// Standard DNS port for unicast queries and the TKEY exchange.
pub const DNS_PORT: u16 = 53;

/// LLMNR port for multicast fallback queries.
pub const LLMNR_PORT: u16 = 5355;

pub fn read_packet_length(stream: &mut TcpStream) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer)?;

    Ok(((len_buffer[0] as u16) << 8) | (len_buffer[1] as u16))
}

pub fn write_packet_length(stream: &mut TcpStream, len: usize) -> Result<()> {
    let mut len_buffer = [0; 2];
    len_buffer[0] = (len >> 8) as u8;
    len_buffer[1] = (len & 0xFF) as u8;

    stream.write_all(&len_buffer)?;

    Ok(())
}

/// Bind an ephemeral UDP socket of the same address family as `dest` with a
/// bounded read timeout. The socket lives for one exchange and is closed
/// when it goes out of scope.
pub fn bind_udp(dest: IpAddr, timeout: Duration) -> Result<UdpSocket> {
    let socket = match dest {
        IpAddr::V4(_) => UdpSocket::bind(("0.0.0.0", 0))?,
        IpAddr::V6(_) => UdpSocket::bind(("::", 0))?,
    };
    socket.set_read_timeout(Some(timeout))?;
    Ok(socket)
}

/// Send one datagram toward a resolver. Multicast v4 destinations go out
/// with a TTL of 1 so LLMNR stays on the local link; v6 multicast is a
/// normal send to the group address.
pub fn send_datagram(
    socket: &UdpSocket,
    buf: &[u8],
    dest: IpAddr,
    port: u16,
    multicast: bool,
) -> Result<usize> {
    if multicast {
        if let IpAddr::V4(_) = dest {
            socket.set_multicast_ttl_v4(1)?;
        }
    }
    socket.send_to(buf, (dest, port))
}

/// True when a receive failed only because the bounded wait expired.
pub fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
