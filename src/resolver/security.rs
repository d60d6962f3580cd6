//! collaborator seams for the secured update path
//!
//! The GSS/Kerberos machinery itself lives outside this crate. The resolver
//! only needs three things from its host: machine credentials, a security
//! provider that can turn those credentials plus a wire exchange into a
//! negotiated key, and a way to enumerate this host's own addresses for
//! dynamic registration.

use std::net::{IpAddr, UdpSocket};

use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum SecurityError {
    NoCredentials,
    Rejected,
    ExchangeFailed,
}

/// Opaque account material handed to the security provider.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub domain: String,
    pub secret: Vec<u8>,
}

/// Key material produced by a successful logon. Both blobs are dropped when
/// the owning TKEY session ends, on every exit path.
pub struct SessionKeys {
    pub session_key: Vec<u8>,
    pub mac_key: Vec<u8>,
}

/// Looks up the credentials used to authorize dynamic updates.
pub trait CredentialSource: Send + Sync {
    fn machine_credentials(&self) -> Option<Credentials>;
}

/// One round of the TKEY wire exchange, driven by the security provider:
/// the provider hands over its next output token and receives the server's
/// token from the parsed TKEY answer.
pub trait TkeyTransport {
    fn exchange(&mut self, token: &[u8]) -> Result<Vec<u8>, SecurityError>;
}

/// GSS/SPNEGO-backed logon primitive. Implementations call
/// `transport.exchange` once per negotiation leg until the context is
/// established, then return the negotiated keys.
pub trait SecurityProvider: Send + Sync {
    fn establish(
        &self,
        credentials: &Credentials,
        transport: &mut dyn TkeyTransport,
    ) -> Result<SessionKeys, SecurityError>;
}

/// Enumerates the addresses this host should publish.
pub trait AddressEnumerator {
    fn self_addresses(&self) -> Vec<IpAddr>;
}

/// Credential source for hosts with no machine account; the secure update
/// escalation fails cleanly and the plain result stands.
pub struct AnonymousCredentials;

impl CredentialSource for AnonymousCredentials {
    fn machine_credentials(&self) -> Option<Credentials> {
        None
    }
}

/// Provider used when no GSS stack is wired in.
pub struct DisabledSecurityProvider;

impl SecurityProvider for DisabledSecurityProvider {
    fn establish(
        &self,
        _credentials: &Credentials,
        _transport: &mut dyn TkeyTransport,
    ) -> Result<SessionKeys, SecurityError> {
        Err(SecurityError::NoCredentials)
    }
}

/// Default enumerator: learn the default-route source address by connecting
/// a throwaway UDP socket per family. No packets are sent by `connect`.
pub struct SystemAddresses;

impl AddressEnumerator for SystemAddresses {
    fn self_addresses(&self) -> Vec<IpAddr> {
        let mut addrs = Vec::new();

        if let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)) {
            if socket.connect(("192.0.2.1", 53)).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    addrs.push(local.ip());
                }
            }
        }

        if let Ok(socket) = UdpSocket::bind(("::", 0)) {
            if socket.connect(("2001:db8::1", 53)).is_ok() {
                if let Ok(local) = socket.local_addr() {
                    if !local.ip().is_loopback() {
                        addrs.push(local.ip());
                    }
                }
            }
        }

        if addrs.is_empty() {
            log::warn!("could not determine any local address to publish");
        }

        addrs
    }
}
