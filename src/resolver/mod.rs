//! Pluggable Name Resolution
//!
//! This module implements a pluggable name-resolution engine whose primary
//! backend is DNS:
//! * Forward and reverse lookups over unicast DNS
//! * Multicast LLMNR fallback for unqualified names
//! * SRV-based domain controller discovery
//! * Dynamic registration of this host's A/AAAA records, with a
//!   TKEY-secured retry when a server refuses the unsigned update
//!
//! # Module Structure
//!
//! * `buffer` - Low-level packet buffer operations
//! * `protocol` - DNS protocol definitions and packet structures
//! * `netutil` - Blocking socket helpers
//! * `engine` - Method registry and arbitration contract
//! * `method` - The DNS/LLMNR resolution method
//! * `locator` - Domain controller discovery
//! * `security` - Collaborator traits for credentials and GSS logon
//! * `tkey` - TKEY key exchange for secured updates
//! * `update` - Dynamic update publisher
//! * `context` - Configuration and the public resolver surface

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// Configuration and the public resolver surface
pub mod context;

/// Method registry and the arbitration contract
pub mod engine;

/// SRV-based domain controller discovery
pub mod locator;

/// The DNS and LLMNR lookup method
pub mod method;

/// Blocking socket helpers
pub mod netutil;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// Collaborator traits for credentials, GSS logon and address enumeration
pub mod security;

/// TKEY key exchange for secured dynamic updates
pub mod tkey;

/// Dynamic registration of this host's address records
pub mod update;
