//! Polaris Name Resolution
//!
//! A pluggable name-resolution library with a DNS backend.
//!
//! # Features
//!
//! * Forward and reverse lookups over unicast DNS
//! * Multicast LLMNR fallback for single-label names
//! * SRV-based domain controller discovery
//! * Dynamic registration of this host's A/AAAA records, escalating to a
//!   TKEY (GSS-TSIG) secured update when the server refuses the plain one
//!
//! # Architecture
//!
//! Resolution methods register with a method registry keyed by
//! (kind, multicast, server) and are driven in priority order by an
//! arbitration loop; unicast DNS answers are preferred over multicast LLMNR
//! ones. All state lives in an explicit [`resolver::context::ResolverContext`];
//! there are no process-global singletons.

/// Name-resolution engine and its DNS backend
pub mod resolver;
