//! natfwd - IPv4 NAT port forwarding
//!
//! Keeps a persistent list of port-forwarding rules and mirrors it into
//! nftables as DNAT plus MASQUERADE directives.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, durable store, nftables adapter and reconciliation
//! - [`audit`] - Audit log of every change to NAT state
//! - [`validators`] - Input validation for ports, addresses and identifiers
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Running `nft` with the privileges it needs
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Every rule is validated before anything is stored or applied
//! - Atomic rule file writes with 0600 permissions and SHA-256 sidecar
//! - All-or-nothing `add`, with rollback of half-applied rules
//! - Only the natfwd-owned nftables table is ever flushed

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::forward::{ForwardRule, Protocol};
pub use core::forwarder::PortForwarder;
pub use core::nft::{NftFilter, PacketFilter};
pub use core::reconcile::{ApplyReport, apply_all};
pub use core::store::RuleStore;
