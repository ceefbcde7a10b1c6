//! Core port-forwarding logic
//!
//! - [`forward`]: the forwarding rule record and its text form
//! - [`store`]: ordered, durable rule storage
//! - [`nft`]: the packet-filter seam and its nftables implementation
//! - [`reconcile`]: flush-and-rebuild of live state from the store
//! - [`forwarder`]: caller-facing operations tying store and filter together
//! - [`error`]: error types and nftables error translation

pub mod error;
pub mod forward;
pub mod forwarder;
pub mod nft;
pub mod reconcile;
pub mod store;

#[cfg(test)]
pub mod test_helpers;
