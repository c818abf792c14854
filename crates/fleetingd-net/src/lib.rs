//! # fleetingd-net
//!
//! Host-side networking for the VM pool: renders the nftables ruleset that
//! isolates and NATs every TAP device, and observes TAP registration.
//!
//! The ruleset is regenerated in full on every pool membership change so the
//! packet filter is always a pure function of the inventory; there are no
//! incremental updates to drift.

pub mod error;
pub mod iface;
pub mod ruleset;

pub use error::{NetError, Result};
pub use iface::{interface_exists, wait_for_interface, PollBudget};
pub use ruleset::{apply, nft_available, render, FilterInstance, NFT_BIN};
