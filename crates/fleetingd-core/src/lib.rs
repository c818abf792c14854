//! # fleetingd-core
//!
//! The disposable-VM pool: IPAM for one `/30` per instance, the one-shot
//! prebuild barrier that produces the gold base image, per-instance
//! supervisors that launch hypervisor children and install host networking,
//! reapers that clean up when children exit, and the provider façade an
//! autoscaling runner drives.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Provider                         │
//! │   init · update · increase · decrease · shutdown      │
//! └──────────────────────────┬───────────────────────────┘
//!                            ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                      Inventory                        │
//! │   RwLock<{instances, slots, shutting_down}>           │
//! │   prebuild barrier · boot · destroy · queries         │
//! └───────┬──────────────────┬───────────────┬───────────┘
//!         ▼                  ▼               ▼
//!   fleetingd-image    supervisor/reaper   fleetingd-net
//!   (base + overlays)  (hypervisor child)  (nftables, TAP)
//! ```
//!
//! All pool state lives in memory; the pool starts empty and owns nothing
//! across restarts.

pub mod config;
pub mod error;
pub mod instance;
pub mod inventory;
pub mod ipam;
mod prebuild;
pub mod provider;
mod supervisor;
pub mod tools;

pub use config::PoolConfig;
pub use error::{CoreError, Result};
pub use instance::Instance;
pub use inventory::Inventory;
pub use ipam::{instance_name, SlotSet, INSTANCE_PREFIX, MAX_SLOTS, SLOT_STRIDE};
pub use provider::{ConnectInfo, InstanceState, Provider, ProviderInfo, PROVIDER_ID};
pub use tools::{binary_available, HostTools, HypervisorLaunch, HYPERVISOR_BIN};

pub use fleetingd_net::PollBudget;
