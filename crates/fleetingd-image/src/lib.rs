//! # fleetingd-image
//!
//! Disk material for the VM pool: the shared base kernel and boot disk
//! (downloaded, checksum-gated, decompressed, and resized), per-instance
//! copy-on-write overlays, and the FAT `CIDATA` seed images cloud-init
//! consumes on first boot.

pub mod error;
pub mod store;
pub mod userdata;

pub use error::{ImageError, Result};
pub use store::{ImageStore, INSTANCE_DATA_DIR, QEMU_IMG_BIN};
pub use userdata::{UserDataMode, UserDataParts, UserDataSpec};
