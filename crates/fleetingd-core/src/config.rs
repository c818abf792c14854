//! Pool configuration.
//!
//! Configuration is read once at startup and never mutated. Sources, in
//! order of precedence: `FLEETINGD_`-prefixed environment variables, then a
//! TOML file.
//!
//! ```toml
//! egress_interface = "eth0"
//! vm_disk_directory = "/var/lib/fleetingd"
//! vm_subnet = "172.16.120."
//! vm_num_cpu_cores = 2
//! vm_memory_mb = 2048
//! vm_disk_size_gb = 20
//! vm_prebuild_cloudinit_extra_cmds = ["apt-get install -y build-essential"]
//! vm_enable_virtio_console = false
//! ```

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// File the rendered packet-filter ruleset is written to.
const RULESET_FILE: &str = "ruleset.nft";

/// Immutable pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Interface VM traffic is NAT'd through.
    pub egress_interface: String,
    /// Writable directory for images, overlays, and the ruleset.
    pub vm_disk_directory: PathBuf,
    /// `/24` base the VM `/30`s are carved from, as a prefix ending in a
    /// dot, e.g. `"172.16.120."`.
    pub vm_subnet: String,
    /// vCPUs per VM.
    pub vm_num_cpu_cores: u64,
    /// Memory per VM in MiB.
    pub vm_memory_mb: u64,
    /// Boot disk size per VM in GiB.
    pub vm_disk_size_gb: u64,
    /// Shell snippets run by the prebuild VM, in order, verbatim.
    #[serde(default)]
    pub vm_prebuild_cloudinit_extra_cmds: Vec<String>,
    /// Capture each VM's virtio console to a file under the work directory.
    #[serde(default)]
    pub vm_enable_virtio_console: bool,
}

impl PoolConfig {
    /// Loads configuration from a TOML file, with `FLEETINGD_`-prefixed
    /// environment variables taking precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a key is missing or
    /// malformed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLEETINGD_"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Checks the invariants the rest of the pool relies on.
    ///
    /// The subnet is not checked against host routes; a warning reminds the
    /// operator to pick a non-overlapping prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if any key is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.egress_interface.is_empty() {
            return Err(CoreError::Config("egress_interface must be set".into()));
        }

        if !self.vm_subnet.ends_with('.') {
            return Err(CoreError::Config(format!(
                "vm_subnet must be a /24 prefix ending in a dot, e.g. \"172.16.120.\", got {:?}",
                self.vm_subnet
            )));
        }
        let base: Ipv4Network = format!("{}0/24", self.vm_subnet)
            .parse()
            .map_err(|e| CoreError::Config(format!("vm_subnet {:?}: {e}", self.vm_subnet)))?;
        if base.ip() != base.network() {
            return Err(CoreError::Config(format!(
                "vm_subnet {:?} is not a /24 base",
                self.vm_subnet
            )));
        }

        for (key, value) in [
            ("vm_num_cpu_cores", self.vm_num_cpu_cores),
            ("vm_memory_mb", self.vm_memory_mb),
            ("vm_disk_size_gb", self.vm_disk_size_gb),
        ] {
            if value == 0 {
                return Err(CoreError::Config(format!("{key} must be at least 1")));
            }
        }

        tracing::warn!(
            subnet = %self.vm_subnet,
            "vm_subnet is not checked against host networks; make sure it does not overlap"
        );
        Ok(())
    }

    /// Returns `<prefix><last_octet>` as an address.
    ///
    /// # Errors
    ///
    /// Returns an error if the subnet prefix does not compose into a valid
    /// address (prevented by [`PoolConfig::validate`]).
    pub fn address(&self, last_octet: u8) -> Result<Ipv4Addr> {
        format!("{}{}", self.vm_subnet, last_octet)
            .parse()
            .map_err(|e| {
                CoreError::Config(format!("vm_subnet {:?} + {last_octet}: {e}", self.vm_subnet))
            })
    }

    /// Path of the rendered packet-filter ruleset.
    #[must_use]
    pub fn ruleset_path(&self) -> PathBuf {
        self.vm_disk_directory.join(RULESET_FILE)
    }
}
