//! Host tool shims.
//!
//! The pool drives three external binaries: the hypervisor, the disk-image
//! tool, and the packet-filter tool. This module carries their names (all
//! overridable, which is also how the tests substitute fakes) and assembles
//! the hypervisor command line.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use tokio::process::Command;

/// Hypervisor binary.
pub const HYPERVISOR_BIN: &str = "cloud-hypervisor";

/// Kernel command line passed to every VM.
const KERNEL_CMDLINE: &str = "console=hvc0 root=/dev/vda1 rw";

/// Netmask of the per-instance `/30`.
const TAP_NETMASK: &str = "255.255.255.252";

/// The external binaries the pool shells out to.
#[derive(Debug, Clone)]
pub struct HostTools {
    /// VM monitor, launched once per instance.
    pub hypervisor_bin: String,
    /// Disk-image tool (`convert`, `resize`, `create -b`).
    pub qemu_img_bin: String,
    /// Packet-filter tool (`-f <ruleset>`).
    pub nft_bin: String,
}

impl Default for HostTools {
    fn default() -> Self {
        Self {
            hypervisor_bin: HYPERVISOR_BIN.to_string(),
            qemu_img_bin: fleetingd_image::QEMU_IMG_BIN.to_string(),
            nft_bin: fleetingd_net::NFT_BIN.to_string(),
        }
    }
}

impl HostTools {
    /// Returns the required binaries missing from this host.
    #[must_use]
    pub fn missing(&self) -> Vec<String> {
        [&self.hypervisor_bin, &self.qemu_img_bin, &self.nft_bin]
            .into_iter()
            .filter(|bin| !binary_available(bin))
            .cloned()
            .collect()
    }
}

/// Returns true when the binary can be invoked.
#[must_use]
pub fn binary_available(bin: &str) -> bool {
    std::process::Command::new(bin)
        .arg("--version")
        .output()
        .is_ok()
}

/// Command-line assembly for one hypervisor child.
#[derive(Debug, Clone)]
pub struct HypervisorLaunch {
    /// Guest kernel image.
    pub kernel: PathBuf,
    /// Writable boot disk: the instance overlay for workers, the shared
    /// decompressed base for the prebuild VM.
    pub boot_disk: PathBuf,
    /// Read-only CIDATA seed volume.
    pub userdata_disk: PathBuf,
    /// Boot vCPUs.
    pub cpus: u64,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// TAP device name; the hypervisor creates and owns the device.
    pub tap_name: String,
    /// Guest MAC address.
    pub mac: String,
    /// Host-side TAP address.
    pub host_tap_ip: Ipv4Addr,
    /// Optional file-backed virtio console.
    pub console_file: Option<PathBuf>,
}

impl HypervisorLaunch {
    /// Builds the child process command.
    #[must_use]
    pub fn command(&self, bin: &str) -> Command {
        let mut cmd = Command::new(bin);
        cmd.arg("--kernel")
            .arg(&self.kernel)
            .arg("--disk")
            .arg(format!("path={}", self.boot_disk.display()))
            .arg(format!("path={},readonly=on", self.userdata_disk.display()))
            .arg("--cpus")
            .arg(format!("boot={}", self.cpus))
            .arg("--memory")
            .arg(format!("size={}M", self.memory_mb))
            .arg("--net")
            .arg(format!(
                "tap={},mac={},ip={},mask={}",
                self.tap_name, self.mac, self.host_tap_ip, TAP_NETMASK
            ))
            .arg("--balloon")
            .arg("size=0,free_page_reporting=on")
            .arg("--cmdline")
            .arg(KERNEL_CMDLINE);

        if let Some(console) = &self.console_file {
            cmd.arg("--console").arg(format!("file={}", console.display()));
        }

        cmd
    }
}
