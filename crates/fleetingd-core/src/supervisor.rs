//! Per-instance boot sequence and reaper.
//!
//! Boot is linear: reserve a slot and register the instance under the
//! exclusive lock, materialize its disk files, spawn the hypervisor child,
//! wait (bounded) for the TAP device to register, re-apply the packet
//! filter. None of the blocking steps hold the lock.
//!
//! The reaper owns the child handle for the rest of the instance's life: it
//! waits for exit — killing the child when the instance's token is
//! cancelled — deletes the instance's files, releases the slot and map entry
//! under the lock, re-applies the packet filter, and signals the waiting
//! booter when the instance was the prebuild VM.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use fleetingd_image::{userdata, UserDataMode, UserDataSpec};
use fleetingd_net::wait_for_interface;

use crate::error::{CoreError, Result};
use crate::instance::{generate_mac, generate_ssh_key, Instance};
use crate::inventory::Inventory;
use crate::ipam::instance_name;
use crate::tools::HypervisorLaunch;

/// CIDR suffix of the per-instance subnet.
const TAP_CIDR_SUFFIX: &str = "/30";

/// Which flavour of VM to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootMode {
    /// SSH-reachable pool member with its own overlay disk.
    Worker,
    /// Base-image customization run, booting the shared base directly.
    Prebuild,
}

/// Slot reservation carried out of the allocation critical section.
struct Reservation {
    name: String,
    slot: u8,
    host_tap_ip: std::net::Ipv4Addr,
    guest_tap_ip: std::net::Ipv4Addr,
    mac: String,
    authorized_key: Option<String>,
    cancel: CancellationToken,
}

impl Inventory {
    /// Boots one VM in the given mode. In prebuild mode this returns only
    /// after the VM has exited and its reaper has cleaned up.
    pub(crate) async fn boot_instance(self: &Arc<Self>, mode: BootMode) -> Result<()> {
        let reservation = self.reserve_slot(mode).await?;

        // Disk material is built outside the lock; failures roll the slot
        // back.
        let launch = match self.materialize(&reservation, mode).await {
            Ok(launch) => launch,
            Err(e) => {
                self.rollback(&reservation, mode).await;
                return Err(e);
            }
        };

        tracing::info!(instance = %reservation.name, "starting instance VM");
        let child = match launch.command(&self.tools.hypervisor_bin).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.rollback(&reservation, mode).await;
                return Err(CoreError::Boot(format!(
                    "failed to start {}: {e}",
                    self.tools.hypervisor_bin
                )));
            }
        };

        // The reaper owns the child from here on.
        let (done_tx, done_rx) = oneshot::channel();
        let reaper = Reaper {
            inventory: Arc::clone(self),
            name: reservation.name.clone(),
            slot: reservation.slot,
            userdata: launch.userdata_disk.clone(),
            overlay: match mode {
                BootMode::Worker => Some(launch.boot_disk.clone()),
                BootMode::Prebuild => None,
            },
            done: match mode {
                BootMode::Prebuild => Some(done_tx),
                BootMode::Worker => None,
            },
        };
        tokio::spawn(reaper.run(child, reservation.cancel.clone()));

        // Give the TAP a chance to register, then refresh the filter either
        // way. A filter failure is surfaced but does not undo the boot: the
        // reaper still cleans up when the child exits.
        wait_for_interface(&reservation.name, self.tap_wait).await;
        self.apply_packet_filter().await?;

        if mode == BootMode::Prebuild {
            tracing::info!("waiting for prebuild VM to finish");
            done_rx.await.map_err(|_| {
                CoreError::Boot("prebuild reaper exited without signalling".into())
            })?;
        }

        Ok(())
    }

    /// Allocates a slot and registers the instance, all under the exclusive
    /// lock.
    async fn reserve_slot(&self, mode: BootMode) -> Result<Reservation> {
        let mut state = self.state.write().await;

        if state.shutting_down {
            return Err(CoreError::AddressSpaceExhausted);
        }
        let slot = state.slots.allocate()?;

        match self.derive_identity(slot, mode) {
            Ok((instance, authorized_key)) => {
                let reservation = Reservation {
                    name: instance.name.clone(),
                    slot,
                    host_tap_ip: instance.host_tap_ip,
                    guest_tap_ip: instance.guest_tap_ip,
                    mac: instance.mac.clone(),
                    authorized_key,
                    cancel: instance.cancel.clone(),
                };
                state.instances.insert(instance.name.clone(), instance);
                Ok(reservation)
            }
            Err(e) => {
                state.slots.release(slot);
                Err(e)
            }
        }
    }

    /// Derives name, addressing, MAC, and (worker) SSH identity for a slot.
    fn derive_identity(&self, slot: u8, mode: BootMode) -> Result<(Instance, Option<String>)> {
        let name = instance_name(slot);
        let host_tap_ip = self.config.address(slot + 1)?;
        let guest_tap_ip = self.config.address(slot + 2)?;
        let mac = generate_mac();

        let (ssh_key, authorized_key) = match mode {
            BootMode::Worker => {
                let key = generate_ssh_key()?;
                let authorized = key.public_key().to_openssh()?;
                (Some(key), Some(authorized))
            }
            BootMode::Prebuild => (None, None),
        };

        let instance = Instance {
            name,
            slot,
            host_tap_ip,
            guest_tap_ip,
            mac,
            ssh_key,
            cancel: CancellationToken::new(),
        };
        Ok((instance, authorized_key))
    }

    /// Builds the user-data image and boot disk for a reservation.
    async fn materialize(&self, res: &Reservation, mode: BootMode) -> Result<HypervisorLaunch> {
        let userdata_disk = self.images.userdata_path(&res.name);

        let ud_mode = match mode {
            BootMode::Worker => {
                let key = res.authorized_key.as_deref().ok_or_else(|| {
                    CoreError::Boot("worker reservation without SSH key".into())
                })?;
                UserDataMode::Worker {
                    ssh_authorized_key: key,
                }
            }
            BootMode::Prebuild => UserDataMode::Prebuild {
                extra_commands: &self.config.vm_prebuild_cloudinit_extra_cmds,
            },
        };

        userdata::write(
            &UserDataSpec {
                instance_name: &res.name,
                mac_address: &res.mac,
                guest_ip: res.guest_tap_ip,
                gateway: res.host_tap_ip,
                netmask: TAP_CIDR_SUFFIX,
                mode: ud_mode,
            },
            &userdata_disk,
        )
        .map_err(|e| CoreError::Boot(format!("user-data creation failed: {e}")))?;

        let boot_disk = match mode {
            BootMode::Worker => self
                .images
                .create_overlay(&res.name)
                .await
                .map_err(|e| CoreError::Boot(format!("overlay creation failed: {e}")))?,
            BootMode::Prebuild => self
                .images
                .decompressed_image_path()
                .map_err(|e| CoreError::Boot(e.to_string()))?,
        };

        Ok(HypervisorLaunch {
            kernel: self
                .images
                .kernel_path()
                .map_err(|e| CoreError::Boot(e.to_string()))?,
            boot_disk,
            userdata_disk,
            cpus: self.config.vm_num_cpu_cores,
            memory_mb: self.config.vm_memory_mb,
            tap_name: res.name.clone(),
            mac: res.mac.clone(),
            host_tap_ip: res.host_tap_ip,
            console_file: self
                .config
                .vm_enable_virtio_console
                .then(|| self.images.console_path(&res.name)),
        })
    }

    /// Releases everything a failed boot had claimed.
    async fn rollback(&self, res: &Reservation, mode: BootMode) {
        let _ = std::fs::remove_file(self.images.userdata_path(&res.name));
        if mode == BootMode::Worker {
            let _ = std::fs::remove_file(self.images.overlay_path(&res.name));
        }

        let mut state = self.state.write().await;
        state.slots.release(res.slot);
        state.instances.remove(&res.name);
    }
}

/// Long-lived task owning one hypervisor child and its teardown.
struct Reaper {
    inventory: Arc<Inventory>,
    name: String,
    slot: u8,
    userdata: PathBuf,
    overlay: Option<PathBuf>,
    done: Option<oneshot::Sender<()>>,
}

impl Reaper {
    async fn run(mut self, mut child: Child, cancel: CancellationToken) {
        let status = match cancel.run_until_cancelled(child.wait()).await {
            Some(status) => status,
            None => {
                tracing::debug!(instance = %self.name, "stop requested, killing VM process");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(instance = %self.name, error = %e, "failed to signal VM process");
                }
                child.wait().await
            }
        };

        match status {
            Ok(status) => {
                tracing::info!(instance = %self.name, %status, "instance process finished, cleaning up");
            }
            Err(e) => {
                tracing::warn!(instance = %self.name, error = %e, "failed waiting for VM process");
            }
        }

        if let Some(overlay) = &self.overlay {
            if let Err(e) = std::fs::remove_file(overlay) {
                tracing::warn!(instance = %self.name, error = %e, "error deleting overlay after instance stopped");
            }
        }
        if let Err(e) = std::fs::remove_file(&self.userdata) {
            tracing::warn!(instance = %self.name, error = %e, "error deleting user-data after instance stopped");
        }

        {
            let mut state = self.inventory.state.write().await;
            state.slots.release(self.slot);
            state.instances.remove(&self.name);
        }

        if let Err(e) = self.inventory.apply_packet_filter().await {
            tracing::warn!(instance = %self.name, error = %e, "packet-filter refresh after instance exit failed");
        }

        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
