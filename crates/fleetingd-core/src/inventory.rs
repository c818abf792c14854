//! Shared pool state and the controller that serializes its mutations.
//!
//! One readers–writer lock protects the instance map, the slot set, and the
//! shutdown flag. Every mutation takes the exclusive lock; queries take the
//! shared lock. The lock is never held across process spawning, TAP polling,
//! packet-filter invocation, file I/O, or any other blocking wait — those
//! all happen between critical sections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use fleetingd_image::ImageStore;
use fleetingd_net::{self as net, PollBudget};

use crate::config::PoolConfig;
use crate::error::{CoreError, Result};
use crate::instance::Instance;
use crate::ipam::SlotSet;
use crate::prebuild::PrebuildBarrier;
use crate::provider::{ConnectInfo, CONNECT_KEEPALIVE, CONNECT_TIMEOUT, SSH_PORT, SSH_USERNAME};
use crate::supervisor::BootMode;
use crate::tools::HostTools;

/// Everything the inventory lock protects.
///
/// Outside mid-mutation windows, `instances.len() == slots.len()`: every
/// live instance holds exactly one slot.
pub(crate) struct PoolState {
    pub instances: HashMap<String, Instance>,
    pub slots: SlotSet,
    /// Once set, no new instance is ever inserted.
    pub shutting_down: bool,
}

/// The pool controller.
pub struct Inventory {
    pub(crate) config: PoolConfig,
    pub(crate) tools: HostTools,
    pub(crate) images: ImageStore,
    pub(crate) state: RwLock<PoolState>,
    pub(crate) prebuild: PrebuildBarrier,
    pub(crate) tap_wait: PollBudget,
    pub(crate) destroy_wait: PollBudget,
}

impl Inventory {
    /// Creates an empty inventory.
    ///
    /// # Errors
    ///
    /// Returns an error if the image store cannot be constructed.
    pub fn new(config: PoolConfig, tools: HostTools) -> Result<Self> {
        let images = ImageStore::new(config.vm_disk_directory.clone(), config.vm_disk_size_gb)?
            .with_qemu_img(tools.qemu_img_bin.clone());

        Ok(Self {
            config,
            tools,
            images,
            state: RwLock::new(PoolState {
                instances: HashMap::new(),
                slots: SlotSet::new(),
                shutting_down: false,
            }),
            prebuild: PrebuildBarrier::new(),
            tap_wait: PollBudget::default(),
            destroy_wait: PollBudget::default(),
        })
    }

    /// Overrides the TAP-appearance wait budget.
    #[must_use]
    pub fn with_tap_wait(mut self, budget: PollBudget) -> Self {
        self.tap_wait = budget;
        self
    }

    /// Overrides the destroy wait budget.
    #[must_use]
    pub fn with_destroy_wait(mut self, budget: PollBudget) -> Self {
        self.destroy_wait = budget;
        self
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The host tool set.
    #[must_use]
    pub fn tools(&self) -> &HostTools {
        &self.tools
    }

    /// Boots one worker VM.
    ///
    /// The first boot runs the prebuild barrier: workdir preparation, image
    /// refresh, and the prebuild VM to completion. Concurrent callers wait
    /// for that to finish before allocating.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AddressSpaceExhausted`] when the pool is full or
    /// shutting down, and boot/image errors otherwise.
    pub async fn boot_worker(self: &Arc<Self>) -> Result<()> {
        self.prebuild.ensure(|| self.run_prebuild()).await?;
        self.boot_instance(BootMode::Worker).await
    }

    async fn run_prebuild(self: &Arc<Self>) -> Result<()> {
        tracing::info!("first VM requested, preparing environment");
        self.images.prepare_workdir()?;
        self.images.ensure_images().await?;

        tracing::info!("running prebuild VM");
        self.boot_instance(BootMode::Prebuild).await?;
        tracing::info!("prebuild finished");
        Ok(())
    }

    /// Marks the gold image as already prepared, e.g. when the work
    /// directory was provisioned out of band. The next boot goes straight to
    /// a worker VM.
    pub async fn mark_prebuild_done(&self) {
        self.prebuild.mark_done().await;
    }

    /// Stops the named instance and waits for its reaper to remove it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for unknown names and
    /// [`CoreError::DestroyTimeout`] when the child refuses to die within
    /// the budget — the instance then stays registered.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        {
            let state = self.state.read().await;
            let instance = state
                .instances
                .get(name)
                .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
            instance.cancel.cancel();
        }

        for _ in 0..self.destroy_wait.attempts {
            if !self.state.read().await.instances.contains_key(name) {
                return Ok(());
            }
            tokio::time::sleep(self.destroy_wait.interval).await;
        }

        if self.state.read().await.instances.contains_key(name) {
            Err(CoreError::DestroyTimeout(name.to_string()))
        } else {
            Ok(())
        }
    }

    /// Stops every instance and refuses all future boots.
    ///
    /// # Errors
    ///
    /// Returns the first destroy failure.
    pub async fn destroy_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let mut state = self.state.write().await;
            state.shutting_down = true;
            let mut names: Vec<String> = state.instances.keys().cloned().collect();
            names.sort();
            names
        };

        for name in &names {
            self.destroy(name).await?;
        }
        Ok(())
    }

    /// Names of all live instances, sorted.
    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.instances.keys().cloned().collect();
        names.sort();
        names
    }

    /// Connection material for the named instance.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for unknown names and
    /// [`CoreError::NoIdentity`] for the prebuild instance.
    pub async fn connect_info(&self, name: &str) -> Result<ConnectInfo> {
        let state = self.state.read().await;
        let instance = state
            .instances
            .get(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        let private_key_pem = instance
            .private_key_pem()?
            .ok_or_else(|| CoreError::NoIdentity(name.to_string()))?;

        Ok(ConnectInfo {
            name: instance.name.clone(),
            internal_addr: instance.guest_tap_ip,
            username: SSH_USERNAME,
            port: SSH_PORT,
            os: "linux",
            arch: std::env::consts::ARCH,
            private_key_pem,
            keepalive: CONNECT_KEEPALIVE,
            timeout: CONNECT_TIMEOUT,
        })
    }

    /// Re-renders and applies the packet filter from a snapshot of the
    /// current instance set.
    ///
    /// # Errors
    ///
    /// Returns an error if the ruleset cannot be written or the tool rejects
    /// it.
    pub async fn apply_packet_filter(&self) -> Result<()> {
        let snapshot: Vec<net::FilterInstance> = {
            let state = self.state.read().await;
            state
                .instances
                .values()
                .map(Instance::filter_instance)
                .collect()
        };

        net::apply(
            &self.tools.nft_bin,
            &self.config.ruleset_path(),
            &self.config.egress_interface,
            &self.config.vm_subnet,
            &snapshot,
        )
        .await?;
        Ok(())
    }
}
