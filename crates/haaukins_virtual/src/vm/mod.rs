// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

mod vbox;

pub use vbox::VBoxManage;

use crate::{Closer, InstanceInfo, InstanceKind, InstanceState, VirtualError};
use async_trait::async_trait;
use color_eyre::eyre;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub const ORIGIN_SNAPSHOT: &str = "origin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmOption {
    Cpu(u32),
    Ram(u32),
    /// Bridge the first NIC onto the given host interface
    Bridge(String),
    /// Serve the VM display over RDP on the given host address
    LocalRdp { ip: String, port: u16 },
}

/// The narrow interface the platform needs from a hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool, VirtualError>;
    async fn import(&self, path: &Path, name: &str) -> Result<(), VirtualError>;
    async fn snapshot(&self, vm: &str, snapshot: &str) -> Result<(), VirtualError>;
    async fn has_snapshot(&self, vm: &str, snapshot: &str) -> Result<bool, VirtualError>;
    async fn linked_clone(
        &self,
        base: &str,
        snapshot: &str,
        name: &str,
    ) -> Result<(), VirtualError>;
    async fn configure(&self, vm: &str, option: &VmOption) -> Result<(), VirtualError>;
    async fn start(&self, vm: &str) -> Result<(), VirtualError>;
    async fn power_off(&self, vm: &str) -> Result<(), VirtualError>;
    async fn save_state(&self, vm: &str) -> Result<(), VirtualError>;
    /// Unregisters the VM and deletes its disks.
    async fn remove(&self, vm: &str) -> Result<(), VirtualError>;
    async fn state(&self, vm: &str) -> Result<InstanceState, VirtualError>;
}

/// Issues linked clones of base VMs imported from the OVA files of a directory.
pub struct VmLibrary {
    hypervisor: Arc<dyn Hypervisor>,
    dir: PathBuf,
    /// Per-OVA lock guarding the name of its base VM once it has an origin snapshot
    bases: DashMap<PathBuf, Arc<Mutex<Option<String>>>>,
}

impl VmLibrary {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, dir: impl Into<PathBuf>) -> Self {
        VmLibrary {
            hypervisor,
            dir: dir.into(),
            bases: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves an image name such as `kali` to `<dir>/kali.ova`.
    pub fn path_of(&self, image: &str) -> PathBuf {
        let mut path = PathBuf::from(image);
        if !path.starts_with(&self.dir) {
            path = self.dir.join(path);
        }
        if path.extension().is_none_or(|ext| ext != "ova") {
            let mut name = path.into_os_string();
            name.push(".ova");
            path = PathBuf::from(name);
        }
        path
    }

    pub async fn is_available(&self, image: &str) -> bool {
        tokio::fs::metadata(self.path_of(image)).await.is_ok()
    }

    /// Returns a fresh linked clone of the base VM for `image`, importing the OVA first if needed.
    #[instrument(skip_all, fields(image = image))]
    pub async fn get_copy(&self, image: &str, options: &[VmOption]) -> Result<Vm, VirtualError> {
        let path = self.path_of(image);
        let lock = self
            .bases
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let base = {
            let mut known = lock.lock().await;
            match known.as_ref() {
                Some(base) => base.clone(),
                None => {
                    let base = self.prepare_base(&path).await?;
                    *known = Some(base.clone());
                    base
                }
            }
        };

        let name = uuid::Uuid::new_v4().simple().to_string();
        self.hypervisor
            .linked_clone(&base, ORIGIN_SNAPSHOT, &name)
            .await?;
        let vm = Vm {
            hypervisor: self.hypervisor.clone(),
            image: image.to_string(),
            id: name,
            closed: AtomicBool::new(false),
        };
        for option in options {
            if let Err(error) = self.hypervisor.configure(&vm.id, option).await {
                if let Err(error) = vm.close().await {
                    warn!(?error, id = %vm.id, "unable to remove unconfigured clone");
                }
                return Err(error);
            }
        }
        debug! {
            id = %vm.id,
            %base,
            "issued linked clone"
        }
        Ok(vm)
    }

    async fn prepare_base(&self, path: &Path) -> Result<String, VirtualError> {
        let checksum = checksum_of_file(path).await?;
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let base = format!("{stem}{{{checksum}}}");

        if self.hypervisor.exists(&base).await? {
            debug!(%base, "adopting existing base vm");
        } else {
            info!(%base, path = %path.display(), "importing ova");
            self.hypervisor.import(path, &base).await?;
        }

        if !self.hypervisor.has_snapshot(&base, ORIGIN_SNAPSHOT).await? {
            self.hypervisor.snapshot(&base, ORIGIN_SNAPSHOT).await?;
        }
        Ok(base)
    }
}

async fn checksum_of_file(path: &Path) -> Result<String, VirtualError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:08x}", hasher.finalize()))
}

/// A linked clone issued by a [VmLibrary].
pub struct Vm {
    hypervisor: Arc<dyn Hypervisor>,
    image: String,
    id: String,
    closed: AtomicBool,
}

impl Vm {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub async fn configure(&self, option: &VmOption) -> Result<(), VirtualError> {
        self.hypervisor.configure(&self.id, option).await
    }

    pub async fn state(&self) -> InstanceState {
        self.hypervisor
            .state(&self.id)
            .await
            .unwrap_or(InstanceState::Error)
    }

    pub async fn start(&self) -> Result<(), VirtualError> {
        if self.state().await == InstanceState::Running {
            return Ok(());
        }
        self.hypervisor.start(&self.id).await?;
        debug!(id = %self.id, "started vm");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), VirtualError> {
        self.hypervisor.power_off(&self.id).await?;
        debug!(id = %self.id, "stopped vm");
        Ok(())
    }

    /// Saves the VM state to disk. Starting it again resumes where it left off.
    pub async fn suspend(&self) -> Result<(), VirtualError> {
        if self.state().await == InstanceState::Running {
            self.hypervisor.save_state(&self.id).await?;
        }
        Ok(())
    }

    /// Brings the VM back to running from whatever state it is in.
    pub async fn restart(&self) -> Result<(), VirtualError> {
        match self.state().await {
            InstanceState::Running => {
                self.stop().await?;
                self.start().await
            }
            InstanceState::Suspended => {
                // A saved VM has to be resumed before it can be powered off
                self.start().await?;
                self.stop().await?;
                self.start().await
            }
            InstanceState::Stopped | InstanceState::Error => self.start().await,
        }
    }

    pub async fn info(&self) -> InstanceInfo {
        InstanceInfo {
            image: self.image.clone(),
            kind: InstanceKind::Vbox,
            id: self.id.clone(),
            state: self.state().await,
        }
    }
}

#[async_trait]
impl Closer for Vm {
    async fn close(&self) -> eyre::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if matches!(
            self.state().await,
            InstanceState::Running | InstanceState::Suspended
        ) {
            if let Err(error) = self.hypervisor.power_off(&self.id).await {
                warn!(?error, id = %self.id, "unable to stop vm");
            }
        }
        if let Err(error) = self.hypervisor.remove(&self.id).await {
            self.closed.store(false, Ordering::SeqCst);
            return Err(error.into());
        }
        debug!(id = %self.id, "closed vm");
        Ok(())
    }
}
