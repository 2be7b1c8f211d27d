// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! In-memory stand-ins for the container runtime and the hypervisor.

use crate::container::{ContainerConfig, ContainerRuntime};
use crate::vm::{Hypervisor, VmOption};
use crate::{InstanceState, VirtualError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

fn failure(action: &str) -> VirtualError {
    VirtualError::Command {
        action: action.to_string(),
        output: "injected failure".to_string(),
    }
}

fn missing(action: &str, id: &str) -> VirtualError {
    VirtualError::Command {
        action: action.to_string(),
        output: format!("No such object: {id}"),
    }
}

struct FakeContainer {
    config: ContainerConfig,
    state: InstanceState,
}

#[derive(Default)]
struct RuntimeState {
    next_id: u64,
    created: u64,
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, String>,
    /// (network, container) to ip
    connections: HashMap<(String, String), String>,
    aliases: HashMap<String, String>,
    overlaps: usize,
    fail_connect: bool,
    failing_images: HashSet<String>,
    failing_starts: HashSet<String>,
}

/// A [ContainerRuntime] keeping containers and networks in memory.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Live containers.
    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    /// Containers ever created.
    pub fn created_count(&self) -> u64 {
        self.state().created
    }

    pub fn network_count(&self) -> usize {
        self.state().networks.len()
    }

    pub fn overlap_next_networks(&self, count: usize) {
        self.state().overlaps = count;
    }

    pub fn fail_next_connect(&self) {
        self.state().fail_connect = true;
    }

    /// Makes every creation of `image` fail until [FakeRuntime::heal_image] is called.
    pub fn fail_image(&self, image: &str) {
        self.state().failing_images.insert(image.to_string());
    }

    pub fn heal_image(&self, image: &str) {
        self.state().failing_images.remove(image);
    }

    /// Makes containers of `image` fail to start.
    pub fn fail_starts_of(&self, image: &str) {
        self.state().failing_starts.insert(image.to_string());
    }

    pub fn config_of(&self, id: &str) -> Option<ContainerConfig> {
        self.state()
            .containers
            .get(id)
            .map(|container| container.config.clone())
    }

    pub fn state_of(&self, id: &str) -> Option<InstanceState> {
        self.state()
            .containers
            .get(id)
            .map(|container| container.state)
    }

    /// Ids of live containers created from `image`.
    pub fn containers_of(&self, image: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state()
            .containers
            .iter()
            .filter(|(_, container)| container.config.image == image)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn ip_of(&self, network: &str, container: &str) -> Option<String> {
        self.state()
            .connections
            .get(&(network.to_string(), container.to_string()))
            .cloned()
    }

    pub fn alias_of(&self, container: &str) -> Option<String> {
        self.state().aliases.get(container).cloned()
    }

    fn with_container<T>(
        &self,
        id: &str,
        action: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T, VirtualError> {
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| missing(action, id))?;
        Ok(f(container))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, config: &ContainerConfig) -> Result<String, VirtualError> {
        let mut state = self.state();
        if state.failing_images.contains(&config.image) {
            return Err(failure("create container"));
        }
        state.next_id += 1;
        state.created += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                config: config.clone(),
                state: InstanceState::Stopped,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), VirtualError> {
        let failing = self.state().failing_starts.clone();
        self.with_container(id, "start container", |c| {
            if failing.contains(&c.config.image) {
                return Err(failure("start container"));
            }
            c.state = InstanceState::Running;
            Ok(())
        })?
    }

    async fn stop(&self, id: &str) -> Result<(), VirtualError> {
        self.with_container(id, "stop container", |c| {
            c.state = InstanceState::Stopped
        })
    }

    async fn pause(&self, id: &str) -> Result<(), VirtualError> {
        self.with_container(id, "pause container", |c| {
            c.state = InstanceState::Suspended
        })
    }

    async fn unpause(&self, id: &str) -> Result<(), VirtualError> {
        self.with_container(id, "unpause container", |c| {
            c.state = InstanceState::Running
        })
    }

    async fn remove(&self, id: &str) -> Result<(), VirtualError> {
        let mut state = self.state();
        state.containers.remove(id);
        state.connections.retain(|(_, container), _| container != id);
        state.aliases.remove(id);
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<InstanceState, VirtualError> {
        self.with_container(id, "inspect container", |c| c.state)
    }

    async fn create_network(&self, name: &str, subnet: &str) -> Result<String, VirtualError> {
        let mut state = self.state();
        if state.overlaps > 0 {
            state.overlaps -= 1;
            return Err(VirtualError::SubnetOverlap(subnet.to_string()));
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.networks.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), VirtualError> {
        let mut state = self.state();
        state.networks.remove(id);
        state.connections.retain(|(network, _), _| network != id);
        Ok(())
    }

    async fn connect(
        &self,
        network: &str,
        container: &str,
        ip: &str,
    ) -> Result<(), VirtualError> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_connect) {
            return Err(failure("connect container"));
        }
        if !state.networks.contains_key(network) {
            return Err(missing("connect container", network));
        }
        if !state.containers.contains_key(container) {
            return Err(missing("connect container", container));
        }
        let taken = state
            .connections
            .iter()
            .any(|((net, _), existing)| net == network && existing == ip);
        if taken {
            return Err(VirtualError::Command {
                action: "connect container".to_string(),
                output: format!("Address already in use: {ip}"),
            });
        }
        state
            .connections
            .insert((network.to_string(), container.to_string()), ip.to_string());
        Ok(())
    }

    async fn disconnect(&self, network: &str, container: &str) -> Result<(), VirtualError> {
        self.state()
            .connections
            .remove(&(network.to_string(), container.to_string()))
            .map(|_| ())
            .ok_or_else(|| missing("disconnect container", container))
    }

    async fn bridge_alias(&self, container: &str, alias: &str) -> Result<(), VirtualError> {
        let mut state = self.state();
        if !state.containers.contains_key(container) {
            return Err(missing("link container", container));
        }
        state
            .aliases
            .insert(container.to_string(), alias.to_string());
        Ok(())
    }

    async fn host_ip(&self) -> Result<String, VirtualError> {
        Ok("172.17.0.1".to_string())
    }
}

struct FakeVm {
    state: InstanceState,
    snapshots: Vec<String>,
    options: Vec<VmOption>,
    clone: bool,
}

#[derive(Default)]
struct HypervisorState {
    vms: HashMap<String, FakeVm>,
    imports: usize,
    removals: usize,
    fail_snapshot: bool,
    fail_configure: bool,
    fail_clone: bool,
}

/// A [Hypervisor] keeping VMs in memory.
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    fn state(&self) -> MutexGuard<'_, HypervisorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn imports(&self) -> usize {
        self.state().imports
    }

    pub fn removals(&self) -> usize {
        self.state().removals
    }

    /// Names of the imported base VMs.
    pub fn bases(&self) -> Vec<String> {
        let mut bases: Vec<String> = self
            .state()
            .vms
            .iter()
            .filter(|(_, vm)| !vm.clone)
            .map(|(name, _)| name.clone())
            .collect();
        bases.sort();
        bases
    }

    /// Live linked clones.
    pub fn clone_count(&self) -> usize {
        self.state().vms.values().filter(|vm| vm.clone).count()
    }

    pub fn running_count(&self) -> usize {
        self.state()
            .vms
            .values()
            .filter(|vm| vm.state == InstanceState::Running)
            .count()
    }

    pub fn snapshot_exists(&self, vm: &str, snapshot: &str) -> bool {
        self.state()
            .vms
            .get(vm)
            .is_some_and(|vm| vm.snapshots.iter().any(|s| s == snapshot))
    }

    pub fn options_of(&self, vm: &str) -> Vec<VmOption> {
        self.state()
            .vms
            .get(vm)
            .map(|vm| vm.options.clone())
            .unwrap_or_default()
    }

    /// Pretends a base VM with an origin snapshot was imported by an earlier run.
    pub fn register_base(&self, name: &str) {
        self.state().vms.insert(
            name.to_string(),
            FakeVm {
                state: InstanceState::Stopped,
                snapshots: vec![crate::vm::ORIGIN_SNAPSHOT.to_string()],
                options: Vec::new(),
                clone: false,
            },
        );
    }

    pub fn fail_next_snapshot(&self) {
        self.state().fail_snapshot = true;
    }

    pub fn fail_next_configure(&self) {
        self.state().fail_configure = true;
    }

    /// Makes every linked clone fail until called again with `false`.
    pub fn fail_clones(&self, fail: bool) {
        self.state().fail_clone = fail;
    }

    fn with_vm<T>(
        &self,
        vm: &str,
        action: &str,
        f: impl FnOnce(&mut FakeVm) -> T,
    ) -> Result<T, VirtualError> {
        let mut state = self.state();
        let vm = state.vms.get_mut(vm).ok_or_else(|| missing(action, vm))?;
        Ok(f(vm))
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn exists(&self, name: &str) -> Result<bool, VirtualError> {
        Ok(self.state().vms.contains_key(name))
    }

    async fn import(&self, _path: &Path, name: &str) -> Result<(), VirtualError> {
        let mut state = self.state();
        if state.vms.contains_key(name) {
            return Err(failure("import ova"));
        }
        state.imports += 1;
        state.vms.insert(
            name.to_string(),
            FakeVm {
                state: InstanceState::Stopped,
                snapshots: Vec::new(),
                options: Vec::new(),
                clone: false,
            },
        );
        Ok(())
    }

    async fn snapshot(&self, vm: &str, snapshot: &str) -> Result<(), VirtualError> {
        if std::mem::take(&mut self.state().fail_snapshot) {
            return Err(failure("take snapshot"));
        }
        self.with_vm(vm, "take snapshot", |vm| {
            vm.snapshots.push(snapshot.to_string())
        })
    }

    async fn has_snapshot(&self, vm: &str, snapshot: &str) -> Result<bool, VirtualError> {
        Ok(self.snapshot_exists(vm, snapshot))
    }

    async fn linked_clone(
        &self,
        base: &str,
        snapshot: &str,
        name: &str,
    ) -> Result<(), VirtualError> {
        let fail_clone = self.state().fail_clone;
        if fail_clone || !self.snapshot_exists(base, snapshot) {
            return Err(failure("clone vm"));
        }
        self.state().vms.insert(
            name.to_string(),
            FakeVm {
                state: InstanceState::Stopped,
                snapshots: Vec::new(),
                options: Vec::new(),
                clone: true,
            },
        );
        Ok(())
    }

    async fn configure(&self, vm: &str, option: &VmOption) -> Result<(), VirtualError> {
        if std::mem::take(&mut self.state().fail_configure) {
            return Err(failure("modify vm"));
        }
        self.with_vm(vm, "modify vm", |vm| vm.options.push(option.clone()))
    }

    async fn start(&self, vm: &str) -> Result<(), VirtualError> {
        self.with_vm(vm, "start vm", |vm| vm.state = InstanceState::Running)
    }

    async fn power_off(&self, vm: &str) -> Result<(), VirtualError> {
        self.with_vm(vm, "stop vm", |vm| vm.state = InstanceState::Stopped)
    }

    async fn save_state(&self, vm: &str) -> Result<(), VirtualError> {
        self.with_vm(vm, "suspend vm", |vm| vm.state = InstanceState::Suspended)
    }

    async fn remove(&self, vm: &str) -> Result<(), VirtualError> {
        let mut state = self.state();
        state.vms.remove(vm).ok_or_else(|| missing("delete vm", vm))?;
        state.removals += 1;
        Ok(())
    }

    async fn state(&self, vm: &str) -> Result<InstanceState, VirtualError> {
        self.with_vm(vm, "show vm info", |vm| vm.state)
    }
}
