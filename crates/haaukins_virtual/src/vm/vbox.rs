// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::command;
use crate::vm::{Hypervisor, VmOption};
use crate::{InstanceState, VirtualError};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;
use std::time::Duration;

const VBOX_MANAGE: &str = "VBoxManage";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const IMPORT_TIMEOUT: Duration = Duration::from_secs(120);
const SLOW_TIMEOUT: Duration = Duration::from_secs(30);

lazy_static! {
    static ref STATE_PATTERN: Regex = Regex::new(r"State:\s*(.*)").expect("valid state regex");
    static ref NIC_PATTERN: Regex = Regex::new(r"\bNIC \d+:").expect("valid nic regex");
}

/// A [Hypervisor] driving the `VBoxManage` CLI.
#[derive(Default)]
pub struct VBoxManage;

async fn vbox<S: AsRef<str>>(
    args: &[S],
    timeout: Duration,
    action: &str,
) -> Result<String, VirtualError> {
    command::run(VBOX_MANAGE, args, timeout, action).await
}

pub(crate) fn parse_state(info: &str) -> InstanceState {
    let Some(state) = STATE_PATTERN
        .captures(info)
        .and_then(|captures| captures.get(1))
    else {
        return InstanceState::Error;
    };

    let state = state.as_str();
    if state.contains("running") {
        InstanceState::Running
    } else if state.contains("saved") {
        InstanceState::Suspended
    } else if state.contains("aborted") {
        InstanceState::Error
    } else {
        InstanceState::Stopped
    }
}

pub(crate) fn modify_args(vm: &str, option: &VmOption) -> Vec<String> {
    let mut args = vec!["modifyvm".to_string(), vm.to_string()];
    let flags: Vec<String> = match option {
        VmOption::Cpu(cores) => vec!["--cpus".into(), cores.to_string()],
        VmOption::Ram(mb) => vec!["--memory".into(), mb.to_string()],
        VmOption::Bridge(nic) => vec![
            "--nic1".into(),
            "bridged".into(),
            "--bridgeadapter1".into(),
            nic.clone(),
            "--nicpromisc1".into(),
            "allow-all".into(),
        ],
        VmOption::LocalRdp { ip, port } => vec![
            "--vrde".into(),
            "on".into(),
            "--vrdeproperty".into(),
            format!("TCP/Address={ip}"),
            "--vrdeproperty".into(),
            format!("TCP/Ports={port}"),
            "--vrdeauthtype".into(),
            "null".into(),
            "--vram".into(),
            "128".into(),
            "--clipboard".into(),
            "bidirectional".into(),
        ],
    };
    args.extend(flags);
    args
}

impl VBoxManage {
    pub fn new() -> Self {
        VBoxManage
    }

    async fn remove_all_nics(&self, vm: &str) -> Result<(), VirtualError> {
        let info = vbox(&["showvminfo", vm], DEFAULT_TIMEOUT, "show vm info").await?;
        for nic in 1..=NIC_PATTERN.find_iter(&info).count() {
            vbox(
                &["modifyvm", vm, format!("--nic{nic}").as_str(), "none"],
                DEFAULT_TIMEOUT,
                "remove nic",
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for VBoxManage {
    async fn exists(&self, name: &str) -> Result<bool, VirtualError> {
        let out = vbox(&["list", "vms"], DEFAULT_TIMEOUT, "list vms").await?;
        Ok(out.contains(&format!("\"{name}\"")))
    }

    async fn import(&self, path: &Path, name: &str) -> Result<(), VirtualError> {
        let path = path.to_string_lossy().to_string();
        vbox(
            &["import", path.as_str(), "--vsys", "0", "--vmname", name],
            IMPORT_TIMEOUT,
            "import ova",
        )
        .await?;
        Ok(())
    }

    async fn snapshot(&self, vm: &str, snapshot: &str) -> Result<(), VirtualError> {
        vbox(
            &["snapshot", vm, "take", snapshot],
            DEFAULT_TIMEOUT,
            "take snapshot",
        )
        .await?;
        Ok(())
    }

    async fn has_snapshot(&self, vm: &str, snapshot: &str) -> Result<bool, VirtualError> {
        // Listing fails outright for machines without any snapshots
        match vbox(
            &["snapshot", vm, "list", "--machinereadable"],
            DEFAULT_TIMEOUT,
            "list snapshots",
        )
        .await
        {
            Ok(out) => Ok(out.contains(&format!("=\"{snapshot}\""))),
            Err(VirtualError::Command { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn linked_clone(
        &self,
        base: &str,
        snapshot: &str,
        name: &str,
    ) -> Result<(), VirtualError> {
        vbox(
            &[
                "clonevm",
                base,
                "--snapshot",
                snapshot,
                "--options",
                "link",
                "--name",
                name,
                "--register",
            ],
            SLOW_TIMEOUT,
            "clone vm",
        )
        .await?;
        Ok(())
    }

    async fn configure(&self, vm: &str, option: &VmOption) -> Result<(), VirtualError> {
        if let VmOption::Bridge(_) = option {
            self.remove_all_nics(vm).await?;
        }
        vbox(&modify_args(vm, option), DEFAULT_TIMEOUT, "modify vm").await?;
        Ok(())
    }

    async fn start(&self, vm: &str) -> Result<(), VirtualError> {
        vbox(
            &["startvm", vm, "--type", "headless"],
            SLOW_TIMEOUT,
            "start vm",
        )
        .await?;
        Ok(())
    }

    async fn power_off(&self, vm: &str) -> Result<(), VirtualError> {
        vbox(&["controlvm", vm, "poweroff"], SLOW_TIMEOUT, "stop vm").await?;
        Ok(())
    }

    async fn save_state(&self, vm: &str) -> Result<(), VirtualError> {
        vbox(&["controlvm", vm, "savestate"], SLOW_TIMEOUT, "suspend vm").await?;
        Ok(())
    }

    async fn remove(&self, vm: &str) -> Result<(), VirtualError> {
        vbox(&["unregistervm", vm, "--delete"], SLOW_TIMEOUT, "delete vm").await?;
        Ok(())
    }

    async fn state(&self, vm: &str) -> Result<InstanceState, VirtualError> {
        let info = vbox(&["showvminfo", vm], DEFAULT_TIMEOUT, "show vm info").await?;
        Ok(parse_state(&info))
    }
}
