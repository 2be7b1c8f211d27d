// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::command;
use crate::container::{ContainerConfig, ContainerRuntime};
use crate::{InstanceState, VirtualError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

const DOCKER: &str = "docker";
const LINK_BRIDGE: &str = "hkn-bridge";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Creating a container may pull its image first.
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);

/// A [ContainerRuntime] driving the `docker` CLI.
#[derive(Default)]
pub struct DockerCli {
    link_bridge: OnceCell<()>,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    async fn docker<S: AsRef<str>>(&self, args: &[S], action: &str) -> Result<String, VirtualError> {
        command::run(DOCKER, args, DEFAULT_TIMEOUT, action).await
    }

    async fn ensure_link_bridge(&self) -> Result<(), VirtualError> {
        self.link_bridge
            .get_or_try_init(|| async {
                if self
                    .docker(&["network", "inspect", LINK_BRIDGE], "inspect link bridge")
                    .await
                    .is_err()
                {
                    info!("creating the {LINK_BRIDGE} network");
                    self.docker(
                        &["network", "create", "-d", "bridge", LINK_BRIDGE],
                        "create link bridge",
                    )
                    .await?;
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

pub(crate) fn create_args(config: &ContainerConfig) -> Vec<String> {
    let mut args = vec!["create".to_string()];
    for (key, value) in &config.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &config.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for (container_port, host_address) in &config.port_bindings {
        args.push("-p".to_string());
        args.push(format!("{host_address}:{container_port}"));
    }
    for mount in &config.mounts {
        args.push("-v".to_string());
        args.push(mount.clone());
    }
    if let Some(resources) = &config.resources {
        if resources.memory_mb > 0 {
            args.push("--memory".to_string());
            args.push(format!("{}m", resources.memory_mb));
        }
        if resources.cpu > 0.0 {
            args.push("--cpus".to_string());
            args.push(resources.cpu.to_string());
        }
    }
    for dns in &config.dns {
        args.push("--dns".to_string());
        args.push(dns.clone());
    }
    for port in &config.used_ports {
        args.push("--expose".to_string());
        args.push(port.clone());
    }
    if let Some(user) = &config.user {
        args.push("--user".to_string());
        args.push(user.clone());
    }
    args.push(config.image.clone());
    args.extend(config.cmd.iter().cloned());
    args
}

pub(crate) fn parse_state(status: &str) -> InstanceState {
    match status.trim() {
        "running" | "restarting" => InstanceState::Running,
        "paused" => InstanceState::Suspended,
        "created" | "exited" => InstanceState::Stopped,
        _ => InstanceState::Error,
    }
}

fn is_missing(error: &VirtualError) -> bool {
    matches!(error, VirtualError::Command { output, .. } if output.contains("No such"))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, config: &ContainerConfig) -> Result<String, VirtualError> {
        let out = command::run(
            DOCKER,
            &create_args(config),
            CREATE_TIMEOUT,
            "create container",
        )
        .await?;
        let id = out.trim().to_string();
        if id.is_empty() {
            return Err(VirtualError::Unexpected(
                "docker create returned no id".to_string(),
            ));
        }

        if !config.use_bridge {
            if let Err(error) = self
                .docker(&["network", "disconnect", "bridge", id.as_str()], "isolate container")
                .await
            {
                let _ = self.remove(&id).await;
                return Err(error);
            }
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), VirtualError> {
        self.docker(&["start", id], "start container").await?;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), VirtualError> {
        self.docker(&["stop", "-t", "5", id], "stop container")
            .await?;
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<(), VirtualError> {
        self.docker(&["pause", id], "pause container").await?;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<(), VirtualError> {
        self.docker(&["unpause", id], "unpause container").await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), VirtualError> {
        match self.docker(&["rm", "-f", "-v", id], "remove container").await {
            Err(error) if !is_missing(&error) => Err(error),
            _ => Ok(()),
        }
    }

    async fn state(&self, id: &str) -> Result<InstanceState, VirtualError> {
        let out = self
            .docker(
                &["inspect", "--format", "{{.State.Status}}", id],
                "inspect container",
            )
            .await?;
        Ok(parse_state(&out))
    }

    async fn create_network(&self, name: &str, subnet: &str) -> Result<String, VirtualError> {
        let res = self
            .docker(
                &[
                    "network",
                    "create",
                    "-d",
                    "macvlan",
                    "--subnet",
                    subnet,
                    "--label",
                    "hkn=lab_network",
                    name,
                ],
                "create network",
            )
            .await;
        match res {
            Ok(out) => Ok(out.trim().to_string()),
            Err(VirtualError::Command { output, .. }) if output.contains("overlaps") => {
                Err(VirtualError::SubnetOverlap(subnet.to_string()))
            }
            Err(error) => Err(error),
        }
    }

    async fn remove_network(&self, id: &str) -> Result<(), VirtualError> {
        match self.docker(&["network", "rm", id], "remove network").await {
            Err(error) if !is_missing(&error) => Err(error),
            _ => Ok(()),
        }
    }

    async fn connect(
        &self,
        network: &str,
        container: &str,
        ip: &str,
    ) -> Result<(), VirtualError> {
        self.docker(
            &["network", "connect", "--ip", ip, network, container],
            "connect container",
        )
        .await?;
        Ok(())
    }

    async fn disconnect(&self, network: &str, container: &str) -> Result<(), VirtualError> {
        self.docker(
            &["network", "disconnect", "-f", network, container],
            "disconnect container",
        )
        .await?;
        Ok(())
    }

    async fn bridge_alias(&self, container: &str, alias: &str) -> Result<(), VirtualError> {
        self.ensure_link_bridge().await?;
        self.docker(
            &["network", "connect", "--alias", alias, LINK_BRIDGE, container],
            "link container",
        )
        .await?;
        Ok(())
    }

    async fn host_ip(&self) -> Result<String, VirtualError> {
        let out = self
            .docker(
                &[
                    "network",
                    "inspect",
                    "bridge",
                    "--format",
                    "{{(index .IPAM.Config 0).Gateway}}",
                ],
                "inspect bridge",
            )
            .await?;
        let ip = out.trim();
        if ip.is_empty() {
            return Err(VirtualError::Unexpected(
                "the default bridge has no gateway".to_string(),
            ));
        }
        Ok(ip.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Resources;

    #[test]
    fn should_build_create_args() {
        let mut config = ContainerConfig {
            image: "coredns/coredns:1.6.1".to_string(),
            cmd: vec!["--conf".to_string(), "Corefile".to_string()],
            dns: vec!["10.0.0.3".to_string()],
            resources: Some(Resources {
                memory_mb: 50,
                cpu: 0.3,
            }),
            used_ports: vec!["67/udp".to_string()],
            ..Default::default()
        };
        config
            .labels
            .insert("hkn".to_string(), "lab_dns".to_string());
        config
            .port_bindings
            .insert("8080/tcp".to_string(), "127.0.0.1:4000".to_string());

        let args = create_args(&config);
        assert_eq!(
            args,
            vec![
                "create",
                "--label",
                "hkn=lab_dns",
                "-p",
                "127.0.0.1:4000:8080/tcp",
                "--memory",
                "50m",
                "--cpus",
                "0.3",
                "--dns",
                "10.0.0.3",
                "--expose",
                "67/udp",
                "coredns/coredns:1.6.1",
                "--conf",
                "Corefile",
            ]
        );
    }

    #[test]
    fn should_parse_container_states() {
        assert_eq!(parse_state("running\n"), InstanceState::Running);
        assert_eq!(parse_state("paused"), InstanceState::Suspended);
        assert_eq!(parse_state("exited"), InstanceState::Stopped);
        assert_eq!(parse_state("created"), InstanceState::Stopped);
        assert_eq!(parse_state("dead"), InstanceState::Error);
    }
}
