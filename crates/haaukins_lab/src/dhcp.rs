// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::LabError;
use async_trait::async_trait;
use color_eyre::eyre;
use haaukins_virtual::container::{Container, ContainerConfig, ContainerRuntime, Resources};
use haaukins_virtual::network::{Network, DNS_OCTET};
use haaukins_virtual::Closer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempPath;

const IMAGE: &str = "networkboot/dhcpd";

/// Renders `dhcpd.conf` for a lab network. `format_ip` maps a last octet to a full address.
pub fn dhcpd_conf(format_ip: impl Fn(u8) -> String) -> String {
    format!(
        "option domain-name-servers {dns};

subnet {subnet} netmask 255.255.255.0 {{
    range {min} {max};
    option subnet-mask 255.255.255.0;
    option broadcast-address {broadcast};
    option routers {router};
}}
",
        dns = format_ip(DNS_OCTET),
        subnet = format_ip(0),
        min = format_ip(4),
        max = format_ip(254),
        broadcast = format_ip(255),
        router = format_ip(1),
    )
}

/// The DHCP service of a lab network.
pub struct DhcpServer {
    container: Container,
    subnet: String,
    dns: String,
    _conf: TempPath,
}

impl DhcpServer {
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        network: &Network,
    ) -> Result<DhcpServer, LabError> {
        let conf = tempfile::Builder::new()
            .prefix("dhcpd-conf")
            .tempfile()?
            .into_temp_path();
        tokio::fs::write(&conf, dhcpd_conf(|octet| network.format_ip(octet))).await?;

        let dns = network.format_ip(DNS_OCTET);
        let container = Container::new(
            runtime,
            ContainerConfig {
                image: IMAGE.to_string(),
                mounts: vec![format!("{}:/data/dhcpd.conf", conf.display())],
                dns: vec![dns.clone()],
                used_ports: vec!["67/udp".to_string()],
                resources: Some(Resources {
                    memory_mb: 50,
                    cpu: 0.3,
                }),
                cmd: vec!["eth0".to_string()],
                labels: BTreeMap::from([("hkn".to_string(), "lab_dhcpd".to_string())]),
                ..Default::default()
            },
        );

        Ok(DhcpServer {
            container,
            subnet: network.subnet(),
            dns,
            _conf: conf,
        })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn lab_subnet(&self) -> &str {
        &self.subnet
    }

    pub fn lab_dns(&self) -> &str {
        &self.dns
    }

    pub async fn run(&self) -> Result<(), LabError> {
        self.container.run().await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), LabError> {
        self.container.stop().await?;
        Ok(())
    }
}

#[async_trait]
impl Closer for DhcpServer {
    async fn close(&self) -> eyre::Result<()> {
        self.container.close().await
    }
}
