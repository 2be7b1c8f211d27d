// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

use crate::LabError;
use async_trait::async_trait;
use color_eyre::eyre;
use haaukins_common::models::RecordConfig;
use haaukins_virtual::container::{Container, ContainerConfig, ContainerRuntime, Resources};
use haaukins_virtual::Closer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempPath;

const IMAGE: &str = "coredns/coredns:1.6.1";

const COREFILE: &str = ". {
    file zonefile
    prometheus
    errors
    log
}
";

const ZONE_PREFIX: &str = "$ORIGIN .
@   3600 IN SOA sns.dns.icann.org. noc.dns.icann.org. (
                2017042745 ; serial
                7200       ; refresh (2 hours)
                3600       ; retry (1 hour)
                1209600    ; expire (2 weeks)
                3600       ; minimum (1 hour)
                )

";

pub fn format_record(record: &RecordConfig) -> String {
    format!("{} IN {} {}", record.name, record.kind, record.rdata)
}

pub fn zone_file(records: &[RecordConfig]) -> String {
    let mut zone = ZONE_PREFIX.to_string();
    for record in records {
        zone.push_str(&format_record(record));
        zone.push('\n');
    }
    zone
}

/// The resolver of a lab network, serving a zone built from the records of every exercise.
pub struct DnsServer {
    container: Container,
    records: Vec<RecordConfig>,
    _corefile: TempPath,
    _zonefile: TempPath,
}

async fn write_temp(prefix: &str, content: &str) -> Result<TempPath, LabError> {
    let path = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile()?
        .into_temp_path();
    tokio::fs::write(&path, content).await?;
    Ok(path)
}

impl DnsServer {
    pub async fn new(
        runtime: Arc<dyn ContainerRuntime>,
        records: Vec<RecordConfig>,
    ) -> Result<DnsServer, LabError> {
        let corefile = write_temp("Corefile", COREFILE).await?;
        let zonefile = write_temp("zonefile", &zone_file(&records)).await?;

        let container = Container::new(
            runtime,
            ContainerConfig {
                image: IMAGE.to_string(),
                mounts: vec![
                    format!("{}:/Corefile", corefile.display()),
                    format!("{}:/zonefile", zonefile.display()),
                ],
                used_ports: vec!["53/tcp".to_string(), "53/udp".to_string()],
                resources: Some(Resources {
                    memory_mb: 50,
                    cpu: 0.3,
                }),
                cmd: vec!["--conf".to_string(), "Corefile".to_string()],
                labels: BTreeMap::from([("hkn".to_string(), "lab_dns".to_string())]),
                ..Default::default()
            },
        );

        Ok(DnsServer {
            container,
            records,
            _corefile: corefile,
            _zonefile: zonefile,
        })
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn records(&self) -> &[RecordConfig] {
        &self.records
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
impl Closer for DnsServer {
    async fn close(&self) -> eyre::Result<()> {
        self.container.close().await
    }
}
