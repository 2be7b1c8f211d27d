// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of haaukins

//! CPU and memory usage of the host, sampled from `/proc`.

use crate::DaemonError;
use serde::Serialize;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PROC_STAT: &str = "/proc/stat";
const PROC_MEMINFO: &str = "/proc/meminfo";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HostUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// The aggregate `cpu` line of `/proc/stat`. Idle time includes iowait.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let values = line
        .split_whitespace()
        .skip(1)
        .map(str::parse::<u64>)
        .collect::<Result<Vec<u64>, _>>()
        .ok()?;
    if values.len() < 4 {
        return None;
    }
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: values.iter().sum(),
    })
}

fn parse_memory_percent(meminfo: &str) -> Option<f32> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse::<u64>().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(100.0 * total.saturating_sub(available) as f32 / total as f32)
}

fn cpu_percent(previous: CpuTimes, current: CpuTimes) -> f32 {
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return 0.0;
    }
    let idle = current.idle.saturating_sub(previous.idle);
    100.0 * total.saturating_sub(idle) as f32 / total as f32
}

async fn read_cpu_times() -> Result<CpuTimes, DaemonError> {
    let stat = tokio::fs::read_to_string(PROC_STAT).await?;
    parse_cpu_times(&stat).ok_or(DaemonError::HostStats(PROC_STAT))
}

async fn read_memory_percent() -> Result<f32, DaemonError> {
    let meminfo = tokio::fs::read_to_string(PROC_MEMINFO).await?;
    parse_memory_percent(&meminfo).ok_or(DaemonError::HostStats(PROC_MEMINFO))
}

/// Sends a sample every `interval` until cancelled or until the receiver goes away.
pub async fn monitor_host(
    interval: Duration,
    samples: flume::Sender<HostUsage>,
    cancellation_token: CancellationToken,
) -> Result<(), DaemonError> {
    let mut previous = read_cpu_times().await?;
    let mut ticks = tokio::time::interval(interval);
    ticks.tick().await;
    loop {
        select! {
            _ = cancellation_token.cancelled() => return Ok(()),
            _ = ticks.tick() => {}
        }
        let current = read_cpu_times().await?;
        let usage = HostUsage {
            cpu_percent: cpu_percent(previous, current),
            memory_percent: read_memory_percent().await?,
        };
        previous = current;
        if samples.send_async(usage).await.is_err() {
            debug!("host usage receiver is gone");
            return Ok(());
        }
    }
}
