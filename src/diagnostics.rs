//! Clock snapshots taken when a run starts.
//!
//! The DAQ machine timestamps its own data, so each run file records both
//! its clock and ours. A large difference is worth a warning but never stops
//! a run.

use crate::config::ClockConfig;
use crate::sample::MachineTime;
use chrono::{DateTime, Local, TimeZone, TimeDelta};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct ClockSnapshot {
    pub remote: Option<MachineTime>,
    pub local: MachineTime,
}

impl ClockSnapshot {
    pub fn skew(&self) -> Option<TimeDelta> {
        self.remote.as_ref().map(|r| {
            let delta = r.time - self.local.time;
            if delta < TimeDelta::zero() {
                -delta
            } else {
                delta
            }
        })
    }
}

pub async fn take_snapshot(cfg: &ClockConfig) -> ClockSnapshot {
    let remote = match &cfg.daq_host {
        Some(host) => remote_time(host, Duration::from_millis(cfg.ssh_timeout_ms)).await,
        None => None,
    };
    let local = MachineTime { machine: local_machine().await, time: Local::now() };
    let snapshot = ClockSnapshot { remote, local };

    if let Some(remote) = &snapshot.remote {
        tracing::info!("Date/time on DAQ machine ({}): {}", remote.machine, remote.time);
    }
    tracing::info!("Date/time on local machine ({}): {}", snapshot.local.machine, snapshot.local.time);
    if let Some(skew) = snapshot.skew() {
        if exceeds(skew, cfg.skew_warning_secs) {
            tracing::warn!("clock skew of {}s between DAQ and local machine", skew.num_seconds());
        } else {
            tracing::info!("Time difference: {}s", skew.num_seconds());
        }
    }
    snapshot
}

fn exceeds(skew: TimeDelta, threshold_secs: i64) -> bool {
    skew > TimeDelta::seconds(threshold_secs)
}

async fn remote_time(host: &str, limit: Duration) -> Option<MachineTime> {
    let output = Command::new("ssh")
        .args(["-o", "BatchMode=yes", host, "date", "+%s"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(limit, output).await {
        Ok(Ok(out)) if out.status.success() => out,
        Ok(Ok(out)) => {
            tracing::warn!("ssh {} date exited with {}", host, out.status);
            return None;
        }
        Ok(Err(e)) => {
            tracing::warn!("could not run ssh {}: {}", host, e);
            return None;
        }
        Err(_) => {
            tracing::warn!("ssh {} timed out after {:?}", host, limit);
            return None;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_epoch(&stdout) {
        Some(time) => Some(MachineTime { machine: host.to_string(), time }),
        None => {
            tracing::warn!("unexpected date output from {}: {:?}", host, stdout);
            None
        }
    }
}

fn parse_epoch(raw: &str) -> Option<DateTime<Local>> {
    let secs = raw.trim().parse::<i64>().ok()?;
    Local.timestamp_opt(secs, 0).single()
}

async fn local_machine() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = match tokio::fs::read_to_string("/etc/hostname").await {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
    };
    format!("{}@{}", user, host)
}
