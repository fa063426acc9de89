//! Host telemetry for heartbeats.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Point-in-time host snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemSnapshot {
    /// Host name.
    pub hostname: String,
    /// Operating system family (`linux`, `macos`, `windows`, …).
    pub os: String,
    /// CPU architecture.
    pub arch: String,
    /// Version string reported by the agent binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    /// Seconds since the relay started.
    pub uptime_seconds: u64,
    /// Resident memory of the relay process, in bytes. Platforms without a
    /// current reading report the peak.
    pub memory_rss_bytes: u64,
}

/// Collects [`SystemSnapshot`]s. The agent version is probed once at
/// startup and cached.
#[derive(Debug, Clone)]
pub struct SystemInfoProvider {
    started: Instant,
    hostname: String,
    agent_version: Option<String>,
}

impl SystemInfoProvider {
    /// Create a provider; `agent_version` comes from the startup probe.
    #[must_use]
    pub fn new(agent_version: Option<String>) -> Self {
        Self {
            started: Instant::now(),
            hostname: hostname(),
            agent_version,
        }
    }

    /// Cached agent version.
    #[must_use]
    pub fn agent_version(&self) -> Option<&str> {
        self.agent_version.as_deref()
    }

    /// Time since the provider was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Take a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            hostname: self.hostname.clone(),
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            agent_version: self.agent_version.clone(),
            uptime_seconds: self.uptime().as_secs(),
            memory_rss_bytes: memory_rss_bytes(),
        }
    }
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_owned())
}

/// Parse the `VmRSS` line of a `/proc/<pid>/status` file into bytes.
#[must_use]
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib.saturating_mul(1024))
}

#[cfg(target_os = "linux")]
fn memory_rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn memory_rss_bytes() -> u64 {
    use nix::sys::resource::{getrusage, UsageWho};

    let Ok(usage) = getrusage(UsageWho::RUSAGE_SELF) else {
        return 0;
    };
    // Peak only; macOS reports bytes, the BSDs kilobytes.
    let max_rss = u64::try_from(usage.max_rss()).unwrap_or(0);
    if cfg!(target_os = "macos") {
        max_rss
    } else {
        max_rss.saturating_mul(1024)
    }
}

#[cfg(not(unix))]
fn memory_rss_bytes() -> u64 {
    0
}
