//! Lowest-PID leader election among co-resident monitor processes.
//!
//! This is a best-effort oracle: the process table is read, then a decision
//! is made, with nothing atomic in between. When enumeration fails the
//! caller is told it leads, so at least one monitor keeps acting.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const LEADER_CACHE_TTL: Duration = Duration::from_secs(60);
const PS_TIMEOUT: Duration = Duration::from_secs(2);

/// `  1234 /usr/bin/session-pulse --flag`, capturing the pid and program
static RE_PS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s+(\S+)").expect("ps line pattern is valid")
});

/// Source of PIDs for processes sharing our invocation signature.
#[async_trait]
pub trait ProcessLister: Send + Sync + 'static {
    async fn matching_pids(&self, signature: &str) -> Result<Vec<u32>>;
}

/// Enumerates processes through `ps -eo pid=,args=`.
#[derive(Debug, Default)]
pub struct PsProcessLister;

#[async_trait]
impl ProcessLister for PsProcessLister {
    async fn matching_pids(&self, signature: &str) -> Result<Vec<u32>> {
        let run = Command::new("ps")
            .args(["-eo", "pid=,args="])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(PS_TIMEOUT, run)
            .await
            .context("ps timed out")?
            .context("Failed to execute ps")?;

        if !output.status.success() {
            anyhow::bail!("ps exited with {:?}", output.status.code());
        }

        Ok(parse_ps_output(
            &String::from_utf8_lossy(&output.stdout),
            signature,
        ))
    }
}

/// Pull PIDs out of `pid args` lines whose program is `signature`.
///
/// Only the executable's file name is compared, so arguments that merely
/// mention the signature (an editor opening our config file) never count.
pub fn parse_ps_output(stdout: &str, signature: &str) -> Vec<u32> {
    let wanted = program_name(signature);
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let Some(caps) = RE_PS_LINE.captures(line) else {
                warn!(line, "unparseable ps line");
                return None;
            };
            if program_name(&caps[2]) != wanted {
                return None;
            }
            caps[1].parse().ok()
        })
        .collect()
}

fn program_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(program)
}

/// Leader iff `my_pid` is the minimum of the observed set plus itself.
pub fn elect(observed: &[u32], my_pid: u32) -> bool {
    observed
        .iter()
        .copied()
        .chain(std::iter::once(my_pid))
        .min()
        .map(|min| min == my_pid)
        .unwrap_or(true)
}

#[derive(Debug, Clone, Copy)]
struct Verdict {
    is_leader: bool,
    checked_at: Instant,
}

/// Cached leader verdict for one monitor instance.
pub struct LeaderElection<P: ProcessLister> {
    lister: P,
    signature: String,
    my_pid: u32,
    ttl: Duration,
    cache: Mutex<Option<Verdict>>,
}

impl<P: ProcessLister> LeaderElection<P> {
    pub fn new(lister: P, signature: impl Into<String>, my_pid: u32) -> Self {
        Self {
            lister,
            signature: signature.into(),
            my_pid,
            ttl: LEADER_CACHE_TTL,
            cache: Mutex::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn pid(&self) -> u32 {
        self.my_pid
    }

    /// Whether this process should perform revivals.
    ///
    /// Served from cache inside the TTL unless `force_recheck` is set.
    pub async fn is_leader(&self, force_recheck: bool) -> bool {
        // Held across enumeration so concurrent callers share one `ps` run.
        let mut cache = self.cache.lock().await;

        if !force_recheck {
            if let Some(verdict) = *cache {
                let age = verdict.checked_at.elapsed();
                if age < self.ttl {
                    debug!(is_leader = verdict.is_leader, ?age, "using cached leader status");
                    return verdict.is_leader;
                }
            }
        }

        let previous = cache.map(|v| v.is_leader);
        let is_leader = match self.lister.matching_pids(&self.signature).await {
            Ok(pids) if pids.is_empty() => {
                debug!("no sibling monitor processes found, assuming leader");
                true
            }
            Ok(pids) => {
                let leader = elect(&pids, self.my_pid);
                debug!(my_pid = self.my_pid, ?pids, leader, "leader election results");
                if previous != Some(leader) {
                    let leader_pid = pids.iter().copied().chain([self.my_pid]).min();
                    if leader {
                        info!(pid = self.my_pid, "elected leader monitor");
                    } else {
                        info!(pid = self.my_pid, leader = ?leader_pid, "running as follower monitor");
                    }
                }
                leader
            }
            Err(e) => {
                warn!("leader election failed, assuming leader: {:#}", e);
                true
            }
        };

        *cache = Some(Verdict {
            is_leader,
            checked_at: Instant::now(),
        });
        is_leader
    }
}
