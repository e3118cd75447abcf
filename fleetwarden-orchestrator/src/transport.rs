use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Directory on a reachable host.
    Remote { host: String, path: String },
    ObjectStore { uri: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub files_changed: u64,
    pub bytes_transferred: u64,
}

/// One-way copy of a working directory. Long-running; must stop promptly
/// when `cancel` fires.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn transfer(
        &self,
        from: &Location,
        to: &Location,
        cancel: CancellationToken,
    ) -> anyhow::Result<TransferStats>;
}

/// rsync over ssh between hosts, `aws s3 sync` for the object store leg.
/// The copy runs on the source host (or the target, when pulling from the
/// object store) so data never transits the orchestrator.
pub struct RsyncTransport {
    ssh_user: String,
    ssh_key_path: Option<String>,
    host_key_checking: String,
}

impl RsyncTransport {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            ssh_user: settings.ssh_user.clone(),
            ssh_key_path: settings.ssh_key_path.clone(),
            host_key_checking: settings.ssh_host_key_checking.clone(),
        }
    }

    /// Remote commands go through the remote shell, so every word is quoted.
    fn ssh(&self, host: &str, remote_argv: &[String]) -> Command {
        let remote_cmd = shell_words::join(remote_argv);
        let mut cmd = Command::new("ssh");
        if let Some(key) = &self.ssh_key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-o")
            .arg(format!("StrictHostKeyChecking={}", self.host_key_checking))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg(format!("{}@{}", self.ssh_user, host))
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn plan(&self, from: &Location, to: &Location) -> anyhow::Result<(Command, bool)> {
        let plan = match (from, to) {
            (Location::Remote { host, path }, Location::Remote { host: dst, path: dst_path }) => {
                let argv = vec![
                    "rsync".to_string(),
                    "-az".to_string(),
                    "--delete".to_string(),
                    "--stats".to_string(),
                    // keeps the destination path from being re-split by the far shell
                    "--protect-args".to_string(),
                    "-e".to_string(),
                    format!("ssh -o StrictHostKeyChecking={} -o BatchMode=yes", self.host_key_checking),
                    format!("{}/", path),
                    format!("{}@{}:{}/", self.ssh_user, dst, dst_path),
                ];
                (self.ssh(host, &argv), true)
            }
            (Location::Remote { host, path }, Location::ObjectStore { uri }) => {
                (self.ssh(host, &s3_sync(path, uri)), false)
            }
            (Location::ObjectStore { uri }, Location::Remote { host, path }) => {
                (self.ssh(host, &s3_sync(uri, path)), false)
            }
            (Location::ObjectStore { .. }, Location::ObjectStore { .. }) => {
                bail!("object store to object store transfer is not supported")
            }
        };
        Ok(plan)
    }
}

fn s3_sync(from: &str, to: &str) -> Vec<String> {
    ["aws", "s3", "sync", "--no-progress", from, to]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[async_trait]
impl SyncTransport for RsyncTransport {
    async fn transfer(
        &self,
        from: &Location,
        to: &Location,
        cancel: CancellationToken,
    ) -> anyhow::Result<TransferStats> {
        let (mut cmd, is_rsync) = self.plan(from, to)?;
        let child = cmd.spawn().context("Failed to spawn ssh")?;

        // kill_on_drop terminates the process if the cancel branch wins
        let output = tokio::select! {
            out = child.wait_with_output() => out.context("transfer process failed")?,
            _ = cancel.cancelled() => bail!("transfer cancelled"),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "transfer exited with {}: {}",
                output.status,
                stderr.trim().lines().last().unwrap_or("")
            );
        }
        Ok(if is_rsync {
            parse_rsync_stats(&stdout)
        } else {
            parse_s3_sync_output(&stdout)
        })
    }
}

fn stat_number(line: &str) -> Option<u64> {
    let value = line.split(':').nth(1)?.trim();
    let digits: String = value
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn parse_rsync_stats(output: &str) -> TransferStats {
    let mut stats = TransferStats::default();
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Number of regular files transferred") {
            stats.files_changed = stat_number(line).unwrap_or(0);
        } else if line.starts_with("Total bytes sent") {
            stats.bytes_transferred = stat_number(line).unwrap_or(0);
        }
    }
    stats
}

/// `aws s3 sync` prints one `upload:`/`download:` line per file and no byte totals.
pub fn parse_s3_sync_output(output: &str) -> TransferStats {
    let files = output
        .lines()
        .filter(|l| {
            let l = l.trim_start();
            l.starts_with("upload:") || l.starts_with("download:") || l.starts_with("copy:")
        })
        .count() as u64;
    TransferStats {
        files_changed: files,
        bytes_transferred: 0,
    }
}

#[cfg(any(test, feature = "provider-mock"))]
pub mod memory {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Script {
        failures: VecDeque<String>,
        always_fail: bool,
        delay: Duration,
        transfers: Vec<(Location, Location)>,
    }

    /// Scriptable in-process transport. Each successful transfer reports
    /// one file of 1 KiB.
    #[derive(Default)]
    pub struct MemoryTransport {
        script: Mutex<Script>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
            let mut guard = match self.script.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut *guard)
        }

        pub fn push_failure(&self, message: &str) {
            self.with_script(|s| s.failures.push_back(message.to_string()));
        }

        pub fn set_always_fail(&self, fail: bool) {
            self.with_script(|s| s.always_fail = fail);
        }

        pub fn set_delay(&self, delay: Duration) {
            self.with_script(|s| s.delay = delay);
        }

        pub fn transfers(&self) -> Vec<(Location, Location)> {
            self.with_script(|s| s.transfers.clone())
        }
    }

    #[async_trait]
    impl SyncTransport for MemoryTransport {
        async fn transfer(
            &self,
            from: &Location,
            to: &Location,
            cancel: CancellationToken,
        ) -> anyhow::Result<TransferStats> {
            let delay = self.with_script(|s| s.delay);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => bail!("transfer cancelled"),
                }
            }
            let failure = self.with_script(|s| {
                if s.always_fail {
                    Some("connection reset by peer".to_string())
                } else {
                    s.failures.pop_front()
                }
            });
            if let Some(msg) = failure {
                bail!(msg);
            }
            self.with_script(|s| s.transfers.push((from.clone(), to.clone())));
            Ok(TransferStats {
                files_changed: 1,
                bytes_transferred: 1024,
            })
        }
    }
}
