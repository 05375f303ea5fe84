//! Starting, stopping and probing a rollup's node network.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::B256;
use backon::{ConstantBuilder, Retryable};
use tokio_util::sync::CancellationToken;

use crate::{
    CommandRunner, GenesisProbe, LivenessConfig, RollupError, RollupResult, ShellCommand,
    builder::COMPOSE_FILE,
};

/// Number of probes that fit in `deadline` at one probe per `interval`.
fn probe_attempts(interval: Duration, deadline: Duration) -> usize {
    let interval = interval.as_millis().max(1);
    (deadline.as_millis() / interval).max(1) as usize
}

pub struct NetworkLauncher<'a, R, P> {
    pub runner: &'a R,
    pub probe: &'a P,
}

impl<'a, R: CommandRunner, P: GenesisProbe> NetworkLauncher<'a, R, P> {
    pub fn new(runner: &'a R, probe: &'a P) -> Self {
        Self { runner, probe }
    }

    pub fn compose_file(dir: &Path) -> PathBuf {
        dir.join(COMPOSE_FILE)
    }

    fn compose(dir: &Path) -> ShellCommand {
        ShellCommand::new("docker")
            .arg("compose")
            .arg("-f")
            .arg(Self::compose_file(dir).display().to_string())
    }

    /// Start every service described in `dir/docker-compose.yaml`, detached.
    pub async fn start(&self, dir: &Path, cancel: &CancellationToken) -> RollupResult<()> {
        tracing::info!(dir = %dir.display(), "Starting rollup network...");
        self.runner
            .run(&Self::compose(dir).args(["up", "-d"]), cancel)
            .await?;
        Ok(())
    }

    /// Stop the network and remove its volumes.
    pub async fn stop(&self, dir: &Path, cancel: &CancellationToken) -> RollupResult<()> {
        tracing::info!(dir = %dir.display(), "Stopping rollup network...");
        self.runner
            .run(&Self::compose(dir).args(["down", "-v"]), cancel)
            .await?;
        Ok(())
    }

    /// Poll `rpc_url` until it serves a genesis block.
    ///
    /// Gives up with [`RollupError::Timeout`] after the configured deadline and with
    /// [`RollupError::Cancelled`] as soon as `cancel` fires.
    pub async fn wait_until_live(
        &self,
        rpc_url: &str,
        liveness: &LivenessConfig,
        cancel: &CancellationToken,
    ) -> RollupResult<B256> {
        let interval = liveness.poll_interval();
        let deadline = liveness.deadline();
        let backoff = ConstantBuilder::default()
            .with_delay(interval)
            .with_max_times(probe_attempts(interval, deadline));

        let probe = (|| async { self.probe.genesis_hash(rpc_url).await })
            .retry(backoff)
            .notify(|err: &anyhow::Error, dur: Duration| {
                tracing::debug!(rpc_url = %rpc_url, error = %err, delay = ?dur, "Node not live yet, retrying");
            });

        let timeout = || RollupError::Timeout {
            what: format!("genesis block at {rpc_url}"),
            secs: liveness.deadline_secs,
        };

        tracing::info!(rpc_url = %rpc_url, deadline = ?deadline, "Waiting for the node to serve genesis...");
        tokio::select! {
            _ = cancel.cancelled() => Err(RollupError::Cancelled),
            result = tokio::time::timeout(deadline, probe) => match result {
                Ok(Ok(hash)) => {
                    tracing::info!(rpc_url = %rpc_url, genesis = %hash, "Node is live");
                    Ok(hash)
                }
                Ok(Err(e)) => {
                    tracing::warn!(rpc_url = %rpc_url, error = %e, "Gave up probing the node");
                    Err(timeout())
                }
                Err(_) => Err(timeout()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProbe {
        calls: AtomicUsize,
        live_after: usize,
    }

    impl GenesisProbe for CountingProbe {
        async fn genesis_hash(&self, _: &str) -> anyhow::Result<B256> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.live_after {
                Ok(B256::repeat_byte(0xab))
            } else {
                anyhow::bail!("connection refused")
            }
        }
    }

    struct NoopRunner;

    impl CommandRunner for NoopRunner {
        async fn run(&self, _: &ShellCommand, _: &CancellationToken) -> RollupResult<String> {
            Ok(String::new())
        }
    }

    fn liveness(deadline_secs: u64) -> LivenessConfig {
        LivenessConfig {
            poll_interval_secs: 1,
            deadline_secs,
        }
    }

    #[test]
    fn test_probe_attempts() {
        assert_eq!(probe_attempts(Duration::from_secs(5), Duration::from_secs(600)), 120);
        assert_eq!(probe_attempts(Duration::from_secs(5), Duration::from_secs(1)), 1);
    }

    #[tokio::test]
    async fn test_live_on_first_probe() {
        let probe = CountingProbe {
            calls: AtomicUsize::new(0),
            live_after: 1,
        };
        let launcher = NetworkLauncher::new(&NoopRunner, &probe);
        let hash = launcher
            .wait_until_live("http://127.0.0.1:9000", &liveness(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hash, B256::repeat_byte(0xab));
    }

    #[tokio::test]
    async fn test_never_live_times_out() {
        let probe = CountingProbe {
            calls: AtomicUsize::new(0),
            live_after: usize::MAX,
        };
        let launcher = NetworkLauncher::new(&NoopRunner, &probe);
        let err = launcher
            .wait_until_live("http://127.0.0.1:9000", &liveness(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RollupError::Timeout { secs: 1, .. }));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let probe = CountingProbe {
            calls: AtomicUsize::new(0),
            live_after: usize::MAX,
        };
        let launcher = NetworkLauncher::new(&NoopRunner, &probe);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = launcher
            .wait_until_live("http://127.0.0.1:9000", &liveness(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RollupError::Cancelled));
    }
}
