//! Background transfers that keep a dev rollup producing blocks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{CommandRunner, PrivateKey, ShellCommand, TrafficConfig};

/// One self-transfer from the key's address, signed with `key`.
pub fn transfer_command(rpc_url: &str, key: &PrivateKey, value_wei: u64) -> anyhow::Result<ShellCommand> {
    let to = key.address()?;
    Ok(ShellCommand::new("cast")
        .arg("send")
        .arg(to.to_string())
        .arg(format!("--value={value_wei}"))
        .arg("--private-key")
        .secret_arg(key.to_prefixed_hex())
        .arg("--rpc-url")
        .arg(rpc_url)
        .arg("--legacy"))
}

/// Tracks one traffic job per rollup.
#[derive(Debug, Default)]
pub struct TrafficGenerator {
    jobs: Mutex<HashMap<String, CancellationToken>>,
}

impl TrafficGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start sending transfers to `rpc_url`, replacing any job already running for `name`.
    pub fn start<R: CommandRunner + 'static>(
        &self,
        runner: Arc<R>,
        name: &str,
        rpc_url: &str,
        key: &PrivateKey,
        config: &TrafficConfig,
    ) -> anyhow::Result<()> {
        let cmd = transfer_command(rpc_url, key, config.value_wei)?;
        let interval = Duration::from_secs(config.interval_secs.max(1));
        let token = CancellationToken::new();

        let previous = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let rollup = name.to_string();
        tokio::spawn(async move {
            tracing::info!(rollup = %rollup, "Traffic generator started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = runner.run(&cmd, &token).await {
                    if token.is_cancelled() {
                        break;
                    }
                    tracing::warn!(rollup = %rollup, error = %e, "Traffic transfer failed");
                }
            }
            tracing::info!(rollup = %rollup, "Traffic generator stopped");
        });
        Ok(())
    }

    /// Stop the job for `name`. Returns false if none was running.
    pub fn stop(&self, name: &str) -> bool {
        let token = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Names of the rollups with a running job, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RollupResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ANVIL_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    impl CommandRunner for CountingRunner {
        async fn run(&self, _: &ShellCommand, _: &CancellationToken) -> RollupResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    #[test]
    fn test_transfer_command() {
        let cmd = transfer_command("http://127.0.0.1:8545", &PrivateKey::new(ANVIL_KEY), 10).unwrap();
        assert_eq!(cmd.program, "cast");
        assert_eq!(cmd.args[1], "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        assert!(cmd.has_arg("--value=10"));
        assert!(cmd.has_arg("--legacy"));
        assert_eq!(cmd.arg_value("--rpc-url"), Some("http://127.0.0.1:8545"));
        assert!(!cmd.to_string().contains("ac0974bec"));
    }

    #[tokio::test]
    async fn test_start_replace_and_stop() {
        let generator = TrafficGenerator::new();
        let runner = Arc::new(CountingRunner::default());
        let config = TrafficConfig {
            enabled: true,
            interval_secs: 1,
            value_wei: 10,
        };
        let key = PrivateKey::new(ANVIL_KEY);

        generator
            .start(runner.clone(), "chain-a", "http://127.0.0.1:8545", &key, &config)
            .unwrap();
        generator
            .start(runner.clone(), "chain-a", "http://127.0.0.1:8545", &key, &config)
            .unwrap();
        assert_eq!(generator.active(), vec!["chain-a".to_string()]);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let sent = runner.calls.load(Ordering::SeqCst);
        assert!((1..=3).contains(&sent), "expected transfers from a single job, got {sent}");

        assert!(generator.stop("chain-a"));
        assert!(!generator.stop("chain-a"));
        assert!(generator.active().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let after_stop = runner.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), after_stop);
    }
}
