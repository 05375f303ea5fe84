//! Shared fixtures: a recording command runner, a switchable liveness probe and a
//! manager wired to a temp directory.

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use alloy_core::primitives::{Address, B256};
use rollbake_deploy::{
    CommandRunner, DeployContext, GenesisEntry, L1Network, L1Proxies, L2_GENESIS_FILE,
    PrivateKey, ROLLUP_CONTRACTS_FILE, RollupConfig, RollupContracts, RollupError, RollupManager,
    RollupResult, ShellCommand,
};
use tempdir::TempDir;
use tokio_util::sync::CancellationToken;

pub const ANVIL_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const ADMIN_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

pub const GENESIS_HASH: B256 = B256::repeat_byte(0x99);

pub fn l1_proxies() -> L1Proxies {
    L1Proxies {
        address_manager: Address::repeat_byte(0xa1),
        l1_rollup: Address::repeat_byte(0xa2),
        cross_chain_channel: Address::repeat_byte(0xa3),
        l1_escrow: Address::repeat_byte(0xa4),
    }
}

#[derive(Default)]
struct MockState {
    commands: Mutex<Vec<ShellCommand>>,
    fail_on: Mutex<Option<String>>,
    block_on: Mutex<Option<String>>,
    skip_genesis: AtomicBool,
    /// Serializes read-modify-write of the shared deployment lists.
    deployments: Mutex<()>,
}

/// Records every command; `npx hardhat` writes deployment results like the real task.
#[derive(Clone)]
pub struct MockRunner {
    deployments_dir: PathBuf,
    state: Arc<MockState>,
}

impl MockRunner {
    pub fn new(deployments_dir: &Path) -> Self {
        Self {
            deployments_dir: deployments_dir.to_path_buf(),
            state: Arc::default(),
        }
    }

    /// Fail every command whose rendering contains `needle`.
    pub fn fail_on(&self, needle: &str) {
        *self.state.fail_on.lock().unwrap() = Some(needle.to_string());
    }

    /// Hang every command whose rendering contains `needle` until cancelled.
    pub fn block_on(&self, needle: &str) {
        *self.state.block_on.lock().unwrap() = Some(needle.to_string());
    }

    pub fn clear_faults(&self) {
        *self.state.fail_on.lock().unwrap() = None;
        *self.state.block_on.lock().unwrap() = None;
    }

    /// Deploy contracts without producing a genesis entry.
    pub fn skip_genesis(&self) {
        self.state.skip_genesis.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<ShellCommand> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands()
            .iter()
            .filter(|cmd| cmd.to_string().contains(needle))
            .count()
    }

    fn matches(slot: &Mutex<Option<String>>, shown: &str) -> bool {
        slot.lock()
            .unwrap()
            .as_deref()
            .is_some_and(|needle| shown.contains(needle))
    }

    fn append(path: &Path, entry: serde_json::Value) {
        let mut list: Vec<serde_json::Value> = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        list.push(entry);
        std::fs::write(path, serde_json::to_string_pretty(&list).unwrap()).unwrap();
    }

    fn write_deployment(&self, cmd: &ShellCommand) {
        let l1_chain_id = L1Network::docker_dev().chain_id;
        let l2_chain_id: u64 = cmd.arg_value("--l2-chain-id").unwrap().parse().unwrap();
        let _files = self.state.deployments.lock().unwrap();
        std::fs::create_dir_all(&self.deployments_dir).unwrap();

        let contracts = RollupContracts {
            l1_chain_id,
            l2_chain_id,
            version: 1,
            l1_proxies: l1_proxies(),
            l2_proxies: None,
        };
        Self::append(
            &self.deployments_dir.join(ROLLUP_CONTRACTS_FILE),
            serde_json::to_value(contracts).unwrap(),
        );

        if !self.state.skip_genesis.load(Ordering::SeqCst) {
            let genesis = GenesisEntry {
                l1_chain_id,
                l2_chain_id,
                genesis: serde_json::json!({
                    "config": { "chainId": l2_chain_id },
                    "alloc": {}
                }),
            };
            Self::append(
                &self.deployments_dir.join(L2_GENESIS_FILE),
                serde_json::to_value(genesis).unwrap(),
            );
        }
    }
}

impl CommandRunner for MockRunner {
    async fn run(&self, cmd: &ShellCommand, cancel: &CancellationToken) -> RollupResult<String> {
        self.state.commands.lock().unwrap().push(cmd.clone());
        let shown = cmd.to_string();

        if Self::matches(&self.state.block_on, &shown) {
            cancel.cancelled().await;
            return Err(RollupError::Cancelled);
        }
        if Self::matches(&self.state.fail_on, &shown) {
            return Err(RollupError::ExternalCommand {
                command: shown,
                status: "exit status: 1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        if cmd.program == "npx" {
            self.write_deployment(cmd);
        }
        Ok(String::new())
    }
}

/// Liveness probe that answers once switched on.
#[derive(Clone, Default)]
pub struct StubProbe {
    live: Arc<AtomicBool>,
}

impl StubProbe {
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }
}

impl rollbake_deploy::GenesisProbe for StubProbe {
    async fn genesis_hash(&self, _: &str) -> anyhow::Result<B256> {
        if self.live.load(Ordering::SeqCst) {
            Ok(GENESIS_HASH)
        } else {
            anyhow::bail!("connection refused")
        }
    }
}

fn write_templates(template_dir: &Path) {
    let execution = template_dir.join("execution");
    let consensus = template_dir.join("consensus");
    std::fs::create_dir_all(&execution).unwrap();
    std::fs::create_dir_all(&consensus).unwrap();

    std::fs::write(
        execution.join("init_l2_geth_tmpl.sh"),
        "#!/bin/sh\n# chain {{ .ChainName }} ({{ .ChainId }}) in {{ .DeploymentChainNameDir }}\n\
         # bootnode {{ .BootnodeAddress }}\n\
         {{ range .Instances }}# {{ .ServiceName }} {{ .L2HttpPort }} {{ .L2WsPort }} {{ .L2AuthRpcPort }}\n{{ end }}",
    )
    .unwrap();
    std::fs::write(execution.join("README"), "static file").unwrap();

    std::fs::write(
        consensus.join("Dockerfile_prod_tmpl"),
        "FROM consensus-base:{{ .ConsensusBaseVersion }}\n",
    )
    .unwrap();
    std::fs::write(
        consensus.join("config_tmpl.toml"),
        "chain_id = {{ .ChainId }}\n\
         l1_rollup = \"{{ .L1Rollup }}\"\n\
         l1_bridge = \"{{ .L1Bridge }}\"\n\
         l2_bridge = \"{{ .L2Bridge }}\"\n\
         engine = \"{{ .L2EngineApiUrl }}\"\n\
         beneficiary = \"{{ .ProposeBeneficiary }}\"\n\
         {{ range .SyncInstances }}[{{ .ServiceName }}]\nengine = \"{{ .L2EngineApiUrl }}\"\n{{ end }}",
    )
    .unwrap();
}

/// Route library logs through the test harness; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::level_filters::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A manager over a fresh temp directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub runner: MockRunner,
    pub probe: StubProbe,
    pub manager: RollupManager<MockRunner, StubProbe>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(customize: impl FnOnce(&mut RollupConfig)) -> Self {
        init_tracing();
        let dir = TempDir::new("rollbake-test").expect("Failed to create temp dir");
        let root = dir.path();

        let mut config = RollupConfig::default();
        config.admin.private_key = PrivateKey::new(ANVIL_KEY);
        config.admin.premint_wei = "1000000".to_string();
        config.context = DeployContext::Microk8s;
        config.images.tag = "v1".to_string();
        config.node.base_port = 9000;
        config.paths.db_dir = root.join("db");
        config.paths.build_dir = root.join("build");
        config.paths.template_dir = root.join("templates");
        config.paths.contracts_dir = root.join("contracts");
        config.liveness.poll_interval_secs = 1;
        config.liveness.deadline_secs = 1;
        customize(&mut config);

        write_templates(&config.paths.template_dir);

        let runner = MockRunner::new(&config.paths.deployments_dir());
        let probe = StubProbe::default();
        probe.set_live(true);
        let manager = RollupManager::new(config, runner.clone(), probe.clone())
            .expect("Failed to create manager");

        Self {
            dir,
            runner,
            probe,
            manager,
        }
    }

    pub fn build_dir(&self, name: &str) -> PathBuf {
        self.manager.dirs(name).root
    }
}
