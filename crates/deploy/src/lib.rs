//! rollbake-deploy - Lifecycle orchestration for on-demand L2 rollups.
//!
//! This crate deploys a rollup's contracts on L1, builds its execution and consensus
//! images, launches the node network and tracks every step in a durable per-rollup record.

mod error;
pub use error::{
    ApiResponse, ErrorKind, RESPONSE_CODE_FAILED, RESPONSE_CODE_SUCCEED, RollupError,
    RollupResult,
};

mod rollup;
pub use rollup::{
    FundWallet, L1Network, L2_ADDRESS_MANAGER, L2_BRIDGE, L2_ESCROW, L2_ROLLUP, MAX_CHAIN_ID,
    MIN_CHAIN_ID, ROLLUP_VERSION, Rollup, RollupStep, STATUS_CONSENSUS_IMAGE_DONE,
    STATUS_DEPLOYED, STATUS_ERROR, STATUS_EXECUTION_IMAGE_DONE, STATUS_INITIALIZING,
    STATUS_L1_DEPLOYED, STATUS_RUNNING, parse_wei, validate_name,
};

mod keys;
pub use keys::{DEV_BOOTNODE_KEY, NodeKey, PrivateKey};

mod config;
pub use config::{
    AdminConfig, CONFIG_FILENAME, DEFAULT_BASE_PORT, DEFAULT_BUILDER, DEFAULT_IMAGE_TAG,
    DEFAULT_PUBLIC_HOST, DEFAULT_REGISTRY, DEFAULT_RELAY_DB_URL, DeployContext, ENV_PREFIX,
    ImageConfig, LivenessConfig, NodeConfig, PathsConfig, RollupConfig, TrafficConfig,
};

mod store;
pub use store::FileStore;

mod deployments;
pub use deployments::{
    DeploymentRegistry, GenesisEntry, L1Addresses, L1Proxies, L2_GENESIS_FILE, L2Proxies,
    ROLLUP_CONTRACTS_FILE, RollupContracts,
};

mod runner;
pub use runner::{CommandRunner, ShellCommand, TokioCommandRunner};

pub mod template;

pub mod deployment_hash;

mod deployer;
pub use deployer::{ContractDeployer, DEPLOY_TASK, premint_accounts, validate_fund_wallets};

pub mod builder;
pub use builder::{ArtifactBuilder, InstancePorts, RollupDirs, image_url};

mod rpc;
pub use rpc::{GenesisProbe, L2RpcClient};

mod launcher;
pub use launcher::NetworkLauncher;

mod traffic;
pub use traffic::{TrafficGenerator, transfer_command};

mod orchestrator;
pub use orchestrator::{CreateRollupRequest, RollupManager};
