//! The rollup record and its lifecycle step.

use alloy_core::primitives::{Address, U256, address};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smallest L2 chain id a rollup may use.
pub const MIN_CHAIN_ID: u64 = 1_000_001;
/// Largest L2 chain id a rollup may use.
pub const MAX_CHAIN_ID: u64 = 1_999_999;

/// Version passed to the contract deployment task.
pub const ROLLUP_VERSION: u64 = 1;

/// L2 predeploys. These are fixed by the contracts and never derived from deployment output.
pub const L2_ADDRESS_MANAGER: Address = address!("4200000000000000000000000000000000000001");
pub const L2_ROLLUP: Address = address!("4200000000000000000000000000000000000002");
pub const L2_BRIDGE: Address = address!("4200000000000000000000000000000000000003");
pub const L2_ESCROW: Address = address!("4200000000000000000000000000000000000004");

const MAX_NAME_LEN: usize = 63;

pub const STATUS_INITIALIZING: &str = "initializing";
pub const STATUS_L1_DEPLOYED: &str = "l1_rollup_done";
pub const STATUS_EXECUTION_IMAGE_DONE: &str = "l2_img_done";
pub const STATUS_CONSENSUS_IMAGE_DONE: &str = "consensus_img_done";
pub const STATUS_DEPLOYED: &str = "deployed";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_ERROR: &str = "error";

/// Ordinal progress marker of the provisioning pipeline.
///
/// Persisted as its integer value.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(into = "u8", try_from = "u8")]
#[strum(serialize_all = "snake_case")]
pub enum RollupStep {
    #[default]
    Init = 0,
    DeployedOnL1 = 1,
    BuildExecutionImage = 2,
    BuildSequencerImage = 3,
    WaitOnline = 4,
    Online = 5,
}

impl From<RollupStep> for u8 {
    fn from(step: RollupStep) -> Self {
        step as u8
    }
}

impl TryFrom<u8> for RollupStep {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RollupStep::Init),
            1 => Ok(RollupStep::DeployedOnL1),
            2 => Ok(RollupStep::BuildExecutionImage),
            3 => Ok(RollupStep::BuildSequencerImage),
            4 => Ok(RollupStep::WaitOnline),
            5 => Ok(RollupStep::Online),
            other => Err(format!("unknown rollup step {other}")),
        }
    }
}

/// Descriptor of the L1 chain a rollup settles on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1Network {
    pub name: String,
    pub chain_id: u64,
    /// RPC endpoint reachable from the orchestrator host.
    pub public_rpc: String,
    pub public_ws: String,
    /// RPC endpoint reachable from inside the node containers.
    pub internal_rpc: String,
    pub internal_ws: String,
    #[serde(default)]
    pub explorer: String,
}

impl L1Network {
    /// Local L1 exposed on the docker host.
    pub fn docker_dev() -> Self {
        Self {
            name: "DockerDev".to_string(),
            chain_id: 23023,
            public_rpc: "http://127.0.0.1:10545".to_string(),
            public_ws: "ws://127.0.0.1:10546".to_string(),
            internal_rpc: "http://host.docker.internal:10545".to_string(),
            internal_ws: "ws://host.docker.internal:10546".to_string(),
            explorer: "http://localhost:31001".to_string(),
        }
    }

    /// L1 running inside the local single-node cluster.
    pub fn cluster_dev() -> Self {
        Self {
            name: "ClusterDev".to_string(),
            chain_id: 23023,
            public_rpc: "http://127.0.0.1:30001".to_string(),
            public_ws: "ws://127.0.0.1:30002".to_string(),
            internal_rpc: "http://node-l1.rollup-l1.svc.cluster.local:8545".to_string(),
            internal_ws: "ws://node-l1.rollup-l1.svc.cluster.local:8546".to_string(),
            explorer: "http://localhost:31001".to_string(),
        }
    }

    /// Look up a built-in L1 preset by name (case-insensitive).
    pub fn preset(name: &str) -> Option<Self> {
        [Self::docker_dev(), Self::cluster_dev()]
            .into_iter()
            .find(|l1| l1.name.eq_ignore_ascii_case(name))
    }
}

impl Default for L1Network {
    fn default() -> Self {
        Self::docker_dev()
    }
}

/// An account pre-funded in the L2 genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundWallet {
    pub address: Address,
    /// Balance in wei, persisted as a decimal string.
    #[serde(with = "decimal_u256")]
    pub amount_wei: U256,
}

mod decimal_u256 {
    use alloy_core::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_str_radix(&raw, 10).map_err(D::Error::custom)
    }
}

/// Durable record of one provisioned L2 network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollup {
    pub name: String,
    pub chain_id: u64,
    pub l1: L1Network,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l1_rollup: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l1_bridge: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l1_escrow: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l1_address_manager: Option<Address>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2_rollup: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2_bridge: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2_escrow: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2_address_manager: Option<Address>,

    #[serde(rename = "execution_img", default, skip_serializing_if = "Option::is_none")]
    pub execution_image: Option<String>,
    #[serde(rename = "consensus_img", default, skip_serializing_if = "Option::is_none")]
    pub consensus_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,

    #[serde(rename = "beneficiary_address", default, skip_serializing_if = "Option::is_none")]
    pub beneficiary: Option<Address>,

    #[serde(rename = "l2_wallets", default)]
    pub fund_wallets: Vec<FundWallet>,

    pub step: RollupStep,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Bumped by the store on every successful update.
    #[serde(default)]
    pub revision: u64,
}

impl Rollup {
    /// A fresh record at [`RollupStep::Init`].
    pub fn new(name: impl Into<String>, chain_id: u64, l1: L1Network) -> Self {
        Self {
            name: name.into(),
            chain_id,
            l1,
            l1_rollup: None,
            l1_bridge: None,
            l1_escrow: None,
            l1_address_manager: None,
            l2_rollup: None,
            l2_bridge: None,
            l2_escrow: None,
            l2_address_manager: None,
            execution_image: None,
            consensus_image: None,
            rpc_url: None,
            beneficiary: None,
            fund_wallets: Vec::new(),
            step: RollupStep::Init,
            status: STATUS_INITIALIZING.to_string(),
            last_error: None,
            created_at: None,
            revision: 0,
        }
    }

    pub fn with_fund_wallets(mut self, fund_wallets: Vec<FundWallet>) -> Self {
        self.fund_wallets = fund_wallets;
        self
    }

    pub fn with_beneficiary(mut self, beneficiary: Option<Address>) -> Self {
        self.beneficiary = beneficiary;
        self
    }

    /// Fields that must be populated before the record may be marked online.
    pub fn missing_online_fields(&self) -> Vec<&'static str> {
        let addresses = [
            ("l1_rollup", self.l1_rollup),
            ("l1_bridge", self.l1_bridge),
            ("l1_escrow", self.l1_escrow),
            ("l1_address_manager", self.l1_address_manager),
            ("l2_rollup", self.l2_rollup),
            ("l2_bridge", self.l2_bridge),
            ("l2_escrow", self.l2_escrow),
            ("l2_address_manager", self.l2_address_manager),
        ];
        let images = [
            ("execution_img", &self.execution_image),
            ("consensus_img", &self.consensus_image),
        ];

        addresses
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(field, _)| *field)
            .chain(
                images
                    .iter()
                    .filter(|(_, value)| value.as_deref().is_none_or(str::is_empty))
                    .map(|(field, _)| *field),
            )
            .collect()
    }

    /// Checks that `next` is a legal successor of the stored record `self`.
    pub fn verify_transition(&self, next: &Rollup) -> Result<(), String> {
        if next.chain_id != self.chain_id {
            return Err(format!(
                "chain id is immutable ({} -> {})",
                self.chain_id, next.chain_id
            ));
        }
        if next.step < self.step {
            return Err(format!("step may not regress ({} -> {})", self.step, next.step));
        }

        write_once("l1_rollup", &self.l1_rollup, &next.l1_rollup)?;
        write_once("l1_bridge", &self.l1_bridge, &next.l1_bridge)?;
        write_once("l1_escrow", &self.l1_escrow, &next.l1_escrow)?;
        write_once("l1_address_manager", &self.l1_address_manager, &next.l1_address_manager)?;
        write_once("l2_rollup", &self.l2_rollup, &next.l2_rollup)?;
        write_once("l2_bridge", &self.l2_bridge, &next.l2_bridge)?;
        write_once("l2_escrow", &self.l2_escrow, &next.l2_escrow)?;
        write_once("l2_address_manager", &self.l2_address_manager, &next.l2_address_manager)?;
        write_once("execution_img", &self.execution_image, &next.execution_image)?;
        write_once("consensus_img", &self.consensus_image, &next.consensus_image)?;
        write_once("created_at", &self.created_at, &next.created_at)?;

        if next.step == RollupStep::Online {
            let missing = next.missing_online_fields();
            if !missing.is_empty() {
                return Err(format!("cannot go online without {}", missing.join(", ")));
            }
        }

        Ok(())
    }

    /// Record an L1 address group, refusing to replace a value with a different one.
    pub fn set_l1_addresses(&mut self, addresses: &crate::L1Addresses) -> Result<(), String> {
        assign_once("l1_rollup", &mut self.l1_rollup, addresses.rollup)?;
        assign_once("l1_bridge", &mut self.l1_bridge, addresses.bridge)?;
        assign_once("l1_escrow", &mut self.l1_escrow, addresses.escrow)?;
        assign_once(
            "l1_address_manager",
            &mut self.l1_address_manager,
            addresses.address_manager,
        )
    }

    /// Record the fixed L2 predeploys.
    pub fn set_l2_predeploys(&mut self) -> Result<(), String> {
        assign_once("l2_rollup", &mut self.l2_rollup, L2_ROLLUP)?;
        assign_once("l2_bridge", &mut self.l2_bridge, L2_BRIDGE)?;
        assign_once("l2_escrow", &mut self.l2_escrow, L2_ESCROW)?;
        assign_once("l2_address_manager", &mut self.l2_address_manager, L2_ADDRESS_MANAGER)
    }

    /// Move to `step`, never backwards.
    pub fn advance(&mut self, step: RollupStep, status: &str) {
        self.step = self.step.max(step);
        self.status = status.to_string();
        self.last_error = None;
    }
}

fn write_once<T: PartialEq + std::fmt::Debug>(
    field: &str,
    stored: &Option<T>,
    next: &Option<T>,
) -> Result<(), String> {
    match (stored, next) {
        (Some(old), Some(new)) if old != new => Err(format!(
            "{field} is write-once ({old:?} -> {new:?})"
        )),
        (Some(_), None) => Err(format!("{field} is write-once and may not be cleared")),
        _ => Ok(()),
    }
}

fn assign_once<T: PartialEq + std::fmt::Debug + Copy>(
    field: &str,
    slot: &mut Option<T>,
    value: T,
) -> Result<(), String> {
    match slot {
        Some(existing) if *existing != value => Err(format!(
            "{field} already set to {existing:?}, refusing {value:?}"
        )),
        _ => {
            *slot = Some(value);
            Ok(())
        }
    }
}

/// Rollup names end up in file names, compose project names and image tags.
pub fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        anyhow::bail!("rollup name must be 1 to {MAX_NAME_LEN} characters, got {}", name.len());
    }
    if name.starts_with('-') || name.ends_with('-') {
        anyhow::bail!("rollup name {name:?} may not start or end with '-'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        anyhow::bail!("rollup name {name:?} contains invalid character {c:?}");
    }
    Ok(())
}

/// Parse a wei amount given as a decimal string.
pub fn parse_wei(raw: &str) -> anyhow::Result<U256> {
    U256::from_str_radix(raw.trim(), 10).context(format!("invalid wei amount {raw:?}"))
}
