use std::path::PathBuf;

use alloy_core::primitives::Address;
use anyhow::Context;
use clap::{Parser, Subcommand};
use rollbake_deploy::{FundWallet, parse_wei};
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum OutputFormat {
    Table,
    Json,
}

/// Parse a funding entry of the form `<address>=<wei>`.
pub fn parse_fund_wallet(raw: &str) -> anyhow::Result<FundWallet> {
    let (address, amount) = raw
        .split_once('=')
        .context(format!("Expected <address>=<wei>, got {raw}"))?;
    let address: Address = address
        .trim()
        .parse()
        .context(format!("Invalid address {address}"))?;
    Ok(FundWallet {
        address,
        amount_wei: parse_wei(amount.trim())?,
    })
}

#[derive(Parser)]
#[command(name = "rollbake")]
#[command(author, version, about = "Provision on-demand L2 rollups on top of an L1")]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "ROLLBAKE_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to a Rollbake.toml file, or to the directory containing it.
    ///
    /// Values from the environment (`ROLLBAKE_<SECTION>__<KEY>`) take precedence.
    #[arg(long, alias = "conf", env = "ROLLBAKE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a rollup and drive it until it is online.
    Create {
        /// Unique rollup name ([a-z0-9-]).
        name: String,

        /// L2 chain id. Picked at random inside the configured range if omitted.
        #[arg(long, alias = "l2")]
        chain_id: Option<u64>,

        /// Account pre-funded in genesis, as `<address>=<wei>`. May be repeated.
        #[arg(long = "fund", value_parser = parse_fund_wallet)]
        fund_wallets: Vec<FundWallet>,

        /// Fee beneficiary of the proposer. Defaults to the admin address.
        #[arg(long)]
        beneficiary: Option<Address>,
    },

    /// Continue a failed pipeline from its last committed step.
    Resume { name: String },

    /// Relaunch the network of a provisioned rollup.
    Run { name: String },

    /// Send transfers to an online rollup until interrupted.
    Traffic { name: String },

    /// Stop a rollup's network and remove its record.
    Delete { name: String },

    /// Show one rollup record.
    Get { name: String },

    /// List every rollup.
    List {
        #[arg(long, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Validate the configuration and check that the required tools are installed.
    Check,
}
