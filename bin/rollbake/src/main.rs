//! rollbake provisions L2 rollups on demand: contracts, images, network, all tracked.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Command, OutputFormat};
use rollbake_deploy::{
    ApiResponse, CommandRunner, CreateRollupRequest, GenesisProbe, PrivateKey, Rollup,
    RollupConfig, RollupError, RollupManager,
};

fn rollup_table(rollups: &[Rollup]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["name", "chain id", "step", "status", "rpc url", "last error"]);
    for rollup in rollups {
        table.add_row(vec![
            rollup.name.clone(),
            rollup.chain_id.to_string(),
            rollup.step.to_string(),
            rollup.status.clone(),
            rollup.rpc_url.clone().unwrap_or_default(),
            rollup.last_error.clone().unwrap_or_default(),
        ]);
    }
    table
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, RollupError> {
    serde_json::to_value(value)
        .context("Failed to serialize response")
        .map_err(RollupError::from)
}

async fn execute<R: CommandRunner + 'static, P: GenesisProbe>(
    manager: &RollupManager<R, P>,
    command: Command,
    cancel: &CancellationToken,
) -> Result<ApiResponse<Value>, RollupError> {
    let response = match command {
        Command::Create {
            name,
            chain_id,
            fund_wallets,
            beneficiary,
        } => {
            let request = CreateRollupRequest {
                name,
                chain_id,
                fund_wallets,
                beneficiary,
            };
            ApiResponse::with_data(to_value(&manager.create_rollup(request, cancel).await?)?)
        }
        Command::Resume { name } => {
            ApiResponse::with_data(to_value(&manager.resume_rollup(&name, cancel).await?)?)
        }
        Command::Run { name } => {
            ApiResponse::with_data(to_value(&manager.run_rollup(&name, cancel).await?)?)
        }
        Command::Traffic { name } => {
            manager.generate_traffic(&name, cancel).await?;
            ApiResponse::with_msg(format!("traffic to rollup {name} stopped"))
        }
        Command::Delete { name } => {
            manager.delete_rollup(&name, cancel).await?;
            ApiResponse::with_msg(format!("rollup {name} deleted"))
        }
        Command::Get { name } => ApiResponse::with_data(to_value(&manager.get_rollup(&name)?)?),
        Command::List { format } => {
            let rollups = manager.list_rollups()?;
            if format == OutputFormat::Table {
                println!("{}", rollup_table(&rollups));
                return Ok(ApiResponse::with_msg(format!("{} rollup(s)", rollups.len())));
            }
            ApiResponse::with_data(to_value(&rollups)?)
        }
        Command::Check => ApiResponse::with_msg("configuration is valid"),
    };
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config = RollupConfig::load(cli.config.as_deref())?;

    if let Command::Check = cli.command {
        config.check_required_tools()?;
        let mut shown = config.clone();
        shown.admin.private_key = PrivateKey::new("<redacted>");
        println!("{}", toml::to_string_pretty(&shown).context("Failed to serialize config")?);
        tracing::info!(tools = ?config.required_tools(), "Configuration is valid and all tools are installed");
        return Ok(());
    }

    config.check_required_tools()?;
    let manager = RollupManager::open(config)?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl-C, cancelling...");
            on_ctrl_c.cancel();
        }
    });

    match execute(&manager, cli.command, &cancel).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);

            // Jobs started by create, resume or run die with the runtime.
            let active = manager.traffic().active();
            if !active.is_empty() {
                tracing::info!(rollups = ?active, "Traffic generator running, press Ctrl-C to stop");
                cancel.cancelled().await;
                for name in active {
                    manager.traffic().stop(&name);
                }
            }
            Ok(())
        }
        Err(err) => {
            let (status, response) = ApiResponse::<Value>::from_error(&err);
            println!("{}", serde_json::to_string_pretty(&response)?);
            Err(anyhow::Error::new(err).context(format!("request failed with status {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::B256;
    use rollbake_deploy::{RollupResult, ShellCommand};
    use tempdir::TempDir;

    struct NoopRunner;

    impl CommandRunner for NoopRunner {
        async fn run(&self, _: &ShellCommand, _: &CancellationToken) -> RollupResult<String> {
            Ok(String::new())
        }
    }

    struct DeadProbe;

    impl GenesisProbe for DeadProbe {
        async fn genesis_hash(&self, _: &str) -> anyhow::Result<B256> {
            anyhow::bail!("unreachable")
        }
    }

    fn manager(dir: &TempDir) -> RollupManager<NoopRunner, DeadProbe> {
        let mut config = RollupConfig::default();
        config.admin.private_key =
            PrivateKey::new("0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80");
        config.paths.db_dir = dir.path().join("db");
        config.paths.build_dir = dir.path().join("build");
        RollupManager::new(config, NoopRunner, DeadProbe).unwrap()
    }

    #[tokio::test]
    async fn test_traffic_requires_online_rollup() {
        let dir = TempDir::new("rollbake-test").expect("Failed to create temp dir");
        let manager = manager(&dir);
        let cancel = CancellationToken::new();

        let traffic = || Command::Traffic {
            name: "chain-a".to_string(),
        };
        let err = execute(&manager, traffic(), &cancel).await.err().unwrap();
        assert_eq!(err.status_code(), 404);

        manager
            .store()
            .create(&Rollup::new("chain-a", 1_000_001, manager.config().l1.clone()))
            .unwrap();
        let err = execute(&manager, traffic(), &cancel).await.err().unwrap();
        assert_eq!(err.status_code(), 412);
        assert!(manager.traffic().active().is_empty());
    }

    #[tokio::test]
    async fn test_list_json_returns_records() {
        let dir = TempDir::new("rollbake-test").expect("Failed to create temp dir");
        let manager = manager(&dir);
        manager
            .store()
            .create(&Rollup::new("chain-a", 1_000_001, manager.config().l1.clone()))
            .unwrap();

        let response = execute(
            &manager,
            Command::List {
                format: OutputFormat::Json,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["data"][0]["name"], "chain-a");
    }
}
