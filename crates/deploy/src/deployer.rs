//! L1 contract deployment.

use std::{collections::BTreeMap, path::Path};

use alloy_core::primitives::Address;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{
    CommandRunner, DeploymentRegistry, FileStore, FundWallet, L1Addresses, Rollup, RollupConfig,
    RollupError, RollupResult, RollupStep, ShellCommand, STATUS_L1_DEPLOYED, ROLLUP_VERSION,
    deployment_hash::{DEPLOYMENT_VERSION_FILE, DeploymentFingerprint, DeploymentVersion},
};

/// Hardhat task deploying the rollup contract set.
pub const DEPLOY_TASK: &str = "deploy_rollup_contracts";

/// Reject funding lists that would silently overwrite each other or the admin premint.
pub fn validate_fund_wallets(admin: Address, wallets: &[FundWallet]) -> RollupResult<()> {
    let mut seen = std::collections::HashSet::with_capacity(wallets.len());
    for wallet in wallets {
        if wallet.address == admin {
            return Err(RollupError::InvalidRequest(format!(
                "fund wallet {} is the admin address, which already receives the admin premint",
                wallet.address
            )));
        }
        if !seen.insert(wallet.address) {
            return Err(RollupError::InvalidRequest(format!(
                "fund wallet {} is listed more than once",
                wallet.address
            )));
        }
    }
    Ok(())
}

/// Merge the admin premint with the funding list.
pub fn premint_accounts(
    admin: Address,
    admin_premint_wei: &str,
    wallets: &[FundWallet],
) -> RollupResult<BTreeMap<String, String>> {
    validate_fund_wallets(admin, wallets)?;
    let mut accounts = BTreeMap::from([(admin.to_string(), admin_premint_wei.to_string())]);
    accounts.extend(
        wallets
            .iter()
            .map(|w| (w.address.to_string(), w.amount_wei.to_string())),
    );
    Ok(accounts)
}

/// Drives the contracts package to deploy a rollup's L1 contracts.
pub struct ContractDeployer<'a, R> {
    pub runner: &'a R,
    pub config: &'a RollupConfig,
    pub registry: &'a DeploymentRegistry,
}

impl<'a, R: CommandRunner> ContractDeployer<'a, R> {
    pub fn new(runner: &'a R, config: &'a RollupConfig, registry: &'a DeploymentRegistry) -> Self {
        Self {
            runner,
            config,
            registry,
        }
    }

    fn admin_address(&self) -> RollupResult<Address> {
        self.config
            .admin
            .private_key
            .address()
            .map_err(|e| RollupError::Config(format!("admin.private_key: {e:#}")))
    }

    pub fn fingerprint(&self, rollup: &Rollup) -> RollupResult<DeploymentFingerprint> {
        let admin = self.admin_address()?;
        Ok(DeploymentFingerprint {
            l1_chain_id: rollup.l1.chain_id,
            l2_chain_id: rollup.chain_id,
            l1_rpc_url: rollup.l1.public_rpc.clone(),
            rollup_version: ROLLUP_VERSION,
            deployer_address: admin.to_string(),
            premint: premint_accounts(admin, &self.config.admin.premint_wei, &rollup.fund_wallets)?,
        })
    }

    /// The hardhat invocation for `rollup`.
    pub fn deploy_command(&self, rollup: &Rollup) -> RollupResult<ShellCommand> {
        let fingerprint = self.fingerprint(rollup)?;
        let premint = serde_json::to_string(&fingerprint.premint)
            .map_err(|e| RollupError::Internal(e.into()))?;

        Ok(ShellCommand::new("npx")
            .args(["hardhat", DEPLOY_TASK])
            .arg("--l1-rpc-url")
            .arg(&rollup.l1.public_rpc)
            .arg("--l2-chain-id")
            .arg(rollup.chain_id.to_string())
            .arg("--rollup-version")
            .arg(ROLLUP_VERSION.to_string())
            .arg("--l1-deployer-private-key")
            .secret_arg(self.config.admin.private_key.to_prefixed_hex())
            .arg("--l2-deployer-address")
            .arg(fingerprint.deployer_address)
            .arg("--l2-premint-accounts")
            .arg(premint)
            .arg("--download-artifacts")
            .arg("true")
            .current_dir(&self.config.paths.contracts_dir))
    }

    /// True if `build_dir` records a deployment with the same fingerprint and its results
    /// are still present.
    fn already_deployed(&self, rollup: &Rollup, build_dir: &Path, hash: &str) -> RollupResult<bool> {
        let marker = DeploymentVersion::load_from_file(&build_dir.join(DEPLOYMENT_VERSION_FILE))?;
        match marker {
            Some(version) if version.config_hash == hash => {
                match self.registry.contracts_for(rollup.l1.chain_id, rollup.chain_id) {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(version) => {
                tracing::info!(
                    rollup = %rollup.name,
                    previous = %version.config_hash,
                    current = %hash,
                    "Deployment parameters changed, redeploying"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Deploy the contracts, copy the resulting addresses into `rollup` and commit
    /// [`RollupStep::DeployedOnL1`].
    ///
    /// On failure nothing is committed and the record keeps its previous step.
    pub async fn deploy(
        &self,
        rollup: &mut Rollup,
        store: &FileStore,
        build_dir: &Path,
        cancel: &CancellationToken,
    ) -> RollupResult<()> {
        let hash = self.fingerprint(rollup)?.compute_hash()?;
        std::fs::create_dir_all(build_dir).map_err(|e| {
            RollupError::Internal(anyhow::Error::new(e).context(format!(
                "Failed to create build directory {}",
                build_dir.display()
            )))
        })?;

        if self.already_deployed(rollup, build_dir, &hash)? {
            tracing::info!(rollup = %rollup.name, "L1 contracts already deployed, skipping deployment");
        } else {
            tracing::info!(
                rollup = %rollup.name,
                l1 = %rollup.l1.name,
                l2_chain_id = rollup.chain_id,
                "Deploying L1 contracts..."
            );
            let install = ShellCommand::new("yarn")
                .arg("install")
                .current_dir(&self.config.paths.contracts_dir);
            self.runner.run(&install, cancel).await?;
            self.runner.run(&self.deploy_command(rollup)?, cancel).await?;

            DeploymentVersion::new(hash).save_to_file(&build_dir.join(DEPLOYMENT_VERSION_FILE))?;
        }

        let contracts = self
            .registry
            .contracts_for(rollup.l1.chain_id, rollup.chain_id)?;
        let l1 = L1Addresses::from(&contracts.l1_proxies);

        let invariant = |reason: String| RollupError::InvariantViolation {
            name: rollup.name.clone(),
            reason,
        };
        let mut next = rollup.clone();
        next.set_l1_addresses(&l1).map_err(invariant)?;
        next.set_l2_predeploys().map_err(invariant)?;
        next.created_at.get_or_insert_with(Utc::now);
        next.advance(RollupStep::DeployedOnL1, STATUS_L1_DEPLOYED);

        store.update(&mut next)?;
        *rollup = next;

        tracing::info!(
            rollup = %rollup.name,
            l1_rollup = %l1.rollup,
            l1_bridge = %l1.bridge,
            l1_escrow = %l1.escrow,
            l1_address_manager = %l1.address_manager,
            "L1 contracts deployed"
        );
        Ok(())
    }
}
