//! The rollup lifecycle state machine.
//!
//! ```text
//! Init -> DeployedOnL1 -> BuildExecutionImage -> BuildSequencerImage -> WaitOnline -> Online
//! ```
//!
//! Every transition is committed to the store before the next stage starts, so a failed
//! or cancelled pipeline can be resumed from its last committed step.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use alloy_core::primitives::Address;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::{
    ArtifactBuilder, CommandRunner, ContractDeployer, DeploymentRegistry, FileStore, FundWallet,
    GenesisProbe, L2RpcClient, NetworkLauncher, Rollup, RollupConfig, RollupDirs, RollupError,
    RollupResult, RollupStep, STATUS_CONSENSUS_IMAGE_DONE, STATUS_DEPLOYED, STATUS_ERROR,
    STATUS_EXECUTION_IMAGE_DONE, STATUS_RUNNING, TokioCommandRunner, TrafficGenerator,
    validate_fund_wallets, validate_name,
};

/// Parameters of a new rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRollupRequest {
    pub name: String,
    /// Picked at random inside the configured range when absent.
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(rename = "l2_wallets", default)]
    pub fund_wallets: Vec<FundWallet>,
    #[serde(rename = "beneficiary_address", default)]
    pub beneficiary: Option<Address>,
}

impl CreateRollupRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain_id: None,
            fund_wallets: Vec::new(),
            beneficiary: None,
        }
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn with_fund_wallets(mut self, fund_wallets: Vec<FundWallet>) -> Self {
        self.fund_wallets = fund_wallets;
        self
    }
}

/// One async mutex per rollup name; contention is reported instead of waited on.
#[derive(Debug, Default)]
struct RollupLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RollupLocks {
    fn acquire(&self, name: &str) -> RollupResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only referenced by the map belong to finished operations.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(name.to_string()).or_default().clone()
        };
        lock.try_lock_owned()
            .map_err(|_| RollupError::Busy(name.to_string()))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Sequences deployment, builds and launch of rollups and persists every transition.
pub struct RollupManager<R, P> {
    config: RollupConfig,
    store: FileStore,
    registry: DeploymentRegistry,
    runner: Arc<R>,
    probe: P,
    locks: RollupLocks,
    traffic: TrafficGenerator,
}

impl RollupManager<TokioCommandRunner, L2RpcClient> {
    /// Manager running real commands and probing nodes over HTTP.
    pub fn open(config: RollupConfig) -> RollupResult<Self> {
        Self::new(config, TokioCommandRunner, L2RpcClient::new()?)
    }
}

impl<R: CommandRunner + 'static, P: GenesisProbe> RollupManager<R, P> {
    pub fn new(config: RollupConfig, runner: R, probe: P) -> RollupResult<Self> {
        config.validate()?;
        let store = FileStore::open(&config.paths.db_dir)?;
        let registry = DeploymentRegistry::new(config.paths.deployments_dir());
        Ok(Self {
            config,
            store,
            registry,
            runner: Arc::new(runner),
            probe,
            locks: RollupLocks::default(),
            traffic: TrafficGenerator::new(),
        })
    }

    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn traffic(&self) -> &TrafficGenerator {
        &self.traffic
    }

    pub fn dirs(&self, name: &str) -> RollupDirs {
        RollupDirs::new(&self.config.paths.build_dir, name)
    }

    /// Endpoint under which an online rollup is reachable.
    pub fn public_rpc_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.node.public_host, self.config.node.base_port
        )
    }

    fn deployer(&self) -> ContractDeployer<'_, R> {
        ContractDeployer::new(self.runner.as_ref(), &self.config, &self.registry)
    }

    fn builder(&self) -> ArtifactBuilder<'_, R> {
        ArtifactBuilder::new(self.runner.as_ref(), &self.config, &self.registry)
    }

    fn launcher(&self) -> NetworkLauncher<'_, R, P> {
        NetworkLauncher::new(self.runner.as_ref(), &self.probe)
    }

    fn pick_chain_id(&self, taken: &[u64]) -> RollupResult<u64> {
        let (min, max) = (self.config.min_chain_id, self.config.max_chain_id);
        let mut rng = rand::rng();
        for _ in 0..64 {
            let candidate = rng.random_range(min..=max);
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
        }
        (min..=max)
            .find(|id| !taken.contains(id))
            .ok_or_else(|| RollupError::InvalidRequest(format!("no free chain id in [{min}, {max}]")))
    }

    fn validate_request(&self, request: &CreateRollupRequest) -> RollupResult<()> {
        validate_name(&request.name).map_err(|e| RollupError::InvalidRequest(format!("{e:#}")))?;

        let admin = self
            .config
            .admin
            .private_key
            .address()
            .map_err(|e| RollupError::Config(format!("admin.private_key: {e:#}")))?;
        validate_fund_wallets(admin, &request.fund_wallets)?;

        if let Some(id) = request.chain_id {
            let (min, max) = (self.config.min_chain_id, self.config.max_chain_id);
            if !(min..=max).contains(&id) {
                return Err(RollupError::InvalidRequest(format!(
                    "chain id {id} outside of [{min}, {max}]"
                )));
            }
        }
        Ok(())
    }

    /// The initial record for `request`, given the chain ids already in the store.
    fn new_record(
        &self,
        request: &CreateRollupRequest,
        existing: &[(String, u64)],
    ) -> RollupResult<Rollup> {
        let chain_id = match request.chain_id {
            Some(id) => id,
            None => {
                let taken: Vec<u64> = existing.iter().map(|(_, id)| *id).collect();
                self.pick_chain_id(&taken)?
            }
        };
        Ok(Rollup::new(&request.name, chain_id, self.config.l1.clone())
            .with_fund_wallets(request.fund_wallets.clone())
            .with_beneficiary(request.beneficiary))
    }

    fn commit(&self, rollup: &mut Rollup, mut next: Rollup) -> RollupResult<()> {
        self.store.update(&mut next)?;
        *rollup = next;
        tracing::info!(
            rollup = %rollup.name,
            step = %rollup.step,
            status = %rollup.status,
            "Rollup step committed"
        );
        Ok(())
    }

    fn check_cancelled(cancel: &CancellationToken) -> RollupResult<()> {
        if cancel.is_cancelled() {
            return Err(RollupError::Cancelled);
        }
        Ok(())
    }

    /// Start the network described by the built images and commit `WaitOnline`.
    async fn launch(&self, rollup: &mut Rollup, cancel: &CancellationToken) -> RollupResult<()> {
        let dirs = self.dirs(&rollup.name);
        self.builder().render_rollup_templates(rollup, &dirs.root)?;
        self.launcher().start(&dirs.root, cancel).await?;

        let mut next = rollup.clone();
        next.advance(RollupStep::WaitOnline, STATUS_DEPLOYED);
        self.commit(rollup, next)
    }

    /// Wait for genesis and commit `Online` with the public RPC url.
    async fn go_online(&self, rollup: &mut Rollup, cancel: &CancellationToken) -> RollupResult<()> {
        let rpc_url = self.public_rpc_url();
        self.launcher()
            .wait_until_live(&rpc_url, &self.config.liveness, cancel)
            .await?;

        let mut next = rollup.clone();
        next.rpc_url = Some(rpc_url);
        next.advance(RollupStep::Online, STATUS_RUNNING);
        self.commit(rollup, next)
    }

    /// Run every stage the record has not committed yet.
    async fn drive(&self, rollup: &mut Rollup, cancel: &CancellationToken) -> RollupResult<()> {
        let dirs = self.dirs(&rollup.name);
        let images = &self.config.images;

        if rollup.step < RollupStep::DeployedOnL1 {
            Self::check_cancelled(cancel)?;
            self.deployer()
                .deploy(rollup, &self.store, &dirs.root, cancel)
                .await?;
        }

        if rollup.step < RollupStep::BuildExecutionImage {
            Self::check_cancelled(cancel)?;
            let dest = dirs.execution();
            let builder = self.builder();
            builder.render_node_templates(rollup, &dest)?;
            let image = builder
                .build_execution_image(&images.tag, images.push, &dest, rollup, cancel)
                .await?;

            let mut next = rollup.clone();
            next.execution_image = Some(image);
            next.advance(RollupStep::BuildExecutionImage, STATUS_EXECUTION_IMAGE_DONE);
            self.commit(rollup, next)?;
        }

        if rollup.step < RollupStep::BuildSequencerImage {
            Self::check_cancelled(cancel)?;
            let dest = dirs.consensus();
            let builder = self.builder();
            builder.render_consensus_templates(rollup, &dest)?;
            let image = builder
                .build_consensus_image(&images.tag, images.push, &dest, rollup, cancel)
                .await?;

            let mut next = rollup.clone();
            next.consensus_image = Some(image);
            next.advance(RollupStep::BuildSequencerImage, STATUS_CONSENSUS_IMAGE_DONE);
            self.commit(rollup, next)?;
        }

        if rollup.step < RollupStep::WaitOnline {
            Self::check_cancelled(cancel)?;
            self.launch(rollup, cancel).await?;
        }

        if rollup.step < RollupStep::Online {
            Self::check_cancelled(cancel)?;
            self.go_online(rollup, cancel).await?;
        }

        Ok(())
    }

    /// Best effort: the pipeline error is what the caller sees.
    fn record_failure(&self, name: &str, err: &RollupError) {
        let recorded = self.store.get(name).and_then(|mut stored| {
            stored.status = STATUS_ERROR.to_string();
            stored.last_error = Some(err.to_string());
            self.store.update(&mut stored)
        });
        if let Err(e) = recorded {
            tracing::warn!(rollup = %name, error = %e, "Failed to record pipeline failure");
        }
    }

    async fn drive_and_record(
        &self,
        rollup: &mut Rollup,
        cancel: &CancellationToken,
    ) -> RollupResult<()> {
        let result = self.drive(rollup, cancel).await;
        if let Err(e) = &result {
            tracing::error!(rollup = %rollup.name, step = %rollup.step, error = %e, "Rollup pipeline failed");
            self.record_failure(&rollup.name, e);
        }
        result
    }

    fn start_traffic(&self, rollup: &Rollup) {
        if !self.config.traffic.enabled {
            return;
        }
        let Some(rpc_url) = &rollup.rpc_url else {
            return;
        };
        if let Err(e) = self.traffic.start(
            self.runner.clone(),
            &rollup.name,
            rpc_url,
            &self.config.admin.private_key,
            &self.config.traffic,
        ) {
            tracing::warn!(rollup = %rollup.name, error = %e, "Failed to start traffic generator");
        }
    }

    /// Provision a new rollup end to end.
    ///
    /// The record is created at [`RollupStep::Init`] before any external command runs; on
    /// failure it keeps its last committed step and can be continued with
    /// [`Self::resume_rollup`].
    pub async fn create_rollup(
        &self,
        request: CreateRollupRequest,
        cancel: &CancellationToken,
    ) -> RollupResult<Rollup> {
        let _guard = self.locks.acquire(&request.name)?;
        self.validate_request(&request)?;

        let mut rollup = self
            .store
            .create_unique(|existing| self.new_record(&request, existing))?;
        tracing::info!(rollup = %rollup.name, chain_id = rollup.chain_id, l1 = %rollup.l1.name, "Rollup created");

        self.drive_and_record(&mut rollup, cancel).await?;
        self.start_traffic(&rollup);
        Ok(rollup)
    }

    /// Continue a pipeline from its last committed step.
    pub async fn resume_rollup(&self, name: &str, cancel: &CancellationToken) -> RollupResult<Rollup> {
        let _guard = self.locks.acquire(name)?;
        let mut rollup = self.store.get(name)?;
        if rollup.step == RollupStep::Online {
            tracing::info!(rollup = %name, "Rollup already online, nothing to resume");
            return Ok(rollup);
        }

        tracing::info!(rollup = %name, step = %rollup.step, "Resuming rollup pipeline");
        self.drive_and_record(&mut rollup, cancel).await?;
        self.start_traffic(&rollup);
        Ok(rollup)
    }

    /// Relaunch the network of a provisioned rollup, e.g. after a host restart.
    pub async fn run_rollup(&self, name: &str, cancel: &CancellationToken) -> RollupResult<Rollup> {
        let _guard = self.locks.acquire(name)?;
        let mut rollup = self.store.get(name)?;
        if rollup.step < RollupStep::BuildSequencerImage {
            return Err(RollupError::NotReady {
                name: name.to_string(),
                step: rollup.step.to_string(),
                required: RollupStep::BuildSequencerImage.to_string(),
            });
        }

        let result = async {
            self.launch(&mut rollup, cancel).await?;
            self.go_online(&mut rollup, cancel).await
        }
        .await;
        if let Err(e) = &result {
            self.record_failure(name, e);
        }
        result?;

        self.start_traffic(&rollup);
        Ok(rollup)
    }

    /// Stop the network, then remove the record.
    ///
    /// If stopping fails the record is kept so the deletion can be retried. The build
    /// directory stays, which lets a re-created rollup reuse its deployment.
    pub async fn delete_rollup(&self, name: &str, cancel: &CancellationToken) -> RollupResult<()> {
        let _guard = self.locks.acquire(name)?;
        self.store.get(name).map_err(|e| match e {
            RollupError::NotFound(_) => RollupError::MissingForWrite(name.to_string()),
            other => other,
        })?;

        if self.traffic.stop(name) {
            tracing::info!(rollup = %name, "Traffic generator stopped");
        }

        let dirs = self.dirs(name);
        if dirs.compose_file().is_file() {
            self.launcher().stop(&dirs.root, cancel).await?;
        } else {
            tracing::debug!(rollup = %name, "No compose descriptor, nothing to stop");
        }

        self.store.delete(name)?;
                tracing::info!(rollup = %name, "Rollup deleted");
        Ok(())
    }

    /// Send transfers to an online rollup until `cancel` fires.
    ///
    /// Runs regardless of `traffic.enabled`; that flag only controls the job started after
    /// create, resume and run.
    pub async fn generate_traffic(&self, name: &str, cancel: &CancellationToken) -> RollupResult<()> {
        let rollup = self.store.get(name)?;
        let rpc_url = match (&rollup.rpc_url, rollup.step) {
            (Some(rpc_url), RollupStep::Online) => rpc_url.clone(),
            _ => {
                return Err(RollupError::NotReady {
                    name: name.to_string(),
                    step: rollup.step.to_string(),
                    required: RollupStep::Online.to_string(),
                });
            }
        };

        self.traffic.start(
            self.runner.clone(),
            name,
            &rpc_url,
            &self.config.admin.private_key,
            &self.config.traffic,
        )?;
        tracing::info!(rollup = %name, rpc_url = %rpc_url, "Generating traffic until cancelled");
        cancel.cancelled().await;
        self.traffic.stop(name);
        Ok(())
    }

    pub fn get_rollup(&self, name: &str) -> RollupResult<Rollup> {
        self.store.get(name)
    }

    pub fn list_rollups(&self) -> RollupResult<Vec<Rollup>> {
        self.store.list()
    }
}
