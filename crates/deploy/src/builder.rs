//! Build artifacts: rendered node assets, docker images and the compose descriptor.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::primitives::Address;
use anyhow::Context;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    CommandRunner, DeployContext, DeploymentRegistry, L2_BRIDGE, L2_ESCROW, L2_ROLLUP, NodeKey,
    Rollup, RollupConfig, RollupError, RollupResult, ShellCommand, template,
};

pub const EXECUTION_COMPONENT: &str = "execution-client";
pub const CONSENSUS_COMPONENT: &str = "consensus-client";

/// Base image the execution Dockerfile builds on.
pub const EXECUTION_BASE_IMAGE: &str = "rollup/execution-client-base";

pub const EXECUTION_DOCKERFILE: &str = "Dockerfile.execution.release";
/// Rendered from `Dockerfile_prod_tmpl` in the consensus templates.
pub const CONSENSUS_DOCKERFILE: &str = "Dockerfile_prod";
pub const COMPOSE_FILE: &str = "docker-compose.yaml";
pub const GENESIS_FILE: &str = "l2_genesis.json";

/// Directory name under which deployment data of a rollup lives inside the images.
pub const DEPLOYMENTS_DIR: &str = "deployments";

const EXECUTION_DOCKERFILE_TEMPLATE: &str = r#"FROM {{ .BaseImage }}:{{ .Version }}

COPY init_l2_geth.sh /init_l2_geth.sh
COPY l2_genesis.json /l2_genesis.json
ENTRYPOINT ["/init_l2_geth.sh"]
"#;

/// Container-side ports of the execution client.
const CONTAINER_HTTP_PORT: u16 = 8545;
const CONTAINER_WS_PORT: u16 = 8546;
const CONTAINER_AUTH_PORT: u16 = 8551;

const HOST_GATEWAY: &str = "host.docker.internal:host-gateway";

/// `<registry>/<component>:<chain name>-<tag>`.
pub fn image_url(registry: &str, component: &str, chain_name: &str, tag: &str) -> String {
    format!("{registry}/{component}:{chain_name}-{tag}")
}

fn docker_http(port: u16) -> String {
    format!("http://host.docker.internal:{port}")
}

fn docker_ws(port: u16) -> String {
    format!("ws://host.docker.internal:{port}")
}

/// Host ports and service name of one execution replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstancePorts {
    pub service_name: String,
    pub l2_http_port: u16,
    pub l2_ws_port: u16,
    pub l2_auth_rpc_port: u16,
}

impl InstancePorts {
    /// Replica `index` takes the three ports starting at `base_port + 3 * index`.
    pub fn for_replica(rollup_name: &str, base_port: u16, index: u16) -> Self {
        let first = base_port + 3 * index;
        Self {
            service_name: format!("{rollup_name}-{index}-node"),
            l2_http_port: first,
            l2_ws_port: first + 1,
            l2_auth_rpc_port: first + 2,
        }
    }

    pub fn all(rollup_name: &str, base_port: u16, replicas: u16) -> Vec<Self> {
        (0..replicas)
            .map(|i| Self::for_replica(rollup_name, base_port, i))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeTemplateData {
    pub chain_id: u64,
    pub chain_name: String,
    pub deployment_chain_name_dir: String,
    pub bootnode_key_hex: String,
    /// Node id of the bootnode.
    pub bootnode_address: String,
    pub instances: Vec<InstancePorts>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncInstance {
    pub service_name: String,
    pub l1_rpc_url: String,
    pub l1_ws_url: String,
    pub l2_rpc_url: String,
    pub l2_ws_url: String,
    pub l2_engine_api_url: String,
}

/// Data for the consensus templates. Contains private keys: never log it.
#[derive(Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsensusTemplateData {
    pub chain_id: u64,
    pub chain_name: String,
    pub deployment_chain_name_dir: String,
    pub propose_beneficiary: String,
    pub proposer_priv: String,
    pub prover_priv: String,
    pub relay_l1_priv: String,
    pub relay_l2_priv: String,
    pub l1_rpc_url: String,
    pub l1_ws_url: String,
    pub l2_rpc_url: String,
    pub l2_ws_url: String,
    pub l2_engine_api_url: String,
    pub l1_rollup: String,
    pub l1_bridge: String,
    pub l1_escrow: String,
    pub l2_rollup: String,
    pub l2_bridge: String,
    pub l2_escrow: String,
    pub relay_db_url: String,
    pub consensus_base_version: String,
    pub sync_instances: Vec<SyncInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeService {
    pub image: String,
    pub container_name: String,
    pub restart: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub extra_hosts: Vec<String>,
}

/// The compose descriptor. Serialized as JSON, which compose reads as YAML.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposeFile {
    pub name: String,
    pub services: BTreeMap<String, ComposeService>,
    pub volumes: BTreeMap<String, BTreeMap<String, String>>,
}

/// Per-rollup build layout: `<build_dir>/<name>/{execution,consensus}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupDirs {
    pub root: PathBuf,
}

impl RollupDirs {
    pub fn new(build_dir: &Path, rollup_name: &str) -> Self {
        Self {
            root: build_dir.join(rollup_name),
        }
    }

    pub fn execution(&self) -> PathBuf {
        self.root.join("execution")
    }

    pub fn consensus(&self) -> PathBuf {
        self.root.join("consensus")
    }

    pub fn compose_file(&self) -> PathBuf {
        self.root.join(COMPOSE_FILE)
    }
}

/// Produces node assets and images from templates plus the rollup record.
pub struct ArtifactBuilder<'a, R> {
    pub runner: &'a R,
    pub config: &'a RollupConfig,
    pub registry: &'a DeploymentRegistry,
}

impl<'a, R: CommandRunner> ArtifactBuilder<'a, R> {
    pub fn new(runner: &'a R, config: &'a RollupConfig, registry: &'a DeploymentRegistry) -> Self {
        Self {
            runner,
            config,
            registry,
        }
    }

    fn is_local_cluster(&self) -> bool {
        self.config.context == DeployContext::Microk8s
    }

    pub fn instances(&self, rollup: &Rollup) -> Vec<InstancePorts> {
        InstancePorts::all(&rollup.name, self.config.node.base_port, self.config.node.replicas)
    }

    pub fn node_template_data(&self, rollup: &Rollup) -> RollupResult<NodeTemplateData> {
        let bootnode = NodeKey::from_private_key(&self.config.node.bootnode_key)
            .map_err(|e| RollupError::Config(format!("node.bootnode_key: {e:#}")))?;
        Ok(NodeTemplateData {
            chain_id: rollup.chain_id,
            chain_name: rollup.name.clone(),
            deployment_chain_name_dir: format!("{DEPLOYMENTS_DIR}/{}", rollup.name),
            bootnode_key_hex: bootnode.private_key,
            bootnode_address: bootnode.node_id,
            instances: self.instances(rollup),
        })
    }

    /// Render the execution templates into `dest` and write the rollup's genesis next to
    /// them. A missing genesis entry is an error: a node started without it is broken.
    pub fn render_node_templates(&self, rollup: &Rollup, dest: &Path) -> RollupResult<()> {
        let genesis = self.registry.genesis_for(rollup.l1.chain_id, rollup.chain_id)?;
        let data = self.node_template_data(rollup)?;

        template::render_dir(&self.config.paths.template_dir.join("execution"), dest, &data)?;

        let genesis_path = dest.join(GENESIS_FILE);
        let content = serde_json::to_string_pretty(&genesis).context("Failed to serialize genesis")?;
        std::fs::write(&genesis_path, content)
            .context(format!("Failed to write {}", genesis_path.display()))?;

        tracing::info!(rollup = %rollup.name, dest = %dest.display(), "Rendered node templates");
        Ok(())
    }

    fn build_command(&self, dockerfile: &Path, image: &str, context_dir: &Path, push: bool) -> ShellCommand {
        let mut cmd = ShellCommand::new("docker")
            .args(["buildx", "build", "--builder", self.config.images.builder.as_str()])
            .env("DOCKER_BUILDKIT", "1");

        if self.is_local_cluster() {
            cmd = cmd.arg("--load");
        } else {
            cmd = cmd.args([
                "--output=type=registry,registry.insecure=false",
                "--platform",
                "linux/amd64,linux/arm64",
            ]);
            if push {
                cmd = cmd.arg("--push");
            }
        }

        cmd.arg("-f")
            .arg(dockerfile.display().to_string())
            .arg("-t")
            .arg(image)
            .arg(context_dir.display().to_string())
    }

    /// Load a locally built image into the single-node cluster's image store.
    async fn import_into_cluster(
        &self,
        image: &str,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> RollupResult<()> {
        let tarball = dir.join("image.tar");
        let tarball_arg = tarball.display().to_string();

        self.runner
            .run(
                &ShellCommand::new("docker").args(["save", image, "-o", tarball_arg.as_str()]),
                cancel,
            )
            .await?;
        let imported = self
            .runner
            .run(
                &ShellCommand::new("microk8s").args(["ctr", "image", "import", tarball_arg.as_str()]),
                cancel,
            )
            .await;

        // Best effort: a leftover tarball is only wasted disk.
        if let Err(e) = std::fs::remove_file(&tarball) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %tarball.display(), error = %e, "Failed to remove image tarball");
            }
        }

        imported?;
        tracing::info!(image = %image, "Imported image into cluster");
        Ok(())
    }

    async fn build_image(
        &self,
        dockerfile: &Path,
        image: &str,
        dir: &Path,
        push: bool,
        cancel: &CancellationToken,
    ) -> RollupResult<()> {
        tracing::info!(image = %image, dockerfile = %dockerfile.display(), "Building docker image...");
        self.runner
            .run(&self.build_command(dockerfile, image, dir, push), cancel)
            .await?;
        if self.is_local_cluster() {
            self.import_into_cluster(image, dir, cancel).await?;
        }
        tracing::info!(image = %image, "Docker image built");
        Ok(())
    }

    /// Render the execution Dockerfile into `dir`, build it and return the image reference.
    pub async fn build_execution_image(
        &self,
        tag: &str,
        push: bool,
        dir: &Path,
        rollup: &Rollup,
        cancel: &CancellationToken,
    ) -> RollupResult<String> {
        let dockerfile = dir.join(EXECUTION_DOCKERFILE);
        let content = template::render_str(
            EXECUTION_DOCKERFILE_TEMPLATE,
            &serde_json::json!({
                "BaseImage": EXECUTION_BASE_IMAGE,
                "Version": self.config.images.execution_base,
            }),
        )?;
        std::fs::write(&dockerfile, content)
            .context(format!("Failed to write {}", dockerfile.display()))?;

        let image = image_url(&self.config.images.registry, EXECUTION_COMPONENT, &rollup.name, tag);
        self.build_image(&dockerfile, &image, dir, push, cancel).await?;
        Ok(image)
    }

    pub fn consensus_template_data(&self, rollup: &Rollup) -> RollupResult<ConsensusTemplateData> {
        let (Some(l1_rollup), Some(l1_bridge), Some(l1_escrow)) =
            (rollup.l1_rollup, rollup.l1_bridge, rollup.l1_escrow)
        else {
            return Err(RollupError::InvariantViolation {
                name: rollup.name.clone(),
                reason: "consensus templates need the L1 contract addresses".to_string(),
            });
        };

        let admin_key = self.config.admin.private_key.to_prefixed_hex();
        let admin = self
            .config
            .admin
            .private_key
            .address()
            .map_err(|e| RollupError::Config(format!("admin.private_key: {e:#}")))?;
        let base_port = self.config.node.base_port;

        let sync_instances = self
            .instances(rollup)
            .into_iter()
            .enumerate()
            .map(|(i, ports)| SyncInstance {
                service_name: format!("sync-{i}"),
                l1_rpc_url: rollup.l1.internal_rpc.clone(),
                l1_ws_url: rollup.l1.internal_ws.clone(),
                l2_rpc_url: docker_http(ports.l2_http_port),
                l2_ws_url: docker_ws(ports.l2_ws_port),
                l2_engine_api_url: docker_http(ports.l2_auth_rpc_port),
            })
            .collect();

        let hex = |a: Address| a.to_string();
        Ok(ConsensusTemplateData {
            chain_id: rollup.chain_id,
            chain_name: rollup.name.clone(),
            deployment_chain_name_dir: format!("{DEPLOYMENTS_DIR}/{}", rollup.name),
            propose_beneficiary: hex(rollup.beneficiary.unwrap_or(admin)),
            proposer_priv: admin_key.clone(),
            prover_priv: admin_key.clone(),
            relay_l1_priv: admin_key.clone(),
            relay_l2_priv: admin_key,
            l1_rpc_url: rollup.l1.internal_rpc.clone(),
            l1_ws_url: rollup.l1.internal_ws.clone(),
            l2_rpc_url: docker_http(base_port),
            l2_ws_url: docker_ws(base_port + 1),
            l2_engine_api_url: docker_http(base_port + 2),
            l1_rollup: hex(l1_rollup),
            l1_bridge: hex(l1_bridge),
            l1_escrow: hex(l1_escrow),
            l2_rollup: hex(L2_ROLLUP),
            l2_bridge: hex(L2_BRIDGE),
            l2_escrow: hex(L2_ESCROW),
            relay_db_url: self.config.relay_db_url.clone(),
            consensus_base_version: self.config.images.consensus_base.clone(),
            sync_instances,
        })
    }

    pub fn render_consensus_templates(&self, rollup: &Rollup, dest: &Path) -> RollupResult<()> {
        let data = self.consensus_template_data(rollup)?;
        template::render_dir(&self.config.paths.template_dir.join("consensus"), dest, &data)?;
        tracing::info!(rollup = %rollup.name, dest = %dest.display(), "Rendered consensus templates");
        Ok(())
    }

    /// Build the consensus image from the rendered `Dockerfile_prod` in `dir`.
    pub async fn build_consensus_image(
        &self,
        tag: &str,
        push: bool,
        dir: &Path,
        rollup: &Rollup,
        cancel: &CancellationToken,
    ) -> RollupResult<String> {
        let dockerfile = dir.join(CONSENSUS_DOCKERFILE);
        if !dockerfile.is_file() {
            return Err(RollupError::NotFound(format!(
                "consensus Dockerfile {}",
                dockerfile.display()
            )));
        }
        let image = image_url(&self.config.images.registry, CONSENSUS_COMPONENT, &rollup.name, tag);
        self.build_image(&dockerfile, &image, dir, push, cancel).await?;
        Ok(image)
    }

    pub fn compose_file(&self, rollup: &Rollup) -> RollupResult<ComposeFile> {
        let (Some(execution_image), Some(consensus_image)) =
            (&rollup.execution_image, &rollup.consensus_image)
        else {
            return Err(RollupError::InvariantViolation {
                name: rollup.name.clone(),
                reason: "compose descriptor needs both images".to_string(),
            });
        };

        let mut services = BTreeMap::new();
        let mut volumes = BTreeMap::new();
        let instances = self.instances(rollup);

        for ports in &instances {
            let volume = format!("{}-data", ports.service_name);
            services.insert(
                ports.service_name.clone(),
                ComposeService {
                    image: execution_image.clone(),
                    container_name: ports.service_name.clone(),
                    restart: "unless-stopped".to_string(),
                    ports: vec![
                        format!("{}:{CONTAINER_HTTP_PORT}", ports.l2_http_port),
                        format!("{}:{CONTAINER_WS_PORT}", ports.l2_ws_port),
                        format!("{}:{CONTAINER_AUTH_PORT}", ports.l2_auth_rpc_port),
                    ],
                    volumes: vec![format!("{volume}:/data")],
                    depends_on: Vec::new(),
                    extra_hosts: vec![HOST_GATEWAY.to_string()],
                },
            );
            volumes.insert(volume, BTreeMap::new());
        }

        let consensus_name = format!("{}-consensus", rollup.name);
        let consensus_volume = format!("{consensus_name}-data");
        services.insert(
            consensus_name.clone(),
            ComposeService {
                image: consensus_image.clone(),
                container_name: consensus_name,
                restart: "unless-stopped".to_string(),
                ports: Vec::new(),
                volumes: vec![format!("{consensus_volume}:/data")],
                depends_on: instances.iter().map(|p| p.service_name.clone()).collect(),
                extra_hosts: vec![HOST_GATEWAY.to_string()],
            },
        );
        volumes.insert(consensus_volume, BTreeMap::new());

        Ok(ComposeFile {
            name: rollup.name.clone(),
            services,
            volumes,
        })
    }

    /// Write the compose descriptor binding every replica's ports to the built images.
    pub fn render_rollup_templates(&self, rollup: &Rollup, dest: &Path) -> RollupResult<PathBuf> {
        let compose = self.compose_file(rollup)?;
        std::fs::create_dir_all(dest).context(format!("Failed to create {}", dest.display()))?;
        let path = dest.join(COMPOSE_FILE);
        let content =
            serde_json::to_string_pretty(&compose).context("Failed to serialize compose file")?;
        std::fs::write(&path, content).context(format!("Failed to write {}", path.display()))?;
        tracing::info!(rollup = %rollup.name, path = %path.display(), "Rendered compose descriptor");
        Ok(path)
    }
}
