pub mod configs;
mod ports;
pub mod readiness;

use std::{collections::HashSet, fmt, time::Duration};

use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
use time::OffsetDateTime;
use tracing::warn;

use configs::{
    ConsensusParams, ConsensusSection, DaParams, DaSection, GenesisAccount, NetworkLayout,
    NetworkParams, NodeConfigFile, WalletAccount, WalletParams,
};
use ports::free_port;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Validator,
    Executor,
}

impl NodeRole {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Validator => "validator",
            Self::Executor => "executor",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Requested cluster shape, resolved into a [`GeneratedTopology`] by the
/// [`TopologyBuilder`].
#[derive(Clone, Debug, Default)]
pub struct TopologyConfig {
    pub n_validators: usize,
    pub n_executors: usize,
    pub consensus: ConsensusParams,
    pub da: DaParams,
    pub network: NetworkParams,
    pub wallet: WalletParams,
}

impl TopologyConfig {
    #[must_use]
    pub fn two_validators() -> Self {
        Self {
            n_validators: 2,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn validator_and_executor() -> Self {
        Self {
            n_validators: 1,
            n_executors: 1,
            da: DaParams {
                dispersal_factor: 2,
                replication_factor: 2,
                num_subnets: 2,
            },
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_node_numbers(n_validators: usize, n_executors: usize) -> Self {
        Self {
            n_validators,
            n_executors,
            ..Default::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("topology must contain at least one node, got 0 validators and 0 executors")]
    NoNodes,
    #[error("dispersal factor {requested} out of range 1..={nodes} for a {nodes}-node cluster")]
    DispersalOutOfRange { requested: usize, nodes: usize },
    #[error("replication factor {requested} out of range 1..={nodes} for a {nodes}-node cluster")]
    ReplicationOutOfRange { requested: usize, nodes: usize },
    #[error("host has no free ports left for node allocation")]
    PortsExhausted,
}

/// Turns a [`TopologyConfig`] into concrete per-node descriptors.
///
/// With a seed, key material and wallet funding are reproducible across
/// builds; ports always come from the OS allocator and are excluded from the
/// determinism contract.
pub struct TopologyBuilder {
    config: TopologyConfig,
    seed: Option<u64>,
    strict_da: bool,
}

impl TopologyBuilder {
    #[must_use]
    pub const fn new(config: TopologyConfig) -> Self {
        Self {
            config,
            seed: None,
            strict_da: false,
        }
    }

    #[must_use]
    pub fn with_validator_count(mut self, n_validators: usize) -> Self {
        self.config.n_validators = n_validators;
        self
    }

    #[must_use]
    pub fn with_executor_count(mut self, n_executors: usize) -> Self {
        self.config.n_executors = n_executors;
        self
    }

    #[must_use]
    pub fn with_network_layout(mut self, layout: NetworkLayout) -> Self {
        self.config.network.layout = layout;
        self
    }

    #[must_use]
    pub fn with_consensus_params(mut self, consensus: ConsensusParams) -> Self {
        self.config.consensus = consensus;
        self
    }

    #[must_use]
    pub fn with_da_params(mut self, da: DaParams) -> Self {
        self.config.da = da;
        self
    }

    #[must_use]
    pub fn with_wallet_params(mut self, wallet: WalletParams) -> Self {
        self.config.wallet = wallet;
        self
    }

    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Fail generation instead of clamping out-of-range DA factors.
    #[must_use]
    pub const fn strict_da(mut self) -> Self {
        self.strict_da = true;
        self
    }

    pub fn build(self) -> Result<GeneratedTopology, TopologyError> {
        let Self {
            mut config,
            seed,
            strict_da,
        } = self;

        let node_count = config.n_validators + config.n_executors;
        if node_count == 0 {
            return Err(TopologyError::NoNodes);
        }
        config.da = resolve_da_params(config.da, node_count, strict_da)?;

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut validators = Vec::with_capacity(config.n_validators);
        let mut executors = Vec::with_capacity(config.n_executors);
        for flat in 0..node_count {
            let mut identity = [0_u8; 32];
            rng.fill(&mut identity);
            let network_port = free_port().ok_or(TopologyError::PortsExhausted)?;
            let api_port = free_port().ok_or(TopologyError::PortsExhausted)?;
            let initial_peers = config.network.layout.initial_peer_indices(flat, node_count);
            let (role, index) = if flat < config.n_validators {
                (NodeRole::Validator, flat)
            } else {
                (NodeRole::Executor, flat - config.n_validators)
            };
            let node = GeneratedNodeConfig {
                role,
                index,
                identity,
                network_port,
                api_port,
                initial_peers,
            };
            match role {
                NodeRole::Validator => validators.push(node),
                NodeRole::Executor => executors.push(node),
            }
        }

        let wallets = (0..config.wallet.accounts)
            .map(|_| {
                let mut secret = [0_u8; 32];
                rng.fill(&mut secret);
                WalletAccount::new(hex::encode(secret), config.wallet.funds_per_account)
            })
            .collect();

        Ok(GeneratedTopology {
            config,
            validators,
            executors,
            wallets,
            chain_start: OffsetDateTime::now_utc(),
        })
    }
}

fn resolve_da_params(
    requested: DaParams,
    nodes: usize,
    strict: bool,
) -> Result<DaParams, TopologyError> {
    let mut resolved = requested;

    if !(1..=nodes).contains(&requested.dispersal_factor) {
        if strict {
            return Err(TopologyError::DispersalOutOfRange {
                requested: requested.dispersal_factor,
                nodes,
            });
        }
        resolved.dispersal_factor = requested.dispersal_factor.clamp(1, nodes);
        warn!(
            requested = requested.dispersal_factor,
            adjusted = resolved.dispersal_factor,
            "clamping dispersal factor to cluster size"
        );
    }

    if !(1..=nodes).contains(&requested.replication_factor) {
        if strict {
            return Err(TopologyError::ReplicationOutOfRange {
                requested: requested.replication_factor,
                nodes,
            });
        }
        resolved.replication_factor = requested.replication_factor.clamp(1, nodes);
        warn!(
            requested = requested.replication_factor,
            adjusted = resolved.replication_factor,
            "clamping replication factor to cluster size"
        );
    }

    Ok(resolved)
}

/// Per-node descriptor resolved by generation: identity, ports and the
/// initial peer set (as flat indices into the node list).
#[derive(Clone, Debug)]
pub struct GeneratedNodeConfig {
    role: NodeRole,
    index: usize,
    identity: [u8; 32],
    network_port: u16,
    api_port: u16,
    initial_peers: Vec<usize>,
}

impl GeneratedNodeConfig {
    #[must_use]
    pub const fn role(&self) -> NodeRole {
        self.role
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn identity(&self) -> &[u8; 32] {
        &self.identity
    }

    #[must_use]
    pub const fn network_port(&self) -> u16 {
        self.network_port
    }

    #[must_use]
    pub const fn api_port(&self) -> u16 {
        self.api_port
    }

    #[must_use]
    pub fn initial_peer_indices(&self) -> &[usize] {
        &self.initial_peers
    }

    #[must_use]
    pub fn label(&self) -> String {
        format!("{}-{}", self.role.label(), self.index)
    }
}

/// Immutable cluster blueprint produced by [`TopologyBuilder::build`].
#[derive(Clone, Debug)]
pub struct GeneratedTopology {
    config: TopologyConfig,
    validators: Vec<GeneratedNodeConfig>,
    executors: Vec<GeneratedNodeConfig>,
    wallets: Vec<WalletAccount>,
    chain_start: OffsetDateTime,
}

impl GeneratedTopology {
    #[must_use]
    pub const fn config(&self) -> &TopologyConfig {
        &self.config
    }

    #[must_use]
    pub fn validators(&self) -> &[GeneratedNodeConfig] {
        &self.validators
    }

    #[must_use]
    pub fn executors(&self) -> &[GeneratedNodeConfig] {
        &self.executors
    }

    /// All nodes, validators first, in flat-index order.
    pub fn nodes(&self) -> impl Iterator<Item = &GeneratedNodeConfig> {
        self.validators.iter().chain(self.executors.iter())
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.validators.len() + self.executors.len()
    }

    #[must_use]
    pub fn node_at(&self, flat: usize) -> Option<&GeneratedNodeConfig> {
        if flat < self.validators.len() {
            self.validators.get(flat)
        } else {
            self.executors.get(flat - self.validators.len())
        }
    }

    #[must_use]
    pub fn wallet_accounts(&self) -> &[WalletAccount] {
        &self.wallets
    }

    #[must_use]
    pub const fn chain_start(&self) -> OffsetDateTime {
        self.chain_start
    }

    #[must_use]
    pub const fn slot_duration(&self) -> Duration {
        self.config.consensus.slot_duration
    }

    #[must_use]
    pub const fn active_slot_coeff(&self) -> f64 {
        self.config.consensus.active_slot_coeff
    }

    /// Peer counts each node should reach once the initial dial graph is
    /// fully established, treating connections as undirected.
    #[must_use]
    pub fn expected_peer_counts(&self) -> Vec<usize> {
        let total = self.node_count();
        let mut expected: Vec<HashSet<usize>> = vec![HashSet::new(); total];
        for (idx, node) in self.nodes().enumerate() {
            for &peer in node.initial_peer_indices() {
                if peer == idx || peer >= total {
                    continue;
                }
                expected[idx].insert(peer);
                expected[peer].insert(idx);
            }
        }
        expected.into_iter().map(|set| set.len()).collect()
    }

    /// Renders the config file for the node at `flat`, resolving peer hosts
    /// through `peer_host` (backends map flat indices to hostnames).
    pub fn node_config_file<F>(&self, flat: usize, peer_host: F) -> Option<NodeConfigFile>
    where
        F: Fn(usize) -> String,
    {
        let node = self.node_at(flat)?;
        let initial_peers = node
            .initial_peer_indices()
            .iter()
            .filter_map(|&peer| {
                let target = self.node_at(peer)?;
                Some(format!("{}:{}", peer_host(peer), target.network_port()))
            })
            .collect();
        Some(NodeConfigFile {
            role: node.role().label().to_owned(),
            index: node.index(),
            identity: hex::encode(node.identity()),
            network_port: node.network_port(),
            api_port: node.api_port(),
            initial_peers,
            consensus: ConsensusSection {
                slot_duration_ms: self.config.consensus.slot_duration.as_millis() as u64,
                active_slot_coeff: self.config.consensus.active_slot_coeff,
                security_param: self.config.consensus.security_param.get(),
                chain_start: self.chain_start,
            },
            da: DaSection {
                dispersal_factor: self.config.da.dispersal_factor,
                replication_factor: self.config.da.replication_factor,
                num_subnets: self.config.da.num_subnets,
            },
            genesis_accounts: self
                .wallets
                .iter()
                .map(|wallet| GenesisAccount {
                    address: wallet.address().to_owned(),
                    funds: wallet.funds(),
                })
                .collect(),
        })
    }
}
