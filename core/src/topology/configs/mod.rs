pub mod consensus;
pub mod da;
pub mod network;
pub mod wallet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use consensus::ConsensusParams;
pub use da::DaParams;
pub use network::{NetworkLayout, NetworkParams};
pub use wallet::{WalletAccount, WalletParams};

/// Fully resolved configuration rendered for a single node instance.
///
/// Backends serialize this to YAML and hand it to the node binary, either as
/// a file next to the process or mounted into its container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfigFile {
    pub role: String,
    pub index: usize,
    pub identity: String,
    pub network_port: u16,
    pub api_port: u16,
    pub initial_peers: Vec<String>,
    pub consensus: ConsensusSection,
    pub da: DaSection,
    pub genesis_accounts: Vec<GenesisAccount>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusSection {
    pub slot_duration_ms: u64,
    pub active_slot_coeff: f64,
    pub security_param: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub chain_start: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaSection {
    pub dispersal_factor: usize,
    pub replication_factor: usize,
    pub num_subnets: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: String,
    pub funds: u64,
}
