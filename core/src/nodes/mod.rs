pub mod api_client;

pub use api_client::{
    ApiClient, ConsensusInfo, DaMembershipInfo, NetworkInfo, TransactionRequest,
};

/// HTTP paths exposed by the node under test.
pub mod paths {
    pub const CONSENSUS_INFO: &str = "/consensus/info";
    pub const DA_MEMBERSHIP: &str = "/da/membership";
    pub const HEALTH: &str = "/health";
    pub const MEMPOOL_TRANSACTION: &str = "/mempool/transaction";
    pub const NETWORK_INFO: &str = "/network/info";
}
