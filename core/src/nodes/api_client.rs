use std::{collections::BTreeMap, net::SocketAddr};

use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::paths::{
    CONSENSUS_INFO, DA_MEMBERSHIP, HEALTH, MEMPOOL_TRANSACTION, NETWORK_INFO,
};

/// Consensus progress as reported by a node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsensusInfo {
    pub slot: u64,
    pub height: u64,
    pub tip: String,
}

/// Peer view of a node's network stack.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub peer_id: String,
    pub peer_count: usize,
    #[serde(default)]
    pub listen_addresses: Vec<String>,
}

/// Data-availability membership assignations keyed by subnetwork.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DaMembershipInfo {
    pub session: u64,
    pub assignations: BTreeMap<u16, Vec<String>>,
}

/// Transfer submitted into a node's mempool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub sender: String,
    pub nonce: u64,
    pub amount: u64,
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: Url,
    client: Client,
}

impl ApiClient {
    #[must_use]
    pub fn new(base_addr: SocketAddr) -> Self {
        let base_url =
            Url::parse(&format!("http://{base_addr}")).expect("valid base address for node");
        Self::from_url(base_url)
    }

    #[must_use]
    pub fn from_url(base_url: Url) -> Self {
        Self {
            base_url,
            client: Client::new(),
        }
    }

    pub async fn get_response(&self, path: &str) -> reqwest::Result<Response> {
        self.client.get(self.join_base(path)).send().await
    }

    pub async fn get_json<T>(&self, path: &str) -> reqwest::Result<T>
    where
        T: DeserializeOwned,
    {
        self.get_response(path)
            .await?
            .error_for_status()?
            .json()
            .await
    }

    pub async fn post_json_response<T>(&self, path: &str, body: &T) -> reqwest::Result<Response>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.client
            .post(self.join_base(path))
            .json(body)
            .send()
            .await
    }

    pub async fn post_json_unit<T>(&self, path: &str, body: &T) -> reqwest::Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        self.post_json_response(path, body)
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn health(&self) -> reqwest::Result<()> {
        self.get_response(HEALTH).await?.error_for_status()?;
        Ok(())
    }

    pub async fn consensus_info(&self) -> reqwest::Result<ConsensusInfo> {
        self.get_json(CONSENSUS_INFO).await
    }

    pub async fn network_info(&self) -> reqwest::Result<NetworkInfo> {
        self.get_json(NETWORK_INFO).await
    }

    pub async fn da_membership(&self) -> reqwest::Result<DaMembershipInfo> {
        self.get_json(DA_MEMBERSHIP).await
    }

    pub async fn submit_transaction(&self, tx: &TransactionRequest) -> reqwest::Result<()> {
        self.post_json_unit(MEMPOOL_TRANSACTION, tx).await
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn join_base(&self, path: &str) -> Url {
        let trimmed = path.trim_start_matches('/');
        self.base_url.join(trimmed).expect("valid relative path")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_info_decodes_node_payload() {
        let payload = r#"{"slot": 42, "height": 17, "tip": "b1a4"}"#;
        let info: ConsensusInfo = serde_json::from_str(payload).unwrap();
        assert_eq!(info.slot, 42);
        assert_eq!(info.height, 17);
        assert_eq!(info.tip, "b1a4");
    }

    #[test]
    fn network_info_tolerates_missing_listen_addresses() {
        let payload = r#"{"peer_id": "p0", "peer_count": 3}"#;
        let info: NetworkInfo = serde_json::from_str(payload).unwrap();
        assert_eq!(info.peer_count, 3);
        assert!(info.listen_addresses.is_empty());
    }

    #[test]
    fn client_joins_paths_against_base_url() {
        let client = ApiClient::new("127.0.0.1:18080".parse().unwrap());
        assert_eq!(client.base_url().as_str(), "http://127.0.0.1:18080/");
    }
}
