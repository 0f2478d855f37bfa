/// Funding plan for the genesis wallet set.
#[derive(Clone, Copy, Debug, Default)]
pub struct WalletParams {
    pub accounts: usize,
    pub funds_per_account: u64,
}

impl WalletParams {
    #[must_use]
    pub const fn uniform(accounts: usize, funds_per_account: u64) -> Self {
        Self {
            accounts,
            funds_per_account,
        }
    }
}

/// A funded account generated into every node's genesis configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletAccount {
    address: String,
    funds: u64,
}

impl WalletAccount {
    #[must_use]
    pub const fn new(address: String, funds: u64) -> Self {
        Self { address, funds }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn funds(&self) -> u64 {
        self.funds
    }
}
