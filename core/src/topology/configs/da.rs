/// Data-availability parameters for a generated cluster.
///
/// Factors are requests, not guarantees: unless the builder runs in strict
/// mode, values that do not fit the cluster size are clamped at generation
/// time.
#[derive(Clone, Copy, Debug)]
pub struct DaParams {
    pub dispersal_factor: usize,
    pub replication_factor: usize,
    pub num_subnets: u16,
}

impl Default for DaParams {
    fn default() -> Self {
        Self {
            dispersal_factor: 1,
            replication_factor: 1,
            num_subnets: 2,
        }
    }
}
