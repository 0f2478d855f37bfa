/// Shape of the initial peer graph dialed at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetworkLayout {
    /// Every node dials every node generated before it.
    #[default]
    Full,
    /// Every node dials the first validator.
    Star,
    /// Every node dials its predecessor, the first node closes the ring.
    Ring,
}

#[derive(Clone, Debug, Default)]
pub struct NetworkParams {
    pub layout: NetworkLayout,
}

impl NetworkLayout {
    /// Flat indices of the nodes dialed by `node` out of `total` nodes.
    #[must_use]
    pub fn initial_peer_indices(self, node: usize, total: usize) -> Vec<usize> {
        if total <= 1 {
            return Vec::new();
        }
        match self {
            Self::Full => (0..node).collect(),
            Self::Star => {
                if node == 0 {
                    Vec::new()
                } else {
                    vec![0]
                }
            }
            Self::Ring => vec![(node + total - 1) % total],
        }
    }
}
