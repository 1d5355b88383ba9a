//! Node identity and the immutable per-run parameters shared by every protocol layer (§3, §9
//! design note on `ServiceContext`-style composition).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A process id in `1..=n`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Immutable parameters fixed for the lifetime of a run (§3: `n`, `t`, `u = ceil(0.87n)`).
#[derive(Debug)]
pub struct NetworkInfo {
    pub our_id: NodeId,
    pub n: usize,
    pub t: usize,
    pub u: u64,
}

impl NetworkInfo {
    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> {
        (1..=self.n as u64).map(NodeId)
    }

    pub fn acast_echo_threshold(&self) -> usize {
        self.n - self.t
    }

    pub fn acast_ready_weak_threshold(&self) -> usize {
        self.t + 1
    }

    pub fn acast_ready_strong_threshold(&self) -> usize {
        2 * self.t + 1
    }

    pub fn agreement_set_threshold(&self) -> usize {
        self.n - self.t
    }

    pub fn interpolation_set_threshold(&self) -> usize {
        std::cmp::max(1, self.n.saturating_sub(2 * self.t))
    }

    pub fn termination_threshold(&self) -> usize {
        self.t + 1
    }
}

/// Builds a [`NetworkInfo`], mirroring the reference's own `*Builder` construction style.
pub struct NetworkInfoBuilder {
    our_id: NodeId,
    n: usize,
    t: usize,
}

impl NetworkInfoBuilder {
    pub fn new(our_id: NodeId, n: usize, t: usize) -> Self {
        NetworkInfoBuilder { our_id, n, t }
    }

    /// Builds the immutable, shareable [`NetworkInfo`].
    ///
    /// # Panics
    /// Panics if `n > 3t` (the resilience bound, §1) does not hold; a misconfigured cluster is a
    /// programming error, not a runtime condition this crate recovers from.
    pub fn build(&self) -> Arc<NetworkInfo> {
        assert!(
            self.n > 3 * self.t,
            "resilience bound violated: n={} must be > 3t={}",
            self.n,
            3 * self.t
        );
        let u = (0.87 * self.n as f64).ceil() as u64;
        Arc::new(NetworkInfo {
            our_id: self.our_id,
            n: self.n,
            t: self.t,
            u,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_modulus_matches_spec_rounding() {
        let net = NetworkInfoBuilder::new(NodeId(1), 7, 2).build();
        assert_eq!(net.u, 7); // ceil(0.87 * 7) = ceil(6.09) = 7
        let net = NetworkInfoBuilder::new(NodeId(1), 4, 1).build();
        assert_eq!(net.u, 4); // ceil(0.87 * 4) = ceil(3.48) = 4
    }

    #[test]
    #[should_panic(expected = "resilience bound violated")]
    fn rejects_insufficient_resilience() {
        NetworkInfoBuilder::new(NodeId(1), 4, 2).build();
    }
}
