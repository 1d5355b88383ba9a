//! Asynchronous Byzantine Agreement (Canetti–Rabin-style) built on Inferable Verifiable Secret
//! Sharing, an Inferable Common Coin, and Bracha reliable broadcast.
//!
//! See `DESIGN.md` for the grounding of each module and the open-question decisions recorded
//! while implementing the specification this crate follows.

pub mod aba;
pub mod acast;
pub mod certification;
pub mod ctx;
pub mod error;
pub mod field;
pub mod icc;
pub mod instance_id;
pub mod ivss;
pub mod messaging;
pub mod network_info;
pub mod node;
pub mod transport;
pub mod vote;

pub use error::{Error, Result};
pub use network_info::{NetworkInfo, NetworkInfoBuilder, NodeId};
pub use node::NodeService;
