//! Layer-scoped error types (§7 error handling design).
//!
//! Only pre-condition violations and resource exhaustion ever surface as `Err`. Byzantine
//! inconsistencies and malformed-payload drops are absorbed where they occur and logged via
//! `tracing`, per the propagation policy in §7.

use thiserror::Error;

use crate::instance_id::IvssInstanceId;
use crate::network_info::NodeId;

#[derive(Debug, Error)]
pub enum IvssError {
    #[error("reconstruction requested for {instance} before sharing completed locally")]
    SharingNotComplete { instance: IvssInstanceId },

    #[error("no such IVSS instance {instance}")]
    UnknownInstance { instance: IvssInstanceId },
}

#[derive(Debug, Error)]
pub enum AcastError {
    #[error("uuid {uuid} already has a different delivered value latched")]
    ConflictingDelivery { uuid: String },
}

#[derive(Debug, Error)]
pub enum IccError {
    #[error("ICC round {round} has already finished")]
    AlreadyFinished { round: u64 },
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("vote round {round} has already finished")]
    AlreadyFinished { round: u64 },
}

#[derive(Debug, Error)]
pub enum AbaError {
    #[error("node {node} received a message for a round it can no longer process")]
    StaleRound { node: NodeId },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ivss(#[from] IvssError),
    #[error(transparent)]
    Acast(#[from] AcastError),
    #[error(transparent)]
    Icc(#[from] IccError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error(transparent)]
    Aba(#[from] AbaError),
    #[error("inbox for node {node} overflowed its bound of {bound}")]
    InboxOverflow { node: NodeId, bound: usize },
    #[error("transport has no registered peer {node}")]
    UnknownPeer { node: NodeId },
}

pub type Result<T> = std::result::Result<T, Error>;
