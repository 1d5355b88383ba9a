//! In-process message transport (§4.7, §5): a shared peer registry of bounded mailboxes, one per
//! node, with self-loopback and the reference inbox bound of 1000.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::messaging::{Envelope, Target, WireMessage};
use crate::network_info::NodeId;

/// Reference inbox bound (§5 "Backpressure": "large enough to absorb a protocol round's burst").
pub const DEFAULT_INBOX_BOUND: usize = 1000;

/// A node's inbound mailbox handle, shared by every peer that unicasts or broadcasts to it.
pub type Inbox = mpsc::Receiver<Envelope>;
type Outbox = mpsc::Sender<Envelope>;

/// Maps every node id in the run to its inbox sender, so any node can reach any other without a
/// central broker beyond this lookup table (§4.7). Cheaply cloneable: the inner map is shared via
/// `Arc` so every node's service task can hold its own handle.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<HashMap<NodeId, Outbox>>,
}

impl PeerRegistry {
    /// Builds a registry wired for `ids`, returning each node's private [`Inbox`] alongside it.
    pub fn build(ids: impl IntoIterator<Item = NodeId>) -> (Self, HashMap<NodeId, Inbox>) {
        let mut peers = HashMap::new();
        let mut inboxes = HashMap::new();
        for id in ids {
            let (tx, rx) = mpsc::channel(DEFAULT_INBOX_BOUND);
            peers.insert(id, tx);
            inboxes.insert(id, rx);
        }
        (PeerRegistry { peers: Arc::new(peers) }, inboxes)
    }

    async fn send_to(&self, from: NodeId, to: NodeId, msg: WireMessage) -> Result<()> {
        let Some(tx) = self.peers.get(&to) else {
            return Err(Error::UnknownPeer { node: to });
        };
        let envelope = Envelope { from, body: msg };
        tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(node = %to, bound = DEFAULT_INBOX_BOUND, "transport: inbox overflow");
                Error::InboxOverflow { node: to, bound: DEFAULT_INBOX_BOUND }
            }
            mpsc::error::TrySendError::Closed(_) => Error::UnknownPeer { node: to },
        })
    }

    pub async fn unicast(&self, from: NodeId, to: NodeId, msg: WireMessage) -> Result<()> {
        self.send_to(from, to, msg).await
    }

    /// Broadcasts to every registered peer, including `from` itself (self-loopback, §4.7/§5).
    pub async fn broadcast(&self, from: NodeId, msg: WireMessage) -> Result<()> {
        for &to in self.peers.keys() {
            self.send_to(from, to, msg.clone()).await?;
        }
        Ok(())
    }

    /// Dispatches one accumulated [`crate::messaging::Output`] onto the wire.
    ///
    /// A unicast addressed to a node that was never registered (e.g. one of the `t` processes a
    /// driver run never spawns, per §6's "starts n−t nodes" simulation) is treated the same as a
    /// crashed peer: the message is dropped rather than failing the whole delivery, so the rest of
    /// this round's outgoing traffic still reaches every peer that is actually running.
    pub async fn deliver(&self, from: NodeId, outgoing: Vec<(Target, WireMessage)>) -> Result<()> {
        for (target, msg) in outgoing {
            let result = match target {
                Target::Node(to) => self.unicast(from, to, msg).await,
                Target::All => self.broadcast(from, msg).await,
            };
            if let Err(Error::UnknownPeer { node }) = result {
                trace!(node = %node, "transport: dropping message addressed to an unregistered peer");
                continue;
            }
            result?;
        }
        Ok(())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
