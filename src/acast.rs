//! Bracha reliable broadcast (§4.1): the single shared A-Cast engine every higher layer
//! multiplexes onto via structured uuids (§4.2 uuid discipline, §4.4, §4.5, §4.6).
//!
//! One [`AcastEngine`] instance is owned per node and serves every layer: IVSS's `EQUAL`/`MSET`/
//! `REVEAL`/reconstruction-`READY`, ICC's `ATTACH`/`ACCEPT`/`FINAL_SETS`, Vote's `INPUT`/`VOTE1`/
//! `REVOTE`, and the ABA termination gadget's `COMPLETE` all flow through the same per-uuid state
//! machine below; A-Cast itself never interprets its `value`.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::messaging::{AcastKind, Payload, ServiceContext, WireMessage};
use crate::network_info::{NetworkInfo, NodeId};

#[derive(Default)]
struct AcastInstance {
    echo_voters: HashMap<Payload, HashSet<NodeId>>,
    ready_voters: HashMap<Payload, HashSet<NodeId>>,
    initiated: bool,
    sent_echo: bool,
    sent_ready: bool,
    delivered: Option<Payload>,
}

/// Bracha broadcast state machines, one per uuid, lazily created on first touch (§3 lifecycles).
#[derive(Default)]
pub struct AcastEngine {
    instances: HashMap<String, AcastInstance>,
}

impl AcastEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initiates a broadcast as the logical sender: broadcasts `MSG(v)`, including to ourselves
    /// (§4.7 self-loopback). The sender's own echo transition is *not* performed here — it is
    /// driven by `handle()`'s ordinary on-`MSG` rule once our self-addressed `MSG` arrives back
    /// through the loopback, exactly as every other recipient's echo is (spec.md's "an INPUT
    /// handler may synthesize a local MSG, provided the effect of loopback eventually occurs").
    /// A no-op if this uuid has already been initiated (§4.1 edge cases: idempotent per sender).
    pub fn initiate(&mut self, uuid: impl Into<String>, value: Payload, out: &mut dyn ServiceContext) {
        let uuid = uuid.into();
        let inst = self.instances.entry(uuid.clone()).or_default();
        if !inst.initiated {
            inst.initiated = true;
            trace!(uuid = %uuid, "acast: initiating MSG");
            out.broadcast(WireMessage::Acast {
                uuid,
                kind: AcastKind::Msg,
                payload: value,
            });
        }
    }

    /// Applies one incoming `MSG`/`ECHO`/`READY` message. Returns `Some(value)` exactly once, the
    /// moment this uuid is newly delivered (§4.1 transitions).
    pub fn handle(
        &mut self,
        uuid: &str,
        from: NodeId,
        kind: AcastKind,
        payload: Payload,
        net: &NetworkInfo,
        out: &mut dyn ServiceContext,
    ) -> Option<Payload> {
        let inst = self.instances.entry(uuid.to_string()).or_default();
        if inst.delivered.is_some() {
            return None;
        }
        match kind {
            AcastKind::Msg => {
                if !inst.sent_echo {
                    inst.sent_echo = true;
                    out.broadcast(WireMessage::Acast {
                        uuid: uuid.to_string(),
                        kind: AcastKind::Echo,
                        payload,
                    });
                }
                None
            }
            AcastKind::Echo => {
                let voters = inst.echo_voters.entry(payload.clone()).or_default();
                voters.insert(from);
                if voters.len() >= net.acast_echo_threshold() && !inst.sent_ready {
                    inst.sent_ready = true;
                    out.broadcast(WireMessage::Acast {
                        uuid: uuid.to_string(),
                        kind: AcastKind::Ready,
                        payload,
                    });
                }
                None
            }
            AcastKind::Ready => {
                let voters = inst.ready_voters.entry(payload.clone()).or_default();
                voters.insert(from);
                let count = voters.len();
                if count >= net.acast_ready_weak_threshold() && !inst.sent_ready {
                    inst.sent_ready = true;
                    out.broadcast(WireMessage::Acast {
                        uuid: uuid.to_string(),
                        kind: AcastKind::Ready,
                        payload: payload.clone(),
                    });
                }
                if count >= net.acast_ready_strong_threshold() && inst.delivered.is_none() {
                    inst.delivered = Some(payload.clone());
                    // Release voter tables; identity and outcome stay latched for idempotence
                    // (§3 lifecycles, §9 per-instance cleanup).
                    inst.echo_voters = HashMap::new();
                    inst.ready_voters = HashMap::new();
                    debug!(uuid = %uuid, "acast: delivered");
                    return Some(payload);
                }
                None
            }
        }
    }

    pub fn is_delivered(&self, uuid: &str) -> bool {
        self.instances
            .get(uuid)
            .map(|i| i.delivered.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_id::IvssInstanceId;
    use crate::messaging::Output;
    use crate::network_info::NetworkInfoBuilder;

    fn net(n: usize, t: usize) -> std::sync::Arc<NetworkInfo> {
        NetworkInfoBuilder::new(NodeId(1), n, t).build()
    }

    fn sample_payload() -> Payload {
        Payload::Complete { sender: NodeId(1), value: true }
    }

    #[test]
    fn delivers_after_2t_plus_1_ready_votes() {
        let net = net(4, 1);
        let mut acast = AcastEngine::new();
        let uuid = "test-uuid";
        let v = sample_payload();
        let mut out = Output::new();
        for j in 1..=2u64 {
            assert!(acast
                .handle(uuid, NodeId(j), AcastKind::Ready, v.clone(), &net, &mut out)
                .is_none());
        }
        let delivered = acast.handle(uuid, NodeId(3), AcastKind::Ready, v.clone(), &net, &mut out);
        assert_eq!(delivered, Some(v));
        assert!(acast.is_delivered(uuid));
    }

    #[test]
    fn msg_then_echo_then_ready_flow_broadcasts_each_once() {
        let net = net(4, 1);
        let mut acast = AcastEngine::new();
        let uuid = "flow-uuid";
        let v = sample_payload();
        let mut out = Output::new();
        acast.handle(uuid, NodeId(2), AcastKind::Msg, v.clone(), &net, &mut out);
        acast.handle(uuid, NodeId(2), AcastKind::Msg, v.clone(), &net, &mut out);
        let echoes = out
            .outgoing
            .iter()
            .filter(|(_, m)| matches!(m, WireMessage::Acast { kind: AcastKind::Echo, .. }))
            .count();
        assert_eq!(echoes, 1, "duplicate MSG must be a no-op after the first");
    }

    #[test]
    fn uuid_scheme_is_stable_for_ivss_payloads() {
        let id = IvssInstanceId { round: 1, dealer: NodeId(1), secret_idx: NodeId(2) };
        assert_eq!(id.equal_uuid(NodeId(3), NodeId(4)), "ICC-1-1-2-EQUAL-3-4");
    }
}
