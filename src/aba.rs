//! The ABA main loop (§4.6): round-based estimate updates driven by the parallel Vote/ICC
//! results, and the COMPLETE termination gadget.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use crate::acast::AcastEngine;
use crate::ctx::Ctx;
use crate::icc::IccEngine;
use crate::ivss::IvssEngine;
use crate::messaging::{Envelope, NodeEvent, Payload, ServiceContext, WireMessage};
use crate::network_info::NodeId;
use crate::vote::VoteEngine;

/// Per-round `(Vote, ICC)` results as they complete; a round advances only once both are present.
#[derive(Default, Clone, Copy)]
struct RoundResults {
    vote: Option<(Option<bool>, u8)>,
    coin: Option<bool>,
}

/// The ABA orchestration state for one node, driving its owned [`VoteEngine`] and [`IccEngine`]
/// through successive rounds (§4.6).
pub struct AbaState {
    our_id: NodeId,
    round: u64,
    estimate: bool,
    decided: bool,
    decision: Option<bool>,
    has_broadcast_complete: bool,
    complete_counts: HashMap<bool, HashSet<NodeId>>,
    results: HashMap<u64, RoundResults>,
    future_msgs: HashMap<u64, VecDeque<Envelope>>,
}

impl AbaState {
    pub fn new(our_id: NodeId, input: bool) -> Self {
        AbaState {
            our_id,
            round: 0,
            estimate: input,
            decided: false,
            decision: None,
            has_broadcast_complete: false,
            complete_counts: HashMap::new(),
            results: HashMap::new(),
            future_msgs: HashMap::new(),
        }
    }

    pub fn current_round(&self) -> u64 {
        self.round
    }

    pub fn is_decided(&self) -> bool {
        self.decided
    }

    pub fn decision(&self) -> Option<bool> {
        self.decision
    }

    /// Whether this node has itself broadcast `COMPLETE(decision)` yet (§4.6 termination policy:
    /// a decided node must keep participating at least until this is true).
    pub fn has_broadcast_complete(&self) -> bool {
        self.has_broadcast_complete
    }

    /// Starts round `r+1`: runs Vote and ICC for the current estimate in parallel (§4.6).
    #[allow(clippy::too_many_arguments)]
    pub fn start_round<R: rand::RngCore + rand::CryptoRng>(
        &mut self,
        ctx: &Ctx<'_>,
        vote: &mut VoteEngine,
        icc: &mut IccEngine,
        ivss: &mut IvssEngine,
        rng: &mut R,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        self.round += 1;
        self.results.entry(self.round).or_default();
        info!(round = self.round, estimate = self.estimate, "aba: starting round");
        vote.start(self.round, self.estimate, ctx, acast, out);
        icc.start(self.round, ctx, ivss, rng, out);
    }

    /// Buffers a message whose round is ahead of our current round (§4.6, §5 `future_msgs`).
    /// Returns `true` if the message was buffered (caller must not process it now).
    pub fn buffer_if_future(&mut self, envelope: &Envelope, round: Option<u64>) -> bool {
        match round {
            Some(r) if r > self.round => {
                self.future_msgs.entry(r).or_default().push_back(envelope.clone());
                true
            }
            _ => false,
        }
    }

    /// Drains every message buffered for the round we are about to start.
    pub fn drain_future(&mut self, round: u64) -> Vec<Envelope> {
        self.future_msgs.remove(&round).map(|q| q.into_iter().collect()).unwrap_or_default()
    }

    pub fn on_vote_result(&mut self, round: u64, value: Option<bool>, confidence: u8) {
        self.results.entry(round).or_default().vote = Some((value, confidence));
    }

    pub fn on_icc_result(&mut self, round: u64, coin: bool) {
        self.results.entry(round).or_default().coin = Some(coin);
    }

    /// Returns the combined `(voteVal, voteConf, coin)` for `round` once both halves are in.
    pub fn try_take_results(&self, round: u64) -> Option<(Option<bool>, u8, bool)> {
        let r = self.results.get(&round)?;
        let (value, confidence) = r.vote?;
        let coin = r.coin?;
        Some((value, confidence, coin))
    }

    /// Applies the §4.6 estimate-update rule for a completed round and emits `COMPLETE` the first
    /// time strong confidence is reached. Returns `true` once the caller should start the next
    /// round.
    pub fn advance(
        &mut self,
        round: u64,
        vote_val: Option<bool>,
        vote_conf: u8,
        coin: bool,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) -> bool {
        if round != self.round {
            return false;
        }
        if self.decided {
            self.estimate = self.decision.expect("decided implies a decision value");
        } else if vote_conf == 2 {
            let v = vote_val.expect("confidence 2 implies a value");
            self.estimate = v;
            self.maybe_broadcast_complete(v, ctx, acast, out);
        } else if vote_conf == 1 {
            self.estimate = vote_val.expect("confidence 1 implies a value");
        } else {
            self.estimate = coin;
        }
        debug!(round, estimate = self.estimate, decided = self.decided, "aba: round advanced");
        true
    }

    fn maybe_broadcast_complete(&mut self, value: bool, ctx: &Ctx<'_>, acast: &mut AcastEngine, out: &mut dyn ServiceContext) {
        if self.has_broadcast_complete {
            return;
        }
        self.has_broadcast_complete = true;
        let uuid = crate::instance_id::derive_uuid(
            &format!("aba-complete-{value}-{}", self.our_id),
            self.our_id,
            ctx.source,
        );
        acast.initiate(uuid, Payload::Complete { sender: self.our_id, value }, out);
    }

    /// Delivered `COMPLETE(sender, value)` (§4.6 termination gadget).
    pub fn on_complete_delivered(
        &mut self,
        sender: NodeId,
        value: bool,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        self.complete_counts.entry(value).or_default().insert(sender);
        let count = self.complete_counts.get(&value).map(|s| s.len()).unwrap_or(0);
        if count >= ctx.net.termination_threshold() && !self.decided {
            self.decided = true;
            self.decision = Some(value);
            info!(value, "aba: decided");
            out.emit(NodeEvent::Decided { value });
        }
        if self.decided {
            let decision = self.decision.expect("just checked");
            self.maybe_broadcast_complete(decision, ctx, acast, out);
        }
    }

    /// Feeds one incoming A-Cast protocol message through the shared [`AcastEngine`] and, on
    /// delivery, routes a `COMPLETE` payload to [`Self::on_complete_delivered`]. A no-op for
    /// every other payload variant (handled by the Vote/ICC/IVSS engines instead).
    pub fn handle_acast(
        &mut self,
        uuid: &str,
        from: NodeId,
        kind: crate::messaging::AcastKind,
        payload: Payload,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        let Some(delivered) = acast.handle(uuid, from, kind, payload, ctx.net, out) else {
            return;
        };
        if let Payload::Complete { sender, value } = delivered {
            self.on_complete_delivered(sender, value, ctx, acast, out);
        }
    }
}

/// Extracts the ABA round a wire message is scoped to, for `future_msgs` buffering (§4.6, §5).
pub fn envelope_round(msg: &WireMessage) -> Option<u64> {
    crate::messaging::message_round(msg)
}
