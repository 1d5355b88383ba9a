//! The three-phase Vote protocol (§4.5): INPUT → VOTE1 → REVOTE, producing a `(value, confidence)`
//! pair each round.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::acast::AcastEngine;
use crate::ctx::Ctx;
use crate::messaging::{NodeEvent, Payload, ServiceContext};
use crate::network_info::NodeId;

#[derive(Default)]
struct VoteRound {
    received_inputs: HashMap<NodeId, bool>,
    received_vote1: HashMap<NodeId, (Vec<NodeId>, bool)>,
    received_revote: HashMap<NodeId, (Vec<NodeId>, bool)>,

    my_a: Option<Vec<NodeId>>,
    my_b: Option<Vec<NodeId>>,
    my_c: Option<Vec<NodeId>>,
    sent_vote1: bool,
    sent_revote: bool,
    finished: bool,
}

fn majority(bits: impl Iterator<Item = bool>) -> bool {
    let (mut ones, mut total) = (0usize, 0usize);
    for b in bits {
        total += 1;
        if b {
            ones += 1;
        }
    }
    // Ties resolve to 0 (§4.5 "ties -> 0").
    ones * 2 > total
}

/// One [`VoteEngine`] runs every round's Vote instance, keyed by round number.
pub struct VoteEngine {
    our_id: NodeId,
    rounds: HashMap<u64, VoteRound>,
}

impl VoteEngine {
    pub fn new(our_id: NodeId) -> Self {
        VoteEngine { our_id, rounds: HashMap::new() }
    }

    /// Phase 1: A-Casts our `INPUT(bit)` for this round (§4.5 phase 1).
    pub fn start(&mut self, round: u64, bit: bool, ctx: &Ctx<'_>, acast: &mut AcastEngine, out: &mut dyn ServiceContext) {
        self.rounds.entry(round).or_default();
        let uuid = crate::instance_id::derive_uuid(
            &format!("vote-input-{round}-{bit}-{}", self.our_id),
            self.our_id,
            ctx.source,
        );
        acast.initiate(uuid, Payload::Input { round, sender: self.our_id, bit }, out);
    }

    /// Delivered `INPUT(round, sender, bit)`.
    pub fn on_input_delivered(
        &mut self,
        round: u64,
        sender: NodeId,
        bit: bool,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        self.rounds.entry(round).or_default().received_inputs.insert(sender, bit);
        self.try_send_vote1(round, ctx, acast, out);
    }

    fn try_send_vote1(&mut self, round: u64, ctx: &Ctx<'_>, acast: &mut AcastEngine, out: &mut dyn ServiceContext) {
        let r = self.rounds.entry(round).or_default();
        if r.sent_vote1 {
            return;
        }
        if r.received_inputs.len() < ctx.net.agreement_set_threshold() {
            return;
        }
        let a_set: Vec<NodeId> = {
            let mut ids: Vec<NodeId> = r.received_inputs.keys().copied().collect();
            ids.sort();
            ids
        };
        let v1 = majority(r.received_inputs.values().copied());
        r.my_a = Some(a_set.clone());
        r.sent_vote1 = true;
        debug!(round, v1, "vote: broadcasting VOTE1");
        let uuid = crate::instance_id::derive_uuid(
            &format!("vote-vote1-{round}-{}", self.our_id),
            self.our_id,
            ctx.source,
        );
        acast.initiate(uuid, Payload::Vote1 { round, sender: self.our_id, set: a_set, bit: v1 }, out);
    }

    /// Delivered `VOTE1(round, sender, set, bit)`.
    pub fn on_vote1_delivered(
        &mut self,
        round: u64,
        sender: NodeId,
        set: Vec<NodeId>,
        bit: bool,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        self.rounds.entry(round).or_default().received_vote1.insert(sender, (set, bit));
        self.try_send_revote(round, ctx, acast, out);
    }

    fn try_send_revote(&mut self, round: u64, ctx: &Ctx<'_>, acast: &mut AcastEngine, out: &mut dyn ServiceContext) {
        let r = self.rounds.entry(round).or_default();
        let Some(my_a) = r.my_a.clone() else { return };
        if r.sent_revote {
            return;
        }
        let valid: Vec<NodeId> = r
            .received_vote1
            .iter()
            .filter(|(_, (a_j, _))| a_j.iter().all(|m| my_a.contains(m)))
            .map(|(&j, _)| j)
            .collect();
        if valid.len() < ctx.net.agreement_set_threshold() {
            return;
        }
        let mut b_set = valid;
        b_set.sort();
        let v2 = majority(b_set.iter().map(|j| r.received_vote1[j].1));
        r.my_b = Some(b_set.clone());
        r.sent_revote = true;
        debug!(round, v2, "vote: broadcasting REVOTE");
        let uuid = crate::instance_id::derive_uuid(
            &format!("vote-revote-{round}-{}", self.our_id),
            self.our_id,
            ctx.source,
        );
        acast.initiate(uuid, Payload::Revote { round, sender: self.our_id, set: b_set, bit: v2 }, out);
    }

    /// Delivered `REVOTE(round, sender, set, bit)`.
    pub fn on_revote_delivered(
        &mut self,
        round: u64,
        sender: NodeId,
        set: Vec<NodeId>,
        bit: bool,
        ctx: &Ctx<'_>,
        out: &mut dyn ServiceContext,
    ) {
        self.rounds.entry(round).or_default().received_revote.insert(sender, (set, bit));
        self.try_fix_c_and_decide(round, ctx, out);
    }

    fn try_fix_c_and_decide(&mut self, round: u64, ctx: &Ctx<'_>, out: &mut dyn ServiceContext) {
        let r = self.rounds.entry(round).or_default();
        if r.finished {
            return;
        }
        let Some(my_b) = r.my_b.clone() else { return };
        if r.my_c.is_none() {
            let valid: Vec<NodeId> = r
                .received_revote
                .iter()
                .filter(|(_, (b_j, _))| b_j.iter().all(|m| my_b.contains(m)))
                .map(|(&j, _)| j)
                .collect();
            if valid.len() >= ctx.net.agreement_set_threshold() {
                let mut c_set = valid;
                c_set.sort();
                r.my_c = Some(c_set);
            }
        }

        // Decision (§4.5): unanimity in B's VOTE1 bits => strong; else unanimity in C's REVOTE
        // bits => weak; else none.
        let b_bits: HashSet<bool> = my_b.iter().filter_map(|j| r.received_vote1.get(j).map(|(_, b)| *b)).collect();
        if my_b.iter().all(|j| r.received_vote1.contains_key(j)) && b_bits.len() == 1 {
            let only = *b_bits.iter().next().expect("len checked == 1");
            r.finished = true;
            debug!(round, value = only, confidence = 2, "vote: strong decision");
            out.emit(NodeEvent::VoteResult { round, value: Some(only), confidence: 2 });
            return;
        }
        if let Some(my_c) = r.my_c.clone() {
            let c_bits: HashSet<bool> = my_c.iter().filter_map(|j| r.received_revote.get(j).map(|(_, b)| *b)).collect();
            if my_c.iter().all(|j| r.received_revote.contains_key(j)) && c_bits.len() == 1 {
                let only = *c_bits.iter().next().expect("len checked == 1");
                r.finished = true;
                debug!(round, value = only, confidence = 1, "vote: weak decision");
                out.emit(NodeEvent::VoteResult { round, value: Some(only), confidence: 1 });
                return;
            }
            // my_c fixed but no unanimity: decide (⊥, 0) — both vote sets are fully known.
            r.finished = true;
            debug!(round, "vote: no-confidence decision");
            out.emit(NodeEvent::VoteResult { round, value: None, confidence: 0 });
        }
    }

    pub fn is_finished(&self, round: u64) -> bool {
        self.rounds.get(&round).map(|r| r.finished).unwrap_or(false)
    }

    /// Feeds one incoming A-Cast protocol message through the shared [`AcastEngine`] and, on
    /// delivery, routes the resulting [`Payload`] to whichever Vote handler owns that variant.
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
        match delivered {
            Payload::Input { round, sender, bit } => self.on_input_delivered(round, sender, bit, ctx, acast, out),
            Payload::Vote1 { round, sender, set, bit } => {
                self.on_vote1_delivered(round, sender, set, bit, ctx, acast, out)
            }
            Payload::Revote { round, sender, set, bit } => self.on_revote_delivered(round, sender, set, bit, ctx, out),
            _ => {}
        }
    }
}
