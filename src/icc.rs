//! Inferable Common Coin (§4.4): orchestrates `n` parallel IVSS dealings per round and the
//! ATTACH/ACCEPT/FINAL_SETS set-agreement cascade that derives an unbiased shared coin bit.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::acast::AcastEngine;
use crate::ctx::Ctx;
use crate::field::Fp;
use crate::instance_id::IvssInstanceId;
use crate::ivss::{IvssEngine, IvssOutcome};
use crate::messaging::{NodeEvent, Payload, ServiceContext};
use crate::network_info::NodeId;

#[derive(Default)]
struct IccRound {
    completed_secrets: HashMap<NodeId, HashSet<NodeId>>,

    my_t: Option<Vec<NodeId>>,
    my_a: Option<Vec<NodeId>>,
    my_s: Option<Vec<NodeId>>,
    my_h: Option<Vec<NodeId>>,
    sent_attach: bool,
    sent_accept: bool,
    sent_final_sets: bool,

    received_t: HashMap<NodeId, Vec<NodeId>>,
    received_a: HashMap<NodeId, Vec<NodeId>>,
    received_final_sets: Vec<(NodeId, Vec<NodeId>, Vec<NodeId>)>,

    reconstructed_values: HashMap<NodeId, HashMap<NodeId, Fp>>,
    finished: bool,
}

/// One [`IccEngine`] runs every round's ICC instance; rounds never interact, so state is keyed by
/// round number and discarded implicitly once a round finishes (§3 lifecycles).
pub struct IccEngine {
    our_id: NodeId,
    rounds: HashMap<u64, IccRound>,
}

impl IccEngine {
    pub fn new(our_id: NodeId) -> Self {
        IccEngine { our_id, rounds: HashMap::new() }
    }

    fn instance(&self, round: u64, dealer: NodeId, secret_idx: NodeId) -> IvssInstanceId {
        IvssInstanceId { round, dealer, secret_idx }
    }

    /// Starts round `r`'s ICC instance: deals `n` independent random secrets, one per `secretIdx`
    /// (§4.4 step 1).
    pub fn start<R: rand::RngCore + rand::CryptoRng>(
        &mut self,
        round: u64,
        ctx: &Ctx<'_>,
        ivss: &mut IvssEngine,
        rng: &mut R,
        out: &mut dyn ServiceContext,
    ) {
        self.rounds.entry(round).or_default();
        for secret_idx in ctx.net.all_ids() {
            let id = self.instance(round, self.our_id, secret_idx);
            let secret = Fp::random(rng);
            ivss.deal(id, secret, ctx, rng, out);
        }
    }

    /// Reacts to an [`IvssOutcome`] produced while routing a delivered A-Cast payload, forwarding
    /// sharing completions and reconstructions this ICC round cares about.
    pub fn on_ivss_outcome(
        &mut self,
        outcome: IvssOutcome,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        match outcome {
            IvssOutcome::SharingComplete(id) => self.on_sharing_complete(id, ctx, acast, out),
            IvssOutcome::Reconstructed(id, secret) => self.on_reconstructed(id, secret, ctx, out),
            IvssOutcome::None => {}
        }
    }

    fn on_sharing_complete(
        &mut self,
        id: IvssInstanceId,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        let round = self.rounds.entry(id.round).or_default();
        round.completed_secrets.entry(id.dealer).or_default().insert(id.secret_idx);
        self.try_fix_t(id.round, ctx, acast, out);
    }

    fn try_fix_t(&mut self, round: u64, ctx: &Ctx<'_>, acast: &mut AcastEngine, out: &mut dyn ServiceContext) {
        let r = self.rounds.entry(round).or_default();
        if r.my_t.is_some() {
            return;
        }
        let n = ctx.net.n;
        let mut t_set: Vec<NodeId> = r
            .completed_secrets
            .iter()
            .filter(|(_, secrets)| secrets.len() == n)
            .map(|(&d, _)| d)
            .collect();
        if t_set.len() >= ctx.net.agreement_set_threshold() {
            t_set.sort();
            r.my_t = Some(t_set.clone());
            r.sent_attach = true;
            debug!(round, size = t_set.len(), "icc: fixing T, broadcasting ATTACH");
            let uuid = crate::instance_id::derive_uuid(
                &format!("icc-attach-{round}-{}", self.our_id),
                self.our_id,
                ctx.source,
            );
            acast.initiate(uuid, Payload::Attach { round, sender: self.our_id, set_t: t_set }, out);
        }
    }

    /// Delivered `ATTACH(round, sender, set_t)` (§4.4 step 4).
    pub fn on_attach_delivered(
        &mut self,
        round: u64,
        sender: NodeId,
        set_t: Vec<NodeId>,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        self.rounds.entry(round).or_default().received_t.insert(sender, set_t);
        self.try_fix_a(round, ctx, acast, out);
    }

    fn try_fix_a(&mut self, round: u64, ctx: &Ctx<'_>, acast: &mut AcastEngine, out: &mut dyn ServiceContext) {
        let r = self.rounds.entry(round).or_default();
        let Some(my_t) = r.my_t.clone() else { return };
        if r.my_a.is_some() {
            return;
        }
        let mut a_set: Vec<NodeId> = r
            .received_t
            .iter()
            .filter(|(_, t_j)| t_j.iter().all(|m| my_t.contains(m)))
            .map(|(&j, _)| j)
            .collect();
        if a_set.len() >= ctx.net.agreement_set_threshold() {
            a_set.sort();
            r.my_a = Some(a_set.clone());
            r.sent_accept = true;
            debug!(round, size = a_set.len(), "icc: fixing A, broadcasting ACCEPT");
            let uuid = crate::instance_id::derive_uuid(
                &format!("icc-accept-{round}-{}", self.our_id),
                self.our_id,
                ctx.source,
            );
            acast.initiate(uuid, Payload::Accept { round, sender: self.our_id, set_a: a_set }, out);
        }
    }

    /// Delivered `ACCEPT(round, sender, set_a)` (§4.4 step 5).
    pub fn on_accept_delivered(
        &mut self,
        round: u64,
        sender: NodeId,
        set_a: Vec<NodeId>,
        ctx: &Ctx<'_>,
        ivss: &mut IvssEngine,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        self.rounds.entry(round).or_default().received_a.insert(sender, set_a);
        self.try_fix_s_and_start_reconstruction(round, ctx, ivss, acast, out);
    }

    fn try_fix_s_and_start_reconstruction(
        &mut self,
        round: u64,
        ctx: &Ctx<'_>,
        ivss: &mut IvssEngine,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        let r = self.rounds.entry(round).or_default();
        let Some(my_a) = r.my_a.clone() else { return };
        if r.my_s.is_some() {
            return;
        }
        let mut s_set: Vec<NodeId> = r
            .received_a
            .iter()
            .filter(|(_, a_j)| a_j.iter().all(|m| my_a.contains(m)))
            .map(|(&j, _)| j)
            .collect();
        if s_set.len() < ctx.net.agreement_set_threshold() {
            return;
        }
        s_set.sort();
        r.my_s = Some(s_set.clone());
        r.my_h = Some(my_a.clone());
        r.sent_final_sets = true;
        let received_t = r.received_t.clone();
        debug!(round, size = s_set.len(), "icc: fixing S, broadcasting FINAL_SETS");

        let uuid = crate::instance_id::derive_uuid(
            &format!("icc-final-{round}-{}", self.our_id),
            self.our_id,
            ctx.source,
        );
        acast.initiate(
            uuid,
            Payload::FinalSets { round, sender: self.our_id, set_h: my_a.clone(), set_s: s_set },
            out,
        );

        for &j in &my_a {
            let Some(dealers) = received_t.get(&j) else { continue };
            for &k in dealers {
                let id = self.instance(round, k, j);
                let _ = ivss.start_reconstruction(id, acast, out);
            }
        }
    }

    /// Delivered `FINAL_SETS(round, sender, set_h, set_s)` (§4.4 step 6).
    pub fn on_final_sets_delivered(
        &mut self,
        round: u64,
        sender: NodeId,
        set_h: Vec<NodeId>,
        set_s: Vec<NodeId>,
        ctx: &Ctx<'_>,
        out: &mut dyn ServiceContext,
    ) {
        self.rounds.entry(round).or_default().received_final_sets.push((sender, set_h, set_s));
        self.try_decide(round, ctx, out);
    }

    /// Feeds one incoming A-Cast protocol message through the shared [`AcastEngine`] and, on
    /// delivery, routes the resulting [`Payload`] to whichever ICC handler owns that variant. A
    /// no-op for payload variants this engine does not own (IVSS's, which are routed separately).
    #[allow(clippy::too_many_arguments)]
    pub fn handle_acast(
        &mut self,
        uuid: &str,
        from: NodeId,
        kind: crate::messaging::AcastKind,
        payload: Payload,
        ctx: &Ctx<'_>,
        ivss: &mut IvssEngine,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        let Some(delivered) = acast.handle(uuid, from, kind, payload, ctx.net, out) else {
            return;
        };
        match delivered {
            Payload::Attach { round, sender, set_t } => self.on_attach_delivered(round, sender, set_t, ctx, acast, out),
            Payload::Accept { round, sender, set_a } => {
                self.on_accept_delivered(round, sender, set_a, ctx, ivss, acast, out)
            }
            Payload::FinalSets { round, sender, set_h, set_s } => {
                self.on_final_sets_delivered(round, sender, set_h, set_s, ctx, out)
            }
            _ => {}
        }
    }

    fn on_reconstructed(&mut self, id: IvssInstanceId, secret: Fp, ctx: &Ctx<'_>, out: &mut dyn ServiceContext) {
        let r = self.rounds.entry(id.round).or_default();
        r.reconstructed_values.entry(id.dealer).or_default().insert(id.secret_idx, secret);
        self.try_decide(id.round, ctx, out);
    }

    /// Decision check (§4.4 step 6): scans every stored `(H, S)` pair for the first one whose `H`
    /// is covered by fully-reconstructed `received_T[j]` rows, and whose containment constraints
    /// against `my_A`/`my_S` hold.
    fn try_decide(&mut self, round: u64, ctx: &Ctx<'_>, out: &mut dyn ServiceContext) {
        let r = self.rounds.entry(round).or_default();
        if r.finished {
            return;
        }
        let Some(my_a) = r.my_a.clone() else { return };
        let Some(my_s) = r.my_s.clone() else { return };

        for (_, set_h, set_s) in r.received_final_sets.clone() {
            if !set_h.iter().all(|m| my_a.contains(m)) {
                continue;
            }
            if !set_s.iter().all(|m| my_s.contains(m)) {
                continue;
            }
            let mut all_ready = true;
            let mut v_js: Vec<u64> = Vec::with_capacity(set_h.len());
            'outer: for &j in &set_h {
                let Some(dealers) = r.received_t.get(&j) else {
                    all_ready = false;
                    break;
                };
                let mut sum = Fp::zero();
                for &k in dealers {
                    match r.reconstructed_values.get(&k).and_then(|m| m.get(&j)) {
                        Some(value) => sum = &sum + value,
                        None => {
                            all_ready = false;
                            break 'outer;
                        }
                    }
                }
                v_js.push(sum.mod_small(ctx.net.u));
            }
            if !all_ready {
                continue;
            }
            let coin = !v_js.iter().any(|&v| v == 0);
            r.finished = true;
            debug!(round, coin, "icc: decided");
            out.emit(NodeEvent::IccResult { round, coin });
            return;
        }
    }

    pub fn is_finished(&self, round: u64) -> bool {
        self.rounds.get(&round).map(|r| r.finished).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certification::CertificationRegistry;
    use crate::instance_id::CountingInstanceIdSource;
    use crate::messaging::Output;
    use crate::network_info::NetworkInfoBuilder;

    #[test]
    fn coin_decision_flips_to_zero_when_any_value_is_zero() {
        let net = NetworkInfoBuilder::new(NodeId(1), 4, 1).build();
        let registry = CertificationRegistry::new();
        let source = CountingInstanceIdSource::default();
        let ctx = Ctx { net: &net, registry: &registry, source: &source };
        let mut icc = IccEngine::new(NodeId(1));
        let mut out = Output::new();

        let r = icc.rounds.entry(1).or_default();
        r.my_a = Some(vec![NodeId(1), NodeId(2)]);
        r.my_s = Some(vec![NodeId(1), NodeId(2)]);
        r.received_t.insert(NodeId(1), vec![NodeId(1)]);
        r.received_t.insert(NodeId(2), vec![NodeId(2)]);
        r.reconstructed_values.entry(NodeId(1)).or_default().insert(NodeId(1), Fp::from_u64(0));
        r.reconstructed_values.entry(NodeId(2)).or_default().insert(NodeId(2), Fp::from_u64(5));
        r.received_final_sets.push((NodeId(3), vec![NodeId(1), NodeId(2)], vec![NodeId(1), NodeId(2)]));

        icc.try_decide(1, &ctx, &mut out);
        assert!(icc.is_finished(1));
        assert_eq!(out.events, vec![NodeEvent::IccResult { round: 1, coin: false }]);
    }

    #[test]
    fn coin_decision_is_one_when_every_value_nonzero() {
        let net = NetworkInfoBuilder::new(NodeId(1), 4, 1).build();
        let registry = CertificationRegistry::new();
        let source = CountingInstanceIdSource::default();
        let ctx = Ctx { net: &net, registry: &registry, source: &source };
        let mut icc = IccEngine::new(NodeId(1));
        let mut out = Output::new();

        let r = icc.rounds.entry(1).or_default();
        r.my_a = Some(vec![NodeId(1)]);
        r.my_s = Some(vec![NodeId(1)]);
        r.received_t.insert(NodeId(1), vec![NodeId(1)]);
        r.reconstructed_values.entry(NodeId(1)).or_default().insert(NodeId(1), Fp::from_u64(3));
        r.received_final_sets.push((NodeId(2), vec![NodeId(1)], vec![NodeId(1)]));

        icc.try_decide(1, &ctx, &mut out);
        assert_eq!(out.events, vec![NodeEvent::IccResult { round: 1, coin: true }]);
    }

    #[test]
    fn decision_latches_and_ignores_later_final_sets() {
        let net = NetworkInfoBuilder::new(NodeId(1), 4, 1).build();
        let registry = CertificationRegistry::new();
        let source = CountingInstanceIdSource::default();
        let ctx = Ctx { net: &net, registry: &registry, source: &source };
        let mut icc = IccEngine::new(NodeId(1));
        let mut out = Output::new();

        let r = icc.rounds.entry(1).or_default();
        r.my_a = Some(vec![NodeId(1)]);
        r.my_s = Some(vec![NodeId(1)]);
        r.received_t.insert(NodeId(1), vec![NodeId(1)]);
        r.reconstructed_values.entry(NodeId(1)).or_default().insert(NodeId(1), Fp::from_u64(3));
        r.received_final_sets.push((NodeId(2), vec![NodeId(1)], vec![NodeId(1)]));
        icc.try_decide(1, &ctx, &mut out);

        icc.on_final_sets_delivered(1, NodeId(3), vec![NodeId(1)], vec![NodeId(1)], &ctx, &mut out);
        let results: Vec<_> = out.events.iter().filter(|e| matches!(e, NodeEvent::IccResult { .. })).collect();
        assert_eq!(results.len(), 1, "a finished round must ignore further FINAL_SETS");
    }
}
