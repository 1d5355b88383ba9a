//! Inferable Verifiable Secret Sharing (§4.2): sharing phase (EQUAL/MSET) and reconstruction
//! phase (REVEAL/reconstruction-READY), layered on the shared [`AcastEngine`].

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

use crate::acast::AcastEngine;
use crate::ctx::Ctx;
use crate::error::IvssError;
use crate::field::{interpolate_at_zero, Fp, Polynomial};
use crate::instance_id::IvssInstanceId;
use crate::messaging::{NodeEvent, Payload, ServiceContext};
use crate::network_info::NodeId;

/// Outcome of delivering or receiving one piece of IVSS protocol state, used by the owning
/// [`crate::icc::IccEngine`] to react to sharing/reconstruction completions synchronously within
/// the same envelope-handling step (§5: atomic handling).
#[derive(Clone, Debug, PartialEq)]
pub enum IvssOutcome {
    None,
    SharingComplete(IvssInstanceId),
    Reconstructed(IvssInstanceId, Fp),
}

#[derive(Default)]
struct IvssInstance {
    received_poly: Option<Polynomial>,
    early_points: HashMap<NodeId, Fp>,
    completed_equals: HashSet<(NodeId, NodeId)>,
    sent_mset: bool,
    m_set: Option<Vec<NodeId>>,
    pending_mset: Option<Vec<NodeId>>,
    sharing_done: bool,

    revealed_polys: HashMap<NodeId, Polynomial>,
    interpolation_set: Vec<NodeId>,
    ready_from: HashSet<NodeId>,
    secret: Option<Fp>,
    sent_reveal: bool,
    sent_ready_recon: bool,
    reconstructed: bool,
}

/// One [`IvssEngine`] is owned per node and multiplexes every concurrent IVSS instance it
/// participates in, keyed by `(round, dealer, secret_idx)` (§3 lifecycles).
pub struct IvssEngine {
    our_id: NodeId,
    instances: HashMap<IvssInstanceId, IvssInstance>,
}

impl IvssEngine {
    pub fn new(our_id: NodeId) -> Self {
        IvssEngine { our_id, instances: HashMap::new() }
    }

    /// Dealer-only: samples a fresh symmetric bivariate polynomial and directly unicasts each
    /// receiver's univariate slice (§4.2 sharing, not an A-Cast step).
    pub fn deal<R: rand::RngCore + rand::CryptoRng>(
        &mut self,
        id: IvssInstanceId,
        secret: Fp,
        ctx: &Ctx<'_>,
        rng: &mut R,
        out: &mut dyn ServiceContext,
    ) {
        let bivariate = crate::field::Bivariate::sample(ctx.net.t, secret, rng);
        for receiver in ctx.net.all_ids() {
            let slice = bivariate.univariate_slice(receiver.0);
            out.unicast(receiver, crate::messaging::WireMessage::IvssShare { instance: id, poly: slice });
        }
    }

    /// Receives our univariate slice from the dealer; replies to every peer with our point of
    /// their share so mutual consistency can be checked (§4.2 sharing).
    pub fn on_share_received(
        &mut self,
        id: IvssInstanceId,
        poly: Polynomial,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) -> IvssOutcome {
        let already = self.instances.get(&id).map(|i| i.received_poly.is_some()).unwrap_or(false);
        if already {
            return IvssOutcome::None;
        }
        let buffered: Vec<(NodeId, Fp)> = {
            let inst = self.instances.entry(id).or_default();
            inst.received_poly = Some(poly.clone());
            inst.early_points.drain().collect()
        };
        for peer in ctx.net.all_ids() {
            let point = poly.eval_u64(peer.0);
            out.unicast(peer, crate::messaging::WireMessage::IvssPoint { instance: id, point });
        }
        for (from, point) in buffered {
            Self::check_point(id, self.our_id, from, &point, &poly, acast, out);
        }
        self.maybe_emit_sharing_complete(id, out)
    }

    /// Receives a peer's point of our own share; checks it against our received polynomial if
    /// already present, otherwise buffers it for later (§4.2 sharing, out-of-order arrival).
    pub fn on_point_received(
        &mut self,
        id: IvssInstanceId,
        from: NodeId,
        point: Fp,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        let poly = self.instances.get(&id).and_then(|i| i.received_poly.clone());
        match poly {
            Some(poly) => Self::check_point(id, self.our_id, from, &point, &poly, acast, out),
            None => {
                self.instances.entry(id).or_default().early_points.insert(from, point);
            }
        }
    }

    /// `F(from, our_id) == point` would hold under symmetry iff `poly.eval(from) == point`
    /// (`poly` is our slice `f_our_id`, and the peer claims `f_from(our_id)`, i.e. `F(from,
    /// our_id)`, which symmetry makes equal to `F(our_id, from) = poly(from)`).
    fn check_point(
        id: IvssInstanceId,
        our_id: NodeId,
        from: NodeId,
        point: &Fp,
        poly: &Polynomial,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        if &poly.eval_u64(from.0) == point {
            let uuid = id.equal_uuid(our_id, from);
            acast.initiate(uuid, Payload::Equal { instance: id, i: our_id, j: from }, out);
        } else {
            warn!(%id, %from, "ivss: point check failed, withholding EQUAL");
        }
    }

    /// Delivered `EQUAL(i,j)` (§4.2): records the pair and, if we are the dealer, attempts to grow
    /// the candidate set `M`.
    pub fn on_equal_delivered(
        &mut self,
        id: IvssInstanceId,
        i: NodeId,
        j: NodeId,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) -> IvssOutcome {
        self.instances.entry(id).or_default().completed_equals.insert((i, j));
        if self.our_id == id.dealer {
            self.try_grow_candidate_set(id, ctx, acast, out);
        }
        self.try_verify_pending_mset(id, ctx, out);
        self.maybe_emit_sharing_complete(id, out)
    }

    /// Dealer-only: greedily rebuilds `M` from the currently-completed EQUAL pairs and A-Casts it
    /// once it reaches `n - t` members (§4.2 sharing, §9 "avoid incremental clique maintenance").
    fn try_grow_candidate_set(
        &mut self,
        id: IvssInstanceId,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        let sent = self.instances.get(&id).map(|i| i.sent_mset).unwrap_or(false);
        if sent {
            return;
        }
        let completed = self.instances.get(&id).map(|i| i.completed_equals.clone()).unwrap_or_default();
        let mut m: Vec<NodeId> = Vec::new();
        for candidate in ctx.net.all_ids() {
            let consistent_with_all = m.iter().all(|&u| {
                completed.contains(&(candidate, u)) && completed.contains(&(u, candidate))
            });
            if consistent_with_all {
                m.push(candidate);
            }
        }
        if m.len() >= ctx.net.agreement_set_threshold() {
            if let Some(inst) = self.instances.get_mut(&id) {
                inst.sent_mset = true;
            }
            debug!(%id, size = m.len(), "ivss: dealer broadcasting MSET");
            acast.initiate(id.mset_uuid(), Payload::MSet { instance: id, m }, out);
        }
    }

    /// Verifies a pending `MSET` against the locally-completed EQUAL pairs, flagging the dealer's
    /// pair with anyone it claimed consistency with falsely (§4.2 verification, §4.3 certification).
    fn try_verify_pending_mset(&mut self, id: IvssInstanceId, ctx: &Ctx<'_>, out: &mut dyn ServiceContext) {
        let Some(inst) = self.instances.get(&id) else { return };
        if inst.m_set.is_some() {
            return;
        }
        let Some(m) = inst.pending_mset.clone() else { return };
        let completed = inst.completed_equals.clone();
        if m.len() < ctx.net.agreement_set_threshold() {
            return;
        }
        let mut verified = true;
        for a in 0..m.len() {
            for b in (a + 1)..m.len() {
                let (u, v) = (m[a], m[b]);
                if !(completed.contains(&(u, v)) && completed.contains(&(v, u))) {
                    ctx.registry.flag(id.dealer, u);
                    ctx.registry.flag(id.dealer, v);
                    out.emit(NodeEvent::ByzantineFlagged { i: id.dealer, j: u });
                    verified = false;
                }
            }
        }
        if verified {
            if let Some(inst) = self.instances.get_mut(&id) {
                inst.m_set = Some(m);
            }
            trace!(%id, "ivss: MSET verified");
        }
    }

    /// Delivered `MSET(m)` (§4.2): stages it for verification against our own EQUAL evidence.
    pub fn on_mset_delivered(
        &mut self,
        id: IvssInstanceId,
        m: Vec<NodeId>,
        ctx: &Ctx<'_>,
        out: &mut dyn ServiceContext,
    ) -> IvssOutcome {
        {
            let inst = self.instances.entry(id).or_default();
            if inst.m_set.is_none() {
                inst.pending_mset = Some(m);
            }
        }
        self.try_verify_pending_mset(id, ctx, out);
        self.maybe_emit_sharing_complete(id, out)
    }

    fn maybe_emit_sharing_complete(&mut self, id: IvssInstanceId, out: &mut dyn ServiceContext) -> IvssOutcome {
        if let Some(inst) = self.instances.get_mut(&id) {
            if !inst.sharing_done && inst.m_set.is_some() && inst.received_poly.is_some() {
                inst.sharing_done = true;
                out.emit(NodeEvent::SharingComplete { instance: id });
                return IvssOutcome::SharingComplete(id);
            }
        }
        IvssOutcome::None
    }

    /// Starts the reconstruction phase for a sharing that has already completed locally: members
    /// of `M` A-Cast their revealed slice, everyone else participates as an observer (§4.2
    /// reconstruction).
    pub fn start_reconstruction(
        &mut self,
        id: IvssInstanceId,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) -> Result<(), IvssError> {
        let Some(inst) = self.instances.get(&id) else {
            return Err(IvssError::SharingNotComplete { instance: id });
        };
        if !inst.sharing_done {
            return Err(IvssError::SharingNotComplete { instance: id });
        }
        let in_m = inst.m_set.as_ref().map(|m| m.contains(&self.our_id)).unwrap_or(false);
        if in_m && !inst.sent_reveal {
            let poly = inst.received_poly.clone().expect("sharing_done implies a received slice");
            let inst = self.instances.get_mut(&id).expect("checked above");
            inst.sent_reveal = true;
            acast.initiate(id.reveal_uuid(self.our_id), Payload::Reveal { instance: id, sender: self.our_id, poly }, out);
        }
        Ok(())
    }

    /// Delivered `REVEAL(sender, poly)` (§4.2 reconstruction): records it and attempts to grow the
    /// interpolation set `IS`.
    pub fn on_reveal_delivered(
        &mut self,
        id: IvssInstanceId,
        sender: NodeId,
        poly: Polynomial,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) -> IvssOutcome {
        self.instances.entry(id).or_default().revealed_polys.insert(sender, poly);
        self.try_recompute_interpolation_set(id, ctx, acast, out);
        self.try_emit_reconstructed(id, ctx, out)
    }

    /// Greedily rebuilds `IS` from `M ∩ revealed`, flagging any pairwise-inconsistent revealers,
    /// and interpolates the secret once `IS` reaches `n - 2t` members (§4.2 reconstruction, §9
    /// "avoid incremental clique maintenance").
    fn try_recompute_interpolation_set(
        &mut self,
        id: IvssInstanceId,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) {
        let Some(inst) = self.instances.get(&id) else { return };
        if inst.secret.is_some() {
            return;
        }
        let Some(m_set) = inst.m_set.clone() else { return };
        let revealed = inst.revealed_polys.clone();

        let mut candidates: Vec<NodeId> = revealed.keys().filter(|k| m_set.contains(k)).copied().collect();
        candidates.sort();
        if candidates.len() < ctx.net.interpolation_set_threshold() {
            return;
        }

        let mut is_set: Vec<NodeId> = Vec::new();
        for u in candidates {
            let poly_u = &revealed[&u];
            let consistent = is_set.iter().all(|&v| {
                let poly_v = &revealed[&v];
                let ok = poly_u.eval_u64(v.0) == poly_v.eval_u64(u.0);
                if !ok {
                    ctx.registry.flag(u, v);
                    out.emit(NodeEvent::ByzantineFlagged { i: u, j: v });
                }
                ok
            });
            if consistent {
                is_set.push(u);
            }
        }

        if is_set.len() < ctx.net.interpolation_set_threshold() {
            return;
        }

        let points: Vec<(Fp, Fp)> = is_set
            .iter()
            .map(|member| (Fp::from_u64(member.0), revealed[member].eval_u64(0)))
            .collect();
        let secret = interpolate_at_zero(&points);
        debug!(%id, is_size = is_set.len(), "ivss: interpolated secret");

        let inst = self.instances.get_mut(&id).expect("checked above");
        inst.interpolation_set = is_set;
        inst.secret = Some(secret);
        if !inst.sent_ready_recon {
            inst.sent_ready_recon = true;
            acast.initiate(
                id.ready_uuid(self.our_id),
                Payload::ReconstructReady { instance: id, sender: self.our_id },
                out,
            );
        }
    }

    /// Delivered a reconstruction `READY(sender)` (§4.2 reconstruction): once `n - t` peers
    /// confirm and we have our own interpolated secret, the reconstruction is complete.
    pub fn on_ready_delivered(
        &mut self,
        id: IvssInstanceId,
        sender: NodeId,
        ctx: &Ctx<'_>,
        out: &mut dyn ServiceContext,
    ) -> IvssOutcome {
        self.instances.entry(id).or_default().ready_from.insert(sender);
        self.try_emit_reconstructed(id, ctx, out)
    }

    fn try_emit_reconstructed(&mut self, id: IvssInstanceId, ctx: &Ctx<'_>, out: &mut dyn ServiceContext) -> IvssOutcome {
        if let Some(inst) = self.instances.get_mut(&id) {
            if !inst.reconstructed
                && inst.ready_from.len() >= ctx.net.agreement_set_threshold()
            {
                if let Some(secret) = inst.secret.clone() {
                    inst.reconstructed = true;
                    out.emit(NodeEvent::Reconstructed { instance: id, secret: secret.clone() });
                    return IvssOutcome::Reconstructed(id, secret);
                }
            }
        }
        IvssOutcome::None
    }

    /// Feeds one incoming A-Cast protocol message (`MSG`/`ECHO`/`READY`) through the shared
    /// [`AcastEngine`] and, on delivery, routes the resulting [`Payload`] to whichever IVSS
    /// handler owns that variant. A no-op for payload variants this engine does not own.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_acast(
        &mut self,
        uuid: &str,
        from: NodeId,
        kind: crate::messaging::AcastKind,
        payload: Payload,
        ctx: &Ctx<'_>,
        acast: &mut AcastEngine,
        out: &mut dyn ServiceContext,
    ) -> IvssOutcome {
        let Some(delivered) = acast.handle(uuid, from, kind, payload, ctx.net, out) else {
            return IvssOutcome::None;
        };
        match delivered {
            Payload::Equal { instance, i, j } => self.on_equal_delivered(instance, i, j, ctx, acast, out),
            Payload::MSet { instance, m } => self.on_mset_delivered(instance, m, ctx, out),
            Payload::Reveal { instance, sender, poly } => {
                self.on_reveal_delivered(instance, sender, poly, ctx, acast, out)
            }
            Payload::ReconstructReady { instance, sender } => self.on_ready_delivered(instance, sender, ctx, out),
            _ => IvssOutcome::None,
        }
    }

    pub fn sharing_done(&self, id: IvssInstanceId) -> bool {
        self.instances.get(&id).map(|i| i.sharing_done).unwrap_or(false)
    }

    pub fn m_set(&self, id: IvssInstanceId) -> Option<&[NodeId]> {
        self.instances.get(&id).and_then(|i| i.m_set.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certification::CertificationRegistry;
    use crate::instance_id::CountingInstanceIdSource;
    use crate::messaging::Output;
    use crate::network_info::NetworkInfoBuilder;
    use rand::rngs::OsRng;

    fn instance() -> IvssInstanceId {
        IvssInstanceId { round: 1, dealer: NodeId(1), secret_idx: NodeId(1) }
    }

    /// Drives a full 4-node, t=1 sharing to completion on every node by round-tripping shares,
    /// points, and the resulting A-Cast deliveries through independent engines. Messages are
    /// tracked as `(from, to, msg)` triples so point checks and A-Cast voter identity stay correct.
    #[test]
    fn sharing_completes_on_all_nodes_with_honest_participants() {
        let net = NetworkInfoBuilder::new(NodeId(1), 4, 1).build();
        let registry = CertificationRegistry::new();
        let source = CountingInstanceIdSource::default();
        let ctx = Ctx { net: &net, registry: &registry, source: &source };
        let id = instance();

        let mut engines: Vec<IvssEngine> = (1..=4).map(|i| IvssEngine::new(NodeId(i))).collect();
        let mut acasts: Vec<AcastEngine> = (0..4).map(|_| AcastEngine::new()).collect();

        let mut rng = OsRng;
        let secret = Fp::from_u64(777);
        let mut dealer_out = Output::new();
        engines[0].deal(id, secret.clone(), &ctx, &mut rng, &mut dealer_out);

        let mut pending: Vec<(NodeId, NodeId, crate::messaging::WireMessage)> = dealer_out
            .outgoing
            .into_iter()
            .map(|(target, msg)| match target {
                crate::messaging::Target::Node(to) => (NodeId(1), to, msg),
                crate::messaging::Target::All => panic!("shares are unicast, not broadcast"),
            })
            .collect();

        let mut guard = 0;
        while !pending.is_empty() {
            guard += 1;
            assert!(guard < 10_000, "ivss test loop did not converge");
            let mut next: Vec<(NodeId, NodeId, crate::messaging::WireMessage)> = Vec::new();
            for (from, to, msg) in pending.drain(..) {
                let idx = (to.0 - 1) as usize;
                let mut out = Output::new();
                match msg {
                    crate::messaging::WireMessage::IvssShare { instance, poly } => {
                        engines[idx].on_share_received(instance, poly, &ctx, &mut acasts[idx], &mut out);
                    }
                    crate::messaging::WireMessage::IvssPoint { instance, point } => {
                        engines[idx].on_point_received(instance, from, point, &mut acasts[idx], &mut out);
                    }
                    crate::messaging::WireMessage::Acast { uuid, kind, payload } => {
                        engines[idx].handle_acast(&uuid, from, kind, payload, &ctx, &mut acasts[idx], &mut out);
                    }
                }
                for (target, out_msg) in out.outgoing {
                    match target {
                        crate::messaging::Target::Node(n) => next.push((to, n, out_msg)),
                        crate::messaging::Target::All => {
                            for n in ctx.net.all_ids() {
                                next.push((to, n, out_msg.clone()));
                            }
                        }
                    }
                }
            }
            pending = next;
        }

        for engine in &engines {
            assert!(engine.sharing_done(id));
        }
    }

    /// Drives `pending` to quiescence across `engines`/`acasts`, dropping anything addressed to a
    /// node outside `alive` (models a silently halted receiver), and returns every emitted event.
    fn drive_to_quiescence(
        mut pending: Vec<(NodeId, NodeId, crate::messaging::WireMessage)>,
        engines: &mut [IvssEngine],
        acasts: &mut [AcastEngine],
        ctx: &Ctx<'_>,
        alive: &HashSet<NodeId>,
    ) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        let mut guard = 0;
        while !pending.is_empty() {
            guard += 1;
            assert!(guard < 10_000, "ivss drive loop did not converge");
            let mut next = Vec::new();
            for (from, to, msg) in pending.drain(..) {
                if !alive.contains(&to) {
                    continue;
                }
                let idx = (to.0 - 1) as usize;
                let mut out = Output::new();
                match msg {
                    crate::messaging::WireMessage::IvssShare { instance, poly } => {
                        engines[idx].on_share_received(instance, poly, ctx, &mut acasts[idx], &mut out);
                    }
                    crate::messaging::WireMessage::IvssPoint { instance, point } => {
                        engines[idx].on_point_received(instance, from, point, &mut acasts[idx], &mut out);
                    }
                    crate::messaging::WireMessage::Acast { uuid, kind, payload } => {
                        engines[idx].handle_acast(&uuid, from, kind, payload, ctx, &mut acasts[idx], &mut out);
                    }
                }
                events.extend(out.events.clone());
                for (target, out_msg) in out.outgoing {
                    match target {
                        crate::messaging::Target::Node(n) => next.push((to, n, out_msg)),
                        crate::messaging::Target::All => {
                            for n in ctx.net.all_ids() {
                                next.push((to, n, out_msg.clone()));
                            }
                        }
                    }
                }
            }
            pending = next;
        }
        events
    }

    /// S6: node 4 halts before ever responding; the remaining three still complete sharing (`M`
    /// settles on `{1,2,3}`, which already meets the `n-t` threshold) and reconstruct the dealer's
    /// secret once triggered.
    #[test]
    fn ivss_with_silent_receiver_still_completes_and_reconstructs() {
        let net = NetworkInfoBuilder::new(NodeId(1), 4, 1).build();
        let registry = CertificationRegistry::new();
        let source = CountingInstanceIdSource::default();
        let ctx = Ctx { net: &net, registry: &registry, source: &source };
        let id = instance();
        let alive: HashSet<NodeId> = [NodeId(1), NodeId(2), NodeId(3)].into_iter().collect();

        let mut engines: Vec<IvssEngine> = (1..=4).map(|i| IvssEngine::new(NodeId(i))).collect();
        let mut acasts: Vec<AcastEngine> = (0..4).map(|_| AcastEngine::new()).collect();

        let mut rng = OsRng;
        let secret = Fp::from_u64(42);
        let mut dealer_out = Output::new();
        engines[0].deal(id, secret.clone(), &ctx, &mut rng, &mut dealer_out);
        let pending: Vec<_> = dealer_out
            .outgoing
            .into_iter()
            .map(|(target, msg)| match target {
                crate::messaging::Target::Node(to) => (NodeId(1), to, msg),
                crate::messaging::Target::All => panic!("shares are unicast, not broadcast"),
            })
            .collect();

        drive_to_quiescence(pending, &mut engines, &mut acasts, &ctx, &alive);

        for &n in &alive {
            let idx = (n.0 - 1) as usize;
            assert!(engines[idx].sharing_done(id), "node {n} should complete sharing despite the silent peer");
        }

        let mut pending2 = Vec::new();
        for &n in &alive {
            let idx = (n.0 - 1) as usize;
            let in_m = engines[idx].m_set(id).map(|m| m.contains(&n)).unwrap_or(false);
            if in_m {
                let mut out = Output::new();
                engines[idx].start_reconstruction(id, &mut acasts[idx], &mut out).unwrap();
                for (target, msg) in out.outgoing {
                    match target {
                        crate::messaging::Target::Node(to) => pending2.push((n, to, msg)),
                        crate::messaging::Target::All => {
                            for p in ctx.net.all_ids() {
                                pending2.push((n, p, msg.clone()));
                            }
                        }
                    }
                }
            }
        }
        let events = drive_to_quiescence(pending2, &mut engines, &mut acasts, &ctx, &alive);

        let reconstructed: Vec<&Fp> = events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::Reconstructed { secret, .. } => Some(secret),
                _ => None,
            })
            .collect();
        assert!(reconstructed.len() >= alive.len(), "every alive node should reconstruct: {reconstructed:?}");
        for s in reconstructed {
            assert_eq!(*s, secret);
        }
    }

    /// S7: sharing completes honestly among all four nodes, but node 4 reveals a random polynomial
    /// instead of its real share. Nodes 1-3 still reconstruct the dealer's secret, and the
    /// certification registry ends up flagging node 4 against at least one honest revealer.
    #[test]
    fn ivss_with_bad_reveal_still_reconstructs_and_flags_the_liar() {
        let net = NetworkInfoBuilder::new(NodeId(1), 4, 1).build();
        let registry = CertificationRegistry::new();
        let source = CountingInstanceIdSource::default();
        let ctx = Ctx { net: &net, registry: &registry, source: &source };
        let id = instance();
        let all: HashSet<NodeId> = (1..=4).map(NodeId).collect();

        let mut engines: Vec<IvssEngine> = (1..=4).map(|i| IvssEngine::new(NodeId(i))).collect();
        let mut acasts: Vec<AcastEngine> = (0..4).map(|_| AcastEngine::new()).collect();

        let mut rng = OsRng;
        let secret = Fp::from_u64(42);
        let mut dealer_out = Output::new();
        engines[0].deal(id, secret.clone(), &ctx, &mut rng, &mut dealer_out);
        let pending: Vec<_> = dealer_out
            .outgoing
            .into_iter()
            .map(|(target, msg)| match target {
                crate::messaging::Target::Node(to) => (NodeId(1), to, msg),
                crate::messaging::Target::All => panic!("shares are unicast, not broadcast"),
            })
            .collect();
        drive_to_quiescence(pending, &mut engines, &mut acasts, &ctx, &all);
        for engine in &engines {
            assert!(engine.sharing_done(id));
        }

        let mut pending2 = Vec::new();
        for &n in &[NodeId(1), NodeId(2), NodeId(3)] {
            let idx = (n.0 - 1) as usize;
            let mut out = Output::new();
            engines[idx].start_reconstruction(id, &mut acasts[idx], &mut out).unwrap();
            for (target, msg) in out.outgoing {
                match target {
                    crate::messaging::Target::Node(to) => pending2.push((n, to, msg)),
                    crate::messaging::Target::All => {
                        for p in ctx.net.all_ids() {
                            pending2.push((n, p, msg.clone()));
                        }
                    }
                }
            }
        }
        // Node 4 is a member of M too, but instead of its real share it A-Casts a random
        // polynomial of the same degree as its reveal.
        let bad_poly = Polynomial::new((0..=net.t).map(|_| Fp::random(&mut rng)).collect());
        let mut bad_out = Output::new();
        acasts[3].initiate(
            id.reveal_uuid(NodeId(4)),
            Payload::Reveal { instance: id, sender: NodeId(4), poly: bad_poly },
            &mut bad_out,
        );
        for (target, msg) in bad_out.outgoing {
            match target {
                crate::messaging::Target::Node(to) => pending2.push((NodeId(4), to, msg)),
                crate::messaging::Target::All => {
                    for p in ctx.net.all_ids() {
                        pending2.push((NodeId(4), p, msg.clone()));
                    }
                }
            }
        }

        let events = drive_to_quiescence(pending2, &mut engines, &mut acasts, &ctx, &all);

        assert!(
            events.iter().any(|e| matches!(e, NodeEvent::ByzantineFlagged { i, j } if *i == NodeId(4) || *j == NodeId(4))),
            "a random reveal must get node 4 flagged against some honest revealer"
        );
        assert!(
            [NodeId(1), NodeId(2), NodeId(3)].iter().any(|&n| registry.is_flagged(NodeId(4), n)),
            "the certification registry must contain {{4, x}} for some honest x"
        );

        let reconstructed: Vec<&Fp> = events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::Reconstructed { secret, .. } => Some(secret),
                _ => None,
            })
            .collect();
        assert!(!reconstructed.is_empty(), "honest nodes must still reconstruct despite the bad reveal");
        for s in reconstructed {
            assert_eq!(*s, secret, "reconstructed secret must match the dealer's original despite the liar");
        }
    }

    #[test]
    fn point_mismatch_withholds_equal() {
        let net = NetworkInfoBuilder::new(NodeId(1), 4, 1).build();
        let registry = CertificationRegistry::new();
        let source = CountingInstanceIdSource::default();
        let ctx = Ctx { net: &net, registry: &registry, source: &source };
        let id = instance();

        let mut engine = IvssEngine::new(NodeId(1));
        let mut acast = AcastEngine::new();
        let mut out = Output::new();
        let poly = Polynomial::new(vec![Fp::from_u64(1), Fp::from_u64(2)]);
        engine.on_share_received(id, poly, &ctx, &mut acast, &mut out);

        let mut out2 = Output::new();
        engine.on_point_received(id, NodeId(2), Fp::from_u64(999_999), &mut acast, &mut out2);
        assert!(out2.outgoing.is_empty(), "a mismatched point must never trigger an EQUAL broadcast");
    }
}
