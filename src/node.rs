//! The per-node service loop (§4.8, §5): one cooperative task per node draining its inbox,
//! dispatching each envelope to the owning engine, and flushing the resulting `Output` onto the
//! transport and the driver-facing event stream.

use std::sync::Arc;

use rand::rngs::StdRng;
use tracing::instrument;

use crate::aba::AbaState;
use crate::acast::AcastEngine;
use crate::certification::CertificationRegistry;
use crate::ctx::Ctx;
use crate::error::Result;
use crate::icc::IccEngine;
use crate::instance_id::InstanceIdSource;
use crate::ivss::IvssEngine;
use crate::messaging::{Envelope, NodeEvent, Output, Payload, WireMessage};
use crate::network_info::NetworkInfo;
use crate::transport::{Inbox, PeerRegistry};
use crate::vote::VoteEngine;

/// Owns every protocol-layer engine for one node and the ambient references they share (§4.8).
/// `Ctx` is built fresh, inline, at each call site from direct field projections (rather than
/// through a helper method) so the borrow checker can see it only touches `net`/`registry`/
/// `source`, leaving `ivss`/`icc`/`vote`/`aba`/`acast` independently mutably borrowable.
pub struct NodeService {
    our_id: crate::network_info::NodeId,
    net: Arc<NetworkInfo>,
    registry: Arc<CertificationRegistry>,
    source: Arc<dyn InstanceIdSource>,
    transport: PeerRegistry,
    rng: StdRng,

    acast: AcastEngine,
    ivss: IvssEngine,
    icc: IccEngine,
    vote: VoteEngine,
    aba: AbaState,
}

impl NodeService {
    pub fn new(
        net: Arc<NetworkInfo>,
        registry: Arc<CertificationRegistry>,
        source: Arc<dyn InstanceIdSource>,
        transport: PeerRegistry,
        rng: StdRng,
        input: bool,
    ) -> Self {
        let our_id = net.our_id;
        NodeService {
            our_id,
            net,
            registry,
            source,
            transport,
            rng,
            acast: AcastEngine::new(),
            ivss: IvssEngine::new(our_id),
            icc: IccEngine::new(our_id),
            vote: VoteEngine::new(our_id),
            aba: AbaState::new(our_id, input),
        }
    }

    /// Drives this node until it decides and has relayed its own `COMPLETE` broadcast (§4.6's
    /// termination policy note), returning the decided bit.
    #[instrument(skip_all, fields(node = %self.our_id))]
    pub async fn run(mut self, mut inbox: Inbox) -> Result<bool> {
        let mut out = Output::new();
        let ctx = Ctx { net: &self.net, registry: &self.registry, source: self.source.as_ref() };
        self.aba.start_round(&ctx, &mut self.vote, &mut self.icc, &mut self.ivss, &mut self.rng, &mut self.acast, &mut out);
        self.flush(out).await?;

        loop {
            if self.aba.is_decided() && self.aba.has_broadcast_complete() {
                break;
            }
            let Some(envelope) = inbox.recv().await else {
                break;
            };
            let mut out = Output::new();
            self.dispatch_buffered_or_now(envelope, &mut out);
            self.absorb_round_results(&mut out);
            self.flush(out).await?;
        }

        // `recv` only returns `None` once every sender (every peer, including ourselves) has
        // dropped its transport handle, which the driver does only after every node has decided.
        Ok(self.aba.decision().expect("inbox closes only after this node has observed a decision"))
    }

    fn dispatch_buffered_or_now(&mut self, envelope: Envelope, out: &mut Output) {
        let round = crate::messaging::message_round(&envelope.body);
        if self.aba.buffer_if_future(&envelope, round) {
            return;
        }
        self.dispatch(envelope, out);
    }

    fn dispatch(&mut self, envelope: Envelope, out: &mut Output) {
        let from = envelope.from;
        let ctx = Ctx { net: &self.net, registry: &self.registry, source: self.source.as_ref() };
        match envelope.body {
            WireMessage::IvssShare { instance, poly } => {
                let outcome = self.ivss.on_share_received(instance, poly, &ctx, &mut self.acast, out);
                self.icc.on_ivss_outcome(outcome, &ctx, &mut self.acast, out);
            }
            WireMessage::IvssPoint { instance, point } => {
                self.ivss.on_point_received(instance, from, point, &mut self.acast, out);
            }
            WireMessage::Acast { uuid, kind, payload } => match payload {
                Payload::Equal { .. } | Payload::MSet { .. } | Payload::Reveal { .. } | Payload::ReconstructReady { .. } => {
                    let outcome = self.ivss.handle_acast(&uuid, from, kind, payload, &ctx, &mut self.acast, out);
                    self.icc.on_ivss_outcome(outcome, &ctx, &mut self.acast, out);
                }
                Payload::Attach { .. } | Payload::Accept { .. } | Payload::FinalSets { .. } => {
                    self.icc.handle_acast(&uuid, from, kind, payload, &ctx, &mut self.ivss, &mut self.acast, out);
                }
                Payload::Input { .. } | Payload::Vote1 { .. } | Payload::Revote { .. } => {
                    self.vote.handle_acast(&uuid, from, kind, payload, &ctx, &mut self.acast, out);
                }
                Payload::Complete { .. } => {
                    self.aba.handle_acast(&uuid, from, kind, payload, &ctx, &mut self.acast, out);
                }
            },
        }
    }

    /// After handling one envelope, absorbs any `VoteResult`/`IccResult` it produced and, once the
    /// current round's pair is complete, applies the estimate-update rule, starts the next round,
    /// and replays anything buffered for it (§4.6).
    fn absorb_round_results(&mut self, out: &mut Output) {
        for event in out.events.clone() {
            match event {
                NodeEvent::VoteResult { round, value, confidence } => self.aba.on_vote_result(round, value, confidence),
                NodeEvent::IccResult { round, coin } => self.aba.on_icc_result(round, coin),
                _ => {}
            }
        }
        let round = self.aba.current_round();
        let Some((value, confidence, coin)) = self.aba.try_take_results(round) else { return };
        let ctx = Ctx { net: &self.net, registry: &self.registry, source: self.source.as_ref() };
        if !self.aba.advance(round, value, confidence, coin, &ctx, &mut self.acast, out) {
            return;
        }
        let ctx = Ctx { net: &self.net, registry: &self.registry, source: self.source.as_ref() };
        self.aba.start_round(&ctx, &mut self.vote, &mut self.icc, &mut self.ivss, &mut self.rng, &mut self.acast, out);
        for envelope in self.aba.drain_future(self.aba.current_round()) {
            self.dispatch(envelope, out);
        }
    }

    async fn flush(&self, out: Output) -> Result<()> {
        self.transport.deliver(self.our_id, out.outgoing).await
    }
}
