//! Wire envelope types and the `ServiceContext` capability every engine handler is given to
//! produce outgoing messages and results (§6 message envelope layering, §9 design notes).
//!
//! The distilled spec describes the envelope as four nested structs (`ABAMessage` wrapping
//! `ICCMessage` wrapping `IVSSMessage`/`VoteMessage` wrapping `ACastMessage<T>`). This
//! implementation flattens that nesting into one tagged [`Payload`] sum type carried by a single,
//! layer-agnostic A-Cast engine (§4.4 design rationale in DESIGN.md) plus two direct,
//! non-broadcast IVSS message variants. Every `Payload` variant still carries exactly the fields
//! the nested structs would have, so the wire semantics are unchanged — only the Rust shape of
//! the envelope differs from a literal transliteration.

use serde::{Deserialize, Serialize};

use crate::field::{Fp, Polynomial};
use crate::instance_id::IvssInstanceId;
use crate::network_info::NodeId;

/// Broadcast recipients for an outgoing message (§4.7 transport abstraction).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    All,
    Node(NodeId),
}

/// The three A-Cast control message kinds (§4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcastKind {
    Msg,
    Echo,
    Ready,
}

/// The generic "value" an A-Cast instance carries, unifying every upper layer's broadcast
/// content (IVSS's `EQUAL`/`MSET`/`REVEAL`/reconstruction `READY`, ICC's `ATTACH`/`ACCEPT`/
/// `FINAL_SETS`, Vote's `INPUT`/`VOTE1`/`REVOTE`, and the ABA termination gadget's `COMPLETE`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Payload {
    Equal {
        instance: IvssInstanceId,
        i: NodeId,
        j: NodeId,
    },
    MSet {
        instance: IvssInstanceId,
        m: Vec<NodeId>,
    },
    Reveal {
        instance: IvssInstanceId,
        sender: NodeId,
        poly: Polynomial,
    },
    ReconstructReady {
        instance: IvssInstanceId,
        sender: NodeId,
    },
    Attach {
        round: u64,
        sender: NodeId,
        set_t: Vec<NodeId>,
    },
    Accept {
        round: u64,
        sender: NodeId,
        set_a: Vec<NodeId>,
    },
    FinalSets {
        round: u64,
        sender: NodeId,
        set_h: Vec<NodeId>,
        set_s: Vec<NodeId>,
    },
    Input {
        round: u64,
        sender: NodeId,
        bit: bool,
    },
    Vote1 {
        round: u64,
        sender: NodeId,
        set: Vec<NodeId>,
        bit: bool,
    },
    Revote {
        round: u64,
        sender: NodeId,
        set: Vec<NodeId>,
        bit: bool,
    },
    Complete {
        sender: NodeId,
        value: bool,
    },
}

impl Payload {
    /// The ABA round this payload is scoped to, used for the cross-round buffering in §4.6/§5.
    /// `Complete` is not round-scoped: it belongs to the whole run.
    pub fn round(&self) -> Option<u64> {
        match self {
            Payload::Equal { instance, .. }
            | Payload::MSet { instance, .. }
            | Payload::Reveal { instance, .. }
            | Payload::ReconstructReady { instance, .. } => Some(instance.round),
            Payload::Attach { round, .. }
            | Payload::Accept { round, .. }
            | Payload::FinalSets { round, .. }
            | Payload::Input { round, .. }
            | Payload::Vote1 { round, .. }
            | Payload::Revote { round, .. } => Some(*round),
            Payload::Complete { .. } => None,
        }
    }
}

/// The top-level wire message a node sends another node (§6).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Direct (non-A-Cast) dealer-to-receiver delivery of a univariate slice (§4.2 sharing).
    IvssShare { instance: IvssInstanceId, poly: Polynomial },
    /// Direct (non-A-Cast) receiver-to-receiver point check (§4.2 sharing).
    IvssPoint { instance: IvssInstanceId, point: Fp },
    /// An A-Cast protocol message: `MSG`, `ECHO`, or `READY` carrying a [`Payload`] (§4.1).
    Acast {
        uuid: String,
        kind: AcastKind,
        payload: Payload,
    },
}

/// The round this wire message is scoped to, if any (mirrors [`Payload::round`]).
pub fn message_round(msg: &WireMessage) -> Option<u64> {
    match msg {
        WireMessage::IvssShare { instance, .. } | WireMessage::IvssPoint { instance, .. } => {
            Some(instance.round)
        }
        WireMessage::Acast { payload, .. } => payload.round(),
    }
}

/// An envelope as it crosses the transport: who sent it, and its body.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub body: WireMessage,
}

/// Diagnostic and driver-facing results a node's engines emit (§4.2, §4.4, §4.5, §4.6).
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    SharingComplete { instance: IvssInstanceId },
    Reconstructed { instance: IvssInstanceId, secret: Fp },
    IccResult { round: u64, coin: bool },
    VoteResult { round: u64, value: Option<bool>, confidence: u8 },
    Decided { value: bool },
    ByzantineFlagged { i: NodeId, j: NodeId },
}

/// The capability passed into every engine handler to produce outgoing messages and results,
/// named after the `ServiceContext<M,R>` capability the design notes describe (§9) as a
/// language-neutral alternative to virtual-dispatch adapters. [`Output`] is its concrete,
/// non-generic implementation: one shared shape for every layer rather than a distinct `Step<M,R>`
/// per layer, since this crate funnels all layers' outgoing traffic through one [`WireMessage`].
pub trait ServiceContext {
    fn broadcast(&mut self, msg: WireMessage);
    fn unicast(&mut self, to: NodeId, msg: WireMessage);
    fn emit(&mut self, event: NodeEvent);
}

/// Accumulates the outgoing messages and events produced while handling one envelope (§5: a
/// message is handled atomically to completion, including any synchronously-triggered
/// sub-handler invocations).
#[derive(Default, Debug)]
pub struct Output {
    pub outgoing: Vec<(Target, WireMessage)>,
    pub events: Vec<NodeEvent>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, mut other: Output) {
        self.outgoing.append(&mut other.outgoing);
        self.events.append(&mut other.events);
    }
}

impl ServiceContext for Output {
    fn broadcast(&mut self, msg: WireMessage) {
        self.outgoing.push((Target::All, msg));
    }

    fn unicast(&mut self, to: NodeId, msg: WireMessage) {
        self.outgoing.push((Target::Node(to), msg));
    }

    fn emit(&mut self, event: NodeEvent) {
        self.events.push(event);
    }
}
