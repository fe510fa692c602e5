//! # IBFT consensus core
//! This crate implements the core of an IBFT (Istanbul Byzantine Fault
//! Tolerant) consensus state machine: a PBFT-style three-phase protocol
//! with explicit round changes. A single [`Ibft`] instance drives agreement
//! for one block height at a time. [`Ibft::run_sequence`] cooperates with
//! the other validators to settle on exactly one proposal and to gather a
//! quorum of committed seals for it, which the backend then inserts into
//! the replicated ledger.
//!
//! Everything chain-specific is delegated: cryptography, proposal hashing,
//! validator-set membership and quorum arithmetic live behind the
//! [`Backend`] trait, and outbound message dispatch behind the [`Transport`]
//! trait. Inbound messages are fed into the instance with
//! [`Ibft::add_message`]; they land in a quorum-aware message store which
//! wakes up the round workers through subscriptions.
//!
//! Within a round the node runs a timer, two watchers for higher-round
//! evidence (proposals and round change certificates) and the three phase
//! reception workers concurrently. The first of them to produce an event
//! decides how the round ends; the remaining workers are canceled and
//! joined before the sequence moves on, so no worker ever outlives the
//! round that spawned it.
use crate::messages::{
    CommittedSeal, Message, MessageType, PreparedCertificate, Proposal, ProposalHash, RawProposal,
    RoundChangeCertificate, ValidatorId, View,
};
use std::fmt;
use zksync_concurrency::ctx;

mod config;
mod ibft;
pub mod messages;
mod metrics;
pub mod store;

pub use config::{Config, DEFAULT_BASE_ROUND_TIMEOUT};
pub use ibft::Ibft;

/// Chain-specific collaborator of the consensus core.
///
/// The backend owns everything the core treats as opaque: identities and
/// signatures, proposal construction and hashing, validator-set membership,
/// quorum arithmetic and ledger insertion. All message builders are expected
/// to produce fully signed messages attributed to the local validator.
#[async_trait::async_trait]
pub trait Backend: fmt::Debug + Send + Sync {
    /// Identifier of the local validator.
    fn id(&self) -> ValidatorId;

    /// Whether `id` is the designated proposer for the given height and round.
    fn is_proposer(&self, id: &ValidatorId, height: u64, round: u64) -> bool;

    /// Whether the message is authentic and its sender belongs to the
    /// validator set.
    fn is_valid_validator(&self, message: &Message) -> bool;

    /// Whether the raw proposal body is acceptable for the ledger.
    fn is_valid_proposal(&self, raw_proposal: &[u8]) -> bool;

    /// Whether `hash` is the hash of `proposal`.
    fn is_valid_proposal_hash(&self, proposal: &Proposal, hash: &ProposalHash) -> bool;

    /// Whether `seal` is a valid committed seal over `proposal_hash`.
    fn is_valid_committed_seal(&self, proposal_hash: &ProposalHash, seal: &CommittedSeal) -> bool;

    /// Whether `messages` constitute a quorum of the given message type at
    /// `height`. The slice is deduplicated by sender before the call only to
    /// the extent the message store deduplicates, so implementations should
    /// count distinct senders.
    fn has_quorum(&self, height: u64, messages: &[Message], message_type: MessageType) -> bool;

    /// Builds a new raw proposal for the given view. May perform I/O and is
    /// therefore cancellable through `ctx`.
    async fn build_proposal(&self, ctx: &ctx::Ctx, view: View) -> ctx::Result<RawProposal>;

    /// Builds a signed pre-prepare message carrying `raw_proposal` and, for
    /// rounds above zero, the round change certificate justifying it.
    fn build_pre_prepare_message(
        &self,
        raw_proposal: RawProposal,
        certificate: Option<RoundChangeCertificate>,
        view: View,
    ) -> Message;

    /// Builds a signed prepare message for `proposal_hash`.
    fn build_prepare_message(&self, proposal_hash: ProposalHash, view: View) -> Message;

    /// Builds a signed commit message for `proposal_hash`, including the
    /// local validator's committed seal.
    fn build_commit_message(&self, proposal_hash: ProposalHash, view: View) -> Message;

    /// Builds a signed round change message, carrying the latest prepared
    /// proposal and certificate if this node prepared one in an earlier round.
    fn build_round_change_message(
        &self,
        last_prepared_proposal: Option<Proposal>,
        latest_pc: Option<PreparedCertificate>,
        view: View,
    ) -> Message;

    /// Inserts a finalized proposal, together with the quorum of committed
    /// seals proving it, into the ledger.
    async fn insert_proposal(
        &self,
        ctx: &ctx::Ctx,
        proposal: Proposal,
        committed_seals: Vec<CommittedSeal>,
    ) -> ctx::Result<()>;
}

/// Outbound side of the network stack.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Best-effort broadcast to the validator set. No ordering or delivery
    /// guarantees are assumed. The broadcast must include the local node:
    /// the node's own PREPARE and COMMIT votes count toward quorum only by
    /// arriving back through [`Ibft::add_message`].
    fn multicast(&self, message: Message);
}
