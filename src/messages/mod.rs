//! Message types exchanged between validators, plus helpers for inspecting
//! batches of messages.
//!
//! The consensus core never looks inside a raw proposal or a signature; it
//! only moves these types around and asks the backend questions about them.
use std::fmt;


/// Identifier of a validator, as assigned by the backend.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValidatorId(pub Vec<u8>);

impl fmt::Debug for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorId(0x")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Hash of a proposal, as computed by the backend.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProposalHash(pub Vec<u8>);

impl fmt::Debug for ProposalHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProposalHash(0x")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Raw proposal body, opaque to the consensus core.
pub type RawProposal = Vec<u8>;

/// A `(height, round)` pair identifying a single protocol instance.
///
/// The height is fixed for the lifetime of a sequence; the round only ever
/// increases within it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct View {
    /// Block height the sequence is deciding.
    pub height: u64,
    /// Round within the sequence.
    pub round: u64,
}

impl View {
    /// Constructs a view.
    pub fn new(height: u64, round: u64) -> Self {
        Self { height, round }
    }
}

/// The consensus phase a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Proposal broadcast by the round's proposer.
    PrePrepare,
    /// Vote that a validator received a valid proposal.
    Prepare,
    /// Vote that a validator saw a prepare quorum, carrying a committed seal.
    Commit,
    /// Declaration of intent to abandon the current round.
    RoundChange,
}

/// A proposal body together with the round it was produced at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    /// Opaque proposal bytes.
    pub raw_proposal: RawProposal,
    /// Round the proposal was produced at.
    pub round: u64,
}

/// Validator signature over a committed proposal hash. A quorum of these is
/// the ledger-level proof of commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedSeal {
    /// Validator that produced the seal.
    pub signer: Vec<u8>,
    /// Signature over the proposal hash.
    pub signature: Vec<u8>,
}

/// Evidence that a quorum prepared a specific proposal at some prior round.
/// Carried inside round change messages to preserve safety across rounds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedCertificate {
    /// The pre-prepare message the quorum prepared on.
    pub proposal_message: Message,
    /// The prepare messages backing it.
    pub prepare_messages: Vec<Message>,
}

/// A quorum of round change messages for the same view, justifying a
/// proposal at a round above zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundChangeCertificate {
    /// The round change messages making up the certificate.
    pub round_change_messages: Vec<Message>,
}

/// Payload of a pre-prepare message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrePrepareData {
    /// The proposed value.
    pub proposal: Proposal,
    /// Backend hash of the proposed value.
    pub proposal_hash: ProposalHash,
    /// Certificate justifying the proposal; required for rounds above zero.
    pub certificate: Option<RoundChangeCertificate>,
}

/// Payload of a round change message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundChangeData {
    /// The proposal this node last prepared, if any.
    pub last_prepared_proposal: Option<Proposal>,
    /// The certificate proving the node prepared `last_prepared_proposal`.
    pub latest_prepared_certificate: Option<Box<PreparedCertificate>>,
}

/// Typed payload of a consensus message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Proposal for the view.
    PrePrepare(PrePrepareData),
    /// Prepare vote.
    Prepare {
        /// Hash of the proposal being prepared.
        proposal_hash: ProposalHash,
    },
    /// Commit vote.
    Commit {
        /// Hash of the proposal being committed.
        proposal_hash: ProposalHash,
        /// The sender's committed seal over the hash.
        committed_seal: CommittedSeal,
    },
    /// Round change declaration.
    RoundChange(RoundChangeData),
}

impl Payload {
    /// The message type this payload belongs to.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::PrePrepare(_) => MessageType::PrePrepare,
            Payload::Prepare { .. } => MessageType::Prepare,
            Payload::Commit { .. } => MessageType::Commit,
            Payload::RoundChange(_) => MessageType::RoundChange,
        }
    }
}

/// A signed consensus message, as produced by the backend's builders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// The validator that signed the message.
    pub from: ValidatorId,
    /// The view the message belongs to.
    pub view: View,
    /// Typed payload.
    pub payload: Payload,
}

impl Message {
    /// The message type.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// The proposal carried by a pre-prepare message.
    pub fn proposal(&self) -> Option<&Proposal> {
        match &self.payload {
            Payload::PrePrepare(data) => Some(&data.proposal),
            _ => None,
        }
    }

    /// The proposal hash carried by a pre-prepare message.
    pub fn proposal_hash(&self) -> Option<&ProposalHash> {
        match &self.payload {
            Payload::PrePrepare(data) => Some(&data.proposal_hash),
            _ => None,
        }
    }

    /// The proposal hash carried by a prepare message.
    pub fn prepare_hash(&self) -> Option<&ProposalHash> {
        match &self.payload {
            Payload::Prepare { proposal_hash } => Some(proposal_hash),
            _ => None,
        }
    }

    /// The proposal hash carried by a commit message.
    pub fn commit_hash(&self) -> Option<&ProposalHash> {
        match &self.payload {
            Payload::Commit { proposal_hash, .. } => Some(proposal_hash),
            _ => None,
        }
    }

    /// The committed seal carried by a commit message.
    pub fn committed_seal(&self) -> Option<&CommittedSeal> {
        match &self.payload {
            Payload::Commit { committed_seal, .. } => Some(committed_seal),
            _ => None,
        }
    }

    /// The round change certificate attached to a pre-prepare message.
    pub fn round_change_certificate(&self) -> Option<&RoundChangeCertificate> {
        match &self.payload {
            Payload::PrePrepare(data) => data.certificate.as_ref(),
            _ => None,
        }
    }

    /// The latest prepared certificate carried by a round change message.
    pub fn latest_pc(&self) -> Option<&PreparedCertificate> {
        match &self.payload {
            Payload::RoundChange(data) => data.latest_prepared_certificate.as_deref(),
            _ => None,
        }
    }

    /// The last prepared proposal carried by a round change message.
    pub fn last_prepared_proposal(&self) -> Option<&Proposal> {
        match &self.payload {
            Payload::RoundChange(data) => data.last_prepared_proposal.as_ref(),
            _ => None,
        }
    }

    /// The proposal hash referenced by the message, for the message types
    /// that reference one.
    fn referenced_hash(&self) -> Option<&ProposalHash> {
        match &self.payload {
            Payload::PrePrepare(data) => Some(&data.proposal_hash),
            Payload::Prepare { proposal_hash } => Some(proposal_hash),
            Payload::Commit { proposal_hash, .. } => Some(proposal_hash),
            Payload::RoundChange(_) => None,
        }
    }
}

/// Whether every message in the batch comes from a distinct sender.
/// An empty batch has no senders and fails the check.
pub fn has_unique_senders(messages: &[Message]) -> bool {
    if messages.is_empty() {
        return false;
    }
    let mut senders = std::collections::HashSet::new();
    messages.iter().all(|msg| senders.insert(&msg.from))
}

/// Whether every message in the batch references the same proposal hash.
pub fn have_same_proposal_hash(messages: &[Message]) -> bool {
    let Some(first) = messages.first().and_then(Message::referenced_hash) else {
        return false;
    };
    messages
        .iter()
        .all(|msg| msg.referenced_hash() == Some(first))
}

/// Whether every message in the batch is for a round strictly below `round`.
pub fn all_have_lower_round(messages: &[Message], round: u64) -> bool {
    !messages.is_empty() && messages.iter().all(|msg| msg.view.round < round)
}

/// Whether every message in the batch is for the given height.
pub fn all_have_same_height(messages: &[Message], height: u64) -> bool {
    !messages.is_empty() && messages.iter().all(|msg| msg.view.height == height)
}

/// Whether every message in the batch is for the same round.
pub fn all_have_same_round(messages: &[Message]) -> bool {
    let Some(first) = messages.first() else {
        return false;
    };
    messages.iter().all(|msg| msg.view.round == first.view.round)
}

/// Error extracting committed seals from a batch of messages.
#[derive(Debug, thiserror::Error)]
pub enum SealExtractError {
    /// A message in the batch is not a commit message.
    #[error("message from {from:?} is not a commit message")]
    NotACommit {
        /// Sender of the offending message.
        from: ValidatorId,
    },
}

/// Extracts the committed seals out of a batch of commit messages.
pub fn extract_committed_seals(
    messages: &[Message],
) -> Result<Vec<CommittedSeal>, SealExtractError> {
    messages
        .iter()
        .map(|msg| {
            msg.committed_seal()
                .cloned()
                .ok_or_else(|| SealExtractError::NotACommit {
                    from: msg.from.clone(),
                })
        })
        .collect()
}
