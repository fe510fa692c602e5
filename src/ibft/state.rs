//! Per-sequence consensus state.
use crate::messages::{CommittedSeal, Message, PreparedCertificate, Proposal, ProposalHash, RawProposal, View};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    /// Current view. The height is fixed for the sequence; the round only
    /// ever increases.
    view: View,
    /// The pre-prepare message accepted for the current round, if any.
    proposal_message: Option<Message>,
    /// The certificate of the highest round at which this node observed a
    /// prepare quorum. Survives round changes.
    latest_pc: Option<PreparedCertificate>,
    /// The proposal `latest_pc` certifies. Survives round changes.
    latest_prepared_proposal: Option<Proposal>,
    /// Committed seals gathered once the commit quorum is reached.
    committed_seals: Vec<CommittedSeal>,
    /// Whether the current round's state machine has started.
    round_started: bool,
    /// Whether this node already multicast a commit for the current round.
    commit_sent: bool,
}

/// Guarded accessors around the state shared between the sequence driver and
/// its round workers. Every method takes the lock for the duration of the
/// call only; nothing is held across suspension points.
#[derive(Debug, Default)]
pub(crate) struct StateHandle(Mutex<State>);

impl StateHandle {
    pub(crate) fn view(&self) -> View {
        self.0.lock().unwrap().view
    }

    pub(crate) fn height(&self) -> u64 {
        self.0.lock().unwrap().view.height
    }

    pub(crate) fn round(&self) -> u64 {
        self.0.lock().unwrap().view.round
    }

    pub(crate) fn proposal_message(&self) -> Option<Message> {
        self.0.lock().unwrap().proposal_message.clone()
    }

    /// The proposal extracted from the accepted pre-prepare message.
    pub(crate) fn proposal(&self) -> Option<Proposal> {
        let state = self.0.lock().unwrap();
        state
            .proposal_message
            .as_ref()
            .and_then(|msg| msg.proposal().cloned())
    }

    /// Raw body of the accepted proposal; empty if none was accepted.
    pub(crate) fn raw_proposal(&self) -> RawProposal {
        self.proposal()
            .map(|proposal| proposal.raw_proposal)
            .unwrap_or_default()
    }

    pub(crate) fn proposal_hash(&self) -> Option<ProposalHash> {
        let state = self.0.lock().unwrap();
        state
            .proposal_message
            .as_ref()
            .and_then(|msg| msg.proposal_hash().cloned())
    }

    pub(crate) fn latest_pc(&self) -> Option<PreparedCertificate> {
        self.0.lock().unwrap().latest_pc.clone()
    }

    pub(crate) fn latest_prepared_proposal(&self) -> Option<Proposal> {
        self.0.lock().unwrap().latest_prepared_proposal.clone()
    }

    pub(crate) fn committed_seals(&self) -> Vec<CommittedSeal> {
        self.0.lock().unwrap().committed_seals.clone()
    }

    pub(crate) fn commit_sent(&self) -> bool {
        self.0.lock().unwrap().commit_sent
    }

    pub(crate) fn set_view(&self, view: View) {
        self.0.lock().unwrap().view = view;
    }

    pub(crate) fn set_round_started(&self, started: bool) {
        self.0.lock().unwrap().round_started = started;
    }

    pub(crate) fn set_proposal_message(&self, message: Option<Message>) {
        self.0.lock().unwrap().proposal_message = message;
    }

    pub(crate) fn set_commit_sent(&self, sent: bool) {
        self.0.lock().unwrap().commit_sent = sent;
    }

    pub(crate) fn set_committed_seals(&self, seals: Vec<CommittedSeal>) {
        self.0.lock().unwrap().committed_seals = seals;
    }

    /// Resets the state for a fresh sequence at `height`.
    pub(crate) fn clear(&self, height: u64) {
        let mut state = self.0.lock().unwrap();
        *state = State {
            view: View::new(height, 0),
            ..State::default()
        };
    }

    /// Marks the round started, clearing the per-round transient fields.
    /// A round that was already marked started (a proposal accepted through
    /// the future-proposal jump) is left untouched.
    pub(crate) fn new_round(&self) {
        let mut state = self.0.lock().unwrap();
        if !state.round_started {
            state.proposal_message = None;
            state.commit_sent = false;
            state.round_started = true;
        }
    }

    /// Atomically records the prepare quorum: the certificate and the
    /// proposal it certifies, to be carried in future round change messages.
    pub(crate) fn finalize_prepare(&self, certificate: PreparedCertificate, proposal: Proposal) {
        let mut state = self.0.lock().unwrap();
        state.latest_pc = Some(certificate);
        state.latest_prepared_proposal = Some(proposal);
    }
}
