//! Round change certificates and prepared certificates.
use super::{EventSender, Ibft, RoundEvent};
use crate::{
    messages::{
        self, MessageType, PreparedCertificate, Proposal, RoundChangeCertificate, View,
    },
    store::SubscriptionDetails,
};
use std::sync::Arc;
use zksync_concurrency::ctx;

impl Ibft {
    /// Watches the store for round change certificates for rounds higher
    /// than the current one. A single certificate is enough evidence to hop
    /// straight to its round.
    pub(crate) async fn watch_for_future_rcc(
        &self,
        ctx: &ctx::Ctx,
        events: &EventSender,
    ) -> ctx::OrCanceled<()> {
        let view = self.state.view();
        let mut sub = self.store.subscribe(SubscriptionDetails {
            message_type: MessageType::RoundChange,
            view: View::new(view.height, view.round + 1),
            has_min_round: true,
            has_quorum: Arc::new(|_, messages, _| !messages.is_empty()),
        });

        loop {
            sub.notified(ctx).await?;

            let Some(rcc) = self.handle_round_change_message(&view) else {
                continue;
            };
            let round = rcc.round_change_messages[0].view.round;

            events.send(ctx, RoundEvent::FutureRcc { round }).await?;
            return Ok(());
        }
    }

    /// Waits for a round change certificate for `(height, round)`; the
    /// proposer of a round above 0 needs one before it may propose.
    pub(crate) async fn wait_for_rcc(
        &self,
        ctx: &ctx::Ctx,
        height: u64,
        round: u64,
    ) -> ctx::OrCanceled<RoundChangeCertificate> {
        let view = View::new(height, round);
        let mut sub = self.store.subscribe(SubscriptionDetails {
            message_type: MessageType::RoundChange,
            view,
            has_min_round: false,
            has_quorum: self.backend_quorum(),
        });

        loop {
            sub.notified(ctx).await?;

            if let Some(rcc) = self.handle_round_change_message(&view) {
                return Ok(rcc);
            }
        }
    }

    /// Assembles a round change certificate out of the stored round change
    /// messages, if some round has gathered a quorum of valid ones. Messages
    /// for the current round only count while the node has not accepted a
    /// proposal at that round.
    pub(crate) fn handle_round_change_message(
        &self,
        view: &View,
    ) -> Option<RoundChangeCertificate> {
        let height = view.height;
        let has_accepted_proposal = self.state.proposal_message().is_some();

        let is_valid_message = |msg: &messages::Message| {
            if !self.valid_pc(msg.latest_pc(), msg.view.round, height) {
                return false;
            }
            self.proposal_matches_certificate(msg.last_prepared_proposal(), msg.latest_pc())
        };

        let is_valid_rcc = |round: u64, msgs: &[messages::Message]| {
            if round == view.round && has_accepted_proposal {
                return false;
            }
            self.config
                .backend
                .has_quorum(height, msgs, MessageType::RoundChange)
        };

        let round_change_messages =
            self.store
                .get_extended_rcc(height, is_valid_message, is_valid_rcc)?;

        Some(RoundChangeCertificate {
            round_change_messages,
        })
    }

    /// Verifies a prepared certificate. An absent certificate is valid: the
    /// absence of evidence is not invalid evidence. A present one must be a
    /// prepare quorum of uniquely-sent, same-hash, same-height messages for
    /// a single round strictly below `round_limit`, proposed by that round's
    /// proposer and prepared by validators other than the proposer.
    pub(crate) fn valid_pc(
        &self,
        certificate: Option<&PreparedCertificate>,
        round_limit: u64,
        height: u64,
    ) -> bool {
        let Some(certificate) = certificate else {
            return true;
        };

        if certificate.prepare_messages.is_empty() {
            return false;
        }

        // The pre-prepare message must be the first element.
        let mut all_messages = vec![certificate.proposal_message.clone()];
        all_messages.extend(certificate.prepare_messages.iter().cloned());

        let backend = &self.config.backend;
        if !backend.has_quorum(self.state.height(), &all_messages, MessageType::Prepare) {
            return false;
        }

        if certificate.proposal_message.message_type() != MessageType::PrePrepare {
            return false;
        }
        if certificate
            .prepare_messages
            .iter()
            .any(|msg| msg.message_type() != MessageType::Prepare)
        {
            return false;
        }

        if !messages::has_unique_senders(&all_messages) {
            return false;
        }
        if !messages::have_same_proposal_hash(&all_messages) {
            return false;
        }
        if !messages::all_have_lower_round(&all_messages, round_limit) {
            return false;
        }
        if !messages::all_have_same_height(&all_messages, height) {
            return false;
        }
        if !messages::all_have_same_round(&all_messages) {
            return false;
        }

        let proposal_message = &certificate.proposal_message;
        if !backend.is_proposer(
            &proposal_message.from,
            proposal_message.view.height,
            proposal_message.view.round,
        ) {
            return false;
        }
        if !backend.is_valid_validator(proposal_message) {
            return false;
        }

        certificate.prepare_messages.iter().all(|msg| {
            backend.is_valid_validator(msg)
                && !backend.is_proposer(&msg.from, msg.view.height, msg.view.round)
        })
    }

    /// Checks a prepared certificate against the proposal it is claimed to
    /// certify: every hash in the certificate must be the proposal's hash.
    pub(crate) fn proposal_matches_certificate(
        &self,
        proposal: Option<&Proposal>,
        certificate: Option<&PreparedCertificate>,
    ) -> bool {
        let (proposal, certificate) = match (proposal, certificate) {
            // Neither is set: a round change that prepared nothing.
            (None, None) => return true,
            // One without the other can never match.
            (_, None) | (None, _) => return false,
            (Some(proposal), Some(certificate)) => (proposal, certificate),
        };

        let mut hashes = Vec::new();
        match certificate.proposal_message.proposal_hash() {
            Some(hash) => hashes.push(hash),
            None => return false,
        }
        for msg in &certificate.prepare_messages {
            match msg.prepare_hash() {
                Some(hash) => hashes.push(hash),
                None => return false,
            }
        }

        hashes
            .into_iter()
            .all(|hash| self.config.backend.is_valid_proposal_hash(proposal, hash))
    }
}
