//! Reception, validation and construction of pre-prepare messages.
use super::{EventSender, Ibft, RoundEvent};
use crate::{
    messages::{self, Message, MessageType, RawProposal, View},
    store::SubscriptionDetails,
};
use std::sync::Arc;
use zksync_concurrency::ctx;

impl Ibft {
    /// Reception of the pre-prepare message for the current view. Once a
    /// valid proposal is found it is accepted and answered with a prepare.
    pub(crate) async fn run_pre_prepare(&self, ctx: &ctx::Ctx) -> ctx::OrCanceled<()> {
        tracing::debug!("receiving pre-prepare messages");

        let view = self.state.view();
        let mut sub = self.store.subscribe(SubscriptionDetails {
            message_type: MessageType::PrePrepare,
            view,
            has_min_round: false,
            has_quorum: Arc::new(|_, messages, _| !messages.is_empty()),
        });

        loop {
            if let Some(proposal_message) = self.handle_pre_prepare(&view) {
                self.accept_proposal(proposal_message);
                self.send_prepare_message(view);
                tracing::debug!("prepare message multicast");
                return Ok(());
            }
            sub.notified(ctx).await?;
        }
    }

    /// Picks the first valid proposal for `view` out of the store. Yields
    /// nothing if the node already accepted a proposal, which makes repeated
    /// deliveries of the same pre-prepare harmless.
    pub(crate) fn handle_pre_prepare(&self, view: &View) -> Option<Message> {
        if self.state.proposal_message().is_some() {
            return None;
        }

        let messages = self
            .store
            .get_valid_messages(view, MessageType::PrePrepare, |msg| {
                if view.round == 0 {
                    self.validate_round0_proposal(msg, view)
                } else {
                    self.validate_proposal(msg, view)
                }
            });
        messages.into_iter().next()
    }

    /// Validations shared by proposals of every round: the proposal is for
    /// this round, comes from the view's proposer, its hash checks out and
    /// its body is acceptable to the backend.
    fn validate_proposal_common(&self, msg: &Message, view: &View) -> bool {
        let backend = &self.config.backend;
        let Some(proposal) = msg.proposal() else {
            return false;
        };
        let Some(proposal_hash) = msg.proposal_hash() else {
            return false;
        };

        proposal.round == view.round
            && backend.is_proposer(&msg.from, view.height, view.round)
            && backend.is_valid_proposal_hash(proposal, proposal_hash)
            && backend.is_valid_proposal(&proposal.raw_proposal)
    }

    /// Validates a proposal for round 0. No certificate is required, but the
    /// local node must not be the proposer: its own proposal is accepted
    /// through the builder path, never through reception.
    pub(crate) fn validate_round0_proposal(&self, msg: &Message, view: &View) -> bool {
        let backend = &self.config.backend;

        msg.view.round == 0
            && self.validate_proposal_common(msg, view)
            && !backend.is_proposer(&backend.id(), view.height, view.round)
    }

    /// Validates a proposal for a round above 0: on top of the common
    /// validations, the attached round change certificate must be a quorum
    /// of well-formed round change messages for exactly this view, and if
    /// any of them certifies a previously prepared value, the proposal must
    /// re-propose the value prepared at the highest round.
    pub(crate) fn validate_proposal(&self, msg: &Message, view: &View) -> bool {
        let backend = &self.config.backend;

        if !self.validate_proposal_common(msg, view) {
            return false;
        }

        let Some(rcc) = msg.round_change_certificate() else {
            return false;
        };

        if !backend.has_quorum(
            view.height,
            &rcc.round_change_messages,
            MessageType::RoundChange,
        ) {
            return false;
        }

        if backend.is_proposer(&backend.id(), view.height, view.round) {
            return false;
        }

        if !messages::has_unique_senders(&rcc.round_change_messages) {
            return false;
        }

        for round_change in &rcc.round_change_messages {
            if round_change.message_type() != MessageType::RoundChange {
                return false;
            }
            if round_change.view.height != view.height {
                return false;
            }
            if round_change.view.round != view.round {
                return false;
            }
            if !backend.is_valid_validator(round_change) {
                return false;
            }
        }

        // Collect (round, hash) out of every valid prepared certificate
        // carried by the certificate's messages.
        let mut rounds_and_hashes = Vec::new();
        for round_change in &rcc.round_change_messages {
            let Some(pc) = round_change.latest_pc() else {
                continue;
            };
            if !self.valid_pc(Some(pc), msg.view.round, view.height) {
                continue;
            }
            let Some(hash) = pc.proposal_message.proposal_hash() else {
                continue;
            };
            rounds_and_hashes.push((pc.proposal_message.view.round, hash));
        }

        if rounds_and_hashes.is_empty() {
            return true;
        }

        // Highest round wins; on equal rounds the later entry wins.
        let mut max_round = 0;
        let mut expected_hash = None;
        for (round, hash) in rounds_and_hashes {
            if round >= max_round {
                max_round = round;
                expected_hash = Some(hash);
            }
        }

        msg.proposal_hash() == expected_hash
    }

    /// Watches the store for valid proposals for rounds higher than the
    /// current one, so the node can join a round the network already moved
    /// on to.
    pub(crate) async fn watch_for_future_proposal(
        &self,
        ctx: &ctx::Ctx,
        events: &EventSender,
    ) -> ctx::OrCanceled<()> {
        let view = self.state.view();
        let mut sub = self.store.subscribe(SubscriptionDetails {
            message_type: MessageType::PrePrepare,
            view: View::new(view.height, view.round + 1),
            has_min_round: true,
            has_quorum: self.backend_quorum(),
        });

        loop {
            let round = sub.notified(ctx).await?;
            let Some(proposal_message) = self.handle_pre_prepare(&View::new(view.height, round))
            else {
                continue;
            };

            events
                .send(
                    ctx,
                    RoundEvent::FutureProposal {
                        round,
                        proposal_message,
                    },
                )
                .await?;
            return Ok(());
        }
    }

    /// Builds the pre-prepare message this node proposes for `view`. For
    /// rounds above 0 this first waits for a round change certificate, and
    /// re-proposes the value prepared at the highest round if the
    /// certificate carries one. Yields nothing if the backend cannot
    /// produce a proposal; the round then stalls until the timer fires.
    pub(crate) async fn build_proposal(
        &self,
        ctx: &ctx::Ctx,
        view: View,
    ) -> ctx::OrCanceled<Option<Message>> {
        let backend = &self.config.backend;

        if view.round == 0 {
            let raw_proposal = match backend.build_proposal(ctx, view).await {
                Ok(raw_proposal) => raw_proposal,
                Err(ctx::Error::Canceled(err)) => return Err(err),
                Err(ctx::Error::Internal(err)) => {
                    tracing::error!("failed to build a proposal: {err:#}");
                    return Ok(None);
                }
            };
            return Ok(Some(backend.build_pre_prepare_message(
                raw_proposal,
                None,
                view,
            )));
        }

        let rcc = self.wait_for_rcc(ctx, view.height, view.round).await?;

        // Take the previously prepared proposal of the certificate entry
        // whose prepared certificate has the highest round; on equal rounds
        // the earlier entry wins.
        let mut previous_proposal: Option<(u64, RawProposal)> = None;
        for round_change in &rcc.round_change_messages {
            if round_change.latest_pc().is_none() {
                continue;
            }
            let Some(last_prepared) = round_change.last_prepared_proposal() else {
                continue;
            };
            let prepared_round = round_change
                .latest_pc()
                .map(|pc| pc.proposal_message.view.round)
                .unwrap_or(0);
            if previous_proposal
                .as_ref()
                .map_or(true, |(round, _)| prepared_round > *round)
            {
                previous_proposal = Some((prepared_round, last_prepared.raw_proposal.clone()));
            }
        }

        let raw_proposal = match previous_proposal {
            Some((_, raw_proposal)) => raw_proposal,
            None => match backend.build_proposal(ctx, view).await {
                Ok(raw_proposal) => raw_proposal,
                Err(ctx::Error::Canceled(err)) => return Err(err),
                Err(ctx::Error::Internal(err)) => {
                    tracing::error!("failed to build a proposal: {err:#}");
                    return Ok(None);
                }
            },
        };

        Ok(Some(backend.build_pre_prepare_message(
            raw_proposal,
            Some(rcc),
            view,
        )))
    }
}
