//! Reception and validation of commit messages.
use super::{EventSender, Ibft, RoundEvent};
use crate::{
    messages::{self, MessageType, Proposal, View},
    store::SubscriptionDetails,
};
use zksync_concurrency::ctx;

impl Ibft {
    /// Reception of commit messages for the current view. Once a quorum of
    /// valid commits is in and the proposal has been handed to the backend,
    /// the driver is told the sequence is done.
    pub(crate) async fn run_commit(
        &self,
        ctx: &ctx::Ctx,
        events: &EventSender,
    ) -> ctx::OrCanceled<()> {
        tracing::debug!("receiving commit messages");

        let view = self.state.view();
        let mut sub = self.store.subscribe(SubscriptionDetails {
            message_type: MessageType::Commit,
            view,
            has_min_round: false,
            has_quorum: self.backend_quorum(),
        });

        loop {
            if self.handle_commit(ctx, &view).await? {
                events.send(ctx, RoundEvent::RoundDone).await?;
                return Ok(());
            }

            sub.notified(ctx).await?;
        }
    }

    /// Checks for a commit quorum and, when reached, inserts the proposal
    /// with its committed seals into the ledger. Extraction and insertion
    /// failures are logged and treated as the quorum not being met yet, so
    /// the next wakeup retries.
    pub(crate) async fn handle_commit(&self, ctx: &ctx::Ctx, view: &View) -> ctx::OrCanceled<bool> {
        let Some(proposal) = self.state.proposal() else {
            return Ok(false);
        };

        let backend = &self.config.backend;
        let commit_messages = self
            .store
            .get_valid_messages(view, MessageType::Commit, |msg| {
                let (Some(proposal_hash), Some(committed_seal)) =
                    (msg.commit_hash(), msg.committed_seal())
                else {
                    return false;
                };
                backend.is_valid_proposal_hash(&proposal, proposal_hash)
                    && backend.is_valid_committed_seal(proposal_hash, committed_seal)
            });

        if !backend.has_quorum(view.height, &commit_messages, MessageType::Commit) {
            return Ok(false);
        }

        let committed_seals = match messages::extract_committed_seals(&commit_messages) {
            Ok(seals) => seals,
            Err(err) => {
                tracing::error!("failed to extract committed seals: {err:#}");
                return Ok(false);
            }
        };
        self.state.set_committed_seals(committed_seals.clone());

        let proposal = Proposal {
            raw_proposal: self.state.raw_proposal(),
            round: self.state.round(),
        };
        if let Err(err) = backend.insert_proposal(ctx, proposal, committed_seals).await {
            match err {
                ctx::Error::Canceled(err) => return Err(err),
                ctx::Error::Internal(err) => {
                    tracing::error!("failed to insert the proposal: {err:#}");
                    return Ok(false);
                }
            }
        }

        // The sequence is finished; stale messages are no longer needed.
        self.store.prune_by_height(self.state.height());

        Ok(true)
    }
}
