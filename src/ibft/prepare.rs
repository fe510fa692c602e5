//! Reception and validation of prepare messages.
use super::Ibft;
use crate::{
    messages::{Message, MessageType, PreparedCertificate, View},
    store::SubscriptionDetails,
};
use zksync_concurrency::ctx;

impl Ibft {
    /// Reception of prepare messages for the current view. Once a quorum of
    /// valid prepares is in, the prepared certificate is finalized and a
    /// commit goes out.
    pub(crate) async fn run_prepare(&self, ctx: &ctx::Ctx) -> ctx::OrCanceled<()> {
        tracing::debug!("receiving prepare messages");

        let view = self.state.view();
        let mut sub = self.store.subscribe(SubscriptionDetails {
            message_type: MessageType::Prepare,
            view,
            has_min_round: false,
            has_quorum: self.backend_quorum(),
        });

        loop {
            if let Some(prepare_messages) = self.handle_prepare(&view) {
                let proposal_message = self
                    .state
                    .proposal_message()
                    .expect("proposal accepted before the prepare quorum");
                let proposal = proposal_message
                    .proposal()
                    .expect("accepted pre-prepare carries a proposal")
                    .clone();

                self.state.finalize_prepare(
                    PreparedCertificate {
                        proposal_message,
                        prepare_messages,
                    },
                    proposal,
                );
                self.state.set_commit_sent(true);

                self.send_commit_message(view);
                tracing::debug!("commit message multicast");
                return Ok(());
            }

            sub.notified(ctx).await?;
        }
    }

    /// The quorum of valid prepare messages for `view`, once the node has a
    /// proposal to prepare against and has not committed yet.
    pub(crate) fn handle_prepare(&self, view: &View) -> Option<Vec<Message>> {
        if self.state.commit_sent() {
            return None;
        }
        let proposal = self.state.proposal()?;

        let backend = &self.config.backend;
        let prepare_messages = self
            .store
            .get_valid_messages(view, MessageType::Prepare, |msg| {
                msg.prepare_hash()
                    .is_some_and(|hash| backend.is_valid_proposal_hash(&proposal, hash))
            });

        if !backend.has_quorum(view.height, &prepare_messages, MessageType::Prepare) {
            return None;
        }

        Some(prepare_messages)
    }
}
