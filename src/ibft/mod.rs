//! The sequence driver.
//!
//! [`Ibft::run_sequence`] owns the round loop for a single height. Each
//! round it spawns the round timer, the two future-event watchers and the
//! round state machine inside one cancellation scope, then waits for the
//! first driver-bound event. Whichever event wins, the scope is canceled
//! and every worker joined before the state is touched, so a stale worker
//! can never act on behalf of a round that already ended.
use crate::{
    config::Config,
    messages::{Message, View},
    metrics::METRICS,
    store::{MessageStore, QuorumFn},
};
use std::sync::Arc;
use zksync_concurrency::{ctx, scope};

mod commit;
mod prepare;
mod proposal;
mod round_change;
mod state;
#[cfg(test)]
pub(crate) mod testonly;
mod timer;

use state::StateHandle;

/// Events produced by the round workers for the sequence driver. Exactly
/// one is consumed per round iteration; the rest die with the round scope.
#[derive(Debug)]
pub(crate) enum RoundEvent {
    /// A valid proposal for a higher round was observed.
    FutureProposal {
        round: u64,
        proposal_message: Message,
    },
    /// A valid round change certificate for a higher round was assembled.
    FutureRcc { round: u64 },
    /// The round timer fired.
    RoundExpired,
    /// Commit quorum reached; the sequence is finished.
    RoundDone,
}

/// Sending side of the driver-bound event channel, handed to every worker.
pub(crate) type EventSender = ctx::channel::Sender<RoundEvent>;

/// A single instance of the IBFT state machine.
///
/// The instance is driven by [`Ibft::run_sequence`], one height at a time,
/// and fed inbound messages through [`Ibft::add_message`] from any thread.
#[derive(Debug)]
pub struct Ibft {
    pub(crate) config: Arc<Config>,
    pub(crate) state: StateHandle,
    pub(crate) store: Arc<MessageStore>,
}

impl Ibft {
    /// Creates a new instance of the IBFT consensus protocol.
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            state: StateHandle::default(),
            store: Arc::new(MessageStore::default()),
        }
    }

    /// Runs the consensus sequence for the given height, returning once a
    /// proposal has been committed and handed to the backend, or once `ctx`
    /// is canceled.
    pub async fn run_sequence(&self, ctx: &ctx::Ctx, height: u64) {
        self.state.clear(height);
        self.store.prune_by_height(height);

        tracing::info!(height, "sequence started");
        let started = ctx.now();

        loop {
            let view = self.state.view();
            let round = view.round;
            tracing::info!(round, "round started");
            METRICS.round_number.set(round);

            let (events, mut event_recv) = ctx::channel::bounded(1);
            // scope::run! returns only once every worker has wound down.
            let res = scope::run!(ctx, |ctx, s| async {
                s.spawn_bg(async {
                    let _ = self.run_round_timer(ctx, round, &events).await;
                    Ok(())
                });
                s.spawn_bg(async {
                    let _ = self.watch_for_future_proposal(ctx, &events).await;
                    Ok(())
                });
                s.spawn_bg(async {
                    let _ = self.watch_for_future_rcc(ctx, &events).await;
                    Ok(())
                });
                s.spawn_bg(async {
                    let _ = self.run_round(ctx, &events).await;
                    Ok(())
                });
                event_recv.recv(ctx).await
            })
            .await;

            match res {
                Ok(RoundEvent::FutureProposal {
                    round,
                    proposal_message,
                }) => {
                    tracing::info!(round, "received a proposal for a future round");
                    self.move_to_new_round(round);
                    self.accept_proposal(proposal_message);
                    self.state.set_round_started(true);
                    self.send_prepare_message(view);
                }
                Ok(RoundEvent::FutureRcc { round }) => {
                    tracing::info!(round, "received a round change certificate for a future round");
                    self.move_to_new_round(round);
                }
                Ok(RoundEvent::RoundExpired) => {
                    tracing::info!(round, "round timer expired");
                    self.move_to_new_round(round + 1);
                    self.send_round_change_message(height, round + 1);
                }
                Ok(RoundEvent::RoundDone) => {
                    let latency = std::time::Duration::try_from(ctx.now() - started)
                        .unwrap_or(std::time::Duration::ZERO);
                    METRICS.sequence_latency.observe(latency);
                    tracing::info!(height, "sequence done");
                    return;
                }
                Err(ctx::Canceled) => {
                    tracing::debug!(height, "sequence canceled");
                    return;
                }
            }
        }
    }

    /// The state machine of a single round: propose if it is our turn, then
    /// receive the three phases until the scope is canceled.
    async fn run_round(&self, ctx: &ctx::Ctx, events: &EventSender) -> ctx::OrCanceled<()> {
        self.state.new_round();

        let backend = &self.config.backend;
        let view = self.state.view();

        if backend.is_proposer(&backend.id(), view.height, view.round) {
            tracing::info!(round = view.round, "this node is the proposer");

            let Some(proposal_message) = self.build_proposal(ctx, view).await? else {
                tracing::error!("unable to build a proposal");
                return Ok(());
            };

            self.accept_proposal(proposal_message.clone());
            tracing::debug!("proposal accepted");

            self.config.transport.multicast(proposal_message);
            tracing::debug!("pre-prepare message multicast");
        }

        self.run_receptions(ctx, events).await
    }

    /// Runs the three phase reception workers concurrently until all of them
    /// terminate or the round scope is canceled. Phase ordering emerges from
    /// the state guards inside the handlers, not from task startup order.
    async fn run_receptions(&self, ctx: &ctx::Ctx, events: &EventSender) -> ctx::OrCanceled<()> {
        scope::run!(ctx, |ctx, s| async {
            s.spawn(async {
                let _ = self.run_pre_prepare(ctx).await;
                Ok(())
            });
            s.spawn(async {
                let _ = self.run_prepare(ctx).await;
                Ok(())
            });
            s.spawn(async {
                let _ = self.run_commit(ctx, events).await;
                Ok(())
            });
            Ok(())
        })
        .await
    }

    /// Accepts a proposal for the current round.
    pub(crate) fn accept_proposal(&self, proposal_message: Message) {
        self.state.set_proposal_message(Some(proposal_message));
    }

    /// Moves to `round`, dropping the per-round state.
    pub(crate) fn move_to_new_round(&self, round: u64) {
        self.state.set_view(View::new(self.state.height(), round));
        self.state.set_round_started(false);
        self.state.set_proposal_message(None);
        self.state.set_commit_sent(false);
    }

    /// Feeds a message received from a peer into the message store and wakes
    /// any subscription whose quorum the message completes. Messages from
    /// unknown senders and messages for past views are dropped.
    pub fn add_message(&self, message: Message) {
        if !self.is_acceptable_message(&message) {
            tracing::debug!(from = ?message.from, view = ?message.view, "message discarded");
            return;
        }

        self.store.add_message(message.clone());

        let messages =
            self.store
                .get_valid_messages(&message.view, message.message_type(), |_| true);
        if self
            .config
            .backend
            .has_quorum(message.view.height, &messages, message.message_type())
        {
            self.store.signal_event(&message);
        }
    }

    fn is_acceptable_message(&self, message: &Message) -> bool {
        self.config.backend.is_valid_validator(message)
            && message.view.height >= self.state.height()
            && message.view.round >= self.state.round()
    }

    /// The backend's quorum check, packaged for a subscription record.
    pub(crate) fn backend_quorum(&self) -> QuorumFn {
        let backend = self.config.backend.clone();
        Arc::new(move |height, messages, message_type| {
            backend.has_quorum(height, messages, message_type)
        })
    }

    /// Multicasts a prepare message for the accepted proposal.
    pub(crate) fn send_prepare_message(&self, view: View) {
        let proposal_hash = self
            .state
            .proposal_hash()
            .expect("no accepted proposal to prepare against");
        self.config
            .transport
            .multicast(self.config.backend.build_prepare_message(proposal_hash, view));
    }

    /// Multicasts a commit message for the accepted proposal.
    pub(crate) fn send_commit_message(&self, view: View) {
        let proposal_hash = self
            .state
            .proposal_hash()
            .expect("no accepted proposal to commit to");
        self.config
            .transport
            .multicast(self.config.backend.build_commit_message(proposal_hash, view));
    }

    /// Multicasts a round change message for `round`, carrying whatever this
    /// node last prepared.
    fn send_round_change_message(&self, height: u64, round: u64) {
        self.config
            .transport
            .multicast(self.config.backend.build_round_change_message(
                self.state.latest_prepared_proposal(),
                self.state.latest_pc(),
                View::new(height, round),
            ));
    }
}
