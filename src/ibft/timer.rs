//! The round timer.
use super::{EventSender, Ibft, RoundEvent};
use zksync_concurrency::{ctx, time};

impl Ibft {
    /// Waits out the timeout of `round`, then asks the driver to move on to
    /// the next round.
    pub(crate) async fn run_round_timer(
        &self,
        ctx: &ctx::Ctx,
        round: u64,
        events: &EventSender,
    ) -> ctx::OrCanceled<()> {
        let timeout = round_timeout(
            self.config.base_round_timeout,
            self.config.additional_timeout,
            round,
        );
        tracing::debug!(round, ?timeout, "round timer started");

        ctx.sleep(timeout).await?;
        events.send(ctx, RoundEvent::RoundExpired).await?;
        Ok(())
    }
}

/// Timeout of `round`: `base * 2^round + additional`, saturating for rounds
/// large enough to overflow.
pub(crate) fn round_timeout(
    base: time::Duration,
    additional: time::Duration,
    round: u64,
) -> time::Duration {
    let factor = u32::try_from(round)
        .ok()
        .and_then(|round| 2_i32.checked_pow(round))
        .unwrap_or(i32::MAX);
    base.saturating_mul(factor).saturating_add(additional)
}
