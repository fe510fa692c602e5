//! Configuration of a consensus instance.
use crate::{Backend, Transport};
use std::sync::Arc;
use zksync_concurrency::time;

/// Base timeout of round 0. Round `r` times out after `base * 2^r`.
pub const DEFAULT_BASE_ROUND_TIMEOUT: time::Duration = time::Duration::seconds(10);

/// Configuration of a consensus instance.
#[derive(Debug)]
pub struct Config {
    /// Chain-specific collaborator: identities, validation, quorum
    /// arithmetic, proposal building and ledger insertion.
    pub backend: Arc<dyn Backend>,
    /// Outbound network used to multicast consensus messages.
    pub transport: Arc<dyn Transport>,
    /// Base round timeout; the timeout of round `r` is
    /// `base_round_timeout * 2^r + additional_timeout`.
    pub base_round_timeout: time::Duration,
    /// Extra time added on top of every round timeout.
    pub additional_timeout: time::Duration,
}

impl Config {
    /// Configuration with the default timeouts.
    pub fn new(backend: Arc<dyn Backend>, transport: Arc<dyn Transport>) -> Self {
        Self {
            backend,
            transport,
            base_round_timeout: DEFAULT_BASE_ROUND_TIMEOUT,
            additional_timeout: time::Duration::ZERO,
        }
    }
}
