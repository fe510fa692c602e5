//! Metrics for the consensus core.
use std::time::Duration;
use vise::{Buckets, Gauge, Histogram, Metrics, Unit};

/// Metrics defined by the consensus core.
#[derive(Debug, Metrics)]
#[metrics(prefix = "ibft")]
pub(crate) struct IbftMetrics {
    /// Number of the round the node is currently in.
    pub(crate) round_number: Gauge<u64>,
    /// Latency of a whole sequence, from the first round starting until the
    /// commit quorum is reached.
    #[metrics(buckets = Buckets::exponential(0.25..=512.0, 2.0), unit = Unit::Seconds)]
    pub(crate) sequence_latency: Histogram<Duration>,
}

/// Global instance of [`IbftMetrics`].
#[vise::register]
pub(crate) static METRICS: vise::Global<IbftMetrics> = vise::Global::new();
