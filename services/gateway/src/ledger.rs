//! Usage ledger
//!
//! Each billed request produces one `UsageEvent`. The sink is a trait so the
//! service can log events while tests collect them.

use provider::UsageEvent;
use tracing::info;

pub trait UsageSink: Send + Sync {
    fn record(&self, event: UsageEvent);
}

/// Writes usage events to the structured log and the token counters.
#[derive(Debug, Default)]
pub struct TracingLedger;

impl UsageSink for TracingLedger {
    fn record(&self, event: UsageEvent) {
        crate::metrics::record_tokens(event.input_tokens, event.output_tokens);
        info!(
            target: "usage",
            request_id = %event.request_id,
            credential_id = %event.credential_id,
            routing_entity_id = %event.routing_entity_id,
            input_tokens = event.input_tokens,
            output_tokens = event.output_tokens,
            cache_tokens = event.cache_tokens,
            timestamp_ms = event.timestamp_ms,
            "usage recorded"
        );
    }
}
