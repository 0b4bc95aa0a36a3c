use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, Encoder, IntCounter, TextEncoder};
use std::thread;

// Counters live in the default registry so any module can bump them via
// `crate::metrics::X.inc()` without threading a handle around.

/// Server-reported addresses that failed independent derivation. A nonzero
/// value is a security-relevant anomaly (possible server tampering).
pub static ADDRESS_MISMATCHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "paylink_address_mismatch_total",
        "Fulfillment responses rejected by the address integrity verifier"
    )
    .expect("metric registration")
});

pub static INVITATIONS_PRUNED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "paylink_invitations_pruned_total",
        "Unacknowledged invitations deleted after the acknowledgment window"
    )
    .expect("metric registration")
});

pub static TRANSACTIONS_LINKED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "paylink_transactions_linked_total",
        "Invitations correlated with an observed transaction"
    )
    .expect("metric registration")
});

pub static SYNC_CYCLES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "paylink_sync_cycles_total",
        "Completed reconciliation cycles"
    )
    .expect("metric registration")
});

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    // Touch the lazies so the exposition is never empty before first use.
    ADDRESS_MISMATCHES.get();
    INVITATIONS_PRUNED.get();
    TRANSACTIONS_LINKED.get();
    SYNC_CYCLES.get();

    let bind_addr = cfg.bind.clone();
    thread::spawn(move || {
        let server = match tiny_http::Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("🔥 Could not start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        for request in server.incoming_requests() {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            let metric_families = prometheus::gather();
            if encoder.encode(&metric_families, &mut buffer).is_err() {
                eprintln!("🔥 Could not encode metrics");
                continue;
            }

            let header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
                .parse::<tiny_http::Header>();
            let response = match header {
                Ok(h) => tiny_http::Response::from_data(buffer).with_header(h),
                Err(_) => tiny_http::Response::from_data(buffer),
            };
            let _ = request.respond(response);
        }
    });

    Ok(())
}
