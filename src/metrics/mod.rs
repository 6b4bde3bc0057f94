/*!
 * # Metrics Module
 *
 * Prometheus counters for the order and inventory core. Everything is
 * registered in a crate-local registry so embedding applications can
 * expose it next to their own.
 */

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    static ref STOCK_RESERVATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_reservations_total",
            "Stock reservation attempts by outcome"
        ),
        &["outcome"]
    )
    .expect("metric can be created");
    static ref STOCK_MOVEMENTS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_movements_total",
            "Stock movements written to the ledger"
        ),
        &["movement_type", "reason"]
    )
    .expect("metric can be created");
    static ref ORDER_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "order_transitions_total",
            "Order state machine events by outcome"
        ),
        &["event", "outcome"]
    )
    .expect("metric can be created");
    static ref INSTALLMENT_PAYMENTS: IntCounter = IntCounter::new(
        "installment_payments_total",
        "Installment payments applied"
    )
    .expect("metric can be created");
    static ref OVER_RELEASES: IntCounter = IntCounter::new(
        "stock_over_releases_total",
        "Release calls that asked for more than was reserved"
    )
    .expect("metric can be created");
}

fn registered() -> &'static Registry {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(STOCK_RESERVATIONS.clone()),
            Box::new(STOCK_MOVEMENTS.clone()),
            Box::new(ORDER_TRANSITIONS.clone()),
            Box::new(INSTALLMENT_PAYMENTS.clone()),
            Box::new(OVER_RELEASES.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                error!(error = %e, "Failed to register metric");
            }
        }
    });
    &REGISTRY
}

pub fn record_reservation(success: bool) {
    registered();
    let outcome = if success { "reserved" } else { "insufficient" };
    STOCK_RESERVATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_movement(movement_type: &str, reason: &str) {
    registered();
    STOCK_MOVEMENTS
        .with_label_values(&[movement_type, reason])
        .inc();
}

pub fn record_transition(event: &str, success: bool) {
    registered();
    let outcome = if success { "applied" } else { "rejected" };
    ORDER_TRANSITIONS.with_label_values(&[event, outcome]).inc();
}

pub fn record_installment_payment() {
    registered();
    INSTALLMENT_PAYMENTS.inc();
}

pub fn record_over_release() {
    registered();
    OVER_RELEASES.inc();
}

/// Renders the registry in the Prometheus text exposition format.
pub fn gather_text() -> String {
    let metric_families = registered().gather();
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
