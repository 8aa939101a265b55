use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static LOOKUPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("outcache_lookups_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register outcache_lookups_total");
    vec
});

static STORES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("outcache_stores_total", "Entry store attempts by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register outcache_stores_total");
    vec
});

static COALESCED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "outcache_coalesced_total",
        "Coalesced executions by caller role",
    );
    let vec = IntCounterVec::new(opts, &["role"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register outcache_coalesced_total");
    vec
});

static NOT_MODIFIED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "outcache_not_modified_total",
        "Conditional hits answered with 304",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register outcache_not_modified_total");
    counter
});

static GATEWAY_TIMEOUTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "outcache_gateway_timeouts_total",
        "only-if-cached requests answered with 504",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register outcache_gateway_timeouts_total");
    counter
});

/// Registry holding every counter of this crate, for hosts that scrape.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub(crate) fn record_lookup(result: &str) {
    LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

pub(crate) fn record_store(result: &str) {
    STORES_TOTAL.with_label_values(&[result]).inc();
}

pub(crate) fn record_coalesced(role: &str) {
    COALESCED_TOTAL.with_label_values(&[role]).inc();
}

pub(crate) fn record_not_modified() {
    NOT_MODIFIED_TOTAL.inc();
}

pub(crate) fn record_gateway_timeout() {
    GATEWAY_TIMEOUTS_TOTAL.inc();
}
