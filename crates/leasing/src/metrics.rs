use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

lazy_static! {
    pub static ref LEASING_REGISTRY: Registry =
        Registry::new_custom(Some("leasing".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref LEASE_GRAB_TOTALS: IntCounterVec = register_int_counter_vec_with_registry!(
        "lease_grab_totals",
        "Actor lease grab attempts, labeled by outcome",
        &["status"],
        LEASING_REGISTRY
    )
    .unwrap();
    pub static ref LEASE_RENEW_FAILURES: IntCounter = register_int_counter_with_registry!(
        "lease_renew_failures_total",
        "Actor leases that could not be renewed",
        LEASING_REGISTRY
    )
    .unwrap();
    pub static ref CRON_TICKS: IntCounterVec = register_int_counter_vec_with_registry!(
        "cron_ticks_total",
        "Cron ticks, labeled by cron name and status",
        &["cron", "status"],
        LEASING_REGISTRY
    )
    .unwrap();
    pub static ref ACTORS_EVICTED: IntCounterVec = register_int_counter_vec_with_registry!(
        "actors_evicted_total",
        "Local actors deleted by a cron, labeled by reason",
        &["reason"],
        LEASING_REGISTRY
    )
    .unwrap();
    pub static ref ACTOR_PULSE_FAILURES: IntCounter = register_int_counter_with_registry!(
        "actor_pulse_failures_total",
        "Autonomous actor pulses that returned an error",
        LEASING_REGISTRY
    )
    .unwrap();
    pub static ref NODE_BINDINGS_VERSION: IntGauge = register_int_gauge_with_registry!(
        "node_bindings_version",
        "Version of the cached public to private node bindings",
        LEASING_REGISTRY
    )
    .unwrap();
    pub static ref NODE_BINDINGS_KNOWN: IntGauge = register_int_gauge_with_registry!(
        "node_bindings_known",
        "Number of live nodes in the cached bindings",
        LEASING_REGISTRY
    )
    .unwrap();
    pub static ref DISCOVERY_REDIRECTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "discovery_redirects_total",
        "Requests answered with a redirect by the routing protocol, labeled by reason",
        &["reason"],
        LEASING_REGISTRY
    )
    .unwrap();
}
