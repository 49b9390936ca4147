use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref PULL_REPLICATIONS_ACTIVE_CONTINUOUS: IntGauge = IntGauge::new(
        "tidegate_pull_replications_active_continuous",
        "Number of continuous pull replications currently running."
    )
    .unwrap();
    pub static ref PULL_REPLICATIONS_ACTIVE_ONE_SHOT: IntGauge = IntGauge::new(
        "tidegate_pull_replications_active_one_shot",
        "Number of one-shot pull replications currently running."
    )
    .unwrap();
    pub static ref PULL_REPLICATIONS_TOTAL_CONTINUOUS: IntCounter = IntCounter::new(
        "tidegate_pull_replications_total_continuous",
        "Continuous pull replications started since process start."
    )
    .unwrap();
    pub static ref PULL_REPLICATIONS_TOTAL_ONE_SHOT: IntCounter = IntCounter::new(
        "tidegate_pull_replications_total_one_shot",
        "One-shot pull replications started since process start."
    )
    .unwrap();
    pub static ref CHANGES_ROWS_SENT: IntCounter = IntCounter::new(
        "tidegate_changes_rows_sent",
        "Change rows shipped to peers across all sessions."
    )
    .unwrap();
    pub static ref CHANGES_BATCHES_SENT: IntCounter = IntCounter::new(
        "tidegate_changes_batches_sent",
        "changes messages shipped to peers, caught-up signals included."
    )
    .unwrap();
    pub static ref REV_SEND_COUNT: IntCounter = IntCounter::new(
        "tidegate_rev_send_count",
        "rev messages sent to peers on the pull side."
    )
    .unwrap();
    pub static ref REV_PUSH_COUNT: IntCounter = IntCounter::new(
        "tidegate_rev_push_count",
        "rev messages received from peers and persisted."
    )
    .unwrap();
    pub static ref NOREV_SEND_COUNT: IntCounter = IntCounter::new(
        "tidegate_norev_send_count",
        "norev messages sent for revisions that could not be delivered."
    )
    .unwrap();
    pub static ref DELTAS_REQUESTED: IntCounter = IntCounter::new(
        "tidegate_deltas_requested",
        "Revisions for which a delta was attempted on the pull side."
    )
    .unwrap();
    pub static ref DELTAS_SENT: IntCounter = IntCounter::new(
        "tidegate_deltas_sent",
        "Revisions actually shipped as deltas on the pull side."
    )
    .unwrap();
    pub static ref DELTA_PUSH_COUNT: IntCounter = IntCounter::new(
        "tidegate_delta_push_count",
        "Pushed revisions received as deltas and patched against their source."
    )
    .unwrap();
    pub static ref ATTACHMENT_PULL_COUNT: IntCounter = IntCounter::new(
        "tidegate_attachment_pull_count",
        "Attachments served to peers via getAttachment."
    )
    .unwrap();
    pub static ref ATTACHMENT_PULL_BYTES: IntCounter = IntCounter::new(
        "tidegate_attachment_pull_bytes",
        "Attachment bytes served to peers via getAttachment."
    )
    .unwrap();
    pub static ref ATTACHMENT_PUSH_COUNT: IntCounter = IntCounter::new(
        "tidegate_attachment_push_count",
        "Attachments downloaded from peers during pushed revisions."
    )
    .unwrap();
    pub static ref ATTACHMENT_PUSH_BYTES: IntCounter = IntCounter::new(
        "tidegate_attachment_push_bytes",
        "Attachment bytes downloaded from peers during pushed revisions."
    )
    .unwrap();
    pub static ref ATTACHMENT_PROOFS_REQUESTED: IntCounter = IntCounter::new(
        "tidegate_attachment_proofs_requested",
        "proveAttachment challenges issued for digests already held locally."
    )
    .unwrap();
}

pub fn register_custom_metrics() {
    REGISTRY
        .register(Box::new(PULL_REPLICATIONS_ACTIVE_CONTINUOUS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PULL_REPLICATIONS_ACTIVE_ONE_SHOT.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PULL_REPLICATIONS_TOTAL_CONTINUOUS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PULL_REPLICATIONS_TOTAL_ONE_SHOT.clone()))
        .unwrap();
    REGISTRY.register(Box::new(CHANGES_ROWS_SENT.clone())).unwrap();
    REGISTRY.register(Box::new(CHANGES_BATCHES_SENT.clone())).unwrap();
    REGISTRY.register(Box::new(REV_SEND_COUNT.clone())).unwrap();
    REGISTRY.register(Box::new(REV_PUSH_COUNT.clone())).unwrap();
    REGISTRY.register(Box::new(NOREV_SEND_COUNT.clone())).unwrap();
    REGISTRY.register(Box::new(DELTAS_REQUESTED.clone())).unwrap();
    REGISTRY.register(Box::new(DELTAS_SENT.clone())).unwrap();
    REGISTRY.register(Box::new(DELTA_PUSH_COUNT.clone())).unwrap();
    REGISTRY.register(Box::new(ATTACHMENT_PULL_COUNT.clone())).unwrap();
    REGISTRY.register(Box::new(ATTACHMENT_PULL_BYTES.clone())).unwrap();
    REGISTRY.register(Box::new(ATTACHMENT_PUSH_COUNT.clone())).unwrap();
    REGISTRY.register(Box::new(ATTACHMENT_PUSH_BYTES.clone())).unwrap();
    REGISTRY
        .register(Box::new(ATTACHMENT_PROOFS_REQUESTED.clone()))
        .unwrap();
}
