//! # Prometheus Metrics
//!
//! Operational metrics for a QUASAR node, scraped at `/metrics` on the
//! metrics port.
//!
//! Two feeds keep them current:
//!
//! - **events**: counters move on [`ConsensusEvent`]s (blocks, forwards,
//!   shreds sent, schedule outcomes, peer health);
//! - **sampling**: gauges are read off the node once a second (slot, epoch,
//!   PoH length, pool size, CRDS size, received shreds).
//!
//! All metrics live in a dedicated [`prometheus::Registry`] with the
//! `quasar` prefix, so they never collide with the default registry.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use quasar_protocol::events::ConsensusEvent;
use quasar_protocol::ConsensusNode;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Holds all Prometheus metric handles for the node.
///
/// Cloning is cheap: prometheus handles are reference counted.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,

    // -- sampled gauges ---------------------------------------------------
    pub current_slot: IntGauge,
    pub current_epoch: IntGauge,
    pub poh_entries: IntGauge,
    pub mempool_size: IntGauge,
    pub chain_height: IntGauge,
    pub known_nodes: IntGauge,
    pub healthy_peers: IntGauge,
    pub gossip_entries: IntGauge,
    pub pending_forwards: IntGauge,
    pub pending_shred_blocks: IntGauge,
    pub shreds_received_total: IntCounter,

    // -- event counters ---------------------------------------------------
    pub blocks_produced_total: IntCounter,
    pub blocks_accepted_total: IntCounter,
    pub blocks_rejected_total: IntCounter,
    pub transactions_forwarded_total: IntCounter,
    pub forward_failures_total: IntCounter,
    pub shreds_sent_total: IntCounter,
    pub shred_timeouts_total: IntCounter,
    pub schedules_published_total: IntCounter,
    pub schedules_adopted_total: IntCounter,
    pub schedule_failures_total: IntCounter,
    pub degraded_selections_total: IntCounter,
    pub gossip_merged_total: IntCounter,
    pub gossip_signature_invalid_total: IntCounter,
    pub peers_demoted_total: IntCounter,
    pub poh_corruptions_total: IntCounter,
    pub block_transactions: Histogram,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("metric creation");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("metric creation");
    registry
        .register(Box::new(metric.clone()))
        .expect("metric registration");
    metric
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("quasar".into()), None)
            .expect("failed to create prometheus registry");
        let r = &registry;

        let block_transactions = Histogram::with_opts(
            HistogramOpts::new(
                "block_transactions",
                "Transactions per block produced by this node",
            )
            .buckets(vec![0.0, 1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 4096.0]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(block_transactions.clone()))
            .expect("metric registration");

        Self {
            current_slot: gauge(r, "current_slot", "Current slot number"),
            current_epoch: gauge(r, "current_epoch", "Current epoch number"),
            poh_entries: gauge(r, "poh_entries", "Entries in the local PoH chain"),
            mempool_size: gauge(r, "mempool_size", "Transactions waiting in the pool"),
            chain_height: gauge(r, "chain_height", "Blocks in the local chain, genesis included"),
            known_nodes: gauge(r, "known_nodes", "Nodes in the registry"),
            healthy_peers: gauge(r, "healthy_peers", "Gossip peers not currently demoted"),
            gossip_entries: gauge(r, "gossip_entries", "Entries in the CRDS table"),
            pending_forwards: gauge(r, "pending_forwards", "Forwarded transactions not yet confirmed"),
            pending_shred_blocks: gauge(r, "pending_shred_blocks", "Blocks being reassembled from shreds"),
            shreds_received_total: counter(r, "shreds_received_total", "Valid shreds received"),

            blocks_produced_total: counter(r, "blocks_produced_total", "Blocks produced as leader"),
            blocks_accepted_total: counter(r, "blocks_accepted_total", "Blocks appended from peers"),
            blocks_rejected_total: counter(r, "blocks_rejected_total", "Blocks rejected on validation"),
            transactions_forwarded_total: counter(
                r,
                "transactions_forwarded_total",
                "Transactions forwarded to upcoming leaders",
            ),
            forward_failures_total: counter(
                r,
                "forward_failures_total",
                "Forward attempts that could not reach a leader",
            ),
            shreds_sent_total: counter(r, "shreds_sent_total", "Shreds sent or relayed"),
            shred_timeouts_total: counter(
                r,
                "shred_timeouts_total",
                "Blocks abandoned before all shreds arrived",
            ),
            schedules_published_total: counter(
                r,
                "schedules_published_total",
                "Leader schedules computed locally",
            ),
            schedules_adopted_total: counter(
                r,
                "schedules_adopted_total",
                "Leader schedules adopted from gossip",
            ),
            schedule_failures_total: counter(
                r,
                "schedule_failures_total",
                "Epochs whose schedule could not be computed",
            ),
            degraded_selections_total: counter(
                r,
                "degraded_selections_total",
                "Selections that fell back to the weighted sort",
            ),
            gossip_merged_total: counter(r, "gossip_merged_total", "CRDS entries merged"),
            gossip_signature_invalid_total: counter(
                r,
                "gossip_signature_invalid_total",
                "CRDS entries rejected for a bad signature",
            ),
            peers_demoted_total: counter(r, "peers_demoted_total", "Peer demotions"),
            poh_corruptions_total: counter(r, "poh_corruptions_total", "PoH verification failures"),
            block_transactions,
            registry,
        }
    }

    /// Move counters for one event.
    pub fn observe(&self, event: &ConsensusEvent) {
        match event {
            ConsensusEvent::SlotAdvanced { slot, epoch, .. } => {
                self.current_slot.set(*slot as i64);
                self.current_epoch.set(*epoch as i64);
            }
            ConsensusEvent::SchedulePublished { degraded, .. } => {
                self.schedules_published_total.inc();
                if *degraded {
                    self.degraded_selections_total.inc();
                }
            }
            ConsensusEvent::ScheduleAdopted { .. } => self.schedules_adopted_total.inc(),
            ConsensusEvent::ScheduleFailed { .. } => self.schedule_failures_total.inc(),
            // Counted through `SchedulePublished { degraded: true }`.
            ConsensusEvent::SelectionTimeout { .. } => {}
            ConsensusEvent::TransactionForwarded { .. } => self.transactions_forwarded_total.inc(),
            ConsensusEvent::ForwardUnreachable { .. } => self.forward_failures_total.inc(),
            ConsensusEvent::BlockProduced { transactions, .. } => {
                self.blocks_produced_total.inc();
                self.block_transactions.observe(*transactions as f64);
            }
            ConsensusEvent::BlockAccepted { .. } => self.blocks_accepted_total.inc(),
            ConsensusEvent::BlockRejected { .. } => self.blocks_rejected_total.inc(),
            ConsensusEvent::ShredsSent { count } => self.shreds_sent_total.inc_by(*count as u64),
            ConsensusEvent::ShredTimeout { .. } => self.shred_timeouts_total.inc(),
            ConsensusEvent::GossipSignatureInvalid { .. } => {
                self.gossip_signature_invalid_total.inc()
            }
            ConsensusEvent::GossipMerged { entries } => {
                self.gossip_merged_total.inc_by(*entries as u64)
            }
            ConsensusEvent::PeerDemoted { .. } => self.peers_demoted_total.inc(),
            ConsensusEvent::PeerRecovered { .. } => {}
            ConsensusEvent::PohCorrupted { .. } => self.poh_corruptions_total.inc(),
        }
    }

    /// Read gauges off the node.
    pub fn sample(&self, node: &ConsensusNode) {
        self.current_slot.set(node.schedule().current_slot() as i64);
        self.current_epoch.set(node.schedule().current_epoch() as i64);
        self.poh_entries.set(node.poh().len() as i64);
        self.mempool_size.set(node.mempool().len() as i64);
        self.chain_height.set(node.chain().height() as i64);
        self.known_nodes.set(node.registry().len() as i64);
        self.healthy_peers.set(node.gossip().healthy_peers().len() as i64);
        self.gossip_entries.set(node.gossip().table().len() as i64);
        self.pending_forwards.set(node.forwarder().pending_count() as i64);
        self.pending_shred_blocks.set(node.turbine().pending_blocks() as i64);

        let received = node.turbine().shreds_received();
        let counted = self.shreds_received_total.get();
        if received > counted {
            self.shreds_received_total.inc_by(received - counted);
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

pub fn router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Feed metrics from the node's event bus and periodic sampling until
/// shutdown.
pub async fn track(
    node: Arc<ConsensusNode>,
    metrics: SharedMetrics,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events = node.events().subscribe();
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => metrics.observe(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "metrics fell behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = ticker.tick() => metrics.sample(&node),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use quasar_protocol::config::NodeConfig;
    use quasar_protocol::consensus::ManualClock;
    use quasar_protocol::crypto::NodeKeypair;
    use quasar_protocol::network::MemoryNetwork;
    use tower::ServiceExt;

    #[test]
    fn events_move_counters() {
        let metrics = NodeMetrics::new();
        metrics.observe(&ConsensusEvent::BlockProduced {
            slot: 3,
            hash: "ab".into(),
            transactions: 12,
            shreds: 2,
        });
        metrics.observe(&ConsensusEvent::ShredsSent { count: 5 });
        metrics.observe(&ConsensusEvent::SchedulePublished {
            epoch: 1,
            distinct_leaders: 3,
            degraded: true,
        });
        metrics.observe(&ConsensusEvent::SlotAdvanced {
            slot: 9,
            epoch: 1,
            leader: None,
        });

        assert_eq!(metrics.blocks_produced_total.get(), 1);
        assert_eq!(metrics.shreds_sent_total.get(), 5);
        assert_eq!(metrics.degraded_selections_total.get(), 1);
        assert_eq!(metrics.current_slot.get(), 9);
        assert_eq!(metrics.block_transactions.get_sample_count(), 1);
    }

    #[test]
    fn sampling_reads_the_node() {
        let mut config = NodeConfig::default();
        config.node_id = Some("solo".into());
        let clock = Arc::new(ManualClock::new(config.schedule.genesis_unix_ms));
        let net = MemoryNetwork::new();
        let (transport, _inbound) = net.endpoint("mem://solo");
        let node = ConsensusNode::new(
            config,
            NodeKeypair::from_seed(&[1; 32]),
            Arc::new(transport),
            clock,
        )
        .unwrap();

        let metrics = NodeMetrics::new();
        metrics.sample(&node);
        assert_eq!(metrics.known_nodes.get(), 1);
        assert_eq!(metrics.chain_height.get(), 1);
        assert!(metrics.gossip_entries.get() >= 1);
        assert_eq!(metrics.shreds_received_total.get(), 0);
    }

    #[tokio::test]
    async fn endpoint_serves_text_format() {
        let metrics = Arc::new(NodeMetrics::new());
        metrics.blocks_accepted_total.inc();

        let response = router(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("quasar_blocks_accepted_total 1"));
        assert!(text.contains("quasar_current_slot"));
    }
}
