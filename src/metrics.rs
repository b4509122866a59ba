//! Prometheus collectors for controller syncs, queue depth and leadership.

use crate::queue::WorkQueue;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Per-controller handles on `tagger_syncs_total`.
#[derive(Debug, Clone)]
pub struct SyncCounters {
    synced: IntCounter,
    failed: IntCounter,
}

impl SyncCounters {
    pub fn record(&self, ok: bool) {
        let counter = if ok { &self.synced } else { &self.failed };
        counter.inc();
    }

    /// (succeeded, failed) sync counts.
    pub fn snapshot(&self) -> (u64, u64) {
        (self.synced.get(), self.failed.get())
    }
}

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    syncs: IntCounterVec,
    queue_depth: IntGaugeVec,
    leader: IntGauge,
    queues: Arc<Mutex<Vec<(&'static str, Arc<WorkQueue>)>>>,
    leadership: Option<watch::Receiver<bool>>,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let syncs = IntCounterVec::new(
            Opts::new("tagger_syncs_total", "Completed syncs per controller and result."),
            &["controller", "result"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("tagger_queue_depth", "Keys waiting to be synced."),
            &["controller"],
        )?;
        let leader = IntGauge::new("tagger_leader", "Whether this replica holds the leader lease.")?;
        registry.register(Box::new(syncs.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(leader.clone()))?;

        Ok(Self {
            registry,
            syncs,
            queue_depth,
            leader,
            queues: Arc::default(),
            leadership: None,
        })
    }

    pub fn with_leadership(mut self, leadership: watch::Receiver<bool>) -> Self {
        self.leadership = Some(leadership);
        self
    }

    /// Exports the queue depth of a controller and hands out its sync counters.
    pub fn controller(&self, name: &'static str, queue: Arc<WorkQueue>) -> SyncCounters {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name, queue));
        SyncCounters {
            synced: self.syncs.with_label_values(&[name, "success"]),
            failed: self.syncs.with_label_values(&[name, "error"]),
        }
    }

    /// Samples the gauges and encodes every collector in the text format.
    pub fn render(&self) -> prometheus::Result<String> {
        for (name, queue) in self.queues.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            self.queue_depth
                .with_label_values(&[*name])
                .set(queue.len() as i64);
        }
        if let Some(leadership) = &self.leadership {
            self.leader.set(i64::from(*leadership.borrow()));
        }

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}
