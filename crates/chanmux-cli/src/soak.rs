//! Soak run: many producers, one shared channel, per-stream verification.

use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chanmux::relay::unbounded_relay;
use chanmux::{Bundle, Demuxer, Identifier, Muxer, OutputStream, input_stream};
use chanmux_core::Config;

/// Shape of a soak run.
#[derive(Debug, Clone)]
pub struct SoakPlan {
    /// Streams registered on both sides.
    pub streams: usize,
    /// Messages each producer sends.
    pub messages: u64,
    /// Capacity of the shared channel.
    pub shared_capacity: usize,
    /// Put an unbounded relay between the muxer and the demuxer.
    pub relay: bool,
    /// Streams registered only with the muxer; their bundles are never claimed.
    pub unregistered: usize,
}

impl Default for SoakPlan {
    fn default() -> Self {
        Self {
            streams: 4,
            messages: 1000,
            shared_capacity: 1,
            relay: false,
            unregistered: 0,
        }
    }
}

/// What one output received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub id: Identifier,
    pub received: u64,
    pub in_order: bool,
}

#[derive(Debug)]
pub struct SoakReport {
    pub expected: u64,
    pub streams: Vec<StreamReport>,
    /// Bundles the demuxer discarded.
    pub dropped: u64,
    /// Bundles still held for identifiers nobody claimed.
    pub held: usize,
    pub elapsed: Duration,
}

impl SoakReport {
    /// Every claimed stream arrived complete and in order.
    pub fn is_clean(&self) -> bool {
        self.streams
            .iter()
            .all(|s| s.in_order && s.received == self.expected)
    }
}

/// Run `plan` with actor settings from `config`.
pub async fn run(plan: &SoakPlan, config: &Config) -> anyhow::Result<SoakReport> {
    let started = Instant::now();

    let (shared_tx, shared_rx) = mpsc::channel::<Bundle<u64>>(plan.shared_capacity.max(1));
    let shared_rx = if plan.relay {
        unbounded_relay(shared_rx, plan.shared_capacity)
    } else {
        shared_rx
    };

    let muxer = Muxer::with_config(shared_tx, config.muxer.clone().into());
    let demuxer = Demuxer::with_config(shared_rx, config.demuxer.clone().into());

    let mut producers = Vec::with_capacity(plan.streams + plan.unregistered);
    for _ in 0..plan.unregistered {
        let (tx, input) = input_stream(1);
        let id = muxer.register(&input).await?;
        debug!(%id, "Registered unclaimed stream");
        producers.push(spawn_producer(tx, plan.messages));
    }

    let mut checkers = Vec::with_capacity(plan.streams);
    for _ in 0..plan.streams {
        let (tx, input) = input_stream(1);
        let id = muxer.register(&input).await?;
        let output = demuxer.register(id, None).await?.into_stream();
        checkers.push(tokio::spawn(check_output(id, output)));
        producers.push(spawn_producer(tx, plan.messages));
    }

    let mut streams = Vec::with_capacity(checkers.len());
    for checker in checkers {
        streams.push(checker.await.context("output checker panicked")?);
    }
    for producer in producers {
        producer.await.context("producer panicked")?;
    }

    let stats = demuxer.stats().await?;
    let report = SoakReport {
        expected: plan.messages,
        streams,
        dropped: stats.dropped,
        held: stats.held,
        elapsed: started.elapsed(),
    };

    info!(
        streams = report.streams.len(),
        dropped = report.dropped,
        held = report.held,
        elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
        clean = report.is_clean(),
        "Soak run finished"
    );
    Ok(report)
}

fn spawn_producer(tx: mpsc::Sender<u64>, messages: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        for n in 0..messages {
            if tx.send(n).await.is_err() {
                warn!(sent = n, "Input stream closed early");
                return;
            }
        }
    })
}

async fn check_output(id: Identifier, output: OutputStream<u64>) -> StreamReport {
    let mut received = 0u64;
    let mut in_order = true;

    while let Some(n) = output.recv().await {
        if n != received && in_order {
            warn!(%id, expected = received, got = n, "Stream out of order");
            in_order = false;
        }
        received += 1;
    }

    debug!(%id, received, "Output closed");
    StreamReport {
        id,
        received,
        in_order,
    }
}
