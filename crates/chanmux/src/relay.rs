//! Unbounded relay between two channels.
//!
//! Interpose it on either side of the shared channel to keep forwarding
//! tasks from feeling backpressure from a slow demuxer, or in front of a slow
//! output reader. The backlog has no limit; memory grows with the rate gap.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Spawn a relay draining `input` into an in-memory queue and feeding the
/// returned receiver from it.
///
/// Items keep their order. The returned receiver ends once `input` has ended
/// and the backlog is empty. If the returned receiver is dropped the relay
/// stops, discarding its backlog, and `input` is closed.
pub fn unbounded_relay<T: Send + 'static>(
    input: mpsc::Receiver<T>,
    capacity: usize,
) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(run(input, tx));
    rx
}

async fn run<T>(mut input: mpsc::Receiver<T>, output: mpsc::Sender<T>) {
    let mut backlog = VecDeque::new();
    let mut input_open = true;
    let mut peak = 0usize;

    while input_open || !backlog.is_empty() {
        tokio::select! {
            item = input.recv(), if input_open => match item {
                Some(item) => {
                    backlog.push_back(item);
                    peak = peak.max(backlog.len());
                }
                None => input_open = false,
            },
            permit = output.reserve(), if !backlog.is_empty() => {
                let Ok(permit) = permit else {
                    debug!(discarded = backlog.len(), "Relay consumer gone, discarding backlog");
                    return;
                };
                if let Some(item) = backlog.pop_front() {
                    permit.send(item);
                }
            },
            () = output.closed(), if backlog.is_empty() => {
                debug!("Relay consumer gone");
                return;
            },
        }
    }

    trace!(peak, "Relay input ended and backlog drained");
}
