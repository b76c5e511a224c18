//! Muxer: interleaves many logical input streams onto one shared channel.
//!
//! The stream table lives inside a single actor task. Callers reach it only
//! through [`Muxer`] handles, which send commands and wait for the reply.
//! Every registered stream gets one forwarding task that tags its items with
//! the stream's [`Identifier`] and reports back to the actor when the input
//! ends.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use chanmux_core::config::MuxerSettings;
use chanmux_core::{Error, Result};

use crate::bundle::{Bundle, Identifier};
use crate::stream::{HandleId, InputStream};

const ACTOR: &str = "muxer";

/// Configuration for a [`Muxer`].
#[derive(Debug, Clone)]
pub struct MuxerConfig {
    /// Capacity of the command channel into the actor.
    pub command_capacity: usize,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        MuxerSettings::default().into()
    }
}

impl From<MuxerSettings> for MuxerConfig {
    fn from(settings: MuxerSettings) -> Self {
        Self {
            command_capacity: settings.command_capacity,
        }
    }
}

/// Muxer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxerStats {
    /// Streams whose forwarding task is still running.
    pub active_streams: usize,
    /// Identifier the next new stream will get.
    pub next_id: u64,
}

enum Command<T> {
    Register {
        stream: InputStream<T>,
        reply: oneshot::Sender<Identifier>,
    },
    Stats {
        reply: oneshot::Sender<MuxerStats>,
    },
}

/// Handle to a muxer actor.
///
/// Cloning is cheap; all clones talk to the same actor. The actor stops once
/// every handle is dropped, while running forwarding tasks carry on until
/// their inputs end.
pub struct Muxer<T> {
    ctl: mpsc::Sender<Command<T>>,
}

impl<T> Clone for Muxer<T> {
    fn clone(&self) -> Self {
        Self {
            ctl: self.ctl.clone(),
        }
    }
}

impl<T: Send + 'static> Muxer<T> {
    /// Spawn a muxer writing into `shared`. Must be called inside a tokio runtime.
    pub fn new(shared: mpsc::Sender<Bundle<T>>) -> Self {
        Self::with_config(shared, MuxerConfig::default())
    }

    pub fn with_config(shared: mpsc::Sender<Bundle<T>>, config: MuxerConfig) -> Self {
        let (ctl, ctl_rx) = mpsc::channel(config.command_capacity.max(1));
        tokio::spawn(MuxerActor::new(shared).run(ctl_rx));
        Self { ctl }
    }

    /// Register an input stream and return its identifier.
    ///
    /// Registering a handle (or a clone of it) again while its forwarding
    /// task is running returns the same identifier and spawns nothing.
    pub async fn register(&self, stream: &InputStream<T>) -> Result<Identifier> {
        let (reply, rx) = oneshot::channel();
        self.ctl
            .send(Command::Register {
                stream: stream.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::ActorStopped(ACTOR))?;
        rx.await.map_err(|_| Error::ActorStopped(ACTOR))
    }

    /// Get muxer statistics.
    pub async fn stats(&self) -> Result<MuxerStats> {
        let (reply, rx) = oneshot::channel();
        self.ctl
            .send(Command::Stats { reply })
            .await
            .map_err(|_| Error::ActorStopped(ACTOR))?;
        rx.await.map_err(|_| Error::ActorStopped(ACTOR))
    }
}

struct MuxerActor<T> {
    shared: mpsc::Sender<Bundle<T>>,
    streams: HashMap<HandleId, Identifier>,
    next_id: u64,
    finished_tx: mpsc::UnboundedSender<HandleId>,
    finished_rx: mpsc::UnboundedReceiver<HandleId>,
}

impl<T: Send + 'static> MuxerActor<T> {
    fn new(shared: mpsc::Sender<Bundle<T>>) -> Self {
        // Unbounded so a finishing forwarder never waits on the actor.
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            shared,
            streams: HashMap::new(),
            next_id: 0,
            finished_tx,
            finished_rx,
        }
    }

    async fn run(mut self, mut ctl: mpsc::Receiver<Command<T>>) {
        loop {
            tokio::select! {
                Some(handle) = self.finished_rx.recv() => {
                    if let Some(id) = self.streams.remove(&handle) {
                        debug!(%id, %handle, "Stream finished");
                    }
                }
                command = ctl.recv() => match command {
                    Some(Command::Register { stream, reply }) => {
                        let id = self.register(stream);
                        let _ = reply.send(id);
                    }
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(MuxerStats {
                            active_streams: self.streams.len(),
                            next_id: self.next_id,
                        });
                    }
                    None => break,
                },
            }
        }

        debug!(
            active_streams = self.streams.len(),
            "Muxer actor stopped, forwarders keep running"
        );
    }

    fn register(&mut self, stream: InputStream<T>) -> Identifier {
        let handle = stream.handle_id();
        if let Some(&id) = self.streams.get(&handle) {
            debug!(%id, %handle, "Stream already registered");
            return id;
        }

        let id = Identifier::from(self.next_id);
        self.next_id += 1;
        self.streams.insert(handle, id);

        tokio::spawn(forward(
            id,
            stream,
            self.shared.clone(),
            self.finished_tx.clone(),
        ));

        info!(%id, %handle, "Stream registered");
        id
    }
}

/// Relay one input stream onto the shared channel, then mark it closed.
async fn forward<T>(
    id: Identifier,
    stream: InputStream<T>,
    shared: mpsc::Sender<Bundle<T>>,
    finished: mpsc::UnboundedSender<HandleId>,
) {
    let handle = stream.handle_id();
    let mut forwarded = 0u64;

    let delivered = loop {
        let Some(item) = stream.recv().await else {
            break shared.send(Bundle::close(id)).await.is_ok();
        };
        if shared.send(Bundle::payload(id, item)).await.is_err() {
            break false;
        }
        forwarded += 1;
    };

    if delivered {
        debug!(%id, %handle, forwarded, "Input stream ended");
    } else {
        warn!(%id, %handle, forwarded, "Shared channel closed, forwarder stopped");
    }

    // The actor may be gone already; its table went with it.
    let _ = finished.send(handle);
}
