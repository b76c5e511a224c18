//! Demuxer: routes tagged bundles from one shared channel to per-stream outputs.
//!
//! The identifier table is owned by a single actor task which waits on both
//! the command channel and the shared input and handles whichever is ready.
//! Bundles for identifiers nobody registered are dropped (or briefly held,
//! see [`UnregisteredPolicy`]) so one unclaimed stream can never stall the
//! others.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use chanmux_core::config::DemuxerSettings;
use chanmux_core::{Error, Result, UnregisteredPolicy};

use crate::bundle::{Bundle, Identifier};
use crate::stream::{Outlet, OutputStream, output_stream};

const ACTOR: &str = "demuxer";

/// Configuration for a [`Demuxer`].
#[derive(Debug, Clone)]
pub struct DemuxerConfig {
    /// Capacity of the command channel into the actor.
    pub command_capacity: usize,
    /// Capacity of outputs created when a registration supplies none.
    pub output_capacity: usize,
    /// Handling of bundles for unregistered identifiers.
    pub unregistered: UnregisteredPolicy,
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        DemuxerSettings::default().into()
    }
}

impl From<DemuxerSettings> for DemuxerConfig {
    fn from(settings: DemuxerSettings) -> Self {
        Self {
            command_capacity: settings.command_capacity,
            output_capacity: settings.output_capacity,
            unregistered: settings.unregistered,
        }
    }
}

/// Outcome of [`Demuxer::register`].
#[derive(Debug)]
pub enum Registration<T> {
    /// The supplied (or freshly created) output is now wired to the identifier.
    Registered(OutputStream<T>),
    /// The identifier already had an output. The supplied one was closed and
    /// the earlier output is returned instead.
    AlreadyRegistered(OutputStream<T>),
}

impl<T> Registration<T> {
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Registered(_))
    }

    pub const fn stream(&self) -> &OutputStream<T> {
        match self {
            Self::Registered(stream) | Self::AlreadyRegistered(stream) => stream,
        }
    }

    pub fn into_stream(self) -> OutputStream<T> {
        match self {
            Self::Registered(stream) | Self::AlreadyRegistered(stream) => stream,
        }
    }
}

/// Demuxer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemuxerStats {
    /// Identifiers with a wired output.
    pub registered: usize,
    /// Bundles waiting for a registration under [`UnregisteredPolicy::Hold`].
    pub held: usize,
    /// Bundles discarded since the demuxer started.
    pub dropped: u64,
}

enum Command<T> {
    Register {
        id: Identifier,
        outlet: Option<Outlet<T>>,
        reply: oneshot::Sender<Registration<T>>,
    },
    Stats {
        reply: oneshot::Sender<DemuxerStats>,
    },
}

/// Handle to a demuxer actor.
///
/// Cloning is cheap. When every handle is gone the actor keeps routing to
/// the outputs already registered until the shared input ends.
pub struct Demuxer<T> {
    ctl: mpsc::Sender<Command<T>>,
}

impl<T> Clone for Demuxer<T> {
    fn clone(&self) -> Self {
        Self {
            ctl: self.ctl.clone(),
        }
    }
}

impl<T: Send + 'static> Demuxer<T> {
    /// Spawn a demuxer reading from `shared`. Must be called inside a tokio runtime.
    pub fn new(shared: mpsc::Receiver<Bundle<T>>) -> Self {
        Self::with_config(shared, DemuxerConfig::default())
    }

    pub fn with_config(shared: mpsc::Receiver<Bundle<T>>, config: DemuxerConfig) -> Self {
        let (ctl, ctl_rx) = mpsc::channel(config.command_capacity.max(1));
        tokio::spawn(DemuxerActor::new(&config).run(ctl_rx, shared));
        Self { ctl }
    }

    /// Wire an output to `id`.
    ///
    /// With `None` a fresh output is created. If `id` already has an output,
    /// `outlet` is dropped (closing its stream) and the existing output comes
    /// back as [`Registration::AlreadyRegistered`].
    pub async fn register(
        &self,
        id: Identifier,
        outlet: Option<Outlet<T>>,
    ) -> Result<Registration<T>> {
        let (reply, rx) = oneshot::channel();
        self.ctl
            .send(Command::Register { id, outlet, reply })
            .await
            .map_err(|_| Error::ActorStopped(ACTOR))?;
        rx.await.map_err(|_| Error::ActorStopped(ACTOR))
    }

    /// Get demuxer statistics.
    pub async fn stats(&self) -> Result<DemuxerStats> {
        let (reply, rx) = oneshot::channel();
        self.ctl
            .send(Command::Stats { reply })
            .await
            .map_err(|_| Error::ActorStopped(ACTOR))?;
        rx.await.map_err(|_| Error::ActorStopped(ACTOR))
    }
}

/// Held payloads for one unregistered identifier; `None` is a close marker.
type Backlog<T> = VecDeque<Option<T>>;

struct DemuxerActor<T> {
    outputs: HashMap<Identifier, Outlet<T>>,
    held: HashMap<Identifier, Backlog<T>>,
    /// Held identifiers, oldest first.
    held_order: VecDeque<Identifier>,
    policy: UnregisteredPolicy,
    output_capacity: usize,
    dropped: u64,
}

impl<T: Send + 'static> DemuxerActor<T> {
    fn new(config: &DemuxerConfig) -> Self {
        Self {
            outputs: HashMap::new(),
            held: HashMap::new(),
            held_order: VecDeque::new(),
            policy: config.unregistered,
            output_capacity: config.output_capacity.max(1),
            dropped: 0,
        }
    }

    async fn run(
        mut self,
        mut ctl: mpsc::Receiver<Command<T>>,
        mut shared: mpsc::Receiver<Bundle<T>>,
    ) {
        let mut accepting = true;

        loop {
            tokio::select! {
                command = ctl.recv(), if accepting => match command {
                    Some(Command::Register { id, outlet, reply }) => {
                        let (registration, backlog) = self.register(id, outlet);
                        let _ = reply.send(registration);
                        // Replay only after the caller holds the output, or a
                        // small output would block the actor on a reader that
                        // does not exist yet.
                        if let Some(backlog) = backlog {
                            self.replay(id, backlog).await;
                        }
                    }
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(self.stats());
                    }
                    None => {
                        debug!("All demuxer handles dropped, routing until shared input ends");
                        accepting = false;
                    }
                },
                bundle = shared.recv() => match bundle {
                    Some(bundle) => self.dispatch(bundle).await,
                    None => break,
                },
            }
        }

        info!(
            closed = self.outputs.len(),
            held = self.held.values().map(VecDeque::len).sum::<usize>(),
            dropped = self.dropped,
            "Shared input ended, closing outputs"
        );
        self.outputs.clear();
    }

    fn register(
        &mut self,
        id: Identifier,
        outlet: Option<Outlet<T>>,
    ) -> (Registration<T>, Option<Backlog<T>>) {
        if let Some(existing) = self.outputs.get(&id) {
            if let Some(rejected) = outlet {
                debug!(%id, handle = %rejected.handle_id(), "Identifier already registered, closing new output");
            }
            return (Registration::AlreadyRegistered(existing.stream()), None);
        }

        let outlet = outlet.unwrap_or_else(|| output_stream(self.output_capacity).0);
        let stream = outlet.stream();
        info!(%id, handle = %outlet.handle_id(), "Output registered");
        self.outputs.insert(id, outlet);

        let backlog = self.held.remove(&id);
        if backlog.is_some() {
            self.held_order.retain(|held| *held != id);
        }
        (Registration::Registered(stream), backlog)
    }

    async fn replay(&mut self, id: Identifier, backlog: Backlog<T>) {
        debug!(%id, count = backlog.len(), "Replaying held bundles");
        for payload in backlog {
            self.route(id, payload).await;
        }
    }

    async fn dispatch(&mut self, bundle: Bundle<T>) {
        let (id, payload) = bundle.into_parts();
        self.route(id, payload).await;
    }

    async fn route(&mut self, id: Identifier, payload: Option<T>) {
        let Some(outlet) = self.outputs.get(&id) else {
            self.unregistered(id, payload);
            return;
        };

        match payload {
            // Blocks while the output is full, even if nobody reads it.
            Some(item) => {
                trace!(%id, "Forwarding payload");
                outlet.send(item).await;
            }
            None => {
                self.outputs.remove(&id);
                debug!(%id, "Close marker received, output closed");
            }
        }
    }

    fn unregistered(&mut self, id: Identifier, payload: Option<T>) {
        if let UnregisteredPolicy::Hold {
            per_stream,
            max_streams,
        } = self.policy
        {
            if let Some(backlog) = self.held.get_mut(&id) {
                if backlog.len() < per_stream {
                    backlog.push_back(payload);
                    trace!(%id, "Holding bundle for unregistered identifier");
                    return;
                }
            } else if per_stream > 0 && max_streams > 0 {
                while self.held.len() >= max_streams && self.evict_oldest() {}
                self.held.insert(id, VecDeque::from([payload]));
                self.held_order.push_back(id);
                trace!(%id, "Holding bundle for unregistered identifier");
                return;
            }
        }

        self.dropped += 1;
        warn!(%id, close = payload.is_none(), "Dropping bundle for unregistered identifier");
    }

    /// Discard the backlog held longest to make room for a new identifier.
    fn evict_oldest(&mut self) -> bool {
        let Some(id) = self.held_order.pop_front() else {
            return false;
        };
        if let Some(backlog) = self.held.remove(&id) {
            self.dropped += backlog.len() as u64;
            warn!(%id, count = backlog.len(), "Evicting held bundles for unregistered identifier");
        }
        true
    }

    fn stats(&self) -> DemuxerStats {
        DemuxerStats {
            registered: self.outputs.len(),
            held: self.held.values().map(VecDeque::len).sum(),
            dropped: self.dropped,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn id(raw: u64) -> Identifier {
        Identifier::from(raw)
    }

    async fn recv<T>(output: &OutputStream<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(5), output.recv())
            .await
            .expect("output stalled")
    }

    /// Wait until the actor has processed everything sent before this call.
    async fn settle<T: Send + 'static>(demuxer: &Demuxer<T>) -> DemuxerStats {
        demuxer.stats().await.unwrap()
    }

    #[tokio::test]
    async fn register_without_output_creates_one() {
        let (shared_tx, shared_rx) = mpsc::channel(4);
        let demuxer = Demuxer::new(shared_rx);

        let registration = demuxer.register(id(7), None).await.unwrap();
        assert!(registration.is_new());
        let output = registration.into_stream();

        shared_tx.send(Bundle::payload(id(7), "x")).await.unwrap();
        assert_eq!(recv(&output).await, Some("x"));

        shared_tx.send(Bundle::close(id(7))).await.unwrap();
        assert_eq!(recv(&output).await, None);

        shared_tx.send(Bundle::payload(id(7), "y")).await.unwrap();
        let stats = settle(&demuxer).await;
        assert_eq!(stats.registered, 0);
        // The stats round trip may overtake the bundle; poll briefly.
        tokio::time::timeout(Duration::from_secs(5), async {
            while demuxer.stats().await.unwrap().dropped < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("late bundle was not dropped");
    }

    #[tokio::test]
    async fn second_registration_keeps_first_output() {
        let (_shared_tx, shared_rx) = mpsc::channel::<Bundle<u32>>(4);
        let demuxer = Demuxer::new(shared_rx);

        let (first_outlet, first) = output_stream(1);
        let registration = demuxer.register(id(1), Some(first_outlet)).await.unwrap();
        assert!(registration.stream().same_stream(&first));

        let (second_outlet, second) = output_stream(1);
        let registration = demuxer.register(id(1), Some(second_outlet)).await.unwrap();
        assert!(!registration.is_new());
        assert!(registration.stream().same_stream(&first));
        assert!(!registration.stream().same_stream(&second));

        // The rejected output was closed.
        assert_eq!(recv(&second).await, None);
    }

    #[tokio::test]
    async fn unregistered_bundles_do_not_block_others() {
        let (shared_tx, shared_rx) = mpsc::channel(1);
        let demuxer = Demuxer::new(shared_rx);
        let output = demuxer.register(id(2), None).await.unwrap().into_stream();

        for n in 0..10 {
            shared_tx.send(Bundle::payload(id(99), n)).await.unwrap();
        }
        shared_tx.send(Bundle::payload(id(2), 42)).await.unwrap();

        assert_eq!(recv(&output).await, Some(42));
        assert_eq!(settle(&demuxer).await.dropped, 10);
    }

    #[tokio::test]
    async fn end_of_shared_input_closes_every_output() {
        let (shared_tx, shared_rx) = mpsc::channel(4);
        let demuxer = Demuxer::new(shared_rx);
        let a = demuxer.register(id(0), None).await.unwrap().into_stream();
        let b = demuxer.register(id(1), None).await.unwrap().into_stream();

        shared_tx.send(Bundle::payload(id(0), 'a')).await.unwrap();
        drop(shared_tx);

        assert_eq!(recv(&a).await, Some('a'));
        assert_eq!(recv(&a).await, None);
        assert_eq!(recv(&b).await, None);
        assert!(matches!(
            demuxer.register(id(3), None).await,
            Err(Error::ActorStopped(_))
        ));
    }

    #[tokio::test]
    async fn routing_continues_after_handles_drop() {
        let (shared_tx, shared_rx) = mpsc::channel(4);
        let demuxer = Demuxer::new(shared_rx);
        let output = demuxer.register(id(0), None).await.unwrap().into_stream();
        drop(demuxer);

        shared_tx.send(Bundle::payload(id(0), 5)).await.unwrap();
        shared_tx.send(Bundle::close(id(0))).await.unwrap();

        assert_eq!(recv(&output).await, Some(5));
        assert_eq!(recv(&output).await, None);
    }

    #[tokio::test]
    async fn reregistering_after_dropping_output_returns_buffered_payload() {
        let (shared_tx, shared_rx) = mpsc::channel(4);
        let demuxer = Demuxer::new(shared_rx);
        drop(demuxer.register(id(4), None).await.unwrap());

        shared_tx.send(Bundle::payload(id(4), 1)).await.unwrap();
        // Fits the default output capacity of one, so routing does not block.
        tokio::time::timeout(Duration::from_secs(5), async {
            while shared_tx.capacity() < 4 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("payload was not routed");
        settle(&demuxer).await;

        let registration = demuxer.register(id(4), None).await.unwrap();
        assert!(!registration.is_new());
        let output = registration.into_stream();
        assert_eq!(recv(&output).await, Some(1));

        shared_tx.send(Bundle::close(id(4))).await.unwrap();
        assert_eq!(recv(&output).await, None);

        let stats = settle(&demuxer).await;
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.registered, 0);
    }

    #[tokio::test]
    async fn hold_policy_replays_early_bundles() {
        let (shared_tx, shared_rx) = mpsc::channel(8);
        let config = DemuxerConfig {
            unregistered: UnregisteredPolicy::Hold {
                per_stream: 2,
                max_streams: 2,
            },
            ..Default::default()
        };
        let demuxer = Demuxer::with_config(shared_rx, config);

        shared_tx.send(Bundle::payload(id(0), 1)).await.unwrap();
        shared_tx.send(Bundle::close(id(0))).await.unwrap();
        // Over the per-identifier bound.
        shared_tx.send(Bundle::payload(id(0), 2)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while demuxer.stats().await.unwrap().dropped < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("overflow was not dropped");
        assert_eq!(settle(&demuxer).await.held, 2);

        let output = demuxer.register(id(0), None).await.unwrap().into_stream();
        assert_eq!(recv(&output).await, Some(1));
        assert_eq!(recv(&output).await, None);

        let stats = settle(&demuxer).await;
        assert_eq!(stats.held, 0);
        assert_eq!(stats.registered, 0);
    }

    #[tokio::test]
    async fn hold_policy_evicts_oldest_backlog_at_identifier_bound() {
        let (shared_tx, shared_rx) = mpsc::channel(8);
        let config = DemuxerConfig {
            unregistered: UnregisteredPolicy::Hold {
                per_stream: 4,
                max_streams: 2,
            },
            ..Default::default()
        };
        let demuxer = Demuxer::with_config(shared_rx, config);

        // Identifier 0 finished before anyone claimed it.
        shared_tx.send(Bundle::payload(id(0), 1)).await.unwrap();
        shared_tx.send(Bundle::close(id(0))).await.unwrap();
        shared_tx.send(Bundle::payload(id(1), 2)).await.unwrap();
        // Third identifier: the backlog of 0 makes room.
        shared_tx.send(Bundle::payload(id(2), 3)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while demuxer.stats().await.unwrap().dropped < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("oldest backlog was not evicted");
        assert_eq!(settle(&demuxer).await.held, 2);

        let one = demuxer.register(id(1), None).await.unwrap().into_stream();
        assert_eq!(recv(&one).await, Some(2));
        let two = demuxer.register(id(2), None).await.unwrap().into_stream();
        assert_eq!(recv(&two).await, Some(3));

        assert!(demuxer.register(id(0), None).await.unwrap().is_new());
        let stats = settle(&demuxer).await;
        assert_eq!(stats.held, 0);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.registered, 3);
    }
}
