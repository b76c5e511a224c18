//! Stream handles with stable identity.
//!
//! A Muxer keys its table by the identity of the input handle and a Demuxer
//! hands back the output a caller registered, so both sides need handles that
//! can be cloned and compared. Clones of a handle share one [`HandleId`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Shared receive handle for a logical input stream.
///
/// Clones read from the same underlying channel; an item goes to whichever
/// reader takes it first.
pub struct InputStream<T> {
    id: HandleId,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> InputStream<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            id: HandleId::next(),
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub const fn handle_id(&self) -> HandleId {
        self.id
    }

    /// Next item, or `None` once every sender is gone and the buffer is empty.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Clone for InputStream<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> From<mpsc::Receiver<T>> for InputStream<T> {
    fn from(rx: mpsc::Receiver<T>) -> Self {
        Self::new(rx)
    }
}

impl<T> fmt::Debug for InputStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream").field("id", &self.id).finish()
    }
}

/// Create a bounded logical input stream.
pub fn input_stream<T>(capacity: usize) -> (mpsc::Sender<T>, InputStream<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, InputStream::new(rx))
}

/// Shared receive handle for a demultiplexed output.
pub struct OutputStream<T> {
    id: HandleId,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> OutputStream<T> {
    pub const fn handle_id(&self) -> HandleId {
        self.id
    }

    /// Next item, or `None` once the output has been closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Whether `other` is a handle to the same output.
    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

impl<T> Clone for OutputStream<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> fmt::Debug for OutputStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream").field("id", &self.id).finish()
    }
}

/// Send half of an output, handed to a Demuxer.
///
/// Dropping the outlet closes the output. The outlet keeps the receiving end
/// alive, so items sent after every [`OutputStream`] is gone stay buffered
/// for the next handle taken with [`Outlet::stream`].
pub struct Outlet<T> {
    id: HandleId,
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Outlet<T> {
    pub const fn handle_id(&self) -> HandleId {
        self.id
    }

    /// A new handle to the paired output.
    pub fn stream(&self) -> OutputStream<T> {
        OutputStream {
            id: self.id,
            rx: Arc::clone(&self.rx),
        }
    }

    /// Deliver one item, waiting for room.
    pub(crate) async fn send(&self, item: T) {
        // The receiver lives as long as this outlet, so send only fails if
        // it was closed, which nothing here does.
        let _ = self.tx.send(item).await;
    }
}

impl<T> fmt::Debug for Outlet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outlet")
            .field("id", &self.id)
            .field("readers", &(Arc::strong_count(&self.rx) - 1))
            .finish()
    }
}

/// Create an output: the [`Outlet`] goes to a Demuxer, the
/// [`OutputStream`] stays with the consumer.
pub fn output_stream<T>(capacity: usize) -> (Outlet<T>, OutputStream<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let outlet = Outlet {
        id: HandleId::next(),
        tx,
        rx: Arc::new(Mutex::new(rx)),
    };
    let stream = outlet.stream();
    (outlet, stream)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_identity() {
        let (_tx, input) = input_stream::<u8>(1);
        let (_tx2, other) = input_stream::<u8>(1);

        assert_eq!(input.clone().handle_id(), input.handle_id());
        assert_ne!(input.handle_id(), other.handle_id());
    }

    #[tokio::test]
    async fn input_ends_after_senders_drop() {
        let (tx, input) = input_stream(4);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        assert_eq!(input.recv().await, Some(1));
        assert_eq!(input.recv().await, Some(2));
        assert_eq!(input.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_outlet_closes_output_after_drain() {
        let (outlet, output) = output_stream(2);
        outlet.send("a").await;
        drop(outlet);

        assert_eq!(output.recv().await, Some("a"));
        assert_eq!(output.recv().await, None);
    }

    #[tokio::test]
    async fn outlet_buffers_until_a_new_stream_is_taken() {
        let (outlet, output) = output_stream(1);
        drop(output);
        outlet.send(7u32).await;

        let output = outlet.stream();
        drop(outlet);
        assert_eq!(output.recv().await, Some(7));
        assert_eq!(output.recv().await, None);
    }
}
