//! chanmux Library
//!
//! Channel routing primitives for a single process:
//! - [`Muxer`]: tags many logical input streams onto one shared channel
//! - [`Demuxer`]: routes tagged [`Bundle`]s from a shared channel to per-stream outputs
//! - [`relay::unbounded_relay`]: unbounded buffer to decouple producer and consumer rates
//!
//! The caller owns the shared channel and hands its halves to both sides:
//!
//! ```no_run
//! # async fn example() -> chanmux::Result<()> {
//! use chanmux::{Demuxer, Muxer, input_stream};
//! use tokio::sync::mpsc;
//!
//! let (shared_tx, shared_rx) = mpsc::channel(64);
//! let muxer = Muxer::new(shared_tx);
//! let demuxer = Demuxer::new(shared_rx);
//!
//! let (tx, input) = input_stream::<String>(8);
//! let id = muxer.register(&input).await?;
//! let output = demuxer.register(id, None).await?.into_stream();
//!
//! tx.send("hello".to_string()).await.ok();
//! assert_eq!(output.recv().await.as_deref(), Some("hello"));
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod demuxer;
pub mod muxer;
pub mod relay;
pub mod stream;

pub use bundle::{Bundle, Identifier};
pub use chanmux_core::{Error, Result, UnregisteredPolicy};
pub use demuxer::{Demuxer, DemuxerConfig, DemuxerStats, Registration};
pub use muxer::{Muxer, MuxerConfig, MuxerStats};
pub use stream::{HandleId, InputStream, Outlet, OutputStream, input_stream, output_stream};
