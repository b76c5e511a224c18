//! chanmux CLI Library
//!
//! Drives a Muxer and a Demuxer over one shared channel with many concurrent
//! producers and checks that every stream arrives complete and in order.

pub mod soak;
