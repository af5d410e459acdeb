//! framesync: resumable chunked file transfer from edge devices to
//! collector servers.
//!
//! The sender watches a directory for finished captures and pushes each
//! one to a collector as fixed-size chunks over a length-prefixed TCP
//! protocol, resuming across reconnects. The receiver reassembles chunks,
//! verifies coverage, writes the blob durably, and hands the result to a
//! downstream pipeline. A file leaves the device only after the collector
//! acknowledges the durable write.

pub mod codec;
pub mod config;
pub mod limiter;
pub mod pool;
pub mod protocol;
pub mod reassembly;
pub mod receiver;
pub mod retry;
pub mod sender;
pub mod store;
pub mod usage;
