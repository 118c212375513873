//! Building blocks of the alert-stream bridge that never touch the network: the event model,
//! the multipart frame splitter, the frame parser, the deduplicator, the reconnect policy and
//! the sink contract.
pub mod dedup;
pub mod event;
pub mod metrics;
pub mod multipart;
pub mod parser;
pub mod retry;
pub mod sink;
