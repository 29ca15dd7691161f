//! The `persistence` module keeps the per-topic message log used by the
//! broker's persistent mode.
//!
//! Subscribers that join a topic late receive the log's history before live
//! messages. The log lives in memory only: it does not survive a restart and
//! it is unbounded, so persistent mode trades memory for replay.

mod memory_log;

pub use memory_log::MessageLog;
