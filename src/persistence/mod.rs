//! Persistence layer: the failover journal.
//!
//! Messages that cannot be delivered are spooled to disk by a
//! [`FailoverJournal`], one per destination plus one for the whole pool.
//! Recovery records ([`JournalRecord`]) let a journal reopened after a crash
//! tell a consistent backlog from a torn one.

pub mod journal;
pub mod record;
mod signals;

pub use journal::FailoverJournal;
pub use record::{JournalRecord, RECORD_SIZE};
