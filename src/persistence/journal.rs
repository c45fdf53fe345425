//! Disk-backed failover journal.
//!
//! A [`FailoverJournal`] owns one directory holding two files:
//!
//! - `data`: the spool, a raw append-only concatenation of serialized
//!   messages;
//! - `journal`: an array of 20-byte [`JournalRecord`]s, one appended after
//!   every mutation of the spool.
//!
//! The spool is protected by an exclusive advisory lock for the lifetime of
//! the journal. All writes run with signals masked. There is no fsync: after
//! a power loss the newest record may not match the spool, in which case
//! recovery discards the backlog instead of trusting it.

use std::fs::{DirBuilder, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, FileExt as _, OpenOptionsExt};
use std::path::{Path, PathBuf};

use fs2::FileExt as _;

use super::record::{JournalRecord, RECORD_SIZE};
use super::signals::SignalMask;
use crate::error::RelayError;
use crate::transport::{Message, MessageError};

/// File name of the message spool.
pub const DATA_FILE: &str = "data";

/// File name of the recovery records.
pub const JOURNAL_FILE: &str = "journal";

const RECORD_LEN: u64 = RECORD_SIZE as u64;

/// Append-only message spool with crash recovery.
#[derive(Debug)]
pub struct FailoverJournal {
    directory: PathBuf,
    wfd: File,
    rfd: File,
    jfd: File,
    /// Messages not yet committed as read.
    count: u64,
    /// Committed read offset.
    rindex: u64,
    /// Read cursor; ahead of `rindex` while a transaction is open.
    read_pos: u64,
    /// Messages read but neither committed nor rolled back.
    pending: u64,
    spool_size: u64,
    journal_size: u64,
    transaction: bool,
}

impl FailoverJournal {
    /// Opens (creating if needed) the journal stored in `dirname` and runs
    /// crash recovery.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::JournalLocked`] if another journal already owns
    /// the directory, or [`RelayError::Journal`] if the directory or its
    /// files cannot be created or read.
    pub fn new(dirname: impl AsRef<Path>) -> Result<Self, RelayError> {
        let directory = dirname.as_ref().to_path_buf();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&directory)
            .map_err(|e| RelayError::journal(&directory, e))?;

        let data_path = directory.join(DATA_FILE);
        let wfd = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&data_path)
            .map_err(|e| RelayError::journal(&directory, e))?;

        if let Err(err) = wfd.try_lock_exclusive() {
            if err.kind() == fs2::lock_contended_error().kind() {
                return Err(RelayError::JournalLocked(directory));
            }
            return Err(RelayError::journal(&directory, err));
        }

        let rfd = File::open(&data_path).map_err(|e| RelayError::journal(&directory, e))?;
        let jfd = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .mode(0o600)
            .open(directory.join(JOURNAL_FILE))
            .map_err(|e| RelayError::journal(&directory, e))?;

        let mut journal = Self {
            directory,
            wfd,
            rfd,
            jfd,
            count: 0,
            rindex: 0,
            read_pos: 0,
            pending: 0,
            spool_size: 0,
            journal_size: 0,
            transaction: false,
        };
        journal.recover()?;
        Ok(journal)
    }

    /// Enables or disables transactional reads.
    ///
    /// When enabled, [`Self::get_saved`] leaves the message in the backlog
    /// until [`Self::commit`] is called.
    pub fn set_transaction(&mut self, enabled: bool) {
        self.transaction = enabled;
    }

    /// Whether transactional reads are enabled.
    #[must_use]
    pub const fn is_transactional(&self) -> bool {
        self.transaction
    }

    /// Directory holding the journal files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Number of messages waiting in the spool.
    #[must_use]
    pub fn available_count(&self) -> usize {
        usize::try_from(self.count).unwrap_or(usize::MAX)
    }

    /// Number of messages dropped to enforce a quota. No quota is enforced,
    /// so this is always zero.
    #[must_use]
    pub const fn deleted_count(&self) -> usize {
        0
    }

    /// Appends `msg` to the spool and records the new state.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Journal`] if either file cannot be written; the
    /// journal is left in its previous state.
    pub fn save(&mut self, msg: &Message) -> Result<(), RelayError> {
        let _mask = SignalMask::block_all();
        let previous_size = self.spool_size;

        if let Err(err) = self.wfd.write_all(msg.as_bytes()) {
            self.restore_spool(previous_size);
            return Err(RelayError::journal(&self.directory, err));
        }

        self.spool_size = previous_size + msg.len() as u64;
        self.count += 1;

        if let Err(err) = self.append_record() {
            self.count -= 1;
            self.restore_spool(previous_size);
            self.spool_size = previous_size;
            return Err(err);
        }
        Ok(())
    }

    /// Reads the next saved message.
    ///
    /// Outside transactional mode the message is committed right away.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Message`] if the spool holds a malformed
    /// message, or [`RelayError::Journal`] on I/O failure.
    pub fn get_saved(&mut self) -> Result<Option<Message>, RelayError> {
        if self.pending >= self.count || self.read_pos >= self.spool_size {
            return Ok(None);
        }

        self.rfd
            .seek(SeekFrom::Start(self.read_pos))
            .map_err(|e| RelayError::journal(&self.directory, e))?;
        let msg = match Message::read_from(&mut self.rfd) {
            Ok(msg) => msg,
            Err(MessageError::Io(err)) => return Err(RelayError::journal(&self.directory, err)),
            Err(err) => {
                tracing::warn!(
                    directory = %self.directory.display(),
                    offset = self.read_pos,
                    error = %err,
                    "malformed message in failover spool"
                );
                return Err(err.into());
            }
        };

        self.read_pos += msg.len() as u64;
        self.pending += 1;

        if !self.transaction {
            self.commit(&msg)?;
        }
        Ok(Some(msg))
    }

    /// Marks `msg`, previously returned by [`Self::get_saved`], as read.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Journal`] if no read is outstanding, if the
    /// message would move the read offset past the spool end, or if the
    /// record cannot be written.
    pub fn commit(&mut self, msg: &Message) -> Result<(), RelayError> {
        let len = msg.len() as u64;
        if self.pending == 0 || self.rindex + len > self.spool_size {
            return Err(RelayError::journal(
                &self.directory,
                io::Error::new(io::ErrorKind::InvalidInput, "commit without matching read"),
            ));
        }

        let _mask = SignalMask::block_all();
        self.rindex += len;
        self.count -= 1;
        self.pending -= 1;
        self.read_pos = self.read_pos.max(self.rindex);

        if self.count == 0 {
            return self.truncate_all();
        }
        if let Err(err) = self.append_record() {
            self.rindex -= len;
            self.count += 1;
            self.pending += 1;
            return Err(err);
        }
        Ok(())
    }

    /// Returns `msg`, previously returned by [`Self::get_saved`], to the
    /// backlog so the next read yields it again.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Journal`] if no read is outstanding.
    pub fn rollback(&mut self, msg: &Message) -> Result<(), RelayError> {
        if self.pending == 0 {
            return Err(RelayError::journal(
                &self.directory,
                io::Error::new(io::ErrorKind::InvalidInput, "rollback without matching read"),
            ));
        }
        self.pending -= 1;
        self.read_pos = self
            .read_pos
            .saturating_sub(msg.len() as u64)
            .max(self.rindex);
        Ok(())
    }

    fn append_record(&mut self) -> Result<(), RelayError> {
        let record = JournalRecord::new(self.count, self.rindex, self.spool_size);
        if let Err(err) = self.jfd.write_all(&record.encode()) {
            if let Err(undo) = self.jfd.set_len(self.journal_size) {
                tracing::warn!(error = %undo, "cannot drop torn journal record");
            }
            return Err(RelayError::journal(&self.directory, err));
        }
        self.journal_size += RECORD_LEN;
        Ok(())
    }

    fn restore_spool(&mut self, size: u64) {
        if let Err(err) = self.wfd.set_len(size) {
            tracing::warn!(
                directory = %self.directory.display(),
                error = %err,
                "cannot drop partial spool append"
            );
        }
    }

    /// Empties both files and resets the counters.
    fn truncate_all(&mut self) -> Result<(), RelayError> {
        let _mask = SignalMask::block_all();
        self.wfd
            .set_len(0)
            .map_err(|e| RelayError::journal(&self.directory, e))?;
        self.jfd
            .set_len(0)
            .map_err(|e| RelayError::journal(&self.directory, e))?;
        self.count = 0;
        self.rindex = 0;
        self.read_pos = 0;
        self.pending = 0;
        self.spool_size = 0;
        self.journal_size = 0;
        Ok(())
    }

    fn recover(&mut self) -> Result<(), RelayError> {
        let spool_size = self
            .wfd
            .metadata()
            .map_err(|e| RelayError::journal(&self.directory, e))?
            .len();
        let journal_size = self
            .jfd
            .metadata()
            .map_err(|e| RelayError::journal(&self.directory, e))?
            .len();

        if journal_size == 0 {
            if spool_size > 0 {
                tracing::warn!(
                    directory = %self.directory.display(),
                    spool_size,
                    "failover spool has no journal, discarding backlog"
                );
                return self.truncate_all();
            }
            return Ok(());
        }

        if journal_size % RECORD_LEN != 0 {
            tracing::warn!(
                directory = %self.directory.display(),
                journal_size,
                "journal length is not a multiple of the record size"
            );
        }

        let mut accepted = None;
        let mut buf = [0u8; RECORD_SIZE];
        for index in (0..journal_size / RECORD_LEN).rev() {
            self.jfd
                .read_exact_at(&mut buf, index * RECORD_LEN)
                .map_err(|e| RelayError::journal(&self.directory, e))?;
            if let Some(record) = JournalRecord::decode(&buf)
                && record.is_valid_for(spool_size)
            {
                accepted = Some(record);
                break;
            }
        }

        let Some(record) = accepted else {
            tracing::warn!(
                directory = %self.directory.display(),
                spool_size,
                "no consistent journal record, discarding backlog"
            );
            return self.truncate_all();
        };

        if record.rindex == spool_size || record.count == 0 {
            return self.truncate_all();
        }

        self.count = record.count;
        self.rindex = record.rindex;
        self.read_pos = record.rindex;
        self.spool_size = spool_size;

        if journal_size != RECORD_LEN {
            let _mask = SignalMask::block_all();
            self.jfd
                .set_len(0)
                .map_err(|e| RelayError::journal(&self.directory, e))?;
            self.journal_size = 0;
            self.append_record()?;
        } else {
            self.journal_size = journal_size;
        }

        tracing::info!(
            directory = %self.directory.display(),
            backlog = self.count,
            "recovered failover journal"
        );
        Ok(())
    }
}
