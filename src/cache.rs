use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::util::lock_unpoisoned;

const JOURNAL_FILE: &str = "journal";
const JOURNAL_FILE_TMP: &str = "journal.tmp";
const JOURNAL_FILE_BACKUP: &str = "journal.bkp";
const MAGIC: &str = "libcore.io.DiskLruCache";
const VERSION: &str = "1";

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// Accept any sequence number when opening an edit directly by key.
const ANY_SEQUENCE_NUMBER: i64 = -1;

/// Sentinel editor id assigned to entries replayed from a DIRTY line.
const REPLAY_EDITOR_ID: u64 = 0;

/// Journal housekeeping threshold: compact once this many redundant ops
/// accumulate, provided they outnumber the live entries.
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

fn is_legal_key(key: &str) -> bool {
    (1..=120).contains(&key.len())
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

fn validate_key(key: &str) -> Result<()> {
    if is_legal_key(key) {
        Ok(())
    } else {
        Err(Error::InvalidCacheKey {
            key: key.to_owned(),
        })
    }
}

struct Entry {
    lengths: Vec<u64>,
    readable: bool,
    current_editor: Option<u64>,
    sequence_number: i64,
}

impl Entry {
    fn new(value_count: usize) -> Self {
        Self {
            lengths: vec![0; value_count],
            readable: false,
            current_editor: None,
            sequence_number: 0,
        }
    }
}

struct CacheState {
    initialized: bool,
    closed: bool,
    max_size: u64,
    size: u64,
    journal_writer: Option<BufWriter<File>>,
    entries: HashMap<String, Entry>,
    /// Keys from least to most recently used.
    access_order: Vec<String>,
    redundant_op_count: usize,
    has_journal_errors: bool,
    most_recent_trim_failed: bool,
    most_recent_rebuild_failed: bool,
    next_sequence_number: i64,
    next_editor_id: u64,
}

struct CacheShared {
    directory: PathBuf,
    journal_file: PathBuf,
    journal_file_tmp: PathBuf,
    journal_file_backup: PathBuf,
    app_version: u32,
    value_count: usize,
    state: Mutex<CacheState>,
    cleanup: mpsc::Sender<()>,
}

/// A bounded store of key → N-slot values on disk, with LRU eviction and a
/// journal that makes open/crash/reopen lossless for committed entries.
/// All operations tolerate crashes at any point; partially-written values
/// are discarded on the next open.
#[derive(Clone)]
pub struct DiskCache {
    shared: Arc<CacheShared>,
}

impl DiskCache {
    /// Opens the cache in `directory`, creating it if necessary. A journal
    /// that fails structural validation is discarded along with every value
    /// file, and the cache starts empty.
    pub fn open(
        directory: impl Into<PathBuf>,
        app_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<DiskCache> {
        if value_count == 0 {
            return Err(Error::InvalidLimit { value: 0 });
        }
        if max_size == 0 {
            return Err(Error::InvalidLimit { value: 0 });
        }
        let directory = directory.into();
        let (cleanup_sender, cleanup_receiver) = mpsc::channel();
        let shared = Arc::new(CacheShared {
            journal_file: directory.join(JOURNAL_FILE),
            journal_file_tmp: directory.join(JOURNAL_FILE_TMP),
            journal_file_backup: directory.join(JOURNAL_FILE_BACKUP),
            directory,
            app_version,
            value_count,
            state: Mutex::new(CacheState {
                initialized: false,
                closed: false,
                max_size,
                size: 0,
                journal_writer: None,
                entries: HashMap::new(),
                access_order: Vec::new(),
                redundant_op_count: 0,
                has_journal_errors: false,
                most_recent_trim_failed: false,
                most_recent_rebuild_failed: false,
                next_sequence_number: 0,
                next_editor_id: REPLAY_EDITOR_ID + 1,
            }),
            cleanup: cleanup_sender,
        });

        {
            let mut state = lock_unpoisoned(&shared.state);
            shared.initialize(&mut state)?;
        }

        let worker_handle: Weak<CacheShared> = Arc::downgrade(&shared);
        let spawned = std::thread::Builder::new()
            .name("httpcall-cache".to_owned())
            .spawn(move || {
                while cleanup_receiver.recv().is_ok() {
                    let Some(shared) = worker_handle.upgrade() else {
                        return;
                    };
                    shared.cleanup();
                }
            });
        if let Err(error) = spawned {
            warn!(error = %error, "failed to spawn cache cleanup thread");
        }

        Ok(DiskCache { shared })
    }

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    pub fn max_size(&self) -> u64 {
        lock_unpoisoned(&self.shared.state).max_size
    }

    /// Adjusting the bound schedules an eviction pass; it never blocks.
    pub fn set_max_size(&self, max_size: u64) -> Result<()> {
        if max_size == 0 {
            return Err(Error::InvalidLimit { value: 0 });
        }
        lock_unpoisoned(&self.shared.state).max_size = max_size;
        self.shared.schedule_cleanup();
        Ok(())
    }

    /// Total bytes currently stored in committed values.
    pub fn size(&self) -> u64 {
        lock_unpoisoned(&self.shared.state).size
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.shared.state).closed
    }

    /// Returns a snapshot of the committed value under `key`, with every
    /// slot's stream already open so a concurrent edit or eviction cannot
    /// make the reads inconsistent.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        validate_key(key)?;
        let mut state = lock_unpoisoned(&self.shared.state);
        check_not_closed(&state)?;

        let Some(entry) = state.entries.get(key) else {
            return Ok(None);
        };
        if !entry.readable {
            return Ok(None);
        }

        let mut files = Vec::with_capacity(self.shared.value_count);
        for index in 0..self.shared.value_count {
            match File::open(self.shared.clean_file(key, index)) {
                Ok(file) => files.push(Some(file)),
                Err(error) => {
                    // A value file vanished underneath us. Degrade to a
                    // miss and drop the entry.
                    debug!(key, index, error = %error, "cache value file missing");
                    self.shared.remove_entry_locked(&mut state, key);
                    return Ok(None);
                }
            }
        }

        let lengths = state
            .entries
            .get(key)
            .map(|entry| entry.lengths.clone())
            .unwrap_or_default();
        let sequence_number = state
            .entries
            .get(key)
            .map(|entry| entry.sequence_number)
            .unwrap_or(ANY_SEQUENCE_NUMBER);

        state.redundant_op_count += 1;
        self.shared
            .journal_line(&mut state, &format!("{READ} {key}"));
        touch(&mut state.access_order, key);
        if journal_rebuild_required(&state) {
            self.shared.schedule_cleanup();
        }

        Ok(Some(Snapshot {
            cache: self.clone(),
            key: key.to_owned(),
            sequence_number,
            files,
            lengths,
        }))
    }

    /// Opens an edit on `key`, or `None` when another edit is in flight or
    /// background housekeeping is in a failed state that must clear first.
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        self.edit_at(key, ANY_SEQUENCE_NUMBER)
    }

    fn edit_at(&self, key: &str, expected_sequence_number: i64) -> Result<Option<Editor>> {
        validate_key(key)?;
        let mut state = lock_unpoisoned(&self.shared.state);
        check_not_closed(&state)?;

        if expected_sequence_number != ANY_SEQUENCE_NUMBER {
            let current = state.entries.get(key);
            let stale = match current {
                Some(entry) => entry.sequence_number != expected_sequence_number,
                None => true,
            };
            if stale {
                return Ok(None);
            }
        }
        if state
            .entries
            .get(key)
            .is_some_and(|entry| entry.current_editor.is_some())
        {
            return Ok(None);
        }
        if state.most_recent_trim_failed || state.most_recent_rebuild_failed {
            // The OS may be refusing the eviction this edit needs to
            // succeed. Clear the backlog before accepting new writes.
            self.shared.schedule_cleanup();
            return Ok(None);
        }

        self.shared
            .journal_line(&mut state, &format!("{DIRTY} {key}"));
        if state.has_journal_errors {
            return Ok(None);
        }

        let editor_id = state.next_editor_id;
        state.next_editor_id += 1;
        let value_count = self.shared.value_count;
        let entry = state
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(value_count));
        entry.current_editor = Some(editor_id);
        touch(&mut state.access_order, key);

        Ok(Some(Editor {
            cache: self.clone(),
            key: key.to_owned(),
            id: editor_id,
            written: vec![false; value_count],
            done: false,
        }))
    }

    /// Drops the committed value under `key` if present. An in-flight edit
    /// is detached: its writes land in files nobody will read and its
    /// commit becomes a no-op.
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let mut state = lock_unpoisoned(&self.shared.state);
        check_not_closed(&state)?;
        let removed = self.shared.remove_entry_locked(&mut state, key);
        if removed && state.size <= state.max_size {
            state.most_recent_trim_failed = false;
        }
        Ok(removed)
    }

    /// Removes every entry. Unlike [`DiskCache::delete`] the cache stays
    /// open.
    pub fn evict_all(&self) -> Result<()> {
        let mut state = lock_unpoisoned(&self.shared.state);
        check_not_closed(&state)?;
        let keys: Vec<String> = state.access_order.clone();
        for key in keys {
            self.shared.remove_entry_locked(&mut state, &key);
        }
        state.most_recent_trim_failed = false;
        Ok(())
    }

    /// Forces buffered journal lines to disk.
    pub fn flush(&self) -> Result<()> {
        let mut state = lock_unpoisoned(&self.shared.state);
        check_not_closed(&state)?;
        if let Some(writer) = state.journal_writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Aborts in-flight edits, trims to the size bound, and closes the
    /// journal. Further operations fail with [`Error::CacheClosed`].
    pub fn close(&self) -> Result<()> {
        let mut state = lock_unpoisoned(&self.shared.state);
        if state.closed || !state.initialized {
            state.closed = true;
            return Ok(());
        }
        let editing: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.current_editor.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        for key in editing {
            self.shared.detach_editor_locked(&mut state, &key);
        }
        if let Err(error) = self.shared.trim_to_size(&mut state) {
            warn!(error = %error, "trim on close failed");
        }
        if let Some(mut writer) = state.journal_writer.take() {
            let _ = writer.flush();
        }
        state.closed = true;
        Ok(())
    }

    /// Closes the cache and deletes everything it stored, including the
    /// journal.
    pub fn delete(&self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.shared.directory)?;
        Ok(())
    }

    fn complete_edit(&self, key: &str, editor_id: u64, written: &[bool], success: bool) -> Result<()> {
        let mut state = lock_unpoisoned(&self.shared.state);
        let attached = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.current_editor == Some(editor_id));
        if !attached {
            // Detached by eviction or removal; its files are already gone.
            return Ok(());
        }

        let first_publish = !state.entries[key].readable;
        if success && first_publish {
            for (index, slot_written) in written.iter().enumerate() {
                if !slot_written {
                    drop(state);
                    let _ = self.complete_edit(key, editor_id, written, false);
                    return Err(Error::CacheEditIncomplete { index });
                }
            }
        }

        for index in 0..self.shared.value_count {
            let dirty = self.shared.dirty_file(key, index);
            if !success {
                let _ = fs::remove_file(&dirty);
                continue;
            }
            if dirty.exists() {
                let clean = self.shared.clean_file(key, index);
                let new_length = fs::metadata(&dirty).map(|m| m.len()).unwrap_or(0);
                fs::rename(&dirty, &clean)?;
                let entry = state
                    .entries
                    .get_mut(key)
                    .unwrap_or_else(|| unreachable!("attachment checked above"));
                let old_length = entry.lengths[index];
                entry.lengths[index] = new_length;
                state.size = state.size - old_length + new_length;
            }
        }

        state.redundant_op_count += 1;
        let sequence_number = state.next_sequence_number;
        if success {
            state.next_sequence_number += 1;
        }
        let entry = state
            .entries
            .get_mut(key)
            .unwrap_or_else(|| unreachable!("attachment checked above"));
        entry.current_editor = None;

        if entry.readable || success {
            entry.readable = true;
            if success {
                entry.sequence_number = sequence_number;
            }
            let lengths = entry
                .lengths
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            self.shared
                .journal_line(&mut state, &format!("{CLEAN} {key} {lengths}"));
        } else {
            state.entries.remove(key);
            state.access_order.retain(|k| k != key);
            self.shared
                .journal_line(&mut state, &format!("{REMOVE} {key}"));
        }

        if state.size > state.max_size || journal_rebuild_required(&state) {
            self.shared.schedule_cleanup();
        }
        Ok(())
    }
}

impl CacheShared {
    fn clean_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}"))
    }

    fn dirty_file(&self, key: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{key}.{index}.tmp"))
    }

    fn schedule_cleanup(&self) {
        let _ = self.cleanup.send(());
    }

    fn initialize(&self, state: &mut CacheState) -> Result<()> {
        fs::create_dir_all(&self.directory)?;

        // Prefer a backup journal left by an interrupted rebuild, unless
        // the rename already happened.
        if self.journal_file_backup.exists() {
            if self.journal_file.exists() {
                let _ = fs::remove_file(&self.journal_file_backup);
            } else {
                fs::rename(&self.journal_file_backup, &self.journal_file)?;
            }
        }

        if self.journal_file.exists() {
            match self.read_journal(state) {
                Ok(()) => {
                    self.process_journal(state)?;
                    state.initialized = true;
                    return Ok(());
                }
                Err(error) => {
                    warn!(
                        directory = %self.directory.display(),
                        error = %error,
                        "cache journal is unreadable, starting empty",
                    );
                    self.wipe(state)?;
                }
            }
        }

        self.rebuild_journal(state)?;
        state.initialized = true;
        Ok(())
    }

    /// Removes every file in the cache directory after corruption. The
    /// directory itself stays so the fresh journal has a home.
    fn wipe(&self, state: &mut CacheState) -> Result<()> {
        state.journal_writer = None;
        state.entries.clear();
        state.access_order.clear();
        state.size = 0;
        for dir_entry in fs::read_dir(&self.directory)? {
            let dir_entry = dir_entry?;
            fs::remove_file(dir_entry.path())?;
        }
        Ok(())
    }

    fn read_journal(&self, state: &mut CacheState) -> io::Result<()> {
        let mut reader = BufReader::new(File::open(&self.journal_file)?);

        let magic = read_full_line(&mut reader)?;
        let version = read_full_line(&mut reader)?;
        let app_version = read_full_line(&mut reader)?;
        let value_count = read_full_line(&mut reader)?;
        let blank = read_full_line(&mut reader)?;
        if magic != MAGIC
            || version != VERSION
            || app_version != self.app_version.to_string()
            || value_count != self.value_count.to_string()
            || !blank.is_empty()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected journal header: [{magic}, {version}, {app_version}, {value_count}, {blank}]"),
            ));
        }

        let mut line_count = 0usize;
        let mut truncated = false;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            if !line.ends_with('\n') {
                truncated = true;
                break;
            }
            self.read_journal_line(state, line.trim_end_matches(['\n', '\r']))?;
            line_count += 1;
        }
        state.redundant_op_count = line_count.saturating_sub(state.entries.len());

        if truncated {
            // The tail was lost mid-write. Everything before it replayed
            // fine; compact immediately.
            self.rebuild_journal(state)
                .map_err(|error| io::Error::other(error.to_string()))?;
        } else {
            state.journal_writer = Some(self.new_journal_writer()?);
        }
        Ok(())
    }

    fn read_journal_line(&self, state: &mut CacheState, line: &str) -> io::Result<()> {
        let malformed = || {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected journal line: {line}"),
            )
        };
        let (op, rest) = line.split_once(' ').ok_or_else(malformed)?;

        if op == REMOVE {
            state.entries.remove(rest);
            state.access_order.retain(|k| k != rest);
            return Ok(());
        }

        let (key, tail) = match rest.split_once(' ') {
            Some((key, tail)) => (key, Some(tail)),
            None => (rest, None),
        };
        let value_count = self.value_count;
        let entry = state
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(value_count));

        match (op, tail) {
            (CLEAN, Some(lengths)) => {
                let parsed: std::result::Result<Vec<u64>, _> =
                    lengths.split(' ').map(str::parse).collect();
                let parsed = parsed.map_err(|_| malformed())?;
                if parsed.len() != value_count {
                    return Err(malformed());
                }
                entry.readable = true;
                entry.current_editor = None;
                entry.lengths = parsed;
            }
            (DIRTY, None) => {
                entry.current_editor = Some(REPLAY_EDITOR_ID);
            }
            (READ, None) => {}
            _ => return Err(malformed()),
        }
        touch(&mut state.access_order, key);
        Ok(())
    }

    /// Computes the initial size and discards entries the journal left
    /// mid-edit: their DIRTY line has no matching CLEAN, so their files are
    /// garbage from a crashed writer.
    fn process_journal(&self, state: &mut CacheState) -> Result<()> {
        let _ = fs::remove_file(&self.journal_file_tmp);
        let mut size = 0u64;
        let mut leftovers = Vec::new();
        for (key, entry) in &state.entries {
            if entry.current_editor.is_none() {
                size += entry.lengths.iter().sum::<u64>();
            } else {
                leftovers.push(key.clone());
            }
        }
        for key in leftovers {
            debug!(key, "discarding value left mid-edit by a crash");
            for index in 0..self.value_count {
                let _ = fs::remove_file(self.clean_file(&key, index));
                let _ = fs::remove_file(self.dirty_file(&key, index));
            }
            state.entries.remove(&key);
            state.access_order.retain(|k| k != &key);
        }
        state.size = size;
        Ok(())
    }

    fn new_journal_writer(&self) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new().append(true).open(&self.journal_file)?;
        Ok(BufWriter::new(file))
    }

    /// Writes a compact journal reflecting the in-memory index, then swaps
    /// it into place through the backup file so a crash at any point leaves
    /// a readable journal behind.
    fn rebuild_journal(&self, state: &mut CacheState) -> Result<()> {
        state.journal_writer = None;

        let mut writer = BufWriter::new(File::create(&self.journal_file_tmp)?);
        writeln!(writer, "{MAGIC}")?;
        writeln!(writer, "{VERSION}")?;
        writeln!(writer, "{}", self.app_version)?;
        writeln!(writer, "{}", self.value_count)?;
        writeln!(writer)?;
        for key in &state.access_order {
            let Some(entry) = state.entries.get(key) else {
                continue;
            };
            if entry.current_editor.is_some() {
                writeln!(writer, "{DIRTY} {key}")?;
            } else {
                let lengths = entry
                    .lengths
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                writeln!(writer, "{CLEAN} {key} {lengths}")?;
            }
        }
        writer.flush()?;
        drop(writer);

        if self.journal_file.exists() {
            fs::rename(&self.journal_file, &self.journal_file_backup)?;
        }
        fs::rename(&self.journal_file_tmp, &self.journal_file)?;
        let _ = fs::remove_file(&self.journal_file_backup);

        state.journal_writer = Some(self.new_journal_writer()?);
        state.has_journal_errors = false;
        Ok(())
    }

    /// Appends one op line. Journal write failures never propagate; they
    /// flag the writer so future edits are refused until a rebuild.
    fn journal_line(&self, state: &mut CacheState, line: &str) {
        let Some(writer) = state.journal_writer.as_mut() else {
            return;
        };
        let outcome = writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(error) = outcome {
            warn!(error = %error, "journal append failed");
            state.has_journal_errors = true;
        }
    }

    /// Removes an entry's files and index record, detaching any editor.
    fn remove_entry_locked(&self, state: &mut CacheState, key: &str) -> bool {
        if !state.entries.contains_key(key) {
            return false;
        }
        self.detach_editor_locked(state, key);
        let lengths = state
            .entries
            .get(key)
            .map(|entry| entry.lengths.clone())
            .unwrap_or_default();
        for (index, length) in lengths.iter().enumerate() {
            let _ = fs::remove_file(self.clean_file(key, index));
            state.size = state.size.saturating_sub(*length);
        }
        state.redundant_op_count += 1;
        self.journal_line(state, &format!("{REMOVE} {key}"));
        state.entries.remove(key);
        state.access_order.retain(|k| k != key);
        if journal_rebuild_required(state) {
            self.schedule_cleanup();
        }
        true
    }

    /// Severs an in-flight editor from its entry and deletes its dirty
    /// files. The editor's eventual commit or abort becomes a no-op.
    fn detach_editor_locked(&self, state: &mut CacheState, key: &str) {
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if entry.current_editor.take().is_none() {
            return;
        }
        for index in 0..self.value_count {
            let _ = fs::remove_file(self.dirty_file(key, index));
        }
    }

    fn trim_to_size(&self, state: &mut CacheState) -> Result<()> {
        while state.size > state.max_size {
            let Some(victim) = state
                .access_order
                .iter()
                .find(|key| {
                    state
                        .entries
                        .get(*key)
                        .is_some_and(|entry| entry.current_editor.is_none())
                })
                .cloned()
            else {
                break;
            };
            debug!(key = %victim, "evicting least recently used entry");
            self.remove_entry_locked(state, &victim);
        }
        Ok(())
    }

    fn cleanup(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if !state.initialized || state.closed {
            return;
        }
        match self.trim_to_size(&mut state) {
            Ok(()) => state.most_recent_trim_failed = false,
            Err(error) => {
                warn!(error = %error, "cache trim failed");
                state.most_recent_trim_failed = true;
            }
        }
        if journal_rebuild_required(&state) {
            match self.rebuild_journal(&mut state) {
                Ok(()) => {
                    state.redundant_op_count = 0;
                    state.most_recent_rebuild_failed = false;
                }
                Err(error) => {
                    warn!(error = %error, "journal rebuild failed");
                    state.most_recent_rebuild_failed = true;
                    state.journal_writer = None;
                }
            }
        }
    }
}

fn check_not_closed(state: &CacheState) -> Result<()> {
    if state.closed {
        Err(Error::CacheClosed)
    } else {
        Ok(())
    }
}

fn check_slot_index(index: usize, value_count: usize) -> Result<()> {
    if index < value_count {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("slot index {index} out of range for {value_count} values"),
        )
        .into())
    }
}

fn journal_rebuild_required(state: &CacheState) -> bool {
    state.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
        && state.redundant_op_count >= state.entries.len()
}

fn touch(access_order: &mut Vec<String>, key: &str) {
    access_order.retain(|k| k != key);
    access_order.push(key.to_owned());
}

/// Reads one newline-terminated line; a missing terminator means the file
/// was cut short and is treated as corruption.
fn read_full_line(reader: &mut BufReader<File>) -> io::Result<String> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 || !line.ends_with('\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated journal header",
        ));
    }
    line.truncate(line.trim_end_matches(['\n', '\r']).len());
    Ok(line)
}

/// The committed value of one entry at one point in time. Streams were
/// opened under the cache lock, so later edits or evictions cannot affect
/// what this snapshot reads.
pub struct Snapshot {
    cache: DiskCache,
    key: String,
    sequence_number: i64,
    files: Vec<Option<File>>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn length(&self, index: usize) -> u64 {
        self.lengths.get(index).copied().unwrap_or(0)
    }

    /// Takes the open stream for slot `index`. Each slot can be taken once.
    pub fn take_reader(&mut self, index: usize) -> Option<File> {
        self.files.get_mut(index).and_then(Option::take)
    }

    /// Opens an edit against exactly the value this snapshot saw, or
    /// `None` when the entry changed or vanished since.
    pub fn edit(&self) -> Result<Option<Editor>> {
        self.cache.edit_at(&self.key, self.sequence_number)
    }
}

/// An exclusive in-flight edit. Dropping an editor without committing
/// aborts it.
pub struct Editor {
    cache: DiskCache,
    key: String,
    id: u64,
    written: Vec<bool>,
    done: bool,
}

impl Editor {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// A writer for slot `index`, writing to a staging file that only
    /// becomes visible on commit. A detached editor gets a writer that
    /// discards everything.
    pub fn new_sink(&mut self, index: usize) -> Result<Box<dyn Write + Send>> {
        check_slot_index(index, self.written.len())?;
        let attached = {
            let state = lock_unpoisoned(&self.cache.shared.state);
            state
                .entries
                .get(&self.key)
                .is_some_and(|entry| entry.current_editor == Some(self.id))
        };
        if !attached {
            return Ok(Box::new(io::sink()));
        }
        self.written[index] = true;
        let file = File::create(self.cache.shared.dirty_file(&self.key, index))?;
        Ok(Box::new(file))
    }

    /// The previously committed stream for slot `index`, for edits that
    /// only rewrite some slots. `None` for never-published entries.
    pub fn new_source(&self, index: usize) -> Result<Option<File>> {
        check_slot_index(index, self.cache.shared.value_count)?;
        let readable = {
            let state = lock_unpoisoned(&self.cache.shared.state);
            state
                .entries
                .get(&self.key)
                .is_some_and(|entry| entry.readable && entry.current_editor == Some(self.id))
        };
        if !readable {
            return Ok(None);
        }
        match File::open(self.cache.shared.clean_file(&self.key, index)) {
            Ok(file) => Ok(Some(file)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Atomically publishes the written slots. A first publish must have
    /// written every slot.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.cache
            .complete_edit(&self.key, self.id, &self.written, true)
    }

    /// Discards the edit and its staging files.
    pub fn abort(mut self) {
        self.done = true;
        if let Err(error) = self
            .cache
            .complete_edit(&self.key, self.id, &self.written, false)
        {
            debug!(key = %self.key, error = %error, "edit abort failed");
        }
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            let _ = self
                .cache
                .complete_edit(&self.key, self.id, &self.written, false);
        }
    }
}
