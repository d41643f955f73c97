//! The persistence gateway. Raft's safety argument depends on `currentTerm`, `votedFor` and the
//! log surviving a crash. Everything a replica must remember is gathered into `PersistentState`,
//! encoded as one opaque blob, and handed to a `PersistentStorage` impl. The byte-level mechanics
//! of getting that blob onto disk are the storage impl's problem, not ours.

use crate::replica::log::{LogEntry, RaftLog};
use crate::replica::peers::ReplicaId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentStorage is where a replica durably records its term/vote/log blob. `save()` must not
/// return `Ok` until the blob would survive a process crash. A replica treats a failed `save()` as
/// grounds to withhold whatever acknowledgement it was about to send.
pub trait PersistentStorage: Send + 'static {
    fn save(&mut self, blob: Bytes) -> io::Result<()>;

    /// Returns `None` when no prior state has ever been saved.
    fn load(&self) -> io::Result<Option<Bytes>>;
}

/// In-memory storage. Survives a simulated restart as long as the same handle (or a clone of it)
/// is given to the restarted replica. Used by tests and by applications that don't care about
/// durability.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    blob: Arc<Mutex<Option<Bytes>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStorage for InMemoryStorage {
    fn save(&mut self, blob: Bytes) -> io::Result<()> {
        self.blob
            .lock()
            .expect("InMemoryStorage mutex guard poison")
            .replace(blob);
        Ok(())
    }

    fn load(&self) -> io::Result<Option<Bytes>> {
        Ok(self
            .blob
            .lock()
            .expect("InMemoryStorage mutex guard poison")
            .clone())
    }
}

/// Whole-file storage: write to a sibling temp file, then rename over the real one so a crash
/// mid-write leaves the previous blob intact.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStorage { path: path.into() }
    }
}

impl PersistentStorage for FileStorage {
    fn save(&mut self, blob: Bytes) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &blob)?;
        fs::rename(&tmp_path, &self.path)
    }

    fn load(&self) -> io::Result<Option<Bytes>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Everything that must survive a crash, bundled for encode/decode.
///
/// Byte representation:
///
/// ```text
/// | Vrs | CurrentTerm (8) | VoteFlag | VotedFor (2 + len, if flag=1) |
/// | NumEntries (8) | { EntryTerm (8) | DataLen (4) | Data (variable) } ... |
/// ```
///
/// The sentinel entry at index 0 is implied and never written. Any blob that can't be decoded in
/// full is treated as absent state; a fresh replica is always a safe (if slow) starting point.
pub(crate) struct PersistentState {
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ReplicaId>,
    pub(crate) log: RaftLog,
}

const PERSISTED_STATE_FORMAT_VERSION: u8 = 1;

impl PersistentState {
    pub(crate) fn fresh() -> Self {
        PersistentState {
            current_term: Term::new(0),
            voted_for: None,
            log: RaftLog::new(),
        }
    }

    pub(crate) fn encode(current_term: Term, voted_for: &Option<ReplicaId>, log: &RaftLog) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);

        buf.put_u8(PERSISTED_STATE_FORMAT_VERSION);
        buf.put_u64(current_term.as_u64());

        match voted_for {
            None => buf.put_u8(0),
            Some(replica_id) => {
                let id_bytes = replica_id.as_str().as_bytes();
                buf.put_u8(1);
                buf.put_u16(id_bytes.len() as u16);
                buf.put_slice(id_bytes);
            }
        }

        let entries = log.entries_after_sentinel();
        buf.put_u64(entries.len() as u64);
        for entry in entries {
            buf.put_u64(entry.term.as_u64());
            buf.put_u32(entry.data.len() as u32);
            buf.put_slice(&entry.data);
        }

        buf.freeze()
    }

    pub(crate) fn decode(mut blob: Bytes) -> Option<Self> {
        if blob.remaining() < 1 + 8 + 1 {
            return None;
        }
        if blob.get_u8() != PERSISTED_STATE_FORMAT_VERSION {
            return None;
        }

        let current_term = Term::new(blob.get_u64());

        let voted_for = match blob.get_u8() {
            0 => None,
            1 => {
                if blob.remaining() < 2 {
                    return None;
                }
                let id_len = blob.get_u16() as usize;
                if blob.remaining() < id_len {
                    return None;
                }
                let raw_id = blob.split_to(id_len);
                let id = String::from_utf8(raw_id.to_vec()).ok()?;
                Some(ReplicaId::new(id))
            }
            _ => return None,
        };

        if blob.remaining() < 8 {
            return None;
        }
        let num_entries = blob.get_u64();

        let mut log = RaftLog::new();
        for _ in 0..num_entries {
            if blob.remaining() < 8 + 4 {
                return None;
            }
            let term = Term::new(blob.get_u64());
            let data_len = blob.get_u32() as usize;
            if blob.remaining() < data_len {
                return None;
            }
            let data = blob.split_to(data_len);
            log.append(LogEntry { term, data });
        }

        if blob.has_remaining() {
            return None;
        }

        Some(PersistentState {
            current_term,
            voted_for,
            log,
        })
    }
}
