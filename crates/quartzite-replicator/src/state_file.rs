//! The on-disk saved state (`grastate.dat`).
//!
//! Persists the last known position `(uuid, seqno)` plus the
//! safe-to-bootstrap flag across restarts. The recovered pair seeds the
//! initial position; an external state id with a matching uuid and a
//! defined seqno overrides it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use quartzite_types::{GlobalSeqno, GroupId, Gtid};

use crate::error::{Error, Result};

/// File name inside `base_dir`.
pub const STATE_FILE_NAME: &str = "grastate.dat";

const FORMAT_VERSION: &str = "2.1";

/// The persisted state, flushed on every change of position or safety.
#[derive(Debug)]
pub struct SavedState {
    path: PathBuf,
    inner: Mutex<StateData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateData {
    group: GroupId,
    seqno: GlobalSeqno,
    safe_to_bootstrap: bool,
    corrupt: bool,
}

impl SavedState {
    /// Opens (or initializes) the state file under `base_dir`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(STATE_FILE_NAME);
        let data = match fs::read_to_string(&path) {
            Ok(text) => parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateData {
                group: GroupId::NIL,
                seqno: GlobalSeqno::UNDEFINED,
                safe_to_bootstrap: true,
                corrupt: false,
            },
            Err(e) => return Err(Error::Io(e)),
        };
        info!(
            path = %path.display(),
            uuid = %data.group,
            seqno = %data.seqno,
            "recovered saved state"
        );
        Ok(Self {
            path,
            inner: Mutex::new(data),
        })
    }

    /// Recovered position.
    pub fn position(&self) -> Gtid {
        let inner = self.inner.lock();
        Gtid::new(inner.group, inner.seqno)
    }

    pub fn safe_to_bootstrap(&self) -> bool {
        self.inner.lock().safe_to_bootstrap
    }

    pub fn corrupt(&self) -> bool {
        self.inner.lock().corrupt
    }

    /// Updates and flushes the persisted position.
    pub fn set(&self, group: GroupId, seqno: GlobalSeqno, safe_to_bootstrap: bool) {
        let mut inner = self.inner.lock();
        inner.group = group;
        inner.seqno = seqno;
        inner.safe_to_bootstrap = safe_to_bootstrap;
        if let Err(e) = write_file(&self.path, &inner) {
            warn!(path = %self.path.display(), error = %e, "failed to flush saved state");
        }
    }

    /// Marks the on-disk state as unusable for recovery (apply in flight or
    /// inconsistency detected).
    pub fn mark_unsafe(&self) {
        let mut inner = self.inner.lock();
        let prev = inner.seqno;
        inner.seqno = GlobalSeqno::UNDEFINED;
        if let Err(e) = write_file(&self.path, &inner) {
            warn!(path = %self.path.display(), error = %e, "failed to flush saved state");
        }
        inner.seqno = prev;
    }

    pub fn mark_corrupt(&self) {
        let mut inner = self.inner.lock();
        inner.corrupt = true;
        inner.seqno = GlobalSeqno::UNDEFINED;
        if let Err(e) = write_file(&self.path, &inner) {
            warn!(path = %self.path.display(), error = %e, "failed to flush saved state");
        }
    }
}

fn write_file(path: &Path, data: &StateData) -> Result<()> {
    let mut text = String::new();
    text.push_str("# Quartzite saved state\n");
    text.push_str(&format!("version: {FORMAT_VERSION}\n"));
    text.push_str(&format!("uuid:    {}\n", data.group));
    text.push_str(&format!("seqno:   {}\n", data.seqno));
    text.push_str(&format!(
        "safe_to_bootstrap: {}\n",
        i32::from(data.safe_to_bootstrap)
    ));

    // write-then-rename so a crash never leaves a torn state file
    let tmp = path.with_extension("dat.tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(text.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn parse(text: &str) -> Result<StateData> {
    let mut group = GroupId::NIL;
    let mut seqno = GlobalSeqno::UNDEFINED;
    let mut safe_to_bootstrap = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "uuid" => {
                group = value
                    .parse::<Uuid>()
                    .map(GroupId::new)
                    .map_err(|_| Error::StateFile(format!("bad uuid '{value}'")))?;
            }
            "seqno" => {
                seqno = value
                    .parse::<i64>()
                    .map(GlobalSeqno::new)
                    .map_err(|_| Error::StateFile(format!("bad seqno '{value}'")))?;
            }
            "safe_to_bootstrap" => {
                safe_to_bootstrap = value == "1";
            }
            "version" => {}
            other => {
                warn!(key = other, "unknown key in saved state file");
            }
        }
    }

    Ok(StateData {
        group,
        seqno,
        safe_to_bootstrap,
        corrupt: false,
    })
}
