use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use budget_core::SourceCursor;
use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::paths::{SourceRoot, detect_format, is_log_path};
use crate::types::{PartialLine, ReadBatch, Result, SourceHandle, SourceInfo};

pub const DEFAULT_MAX_BATCH_BYTES: u64 = 4 * 1024 * 1024;

/// Append-only, line-oriented usage logs.
pub trait UsageSource: Send + Sync {
    fn list_sources(&self) -> Result<Vec<SourceHandle>>;

    /// Complete lines after `cursor`, bounded in bytes. A trailing line without
    /// a newline is reported in `partial` and not consumed.
    fn read_since(&self, handle: &SourceHandle, cursor: &SourceCursor) -> Result<ReadBatch>;

    fn describe(&self, handle: &SourceHandle) -> Result<SourceInfo>;

    /// Change notifications for `handle`. Spurious wakeups are allowed.
    fn watch(&self, handle: &SourceHandle) -> Result<SourceWatch>;
}

/// Receiving end of a change subscription.
pub struct SourceWatch {
    rx: mpsc::Receiver<()>,
    _keepalive: Option<mpsc::Sender<()>>,
}

impl SourceWatch {
    /// A subscription that never fires; the owner relies on polling.
    pub fn polling() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            rx,
            _keepalive: Some(tx),
        }
    }

    /// A subscription fired by hand through the returned sender.
    pub fn manual() -> (mpsc::Sender<()>, Self) {
        let (tx, rx) = mpsc::channel(1);
        (
            tx.clone(),
            Self {
                rx,
                _keepalive: Some(tx),
            },
        )
    }

    /// Waits for the next change. Returns `false` once the watcher is gone.
    pub async fn changed(&mut self) -> bool {
        let alive = self.rx.recv().await.is_some();
        while self.rx.try_recv().is_ok() {}
        alive
    }
}

type Subscribers = Arc<Mutex<HashMap<PathBuf, Vec<mpsc::Sender<()>>>>>;

/// One filesystem watcher shared by every subscription of a [`FileSource`].
#[derive(Default)]
struct WatchHub {
    watcher: Mutex<Option<RecommendedWatcher>>,
    watched_dirs: Mutex<HashSet<PathBuf>>,
    subscribers: Subscribers,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WatchHub {
    fn subscribe(&self, path: &Path) -> Result<SourceWatch> {
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let dir = key
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut watcher = lock(&self.watcher);
        if watcher.is_none() {
            let subscribers = Arc::clone(&self.subscribers);
            let created =
                notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                    match event {
                        Ok(event) => {
                            let mut subscribers = lock(&subscribers);
                            for path in &event.paths {
                                if let Some(senders) = subscribers.get_mut(path) {
                                    senders.retain(|tx| !tx.is_closed());
                                    for tx in senders.iter() {
                                        let _ = tx.try_send(());
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "file watcher error");
                        }
                    }
                })?;
            *watcher = Some(created);
        }
        let mut watched_dirs = lock(&self.watched_dirs);
        if !watched_dirs.contains(&dir)
            && let Some(watcher) = watcher.as_mut()
        {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            watched_dirs.insert(dir);
        }

        let (tx, rx) = mpsc::channel(1);
        lock(&self.subscribers).entry(key).or_default().push(tx);
        Ok(SourceWatch {
            rx,
            _keepalive: None,
        })
    }
}

/// Usage logs found by walking a set of directories.
#[derive(Clone)]
pub struct FileSource {
    roots: Vec<SourceRoot>,
    max_batch_bytes: u64,
    hub: Arc<WatchHub>,
}

impl FileSource {
    pub fn new(roots: Vec<SourceRoot>) -> Self {
        Self {
            roots,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            hub: Arc::new(WatchHub::default()),
        }
    }

    pub fn with_max_batch_bytes(mut self, max_batch_bytes: u64) -> Self {
        self.max_batch_bytes = max_batch_bytes.max(1);
        self
    }

    pub fn roots(&self) -> &[SourceRoot] {
        &self.roots
    }
}

impl UsageSource for FileSource {
    fn list_sources(&self) -> Result<Vec<SourceHandle>> {
        let mut handles = Vec::new();
        for root in &self.roots {
            if !root.path.exists() {
                tracing::debug!(root = %root.path.display(), "source root missing");
                continue;
            }
            for entry in WalkDir::new(&root.path).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(root = %root.path.display(), error = %err, "skipping unreadable entry");
                        continue;
                    }
                };
                let path = entry.path();
                if !entry.file_type().is_file() || !is_log_path(path) {
                    continue;
                }
                handles.push(SourceHandle {
                    id: path.to_string_lossy().to_string(),
                    path: path.to_path_buf(),
                    format: root.format.unwrap_or_else(|| detect_format(path)),
                });
            }
        }
        handles.sort();
        handles.dedup_by(|a, b| a.id == b.id);
        Ok(handles)
    }

    fn read_since(&self, handle: &SourceHandle, cursor: &SourceCursor) -> Result<ReadBatch> {
        let mut file = File::open(&handle.path)?;
        let metadata = file.metadata()?;
        let file_len = metadata.len();
        let file_id = inode_from_metadata(&metadata);
        let rotated = cursor_is_stale(cursor, file_len, file_id);
        if rotated {
            tracing::info!(
                source = %handle.id,
                previous_offset = cursor.offset,
                file_len,
                "source rotated, reading from start"
            );
        }
        let start = if rotated { 0 } else { cursor.offset };
        let (last_model, last_total) = if rotated {
            (None, None)
        } else {
            (cursor.last_model.clone(), cursor.last_total)
        };
        let mut batch = ReadBatch {
            lines: Vec::new(),
            cursor: SourceCursor {
                offset: start,
                file_id,
                last_model,
                last_total,
            },
            bytes_read: 0,
            rotated,
            more: false,
            partial: None,
        };
        if start >= file_len {
            return Ok(batch);
        }

        file.seek(SeekFrom::Start(start))?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut consumed = 0u64;
        loop {
            if consumed >= self.max_batch_bytes {
                batch.more = start.saturating_add(consumed) < file_len;
                break;
            }
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                batch.partial = Some(PartialLine {
                    text: String::from_utf8_lossy(&buf).into_owned(),
                    len: read as u64,
                });
                break;
            }
            consumed = consumed.saturating_add(read as u64);
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                batch.lines.push(line.to_string());
            }
        }
        batch.bytes_read = consumed;
        batch.cursor.offset = start.saturating_add(consumed);
        Ok(batch)
    }

    fn describe(&self, handle: &SourceHandle) -> Result<SourceInfo> {
        let metadata = fs::metadata(&handle.path)?;
        Ok(SourceInfo {
            len: metadata.len(),
            file_id: inode_from_metadata(&metadata),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    fn watch(&self, handle: &SourceHandle) -> Result<SourceWatch> {
        self.hub.subscribe(&handle.path)
    }
}

/// The file behind the cursor was replaced or truncated.
pub(crate) fn cursor_is_stale(cursor: &SourceCursor, file_len: u64, file_id: Option<u64>) -> bool {
    if cursor.offset > file_len {
        return true;
    }
    matches!((cursor.file_id, file_id), (Some(previous), Some(current)) if previous != current)
}

fn inode_from_metadata(metadata: &fs::Metadata) -> Option<u64> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(metadata.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        None
    }
}
