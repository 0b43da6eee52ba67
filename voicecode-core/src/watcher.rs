//! Transcript discovery and tailing (§4.2). Watches `transcript_root`
//! recursively for `.jsonl` files named by session UUID, indexes them,
//! and pushes incremental, filtered message batches to a [`ReplicationSink`].

use std::collections::HashMap;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;
use voicecode_protocol::session::MessageRecord;

use crate::session_index::canonicalize_session_id;
use crate::session_index::SessionIndex;
use crate::session_index::SessionMetadata;
use crate::session_index::UNRESOLVED_WORKING_DIRECTORY;

const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

/// Callbacks the watcher drives as it discovers and tails transcripts.
/// Implemented by the dispatch layer; kept as a trait so tests can supply
/// a recording fake instead of a live connection table (§9 "Dynamic
/// redefinition... abstract as injectable capabilities").
pub trait ReplicationSink: Send + Sync {
    fn on_session_created(&self, metadata: SessionMetadata);
    fn on_session_updated(&self, session_id: &str, messages: Vec<MessageRecord>);
}

/// Mapping from absolute transcript path to the byte offset already
/// parsed (§3 "FilePosition"). Every operation is a quick in-memory
/// mutation, so a blocking `std` lock is never held across an `.await`.
#[derive(Clone, Default)]
pub struct FilePositionTable {
    inner: Arc<Mutex<HashMap<PathBuf, u64>>>,
}

impl FilePositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, u64>> {
        self.inner.lock().expect("file position table lock poisoned")
    }

    pub fn get(&self, path: &Path) -> u64 {
        self.lock().get(path).copied().unwrap_or(0)
    }

    pub fn set(&self, path: &Path, offset: u64) {
        self.lock().insert(path.to_path_buf(), offset);
    }

    pub fn reset(&self, path: &Path) {
        self.lock().remove(path);
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub transcript_root: PathBuf,
    pub debounce: Duration,
}

/// True if `stem` matches the canonical UUID shape (case-insensitive).
fn is_session_file(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    canonicalize_session_id(stem)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

/// Recursively collect `.jsonl` paths under `root` whose stem is a
/// canonical UUID, skipping hidden directories (§4.2 "Hidden-directory
/// policy").
fn scan_transcript_tree(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !root.is_dir() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(root)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if is_hidden(&path) {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            found.extend(scan_transcript_tree(&path)?);
        } else if file_type.is_file() && is_session_file(&path).is_some() {
            found.push(path);
        }
    }
    Ok(found)
}

fn message_is_internal(record: &MessageRecord) -> bool {
    record.is_internal()
}

pub(crate) fn parse_transcript_lines(contents: &str) -> Vec<MessageRecord> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<MessageRecord>(line).ok())
        .filter(|record| !message_is_internal(record))
        .collect()
}

/// Read the file from `offset` to EOF, retrying transient I/O errors up to
/// [`MAX_RETRIES`] times (§4.2 "Retry"). Returns the bytes read and the
/// byte length of any trailing partial line, which is excluded from the
/// advance so the next event picks it back up complete (§5 "Shared-resource
/// policy").
fn read_new_bytes(path: &Path, offset: u64) -> std::io::Result<(String, u64)> {
    let mut last_err = None;
    for attempt in 0..MAX_RETRIES {
        match try_read_new_bytes(path, offset) {
            Ok(result) => return Ok(result),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                last_err = Some(e);
                std::thread::sleep(RETRY_BACKOFF * (attempt + 1));
            }
            Err(e) => return Err(e),
        }
    }
    #[allow(clippy::expect_used)]
    Err(last_err.expect("loop always assigns before exhausting retries"))
}

fn try_read_new_bytes(path: &Path, offset: u64) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let consumed = match buf.iter().rposition(|&b| b == b'\n') {
        Some(last_newline) => last_newline + 1,
        None => 0,
    };
    let text = String::from_utf8_lossy(&buf[..consumed]).into_owned();
    Ok((text, offset + consumed as u64))
}

/// One-shot read of every visible message in a transcript file, used to
/// replay full history on `subscribe` (§4.2 "Resubscription").
pub fn read_full_history(path: &Path) -> std::io::Result<Vec<MessageRecord>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(parse_transcript_lines(&contents))
}

pub struct TranscriptWatcher {
    config: WatcherConfig,
    session_index: SessionIndex,
    positions: FilePositionTable,
    sink: Arc<dyn ReplicationSink>,
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl TranscriptWatcher {
    pub fn new(
        config: WatcherConfig,
        session_index: SessionIndex,
        positions: FilePositionTable,
        sink: Arc<dyn ReplicationSink>,
    ) -> crate::error::Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;

        Ok(Self {
            config,
            session_index,
            positions,
            sink,
            watcher,
            raw_rx,
        })
    }

    /// Scan `transcript_root` once, populating the session index and
    /// setting each discovered file's position to its current size so the
    /// first subsequent modify event only surfaces genuinely new content
    /// (§4.2 "File-creation semantics" applies equally to the initial
    /// population).
    pub fn initial_index(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config.transcript_root)?;
        let paths = scan_transcript_tree(&self.config.transcript_root)?;
        for path in paths {
            self.index_one_file(&path, false);
        }
        Ok(())
    }

    fn index_one_file(&self, path: &Path, emit_created: bool) {
        let Some(session_id) = is_session_file(path) else {
            return;
        };
        let metadata_fs = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to stat transcript");
                return;
            }
        };
        let size = metadata_fs.len();
        self.positions.set(path, size);

        let contents = std::fs::read_to_string(path).unwrap_or_default();
        let visible = parse_transcript_lines(&contents);
        let created_at = metadata_fs
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let mut metadata = SessionMetadata::new(session_id.clone(), path.to_path_buf(), created_at);
        metadata.message_count = visible.len() as u64;
        metadata.preview = visible.last().and_then(|m| m.text.clone());
        metadata.last_modified = metadata_fs
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(created_at);

        self.session_index.insert(metadata.clone());
        if emit_created {
            self.sink.on_session_created(metadata);
        }
    }

    /// Reset the file position for `session_id`'s transcript, then advance
    /// it straight back to the file's current size (§4.2 "Resubscription"):
    /// the caller is responsible for delivering full history separately.
    pub fn resubscribe(&self, session_id: &str) -> crate::error::Result<()> {
        let Some(metadata) = self.session_index.get(session_id) else {
            return Err(crate::error::CoreErr::Protocol(format!(
                "unknown session: {session_id}"
            )));
        };
        self.positions.reset(&metadata.file_path);
        let size = std::fs::metadata(&metadata.file_path)?.len();
        self.positions.set(&metadata.file_path, size);
        Ok(())
    }

    pub async fn run(mut self) {
        if let Err(e) = self
            .watcher
            .watch(&self.config.transcript_root, RecursiveMode::Recursive)
        {
            warn!(error = %e, "failed to start watching transcript root");
            return;
        }

        let debounce = self.config.debounce;
        let mut pending: HashMap<String, tokio::time::Instant> = HashMap::new();
        let mut pending_paths: HashMap<String, PathBuf> = HashMap::new();

        loop {
            let next_deadline = pending.values().copied().min();

            tokio::select! {
                biased;

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = tokio::time::Instant::now();
                    let ready: Vec<String> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for session_id in ready {
                        pending.remove(&session_id);
                        if let Some(path) = pending_paths.remove(&session_id) {
                            self.process_modify(&session_id, &path);
                        }
                    }
                }

                event = self.raw_rx.recv() => {
                    match event {
                        Some(Ok(ev)) => {
                            self.handle_raw_event(&ev, &mut pending, &mut pending_paths, debounce);
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "transcript watcher error");
                        }
                        None => {
                            debug!("transcript watcher channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_raw_event(
        &self,
        event: &Event,
        pending: &mut HashMap<String, tokio::time::Instant>,
        pending_paths: &mut HashMap<String, PathBuf>,
        debounce: Duration,
    ) {
        for path in &event.paths {
            match event.kind {
                EventKind::Create(notify::event::CreateKind::Folder) => {
                    if is_hidden(path) {
                        continue;
                    }
                    if let Ok(found) = scan_transcript_tree(path) {
                        for file in found {
                            if let Some(session_id) = is_session_file(&file) {
                                if self.session_index.get(&session_id).is_none() {
                                    self.index_one_file(&file, true);
                                }
                            }
                        }
                    }
                }
                EventKind::Create(_) => {
                    if let Some(session_id) = is_session_file(path) {
                        if self.session_index.get(&session_id).is_none() {
                            self.index_one_file(path, true);
                        }
                    }
                }
                EventKind::Modify(_) => {
                    if let Some(session_id) = is_session_file(path) {
                        pending_paths.insert(session_id.clone(), path.clone());
                        pending.insert(session_id, tokio::time::Instant::now() + debounce);
                    }
                }
                _ => {}
            }
        }
    }

    fn process_modify(&self, session_id: &str, path: &Path) {
        let offset = self.positions.get(path);
        let (contents, new_offset) = match read_new_bytes(path, offset) {
            Ok(result) => result,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to tail transcript");
                return;
            }
        };

        let visible = parse_transcript_lines(&contents);
        self.positions.set(path, new_offset);

        if visible.is_empty() {
            return;
        }

        let added = visible.len() as u64;
        self.session_index.mutate(session_id, |metadata| {
            metadata.message_count += added;
            metadata.preview = visible.last().and_then(|m| m.text.clone());
        });

        self.sink.on_session_updated(session_id, visible);
    }
}
