//! Append-only trace store
//!
//! Layout under `<state_dir>/trace/runs/`:
//! - `<runId>.jsonl`: one [`TraceRunEvent`] per line, appended immediately
//! - `<runId>.meta.json`: [`TraceRunMeta`] rollup, rewritten by the flusher
//!
//! Metadata is updated in memory on every append and marked dirty; a
//! background flusher coalesces writes over a short window. Appends to one
//! run are serialized end to end, so line order always matches seq order.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cp_protocol::methods::{
    TraceRunEvent, TraceRunGetResult, TraceRunMeta, TraceRunStatus, TRACE_EVENTS_DEFAULT_LIMIT,
    TRACE_EVENTS_MAX_LIMIT, TRACE_RUNS_DEFAULT_LIMIT, TRACE_RUNS_MAX_LIMIT,
};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TraceError;

pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(200);

const STREAM_LIFECYCLE: &str = "lifecycle";
const STREAM_TOOL: &str = "tool";

/// Replace anything outside `[A-Za-z0-9._-]` so ids are safe as file names
pub fn sanitize_run_id(run_id: &str) -> String {
    let trimmed = run_id.trim();
    if trimmed.is_empty() {
        return "run".to_string();
    }
    let sanitized: String = trimmed
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    // "." and ".." are valid characters but not valid file stems.
    if sanitized.chars().all(|ch| ch == '.') {
        return sanitized.replace('.', "_");
    }
    sanitized
}

#[derive(Debug)]
struct MetaState {
    meta: TraceRunMeta,
    dirty: bool,
}

struct TraceInner {
    runs_dir: PathBuf,
    metas: Mutex<HashMap<String, MetaState>>,
    /// Held across the rollup update and the line write of one append
    run_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    flush_requested: Notify,
}

#[derive(Clone)]
pub struct TraceStore {
    inner: Arc<TraceInner>,
}

/// Stops the background flusher after a final flush
pub struct FlusherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FlusherHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!("Trace flusher ended abnormally: {}", err);
        }
    }
}

impl TraceStore {
    pub async fn new(state_dir: &Path) -> Result<Self, TraceError> {
        let runs_dir = state_dir.join("trace").join("runs");
        fs::create_dir_all(&runs_dir).await?;
        Ok(Self {
            inner: Arc::new(TraceInner {
                runs_dir,
                metas: Mutex::new(HashMap::new()),
                run_locks: Mutex::new(HashMap::new()),
                flush_requested: Notify::new(),
            }),
        })
    }

    pub fn runs_dir(&self) -> &Path {
        &self.inner.runs_dir
    }

    fn events_path(&self, run_id: &str) -> PathBuf {
        self.inner.runs_dir.join(format!("{}.jsonl", run_id))
    }

    fn meta_path(&self, run_id: &str) -> PathBuf {
        self.inner.runs_dir.join(format!("{}.meta.json", run_id))
    }

    /// Spawn the debounced metadata flusher
    pub fn spawn_flusher(&self, delay: Duration) -> FlusherHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let store = self.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = store.inner.flush_requested.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
                store.flush_all().await;
            }
            store.flush_all().await;
            debug!("Trace flusher stopped");
        });

        FlusherHandle { shutdown, task }
    }

    /// Record one event: rollup first, then the durable line append
    pub async fn append(&self, mut event: TraceRunEvent) -> Result<TraceRunMeta, TraceError> {
        if event.run_id.trim().is_empty() {
            return Err(TraceError::InvalidInput("runId cannot be empty".to_string()));
        }
        event.run_id = sanitize_run_id(&event.run_id);

        let run_lock = self.run_lock(&event.run_id).await;
        let _appending = run_lock.lock().await;
        let meta = {
            let mut metas = self.inner.metas.lock().await;
            let state = self.meta_state(&mut metas, &event.run_id, event.ts).await;
            apply_event(&mut state.meta, &event);
            state.dirty = true;
            state.meta.clone()
        };
        self.inner.flush_requested.notify_one();

        self.append_line(&event).await?;
        Ok(meta)
    }

    /// Append a gateway-originated event (e.g. an approval) with the next seq
    pub async fn append_system(
        &self,
        run_id: &str,
        stream: &str,
        data: Value,
        session_key: Option<String>,
        ts: u64,
    ) -> Result<TraceRunMeta, TraceError> {
        if run_id.trim().is_empty() {
            return Err(TraceError::InvalidInput("runId cannot be empty".to_string()));
        }
        let run_id = sanitize_run_id(run_id);

        let run_lock = self.run_lock(&run_id).await;
        let _appending = run_lock.lock().await;
        let (event, meta) = {
            let mut metas = self.inner.metas.lock().await;
            let state = self.meta_state(&mut metas, &run_id, ts).await;
            let event = TraceRunEvent {
                run_id: run_id.clone(),
                source_run_id: None,
                client_run_id: None,
                session_key,
                seq: state.meta.event_count.saturating_add(1),
                stream: stream.to_string(),
                ts,
                data,
            };
            apply_event(&mut state.meta, &event);
            state.dirty = true;
            (event, state.meta.clone())
        };
        self.inner.flush_requested.notify_one();

        self.append_line(&event).await?;
        Ok(meta)
    }

    async fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.run_locks.lock().await;
        Arc::clone(locks.entry(run_id.to_string()).or_default())
    }

    async fn append_line(&self, event: &TraceRunEvent) -> Result<(), TraceError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(&event.run_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Cached rollup, seeded from disk the first time a run is seen
    async fn meta_state<'a>(
        &self,
        metas: &'a mut HashMap<String, MetaState>,
        run_id: &str,
        ts: u64,
    ) -> &'a mut MetaState {
        let persisted = if metas.contains_key(run_id) {
            None
        } else {
            self.read_meta(run_id).await
        };
        metas.entry(run_id.to_string()).or_insert_with(|| MetaState {
            meta: persisted.unwrap_or_else(|| TraceRunMeta {
                run_id: run_id.to_string(),
                created_at_ms: ts,
                last_event_at_ms: ts,
                ..Default::default()
            }),
            dirty: true,
        })
    }

    async fn read_meta(&self, run_id: &str) -> Option<TraceRunMeta> {
        let path = self.meta_path(run_id);
        let raw = fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str::<TraceRunMeta>(&raw) {
            Ok(meta) if !meta.run_id.is_empty() => Some(meta),
            Ok(_) => None,
            Err(err) => {
                warn!("Ignoring malformed trace meta {}: {}", path.display(), err);
                None
            }
        }
    }

    /// Write every dirty rollup to disk
    pub async fn flush_all(&self) {
        let dirty: Vec<TraceRunMeta> = {
            let mut metas = self.inner.metas.lock().await;
            metas
                .values_mut()
                .filter(|state| state.dirty)
                .map(|state| {
                    state.dirty = false;
                    state.meta.clone()
                })
                .collect()
        };

        for meta in dirty {
            if let Err(err) = self.write_meta(&meta).await {
                warn!(run_id = %meta.run_id, "Failed to flush trace meta: {}", err);
                if let Some(state) = self.inner.metas.lock().await.get_mut(&meta.run_id) {
                    state.dirty = true;
                }
            }
        }
    }

    async fn write_meta(&self, meta: &TraceRunMeta) -> Result<(), TraceError> {
        let content = serde_json::to_string_pretty(meta)?;
        let path = self.meta_path(&meta.run_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Runs, most recently active first
    pub async fn list_runs(&self, limit: Option<u64>) -> Result<Vec<TraceRunMeta>, TraceError> {
        let limit = clamp_limit(limit, TRACE_RUNS_DEFAULT_LIMIT, TRACE_RUNS_MAX_LIMIT);
        let mut runs: HashMap<String, TraceRunMeta> = HashMap::new();

        let mut entries = fs::read_dir(&self.inner.runs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(run_id) = name.to_str().and_then(|name| name.strip_suffix(".meta.json")) else {
                continue;
            };
            if let Some(meta) = self.read_meta(run_id).await {
                runs.insert(meta.run_id.clone(), meta);
            }
        }

        // Unflushed rollups are newer than what is on disk.
        for state in self.inner.metas.lock().await.values() {
            runs.insert(state.meta.run_id.clone(), state.meta.clone());
        }

        let mut runs: Vec<_> = runs.into_values().collect();
        runs.sort_by(|left, right| {
            right
                .last_event_at_ms
                .cmp(&left.last_event_at_ms)
                .then_with(|| left.run_id.cmp(&right.run_id))
        });
        runs.truncate(limit);
        Ok(runs)
    }

    /// The most recent `limit` events of a run, plus whether older ones exist
    pub async fn get_run_events(&self, run_id: &str, limit: Option<u64>) -> Result<TraceRunGetResult, TraceError> {
        let run_id = sanitize_run_id(run_id);
        let limit = clamp_limit(limit, TRACE_EVENTS_DEFAULT_LIMIT, TRACE_EVENTS_MAX_LIMIT);

        let cached = self
            .inner
            .metas
            .lock()
            .await
            .get(&run_id)
            .map(|state| state.meta.clone());
        let meta = match cached {
            Some(meta) => Some(meta),
            None => self.read_meta(&run_id).await,
        };

        let path = self.events_path(&run_id);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TraceRunGetResult {
                    meta,
                    events: Vec::new(),
                    truncated: false,
                })
            }
            Err(err) => return Err(err.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut window: VecDeque<String> = VecDeque::with_capacity(limit.min(1024));
        let mut truncated = false;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if window.len() == limit {
                window.pop_front();
                truncated = true;
            }
            window.push_back(line);
        }

        let events = window
            .iter()
            .filter_map(|line| match serde_json::from_str::<TraceRunEvent>(line) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!("Skipping malformed trace line in {}: {}", path.display(), err);
                    None
                }
            })
            .collect();

        Ok(TraceRunGetResult {
            meta,
            events,
            truncated,
        })
    }
}

fn clamp_limit(limit: Option<u64>, default: u64, max: u64) -> usize {
    let limit = limit.unwrap_or(default).clamp(1, max);
    usize::try_from(limit).unwrap_or(usize::MAX)
}

fn data_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn data_u64(data: &Value, key: &str) -> Option<u64> {
    data.get(key).and_then(Value::as_u64)
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => !text.is_empty(),
        Some(_) => true,
    }
}

fn apply_event(meta: &mut TraceRunMeta, event: &TraceRunEvent) {
    meta.last_event_at_ms = event.ts;
    meta.event_count = meta.event_count.saturating_add(1);
    *meta.streams.entry(event.stream.clone()).or_insert(0) += 1;
    if meta.session_key.is_none() {
        meta.session_key = event.session_key.clone();
    }

    match event.stream.as_str() {
        STREAM_LIFECYCLE => match data_str(&event.data, "phase") {
            Some("start") => {
                let started_at = data_u64(&event.data, "startedAt").unwrap_or(event.ts);
                meta.started_at_ms = Some(meta.started_at_ms.unwrap_or(started_at));
                meta.ended_at_ms = None;
                meta.status = TraceRunStatus::Running;
            }
            Some(phase @ ("end" | "error")) => {
                meta.ended_at_ms = Some(data_u64(&event.data, "endedAt").unwrap_or(event.ts));
                meta.status = TraceRunStatus::Ended;
                if phase == "error" {
                    meta.error = data_str(&event.data, "error").map(str::to_string);
                }
            }
            _ => {}
        },
        STREAM_TOOL => match data_str(&event.data, "phase") {
            Some("start") => meta.tool_calls = meta.tool_calls.saturating_add(1),
            Some("result") if is_truthy(event.data.get("isError")) => {
                meta.tool_errors = meta.tool_errors.saturating_add(1)
            }
            _ => {}
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn event(run_id: &str, seq: u64, stream: &str, ts: u64, data: Value) -> TraceRunEvent {
        TraceRunEvent {
            run_id: run_id.to_string(),
            source_run_id: None,
            client_run_id: None,
            session_key: Some("main".to_string()),
            seq,
            stream: stream.to_string(),
            ts,
            data,
        }
    }

    #[test]
    fn sanitizes_path_traversal() {
        assert_eq!(sanitize_run_id("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_run_id(".."), "__");
        assert_eq!(sanitize_run_id("   "), "run");
        assert_eq!(sanitize_run_id("run-1.a_b"), "run-1.a_b");
    }

    #[tokio::test]
    async fn tool_and_lifecycle_counters() {
        let temp_dir = TempDir::new().unwrap();
        let store = TraceStore::new(temp_dir.path()).await.unwrap();

        store
            .append(event("r1", 1, "lifecycle", 10, json!({ "phase": "start" })))
            .await
            .unwrap();
        store
            .append(event("r1", 2, "tool", 11, json!({ "phase": "start", "name": "bash" })))
            .await
            .unwrap();
        store
            .append(event("r1", 3, "tool", 12, json!({ "phase": "result", "isError": false })))
            .await
            .unwrap();
        let meta = store
            .append(event("r1", 4, "tool", 13, json!({ "phase": "start", "name": "read" })))
            .await
            .unwrap();
        assert_eq!(meta.tool_calls, 2);
        assert_eq!(meta.tool_errors, 0);
        assert_eq!(meta.status, TraceRunStatus::Running);
        assert_eq!(meta.started_at_ms, Some(10));

        let meta = store
            .append(event("r1", 5, "lifecycle", 14, json!({ "phase": "end", "endedAt": 99 })))
            .await
            .unwrap();
        assert_eq!(meta.status, TraceRunStatus::Ended);
        assert_eq!(meta.ended_at_ms, Some(99));
        assert_eq!(meta.streams.get("tool"), Some(&3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_lines_in_seq_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = TraceStore::new(temp_dir.path()).await.unwrap();

        let writers: Vec<_> = (0..40)
            .map(|index| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append_system("busy", "approval", json!({ "writer": index }), None, 100 + index)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let run = store.get_run_events("busy", Some(100)).await.unwrap();
        let seqs: Vec<u64> = run.events.iter().map(|event| event.seq).collect();
        assert_eq!(seqs, (1..=40).collect::<Vec<u64>>());
        assert_eq!(run.meta.unwrap().event_count, 40);
    }

    #[tokio::test]
    async fn list_runs_orders_by_last_activity() {
        let temp_dir = TempDir::new().unwrap();
        let runs_dir = temp_dir.path().join("trace").join("runs");
        std::fs::create_dir_all(&runs_dir).unwrap();
        for (run_id, last) in [("A", 100u64), ("B", 200u64)] {
            let meta = TraceRunMeta {
                run_id: run_id.to_string(),
                created_at_ms: 1,
                last_event_at_ms: last,
                ..Default::default()
            };
            std::fs::write(
                runs_dir.join(format!("{}.meta.json", run_id)),
                serde_json::to_string(&meta).unwrap(),
            )
            .unwrap();
        }
        std::fs::write(runs_dir.join("junk.meta.json"), "not json").unwrap();

        let store = TraceStore::new(temp_dir.path()).await.unwrap();
        let runs = store.list_runs(Some(1)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "B");

        let all = store.list_runs(None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn get_run_events_returns_tail_and_truncation_flag() {
        let temp_dir = TempDir::new().unwrap();
        let store = TraceStore::new(temp_dir.path()).await.unwrap();
        for seq in 1..=5 {
            store
                .append(event("r2", seq, "assistant", seq, json!({ "text": seq })))
                .await
                .unwrap();
        }

        let tail = store.get_run_events("r2", Some(2)).await.unwrap();
        assert!(tail.truncated);
        assert_eq!(tail.events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);

        let full = store.get_run_events("r2", None).await.unwrap();
        assert!(!full.truncated);
        assert_eq!(full.events.len(), 5);

        let missing = store.get_run_events("nope", None).await.unwrap();
        assert!(missing.events.is_empty());
        assert!(missing.meta.is_none());
    }

    #[tokio::test]
    async fn flusher_persists_meta_and_restart_keeps_counters() {
        let temp_dir = TempDir::new().unwrap();
        let store = TraceStore::new(temp_dir.path()).await.unwrap();
        let flusher = store.spawn_flusher(Duration::from_millis(10));

        store
            .append(event("r3", 1, "tool", 5, json!({ "phase": "start" })))
            .await
            .unwrap();
        flusher.shutdown().await;
        assert!(store.runs_dir().join("r3.meta.json").exists());

        let restarted = TraceStore::new(temp_dir.path()).await.unwrap();
        let meta = restarted
            .append(event("r3", 2, "tool", 6, json!({ "phase": "start" })))
            .await
            .unwrap();
        assert_eq!(meta.tool_calls, 2);
        assert_eq!(meta.created_at_ms, 5);
    }

    #[tokio::test]
    async fn system_events_take_the_next_seq() {
        let temp_dir = TempDir::new().unwrap();
        let store = TraceStore::new(temp_dir.path()).await.unwrap();
        store
            .append(event("r4", 1, "lifecycle", 1, json!({ "phase": "start" })))
            .await
            .unwrap();
        store
            .append_system("r4", "approval", json!({ "decision": "deny" }), None, 2)
            .await
            .unwrap();

        let events = store.get_run_events("r4", None).await.unwrap().events;
        assert_eq!(events[1].stream, "approval");
        assert_eq!(events[1].seq, 2);
    }
}
