use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use sha2::{Digest, Sha384};
use tokio_util::sync::CancellationToken;

use crate::frontend::Frontend;
use crate::queue::{JudgeJob, JudgeQueue};
use crate::routes::{JudgeRequest, TaskInfo};

const PATHS_FILE: &str = "task_info_path.json";
const CHECKSUM_CHUNK: usize = 16 * 1024;

/// Currency checks are memoized so bursts of submissions for one task do
/// not hammer the frontend checksum endpoint.
const MEMO_TTL: Duration = Duration::from_secs(20);
const MEMO_CAPACITY: usize = 64;

struct CacheState {
    /// task_id -> installed snapshot. Owned exclusively by this coordinator;
    /// workers only ever see immutable paths handed out through the queue.
    paths: HashMap<String, PathBuf>,
    /// Submissions parked until their task's snapshot is current. A key
    /// present here means a refresh is already scheduled or in flight.
    waiting: HashMap<String, VecDeque<JudgeRequest>>,
    /// Tasks awaiting the update worker, oldest first.
    refresh: VecDeque<String>,
}

/// Content-addressed task snapshot store with single-flight refresh.
pub struct TaskCache {
    cache_dir: PathBuf,
    paths_file: PathBuf,
    state: Mutex<CacheState>,
    memo: Mutex<HashMap<(String, PathBuf), (bool, Instant)>>,
}

impl TaskCache {
    /// Loads the persisted path mapping and garbage-collects the cache
    /// directory: entries whose file vanished are dropped, files nothing
    /// references are deleted. Referenced snapshots are never touched.
    pub fn init(cache_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("failed to create cache dir {}", cache_dir.display()))?;

        let paths_file = match cache_dir.parent() {
            Some(parent) => parent.join(PATHS_FILE),
            None => PathBuf::from(PATHS_FILE),
        };

        let mut paths: HashMap<String, PathBuf> = if paths_file.exists() {
            let file = fs::File::open(&paths_file)?;
            serde_json::from_reader(std::io::BufReader::new(file))
                .with_context(|| format!("corrupt {}", paths_file.display()))?
        } else {
            HashMap::new()
        };

        let before = paths.len();
        paths.retain(|_, path| path.exists());
        if paths.len() < before {
            log::info!("dropped {} stale task info entries", before - paths.len());
        }

        for entry in fs::read_dir(cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !paths.values().any(|kept| *kept == path) {
                log::info!("removing unreferenced snapshot {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            paths_file,
            state: Mutex::new(CacheState {
                paths,
                waiting: HashMap::new(),
                refresh: VecDeque::new(),
            }),
            memo: Mutex::new(HashMap::new()),
        })
    }

    /// Persists the path mapping for the next startup.
    pub fn shutdown(&self) -> Result<()> {
        let paths = self.state.lock().paths.clone();
        let file = fs::File::create(&self.paths_file)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &paths)?;
        Ok(())
    }

    pub fn current_path(&self, task_id: &str) -> Option<PathBuf> {
        self.state.lock().paths.get(task_id).cloned()
    }

    /// Installs a validated snapshot. Replaced paths stay on disk until the
    /// next startup sweep so running judges can finish reading them.
    pub fn install(&self, task_id: &str, path: PathBuf) {
        self.state.lock().paths.insert(task_id.to_string(), path);
    }

    /// Parks a submission until its task snapshot is current. Schedules a
    /// refresh only when none is pending for the task (single-flight).
    /// Returns whether a refresh was newly scheduled.
    pub fn park(&self, request: JudgeRequest) -> bool {
        let task_id = request.task_info.task_id.clone();
        let mut state = self.state.lock();
        let newly_scheduled = !state.waiting.contains_key(&task_id);
        state.waiting.entry(task_id.clone()).or_default().push_back(request);
        if newly_scheduled {
            state.refresh.push_back(task_id);
        }
        newly_scheduled
    }

    fn pop_refresh(&self) -> Option<String> {
        self.state.lock().refresh.pop_front()
    }

    fn reschedule(&self, task_id: String) {
        self.state.lock().refresh.push_back(task_id);
    }

    /// Releases every submission parked on `task_id` into the judge queue,
    /// paired with the freshly installed snapshot.
    pub fn release_waiting(&self, task_id: &str, path: &Path, queue: &JudgeQueue) {
        let mut state = self.state.lock();
        let Some(mut parked) = state.waiting.remove(task_id) else {
            log::warn!("no waiting queue for task {task_id}");
            return;
        };
        log::debug!("releasing {} submissions for task {task_id}", parked.len());
        while let Some(request) = parked.pop_front() {
            queue.push(JudgeJob {
                request,
                task_info_path: path.to_path_buf(),
            });
        }
    }

    /// True iff the local snapshot's checksum matches the one the frontend
    /// advertises. Absent snapshot means stale. Memoized per (task, path).
    pub async fn is_up_to_date(
        &self,
        frontend: &Frontend,
        task_id: &str,
        path: Option<PathBuf>,
    ) -> Result<bool> {
        let path = match path.or_else(|| self.current_path(task_id)) {
            Some(path) => path,
            None => return Ok(false),
        };

        let memo_key = (task_id.to_string(), path.clone());
        if let Some(fresh) = self.memo_get(&memo_key) {
            return Ok(fresh);
        }

        let checksum_path = path.clone();
        let local = tokio::task::spawn_blocking(move || compute_checksum(&checksum_path))
            .await
            .context("checksum task aborted")??;
        let remote = frontend.task_checksum(task_id).await?;
        let fresh = local == remote;

        self.memo_put(memo_key, fresh);
        Ok(fresh)
    }

    fn memo_get(&self, key: &(String, PathBuf)) -> Option<bool> {
        let memo = self.memo.lock();
        memo.get(key)
            .filter(|(_, at)| at.elapsed() < MEMO_TTL)
            .map(|(fresh, _)| *fresh)
    }

    fn memo_put(&self, key: (String, PathBuf), fresh: bool) {
        let mut memo = self.memo.lock();
        memo.retain(|_, (_, at)| at.elapsed() < MEMO_TTL);
        if memo.len() >= MEMO_CAPACITY {
            if let Some(oldest) = memo
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(key, _)| key.clone())
            {
                memo.remove(&oldest);
            }
        }
        memo.insert(key, (fresh, Instant::now()));
    }

    /// Downloads a fresh snapshot under a random name, validates its
    /// checksum against the frontend, and installs it. A mismatched
    /// download is deleted, never installed.
    async fn refresh(&self, frontend: &Frontend, task_id: &str) -> Result<PathBuf> {
        let filename = format!("{}_{}.json", task_id, hex::encode(rand::random::<[u8; 6]>()));
        let path = self.cache_dir.join(filename);

        frontend.download_task_info(task_id, &path).await?;

        let valid = self.is_up_to_date(frontend, task_id, Some(path.clone())).await?;
        if !valid {
            let _ = fs::remove_file(&path);
            bail!("task info checksum mismatch for task {task_id}");
        }

        self.install(task_id, path.clone());
        Ok(path)
    }

    /// The dedicated update worker: drains the refresh queue one task at a
    /// time, releasing parked submissions after each successful install.
    pub async fn update_worker(
        self: Arc<Self>,
        frontend: Frontend,
        queue: Arc<JudgeQueue>,
        token: CancellationToken,
    ) {
        log::info!("task info update worker initialized");
        loop {
            let Some(task_id) = self.pop_refresh() else {
                if token.is_cancelled() {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            match self.refresh(&frontend, &task_id).await {
                Ok(path) => {
                    log::info!("installed snapshot for task {task_id} at {}", path.display());
                    self.release_waiting(&task_id, &path, &queue);
                }
                Err(e) if token.is_cancelled() => {
                    log::error!("dropping refresh for task {task_id} during shutdown: {e:#}");
                }
                Err(e) => {
                    log::error!("refresh for task {task_id} failed, rescheduling: {e:#}");
                    self.reschedule(task_id);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        log::info!("task info update worker has shut down");
    }
}

/// SHA-384 over the snapshot bytes, streamed in 16 KiB chunks.
pub fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open {} for checksum", path.display()))?;
    let mut hasher = Sha384::new();
    let mut buffer = [0u8; CHECKSUM_CHUNK];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Reads the metadata header of an installed snapshot. The reader is
/// buffered so large snapshots stream through instead of being slurped.
pub fn load_task_info(path: &Path) -> Result<TaskInfo> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open snapshot {}", path.display()))?;
    let info = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("malformed snapshot {}", path.display()))?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::Language;
    use crate::routes::Submission;
    use pretty_assertions::assert_eq;

    fn request(task_id: &str, submission_id: i64) -> JudgeRequest {
        JudgeRequest {
            task_info: TaskInfo {
                task_id: task_id.to_string(),
                time_limit: 1.0,
                memory_limit: 256,
                grader: false,
                grader_source_code: None,
                grader_language: None,
            },
            submission: Submission {
                id: submission_id,
                language: Language::Cpp,
                source_code: String::new(),
                in_ongoing_contest: false,
            },
        }
    }

    #[test]
    fn checksum_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, "hello world\n").unwrap();
        assert_eq!(
            compute_checksum(&path).unwrap(),
            "6b3b69ff0a404f28d75e98a066d3fc64fffd9940870cc68bece28545b9a75086b343d7a1366838083e4b8f3ca6fd3c80"
        );
    }

    #[test]
    fn sweep_drops_dead_entries_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("task_info_cache");
        fs::create_dir_all(&cache_dir).unwrap();

        let kept = cache_dir.join("alive_abc123.json");
        fs::write(&kept, "{}").unwrap();
        let orphan = cache_dir.join("orphan_ffffff.json");
        fs::write(&orphan, "{}").unwrap();

        let mapping = serde_json::json!({
            "alive": kept,
            "dead": cache_dir.join("dead_000000.json"),
        });
        fs::write(
            dir.path().join("task_info_path.json"),
            serde_json::to_vec(&mapping).unwrap(),
        )
        .unwrap();

        let cache = TaskCache::init(&cache_dir).unwrap();
        assert_eq!(cache.current_path("alive"), Some(kept.clone()));
        assert_eq!(cache.current_path("dead"), None);
        assert!(kept.exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn park_is_single_flight_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TaskCache::init(&dir.path().join("task_info_cache")).unwrap();

        assert!(cache.park(request("sum", 1)));
        assert!(!cache.park(request("sum", 2)));
        assert!(cache.park(request("gcd", 3)));

        assert_eq!(cache.pop_refresh(), Some("sum".to_string()));
        assert_eq!(cache.pop_refresh(), Some("gcd".to_string()));
        assert_eq!(cache.pop_refresh(), None);
    }

    #[test]
    fn release_waiting_preserves_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TaskCache::init(&dir.path().join("task_info_cache")).unwrap();
        let queue = JudgeQueue::new();

        cache.park(request("sum", 1));
        cache.park(request("sum", 2));

        let snapshot = dir.path().join("task_info_cache").join("sum_aaaaaa.json");
        cache.release_waiting("sum", &snapshot, &queue);

        assert_eq!(queue.len(), 2);
        let first = futures_now(queue.pop());
        assert_eq!(first.request.submission.id, 1);
        assert_eq!(first.task_info_path, snapshot);
        assert_eq!(futures_now(queue.pop()).request.submission.id, 2);

        // waiting entry is gone; the next submission schedules a new refresh
        assert!(cache.park(request("sum", 4)));
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("task_info_cache");
        let snapshot = {
            let cache = TaskCache::init(&cache_dir).unwrap();
            let snapshot = cache_dir.join("sum_bbbbbb.json");
            fs::write(&snapshot, "{}").unwrap();
            cache.install("sum", snapshot.clone());
            cache.shutdown().unwrap();
            snapshot
        };

        let reloaded = TaskCache::init(&cache_dir).unwrap();
        assert_eq!(reloaded.current_path("sum"), Some(snapshot));
    }

    #[test]
    fn snapshot_metadata_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sum_cccccc.json");
        fs::write(
            &path,
            serde_json::json!({
                "task_id": "sum",
                "time_limit": 2.5,
                "memory_limit": 128,
                "grader": true,
                "grader_source_code": "print('AC')",
                "grader_language": "py"
            })
            .to_string(),
        )
        .unwrap();

        let info = load_task_info(&path).unwrap();
        assert_eq!(info.task_id, "sum");
        assert_eq!(info.time_limit, 2.5);
        assert!(info.grader);
        assert_eq!(info.grader_language, Some(Language::Py));
    }

    /// Resolves a future that is known to complete without waiting.
    fn futures_now<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }
}
