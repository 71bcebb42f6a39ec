//! Durable job records and the job repository.
//!
//! [`FileJobStore`] writes one pretty-printed JSON record per job to
//! `<root>/<state_dir>/jobs/<id>.json`. Writes go to a temporary sibling and
//! are renamed into place, so a crash mid-write leaves the previous record
//! intact. Saving is last-write-wins.
//!
//! [`JobRepository`] is the seam the engine talks to. The in-memory
//! implementation serves tests; [`PersistentJobRepository`] keeps the same
//! map and mirrors every `put` to disk before returning.
//!
//! ```text
//!  engine ──get/put/list──▶ PersistentJobRepository
//!                              │ memory map
//!                              └─▶ FileJobStore ──▶ <root>/.stepwise/jobs/<id>.json
//! ```

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::models::Job;

// ═══════════════════════════════════════════════════════════════════════
// File store
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct FileJobStore {
    state_dir: String,
}

impl FileJobStore {
    pub fn new(state_dir: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn jobs_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.state_dir).join("jobs")
    }

    fn record_path(&self, root: &Path, id: &str) -> Option<PathBuf> {
        valid_job_id(id).then(|| self.jobs_dir(root).join(format!("{}.json", id)))
    }

    /// Persist `job` under its own workspace root.
    pub fn save(&self, job: &Job) -> Result<()> {
        let root = Path::new(&job.workspace_root);
        let path = self
            .record_path(root, &job.id)
            .with_context(|| format!("Invalid job id: {:?}", job.id))?;
        let dir = self.jobs_dir(root);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create jobs dir: {}", dir.display()))?;

        let json = serde_json::to_string_pretty(job)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move job record into {}", path.display()))?;

        debug!(job = %job.id, state = %job.state, "job saved");
        Ok(())
    }

    /// Load a job record. Missing and corrupt records both yield `None`.
    pub fn load(&self, root: &Path, id: &str) -> Option<Job> {
        let path = self.record_path(root, id)?;
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&text) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt job record ignored");
                None
            }
        }
    }

    /// Every parseable job record under `root`, oldest first.
    pub fn list(&self, root: &Path) -> Vec<Job> {
        let Ok(entries) = fs::read_dir(self.jobs_dir(root)) else {
            return Vec::new();
        };

        let mut jobs: Vec<Job> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                let id = name.strip_suffix(".json")?;
                self.load(root, id)
            })
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }
}

/// Job ids become file names, so only a conservative alphabet is accepted.
pub fn valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ═══════════════════════════════════════════════════════════════════════
// Repository
// ═══════════════════════════════════════════════════════════════════════

/// Storage seam for job records.
pub trait JobRepository: Send + Sync {
    fn get(&self, id: &str) -> Option<Job>;

    /// Insert or replace. Durable implementations persist before returning.
    fn put(&self, job: &Job) -> Result<()>;

    /// All known jobs, oldest first.
    fn list(&self) -> Vec<Job>;

    /// Forget the in-memory entry. Durable records are left in place.
    fn remove(&self, id: &str) -> Option<Job>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<String, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobRepository for InMemoryJobRepository {
    fn get(&self, id: &str) -> Option<Job> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(id).cloned()
    }

    fn put(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn list(&self) -> Vec<Job> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    fn remove(&self, id: &str) -> Option<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.remove(id)
    }
}

/// In-memory map mirrored synchronously to a [`FileJobStore`].
#[derive(Debug)]
pub struct PersistentJobRepository {
    memory: InMemoryJobRepository,
    store: FileJobStore,
}

impl PersistentJobRepository {
    pub fn new(store: FileJobStore) -> Self {
        Self {
            memory: InMemoryJobRepository::new(),
            store,
        }
    }

    pub fn store(&self) -> &FileJobStore {
        &self.store
    }

    /// Load a record from disk into memory.
    pub fn recover(&self, root: &Path, id: &str) -> Result<Option<Job>> {
        let Some(job) = self.store.load(root, id) else {
            return Ok(None);
        };
        self.memory.put(&job)?;
        Ok(Some(job))
    }
}

impl JobRepository for PersistentJobRepository {
    fn get(&self, id: &str) -> Option<Job> {
        self.memory.get(id)
    }

    fn put(&self, job: &Job) -> Result<()> {
        // Disk first: memory never holds a state that failed to persist.
        self.store.save(job)?;
        self.memory.put(job)
    }

    fn list(&self) -> Vec<Job> {
        self.memory.list()
    }

    fn remove(&self, id: &str) -> Option<Job> {
        self.memory.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobState, PatchHunk, Step, StepStatus, TestResult};
    use tempfile::TempDir;

    fn sample_job(root: &Path, id: &str) -> Job {
        let mut job = Job::new(id, root.to_string_lossy(), "mock", "m", "Add a feature");
        let mut step = Step::new("s1", "First");
        step.status = StepStatus::Tested;
        step.patches = Some(vec![PatchHunk::whole_file("a.txt", "A").with_explanation("x")]);
        step.test_result = Some(TestResult {
            passed: false,
            output: "boom".into(),
        });
        job.steps.push(step);
        job.steps.push(Step::new("s2", "Second"));
        job.state = JobState::AwaitingApproval;
        job.waiting_step_id = Some("s2".into());
        job
    }

    #[test]
    fn test_save_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = FileJobStore::new(".stepwise");
        let job = sample_job(tmp.path(), "job-1");

        store.save(&job).unwrap();
        let loaded = store.load(tmp.path(), "job-1").unwrap();
        assert_eq!(loaded, job);
        assert!(tmp.path().join(".stepwise/jobs/job-1.json").exists());
        assert!(!tmp.path().join(".stepwise/jobs/job-1.json.tmp").exists());
    }

    #[test]
    fn test_save_overwrites() {
        let tmp = TempDir::new().unwrap();
        let store = FileJobStore::new(".stepwise");
        let mut job = sample_job(tmp.path(), "job-1");
        store.save(&job).unwrap();
        job.state = JobState::Done;
        job.waiting_step_id = None;
        store.save(&job).unwrap();
        assert_eq!(store.load(tmp.path(), "job-1").unwrap().state, JobState::Done);
    }

    #[test]
    fn test_missing_and_corrupt_are_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileJobStore::new(".stepwise");
        assert!(store.load(tmp.path(), "nope").is_none());

        fs::create_dir_all(store.jobs_dir(tmp.path())).unwrap();
        fs::write(store.jobs_dir(tmp.path()).join("bad.json"), "{not json").unwrap();
        assert!(store.load(tmp.path(), "bad").is_none());
    }

    #[test]
    fn test_traversal_ids_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = FileJobStore::new(".stepwise");
        assert!(store.load(tmp.path(), "../../etc/passwd").is_none());
        assert!(!valid_job_id("a/b"));
        assert!(!valid_job_id(""));
        assert!(valid_job_id("3f1c-aa_9"));
    }

    #[test]
    fn test_list_skips_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = FileJobStore::new(".stepwise");
        store.save(&sample_job(tmp.path(), "a")).unwrap();
        store.save(&sample_job(tmp.path(), "b")).unwrap();
        fs::write(store.jobs_dir(tmp.path()).join("c.json"), "garbage").unwrap();

        let ids: Vec<String> = store.list(tmp.path()).into_iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
    }

    #[test]
    fn test_persistent_repository_mirrors_and_recovers() {
        let tmp = TempDir::new().unwrap();
        let repo = PersistentJobRepository::new(FileJobStore::new(".stepwise"));
        let job = sample_job(tmp.path(), "job-9");
        repo.put(&job).unwrap();
        assert_eq!(repo.get("job-9").unwrap(), job);

        // A fresh repository (engine restart) only knows the disk record.
        let restarted = PersistentJobRepository::new(FileJobStore::new(".stepwise"));
        assert!(restarted.get("job-9").is_none());
        let recovered = restarted.recover(tmp.path(), "job-9").unwrap().unwrap();
        assert_eq!(recovered, job);
        assert_eq!(restarted.list().len(), 1);

        restarted.remove("job-9");
        assert!(restarted.get("job-9").is_none());
        assert!(restarted.store().load(tmp.path(), "job-9").is_some());
    }

    #[test]
    fn test_in_memory_repository() {
        let repo = InMemoryJobRepository::new();
        let job = Job::new("x", "/tmp", "mock", "m", "goal text");
        repo.put(&job).unwrap();
        assert_eq!(repo.list().len(), 1);
        assert_eq!(repo.remove("x").unwrap().id, "x");
        assert!(repo.get("x").is_none());
    }
}
