use forkbatch_core::{
    validate_queue_name, FailedJob, Job, Queue, QueueError, QueueStats, Result,
};
use chrono::{TimeZone, Utc};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUEUES_DIR: &str = "queues";
const RESERVED_DIR: &str = "reserved";
const FAILED_DIR: &str = "failed";
const WORKING_DIR: &str = "working";
const STATS_DIR: &str = "stats";
const TMP_DIR: &str = "tmp";
const PROCESSED_FILE: &str = "processed";

/// Last push stamp handed out by this process, in nanoseconds
static LAST_PUSH_NANOS: AtomicI64 = AtomicI64::new(0);

/// Spool directory layout:
///
/// ```text
/// <root>/queues/<queue>/<seq>-<id>.json   pending jobs, FIFO by file name
/// <root>/reserved/<seq>-<id>.json         reserved, not yet completed/failed
/// <root>/failed/<seq>-<id>.json           failure records
/// <root>/working/<worker>.json            job each worker has in progress
/// <root>/stats/processed                  one line per processed execution
/// ```
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    root: PathBuf,
}

impl SpoolQueue {
    /// Open or create a spool at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [QUEUES_DIR, RESERVED_DIR, FAILED_DIR, WORKING_DIR, STATS_DIR, TMP_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }

        info!("Opened job spool at {:?}", root);
        Ok(SpoolQueue { root })
    }

    /// Spool root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of all queues that have ever received a job, sorted
    pub fn queues(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join(QUEUES_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Pending jobs of `queue` in reservation order
    pub fn pending(&self, queue: &str) -> Result<Vec<Job>> {
        validate_queue_name(queue)?;
        let dir = self.queue_dir(queue);
        let mut jobs = Vec::new();
        for name in list_records(&dir)? {
            match read_record::<Job>(&dir.join(&name)) {
                Ok(job) => jobs.push(job),
                // Reserved by someone else between listing and reading
                Err(QueueError::IoError(e)) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    /// Failure records, oldest job first
    pub fn failed_jobs(&self) -> Result<Vec<FailedJob>> {
        let dir = self.root.join(FAILED_DIR);
        list_records(&dir)?
            .iter()
            .map(|name| read_record(&dir.join(name)))
            .collect()
    }

    /// In-progress job of every worker, sorted by worker id
    pub fn working_all(&self) -> Result<Vec<(String, Job)>> {
        let dir = self.root.join(WORKING_DIR);
        let mut working = Vec::new();
        for name in list_records(&dir)? {
            let worker = name.trim_end_matches(".json").to_string();
            match read_record::<Job>(&dir.join(&name)) {
                Ok(job) => working.push((worker, job)),
                Err(QueueError::IoError(e)) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(working)
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root.join(QUEUES_DIR).join(queue)
    }

    fn reserved_path(&self, job: &Job) -> PathBuf {
        self.root.join(RESERVED_DIR).join(record_name(job))
    }

    fn working_path(&self, worker_id: &str) -> PathBuf {
        self.root
            .join(WORKING_DIR)
            .join(format!("{}.json", sanitize_worker_id(worker_id)))
    }

    /// Write `bytes` to `dest` so that readers never see a partial file
    fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = self.root.join(TMP_DIR).join(Uuid::new_v4().to_string());
        fs::write(&tmp, bytes)?;
        if let Err(e) = fs::rename(&tmp, dest) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Queue for SpoolQueue {
    fn push(&self, mut job: Job) -> Result<()> {
        validate_queue_name(&job.queue)?;
        job.enqueued_at = Utc.timestamp_nanos(next_push_nanos());
        let dir = self.queue_dir(&job.queue);
        fs::create_dir_all(&dir)?;

        self.write_atomic(&dir.join(record_name(&job)), &job.to_bytes()?)?;
        debug!("Enqueued {}", job.describe());
        Ok(())
    }

    fn reserve(&self, queue: &str) -> Result<Option<Job>> {
        validate_queue_name(queue)?;
        let dir = self.queue_dir(queue);

        for name in list_records(&dir)? {
            let reserved = self.root.join(RESERVED_DIR).join(&name);
            match fs::rename(dir.join(&name), &reserved) {
                Ok(()) => {
                    let job: Job = read_record(&reserved)?;
                    debug!("Reserved {}", job.describe());
                    return Ok(Some(job));
                }
                // Another process won the race for this record
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    fn mark_in_progress(&self, worker_id: &str, job: &Job) -> Result<()> {
        self.write_atomic(&self.working_path(worker_id), &job.to_bytes()?)
    }

    fn mark_processed(&self, worker_id: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(STATS_DIR).join(PROCESSED_FILE))?;
        file.write_all(format!("{}\n", sanitize_worker_id(worker_id)).as_bytes())?;
        Ok(())
    }

    fn complete(&self, worker_id: &str, job: &Job) -> Result<()> {
        remove_if_exists(&self.reserved_path(job))?;
        remove_if_exists(&self.working_path(worker_id))?;
        Ok(())
    }

    fn fail(&self, worker_id: &str, job: &Job, error: &str) -> Result<()> {
        let record = FailedJob::new(job.clone(), error, worker_id);
        let dest = self.root.join(FAILED_DIR).join(record_name(job));
        self.write_atomic(&dest, &serde_json::to_vec(&record)?)?;

        remove_if_exists(&self.reserved_path(job))?;
        remove_if_exists(&self.working_path(worker_id))?;
        warn!("Recorded failure of {}: {}", job.describe(), error);
        Ok(())
    }

    fn release(&self, worker_id: &str, job: &Job) -> Result<()> {
        validate_queue_name(&job.queue)?;
        let dir = self.queue_dir(&job.queue);
        fs::create_dir_all(&dir)?;

        // The record keeps its name, so it sorts ahead of later pushes
        match fs::rename(self.reserved_path(job), dir.join(record_name(job))) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.write_atomic(&dir.join(record_name(job)), &job.to_bytes()?)?;
            }
            Err(e) => return Err(e.into()),
        }

        remove_if_exists(&self.working_path(worker_id))?;
        debug!("Released {}", job.describe());
        Ok(())
    }

    fn working(&self, worker_id: &str) -> Result<Option<Job>> {
        match read_record(&self.working_path(worker_id)) {
            Ok(job) => Ok(Some(job)),
            Err(QueueError::IoError(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn size(&self, queue: &str) -> Result<usize> {
        validate_queue_name(queue)?;
        Ok(list_records(&self.queue_dir(queue))?.len())
    }

    fn stats(&self) -> Result<QueueStats> {
        let mut pending = 0;
        for queue in self.queues()? {
            pending += list_records(&self.queue_dir(&queue))?.len();
        }

        let processed = match fs::read(self.root.join(STATS_DIR).join(PROCESSED_FILE)) {
            Ok(bytes) => bytes.iter().filter(|b| **b == b'\n').count() as u64,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(QueueStats {
            pending,
            reserved: list_records(&self.root.join(RESERVED_DIR))?.len(),
            processed,
            failed: list_records(&self.root.join(FAILED_DIR))?.len(),
            working: list_records(&self.root.join(WORKING_DIR))?.len(),
        })
    }
}

/// Push time for a new record: wall clock, but strictly increasing within
/// this process so that same-tick pushes keep their order.
fn next_push_nanos() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0);
    let mut last = LAST_PUSH_NANOS.load(Ordering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_PUSH_NANOS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

/// File name of a job record. Lexical order equals push order.
fn record_name(job: &Job) -> String {
    let nanos = job.enqueued_at.timestamp_nanos_opt().unwrap_or(0).max(0);
    format!("{:020}-{}.json", nanos, job.id)
}

fn sanitize_worker_id(worker_id: &str) -> String {
    worker_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

/// Sorted `.json` file names in `dir`; a missing directory is empty
fn list_records(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".json") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| QueueError::CorruptRecord {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
