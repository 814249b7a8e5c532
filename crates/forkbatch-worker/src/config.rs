use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queues to watch, in reservation priority order
    pub queues: Vec<String>,
    /// Spool directory shared with producers and forked children
    pub spool_dir: PathBuf,
    pub worker_id: Option<String>,
    /// Seconds to sleep when idle or paused; 0 drains the queues and returns
    pub interval_secs: u64,
    /// Run each batch in a forked child process
    pub fork: bool,
    /// Execute up to `JOBS_PER_FORK` jobs per child instead of one
    pub batch: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            queues: vec!["default".to_string()],
            spool_dir: PathBuf::from("./spool"),
            worker_id: None,
            interval_secs: 5,
            fork: true,
            batch: true,
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn generate_worker_id(&self) -> String {
        use std::process;
        use uuid::Uuid;

        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = process::id();
        let random = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &random[..8])
    }
}
