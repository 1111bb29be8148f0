// master/src/state.rs

use common::{JobId, JobInfo};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<Mutex<HashMap<JobId, JobRecord>>>,
    // raíz del object store en disco
    pub data_dir: PathBuf,
    // cuánto tarda un job "running" en pasar a "done"
    pub settle: Duration,
}

impl AppState {
    pub fn new(data_dir: PathBuf, settle: Duration) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            data_dir,
            settle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub info: JobInfo,
    // momento en que se cerró la entrada
    pub ended_at: Option<SystemTime>,
}

impl JobRecord {
    pub fn new(info: JobInfo) -> Self {
        Self {
            info,
            ended_at: None,
        }
    }
}
