//! Servicio remoto en memoria para los tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{JobDescriptor, JobId, JobInfo, JobKey, JobState, ObjectEntry};
use tokio::sync::Semaphore;

use crate::error::{PrepareError, RemoteError};
use crate::gate::{PackagePreparer, PackageSpec, PreparedAsset};
use crate::remote::JobService;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateJob(JobDescriptor),
    AddKey(String),
    EndInput,
    Status,
    Put(String),
    List(String),
}

/// Registra todas las llamadas y deja controlar latencias y fallos.
pub struct FakeJobService {
    calls: Mutex<Vec<Call>>,
    objects: Mutex<Vec<(String, Vec<u8>)>>,
    listing: Mutex<Vec<ObjectEntry>>,
    descriptor: Mutex<Option<JobDescriptor>>,
    key_delays: Mutex<HashMap<String, Duration>>,
    failing_keys: Mutex<HashSet<String>>,
    fail_create: Mutex<bool>,
    fail_end: Mutex<bool>,
    create_delay: Mutex<Duration>,
    /// Consultas de estado que devuelven `running` antes de `done`
    polls_before_done: AtomicUsize,
    /// Consultas de estado que fallan antes de responder
    poll_errors: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeJobService {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            objects: Mutex::new(Vec::new()),
            listing: Mutex::new(Vec::new()),
            descriptor: Mutex::new(None),
            key_delays: Mutex::new(HashMap::new()),
            failing_keys: Mutex::new(HashSet::new()),
            fail_create: Mutex::new(false),
            fail_end: Mutex::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            polls_before_done: AtomicUsize::new(0),
            poll_errors: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    pub fn delay_key(&self, key: &str, delay: Duration) {
        self.key_delays.lock().unwrap().insert(key.to_string(), delay);
    }

    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_create(&self) {
        *self.fail_create.lock().unwrap() = true;
    }

    pub fn fail_end(&self) {
        *self.fail_end.lock().unwrap() = true;
    }

    pub fn delay_create(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn running_polls(&self, n: usize) {
        self.polls_before_done.store(n, Ordering::SeqCst);
    }

    pub fn failing_polls(&self, n: usize) {
        self.poll_errors.store(n, Ordering::SeqCst);
    }

    pub fn set_listing(&self, entries: Vec<ObjectEntry>) {
        *self.listing.lock().unwrap() = entries;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, Call::CreateJob(_)))
    }

    pub fn added_keys(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::AddKey(k) => Some(k.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn ends(&self) -> usize {
        self.count(|c| matches!(c, Call::EndInput))
    }

    pub fn polls(&self) -> usize {
        self.count(|c| matches!(c, Call::Status))
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn objects(&self) -> Vec<(String, Vec<u8>)> {
        self.objects.lock().unwrap().clone()
    }

    pub fn descriptor(&self) -> Option<JobDescriptor> {
        self.descriptor.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl JobService for FakeJobService {
    async fn create_job(&self, job: &JobDescriptor) -> Result<JobId, RemoteError> {
        self.record(Call::CreateJob(job.clone()));
        let delay = *self.create_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if *self.fail_create.lock().unwrap() {
            return Err(RemoteError::Unavailable("create refused".to_string()));
        }
        *self.descriptor.lock().unwrap() = Some(job.clone());
        Ok("job-1".to_string())
    }

    async fn add_job_key(&self, _job_id: &JobId, key: &JobKey) -> Result<(), RemoteError> {
        let delay = self.key_delays.lock().unwrap().get(key.as_str()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(Call::AddKey(key.to_string()));
        if self.failing_keys.lock().unwrap().contains(key.as_str()) {
            return Err(RemoteError::Status {
                status: 500,
                body: "key refused".to_string(),
            });
        }
        Ok(())
    }

    async fn end_job_input(&self, _job_id: &JobId) -> Result<(), RemoteError> {
        self.record(Call::EndInput);
        if *self.fail_end.lock().unwrap() {
            return Err(RemoteError::Unavailable("end refused".to_string()));
        }
        Ok(())
    }

    async fn get_job_status(&self, job_id: &JobId) -> Result<JobInfo, RemoteError> {
        self.record(Call::Status);

        let errors = self.poll_errors.load(Ordering::SeqCst);
        if errors > 0 {
            self.poll_errors.store(errors - 1, Ordering::SeqCst);
            return Err(RemoteError::Unavailable("status flake".to_string()));
        }

        let descriptor = self.descriptor().unwrap_or(JobDescriptor {
            name: "unknown".to_string(),
            phases: vec![],
        });
        let mut info = JobInfo::queued(job_id.clone(), descriptor);
        info.keys = self.added_keys().len() as u64;
        info.input_done = self.ends() > 0;

        let running = self.polls_before_done.load(Ordering::SeqCst);
        if running > 0 {
            self.polls_before_done.store(running - 1, Ordering::SeqCst);
            info.state = JobState::Running;
        } else {
            info.state = JobState::Done;
        }
        Ok(info)
    }

    async fn put_object(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError> {
        self.record(Call::Put(path.to_string()));
        self.objects.lock().unwrap().push((path.to_string(), body));
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, RemoteError> {
        self.record(Call::List(prefix.to_string()));
        Ok(self.listing.lock().unwrap().clone())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Preparador que espera a que el test libere permisos antes de terminar.
pub struct GatedPreparer {
    release: Semaphore,
    fail: Mutex<HashSet<String>>,
    started: AtomicUsize,
}

impl GatedPreparer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            release: Semaphore::new(0),
            fail: Mutex::new(HashSet::new()),
            started: AtomicUsize::new(0),
        })
    }

    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }

    pub fn fail(&self, name: &str) {
        self.fail.lock().unwrap().insert(name.to_string());
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackagePreparer for GatedPreparer {
    fn target(&self, package: &PackageSpec) -> PreparedAsset {
        PreparedAsset {
            remote_path: format!("/assets/{}-{}.tgz", package.name, package.version),
            init: format!("tar xzf {}-{}.tgz", package.name, package.version),
        }
    }

    async fn prepare(
        &self,
        package: &PackageSpec,
        _target: &PreparedAsset,
    ) -> Result<(), PrepareError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|_| PrepareError::Remote(RemoteError::Closed))?;
        permit.forget();

        if self.fail.lock().unwrap().contains(&package.name) {
            return Err(PrepareError::Remote(RemoteError::Unavailable(
                "bundle failed".to_string(),
            )));
        }
        Ok(())
    }
}
