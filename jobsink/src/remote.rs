use async_trait::async_trait;
use common::{JobDescriptor, JobId, JobInfo, JobKey, ObjectEntry};

use crate::error::RemoteError;

/// Cliente del servicio remoto de cómputo y almacenamiento.
///
/// Todas las llamadas son asíncronas; `close` libera la conexión y se invoca
/// una sola vez, cuando el job llega a estado terminal.
#[async_trait]
pub trait JobService: Send + Sync {
    async fn create_job(&self, job: &JobDescriptor) -> Result<JobId, RemoteError>;

    async fn add_job_key(&self, job_id: &JobId, key: &JobKey) -> Result<(), RemoteError>;

    async fn end_job_input(&self, job_id: &JobId) -> Result<(), RemoteError>;

    async fn get_job_status(&self, job_id: &JobId) -> Result<JobInfo, RemoteError>;

    async fn put_object(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError>;

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, RemoteError>;

    fn close(&self);
}
