use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{Ack, AddKeyRequest, JobDescriptor, JobId, JobInfo, JobKey, ObjectEntry};
use reqwest::{Client, Response};
use tracing::debug;

use crate::config::HttpServiceConfig;
use crate::error::RemoteError;
use crate::remote::JobService;

/// `JobService` que habla HTTP con el master (`/api/v1/...`).
pub struct HttpJobService {
    client: Client,
    base_url: String,
    closed: AtomicBool,
}

impl HttpJobService {
    pub fn new(config: HttpServiceConfig) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            closed: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> Result<String, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Closed);
        }
        Ok(format!("{}/api/v1{}", self.base_url, path))
    }

    /// Convierte respuestas no-2xx en `RemoteError::Status`.
    async fn check(resp: Response) -> Result<Response, RemoteError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl JobService for HttpJobService {
    async fn create_job(&self, job: &JobDescriptor) -> Result<JobId, RemoteError> {
        let url = self.url("/jobs")?;
        let resp = self.client.post(&url).json(job).send().await?;
        let info: JobInfo = Self::check(resp).await?.json().await?;
        debug!("job {} creado en {}", info.id, self.base_url);
        Ok(info.id)
    }

    async fn add_job_key(&self, job_id: &JobId, key: &JobKey) -> Result<(), RemoteError> {
        let url = self.url(&format!("/jobs/{job_id}/keys"))?;
        let resp = self
            .client
            .post(&url)
            .json(&AddKeyRequest { key: key.clone() })
            .send()
            .await?;
        let _: Ack = Self::check(resp).await?.json().await?;
        Ok(())
    }

    async fn end_job_input(&self, job_id: &JobId) -> Result<(), RemoteError> {
        let url = self.url(&format!("/jobs/{job_id}/end"))?;
        let resp = self.client.post(&url).send().await?;
        let _: Ack = Self::check(resp).await?.json().await?;
        Ok(())
    }

    async fn get_job_status(&self, job_id: &JobId) -> Result<JobInfo, RemoteError> {
        let url = self.url(&format!("/jobs/{job_id}"))?;
        let resp = self.client.get(&url).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn put_object(&self, path: &str, body: Vec<u8>) -> Result<(), RemoteError> {
        let url = self.url(&format!("/objects/{}", path.trim_start_matches('/')))?;
        let resp = self.client.put(&url).body(body).send().await?;
        let _: Ack = Self::check(resp).await?.json().await?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, RemoteError> {
        let url = self.url("/objects")?;
        let resp = self
            .client
            .get(&url)
            .query(&[("prefix", prefix)])
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("conexión con {} cerrada", self.base_url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_strips_trailing_slash_and_prefixes_api() {
        let svc = HttpJobService::new(HttpServiceConfig {
            base_url: "http://master:8080/".to_string(),
            ..HttpServiceConfig::default()
        })
        .unwrap();

        assert_eq!(
            svc.url("/jobs/abc").unwrap(),
            "http://master:8080/api/v1/jobs/abc"
        );
    }

    #[tokio::test]
    async fn calls_after_close_fail_without_network() {
        let svc = HttpJobService::new(HttpServiceConfig::default()).unwrap();
        svc.close();
        svc.close();

        let err = svc.get_job_status(&"j1".to_string()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Closed));
    }
}
