use std::sync::Arc;

use common::JobKey;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::RemoteError;
use crate::remote::JobService;

/// Fuente de claves: objetos del store remoto bajo un prefijo.
pub struct ObjectFinder {
    service: Arc<dyn JobService>,
}

impl ObjectFinder {
    pub fn new(service: Arc<dyn JobService>) -> Self {
        Self { service }
    }

    pub async fn find(&self, prefix: &str) -> Result<Vec<JobKey>, RemoteError> {
        let entries = self.service.list_objects(prefix).await?;
        info!("{} objetos bajo {}", entries.len(), prefix);
        Ok(entries.iter().map(JobKey::from).collect())
    }

    /// Igual que `find`, pero empuja las claves a un canal (para `JobSink::feed`).
    /// Devuelve cuántas se enviaron; corta si el receptor se cierra.
    pub async fn find_into(
        &self,
        prefix: &str,
        tx: mpsc::Sender<JobKey>,
    ) -> Result<usize, RemoteError> {
        let mut sent = 0;
        for key in self.find(prefix).await? {
            if tx.send(key).await.is_err() {
                debug!("receptor cerrado tras {} claves", sent);
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeJobService};
    use common::ObjectEntry;

    fn entry(parent: &str, name: &str) -> ObjectEntry {
        ObjectEntry {
            parent: parent.to_string(),
            name: name.to_string(),
            size: 10,
        }
    }

    #[tokio::test]
    async fn find_maps_entries_to_keys() {
        let service = Arc::new(FakeJobService::new());
        service.set_listing(vec![
            entry("/acme/logs", "a.log"),
            entry("/acme/logs/2024", "b.log"),
        ]);
        let finder = ObjectFinder::new(service.clone());

        let keys = finder.find("/acme/logs").await.unwrap();
        assert_eq!(
            keys,
            vec![
                JobKey::from("/acme/logs/a.log"),
                JobKey::from("/acme/logs/2024/b.log")
            ]
        );
        assert_eq!(service.calls(), vec![Call::List("/acme/logs".to_string())]);
    }

    #[tokio::test]
    async fn find_into_stops_when_receiver_is_gone() {
        let service = Arc::new(FakeJobService::new());
        service.set_listing(vec![entry("/d", "1"), entry("/d", "2"), entry("/d", "3")]);
        let finder = ObjectFinder::new(service);

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(finder.find_into("/d", tx).await.unwrap(), 3);
        assert_eq!(rx.recv().await, Some(JobKey::from("/d/1")));

        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        assert_eq!(finder.find_into("/d", tx).await.unwrap(), 0);
    }
}
