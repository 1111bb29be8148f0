use common::StepError;
use thiserror::Error;

/// Fallos del servicio remoto de jobs / object store.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("connection already closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("reading package {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("uploading package: {0}")]
    Remote(#[from] RemoteError),
}

/// Errores visibles para quien escribe en un `JobSink`.
///
/// Los errores de estructura (fases, cadenas, doble fin) se devuelven en el
/// momento; los del servicio remoto llegan por la respuesta de cada operación.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("job creation already started")]
    JobAlreadyCreated,
    #[error("job creation failed: {0}")]
    JobCreationFailed(String),
    #[error("package preparation failed: {0}")]
    PackagePreparation(String),
    #[error("input already ended")]
    DoubleEnd,
    #[error("input ended, no more keys accepted")]
    InputEnded,
    #[error("failed to add key {key}: {reason}")]
    KeySubmission { key: String, reason: String },
    #[error("failed to end job input: {0}")]
    EndInputFailed(String),
    #[error("job aborted after a failed key: {0}")]
    Aborted(String),
    #[error("sink is closed")]
    Closed,
    #[error(transparent)]
    Step(#[from] StepError),
}

impl SinkError {
    /// Los errores que dejan el sink en estado terminal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SinkError::JobCreationFailed(_)
                | SinkError::PackagePreparation(_)
                | SinkError::EndInputFailed(_)
                | SinkError::Aborted(_)
                | SinkError::Closed
        )
    }
}
