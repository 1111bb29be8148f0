use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::phase::PhaseDescriptor;

pub type JobId = String;

/// Una unidad de entrada del job (normalmente la ruta de un objeto).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for JobKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Lo que se envía al servicio remoto para crear un job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,

    /// Fases map/reduce en el orden en que se declararon
    pub phases: Vec<PhaseDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
}

impl JobState {
    /// `done` es la única señal terminal que consume el cliente.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub phases: Vec<PhaseDescriptor>,

    /// -------- Entrada del job --------
    pub keys: u64,
    pub input_done: bool,

    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    /// Job recién creado, todavía sin claves.
    pub fn queued(id: JobId, descriptor: JobDescriptor) -> Self {
        Self {
            id,
            name: descriptor.name,
            state: JobState::Queued,
            phases: descriptor.phases,
            keys: 0,
            input_done: false,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }
}
