pub mod api;
pub mod job;
pub mod phase;
pub mod step;

pub use api::{Ack, AddKeyRequest, ObjectEntry};
pub use job::{JobDescriptor, JobId, JobInfo, JobKey, JobState};
pub use phase::{PhaseDescriptor, PhaseKind};
pub use step::{Step, StepBuilder, StepError, UnixTool, DEFAULT_IMAGE};
