pub mod config;
pub mod error;
pub mod find;
pub mod gate;
pub mod http;
pub mod remote;
pub mod sink;

#[cfg(test)]
mod testing;

pub use config::{HttpServiceConfig, KeyFailurePolicy, SinkConfig, UploadPreparerConfig};
pub use error::{PrepareError, RemoteError, SinkError};
pub use find::ObjectFinder;
pub use gate::{
    PackageGate, PackageKey, PackagePreparer, PackageSpec, PackageStep, PreparedAsset,
    UploadPreparer,
};
pub use http::HttpJobService;
pub use remote::JobService;
pub use sink::{FeedSummary, JobSink, SinkSnapshot, SinkStage};
