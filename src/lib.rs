//! Covflow - streaming Cobertura coverage extraction
//!
//! A library for turning Cobertura-style XML coverage reports into
//! per-package, per-file coverage records:
//! - Forward-only XML scan in bounded memory
//! - Packages delivered over a channel as soon as they close
//! - Cooperative cancellation shared by producer and consumer
//! - Fail-fast pipeline that keeps already-delivered packages valid

pub mod config;
pub mod coverage;
pub mod logging;
pub mod pipeline;
pub mod summary;

pub use coverage::{
    extract, validate_threshold, Coverage, ExtractError, ExtractStats, Package, ThresholdResult,
};
pub use pipeline::{
    recv_package, run_pipeline, run_pipeline_shared, PackageReceiver, PipelineError, PipelineOptions,
};
pub use summary::Summary;
pub use tokio_util::sync::CancellationToken;
