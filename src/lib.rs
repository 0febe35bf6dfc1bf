#![warn(missing_docs)]
//! Core library entry points for the fastaugment batch augmentation engine.

pub mod checkpoint;
pub mod controls;
pub mod credentials;
pub mod errors;
pub mod extract;
pub mod prompt;
pub mod rate_limit;
pub mod records;
pub mod report;
pub mod runtime;
pub mod safety;
pub mod service;
pub mod validation;

pub use checkpoint::{CheckpointStore, Recovery};
pub use controls::{AugmentCli, AugmentControls, KeySource};
pub use credentials::{CallOutcome, CredentialPool};
pub use errors::{AugmentError, Result};
pub use records::{AcceptedRecord, SourceRecord};
pub use report::{FinalReport, RunStatus};
pub use runtime::{run as run_augmenter, Augmenter, RunSummary};
pub use service::{GenerativeService, ServiceError, ServiceRequest, ServiceResponse};
pub use validation::{Fingerprint, ValidationPipeline};
