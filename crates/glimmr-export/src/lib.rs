//! Export orchestration and streaming for the Glimmr price-transparency API.
//!
//! A request is validated into an [`ExportRequest`], sized by the
//! [`SizeEstimator`] and routed by the [`ExportRouter`]:
//!
//! - **Synchronous** exports are streamed page by page through the
//!   [`StreamingSerializer`] straight into the caller's sink.
//! - **Asynchronous** exports get a pending [`ExportProgress`] record and a
//!   job on the [`JobQueue`]; status reads reconcile the record with the
//!   queue.
//!
//! [`ExportService`] ties the pieces together. Nothing in this crate knows
//! about HTTP: failures carry an [`ErrorKind`] for the transport to map.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod estimator;
pub mod output;
pub mod progress;
pub mod reader;
pub mod router;
pub mod service;
pub mod types;

pub use config::ExportSettings;
pub use dispatch::{
    EnqueueOutcome, ExportArtifact, ExportJobMessage, ExportJobRunner, JobDispatcher, JobQueue,
    LocalJobQueue, QueueError, Reconciliation, RemoteJobState, reconcile,
};
pub use error::{ErrorKind, ExportError, Result, ValidationError};
pub use estimator::{SizeEstimate, SizeEstimator};
pub use output::{ExportWriter, RecordWriter, StreamingSerializer, WriteSummary};
pub use progress::{
    ExportProgress, ExportProgressPatch, ExportStatus, InMemoryProgressStore, ProgressStore,
    ProgressSweeper, StoreError,
};
pub use reader::{DatasetReader, MemoryDatasetReader, ReaderError, Row};
pub use router::{ExportRoute, ExportRouter, RoutingDecision};
pub use service::{ExportService, ExportTicket, SyncExport};
pub use types::{Dataset, DatasetScope, ExportEstimate, ExportPlan, ExportRequest, Filters, Format};
