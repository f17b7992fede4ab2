//! Background job system.
//!
//! - **Job**: the contract every job kind implements
//! - **Queue**: bounded submission queue with backpressure
//! - **Worker**: one execution context, one job at a time
//! - **Dispatcher**: owns the workers and routes jobs to idle ones
//! - **Registry**: kind name to constructor, used by every producer
//! - **Scheduler**: periodic submission of registered kinds
//! - **Paging**: paged sweep with bounded fan-out for job bodies
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌────────────────┐   ┌────────────┐
//! │ Scheduler │──▶│ Registry │──▶│ SubmissionQueue│──▶│ Dispatcher │
//! └───────────┘   └──────────┘   │   (bounded M)  │   └─────┬──────┘
//!                                └────────────────┘         │ slot
//!                                                     ┌─────▼──────┐
//!                                                     │ Worker x N │
//!                                                     └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use tidepool_core::jobs::{Dispatcher, SubmissionQueue};
//!
//! let (submitter, receiver) = SubmissionQueue::bounded(100)?;
//! let dispatcher = Dispatcher::new(8)?;
//! dispatcher.run(receiver)?;
//!
//! submitter.submit(Box::new(MyJob::new())).await?;
//!
//! dispatcher.exit().await;
//! ```

pub mod builtin;
pub mod dispatcher;
pub mod job;
pub mod paging;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use builtin::{register_builtin, Collaborators, SweepOptions};
pub use dispatcher::{Dispatcher, DispatcherStats, StatsSnapshot, WorkerIdSource};
pub use job::{with_deadline, BoxedJob, Job, JobError, JobErrorKind, JobResult};
pub use paging::{PagedSweep, SweepReport};
pub use queue::{SubmissionQueue, SubmissionReceiver, Submitter, TrySubmitError};
pub use registry::{JobConstructor, JobRegistry};
pub use scheduler::{JobScheduler, ScheduleEntry};
pub use worker::{Worker, WorkerHandle, WorkerSlot, WorkerState, WorkerStats};
