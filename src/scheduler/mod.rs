//! Job scheduling and execution on one node.
//!
//! A node runs a single coordinator that claims jobs from the shared
//! [`JobStore`](crate::job_store::JobStore) into a bounded worker pool,
//! heartbeats itself and its claims, reclaims jobs of dead nodes and fires
//! periodic tasks. Nodes never talk to each other; the store is the only
//! shared state.

mod context;
mod coordinator;
mod handle;
mod node;
mod periodic;
mod registry;
mod task;

pub use context::{CancelHandle, CancelReason, ProgressReporter, TaskContext};
pub use coordinator::{create_scheduler, DrainReport, JobScheduler};
pub use handle::{SchedulerHandle, SubmitError, SubmitRequest};
pub use node::{generate_node_id, local_hostname, NodeRegistration};
pub use periodic::{CronSchedule, PeriodicTrigger, ScheduleError, TickSummary};
pub use registry::{validate_task_name, RegistryError, TaskRegistry};
pub use task::{ShutdownBehavior, TaskError, TaskHandler};
