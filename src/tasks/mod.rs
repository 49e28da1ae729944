//! Task delegation between instances
//!
//! A task is one YAML file whose directory encodes its status. Only
//! completed tasks live under the version-controlled root; everything else
//! is machine-local runtime state.

pub mod queue;
pub mod types;

pub use queue::{ReconcileReport, TaskQueue};
pub use types::{
    Bucket, DelegateRequest, Priority, Task, TaskCreator, TaskResult, TaskStatus, TaskTarget,
};
