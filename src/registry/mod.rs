//! Instance registry: who is running, what they can do, what they wait on

pub mod store;
pub mod types;

pub use store::{machine_name, InstanceIdentity, InstanceRegistry};
pub use types::{ActivityEntry, Instance, InstanceStatus, RegistryDocument, SessionInfo, WaitEntry};
