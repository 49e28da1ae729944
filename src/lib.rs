//! Colony - filesystem-mediated coordination for cooperating agent instances
//!
//! Several independent agent processes working on one project share a
//! directory tree and nothing else. Through it they keep durable memories,
//! delegate tasks to each other, announce their presence and exchange
//! messages. There is no server: every process reads and writes the same
//! files, and other processes see the changes on their next read.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       Coordinator                             │
//! │  remember / recall · delegate / claim · heartbeat · messages  │
//! └──────┬────────────────┬────────────────┬───────────────┬──────┘
//!        │                │                │               │
//! ┌──────▼──────┐  ┌──────▼──────┐  ┌──────▼──────┐  ┌─────▼─────┐
//! │   Memory    │  │    Task     │  │  Instance   │  │   Inbox   │
//! │ Repository  │  │   Queue     │  │  Registry   │  │           │
//! │ + Index     │  │ (buckets)   │  │ (presence)  │  │ (1 file / │
//! │ + Timeline  │  │             │  │             │  │  message) │
//! └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └─────┬─────┘
//!        └────────────────┴───────┬────────┴───────────────┘
//!                                 │ atomic rename · lock files
//!                    ┌────────────▼────────────┐
//!                    │  <project>/.colony/     │
//!                    │  (shared + runtime/)    │
//!                    └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: facade an agent process drives
//! - [`memory`]: memories, derived index and timeline
//! - [`tasks`]: task state machine over status-bucket directories
//! - [`registry`]: instance presence, waits and activity log
//! - [`inbox`]: point-to-point messages
//! - [`storage`]: atomic writes and advisory locks
//! - [`config`]: configuration and directory layout

pub mod config;
pub mod coordinator;
pub mod error;
pub mod ids;
pub mod inbox;
pub mod memory;
pub mod registry;
pub mod storage;
pub mod tasks;

pub use config::{ColonyConfig, Layout};
pub use coordinator::{Coordinator, CoordinatorOptions};
pub use error::{Error, Result};
