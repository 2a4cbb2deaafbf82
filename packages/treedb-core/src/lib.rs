#![forbid(unsafe_code)]
//! Core of TreeDB: an ordered hierarchy over a parent-pointer table, plus the
//! session leases that decide who may edit which table.
//! The crate knows nothing about concrete databases; backends implement
//! [`NodeStore`] and [`StoreBackend`] and get cycle checks, order-key
//! maintenance and session gating for free.

#[cfg(feature = "serde")]
pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hierarchy;
pub mod ids;
pub mod memory;
pub mod meta;
pub mod node;
pub mod order_key;
pub mod session;
pub mod settings;
pub mod traits;

pub use config::{Config, ResourceKey, TableSchema};
pub use coordinator::{status_code, AccessCoordinator, SessionUpdate};
pub use error::{Error, Result};
pub use hierarchy::{HierarchyStore, Placement};
pub use ids::{NodeId, SessionId};
pub use memory::{MemoryBackend, MemoryNodeStore};
pub use meta::{ColumnInfo, ColumnKind, ForeignKey, ForeignOption, TableListing, TableMeta, TableSummary};
pub use node::{FieldValue, Fields, Node, Sibling};
pub use order_key::{RenumberPlan, Slot};
pub use session::{Rebind, Session, SessionRegistry};
pub use settings::Settings;
pub use traits::{Clock, ManualClock, NodeStore, NodeTx, StoreBackend, SystemClock};
