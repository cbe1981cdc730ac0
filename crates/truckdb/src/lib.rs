//! Embedded, single-process, local persistent key-value storage engine.
//!
//! Data is organized in a three-level namespace: a **truck** is an
//! isolated store (its own append-only data file and offset index), a
//! **box** groups related tags within a truck, and a **tag** names one
//! stored value.
//!
//! ```text
//!            Registry
//!         (multi-truck front-end, global cache, change bus)
//!                    |
//!         +----------+----------+
//!         |                     |
//!   TruckWorker            TruckWorker      (one actor task per open truck)
//!         |                     |
//!       Truck                 Truck         (write buffer, OffsetIndex,
//!         |                                  tag LRU, FieldIndex)
//!   <id>.dat / <id>.idx
//! ```
//!
//! [`Registry`] is the entry point for applications that want many trucks
//! multiplexed behind one handle with change notifications; [`Truck`] and
//! [`TruckWorkerHandle`] are available directly for single-truck embedding.

mod change_bus;
mod config;
mod crc32;
mod error;
mod field_index;
mod index;
mod lru;
mod record;
mod registry;
mod truck;
mod value;
mod worker;

pub use change_bus::ChangeEvent;
pub use config::{RegistryConfig, TruckConfig};
pub use error::{Result, TruckDbError};
pub use registry::{BoxWatcher, Registry, TagWatcher};
pub use truck::Truck;
pub use value::{BigInt, Value};
pub use worker::TruckWorkerHandle;
