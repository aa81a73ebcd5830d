//! Routing Information Base -- the transactional core of a mesh node.
//!
//! State lives in immutable snapshots ([`state::RibState`]) behind an `Arc`.
//! Transitions are two-phase: [`Rib::plan`] is a pure function computing a
//! successor snapshot plus outbound propagation instructions, and
//! [`Rib::commit`] swaps the snapshot in. Loop freedom across the mesh comes
//! from the accumulated node path alone (the `propagate` module); committed
//! snapshots reach downstream consumers through the [`SnapshotCell`].

mod propagate;
pub mod rib;
pub mod snapshot;
pub mod state;

pub use rib::{Plan, PlanError, Rib, StalePlan};
pub use snapshot::{SnapshotCell, WatchGuard};
pub use state::{ExternalState, InternalState, LocalState, RibState};
