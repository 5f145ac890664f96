//! Stream source/sink subsystem: catalog, spatial index, recharge engine.
//!
//! Streams are user-defined line segments on the aquifer top surface; the
//! subsystem turns them into buffered polygonal footprints and converts
//! footprint/cell intersections into right-hand-side source terms.

pub mod catalog;
pub mod index;
pub mod recharge;

pub use catalog::{StreamCatalog, StreamSegment, buffered_outline};
pub use index::{IndexedTriangle, StreamIndex};
pub use recharge::{ClipOutcome, RechargeContribution, StreamRechargeEngine};
