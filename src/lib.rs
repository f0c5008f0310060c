//! Occupancy state engine and downlink dispatch pipeline for LoRaWAN
//! parking displays: a tenant-scoped reservation ledger, a pure display
//! state engine, and a durable, coalescing, rate-limited downlink queue
//! drained by the dispatch worker.

pub mod actuate;
pub mod dispatch;
pub mod display;
pub mod gateway;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod policy;
pub mod queue;
pub mod reaper;
pub mod tenant;
pub mod trigger;
pub mod wal;
