//! Live shaping metrics
//!
//! A background task samples the class counters of every shaped interface
//! once per interval and publishes the result on a watch channel. Readers
//! always see the newest snapshot; nothing is kept beyond it.

pub mod sampler;
pub mod snapshot;

pub use sampler::{differentiate, spawn_sampler, Baseline, Sampler, SamplerHandle};
pub use snapshot::{ClassStats, Connection, DirectionalStats, InterfaceStats, MetricsSnapshot};
