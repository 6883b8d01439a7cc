//! netshaper: a control plane that reconciles logical device clusters onto
//! isolated container networks and shapes each device's traffic in both
//! directions with HTB classes on a shared shaping endpoint.

pub mod cli;
pub mod config;
pub mod locks;
pub mod metrics;
pub mod rules;
pub mod runtime;
pub mod server;
pub mod shaping;
pub mod store;
pub mod sync;
pub mod topology;
