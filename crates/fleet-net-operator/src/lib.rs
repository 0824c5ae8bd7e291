//! Fleet networking hub controllers and member agent

#![deny(missing_docs)]

/// Controller construction for the hub and member agents
pub mod controller_runner;
