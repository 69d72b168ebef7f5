//! Background Tasks Module
//!
//! Contains background tasks that run periodically during server operation.
//!
//! # Tasks
//! - Maintenance: sweeps expired entries from both tiers and reports statistics

mod maintenance;

pub use maintenance::spawn_maintenance_task;
