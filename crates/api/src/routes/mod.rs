//! Route Handlers

pub mod incidents;
pub mod monitors;
pub mod ping;
