//! Front-end transports for the coordinator.
//!
//! HTTP is the only transport; it delegates everything to
//! `CoordinatorService`.

pub mod http;
