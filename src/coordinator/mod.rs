//! Membership coordination: registration, failure detection, hand-off

pub mod monitor;
pub mod server;

pub use server::Coordinator;
