//! Route handlers.

pub mod drives;
pub mod health;
pub mod vms;
pub mod volumes;
