//! Station status classification and the alert acknowledgement workflow.

pub mod acknowledge;
pub mod classify;
