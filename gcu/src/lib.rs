//! Ground control unit: fleet discovery, address assignment and the
//! operator-facing command link.

pub mod comm;
pub mod config;
pub mod session;
