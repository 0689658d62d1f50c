//! Aircraft-side control unit: PID flight control, the operational
//! state machine and the UDP link to the ground station.

pub mod actuators;
pub mod app;
pub mod comm;
pub mod config;
pub mod control;
pub mod sensors;
pub mod sim;
pub mod state;
