//! Clock Core - Hardware-independent logic for the ESP32 clock firmware
//!
//! This crate contains the connectivity and self-update state machines that
//! can be tested on the host platform without requiring ESP32 hardware. The
//! firmware crate drives these machines from driver callbacks and the control
//! tick, and dispatches the commands they return.

pub mod link;
pub mod model;
pub mod release;
pub mod schedule;
pub mod update;
