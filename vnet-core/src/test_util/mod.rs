//! Test utilities for driving the controller without a switch
//!
//! This module provides a recording switch driver, a manually advanced
//! clock, and frame builders for integration tests.

pub mod clock;
pub mod packets;
pub mod switch;

pub use clock::ManualClock;
pub use switch::MockSwitchDriver;
