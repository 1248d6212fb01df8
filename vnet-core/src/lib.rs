pub mod arp;
pub mod config;
pub mod controller;
pub mod driver;
pub mod flow;
pub mod packet;
pub mod routing;
pub mod rules;
pub mod test_util;
pub mod topology;
pub mod validation;

pub use controller::{Controller, Disposition, spawn_resolution_timer};
