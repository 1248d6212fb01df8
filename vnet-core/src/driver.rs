//! Switch driver boundary.
//!
//! The controller never talks to a switch directly. It hands flow and packet
//! requests to a `SwitchDriver`, and the transport layer calls back into
//! `Controller::on_packet_in` / `Controller::on_port_status`.

use thiserror::Error;
use uuid::Uuid;

use crate::flow::{FlowMod, PacketOut};

/// Errors reported by a switch driver.
///
/// None of these are fatal to the controller: a failed flow install is
/// simply retried when the next matching packet arrives.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Switch connection is down")]
    Disconnected,

    #[error("Switch rejected request: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Capability to program the underlying switch.
pub trait SwitchDriver: Send + Sync {
    /// Install a flow. If `flow.buffer_id` references a buffered packet the
    /// switch applies the new flow to it as well.
    fn install_flow(&self, flow: FlowMod) -> Result<()>;

    /// Emit a single packet.
    fn send_packet(&self, packet: PacketOut) -> Result<()>;

    /// Release a buffered packet the controller consumed.
    fn free_buffer(&self, buffer_id: u32, in_port: u16) -> Result<()>;
}

/// A switch port as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalPort {
    /// Switch port number
    pub number: u16,
    /// Hardware address of the switch port
    pub hw_addr: [u8; 6],
    /// Virtual port bound to this switch port (from the port's external id)
    pub port_id: Uuid,
}

/// Port status change reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Added,
    Removed,
}
