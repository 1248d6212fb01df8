//! Recording switch driver

use std::sync::Mutex;

use crate::driver::{DriverError, Result, SwitchDriver};
use crate::flow::{FlowMod, PacketOut};

/// Switch driver that records every request.
///
/// With `fail` set, every call returns `DriverError::Disconnected` after
/// being recorded.
#[derive(Debug, Default)]
pub struct MockSwitchDriver {
    pub added_flows: Mutex<Vec<FlowMod>>,
    pub sent_packets: Mutex<Vec<PacketOut>>,
    pub dropped_buffers: Mutex<Vec<u32>>,
    pub fail: Mutex<bool>,
}

impl MockSwitchDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flows(&self) -> Vec<FlowMod> {
        self.added_flows.lock().unwrap().clone()
    }

    pub fn packets(&self) -> Vec<PacketOut> {
        self.sent_packets.lock().unwrap().clone()
    }

    pub fn dropped(&self) -> Vec<u32> {
        self.dropped_buffers.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn clear(&self) {
        self.added_flows.lock().unwrap().clear();
        self.sent_packets.lock().unwrap().clear();
        self.dropped_buffers.lock().unwrap().clear();
    }

    fn result(&self) -> Result<()> {
        if *self.fail.lock().unwrap() {
            Err(DriverError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl SwitchDriver for MockSwitchDriver {
    fn install_flow(&self, flow: FlowMod) -> Result<()> {
        self.added_flows.lock().unwrap().push(flow);
        self.result()
    }

    fn send_packet(&self, packet: PacketOut) -> Result<()> {
        self.sent_packets.lock().unwrap().push(packet);
        self.result()
    }

    fn free_buffer(&self, buffer_id: u32, _in_port: u16) -> Result<()> {
        self.dropped_buffers.lock().unwrap().push(buffer_id);
        self.result()
    }
}
