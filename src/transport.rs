use crate::board::{WIRE_OUT_NUM_WORDS_LSB, WIRE_OUT_NUM_WORDS_MSB};
use anyhow::{bail, Context, Result};
use log::debug;
use std::path::Path;

/// Host side of the FPGA's USB interface: wire-ins, wire-outs, triggers and
/// the block pipe carrying sample data.
pub trait Transport {
    /// Latches every wire-in value set since the last update.
    fn update_wire_ins(&mut self) -> Result<()>;

    /// Stages `value` on the bits of wire-in `addr` selected by `mask`.
    fn set_wire_in(&mut self, addr: u8, value: u32, mask: u32) -> Result<()>;

    /// Samples every wire-out so [`wire_out`](Transport::wire_out) reads fresh values.
    fn update_wire_outs(&mut self) -> Result<()>;

    fn wire_out(&self, addr: u8) -> u32;

    fn activate_trigger_in(&mut self, addr: u8, bit: u32) -> Result<()>;

    /// Reads `buf.len()` bytes from pipe `addr`, returning the count read.
    fn read_from_pipe_out(&mut self, addr: u8, buf: &mut [u8]) -> Result<usize>;

    /// True once the source will never deliver more words than the FIFO holds now.
    fn is_finished(&self) -> bool {
        false
    }
}

/// One host-to-board operation recorded by [`ReplayTransport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportOp {
    SetWireIn { addr: u8, value: u32, mask: u32 },
    UpdateWireIns,
    Trigger { addr: u8, bit: u32 },
}

/// Serves a recorded USB capture as pipe-out data and records every write.
#[derive(Debug, Default)]
pub struct ReplayTransport {
    capture: Vec<u8>,
    position: usize,
    wire_ins: [u32; 0x20],
    latched_words: u32,
    pub ops: Vec<TransportOp>,
}

impl ReplayTransport {
    pub fn from_bytes(capture: Vec<u8>) -> Self {
        ReplayTransport {
            capture,
            ..Default::default()
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let capture = std::fs::read(path)
            .with_context(|| format!("failed to read capture {}", path.display()))?;
        debug!("Loaded {} byte capture from {}", capture.len(), path.display());
        Ok(Self::from_bytes(capture))
    }

    /// Current latched value of wire-in `addr`.
    pub fn wire_in(&self, addr: u8) -> u32 {
        self.wire_ins[addr as usize]
    }

    pub fn remaining(&self) -> usize {
        self.capture.len() - self.position
    }
}

impl Transport for ReplayTransport {
    fn update_wire_ins(&mut self) -> Result<()> {
        self.ops.push(TransportOp::UpdateWireIns);
        Ok(())
    }

    fn set_wire_in(&mut self, addr: u8, value: u32, mask: u32) -> Result<()> {
        let Some(slot) = self.wire_ins.get_mut(addr as usize) else {
            bail!("wire-in address {addr:#04x} out of range");
        };
        *slot = (*slot & !mask) | (value & mask);
        self.ops.push(TransportOp::SetWireIn { addr, value, mask });
        Ok(())
    }

    fn update_wire_outs(&mut self) -> Result<()> {
        self.latched_words = (self.remaining() / 2) as u32;
        Ok(())
    }

    fn wire_out(&self, addr: u8) -> u32 {
        match addr {
            WIRE_OUT_NUM_WORDS_LSB => self.latched_words & 0xffff,
            WIRE_OUT_NUM_WORDS_MSB => self.latched_words >> 16,
            _ => 0,
        }
    }

    fn activate_trigger_in(&mut self, addr: u8, bit: u32) -> Result<()> {
        self.ops.push(TransportOp::Trigger { addr, bit });
        Ok(())
    }

    fn read_from_pipe_out(&mut self, _addr: u8, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.capture[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }

    fn is_finished(&self) -> bool {
        true
    }
}
