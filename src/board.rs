use crate::{
    bytes_per_block, words_per_block, CommandWord, RhdError, SampleBlock, Transport,
    UsbGeneration, MAX_COMMAND_LENGTH,
};
use anyhow::{bail, Context, Result};
use crossbeam_channel::Sender;
use log::{debug, info, trace, warn};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

pub const WIRE_IN_RESET_RUN: u8 = 0x00;
pub const WIRE_IN_MAX_TIME_STEP_LSB: u8 = 0x01;
pub const WIRE_IN_MAX_TIME_STEP_MSB: u8 = 0x02;
pub const WIRE_IN_DATA_FREQ_PLL: u8 = 0x03;
pub const WIRE_IN_MISO_DELAY: u8 = 0x04;
pub const WIRE_IN_CMD_RAM_ADDR: u8 = 0x05;
pub const WIRE_IN_CMD_RAM_BANK: u8 = 0x06;
pub const WIRE_IN_CMD_RAM_DATA: u8 = 0x07;
pub const WIRE_IN_AUX_CMD_BANK_1: u8 = 0x08;
pub const WIRE_IN_AUX_CMD_LENGTH_1: u8 = 0x0b;
pub const WIRE_IN_AUX_CMD_LOOP_1: u8 = 0x0e;
pub const WIRE_IN_DATA_STREAM_EN: u8 = 0x14;

pub const TRIG_IN_RAM_WRITE: u8 = 0x42;

pub const WIRE_OUT_NUM_WORDS_LSB: u8 = 0x20;
pub const WIRE_OUT_NUM_WORDS_MSB: u8 = 0x21;

pub const PIPE_OUT_DATA: u8 = 0xa0;

/// Number of command RAM banks per auxiliary slot.
pub const NUM_COMMAND_BANKS: u32 = 16;

const MAX_COMMAND_INDEX: u32 = MAX_COMMAND_LENGTH as u32 - 1;

/// SPI port on the evaluation board.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardPort {
    A,
    B,
    C,
    D,
}

impl BoardPort {
    fn bank_shift(self) -> u32 {
        match self {
            BoardPort::A => 0,
            BoardPort::B => 4,
            BoardPort::C => 8,
            BoardPort::D => 12,
        }
    }
}

/// One of the three auxiliary command sequencers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuxCommandSlot {
    Aux1,
    Aux2,
    Aux3,
}

impl AuxCommandSlot {
    pub fn index(self) -> u8 {
        match self {
            AuxCommandSlot::Aux1 => 0,
            AuxCommandSlot::Aux2 => 1,
            AuxCommandSlot::Aux3 => 2,
        }
    }
}

fn check_bank(bank: u32) -> Result<()> {
    if bank >= NUM_COMMAND_BANKS {
        return Err(RhdError::out_of_range("bank", bank).into());
    }
    Ok(())
}

/// An evaluation board reached through a [`Transport`].
#[derive(Debug)]
pub struct Board<T: Transport> {
    transport: T,
    num_streams: usize,
    generation: UsbGeneration,
    buffer: Vec<u8>,
}

impl<T: Transport> Board<T> {
    pub fn new(transport: T, num_streams: usize, generation: UsbGeneration) -> Result<Self> {
        // validates the stream count for this generation
        SampleBlock::new(num_streams, generation)?;
        Ok(Board {
            transport,
            num_streams,
            generation,
            buffer: Vec::new(),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    pub fn generation(&self) -> UsbGeneration {
        self.generation
    }

    /// Words currently waiting in the board's USB FIFO.
    pub fn num_words_in_fifo(&mut self) -> Result<u32> {
        self.transport.update_wire_outs()?;
        let msb = self.transport.wire_out(WIRE_OUT_NUM_WORDS_MSB);
        let lsb = self.transport.wire_out(WIRE_OUT_NUM_WORDS_LSB);
        Ok((msb << 16) + lsb)
    }

    /// Writes `list` into command RAM `bank` of `slot`, one word per RAM address.
    pub fn upload_command_list(
        &mut self,
        list: &[CommandWord],
        slot: AuxCommandSlot,
        bank: u32,
    ) -> Result<()> {
        check_bank(bank)?;
        if list.len() > MAX_COMMAND_LENGTH {
            bail!(
                "command list of {} words exceeds RAM bank size {}",
                list.len(),
                MAX_COMMAND_LENGTH
            );
        }

        for (addr, word) in list.iter().enumerate() {
            self.transport
                .set_wire_in(WIRE_IN_CMD_RAM_DATA, word.raw() as u32, 0xffff)?;
            self.transport
                .set_wire_in(WIRE_IN_CMD_RAM_ADDR, addr as u32, 0xffff)?;
            self.transport
                .set_wire_in(WIRE_IN_CMD_RAM_BANK, bank, 0xffff)?;
            self.transport.update_wire_ins()?;
            self.transport
                .activate_trigger_in(TRIG_IN_RAM_WRITE, slot.index() as u32)?;
        }
        debug!(
            "Uploaded {} commands to {:?} bank {}",
            list.len(),
            slot,
            bank
        );
        Ok(())
    }

    /// Points `slot` of `port` at command RAM `bank`.
    pub fn select_aux_command_bank(
        &mut self,
        port: BoardPort,
        slot: AuxCommandSlot,
        bank: u32,
    ) -> Result<()> {
        check_bank(bank)?;
        let shift = port.bank_shift();
        self.transport.set_wire_in(
            WIRE_IN_AUX_CMD_BANK_1 + slot.index(),
            bank << shift,
            0x000f << shift,
        )?;
        self.transport.update_wire_ins()
    }

    /// Sets the command index `slot` loops back to and the last index it runs.
    pub fn select_aux_command_length(
        &mut self,
        slot: AuxCommandSlot,
        loop_index: u32,
        end_index: u32,
    ) -> Result<()> {
        if loop_index > MAX_COMMAND_INDEX {
            return Err(RhdError::out_of_range("loop_index", loop_index).into());
        }
        if end_index > MAX_COMMAND_INDEX {
            return Err(RhdError::out_of_range("end_index", end_index).into());
        }
        self.transport
            .set_wire_in(WIRE_IN_AUX_CMD_LOOP_1 + slot.index(), loop_index, 0xffff)?;
        self.transport
            .set_wire_in(WIRE_IN_AUX_CMD_LENGTH_1 + slot.index(), end_index, 0xffff)?;
        self.transport.update_wire_ins()
    }

    /// Enables or disables USB data stream `stream`.
    pub fn enable_data_stream(&mut self, stream: usize, enabled: bool) -> Result<()> {
        if stream >= self.generation.max_streams() {
            return Err(RhdError::out_of_range("stream", stream as f64).into());
        }
        let bit = 1u32 << stream;
        self.transport
            .set_wire_in(WIRE_IN_DATA_STREAM_EN, if enabled { bit } else { 0 }, bit)?;
        self.transport.update_wire_ins()
    }

    /// Reads and decodes `n` blocks onto the back of `queue`.
    ///
    /// Returns `Ok(false)` without reading when the FIFO holds fewer than `n`
    /// blocks. A lost frame marker is returned as [`RhdError::SyncLost`]; the
    /// blocks decoded before it are still queued.
    pub fn read_data_blocks(
        &mut self,
        n: usize,
        queue: &mut VecDeque<SampleBlock>,
    ) -> Result<bool> {
        let needed = n * words_per_block(self.num_streams, self.generation);
        if (self.num_words_in_fifo()? as usize) < needed {
            return Ok(false);
        }

        let len = n * bytes_per_block(self.num_streams, self.generation);
        self.buffer.resize(len, 0);
        let read = self
            .transport
            .read_from_pipe_out(PIPE_OUT_DATA, &mut self.buffer)
            .context("failed to read data pipe")?;
        if read < len {
            bail!("short pipe read: {read} of {len} bytes");
        }

        for block_index in 0..n {
            let mut block = SampleBlock::new(self.num_streams, self.generation)?;
            block.fill_from_usb_buffer(&self.buffer, block_index)?;
            queue.push_back(block);
        }
        Ok(true)
    }

    /// Discards everything in the FIFO.
    pub fn flush(&mut self) -> Result<()> {
        let mut discarded = 0;
        loop {
            let words = self.num_words_in_fifo()? as usize;
            if words == 0 {
                break;
            }
            self.buffer.resize(2 * words, 0);
            let read = self
                .transport
                .read_from_pipe_out(PIPE_OUT_DATA, &mut self.buffer)?;
            if read == 0 {
                break;
            }
            discarded += read;
        }
        debug!("Flushed {discarded} bytes from FIFO");
        Ok(())
    }
}

/// Totals reported by [`run_acquisition`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub blocks: usize,
    pub sync_errors: usize,
}

/// Acquisition thread body: polls `board` and sends every decoded block
/// over `tx` until `shutdown` is set, the receiver hangs up, or a finished
/// source runs dry.
pub fn run_acquisition<T: Transport>(
    board: &mut Board<T>,
    blocks_per_read: usize,
    tx: Sender<SampleBlock>,
    shutdown: Arc<AtomicBool>,
) -> Result<AcquisitionStats> {
    let mut stats = AcquisitionStats::default();
    let mut queue = VecDeque::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("Acquisition stopped by shutdown request");
            break;
        }
        let result = board.read_data_blocks(blocks_per_read, &mut queue);

        let mut hung_up = false;
        while let Some(block) = queue.pop_front() {
            if tx.send(block).is_err() {
                hung_up = true;
                break;
            }
            stats.blocks += 1;
        }
        if hung_up {
            warn!("Block receiver disconnected, stopping acquisition");
            break;
        }

        match result {
            Ok(true) => trace!("Sent {} blocks", stats.blocks),
            Ok(false) if board.transport().is_finished() => {
                info!("Source exhausted after {} blocks", stats.blocks);
                break;
            }
            Ok(false) => thread::sleep(Duration::from_millis(1)),
            Err(e) => match e.downcast_ref::<RhdError>() {
                Some(err) if matches!(err, RhdError::SyncLost { .. }) => {
                    warn!("{err}; flushing FIFO");
                    stats.sync_errors += 1;
                    board.flush()?;
                }
                _ => return Err(e),
            },
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReplayTransport, TransportOp};

    fn board() -> Board<ReplayTransport> {
        Board::new(ReplayTransport::default(), 1, UsbGeneration::Legacy).unwrap()
    }

    #[test]
    fn upload_poke_sequence() {
        let mut board = board();
        let list = [
            CommandWord::register_read(63).unwrap(),
            CommandWord::calibrate(),
        ];
        board
            .upload_command_list(&list, AuxCommandSlot::Aux3, 5)
            .unwrap();

        let set = |addr, value| TransportOp::SetWireIn {
            addr,
            value,
            mask: 0xffff,
        };
        let trigger = TransportOp::Trigger {
            addr: TRIG_IN_RAM_WRITE,
            bit: 2,
        };
        assert_eq!(
            board.transport().ops,
            vec![
                set(WIRE_IN_CMD_RAM_DATA, 0xff00),
                set(WIRE_IN_CMD_RAM_ADDR, 0),
                set(WIRE_IN_CMD_RAM_BANK, 5),
                TransportOp::UpdateWireIns,
                trigger,
                set(WIRE_IN_CMD_RAM_DATA, 0x5500),
                set(WIRE_IN_CMD_RAM_ADDR, 1),
                set(WIRE_IN_CMD_RAM_BANK, 5),
                TransportOp::UpdateWireIns,
                trigger,
            ]
        );
    }

    #[test]
    fn upload_rejects_bad_bank_and_long_list() {
        let mut board = board();
        assert!(board
            .upload_command_list(&[], AuxCommandSlot::Aux1, 16)
            .is_err());
        let long = vec![CommandWord::calibrate(); MAX_COMMAND_LENGTH + 1];
        assert!(board
            .upload_command_list(&long, AuxCommandSlot::Aux1, 0)
            .is_err());
        assert!(board.transport().ops.is_empty());
    }

    #[test]
    fn bank_selection_is_per_port() {
        let mut board = board();
        board
            .select_aux_command_bank(BoardPort::A, AuxCommandSlot::Aux2, 3)
            .unwrap();
        board
            .select_aux_command_bank(BoardPort::C, AuxCommandSlot::Aux2, 0xa)
            .unwrap();
        board
            .select_aux_command_bank(BoardPort::D, AuxCommandSlot::Aux1, 15)
            .unwrap();
        let t = board.transport();
        assert_eq!(t.wire_in(WIRE_IN_AUX_CMD_BANK_1 + 1), 0x0a03);
        assert_eq!(t.wire_in(WIRE_IN_AUX_CMD_BANK_1), 0xf000);
        assert!(board
            .select_aux_command_bank(BoardPort::B, AuxCommandSlot::Aux1, 16)
            .is_err());
    }

    #[test]
    fn command_length_bounds() {
        let mut board = board();
        board
            .select_aux_command_length(AuxCommandSlot::Aux3, 0, 1023)
            .unwrap();
        assert_eq!(board.transport().wire_in(WIRE_IN_AUX_CMD_LOOP_1 + 2), 0);
        assert_eq!(board.transport().wire_in(WIRE_IN_AUX_CMD_LENGTH_1 + 2), 1023);
        assert!(board
            .select_aux_command_length(AuxCommandSlot::Aux1, 1024, 0)
            .is_err());
        assert!(board
            .select_aux_command_length(AuxCommandSlot::Aux1, 0, 1024)
            .is_err());
    }

    #[test]
    fn data_stream_enable_bits() {
        let mut board = board();
        board.enable_data_stream(0, true).unwrap();
        board.enable_data_stream(3, true).unwrap();
        board.enable_data_stream(0, false).unwrap();
        assert_eq!(board.transport().wire_in(WIRE_IN_DATA_STREAM_EN), 0b1000);
        assert!(board.enable_data_stream(8, true).is_err());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn out_of_range_stream_is_reported_exactly() {
        let mut board = board();
        let err = board
            .enable_data_stream(u32::MAX as usize + 8, true)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<RhdError>(),
            Some(&RhdError::OutOfRange {
                parameter: "stream",
                value: 4294967303.0
            })
        );
    }

    #[test]
    fn reads_whole_blocks_only() {
        let mut block = SampleBlock::new(1, UsbGeneration::Legacy).unwrap();
        block.timestamps[0] = 42;
        let mut capture = Vec::new();
        block.write_usb_frame(&mut capture);
        block.timestamps[0] = 43;
        block.write_usb_frame(&mut capture);
        capture.extend_from_slice(&[0u8; 10]);

        let mut board = Board::new(
            ReplayTransport::from_bytes(capture),
            1,
            UsbGeneration::Legacy,
        )
        .unwrap();
        let mut queue = VecDeque::new();
        assert!(!board.read_data_blocks(3, &mut queue).unwrap());
        assert!(queue.is_empty());
        assert!(board.read_data_blocks(2, &mut queue).unwrap());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].timestamps[0], 42);
        assert_eq!(queue[1].timestamps[0], 43);
        assert_eq!(board.num_words_in_fifo().unwrap(), 5);

        board.flush().unwrap();
        assert_eq!(board.num_words_in_fifo().unwrap(), 0);
    }
}
