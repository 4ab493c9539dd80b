//! Decoding of raw USB data blocks into [`SampleBlock`]s and encoding of
//! blocks into the flat on-disk sample format.

use crate::command_list::{
    result_index, CHIP_NAME_INDEX, COMPANY_NAME_INDEX, READBACK_INDEX, ROM_READ_INDEX,
};
use crate::error::{Result, RhdError};
use crate::registers::NUM_RAM_REGISTERS;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame marker that opens every sample in a USB data block.
pub const USB_HEADER_MAGIC: u64 = 0xc691_1999_2702_1942;

pub const CHANNELS_PER_STREAM: usize = 32;
pub const AUX_SLOTS: usize = 3;
pub const BOARD_ADC_CHANNELS: usize = 8;

/// Aux slot carrying the temperature sensor list results.
pub const TEMPERATURE_AUX_SLOT: usize = 1;
/// Aux slot carrying the register configuration list results.
pub const CONFIG_AUX_SLOT: usize = 2;

const AMPLIFIER_MICROVOLTS_PER_STEP: f64 = 0.195;
const AMPLIFIER_ZERO: f64 = 32768.0;
const AUX_INPUT_VOLTS_PER_STEP: f64 = 37.4e-6;
const BOARD_ADC_VOLTS_PER_STEP: f64 = 50.354e-6;
const SUPPLY_VOLTS_PER_STEP: f64 = 74.8e-6;
const TEMPERATURE_STEPS_PER_KELVIN: f64 = 98.9;

/// USB interface generation; fixes the samples per block and stream limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsbGeneration {
    Legacy,
    HighThroughput,
}

impl UsbGeneration {
    pub const fn samples_per_block(self) -> usize {
        match self {
            UsbGeneration::Legacy => 60,
            UsbGeneration::HighThroughput => 256,
        }
    }

    pub const fn max_streams(self) -> usize {
        match self {
            UsbGeneration::Legacy => 8,
            UsbGeneration::HighThroughput => 16,
        }
    }
}

impl fmt::Display for UsbGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbGeneration::Legacy => write!(f, "legacy"),
            UsbGeneration::HighThroughput => write!(f, "high_throughput"),
        }
    }
}

/// 16-bit words in one sample of the USB stream.
pub const fn words_per_sample(num_streams: usize) -> usize {
    // magic, timestamp, 3 aux + 32 amp + 1 filler per stream, ADCs, TTL in/out
    4 + 2 + 36 * num_streams + BOARD_ADC_CHANNELS + 2
}

/// 16-bit words in one USB data block.
pub const fn words_per_block(num_streams: usize, generation: UsbGeneration) -> usize {
    generation.samples_per_block() * words_per_sample(num_streams)
}

/// Bytes in one USB data block.
pub const fn bytes_per_block(num_streams: usize, generation: UsbGeneration) -> usize {
    2 * words_per_block(num_streams, generation)
}

/// True if the eight bytes at `index` hold the frame marker.
pub fn check_usb_header(buffer: &[u8], index: usize) -> bool {
    read_u64(buffer, index) == USB_HEADER_MAGIC
}

fn read_u64(buffer: &[u8], index: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[index..index + 8]);
    u64::from_le_bytes(bytes)
}

/// Little-endian 32-bit timestamp at `index`.
pub fn convert_usb_timestamp(buffer: &[u8], index: usize) -> u32 {
    u32::from_le_bytes([
        buffer[index],
        buffer[index + 1],
        buffer[index + 2],
        buffer[index + 3],
    ])
}

/// Little-endian 16-bit word at `index`.
pub fn convert_usb_word(buffer: &[u8], index: usize) -> u16 {
    u16::from_le_bytes([buffer[index], buffer[index + 1]])
}

/// Amplifier code to microvolts.
pub fn amplifier_microvolts(code: u16) -> f64 {
    AMPLIFIER_MICROVOLTS_PER_STEP * (code as f64 - AMPLIFIER_ZERO)
}

/// Auxiliary input ADC code to volts.
pub fn aux_input_volts(code: u16) -> f64 {
    AUX_INPUT_VOLTS_PER_STEP * code as f64
}

/// Evaluation board ADC code to volts.
pub fn board_adc_volts(code: u16) -> f64 {
    BOARD_ADC_VOLTS_PER_STEP * code as f64
}

/// Identification read from a chip's ROM registers by the configuration list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChipInfo {
    pub chip_id: u8,
    pub num_amplifiers: u8,
    pub bipolar: bool,
    pub die_revision: u8,
    pub miso_marker: u8,
    pub chip_name: String,
    pub company_name: String,
}

/// One block of samples from every enabled data stream.
///
/// Array axes are `(stream, channel, sample)` for `amplifier`,
/// `(stream, slot, sample)` for `aux` and `(channel, sample)` for `board_adc`.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBlock {
    num_streams: usize,
    generation: UsbGeneration,
    pub timestamps: Vec<u32>,
    pub amplifier: Array3<u16>,
    pub aux: Array3<u16>,
    pub board_adc: Array2<u16>,
    pub ttl_in: Vec<u16>,
    pub ttl_out: Vec<u16>,
}

impl SampleBlock {
    pub fn new(num_streams: usize, generation: UsbGeneration) -> Result<Self> {
        if num_streams == 0 || num_streams > generation.max_streams() {
            return Err(RhdError::out_of_range("num_streams", num_streams as f64));
        }
        let samples = generation.samples_per_block();
        Ok(SampleBlock {
            num_streams,
            generation,
            timestamps: vec![0; samples],
            amplifier: Array3::zeros((num_streams, CHANNELS_PER_STREAM, samples)),
            aux: Array3::zeros((num_streams, AUX_SLOTS, samples)),
            board_adc: Array2::zeros((BOARD_ADC_CHANNELS, samples)),
            ttl_in: vec![0; samples],
            ttl_out: vec![0; samples],
        })
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    pub fn generation(&self) -> UsbGeneration {
        self.generation
    }

    pub fn samples_per_block(&self) -> usize {
        self.generation.samples_per_block()
    }

    fn sample_offsets(&self, block_index: usize) -> impl Iterator<Item = usize> {
        let bytes_per_sample = 2 * words_per_sample(self.num_streams);
        let start = block_index * bytes_per_block(self.num_streams, self.generation);
        (0..self.samples_per_block()).map(move |t| start + t * bytes_per_sample)
    }

    /// Decodes block number `block_index` of `buffer` into `self`.
    ///
    /// Every sample's frame marker is checked before any field is written,
    /// so on [`RhdError::SyncLost`] the block is unchanged.
    ///
    /// # Panics
    ///
    /// If `buffer` is shorter than `(block_index + 1)` blocks.
    pub fn fill_from_usb_buffer(&mut self, buffer: &[u8], block_index: usize) -> Result<()> {
        for (sample, index) in self.sample_offsets(block_index).enumerate() {
            let found = read_u64(buffer, index);
            if found != USB_HEADER_MAGIC {
                return Err(RhdError::SyncLost {
                    block: block_index,
                    sample,
                    found,
                });
            }
        }

        let streams = self.num_streams;
        let offsets: Vec<usize> = self.sample_offsets(block_index).collect();
        for (t, mut index) in offsets.into_iter().enumerate() {
            index += 8;
            self.timestamps[t] = convert_usb_timestamp(buffer, index);
            index += 4;

            for slot in 0..AUX_SLOTS {
                for stream in 0..streams {
                    self.aux[[stream, slot, t]] = convert_usb_word(buffer, index);
                    index += 2;
                }
            }

            for channel in 0..CHANNELS_PER_STREAM {
                for stream in 0..streams {
                    self.amplifier[[stream, channel, t]] = convert_usb_word(buffer, index);
                    index += 2;
                }
            }

            // filler word per stream
            index += 2 * streams;

            for channel in 0..BOARD_ADC_CHANNELS {
                self.board_adc[[channel, t]] = convert_usb_word(buffer, index);
                index += 2;
            }

            self.ttl_in[t] = convert_usb_word(buffer, index);
            index += 2;
            self.ttl_out[t] = convert_usb_word(buffer, index);
        }
        Ok(())
    }

    /// Appends the on-disk encoding of the first `num_streams` streams to `out`.
    pub fn encode_into(&self, num_streams: usize, out: &mut Vec<u8>) -> Result<()> {
        if num_streams > self.num_streams {
            return Err(RhdError::out_of_range("num_streams", num_streams as f64));
        }
        let samples = self.samples_per_block();
        out.reserve(samples * 2 * (1 + (CHANNELS_PER_STREAM + AUX_SLOTS) * num_streams + 10));

        let mut put = |word: u16| out.extend_from_slice(&word.to_le_bytes());
        for t in 0..samples {
            put(self.timestamps[t] as u16);
            for channel in 0..CHANNELS_PER_STREAM {
                for stream in 0..num_streams {
                    put(self.amplifier[[stream, channel, t]]);
                }
            }
            for slot in 0..AUX_SLOTS {
                for stream in 0..num_streams {
                    put(self.aux[[stream, slot, t]]);
                }
            }
            for channel in 0..BOARD_ADC_CHANNELS {
                put(self.board_adc[[channel, t]]);
            }
            put(self.ttl_in[t]);
            put(self.ttl_out[t]);
        }
        Ok(())
    }

    pub fn encode(&self, num_streams: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(num_streams, &mut out)?;
        Ok(out)
    }

    /// Appends this block in USB wire layout, filler words zeroed.
    ///
    /// Used to synthesize captures for replay.
    pub fn write_usb_frame(&self, out: &mut Vec<u8>) {
        let streams = self.num_streams;
        let mut put = |word: u16| out.extend_from_slice(&word.to_le_bytes());
        for t in 0..self.samples_per_block() {
            for chunk in USB_HEADER_MAGIC.to_le_bytes().chunks(2) {
                put(u16::from_le_bytes([chunk[0], chunk[1]]));
            }
            put(self.timestamps[t] as u16);
            put((self.timestamps[t] >> 16) as u16);
            for slot in 0..AUX_SLOTS {
                for stream in 0..streams {
                    put(self.aux[[stream, slot, t]]);
                }
            }
            for channel in 0..CHANNELS_PER_STREAM {
                for stream in 0..streams {
                    put(self.amplifier[[stream, channel, t]]);
                }
            }
            for _ in 0..streams {
                put(0);
            }
            for channel in 0..BOARD_ADC_CHANNELS {
                put(self.board_adc[[channel, t]]);
            }
            put(self.ttl_in[t]);
            put(self.ttl_out[t]);
        }
    }

    fn aux_result(&self, stream: usize, slot: usize, command_index: usize) -> u16 {
        self.aux[[stream, slot, result_index(command_index)]]
    }

    fn aux_ascii(&self, stream: usize, first_command: usize, len: usize) -> String {
        (first_command..first_command + len)
            .map(|i| (self.aux_result(stream, CONFIG_AUX_SLOT, i) & 0xff) as u8)
            .take_while(|&b| b != 0)
            .map(char::from)
            .collect()
    }

    /// ROM identification of the chip on `stream`, valid for a block in which
    /// the configuration list ran from its start on the config aux slot.
    pub fn chip_info(&self, stream: usize) -> ChipInfo {
        let rom = |k: usize| (self.aux_result(stream, CONFIG_AUX_SLOT, ROM_READ_INDEX + k) & 0xff) as u8;
        ChipInfo {
            chip_id: rom(0),
            num_amplifiers: rom(1),
            bipolar: rom(2) != 0,
            die_revision: rom(3),
            miso_marker: rom(4),
            chip_name: self.aux_ascii(stream, CHIP_NAME_INDEX, 8),
            company_name: self.aux_ascii(stream, COMPANY_NAME_INDEX, 5),
        }
    }

    /// Values of RAM registers 0-17 as read back by the configuration list.
    pub fn register_readback(&self, stream: usize) -> [u8; NUM_RAM_REGISTERS] {
        let mut out = [0u8; NUM_RAM_REGISTERS];
        for (reg, value) in out.iter_mut().enumerate() {
            *value = (self.aux_result(stream, CONFIG_AUX_SLOT, READBACK_INDEX + reg) & 0xff) as u8;
        }
        out
    }

    /// Die temperature in degrees Celsius from the temperature sensor list.
    pub fn temperature_celsius(&self, stream: usize) -> f64 {
        let temp_a = self.aux_result(stream, TEMPERATURE_AUX_SLOT, 11) as f64;
        let temp_b = self.aux_result(stream, TEMPERATURE_AUX_SLOT, 19) as f64;
        (temp_b - temp_a) / TEMPERATURE_STEPS_PER_KELVIN - 273.15
    }

    /// Chip supply voltage in volts from the temperature sensor list.
    pub fn supply_voltage(&self, stream: usize) -> f64 {
        SUPPLY_VOLTS_PER_STEP * self.aux_result(stream, TEMPERATURE_AUX_SLOT, 27) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_block(streams: usize, generation: UsbGeneration) -> SampleBlock {
        let mut rng = rand::rng();
        let mut block = SampleBlock::new(streams, generation).unwrap();
        for (t, ts) in block.timestamps.iter_mut().enumerate() {
            *ts = 0x0001_0000 + t as u32;
        }
        block.amplifier.mapv_inplace(|_| rng.random());
        block.aux.mapv_inplace(|_| rng.random());
        block.board_adc.mapv_inplace(|_| rng.random());
        for t in 0..block.samples_per_block() {
            block.ttl_in[t] = rng.random();
            block.ttl_out[t] = rng.random();
        }
        block
    }

    #[test]
    fn block_sizes() {
        assert_eq!(words_per_block(8, UsbGeneration::Legacy), 18240);
        assert_eq!(words_per_block(1, UsbGeneration::Legacy), 60 * 52);
        assert_eq!(words_per_block(16, UsbGeneration::HighThroughput), 256 * 592);
        assert_eq!(bytes_per_block(2, UsbGeneration::Legacy), 2 * 60 * 88);
    }

    #[test]
    fn stream_limits() {
        assert!(SampleBlock::new(8, UsbGeneration::Legacy).is_ok());
        assert!(matches!(
            SampleBlock::new(9, UsbGeneration::Legacy),
            Err(RhdError::OutOfRange { .. })
        ));
        assert!(SampleBlock::new(16, UsbGeneration::HighThroughput).is_ok());
        assert!(SampleBlock::new(0, UsbGeneration::HighThroughput).is_err());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn oversized_stream_count_is_reported_exactly() {
        let streams = u32::MAX as usize + 2;
        assert_eq!(
            SampleBlock::new(streams, UsbGeneration::Legacy),
            Err(RhdError::OutOfRange {
                parameter: "num_streams",
                value: 4294967297.0
            })
        );
        let block = SampleBlock::new(1, UsbGeneration::Legacy).unwrap();
        assert_eq!(
            block.encode(streams),
            Err(RhdError::OutOfRange {
                parameter: "num_streams",
                value: 4294967297.0
            })
        );
    }

    #[test]
    fn magic_bytes() {
        let mut buf = USB_HEADER_MAGIC.to_le_bytes().to_vec();
        assert_eq!(buf, [0x42, 0x19, 0x02, 0x27, 0x99, 0x19, 0x91, 0xc6]);
        assert!(check_usb_header(&buf, 0));
        buf[3] ^= 0x01;
        assert!(!check_usb_header(&buf, 0));
    }

    #[test]
    fn little_endian_helpers() {
        let buf = [0x78, 0x56, 0x34, 0x12];
        assert_eq!(convert_usb_timestamp(&buf, 0), 0x1234_5678);
        assert_eq!(convert_usb_word(&buf, 1), 0x3456);
    }

    #[test]
    fn decodes_wire_layout() {
        for (streams, generation) in [
            (1, UsbGeneration::Legacy),
            (3, UsbGeneration::Legacy),
            (2, UsbGeneration::HighThroughput),
        ] {
            let source = random_block(streams, generation);
            let mut buf = Vec::new();
            source.write_usb_frame(&mut buf);
            assert_eq!(buf.len(), bytes_per_block(streams, generation));

            let mut decoded = SampleBlock::new(streams, generation).unwrap();
            decoded.fill_from_usb_buffer(&buf, 0).unwrap();
            assert_eq!(decoded, source);
        }
    }

    #[test]
    fn interleave_is_stream_minor() {
        let mut buf = Vec::new();
        let mut block = SampleBlock::new(2, UsbGeneration::Legacy).unwrap();
        block.aux[[1, 0, 0]] = 0xaaaa;
        block.amplifier[[0, 1, 0]] = 0xbbbb;
        block.write_usb_frame(&mut buf);
        // magic 8 + timestamp 4, then aux slot 0 stream 0, aux slot 0 stream 1
        assert_eq!(convert_usb_word(&buf, 14), 0xaaaa);
        // after 6 aux words: amp ch0 s0, ch0 s1, ch1 s0
        assert_eq!(convert_usb_word(&buf, 12 + 12 + 4), 0xbbbb);
    }

    #[test]
    fn decodes_second_block_of_buffer() {
        let first = random_block(2, UsbGeneration::Legacy);
        let second = random_block(2, UsbGeneration::Legacy);
        let mut buf = Vec::new();
        first.write_usb_frame(&mut buf);
        second.write_usb_frame(&mut buf);

        let mut decoded = SampleBlock::new(2, UsbGeneration::Legacy).unwrap();
        decoded.fill_from_usb_buffer(&buf, 1).unwrap();
        assert_eq!(decoded, second);
    }

    #[test]
    fn corrupt_magic_leaves_block_unchanged() {
        let source = random_block(1, UsbGeneration::Legacy);
        let mut clean = Vec::new();
        source.write_usb_frame(&mut clean);
        let bytes_per_sample = 2 * words_per_sample(1);

        for (sample, byte) in [(0, 0), (0, 7), (30, 4), (59, 2)] {
            let mut buf = clean.clone();
            buf[sample * bytes_per_sample + byte] ^= 0xff;

            let mut block = SampleBlock::new(1, UsbGeneration::Legacy).unwrap();
            let pristine = block.clone();
            let err = block.fill_from_usb_buffer(&buf, 0).unwrap_err();
            assert!(
                matches!(err, RhdError::SyncLost { block: 0, sample: s, .. } if s == sample),
                "{err}"
            );
            assert_eq!(block, pristine);
        }
    }

    #[test]
    #[should_panic]
    fn short_buffer_panics() {
        let mut block = SampleBlock::new(1, UsbGeneration::Legacy).unwrap();
        let mut buf = Vec::new();
        block.write_usb_frame(&mut buf);
        buf.pop();
        let _ = block.fill_from_usb_buffer(&buf, 0);
    }

    #[test]
    fn golden_encoding() {
        let mut block = SampleBlock::new(2, UsbGeneration::Legacy).unwrap();
        block.timestamps[0] = 0x0012_3456;
        block.amplifier[[0, 0, 0]] = 0x0101;
        block.amplifier[[1, 0, 0]] = 0x0202;
        block.amplifier[[0, 1, 0]] = 0x0303;
        block.aux[[0, 0, 0]] = 0x0a0a;
        block.aux[[1, 0, 0]] = 0x0b0b;
        block.aux[[0, 2, 0]] = 0x0c0c;
        block.board_adc[[0, 0]] = 0x1111;
        block.board_adc[[7, 0]] = 0x8888;
        block.ttl_in[0] = 0x00f0;
        block.ttl_out[0] = 0xf000;

        let bytes = block.encode(2).unwrap();
        let words_per_sample = 1 + 2 * 32 + 2 * 3 + 8 + 2;
        assert_eq!(bytes.len(), 60 * 2 * words_per_sample);

        let word = |i: usize| u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        assert_eq!(word(0), 0x3456);
        assert_eq!(word(1), 0x0101);
        assert_eq!(word(2), 0x0202);
        assert_eq!(word(3), 0x0303);
        assert_eq!(word(4), 0x0000);
        assert_eq!(word(65), 0x0a0a);
        assert_eq!(word(66), 0x0b0b);
        assert_eq!(word(69), 0x0c0c);
        assert_eq!(word(71), 0x1111);
        assert_eq!(word(78), 0x8888);
        assert_eq!(word(79), 0x00f0);
        assert_eq!(word(80), 0xf000);
        assert_eq!(word(81), 0x0000);

        // first stream only
        let narrow = block.encode(1).unwrap();
        assert_eq!(narrow.len(), 60 * 2 * (1 + 32 + 3 + 8 + 2));
        assert!(matches!(
            block.encode(3),
            Err(RhdError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rom_and_readback_decoding() {
        let mut block = SampleBlock::new(2, UsbGeneration::Legacy).unwrap();
        let stream = 1;
        let mut set = |command: usize, value: u16| {
            block.aux[[stream, CONFIG_AUX_SLOT, result_index(command)]] = value;
        };
        for (k, v) in [1u16, 32, 1, 0, 0x35].into_iter().enumerate() {
            set(ROM_READ_INDEX + k, v);
        }
        for (k, c) in "RHD2132".bytes().enumerate() {
            set(CHIP_NAME_INDEX + k, c as u16);
        }
        for (k, c) in "INTAN".bytes().enumerate() {
            set(COMPANY_NAME_INDEX + k, c as u16);
        }
        for reg in 0..NUM_RAM_REGISTERS {
            set(READBACK_INDEX + reg, 0x100 | reg as u16);
        }

        let info = block.chip_info(stream);
        assert_eq!(
            info,
            ChipInfo {
                chip_id: 1,
                num_amplifiers: 32,
                bipolar: true,
                die_revision: 0,
                miso_marker: 0x35,
                chip_name: "RHD2132".to_string(),
                company_name: "INTAN".to_string(),
            }
        );
        let readback = block.register_readback(stream);
        for (reg, value) in readback.iter().enumerate() {
            assert_eq!(*value as usize, reg);
        }
        assert_eq!(block.chip_info(0).chip_name, "");
    }

    #[test]
    fn sensor_conversions() {
        let mut block = SampleBlock::new(1, UsbGeneration::Legacy).unwrap();
        block.aux[[0, TEMPERATURE_AUX_SLOT, 12]] = 1000;
        block.aux[[0, TEMPERATURE_AUX_SLOT, 20]] = 1000 + 29_650;
        block.aux[[0, TEMPERATURE_AUX_SLOT, 28]] = 44_118;
        let celsius = block.temperature_celsius(0);
        assert!((celsius - 26.64).abs() < 0.01, "{celsius}");
        let volts = block.supply_voltage(0);
        assert!((volts - 3.3).abs() < 0.001, "{volts}");

        assert_eq!(amplifier_microvolts(32768), 0.0);
        assert!((amplifier_microvolts(32769) - 0.195).abs() < 1e-12);
        assert!((aux_input_volts(1000) - 0.0374).abs() < 1e-12);
        assert!((board_adc_volts(1000) - 0.050354).abs() < 1e-12);
    }
}
