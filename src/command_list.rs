//! Command sequences uploaded to the board's auxiliary command RAM.
//!
//! Lists are built from the current [`RegisterImage`]. Only the temperature
//! sensor list changes it, leaving the sensor enabled so that every later
//! register 3 write agrees with the running sensor sequence.

use crate::command::CommandWord;
use crate::error::{Result, RhdError};
use crate::registers::{RegisterImage, ZCHECK_DAC_MIDRANGE};
use std::f64::consts::PI;

/// Capacity of one auxiliary command RAM bank.
pub const MAX_COMMAND_LENGTH: usize = 1024;

/// Length of the register configuration and temperature sensor lists.
pub const STANDARD_LIST_LENGTH: usize = 60;

/// Command index of the first ROM read (register 63) in the configuration list.
pub const ROM_READ_INDEX: usize = 18;
/// Command index of the first chip-name ROM read (register 48).
pub const CHIP_NAME_INDEX: usize = 23;
/// Command index of the first company-name ROM read (register 40).
pub const COMPANY_NAME_INDEX: usize = 31;
/// Command index of the RAM read-back of register 0.
pub const READBACK_INDEX: usize = 36;
/// Command index of the CALIBRATE (or placeholder) word.
pub const CALIBRATE_INDEX: usize = 54;

/// Auxiliary sample index at which the result of command `index` is returned.
pub const fn result_index(index: usize) -> usize {
    index + 1
}

const TEMP_CHANNELS: [i32; 3] = [32, 33, 34];
const TEMP_SENSOR_CHANNEL: i32 = 49;
const SUPPLY_SENSOR_CHANNEL: i32 = 48;

fn read(reg: i32) -> Result<CommandWord> {
    CommandWord::register_read(reg)
}

fn write_current(regs: &RegisterImage, reg: i32) -> Result<CommandWord> {
    CommandWord::register_write(reg, regs.register_value(reg))
}

impl RegisterImage {
    /// Register configuration list: programs every writable RAM register,
    /// reads back ROM and RAM, and optionally starts ADC calibration.
    pub fn configuration_command_list(&self, calibrate: bool) -> Result<Vec<CommandWord>> {
        let mut list = Vec::with_capacity(STANDARD_LIST_LENGTH);

        // dummy reads while the chip wakes up
        list.push(read(63)?);
        list.push(read(63)?);

        for reg in [0, 1, 2, 4, 5, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17] {
            list.push(write_current(self, reg)?);
        }

        for reg in [63, 62, 61, 60, 59] {
            list.push(read(reg)?);
        }
        for reg in 48..=55 {
            list.push(read(reg)?);
        }
        for reg in 40..=44 {
            list.push(read(reg)?);
        }
        for reg in 0..=17 {
            list.push(read(reg)?);
        }

        if calibrate {
            list.push(CommandWord::calibrate());
        } else {
            list.push(read(63)?);
        }

        while list.len() < STANDARD_LIST_LENGTH {
            list.push(read(63)?);
        }
        Ok(list)
    }

    /// Temperature sensor and supply voltage sampling list.
    ///
    /// Samples are taken on aux channels 32-34 while the sensor switches step
    /// through their sequence; the final eight groups only idle. Enables the
    /// sensor in `self`; the switches end open, as the list leaves them.
    pub fn temperature_sensor_command_list(&mut self) -> Result<Vec<CommandWord>> {
        self.enable_temp_sensor(true);
        let mut snapshot = self.clone();

        let mut list = Vec::with_capacity(STANDARD_LIST_LENGTH);
        let push_group = |list: &mut Vec<CommandWord>, last: CommandWord| -> Result<()> {
            for channel in TEMP_CHANNELS {
                list.push(CommandWord::convert(channel)?);
            }
            list.push(last);
            Ok(())
        };

        let mut set_switches = |s1: u8, s2: u8| -> Result<CommandWord> {
            snapshot.temp_s1 = s1;
            snapshot.temp_s2 = s2;
            write_current(&snapshot, 3)
        };

        push_group(&mut list, set_switches(1, 0)?)?;
        push_group(&mut list, set_switches(1, 1)?)?;
        push_group(&mut list, CommandWord::convert(TEMP_SENSOR_CHANNEL)?)?;
        push_group(&mut list, set_switches(0, 1)?)?;
        push_group(&mut list, CommandWord::convert(TEMP_SENSOR_CHANNEL)?)?;
        push_group(&mut list, set_switches(0, 0)?)?;
        push_group(&mut list, CommandWord::convert(SUPPLY_SENSOR_CHANNEL)?)?;

        while list.len() < STANDARD_LIST_LENGTH {
            push_group(&mut list, read(63)?)?;
        }
        Ok(list)
    }

    /// Rewrites register 3 for a full list period, so a changed digital output
    /// lands regardless of where the sequencer is.
    pub fn digital_output_command_list(&self) -> Result<Vec<CommandWord>> {
        let word = write_current(self, 3)?;
        Ok(vec![word; STANDARD_LIST_LENGTH])
    }

    /// Impedance-check DAC waveform: one period of a sine of `frequency` Hz
    /// and `amplitude` DAC steps around midrange. A zero frequency yields a
    /// full bank of the midrange value.
    pub fn zcheck_dac_command_list(&self, frequency: f64, amplitude: f64) -> Result<Vec<CommandWord>> {
        let sample_rate = self.sample_rate();
        if !(0.0..=128.0).contains(&amplitude) {
            return Err(RhdError::out_of_range("amplitude", amplitude));
        }
        if !(0.0..=sample_rate / 4.0).contains(&frequency) {
            return Err(RhdError::out_of_range("frequency", frequency));
        }

        if frequency == 0.0 {
            let word = CommandWord::register_write(6, ZCHECK_DAC_MIDRANGE)?;
            return Ok(vec![word; MAX_COMMAND_LENGTH]);
        }

        let period = (sample_rate / frequency + 0.5).floor() as usize;
        if period > MAX_COMMAND_LENGTH {
            return Err(RhdError::out_of_range("frequency", frequency));
        }

        let dt = 1.0 / sample_rate;
        let mut t = 0.0;
        let mut list = Vec::with_capacity(period);
        for _ in 0..period {
            let value = (amplitude * (2.0 * PI * frequency * t).sin()
                + ZCHECK_DAC_MIDRANGE as f64
                + 0.5)
                .floor()
                .clamp(0.0, 255.0);
            list.push(CommandWord::register_write(6, value as i32)?);
            t += dt;
        }
        Ok(list)
    }
}

/// `n` copies of `command`, used to fill unused aux slots.
pub fn dummy_command_list(n: usize, command: CommandWord) -> Vec<CommandWord> {
    vec![command; n]
}
