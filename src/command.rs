//! RHD2000 SPI command words.
//!
//! Every SPI transaction to the chip is a single 16-bit MOSI word:
//!
//! | Kind              | Bits                  |
//! |-------------------|-----------------------|
//! | CONVERT           | `00cccccc 0000000h`   |
//! | REGISTER READ     | `11rrrrrr 00000000`   |
//! | REGISTER WRITE    | `10rrrrrr dddddddd`   |
//! | CALIBRATE         | `0x5500`              |
//! | CLEAR CALIBRATION | `0x6a00`              |

use crate::error::{Result, RhdError};
use std::fmt;

const CALIBRATE_WORD: u16 = 0x5500;
const CLEAR_CALIBRATION_WORD: u16 = 0x6a00;

const KIND_MASK: u16 = 0xc000;
const CONVERT_BITS: u16 = 0x0000;
const READ_BITS: u16 = 0xc000;
const WRITE_BITS: u16 = 0x8000;

/// Highest channel or register address reachable by a command word.
pub const MAX_ADDRESS: i32 = 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Convert,
    RegisterRead,
    RegisterWrite,
    Calibrate,
    ClearCalibration,
}

/// One 16-bit MOSI word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandWord(u16);

/// Human-oriented classification of a command word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodedCommand {
    Convert { channel: u8, dsp_settle: bool },
    RegisterRead { register: u8 },
    RegisterWrite { register: u8, data: u8 },
    Calibrate,
    ClearCalibration,
    Invalid(u16),
}

fn check_address(parameter: &'static str, value: i32) -> Result<u16> {
    if !(0..=MAX_ADDRESS).contains(&value) {
        return Err(RhdError::out_of_range(parameter, value));
    }
    Ok(value as u16)
}

impl CommandWord {
    /// Builds a command that takes no operand (CALIBRATE or CLEAR CALIBRATION).
    pub fn build0(kind: CommandKind) -> Result<Self> {
        match kind {
            CommandKind::Calibrate => Ok(Self::calibrate()),
            CommandKind::ClearCalibration => Ok(Self::clear_calibration()),
            _ => Err(RhdError::InvalidArgument(format!(
                "{kind:?} takes operands; only Calibrate and ClearCalibration take none"
            ))),
        }
    }

    /// Builds a single-operand command (CONVERT channel or REGISTER READ address).
    pub fn build1(kind: CommandKind, arg1: i32) -> Result<Self> {
        match kind {
            CommandKind::Convert => Self::convert(arg1),
            CommandKind::RegisterRead => Self::register_read(arg1),
            _ => Err(RhdError::InvalidArgument(format!(
                "{kind:?} does not take a single operand"
            ))),
        }
    }

    /// Builds a REGISTER WRITE, the only two-operand command.
    pub fn build2(kind: CommandKind, arg1: i32, arg2: i32) -> Result<Self> {
        match kind {
            CommandKind::RegisterWrite => Self::register_write(arg1, arg2),
            _ => Err(RhdError::InvalidArgument(format!(
                "{kind:?} does not take two operands"
            ))),
        }
    }

    pub fn convert(channel: i32) -> Result<Self> {
        let channel = check_address("channel", channel)?;
        Ok(Self(CONVERT_BITS | (channel << 8)))
    }

    /// CONVERT with the H bit set, which resets the DSP offset-removal filter
    /// on the converted channel.
    pub fn convert_with_dsp_settle(channel: i32) -> Result<Self> {
        Ok(Self(Self::convert(channel)?.0 | 0x0001))
    }

    pub fn register_read(register: i32) -> Result<Self> {
        let register = check_address("register", register)?;
        Ok(Self(READ_BITS | (register << 8)))
    }

    pub fn register_write(register: i32, data: i32) -> Result<Self> {
        let register = check_address("register", register)?;
        if !(0..=255).contains(&data) {
            return Err(RhdError::out_of_range("data", data));
        }
        Ok(Self(WRITE_BITS | (register << 8) | data as u16))
    }

    pub const fn calibrate() -> Self {
        Self(CALIBRATE_WORD)
    }

    pub const fn clear_calibration() -> Self {
        Self(CLEAR_CALIBRATION_WORD)
    }

    /// Wraps a raw word without validation, e.g. one read back from command RAM.
    pub const fn from_raw(word: u16) -> Self {
        Self(word)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Best-effort classification for diagnostics. Never fails: words that
    /// match no template decode to [`DecodedCommand::Invalid`].
    pub fn decode(self) -> DecodedCommand {
        let word = self.0;
        let address = ((word & 0x3f00) >> 8) as u8;
        let low = (word & 0x00ff) as u8;
        match word & KIND_MASK {
            CONVERT_BITS if low & 0xfe == 0 => DecodedCommand::Convert {
                channel: address,
                dsp_settle: low & 0x01 != 0,
            },
            READ_BITS if low == 0 => DecodedCommand::RegisterRead { register: address },
            WRITE_BITS => DecodedCommand::RegisterWrite {
                register: address,
                data: low,
            },
            _ if word == CALIBRATE_WORD => DecodedCommand::Calibrate,
            _ if word == CLEAR_CALIBRATION_WORD => DecodedCommand::ClearCalibration,
            _ => DecodedCommand::Invalid(word),
        }
    }
}

impl From<CommandWord> for u16 {
    fn from(word: CommandWord) -> u16 {
        word.0
    }
}

impl fmt::Display for DecodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DecodedCommand::Convert {
                channel,
                dsp_settle: false,
            } => write!(f, "CONVERT({channel})"),
            DecodedCommand::Convert {
                channel,
                dsp_settle: true,
            } => write!(f, "CONVERT({channel},H)"),
            DecodedCommand::RegisterRead { register } => write!(f, "READ({register})"),
            DecodedCommand::RegisterWrite { register, data } => {
                write!(f, "WRITE({register},0x{data:02X})")
            }
            DecodedCommand::Calibrate => write!(f, "CALIBRATE"),
            DecodedCommand::ClearCalibration => write!(f, "CLEAR"),
            DecodedCommand::Invalid(word) => write!(f, "INVALID COMMAND: 0x{word:04x}"),
        }
    }
}

impl fmt::Display for CommandWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.decode().fmt(f)
    }
}

/// Renders a command list one word per line, as uploaded to command RAM.
pub fn format_command_list(list: &[CommandWord]) -> String {
    let mut out = String::new();
    for (i, word) in list.iter().enumerate() {
        out.push_str(&format!("  command[{i}] = {word}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_round_trips_every_channel() {
        for c in 0..=63 {
            let word = CommandWord::build1(CommandKind::Convert, c).unwrap();
            assert_eq!(
                word.decode(),
                DecodedCommand::Convert {
                    channel: c as u8,
                    dsp_settle: false
                }
            );
        }
    }

    #[test]
    fn write_round_trips_every_register_and_byte() {
        for r in 0..=63 {
            for d in [0, 1, 0x7f, 0x80, 0xaa, 255] {
                let word = CommandWord::build2(CommandKind::RegisterWrite, r, d).unwrap();
                assert_eq!(
                    word.decode(),
                    DecodedCommand::RegisterWrite {
                        register: r as u8,
                        data: d as u8
                    }
                );
            }
        }
    }

    #[test]
    fn bit_patterns() {
        assert_eq!(CommandWord::convert(5).unwrap().raw(), 0x0500);
        assert_eq!(CommandWord::convert_with_dsp_settle(5).unwrap().raw(), 0x0501);
        assert_eq!(CommandWord::register_read(63).unwrap().raw(), 0xff00);
        assert_eq!(CommandWord::register_write(4, 0x9e).unwrap().raw(), 0x849e);
        assert_eq!(CommandWord::calibrate().raw(), 0x5500);
        assert_eq!(CommandWord::clear_calibration().raw(), 0x6a00);
    }

    #[test]
    fn out_of_range_operands() {
        assert!(matches!(
            CommandWord::build1(CommandKind::Convert, 64),
            Err(RhdError::OutOfRange { parameter: "channel", .. })
        ));
        assert!(matches!(
            CommandWord::build1(CommandKind::RegisterRead, -1),
            Err(RhdError::OutOfRange { .. })
        ));
        assert!(matches!(
            CommandWord::build2(CommandKind::RegisterWrite, 0, 256),
            Err(RhdError::OutOfRange { parameter: "data", .. })
        ));
        assert!(matches!(
            CommandWord::build2(CommandKind::RegisterWrite, 64, 0),
            Err(RhdError::OutOfRange { parameter: "register", .. })
        ));
    }

    #[test]
    fn wrong_arity_is_invalid_argument() {
        assert!(matches!(
            CommandWord::build0(CommandKind::Convert),
            Err(RhdError::InvalidArgument(_))
        ));
        assert!(matches!(
            CommandWord::build1(CommandKind::Calibrate, 0),
            Err(RhdError::InvalidArgument(_))
        ));
        assert!(matches!(
            CommandWord::build2(CommandKind::RegisterRead, 0, 0),
            Err(RhdError::InvalidArgument(_))
        ));
        assert_eq!(
            CommandWord::build0(CommandKind::Calibrate).unwrap(),
            CommandWord::calibrate()
        );
    }

    #[test]
    fn decode_constants_and_garbage() {
        assert_eq!(CommandWord::from_raw(0x5500).decode(), DecodedCommand::Calibrate);
        assert_eq!(
            CommandWord::from_raw(0x6a00).decode(),
            DecodedCommand::ClearCalibration
        );
        assert_eq!(
            CommandWord::from_raw(0x4000).decode(),
            DecodedCommand::Invalid(0x4000)
        );
        // READ with a non-zero data byte matches no template
        assert_eq!(
            CommandWord::from_raw(0xc012).decode(),
            DecodedCommand::Invalid(0xc012)
        );
        assert_eq!(
            CommandWord::from_raw(0x0310).decode(),
            DecodedCommand::Invalid(0x0310)
        );
    }

    #[test]
    fn listing() {
        let list = [
            CommandWord::register_read(63).unwrap(),
            CommandWord::register_write(0, 0xde).unwrap(),
            CommandWord::calibrate(),
        ];
        assert_eq!(
            format_command_list(&list),
            "  command[0] = READ(63)\n  command[1] = WRITE(0,0xDE)\n  command[2] = CALIBRATE\n"
        );
    }
}
