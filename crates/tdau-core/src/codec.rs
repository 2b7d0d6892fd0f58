//! Register protocol codec.
//!
//! TDAU registers hold IEEE-754 single precision values. On the command surface a
//! register is exchanged as an 8 character, uppercase, big-endian hex word
//! (`"3F800000"` is `1.0`). Writes go out one byte per address, so a word also
//! has to be split into its four bytes in wire order.
//!
//! Board memory is little-endian: the least significant byte of a word sits at
//! the lowest address. [`register_word_memory_bytes`] and
//! [`register_hex_from_le_bytes`] convert between the word and memory order.
//!
//! Per-channel registers are laid out as `base + outer * channel + inner * slot`.
//! The strides depend on the register family and are passed in by the caller;
//! [`RegisterStride::CURRENT`] and [`RegisterStride::VOLTAGE`] are the two
//! families the bench uses.

use crate::error::FormatError;

/// Commanded emitter current, stride [`RegisterStride::CURRENT`].
pub const COMMANDED_CURRENT_BASE: u16 = 68;
/// Base-emitter voltage Vbe[n], stride [`RegisterStride::VOLTAGE`].
pub const VBE_BASE: u16 = 1090;
/// Base current Ib[n], stride [`RegisterStride::VOLTAGE`].
pub const IB_BASE: u16 = 1094;
/// Measured emitter current Ie[n], stride [`RegisterStride::CURRENT`].
pub const IE_MEASURED_BASE: u16 = 1036;
/// Emitter leakage current, stride [`RegisterStride::CURRENT`].
pub const IE_LEAK_BASE: u16 = 944;
/// Base leakage current, stride [`RegisterStride::CURRENT`].
pub const IB_LEAK_BASE: u16 = 896;
/// Identity float read once on connect.
pub const IDENTITY_REGISTER: u16 = 0x54;
/// Control word occupies registers `0..CONTROL_WORD_LEN`.
pub const CONTROL_WORD_LEN: usize = 8;

/// Channel and slot multipliers for one register family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterStride {
    pub channel: u16,
    pub slot: u16,
}

impl RegisterStride {
    /// Commanded, measured and leakage currents.
    pub const CURRENT: Self = Self {
        channel: 12,
        slot: 4,
    };
    /// Vbe / Ib readings.
    pub const VOLTAGE: Self = Self {
        channel: 26,
        slot: 8,
    };
}

/// Serialize a float to its big-endian register word.
pub fn float_to_register_hex(value: f32) -> String {
    format!("{:08X}", value.to_bits())
}

/// Parse a big-endian register word.
///
/// # Errors
///
/// [`FormatError::WrongLength`] unless the input is exactly 8 characters,
/// [`FormatError::NotHex`] if any of them is not a hex digit.
pub fn register_hex_to_float(hex: &str) -> Result<f32, FormatError> {
    parse_word(hex).map(f32::from_bits)
}

/// Split a register word into the four bytes written to consecutive
/// addresses, lowest address first.
pub fn register_word_memory_bytes(hex: &str) -> Result<[u8; 4], FormatError> {
    parse_word(hex).map(u32::to_le_bytes)
}

/// Build the register word for a value stored little-endian in device memory.
pub fn register_hex_from_le_bytes(bytes: [u8; 4]) -> String {
    format!("{:08X}", u32::from_le_bytes(bytes))
}

/// Address of `slot` on `channel` for a register family.
pub fn channel_address(base: u16, channel: u8, slot: u8, stride: RegisterStride) -> u16 {
    base + stride.channel * u16::from(channel) + stride.slot * u16::from(slot)
}

fn parse_word(hex: &str) -> Result<u32, FormatError> {
    let len = hex.chars().count();
    if len != 8 {
        return Err(FormatError::WrongLength {
            len,
            input: hex.to_string(),
        });
    }
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FormatError::NotHex(hex.to_string()));
    }
    u32::from_str_radix(hex, 16).map_err(|_| FormatError::NotHex(hex.to_string()))
}
