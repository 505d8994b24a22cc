//! Builders for the frames the host sends to the board.

use bytes::{BufMut, Bytes, BytesMut};

use super::{encode_u14, Command, PinMode, SysexCommand};

/// Mode bits of an I2C request, stored in bits 3-4 of the second byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cMode {
    Write = 0x00,
    ReadOnce = 0x08,
    ReadContinuously = 0x10,
    StopReading = 0x18,
}

/// Highest pin an `ANALOG_MESSAGE` can address; higher pins need
/// `EXTENDED_ANALOG`.
pub const MAX_ANALOG_MESSAGE_PIN: u8 = 0x0F;

fn sysex(command: SysexCommand, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 3);
    frame.put_u8(Command::SysexStart.byte());
    frame.put_u8(command.byte());
    frame.put_slice(payload);
    frame.put_u8(Command::SysexEnd.byte());
    frame.freeze()
}

pub fn protocol_version_query() -> Bytes {
    Bytes::copy_from_slice(&[Command::ProtocolVersion.byte()])
}

pub fn system_reset() -> Bytes {
    Bytes::copy_from_slice(&[Command::SystemReset.byte()])
}

pub fn firmware_query() -> Bytes {
    sysex(SysexCommand::ReportFirmware, &[])
}

pub fn capability_query() -> Bytes {
    sysex(SysexCommand::CapabilityQuery, &[])
}

pub fn analog_mapping_query() -> Bytes {
    sysex(SysexCommand::AnalogMappingQuery, &[])
}

pub fn pin_state_query(pin: u8) -> Bytes {
    sysex(SysexCommand::PinStateQuery, &[pin & 0x7F])
}

pub fn sampling_interval(millis: u16) -> Bytes {
    sysex(SysexCommand::SamplingInterval, &encode_u14(millis))
}

pub fn set_pin_mode(pin: u8, mode: PinMode) -> Bytes {
    Bytes::copy_from_slice(&[Command::SetPinMode.byte(), pin & 0x7F, mode.byte() & 0x7F])
}

/// Digital message carrying the output levels of the 8 pins of `port`.
pub fn digital_port(port: u8, mask: u8) -> Bytes {
    Bytes::copy_from_slice(&[
        Command::DigitalMessage.with_nibble(port),
        mask & 0x7F,
        mask >> 7,
    ])
}

pub fn analog_write(pin: u8, value: u16) -> Bytes {
    let [lsb, msb] = encode_u14(value);
    if pin <= MAX_ANALOG_MESSAGE_PIN {
        Bytes::copy_from_slice(&[Command::AnalogMessage.with_nibble(pin), lsb, msb])
    } else {
        sysex(SysexCommand::ExtendedAnalog, &[pin & 0x7F, lsb, msb])
    }
}

pub fn report_analog(channel: u8, enable: bool) -> Bytes {
    Bytes::copy_from_slice(&[Command::ReportAnalog.with_nibble(channel), u8::from(enable)])
}

pub fn report_digital(port: u8, enable: bool) -> Bytes {
    Bytes::copy_from_slice(&[Command::ReportDigital.with_nibble(port), u8::from(enable)])
}

pub fn i2c_config(delay_micros: u16) -> Bytes {
    sysex(SysexCommand::I2cConfig, &encode_u14(delay_micros))
}

/// I2C request frame for a 7-bit address. `payload` holds the bytes to write for
/// [`I2cMode::Write`] and the byte count for reads.
pub fn i2c_request(addr: u8, mode: I2cMode, reg: Option<u8>, payload: &[u16]) -> Bytes {
    let mut body = BytesMut::with_capacity(4 + payload.len() * 2);
    body.put_u8(addr & 0x7F);
    body.put_u8(mode as u8);
    if let Some(reg) = reg {
        body.put_slice(&encode_u14(u16::from(reg)));
    }
    for &value in payload {
        body.put_slice(&encode_u14(value));
    }
    sysex(SysexCommand::I2cRequest, &body)
}
