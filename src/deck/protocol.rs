//! RS-422 deck-control command blocks.
//!
//! Sony 9-pin style framing: CMD1 carries the command group in its upper
//! nibble and the data byte count in its lower nibble, CMD2 selects the
//! command, then the data bytes, then an additive checksum over everything
//! before it. Timecode in sense responses is BCD, frames first.

use crate::error::DeckIoError;
use crate::frame::Timecode;

/// Transport commands the session can issue
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeckCommand {
    Stop,
    Play,
    Record,
    /// Signed shuttle speed, -2.0..=2.0 of play speed
    Shuttle(f32),
    /// Signed jog step in frames
    Jog(i32),
    /// Ask the deck for its current timecode
    TimecodeSense,
}

/// Decoded response block
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeckResponse {
    Ack,
    /// Deck refused the command; error bits as sent
    Nak(u8),
    Timecode(Timecode),
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn to_bcd(value: u8) -> u8 {
    (value / 10) << 4 | (value % 10)
}

fn from_bcd(value: u8) -> Result<u8, DeckIoError> {
    let tens = value >> 4;
    let ones = value & 0x0f;
    if tens > 9 || ones > 9 {
        return Err(DeckIoError::Malformed("invalid BCD digit"));
    }
    Ok(tens * 10 + ones)
}

/// Shuttle speed data byte. The transmitted byte scales linearly over the
/// supported range; 0x20 is play speed.
fn shuttle_byte(speed: f32) -> u8 {
    let clamped = speed.abs().clamp(0.0, 2.0);
    (clamped * 32.0).round() as u8
}

/// Encode a command into a wire block, checksum appended.
pub fn encode(command: &DeckCommand) -> Vec<u8> {
    let mut block: Vec<u8> = match command {
        DeckCommand::Stop => vec![0x20, 0x00],
        DeckCommand::Play => vec![0x20, 0x01],
        DeckCommand::Record => vec![0x20, 0x02],
        DeckCommand::Shuttle(speed) => {
            let cmd2 = if *speed < 0.0 { 0x23 } else { 0x13 };
            vec![0x21, cmd2, shuttle_byte(*speed)]
        }
        DeckCommand::Jog(offset) => {
            let cmd2 = if *offset < 0 { 0x21 } else { 0x11 };
            let step = offset.unsigned_abs().min(0xff) as u8;
            vec![0x21, cmd2, step]
        }
        DeckCommand::TimecodeSense => vec![0x61, 0x0c, 0x01],
    };
    block.push(checksum(&block));
    block
}

/// Decode and checksum-verify a response block.
pub fn decode(block: &[u8]) -> Result<DeckResponse, DeckIoError> {
    if block.len() < 3 {
        return Err(DeckIoError::Malformed("response block too short"));
    }
    let (body, check) = block.split_at(block.len() - 1);
    if checksum(body) != check[0] {
        return Err(DeckIoError::Checksum);
    }
    match (body[0], body[1]) {
        (0x10, 0x01) => Ok(DeckResponse::Ack),
        (0x11, 0x12) => {
            let bits = *body.get(2).ok_or(DeckIoError::Malformed("NAK without error bits"))?;
            Ok(DeckResponse::Nak(bits))
        }
        (0x74, 0x04) => {
            if body.len() != 6 {
                return Err(DeckIoError::Malformed("timecode response wrong length"));
            }
            // frames byte carries the drop-frame bit at 0x40
            let drop_frame = body[2] & 0x40 != 0;
            Ok(DeckResponse::Timecode(Timecode {
                frames: from_bcd(body[2] & 0x3f)?,
                seconds: from_bcd(body[3] & 0x7f)?,
                minutes: from_bcd(body[4] & 0x7f)?,
                hours: from_bcd(body[5] & 0x3f)?,
                drop_frame,
            }))
        }
        _ => Err(DeckIoError::Malformed("unknown response block")),
    }
}

/// Encode a timecode response block the way a deck would send it. Used by
/// the simulator and by round-trip tests.
pub fn encode_timecode_response(timecode: &Timecode) -> Vec<u8> {
    let drop_bit = if timecode.drop_frame { 0x40 } else { 0x00 };
    let mut block = vec![
        0x74,
        0x04,
        to_bcd(timecode.frames) | drop_bit,
        to_bcd(timecode.seconds),
        to_bcd(timecode.minutes),
        to_bcd(timecode.hours),
    ];
    block.push(checksum(&block));
    block
}

pub const ACK_BLOCK: [u8; 3] = [0x10, 0x01, 0x11];

pub fn encode_nak(bits: u8) -> Vec<u8> {
    let mut block = vec![0x11, 0x12, bits];
    block.push(checksum(&block));
    block
}
