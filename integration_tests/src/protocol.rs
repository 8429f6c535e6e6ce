//! Protocol definitions matching the firmware.

#![allow(dead_code)]

/// Bytes per acknowledged read chunk
pub const READ_CHUNK_SIZE: usize = 32;

/// Largest chunk the host may send
pub const MAX_CHUNK_SIZE: usize = 255;

/// Read chunk acknowledgement
pub const CHUNK_ACK: u8 = 0xFF;

/// Fix-phase terminator address
pub const FIX_END_ADDRESS: u16 = 0xFFFF;

/// Command bytes sent after Ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    Read = 0x00,
    Write = 0x01,
    Verify = 0x02,
}

/// Controller message opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Ready = 0x00,
    Print = 0x01,
    Chunk = 0x02,
    ReadEnd = 0x03,
    ChunkRequest = 0x04,
    InvalidChecksum = 0x05,
    ByteMismatch = 0x06,
    ByteRequest = 0x07,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageId::Ready),
            0x01 => Ok(MessageId::Print),
            0x02 => Ok(MessageId::Chunk),
            0x03 => Ok(MessageId::ReadEnd),
            0x04 => Ok(MessageId::ChunkRequest),
            0x05 => Ok(MessageId::InvalidChecksum),
            0x06 => Ok(MessageId::ByteMismatch),
            0x07 => Ok(MessageId::ByteRequest),
            _ => Err(value),
        }
    }
}

/// Decoded controller message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ready,
    Print(String),
    Chunk { data: Vec<u8>, checksum: u16 },
    ReadEnd,
    ChunkRequest,
    InvalidChecksum { claimed: u16, computed: u16 },
    ByteMismatch { address: u16, expected: u8, actual: u8 },
    ByteRequest,
}

/// Fletcher-style checksum: `(sum2 << 8) | sum1`, both sums mod 256.
pub fn checksum(data: &[u8]) -> u16 {
    let (sum1, sum2) = data.iter().fold((0u8, 0u8), |(s1, s2), &b| {
        let s1 = s1.wrapping_add(b);
        (s1, s2.wrapping_add(s1))
    });
    (u16::from(sum2) << 8) | u16::from(sum1)
}

/// Read command: `[0x00][start BE][end BE]`
pub fn build_read(start: u16, end: u16) -> Vec<u8> {
    let mut data = vec![CommandId::Read as u8];
    data.extend_from_slice(&start.to_be_bytes());
    data.extend_from_slice(&end.to_be_bytes());
    data
}

/// Write or Verify command with its flag byte
pub fn build_flag_command(cmd_id: CommandId, flag: bool) -> Vec<u8> {
    vec![cmd_id as u8, u8::from(flag)]
}

/// One chunk frame: `[len][checksum BE][data]`
pub fn build_chunk(data: &[u8]) -> Vec<u8> {
    build_chunk_with_checksum(data, checksum(data))
}

/// One chunk frame with an arbitrary claimed checksum
pub fn build_chunk_with_checksum(data: &[u8], claimed: u16) -> Vec<u8> {
    assert!(!data.is_empty() && data.len() <= MAX_CHUNK_SIZE);
    let mut frame = Vec::with_capacity(3 + data.len());
    frame.push(data.len() as u8);
    frame.extend_from_slice(&claimed.to_be_bytes());
    frame.extend_from_slice(data);
    frame
}

/// One fix command: `[address BE][value]`
pub fn build_fix(address: u16, value: u8) -> Vec<u8> {
    let mut data = address.to_be_bytes().to_vec();
    data.push(value);
    data
}

/// Deterministic test image
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
