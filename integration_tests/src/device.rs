//! Device communication client.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::Result;
use serialport::SerialPort;

use crate::protocol::{
    build_chunk, build_chunk_with_checksum, build_fix, build_flag_command, build_read, checksum,
    CommandId, Message, MessageId, CHUNK_ACK, FIX_END_ADDRESS, READ_CHUNK_SIZE,
};

/// Find USB-UART bridge ports (ttyUSB / ttyACM).
pub fn find_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| p.port_name)
        .filter(|name| name.contains("ttyUSB") || name.contains("ttyACM"))
        .collect())
}

/// Resolve a port argument - returns the port path if not "auto", otherwise auto-detects.
pub fn resolve_port(port_arg: &str) -> Result<String> {
    if port_arg != "auto" {
        return Ok(port_arg.to_string());
    }

    match find_ports()?.into_iter().next() {
        Some(port) => Ok(port),
        None => anyhow::bail!("No serial port found - ensure the programmer is connected"),
    }
}

/// Result of a Read command
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub data: Vec<u8>,
    pub chunk_sizes: Vec<usize>,
    pub prints: Vec<String>,
}

/// Result of the compare phase of a Verify command
#[derive(Debug, Default)]
pub struct VerifyOutcome {
    /// `(address, expected, actual)` in the order reported
    pub mismatches: Vec<(u16, u8, u8)>,
}

/// Client for driving the EEPROM programmer.
///
/// The controller serves one command per power cycle, so every command
/// starts with [`DeviceClient::reset`].
pub struct DeviceClient {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl DeviceClient {
    /// Create a new device client.
    pub fn new(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()?;

        Ok(Self {
            port,
            timeout: Duration::from_secs(2),
        })
    }

    /// Set the message timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Pulse EN through RTS (DTR held so the chip boots from flash) and wait
    /// for Ready.
    ///
    /// The ROM bootloader prints on the same UART, so everything before the
    /// Ready byte is discarded.
    pub fn reset(&mut self) -> Result<()> {
        self.port.write_data_terminal_ready(false)?;
        self.port.write_request_to_send(true)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.write_request_to_send(false)?;
        self.port.clear(serialport::ClearBuffer::Input)?;

        let start = Instant::now();
        let mut buf = [0u8; 1];
        while start.elapsed() < Duration::from_secs(3) {
            match self.port.read(&mut buf) {
                Ok(1) if buf[0] == MessageId::Ready as u8 => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }

        anyhow::bail!("Timeout waiting for Ready after reset")
    }

    /// Send raw bytes.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read exactly `len` bytes within the message timeout.
    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        let mut filled = 0;
        let start = Instant::now();

        while filled < len {
            if start.elapsed() >= self.timeout {
                anyhow::bail!(
                    "Timeout waiting for {} bytes, got {}: {:02x?}",
                    len,
                    filled,
                    &data[..filled]
                );
            }
            match self.port.read(&mut data[filled..]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(data)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_exact(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read and decode one controller message.
    pub fn read_message(&mut self) -> Result<Message> {
        let opcode = self.read_exact(1)?[0];
        let id = MessageId::try_from(opcode)
            .map_err(|v| anyhow::anyhow!("Unknown message opcode: {:#04x}", v))?;

        let message = match id {
            MessageId::Ready => Message::Ready,
            MessageId::Print => {
                let len = self.read_u16()? as usize;
                let text = self.read_exact(len)?;
                Message::Print(String::from_utf8_lossy(&text).into_owned())
            }
            MessageId::Chunk => {
                let len = self.read_exact(1)?[0] as usize;
                let checksum = self.read_u16()?;
                let data = self.read_exact(len)?;
                Message::Chunk { data, checksum }
            }
            MessageId::ReadEnd => Message::ReadEnd,
            MessageId::ChunkRequest => Message::ChunkRequest,
            MessageId::InvalidChecksum => Message::InvalidChecksum {
                claimed: self.read_u16()?,
                computed: self.read_u16()?,
            },
            MessageId::ByteMismatch => {
                let address = self.read_u16()?;
                let values = self.read_exact(2)?;
                Message::ByteMismatch {
                    address,
                    expected: values[0],
                    actual: values[1],
                }
            }
            MessageId::ByteRequest => Message::ByteRequest,
        };

        Ok(message)
    }

    /// Try to read a message; None if nothing arrives within `timeout`.
    pub fn try_read_message(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let old_timeout = self.timeout;
        self.timeout = timeout;
        let result = self.read_message();
        self.timeout = old_timeout;

        match result {
            Ok(message) => Ok(Some(message)),
            Err(e) if e.to_string().contains("Timeout") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Skip Print messages, returning the first other message.
    fn next_protocol_message(&mut self, prints: &mut Vec<String>) -> Result<Message> {
        loop {
            match self.read_message()? {
                Message::Print(text) => prints.push(text),
                other => return Ok(other),
            }
        }
    }

    fn expect(&mut self, expected: Message, prints: &mut Vec<String>) -> Result<()> {
        let message = self.next_protocol_message(prints)?;
        if message != expected {
            anyhow::bail!("Expected {:?}, got {:?}", expected, message);
        }
        Ok(())
    }

    /// Reset, then read `[start, end)`, acknowledging every full chunk.
    pub fn read(&mut self, start: u16, end: u16) -> Result<ReadOutcome> {
        self.reset()?;
        self.send(&build_read(start, end))?;

        let mut outcome = ReadOutcome::default();
        loop {
            match self.next_protocol_message(&mut outcome.prints)? {
                Message::Chunk { data, checksum: claimed } => {
                    if checksum(&data) != claimed {
                        anyhow::bail!(
                            "Chunk {} checksum mismatch: claimed {:04x}, computed {:04x}",
                            outcome.chunk_sizes.len(),
                            claimed,
                            checksum(&data)
                        );
                    }
                    // The remainder chunk is never acknowledged
                    if data.len() == READ_CHUNK_SIZE {
                        self.send(&[CHUNK_ACK])?;
                    }
                    outcome.chunk_sizes.push(data.len());
                    outcome.data.extend_from_slice(&data);
                }
                Message::ReadEnd => return Ok(outcome),
                other => anyhow::bail!("Unexpected message during read: {:?}", other),
            }
        }
    }

    /// Answer ChunkRequests with `image` split into `chunk_size` chunks, then
    /// the terminator. Mismatch reports arriving in between are collected.
    fn stream_image(
        &mut self,
        image: &[u8],
        chunk_size: usize,
        prints: &mut Vec<String>,
    ) -> Result<Vec<(u16, u8, u8)>> {
        let mut mismatches = Vec::new();
        let mut chunks = image.chunks(chunk_size);

        loop {
            match self.next_protocol_message(prints)? {
                Message::ChunkRequest => match chunks.next() {
                    Some(chunk) => self.send(&build_chunk(chunk))?,
                    None => {
                        self.send(&[0x00])?;
                        return Ok(mismatches);
                    }
                },
                Message::ByteMismatch {
                    address,
                    expected,
                    actual,
                } => mismatches.push((address, expected, actual)),
                other => anyhow::bail!("Unexpected message during chunk stream: {:?}", other),
            }
        }
    }

    /// Answer ByteRequests with `fixes`, then the 0xFFFF terminator.
    fn send_fixes(&mut self, fixes: &[(u16, u8)], prints: &mut Vec<String>) -> Result<()> {
        for &(address, value) in fixes {
            self.expect(Message::ByteRequest, prints)?;
            self.send(&build_fix(address, value))?;
        }
        self.expect(Message::ByteRequest, prints)?;
        self.send(&FIX_END_ADDRESS.to_be_bytes())
    }

    /// Reset, then write `image` from address 0 without verifying.
    pub fn write(&mut self, image: &[u8], chunk_size: usize) -> Result<()> {
        self.reset()?;
        self.send(&build_flag_command(CommandId::Write, false))?;
        let mut prints = Vec::new();
        let mismatches = self.stream_image(image, chunk_size, &mut prints)?;
        if !mismatches.is_empty() {
            anyhow::bail!("Mismatch reported during write: {:?}", mismatches);
        }
        Ok(())
    }

    /// Reset, write `image`, verify it and repair every reported mismatch.
    pub fn write_verified(&mut self, image: &[u8], chunk_size: usize) -> Result<VerifyOutcome> {
        self.reset()?;
        self.send(&build_flag_command(CommandId::Write, true))?;

        let mut prints = Vec::new();
        self.stream_image(image, chunk_size, &mut prints)?;
        let mismatches = self.stream_image(image, chunk_size, &mut prints)?;

        let fixes: Vec<(u16, u8)> = mismatches.iter().map(|&(a, e, _)| (a, e)).collect();
        self.send_fixes(&fixes, &mut prints)?;

        Ok(VerifyOutcome { mismatches })
    }

    /// Reset and compare the chip against `image`, applying `fixes` if given.
    pub fn verify(
        &mut self,
        image: &[u8],
        chunk_size: usize,
        fixes: Option<&[(u16, u8)]>,
    ) -> Result<VerifyOutcome> {
        self.reset()?;
        self.send(&build_flag_command(CommandId::Verify, fixes.is_some()))?;

        let mut prints = Vec::new();
        let mismatches = self.stream_image(image, chunk_size, &mut prints)?;
        if let Some(fixes) = fixes {
            self.send_fixes(fixes, &mut prints)?;
        }

        Ok(VerifyOutcome { mismatches })
    }

    /// Reset, start a write and send one chunk with a wrong checksum.
    ///
    /// Returns the controller's answer to the bad chunk.
    pub fn write_corrupted(&mut self, data: &[u8]) -> Result<Message> {
        self.reset()?;
        self.send(&build_flag_command(CommandId::Write, false))?;

        let mut prints = Vec::new();
        self.expect(Message::ChunkRequest, &mut prints)?;
        let bad = checksum(data) ^ 0x5A5A;
        self.send(&build_chunk_with_checksum(data, bad))?;
        self.next_protocol_message(&mut prints)
    }
}
