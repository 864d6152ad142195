//! Modbus TCP framing
//!
//! Wire layout, all multi-byte fields big-endian:
//!
//! ```text
//! | transactionID:2 | protocolID:2 | length:2 | unitID:1 | functionCode:1 | payload:length-2 |
//! ```
//!
//! The 6-byte MBAP prefix is decoded by [`decode_header`], the
//! length-counted body by [`decode_body`]. [`FrameDecoder`] reassembles
//! frames from a byte stream delivered in arbitrary chunks.

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{function_code_description, ModbusPdu};

/// One logical Modbus TCP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    /// Always 0 for frames this crate builds
    pub protocol_id: u16,
    pub unit_id: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Wrap a PDU for the wire with protocol ID 0
    pub fn new(transaction_id: u16, unit_id: u8, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            unit_id,
            function_code: pdu.function_code,
            payload: pdu.payload,
        }
    }

    /// Build the answer to this frame: same transaction, protocol and unit IDs
    pub fn reply(&self, pdu: ModbusPdu) -> Self {
        Self {
            transaction_id: self.transaction_id,
            protocol_id: self.protocol_id,
            unit_id: self.unit_id,
            function_code: pdu.function_code,
            payload: pdu.payload,
        }
    }

    /// Value of the MBAP length field: unit ID + function code + payload
    #[inline]
    pub fn length(&self) -> usize {
        MIN_MBAP_LENGTH + self.payload.len()
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    pub fn pdu(&self) -> ModbusPdu {
        ModbusPdu::new(self.function_code, self.payload.clone())
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> ModbusResult<Vec<u8>> {
        encode_frame(self)
    }
}

/// Decoded MBAP prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Number of bytes following the header (unit ID + function code + payload)
    pub length: u16,
}

impl MbapHeader {
    /// Fails with `InvalidProtocol` for a nonzero protocol ID
    pub fn check_protocol(&self) -> ModbusResult<()> {
        if self.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ModbusError::InvalidProtocol {
                protocol_id: self.protocol_id,
            });
        }
        Ok(())
    }
}

/// Decoded length-counted part of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBody {
    pub unit_id: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

/// Encode a frame: MBAP header, unit ID, function code, payload.
pub fn encode_frame(frame: &Frame) -> ModbusResult<Vec<u8>> {
    let length = u16::try_from(frame.length()).map_err(|_| {
        ModbusError::invalid_argument(format!(
            "payload of {} bytes does not fit the MBAP length field",
            frame.payload.len()
        ))
    })?;

    let mut bytes = Vec::with_capacity(MBAP_HEADER_LEN + frame.length());
    bytes.extend_from_slice(&frame.transaction_id.to_be_bytes());
    bytes.extend_from_slice(&frame.protocol_id.to_be_bytes());
    bytes.extend_from_slice(&length.to_be_bytes());
    bytes.push(frame.unit_id);
    bytes.push(frame.function_code);
    bytes.extend_from_slice(&frame.payload);

    debug!(
        "Building TCP frame: trans_id={:04X}, unit_id={}, FC={:02X} ({}), PDU_len={}",
        frame.transaction_id,
        frame.unit_id,
        frame.function_code,
        function_code_description(frame.function_code),
        frame.payload.len() + 1
    );

    Ok(bytes)
}

/// Decode the 6-byte MBAP prefix.
///
/// Does not reject a nonzero protocol ID; see [`MbapHeader::check_protocol`].
pub fn decode_header(bytes: &[u8]) -> ModbusResult<MbapHeader> {
    if bytes.len() < MBAP_HEADER_LEN {
        return Err(ModbusError::Truncated {
            needed: MBAP_HEADER_LEN,
            available: bytes.len(),
        });
    }
    Ok(MbapHeader {
        transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
        protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
        length: u16::from_be_bytes([bytes[4], bytes[5]]),
    })
}

/// Decode `length` bytes of frame body.
pub fn decode_body(bytes: &[u8], length: usize) -> ModbusResult<FrameBody> {
    if length < MIN_MBAP_LENGTH {
        return Err(ModbusError::invalid_data(format!(
            "MBAP length {} is shorter than unit ID + function code",
            length
        )));
    }
    if bytes.len() < length {
        return Err(ModbusError::Truncated {
            needed: length,
            available: bytes.len(),
        });
    }
    Ok(FrameBody {
        unit_id: bytes[0],
        function_code: bytes[1],
        payload: bytes[MIN_MBAP_LENGTH..length].to_vec(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingBody(MbapHeader),
    /// Skipping the body of an over-long frame
    Discarding(usize),
}

/// Per-connection reassembly of frames from a byte stream.
///
/// A chunk may complete zero, one or several frames, and a frame may span
/// several chunks. Surplus bytes after a completed frame stay buffered for
/// the next one. A malformed frame is dropped without disturbing the frames
/// that follow it.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: DecodeState,
    frames_decoded: u64,
    frames_dropped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            state: DecodeState::AwaitingHeader,
            frames_decoded: 0,
            frames_dropped: 0,
        }
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Pull the next complete frame out of the buffer, if there is one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    let header = decode_header(&self.buffer).ok()?;
                    self.buffer.advance(MBAP_HEADER_LEN);
                    if let Err(e) = header.check_protocol() {
                        warn!("{} (trans_id={:04X}), passing frame through", e, header.transaction_id);
                    }
                    if header.length as usize > MAX_MBAP_LENGTH {
                        self.frames_dropped += 1;
                        warn!(
                            "Dropping frame trans_id={:04X}: MBAP length {} exceeds {}",
                            header.transaction_id, header.length, MAX_MBAP_LENGTH
                        );
                        self.state = DecodeState::Discarding(header.length as usize);
                        continue;
                    }
                    self.state = DecodeState::AwaitingBody(header);
                }
                DecodeState::Discarding(remaining) => {
                    let skipped = remaining.min(self.buffer.len());
                    self.buffer.advance(skipped);
                    if skipped < remaining {
                        self.state = DecodeState::Discarding(remaining - skipped);
                        return None;
                    }
                    self.state = DecodeState::AwaitingHeader;
                }
                DecodeState::AwaitingBody(header) => {
                    let length = header.length as usize;
                    if self.buffer.len() < length {
                        return None;
                    }
                    let body = self.buffer.split_to(length);
                    self.state = DecodeState::AwaitingHeader;

                    match decode_body(&body, length) {
                        Ok(body) => {
                            self.frames_decoded += 1;
                            debug!(
                                "MBAP frame: trans_id={:04X}, protocol_id={:04X}, length={}, unit_id={}, FC={:02X}",
                                header.transaction_id,
                                header.protocol_id,
                                length,
                                body.unit_id,
                                body.function_code
                            );
                            return Some(Frame {
                                transaction_id: header.transaction_id,
                                protocol_id: header.protocol_id,
                                unit_id: body.unit_id,
                                function_code: body.function_code,
                                payload: body.payload,
                            });
                        }
                        Err(e) => {
                            self.frames_dropped += 1;
                            warn!(
                                "Dropping frame trans_id={:04X}: {}",
                                header.transaction_id, e
                            );
                        }
                    }
                }
            }
        }
    }

    /// Bytes held for a frame not yet complete
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is pending
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitingHeader && self.buffer.is_empty()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Discard any partial frame
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = DecodeState::AwaitingHeader;
    }
}
