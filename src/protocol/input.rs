//! Input, controller, and clipboard packet codecs.
//!
//! Input events are sent viewer → host as standalone datagrams, no
//! batching. The numeric fields inside event payloads are big-endian on
//! the wire like every other protocol field.

use anyhow::{bail, Result};

use super::PacketType;

/// Input packet header size: ver_type(1) + input_type(1) + payload_length(2).
const INPUT_HEADER_SIZE: usize = 4;

/// Clipboard header: type(1) direction(1) sequence(2) format(1)
/// reserved(3) length(4).
const CLIPBOARD_HEADER_SIZE: usize = 12;

/// Clipboard payload cap: 64 KiB of UTF-8 text.
pub const CLIPBOARD_MAX_BYTES: usize = 64 * 1024;

/// Clipboard text format tag. The reserved header bytes leave room for
/// future formats; only UTF-8 text is defined.
pub const CLIPBOARD_FORMAT_TEXT_UTF8: u8 = 0;

const INPUT_TYPE_MOUSE_MOVE: u8 = 0x01;
const INPUT_TYPE_MOUSE_BUTTON: u8 = 0x02;
const INPUT_TYPE_KEY: u8 = 0x03;
const INPUT_TYPE_SCROLL: u8 = 0x04;

// ---------------------------------------------------------------------------
// Input events
// ---------------------------------------------------------------------------

/// A single input event from the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    MouseMove { dx: i16, dy: i16, buttons: u8 },
    MouseButton { button: u8, action: u8 },
    Key { keycode: u16, action: u8, modifiers: u8 },
    Scroll { dx: i16, dy: i16 },
}

impl InputEvent {
    pub fn serialize(&self) -> Vec<u8> {
        let (input_type, payload) = match *self {
            InputEvent::MouseMove { dx, dy, buttons } => {
                let mut p = Vec::with_capacity(5);
                p.extend_from_slice(&dx.to_be_bytes());
                p.extend_from_slice(&dy.to_be_bytes());
                p.push(buttons);
                (INPUT_TYPE_MOUSE_MOVE, p)
            }
            InputEvent::MouseButton { button, action } => {
                (INPUT_TYPE_MOUSE_BUTTON, vec![button, action])
            }
            InputEvent::Key {
                keycode,
                action,
                modifiers,
            } => {
                let mut p = Vec::with_capacity(4);
                p.extend_from_slice(&keycode.to_be_bytes());
                p.push(action);
                p.push(modifiers);
                (INPUT_TYPE_KEY, p)
            }
            InputEvent::Scroll { dx, dy } => {
                let mut p = Vec::with_capacity(4);
                p.extend_from_slice(&dx.to_be_bytes());
                p.extend_from_slice(&dy.to_be_bytes());
                (INPUT_TYPE_SCROLL, p)
            }
        };

        let mut buf = Vec::with_capacity(INPUT_HEADER_SIZE + payload.len());
        buf.push(PacketType::Input.dispatch_byte());
        buf.push(input_type);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&payload);
        buf
    }

    pub fn parse(data: &[u8]) -> Result<InputEvent> {
        if data.len() < INPUT_HEADER_SIZE {
            bail!("input packet too short: {} bytes", data.len());
        }
        if PacketType::identify(data) != Some(PacketType::Input) {
            bail!("not an input packet");
        }
        let input_type = data[1];
        let payload_length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let payload = &data[INPUT_HEADER_SIZE..];
        if payload.len() < payload_length {
            bail!("input payload truncated");
        }
        let payload = &payload[..payload_length];

        match input_type {
            INPUT_TYPE_MOUSE_MOVE if payload.len() >= 5 => Ok(InputEvent::MouseMove {
                dx: i16::from_be_bytes([payload[0], payload[1]]),
                dy: i16::from_be_bytes([payload[2], payload[3]]),
                buttons: payload[4],
            }),
            INPUT_TYPE_MOUSE_BUTTON if payload.len() >= 2 => Ok(InputEvent::MouseButton {
                button: payload[0],
                action: payload[1],
            }),
            INPUT_TYPE_KEY if payload.len() >= 4 => Ok(InputEvent::Key {
                keycode: u16::from_be_bytes([payload[0], payload[1]]),
                action: payload[2],
                modifiers: payload[3],
            }),
            INPUT_TYPE_SCROLL if payload.len() >= 4 => Ok(InputEvent::Scroll {
                dx: i16::from_be_bytes([payload[0], payload[1]]),
                dy: i16::from_be_bytes([payload[2], payload[3]]),
            }),
            other => bail!("unknown or truncated input type 0x{:02X}", other),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Full-state gamepad snapshot (not deltas): `type(1) controller_id(1)
/// buttons(2) left_trigger(1) right_trigger(1) thumb_lx(2) thumb_ly(2)
/// thumb_rx(2) thumb_ry(2) sequence(2)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerPacket {
    pub controller_id: u8,
    pub buttons: u16,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub thumb_lx: i16,
    pub thumb_ly: i16,
    pub thumb_rx: i16,
    pub thumb_ry: i16,
    pub sequence: u16,
}

const CONTROLLER_PACKET_SIZE: usize = 16;

impl ControllerPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONTROLLER_PACKET_SIZE);
        buf.push(PacketType::Controller.dispatch_byte());
        buf.push(self.controller_id);
        buf.extend_from_slice(&self.buttons.to_be_bytes());
        buf.push(self.left_trigger);
        buf.push(self.right_trigger);
        buf.extend_from_slice(&self.thumb_lx.to_be_bytes());
        buf.extend_from_slice(&self.thumb_ly.to_be_bytes());
        buf.extend_from_slice(&self.thumb_rx.to_be_bytes());
        buf.extend_from_slice(&self.thumb_ry.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<ControllerPacket> {
        if data.len() < CONTROLLER_PACKET_SIZE {
            bail!("controller packet too short: {} bytes", data.len());
        }
        if PacketType::identify(data) != Some(PacketType::Controller) {
            bail!("not a controller packet");
        }
        Ok(ControllerPacket {
            controller_id: data[1],
            buttons: u16::from_be_bytes([data[2], data[3]]),
            left_trigger: data[4],
            right_trigger: data[5],
            thumb_lx: i16::from_be_bytes([data[6], data[7]]),
            thumb_ly: i16::from_be_bytes([data[8], data[9]]),
            thumb_rx: i16::from_be_bytes([data[10], data[11]]),
            thumb_ry: i16::from_be_bytes([data[12], data[13]]),
            sequence: u16::from_be_bytes([data[14], data[15]]),
        })
    }
}

// ---------------------------------------------------------------------------
// Clipboard
// ---------------------------------------------------------------------------

/// Direction byte: 0 = host → viewer, 1 = viewer → host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClipboardDirection {
    HostToViewer = 0,
    ViewerToHost = 1,
}

/// Clipboard text transfer with ACK-based reliable delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardPacket {
    pub direction: ClipboardDirection,
    pub sequence: u16,
    pub text: String,
}

impl ClipboardPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let bytes = self.text.as_bytes();
        let len = bytes.len().min(CLIPBOARD_MAX_BYTES);

        let mut buf = Vec::with_capacity(CLIPBOARD_HEADER_SIZE + len);
        buf.push(PacketType::Clipboard.dispatch_byte());
        buf.push(self.direction as u8);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.push(CLIPBOARD_FORMAT_TEXT_UTF8);
        buf.extend_from_slice(&[0u8; 3]); // reserved
        buf.extend_from_slice(&(len as u32).to_be_bytes());
        buf.extend_from_slice(&bytes[..len]);
        buf
    }

    pub fn parse(data: &[u8]) -> Result<ClipboardPacket> {
        if data.len() < CLIPBOARD_HEADER_SIZE {
            bail!("clipboard packet too short: {} bytes", data.len());
        }
        if PacketType::identify(data) != Some(PacketType::Clipboard) {
            bail!("not a clipboard packet");
        }
        let direction = match data[1] {
            0 => ClipboardDirection::HostToViewer,
            1 => ClipboardDirection::ViewerToHost,
            other => bail!("unknown clipboard direction {}", other),
        };
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        if data[4] != CLIPBOARD_FORMAT_TEXT_UTF8 {
            bail!("unsupported clipboard format {}", data[4]);
        }
        let length = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
        if length > CLIPBOARD_MAX_BYTES {
            bail!("clipboard payload exceeds cap: {} bytes", length);
        }
        let payload = &data[CLIPBOARD_HEADER_SIZE..];
        if payload.len() < length {
            bail!("clipboard payload truncated");
        }
        let text = std::str::from_utf8(&payload[..length])?.to_string();

        Ok(ClipboardPacket {
            direction,
            sequence,
            text,
        })
    }
}

/// Clipboard delivery acknowledgement: `type(1) reserved(1) ack_sequence(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipAckPacket {
    pub ack_sequence: u16,
}

impl ClipAckPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.push(PacketType::ClipAck.dispatch_byte());
        buf.push(0); // reserved
        buf.extend_from_slice(&self.ack_sequence.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<ClipAckPacket> {
        if data.len() < 4 {
            bail!("clipboard ACK too short: {} bytes", data.len());
        }
        if PacketType::identify(data) != Some(PacketType::ClipAck) {
            bail!("not a clipboard ACK");
        }
        Ok(ClipAckPacket {
            ack_sequence: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}
