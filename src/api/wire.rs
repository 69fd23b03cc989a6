//! Binary Wire Protocol
//!
//! Length-prefixed big-endian frames. Every frame starts with a `u32`
//! total length (including the 4 length bytes themselves) and a `u8`
//! message type; the body layout depends on the type. Prices travel as
//! IEEE-754 dollars and become fixed-point cents at this boundary.
//!
//! ```text
//! [u32 length][u8 type][type-specific body]
//! ```

use crate::services::matching::types::{OrderKind, Side};
use bytes::{Buf, BufMut, BytesMut};

/// Hard cap on one frame, length prefix included.
pub const MAX_FRAME_SIZE: usize = 8192;

/// Smallest legal frame: the length prefix plus the type byte.
pub const MIN_FRAME_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    LoginRequest = 1,
    LoginResponse = 2,
    SubmitOrder = 3,
    OrderResponse = 4,
    Heartbeat = 5,
    HeartbeatAck = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(raw: u8) -> Result<Self, WireError> {
        match raw {
            1 => Ok(MessageType::LoginRequest),
            2 => Ok(MessageType::LoginResponse),
            3 => Ok(MessageType::SubmitOrder),
            4 => Ok(MessageType::OrderResponse),
            5 => Ok(MessageType::Heartbeat),
            6 => Ok(MessageType::HeartbeatAck),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// Protocol violations. Any of these drops the connection.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame length {0} below minimum")]
    FrameTooShort(usize),

    #[error("frame length {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("truncated frame body")]
    Truncated,

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u64 },
}

/// A submit-order frame as received, before validation and user
/// substitution. `user_id` is informational only; the session identity is
/// authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub order_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub quantity: u64,
    pub price_dollars: f64,
    pub timestamp_ms: u64,
}

/// Decoded inbound frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Login { token: String },
    SubmitOrder(OrderRequest),
    Heartbeat,
}

/// Validate a frame's length prefix before reading the body.
pub fn check_frame_length(length: usize) -> Result<(), WireError> {
    if length < MIN_FRAME_SIZE {
        return Err(WireError::FrameTooShort(length));
    }
    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(length));
    }
    Ok(())
}

/// Decode one frame body (everything after the 4 length bytes).
pub fn decode_frame(body: &[u8]) -> Result<ClientMessage, WireError> {
    let mut buf = body;
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    let msg_type = MessageType::try_from(buf.get_u8())?;

    match msg_type {
        MessageType::LoginRequest => {
            let token = read_string(&mut buf, "token")?;
            Ok(ClientMessage::Login { token })
        }
        MessageType::SubmitOrder => decode_submit_order(&mut buf),
        MessageType::Heartbeat => Ok(ClientMessage::Heartbeat),
        // Server-to-client types are never valid inbound.
        other => Err(WireError::UnknownMessageType(other as u8)),
    }
}

fn decode_submit_order(buf: &mut &[u8]) -> Result<ClientMessage, WireError> {
    // Fixed header: three string lengths, side, kind, quantity, price, ts.
    if buf.remaining() < 3 * 4 + 2 + 8 + 8 + 8 {
        return Err(WireError::Truncated);
    }
    let order_id_len = buf.get_u32() as usize;
    let user_id_len = buf.get_u32() as usize;
    let symbol_len = buf.get_u32() as usize;

    let side = match buf.get_u8() {
        0 => Side::Buy,
        1 => Side::Sell,
        other => {
            return Err(WireError::InvalidField {
                field: "side",
                value: other as u64,
            })
        }
    };
    let kind = match buf.get_u8() {
        0 => OrderKind::Market,
        1 => OrderKind::Limit,
        2 => OrderKind::Ioc,
        3 => OrderKind::Fok,
        other => {
            return Err(WireError::InvalidField {
                field: "order_type",
                value: other as u64,
            })
        }
    };
    let quantity = buf.get_u64();
    let price_dollars = buf.get_f64();
    let timestamp_ms = buf.get_u64();

    let order_id = read_bytes_as_string(buf, order_id_len, "order_id")?;
    let user_id = read_bytes_as_string(buf, user_id_len, "user_id")?;
    let symbol = read_bytes_as_string(buf, symbol_len, "symbol")?;

    Ok(ClientMessage::SubmitOrder(OrderRequest {
        order_id,
        user_id,
        symbol,
        side,
        kind,
        quantity,
        price_dollars,
        timestamp_ms,
    }))
}

fn read_string(buf: &mut &[u8], field: &'static str) -> Result<String, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let len = buf.get_u32() as usize;
    read_bytes_as_string(buf, len, field)
}

fn read_bytes_as_string(
    buf: &mut &[u8],
    len: usize,
    field: &'static str,
) -> Result<String, WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|_| WireError::InvalidUtf8(field))
}

// ============================================================================
// Outbound frames
// ============================================================================

fn frame_with_capacity(msg_type: MessageType, body_len: usize) -> BytesMut {
    let total = 4 + 1 + body_len;
    let mut frame = BytesMut::with_capacity(total);
    frame.put_u32(total as u32);
    frame.put_u8(msg_type as u8);
    frame
}

pub fn encode_login_response(success: bool, message: &str) -> BytesMut {
    let mut frame = frame_with_capacity(MessageType::LoginResponse, 1 + 4 + message.len());
    frame.put_u8(success as u8);
    frame.put_u32(message.len() as u32);
    frame.put_slice(message.as_bytes());
    frame
}

pub fn encode_order_response(order_id: &str, accepted: bool, message: &str) -> BytesMut {
    let mut frame = frame_with_capacity(
        MessageType::OrderResponse,
        4 + 1 + 4 + order_id.len() + message.len(),
    );
    frame.put_u32(order_id.len() as u32);
    frame.put_u8(accepted as u8);
    frame.put_u32(message.len() as u32);
    frame.put_slice(order_id.as_bytes());
    frame.put_slice(message.as_bytes());
    frame
}

pub fn encode_heartbeat_ack() -> BytesMut {
    frame_with_capacity(MessageType::HeartbeatAck, 0)
}
