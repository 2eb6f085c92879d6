//! Data structures shared by the ledger adapter, the listener and the wire
//! protocol.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size in bytes of a contract script hash.
pub const PROGRAM_ID_BYTES: usize = 20;

/// Errors emitted when a configured or reported program id fails validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgramIdError {
    #[error("program id must be exactly {} hex characters", PROGRAM_ID_BYTES * 2)]
    WrongLength,
    #[error("program id is not valid hex: {0}")]
    NonHex(String),
}

/// Script hash of an on-chain program, in the byte order it is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId([u8; PROGRAM_ID_BYTES]);

impl ProgramId {
    /// Accepts 40 hex characters with an optional `0x` prefix, any case.
    pub fn parse(value: &str) -> Result<Self, ProgramIdError> {
        let trimmed = value.trim();
        let raw = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if raw.len() != PROGRAM_ID_BYTES * 2 {
            return Err(ProgramIdError::WrongLength);
        }
        let mut bytes = [0u8; PROGRAM_ID_BYTES];
        hex::decode_to_slice(raw, &mut bytes)
            .map_err(|err| ProgramIdError::NonHex(err.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PROGRAM_ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Integer as carried on the VM stack: little-endian two's complement bytes
/// plus an explicit signedness flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackInteger {
    le_bytes: Vec<u8>,
    signed: bool,
}

impl StackInteger {
    pub fn from_le_bytes(bytes: impl Into<Vec<u8>>, signed: bool) -> Self {
        Self {
            le_bytes: bytes.into(),
            signed,
        }
    }

    /// Minimal signed encoding; zero is the empty byte string like the VM
    /// produces.
    pub fn from_i128(value: i128) -> Self {
        let mut bytes = value.to_le_bytes().to_vec();
        while let Some(&last) = bytes.last() {
            let Some(&prev) = bytes.len().checked_sub(2).and_then(|idx| bytes.get(idx)) else {
                if last == 0 {
                    bytes.pop();
                }
                break;
            };
            let redundant = (last == 0x00 && prev & 0x80 == 0) || (last == 0xff && prev & 0x80 != 0);
            if !redundant {
                break;
            }
            bytes.pop();
        }
        Self::from_le_bytes(bytes, true)
    }

    pub fn from_i64(value: i64) -> Self {
        Self::from_i128(i128::from(value))
    }

    pub fn as_le_bytes(&self) -> &[u8] {
        &self.le_bytes
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Returns `None` when the value does not fit in an `i64`.
    pub fn to_i64(&self) -> Option<i64> {
        le_bytes_to_i64(&self.le_bytes, self.signed)
    }
}

/// Interprets little-endian bytes as an integer of at most 64 bits. Bytes
/// beyond the eighth are accepted only when they are pure sign extension.
pub fn le_bytes_to_i64(bytes: &[u8], signed: bool) -> Option<i64> {
    let negative = signed && bytes.last().is_some_and(|b| b & 0x80 != 0);
    let fill = if negative { 0xff } else { 0x00 };

    if bytes.len() > 8 && bytes[8..].iter().any(|b| *b != fill) {
        return None;
    }

    let mut buf = [fill; 8];
    let width = bytes.len().min(8);
    buf[..width].copy_from_slice(&bytes[..width]);

    // The 8th byte's top bit must agree with the sign once extension bytes
    // have been dropped.
    if bytes.len() > 8 && (buf[7] & 0x80 != 0) != negative {
        return None;
    }
    let value = i64::from_le_bytes(buf);
    if !signed && value < 0 {
        return None;
    }
    Some(value)
}

/// Self-describing notification payload value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadValue {
    Bytes(Vec<u8>),
    Integer(StackInteger),
    Boolean(bool),
    Array(Vec<PayloadValue>),
}

impl PayloadValue {
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(value.into())
    }

    pub fn integer(value: i64) -> Self {
        Self::Integer(StackInteger::from_i64(value))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PayloadValue::Bytes(_) => "bytes",
            PayloadValue::Integer(_) => "integer",
            PayloadValue::Boolean(_) => "boolean",
            PayloadValue::Array(_) => "array",
        }
    }

    pub fn as_array(&self) -> Option<&[PayloadValue]> {
        match self {
            PayloadValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// One notification observed by the ledger for a monitored program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub source_program_id: ProgramId,
    pub payload: PayloadValue,
    pub block_height: u64,
    pub tx_hash: String,
}

/// Application-level record carried by a `sell` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub from: String,
    pub asset: String,
    pub price: i64,
}

/// JSON text frame sent to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub from: String,
    pub asset: String,
    pub price: i64,
    pub contract: String,
    pub block: u64,
    pub txid: String,
}

impl RelayMessage {
    pub fn new(event: &NotificationEvent, decoded: DecodedEvent) -> Self {
        Self {
            from: decoded.from,
            asset: decoded.asset,
            price: decoded.price,
            contract: event.source_program_id.to_string(),
            block: event.block_height,
            txid: event.tx_hash.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
