//! Payload decoder turning a `sell` notification array into a
//! [`DecodedEvent`].
//!
//! The whole shape is checked before any field is read, so a short or
//! mistyped array never yields a partially filled record.

use std::str::Utf8Error;

use thiserror::Error;

use crate::model::{le_bytes_to_i64, DecodedEvent, PayloadValue};

/// Number of leading array elements the record is built from. Trailing
/// elements are ignored.
pub const REQUIRED_FIELDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    SignedInteger,
}

impl FieldKind {
    fn describe(self) -> &'static str {
        match self {
            FieldKind::Text => "utf-8 bytes",
            FieldKind::SignedInteger => "signed integer",
        }
    }

    fn accepts(self, value: &PayloadValue) -> bool {
        match (self, value) {
            (FieldKind::Text, PayloadValue::Bytes(_)) => true,
            // The VM pushes integers as raw byte arrays as often as it tags them.
            (FieldKind::SignedInteger, PayloadValue::Integer(_) | PayloadValue::Bytes(_)) => true,
            _ => false,
        }
    }
}

const LAYOUT: [(&str, FieldKind); REQUIRED_FIELDS] = [
    ("from", FieldKind::Text),
    ("asset", FieldKind::Text),
    ("price", FieldKind::SignedInteger),
];

/// Payload does not have the structure the record requires.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("payload must be an array, found {found}")]
    NotArray { found: &'static str },
    #[error("payload has {found} elements, expected at least {expected}")]
    TooShort { found: usize, expected: usize },
    #[error("field `{field}` expected {expected}, found {found}")]
    UnexpectedTag {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("field `{field}` does not fit in 64 bits")]
    IntegerWidth { field: &'static str },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("field `{field}` is not valid utf-8: {source}")]
    Encoding {
        field: &'static str,
        #[source]
        source: Utf8Error,
    },
}

/// Decodes `Array[Bytes(from), Bytes(asset), Integer(price)]`.
pub fn decode(payload: &PayloadValue) -> Result<DecodedEvent, DecodeError> {
    let items = payload.as_array().ok_or(ShapeError::NotArray {
        found: payload.type_name(),
    })?;

    if items.len() < REQUIRED_FIELDS {
        return Err(ShapeError::TooShort {
            found: items.len(),
            expected: REQUIRED_FIELDS,
        }
        .into());
    }

    for (&(field, kind), value) in LAYOUT.iter().zip(items) {
        if !kind.accepts(value) {
            return Err(ShapeError::UnexpectedTag {
                field,
                expected: kind.describe(),
                found: value.type_name(),
            }
            .into());
        }
    }

    Ok(DecodedEvent {
        from: text_field(LAYOUT[0].0, &items[0])?,
        asset: text_field(LAYOUT[1].0, &items[1])?,
        price: integer_field(LAYOUT[2].0, &items[2])?,
    })
}

fn text_field(field: &'static str, value: &PayloadValue) -> Result<String, DecodeError> {
    match value {
        PayloadValue::Bytes(bytes) => std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|source| DecodeError::Encoding { field, source }),
        other => Err(ShapeError::UnexpectedTag {
            field,
            expected: FieldKind::Text.describe(),
            found: other.type_name(),
        }
        .into()),
    }
}

fn integer_field(field: &'static str, value: &PayloadValue) -> Result<i64, DecodeError> {
    let parsed = match value {
        PayloadValue::Integer(integer) => integer.to_i64(),
        PayloadValue::Bytes(bytes) => le_bytes_to_i64(bytes, true),
        other => {
            return Err(ShapeError::UnexpectedTag {
                field,
                expected: FieldKind::SignedInteger.describe(),
                found: other.type_name(),
            }
            .into())
        }
    };
    parsed.ok_or_else(|| ShapeError::IntegerWidth { field }.into())
}
