//! The packed-string wire layer.
//!
//! The wire unit is a *pstr*: a one-byte prefix followed by packer output.
//! Prefix `-` means the packed value is the frame content directly; prefix
//! `+` means the packed value is a 1- or 2-element array
//! `[value, correlation?]` whose optional second element carries reply
//! correlation. This prefix is the only way a receiver can tell whether a
//! frame expects or provides a reply.
//!
//! The [`Packer`] trait is the codec seam: the default [`JsonPacker`]
//! emits JSON text; self-describing binary codecs implement the same
//! two-method contract outside this crate.

use serde_json::Value;
use thiserror::Error;

use crate::id::CbId;

/// Problem while packing or unpacking a frame.
#[derive(Debug, Error)]
pub enum PackError {
    /// The codec failed to serialize the value.
    #[error("serialize error: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The codec failed to parse the packed text.
    #[error("deserialize error: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// The frame was empty.
    #[error("empty frame")]
    EmptyFrame,

    /// The frame prefix was neither `-` nor `+`.
    #[error("unknown frame prefix {0:?}")]
    UnknownPrefix(char),

    /// A `+` frame did not decode to a `[value, correlation?]` wrapper.
    #[error("malformed callback wrapper")]
    MalformedWrapper,
}

/// A two-method pack/unpack codec over application values.
pub trait Packer: Send + Sync + 'static {
    /// Serialize a value to the codec's textual form.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Serialize`] if the value cannot be encoded.
    fn pack_value(&self, value: &Value) -> Result<String, PackError>;

    /// Parse the codec's textual form back into a value.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Deserialize`] if the text cannot be parsed.
    fn unpack_value(&self, text: &str) -> Result<Value, PackError>;
}

/// The default packer: JSON text via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPacker;

impl Packer for JsonPacker {
    fn pack_value(&self, value: &Value) -> Result<String, PackError> {
        serde_json::to_string(value).map_err(PackError::Serialize)
    }

    fn unpack_value(&self, text: &str) -> Result<Value, PackError> {
        serde_json::from_str(text).map_err(PackError::Deserialize)
    }
}

/// Reply correlation carried inside a `+` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// A registered waiter on the sending side; the reply frame echoes the
    /// same id.
    Callback(CbId),

    /// The Ajax one-shot sentinel (`0` on the wire): the reply travels on
    /// the same HTTP response instead of a correlated frame.
    AjaxOneShot,
}

impl Correlation {
    fn to_value(&self) -> Value {
        match self {
            Self::Callback(cb) => Value::String(cb.as_str().to_owned()),
            Self::AjaxOneShot => Value::from(0),
        }
    }

    fn from_value(value: &Value) -> Result<Self, PackError> {
        match value {
            Value::Number(n) if n.as_u64() == Some(0) => Ok(Self::AjaxOneShot),
            Value::String(s) => CbId::new(s)
                .map(Self::Callback)
                .ok_or(PackError::MalformedWrapper),
            _ => Err(PackError::MalformedWrapper),
        }
    }
}

/// Pack a value into a pstr, optionally wrapping it with correlation.
///
/// # Errors
///
/// Returns an error if the packer rejects the value.
pub fn pack(
    packer: &dyn Packer,
    value: &Value,
    correlation: Option<&Correlation>,
) -> Result<String, PackError> {
    match correlation {
        None => Ok(format!("-{}", packer.pack_value(value)?)),
        Some(corr) => {
            let wrapped = Value::Array(vec![value.clone(), corr.to_value()]);
            Ok(format!("+{}", packer.pack_value(&wrapped)?))
        }
    }
}

/// Unpack a pstr into its value and optional correlation.
///
/// # Errors
///
/// Returns an error on an empty frame, an unknown prefix, codec failure,
/// or a malformed `+` wrapper. Whether a failure is fatal is the caller's
/// concern: the server surfaces it as a `chsk/bad-package` event, the
/// client treats it as a protocol violation.
pub fn unpack(packer: &dyn Packer, pstr: &str) -> Result<(Value, Option<Correlation>), PackError> {
    let mut chars = pstr.chars();
    let prefix = chars.next().ok_or(PackError::EmptyFrame)?;
    let rest = chars.as_str();

    match prefix {
        '-' => Ok((packer.unpack_value(rest)?, None)),
        '+' => {
            let wrapped = packer.unpack_value(rest)?;
            let Value::Array(mut parts) = wrapped else {
                return Err(PackError::MalformedWrapper);
            };
            match parts.len() {
                1 => Ok((parts.remove(0), None)),
                2 => {
                    let corr = Correlation::from_value(&parts[1])?;
                    Ok((parts.remove(0), Some(corr)))
                }
                _ => Err(PackError::MalformedWrapper),
            }
        }
        other => Err(PackError::UnknownPrefix(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_value_uses_minus_prefix() {
        let pstr = pack(&JsonPacker, &json!(["app/ping", 1]), None).expect("pack");
        assert!(pstr.starts_with('-'));
        let (value, corr) = unpack(&JsonPacker, &pstr).expect("unpack");
        assert_eq!(value, json!(["app/ping", 1]));
        assert_eq!(corr, None);
    }

    #[test]
    fn callback_round_trips() {
        let cb = CbId::random();
        let pstr = pack(
            &JsonPacker,
            &json!(["app/ping"]),
            Some(&Correlation::Callback(cb.clone())),
        )
        .expect("pack");
        assert!(pstr.starts_with('+'));
        let (value, corr) = unpack(&JsonPacker, &pstr).expect("unpack");
        assert_eq!(value, json!(["app/ping"]));
        assert_eq!(corr, Some(Correlation::Callback(cb)));
    }

    #[test]
    fn ajax_sentinel_encodes_as_zero() {
        let pstr = pack(
            &JsonPacker,
            &json!(["app/ping"]),
            Some(&Correlation::AjaxOneShot),
        )
        .expect("pack");
        assert!(pstr.ends_with("0]"));
        let (_, corr) = unpack(&JsonPacker, &pstr).expect("unpack");
        assert_eq!(corr, Some(Correlation::AjaxOneShot));
    }

    #[test]
    fn one_element_wrapper_has_no_correlation() {
        let (value, corr) = unpack(&JsonPacker, "+[[\"app/ping\"]]").expect("unpack");
        assert_eq!(value, json!(["app/ping"]));
        assert_eq!(corr, None);
    }

    #[test]
    fn empty_and_unknown_prefix_are_rejected() {
        assert!(matches!(
            unpack(&JsonPacker, ""),
            Err(PackError::EmptyFrame)
        ));
        assert!(matches!(
            unpack(&JsonPacker, "?{}"),
            Err(PackError::UnknownPrefix('?'))
        ));
    }

    #[test]
    fn malformed_wrapper_is_rejected() {
        assert!(matches!(
            unpack(&JsonPacker, "+{\"not\":\"array\"}"),
            Err(PackError::MalformedWrapper)
        ));
        assert!(matches!(
            unpack(&JsonPacker, "+[1,2,3]"),
            Err(PackError::MalformedWrapper)
        ));
        assert!(matches!(
            unpack(&JsonPacker, "+[\"v\", true]"),
            Err(PackError::MalformedWrapper)
        ));
    }

    #[test]
    fn codec_failure_surfaces() {
        assert!(matches!(
            unpack(&JsonPacker, "-not json"),
            Err(PackError::Deserialize(_))
        ));
    }
}
