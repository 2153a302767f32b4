//! Typed message attributes shared by queues and topics.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{BusError, BusResult};

pub const MAX_MESSAGE_ATTRIBUTES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MessageAttributeValue {
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    /// Base64 encoded, as carried on the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Number,
    Binary,
}

impl MessageAttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        MessageAttributeValue {
            data_type: "String".into(),
            string_value: Some(value.into()),
            binary_value: None,
        }
    }

    pub fn number(value: impl ToString) -> Self {
        MessageAttributeValue {
            data_type: "Number".into(),
            string_value: Some(value.to_string()),
            binary_value: None,
        }
    }

    pub fn binary(bytes: &[u8]) -> Self {
        MessageAttributeValue {
            data_type: "Binary".into(),
            string_value: None,
            binary_value: Some(STANDARD.encode(bytes)),
        }
    }

    /// The base type; custom suffixes such as `Number.int` or `String.Array`
    /// share the behaviour of their base.
    pub fn attribute_type(&self) -> Option<AttributeType> {
        let base = self.data_type.split('.').next().unwrap_or("");
        match base {
            "String" => Some(AttributeType::String),
            "Number" => Some(AttributeType::Number),
            "Binary" => Some(AttributeType::Binary),
            _ => None,
        }
    }

    fn decoded_binary(&self) -> Vec<u8> {
        self.binary_value
            .as_deref()
            .and_then(|b| STANDARD.decode(b).ok())
            .unwrap_or_default()
    }

    fn value_len(&self) -> usize {
        match self.attribute_type() {
            Some(AttributeType::Binary) => self.decoded_binary().len(),
            _ => self.string_value.as_ref().map(|s| s.len()).unwrap_or(0),
        }
    }

    fn validate(&self, name: &str) -> BusResult<()> {
        match self.attribute_type() {
            None => Err(BusError::invalid_parameter(format!(
                "The type of message attribute '{name}' is invalid. You must use only the following supported type prefixes: Binary, Number, String."
            ))),
            Some(AttributeType::Binary) => {
                let value = self.binary_value.as_deref().ok_or_else(|| {
                    BusError::invalid_parameter(format!(
                        "Message attribute '{name}' must contain a non-empty binary value"
                    ))
                })?;
                STANDARD.decode(value).map_err(|_| {
                    BusError::invalid_parameter(format!(
                        "Message attribute '{name}' has an invalid base64 binary value"
                    ))
                })?;
                Ok(())
            }
            Some(AttributeType::Number) => {
                let value = self.string_value.as_deref().unwrap_or("");
                if value.trim().parse::<f64>().is_err() {
                    return Err(BusError::invalid_parameter(format!(
                        "Message attribute '{name}' has an invalid numeric value: {value}"
                    )));
                }
                Ok(())
            }
            Some(AttributeType::String) => {
                match self.string_value.as_deref() {
                    Some(v) if !v.is_empty() => Ok(()),
                    _ => Err(BusError::invalid_parameter(format!(
                        "Message attribute '{name}' must contain a non-empty value of message attribute type 'String'"
                    ))),
                }
            }
        }
    }
}

fn validate_attribute_name(name: &str) -> BusResult<()> {
    let lower = name.to_ascii_lowercase();
    let valid = !name.is_empty()
        && name.len() <= 256
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('.')
        && !name.ends_with('.')
        && !name.contains("..")
        && !lower.starts_with("aws.")
        && !lower.starts_with("amazon.");
    if valid {
        Ok(())
    } else {
        Err(BusError::invalid_parameter(format!(
            "Message attribute name '{name}' is invalid"
        )))
    }
}

pub fn validate_message_attributes(attrs: &HashMap<String, MessageAttributeValue>) -> BusResult<()> {
    if attrs.len() > MAX_MESSAGE_ATTRIBUTES {
        return Err(BusError::invalid_parameter(format!(
            "Number of message attributes [{}] exceeds the allowed maximum [{}].",
            attrs.len(),
            MAX_MESSAGE_ATTRIBUTES
        )));
    }
    for (name, value) in attrs {
        validate_attribute_name(name)?;
        value.validate(name)?;
    }
    Ok(())
}

/// Bytes counted against the maximum message size: name, type and value of
/// every attribute.
pub fn attributes_size(attrs: &HashMap<String, MessageAttributeValue>) -> usize {
    attrs
        .iter()
        .map(|(name, value)| name.len() + value.data_type.len() + value.value_len())
        .sum()
}

pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Digest clients compare against `MD5OfMessageAttributes`: attributes sorted
/// by name, each encoded as length-prefixed name, length-prefixed type, a
/// transport byte (1 = string, 2 = binary) and the length-prefixed value.
pub fn md5_of_attributes(attrs: &HashMap<String, MessageAttributeValue>) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }
    let mut names: Vec<&String> = attrs.keys().collect();
    names.sort();

    let mut buf: Vec<u8> = Vec::new();
    let push_prefixed = |buf: &mut Vec<u8>, bytes: &[u8]| {
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(bytes);
    };
    for name in names {
        let attr = &attrs[name];
        push_prefixed(&mut buf, name.as_bytes());
        push_prefixed(&mut buf, attr.data_type.as_bytes());
        if attr.attribute_type() == Some(AttributeType::Binary) {
            buf.push(2);
            push_prefixed(&mut buf, &attr.decoded_binary());
        } else {
            buf.push(1);
            push_prefixed(
                &mut buf,
                attr.string_value.as_deref().unwrap_or("").as_bytes(),
            );
        }
    }

    Some(md5_hex(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, MessageAttributeValue)]) -> HashMap<String, MessageAttributeValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn rejects_reserved_and_malformed_names() {
        for bad in ["AWS.trace", "amazon.x", ".lead", "trail.", "a..b", "sp ace"] {
            let map = attrs(&[(bad, MessageAttributeValue::string("v"))]);
            assert!(validate_message_attributes(&map).is_err(), "{bad}");
        }
        let map = attrs(&[("kind.v2", MessageAttributeValue::string("order"))]);
        assert!(validate_message_attributes(&map).is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let bad_number = attrs(&[("n", MessageAttributeValue::number("12x"))]);
        assert!(validate_message_attributes(&bad_number).is_err());

        let bad_type = MessageAttributeValue {
            data_type: "Boolean".into(),
            string_value: Some("true".into()),
            binary_value: None,
        };
        assert!(validate_message_attributes(&attrs(&[("b", bad_type)])).is_err());

        let empty = attrs(&[("s", MessageAttributeValue::string(""))]);
        assert!(validate_message_attributes(&empty).is_err());
    }

    #[test]
    fn too_many_attributes() {
        let map: HashMap<_, _> = (0..11)
            .map(|i| (format!("a{i}"), MessageAttributeValue::string("v")))
            .collect();
        assert!(validate_message_attributes(&map).is_err());
    }

    #[test]
    fn size_counts_decoded_binary() {
        let map = attrs(&[
            ("kind", MessageAttributeValue::string("order")),
            ("blob", MessageAttributeValue::binary(&[1, 2, 3])),
        ]);
        assert_eq!(attributes_size(&map), (4 + 6 + 5) + (4 + 6 + 3));
    }

    #[test]
    fn md5_of_attributes_matches_reference() {
        let map = attrs(&[("kind", MessageAttributeValue::string("order"))]);
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"kind");
        buf.extend_from_slice(&6u32.to_be_bytes());
        buf.extend_from_slice(b"String");
        buf.push(1);
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"order");
        assert_eq!(md5_of_attributes(&map), Some(md5_hex(&buf)));
        assert_eq!(md5_of_attributes(&HashMap::new()), None);
    }
}
