use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Largest data payload the board returns for a single read.
pub const MAX_DATA_LEN: usize = 256;

/// Commands understood by the sensor board firmware.
///
/// The wire form is plain ASCII without a terminator and must stay
/// byte-for-byte compatible with the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    ReadHoldingRegisters {
        bus: u8,
        node: u8,
        address: u16,
        size: u16,
    },
    GetCpuid,
    GetVersion,
}

impl fmt::Display for SensorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorCommand::ReadHoldingRegisters {
                bus,
                node,
                address,
                size,
            } => write!(f, "read_hold_reg({bus},{node},{address},{size})"),
            SensorCommand::GetCpuid => write!(f, "get_cpuid_code()"),
            SensorCommand::GetVersion => write!(f, "get_version()"),
        }
    }
}

impl SensorCommand {
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

/// A decoded JSON object received from the sensor board.
///
/// Fields are defined by the firmware; the accessors below cover the ones
/// the bridge relies on and ignore anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InboundMessage(Map<String, Value>);

impl InboundMessage {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Status code reported by the board, `0` meaning success.
    pub fn status(&self) -> Option<i64> {
        self.0.get("status").and_then(Value::as_i64)
    }

    /// Register payload of a read response.
    ///
    /// Returns `None` when the field is missing, longer than
    /// [`MAX_DATA_LEN`] or holds anything but 16-bit unsigned integers.
    pub fn data(&self) -> Option<Vec<u16>> {
        let items = self.0.get("data")?.as_array()?;
        if items.len() > MAX_DATA_LEN {
            return None;
        }
        items
            .iter()
            .map(|v| v.as_u64().and_then(|n| u16::try_from(n).ok()))
            .collect()
    }

    pub fn cpuid(&self) -> Option<String> {
        match self.0.get("CPUID")? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Serialize back to the wire form the board uses.
    pub fn to_bytes(&self) -> Vec<u8> {
        Value::Object(self.0.clone()).to_string().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: Value) -> InboundMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_command_wire_format() {
        let cmd = SensorCommand::ReadHoldingRegisters {
            bus: 1,
            node: 3,
            address: 0,
            size: 4,
        };
        assert_eq!(cmd.encode(), b"read_hold_reg(1,3,0,4)".to_vec());
        assert_eq!(SensorCommand::GetCpuid.encode(), b"get_cpuid_code()".to_vec());
        assert_eq!(SensorCommand::GetVersion.encode(), b"get_version()".to_vec());
    }

    #[test]
    fn test_data_accessor() {
        let msg = message(json!({"status": 0, "data": [0, 5]}));
        assert_eq!(msg.status(), Some(0));
        assert_eq!(msg.data(), Some(vec![0, 5]));

        assert_eq!(message(json!({"status": 3})).data(), None);
        assert_eq!(message(json!({"data": [1, "x"]})).data(), None);
        assert_eq!(message(json!({"data": [70000]})).data(), None);

        let oversized: Vec<u16> = vec![1; MAX_DATA_LEN + 1];
        assert_eq!(message(json!({ "data": oversized })).data(), None);
    }

    #[test]
    fn test_cpuid_accessor() {
        assert_eq!(
            message(json!({"CPUID": "0x1234ABCD"})).cpuid(),
            Some("0x1234ABCD".to_string())
        );
        assert_eq!(message(json!({"CPUID": ""})).cpuid(), None);
        assert_eq!(message(json!({"cpu": "1"})).cpuid(), None);
    }
}
