//! Named messages: the envelope used for announcements, logs, status and
//! device control.
//!
//! A message is an address-style name plus a list of typed arguments,
//! serialized as JSON. Receivers dispatch on `name`.

use serde::{Deserialize, Serialize};

use crate::wire::{WireError, MAX_DATAGRAM};

/// A single message argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Arg {
    Int(i64),
    Float(f64),
    Str(String),
    Blob(Vec<u8>),
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Float(v)
    }
}

impl From<f32> for Arg {
    fn from(v: f32) -> Self {
        Arg::Float(v as f64)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Str(v.to_string())
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Str(v)
    }
}

/// Message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Arg>,
}

impl Message {
    pub fn new(name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let bytes = serde_json::to_vec(self).map_err(|e| WireError::Malformed(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let msg: Message =
            serde_json::from_slice(bytes).map_err(|e| WireError::Malformed(e.to_string()))?;
        if !msg.name.starts_with('/') {
            return Err(WireError::Malformed(format!(
                "message name must start with '/': {:?}",
                msg.name
            )));
        }
        Ok(msg)
    }

    /// Integer argument at `index`.
    pub fn int_arg(&self, index: usize) -> Option<i64> {
        match self.args.get(index)? {
            Arg::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float argument at `index`. Integer arguments are widened.
    pub fn float_arg(&self, index: usize) -> Option<f64> {
        match self.args.get(index)? {
            Arg::Float(v) => Some(*v),
            Arg::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn str_arg(&self, index: usize) -> Option<&str> {
        match self.args.get(index)? {
            Arg::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// Well-known message names.
pub mod names {
    /// `{deviceId:int, text:string}`: device log output.
    pub const DEVICE_LOG: &str = "/device/log";
    /// `{deviceId:int, status:string}`: device status push.
    pub const DEVICE_STATUS: &str = "/device/status";
    /// `{hostname, address, deviceName, id, status}`: periodic announcement.
    pub const DEVICE_ALIVE: &str = "/device/alive";
    /// `{id:int}`: controller assigns the device its ID.
    pub const DEVICE_SET_ID: &str = "/device/set_id";

    pub const RESET: &str = "/device/reset";
    pub const RESET_SOUNDING: &str = "/device/reset_sounding";
    pub const CLEAR_SOUND: &str = "/device/clearsound";
    pub const BLEEP: &str = "/device/bleep";
    /// `{level:float, rampMs:float}`
    pub const GAIN: &str = "/device/gain";

    /// Free-form diagnostics on the sync group.
    pub const SYNC_DIAGNOSTIC: &str = "/sync/diagnostic";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_message_round_trip() {
        let msg = Message::new(names::GAIN, vec![Arg::Float(0.5), Arg::Int(200)]);
        let bytes = msg.encode().unwrap();
        let back = Message::decode(&bytes).unwrap();
        assert!(back.is(names::GAIN));
        assert_eq!(back.float_arg(0), Some(0.5));
        // Integer args widen to float
        assert_eq!(back.float_arg(1), Some(200.0));
        assert_eq!(back.int_arg(0), None);
    }

    #[test]
    fn args_default_to_empty() {
        let back = Message::decode(br#"{"name":"/device/bleep"}"#).unwrap();
        assert!(back.args.is_empty());
    }

    #[test]
    fn name_must_be_an_address() {
        let err = Message::decode(br#"{"name":"bleep","args":[]}"#).unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            Message::decode(b"\x00\x01\x02").unwrap_err(),
            WireError::Malformed(_)
        ));
    }

    #[test]
    fn arg_wire_shape_is_tagged() {
        let json = serde_json::to_string(&Arg::Str("x".into())).unwrap();
        assert_eq!(json, r#"{"type":"str","value":"x"}"#);
    }
}
