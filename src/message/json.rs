//! JSON messages, e.g. `{"t":"xt","b":{"r":-1,"o":{"_cmd":"login","params":{...}}}}`.

use crate::error::ProtocolError;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct JsonPacket {
    value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JsonCommand<'a> {
    Login { params: &'a Value },
    Other,
}

impl JsonPacket {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(JsonPacket {
            value: serde_json::from_str(raw)?,
        })
    }

    pub fn new(value: Value) -> Self {
        JsonPacket { value }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// `b.o._cmd`, falling back to the top-level `t`.
    pub fn message_type(&self) -> Option<&str> {
        self.value
            .pointer("/b/o/_cmd")
            .and_then(Value::as_str)
            .or_else(|| self.value.get("t").and_then(Value::as_str))
    }

    pub fn command(&self) -> JsonCommand<'_> {
        match (self.message_type(), self.value.pointer("/b/o/params")) {
            (Some("login"), Some(params)) => JsonCommand::Login { params },
            _ => JsonCommand::Other,
        }
    }

    pub fn to_wire(&self) -> String {
        self.value.to_string()
    }
}
