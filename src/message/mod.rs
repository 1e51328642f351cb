//! Game messages in their three wire formats.
//!
//! A frame is classified by its first and last character only. Classification is
//! cheap and never fails loudly: anything unrecognized is dropped by the caller.
//! Parsing happens later, on the session's drain task, right before dispatch.

pub mod json;
pub mod xml;
pub mod xt;

pub use json::{JsonCommand, JsonPacket};
pub use xml::{XmlElement, XmlNode};
pub use xt::{XtCommand, XtPacket};

use crate::error::ProtocolError;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Xml,
    Xt,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Xml(XmlElement),
    Xt(XtPacket),
    Json(JsonPacket),
}

/// The two shapes a `login` payload shows up in.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginParams {
    Object(Value),
    Tokens(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Message {
    raw: String,
    format: Format,
    payload: Option<Payload>,
    /// Cleared by a hook to stop the message from being forwarded.
    pub send: bool,
}

impl Message {
    /// `<…>` is XML, `%…%` is Xt, `{…}` is JSON. Anything else is `None`.
    pub fn classify(raw: impl Into<String>) -> Option<Message> {
        let raw = raw.into();
        let mut chars = raw.chars();
        let (first, last) = (chars.next()?, chars.next_back()?);
        let format = match (first, last) {
            ('<', '>') => Format::Xml,
            ('%', '%') => Format::Xt,
            ('{', '}') => Format::Json,
            _ => return None,
        };
        Some(Message {
            raw,
            format,
            payload: None,
            send: true,
        })
    }

    fn from_payload(payload: Payload) -> Message {
        let (format, raw) = match &payload {
            Payload::Xml(e) => (Format::Xml, e.to_wire()),
            Payload::Xt(p) => (Format::Xt, p.to_wire()),
            Payload::Json(p) => (Format::Json, p.to_wire()),
        };
        Message {
            raw,
            format,
            payload: Some(payload),
            send: true,
        }
    }

    /// Builds an outgoing `%`-message, e.g. `["", "xt", "rj", "1", ""]`.
    pub fn xt<I, S>(tokens: I) -> Message
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_payload(Payload::Xt(XtPacket::from_tokens(tokens)))
    }

    pub fn json(value: Value) -> Message {
        Self::from_payload(Payload::Json(JsonPacket::new(value)))
    }

    pub fn xml(element: XmlElement) -> Message {
        Self::from_payload(Payload::Xml(element))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_parsed(&self) -> bool {
        self.payload.is_some()
    }

    /// Parses `raw` into its payload. Calling it again is a no-op.
    pub fn parse(&mut self) -> Result<(), ProtocolError> {
        if self.payload.is_some() {
            return Ok(());
        }
        let payload = match self.format {
            Format::Xml => Payload::Xml(XmlElement::parse(&self.raw)?),
            Format::Xt => Payload::Xt(XtPacket::parse(&self.raw)),
            Format::Json => Payload::Json(JsonPacket::parse(&self.raw)?),
        };
        self.payload = Some(payload);
        Ok(())
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        self.payload.as_mut()
    }

    pub fn as_xt(&self) -> Option<&XtPacket> {
        match &self.payload {
            Some(Payload::Xt(p)) => Some(p),
            _ => None,
        }
    }

    pub fn as_xt_mut(&mut self) -> Option<&mut XtPacket> {
        match &mut self.payload {
            Some(Payload::Xt(p)) => Some(p),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonPacket> {
        match &self.payload {
            Some(Payload::Json(p)) => Some(p),
            _ => None,
        }
    }

    pub fn as_json_mut(&mut self) -> Option<&mut JsonPacket> {
        match &mut self.payload {
            Some(Payload::Json(p)) => Some(p),
            _ => None,
        }
    }

    pub fn as_xml(&self) -> Option<&XmlElement> {
        match &self.payload {
            Some(Payload::Xml(e)) => Some(e),
            _ => None,
        }
    }

    pub fn as_xml_mut(&mut self) -> Option<&mut XmlElement> {
        match &mut self.payload {
            Some(Payload::Xml(e)) => Some(e),
            _ => None,
        }
    }

    /// Routing key for hooks. `None` until parsed.
    pub fn message_type(&self) -> Option<&str> {
        match self.payload.as_ref()? {
            Payload::Xml(e) => Some(e.message_type()),
            Payload::Xt(p) => p.message_type(),
            Payload::Json(p) => p.message_type(),
        }
    }

    /// `login` parameters in whichever shape this message carries them.
    pub fn login_params(&self) -> Option<LoginParams> {
        match self.payload.as_ref()? {
            Payload::Json(p) => match p.command() {
                JsonCommand::Login { params } => Some(LoginParams::Object(params.clone())),
                JsonCommand::Other => None,
            },
            Payload::Xt(p) => match p.command() {
                XtCommand::Login { params } => Some(LoginParams::Tokens(params)),
                _ => None,
            },
            Payload::Xml(_) => None,
        }
    }

    /// Wire form of the current payload, or `raw` if never parsed.
    pub fn to_message(&self) -> String {
        match &self.payload {
            Some(Payload::Xml(e)) => e.to_wire(),
            Some(Payload::Xt(p)) => p.to_wire(),
            Some(Payload::Json(p)) => p.to_wire(),
            None => self.raw.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_by_first_and_last_char() {
        assert_eq!(Message::classify("<a/>").map(|m| m.format()), Some(Format::Xml));
        assert_eq!(Message::classify("%a%b%").map(|m| m.format()), Some(Format::Xt));
        assert_eq!(Message::classify(r#"{"a":1}"#).map(|m| m.format()), Some(Format::Json));
        assert!(Message::classify("plain text").is_none());
        assert!(Message::classify("").is_none());
        assert!(Message::classify("%").is_none());
        assert!(Message::classify("<a/> trailing").is_none());
    }

    #[test]
    fn type_only_after_parse() {
        let mut message = Message::classify("%xt%rj%1%").unwrap();
        assert_eq!(message.message_type(), None);
        message.parse().unwrap();
        assert_eq!(message.message_type(), Some("rj"));
        assert_eq!(message.to_message(), "%xt%rj%1%");
        assert!(message.send);
    }

    #[test]
    fn mutation_changes_wire_form() {
        let mut message = Message::classify("%xt%rj%1%").unwrap();
        message.parse().unwrap();
        message.as_xt_mut().unwrap().tokens_mut()[3] = "9".into();
        assert_eq!(message.to_message(), "%xt%rj%9%");
        assert_eq!(message.raw(), "%xt%rj%1%");
    }

    #[test]
    fn login_in_both_shapes() {
        let mut nested = Message::classify(
            r#"{"t":"xt","b":{"r":-1,"o":{"_cmd":"login","params":{"userName":"pal"}}}}"#,
        )
        .unwrap();
        nested.parse().unwrap();
        assert_eq!(
            nested.login_params(),
            Some(LoginParams::Object(json!({ "userName": "pal" })))
        );

        let mut flat = Message::classify("%xt%login%-1%pal%").unwrap();
        flat.parse().unwrap();
        assert_eq!(
            flat.login_params(),
            Some(LoginParams::Tokens(vec!["-1".into(), "pal".into()]))
        );
    }

    #[test]
    fn broken_json_fails_parse() {
        let mut message = Message::classify("{oops}").unwrap();
        assert!(message.parse().is_err());
        assert!(!message.is_parsed());
        assert_eq!(message.to_message(), "{oops}");
    }

    #[test]
    fn constructors_are_parsed() {
        let message = Message::xt(["", "xt", "ping", ""]);
        assert_eq!(message.message_type(), Some("ping"));
        assert_eq!(message.raw(), "%xt%ping%");

        let message = Message::json(json!({ "t": "sys" }));
        assert_eq!(message.message_type(), Some("sys"));
    }
}
