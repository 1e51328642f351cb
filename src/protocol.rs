//! jamproxy/src/protocol.rs
//! Wire framing and the protocol rules the session applies before forwarding.

use bytes::{BufMut, BytesMut};
use std::io::Result;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Every message on either leg ends with this byte.
pub const DELIMITER: u8 = 0x00;

// Not a limit, only a warning threshold for a frame that never terminates.
const LARGE_FRAME_WARN: usize = 1 << 20;

/// Messages that must reach the server byte-exact, whatever hooks did to them.
pub const BOOTSTRAP_BLACKLIST: [&str; 3] = ["verChk", "rndK", "login"];

const POLICY_REQUEST: &str = "<policy-file-request/>";

/// NUL-terminated UTF-8 frames.
#[derive(Debug, Default)]
pub struct NullDelimitedCodec {
    warned: bool,
}

impl Decoder for NullDelimitedCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        match src.iter().position(|b| *b == DELIMITER) {
            Some(pos) => {
                let frame = src.split_to(pos + 1);
                self.warned = false;
                Ok(Some(String::from_utf8_lossy(&frame[..pos]).into_owned()))
            }
            None => {
                if src.len() > LARGE_FRAME_WARN && !self.warned {
                    self.warned = true;
                    warn!(pending = src.len(), "Unterminated frame keeps growing");
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        // A trailing partial frame is never emitted.
        let frame = self.decode(src)?;
        if frame.is_none() {
            src.clear();
        }
        Ok(frame)
    }
}

impl Encoder<&str> for NullDelimitedCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(item.as_bytes());
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

/// Push-style splitter over the same codec, for callers that hold raw chunks.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    codec: NullDelimitedCodec,
    pending: BytesMut,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every frame completed by them, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.codec.decode(&mut self.pending) {
            frames.push(frame);
        }
        frames
    }

    /// Bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Appends the delimiter.
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.extend_from_slice(payload.as_bytes());
    buf.push(DELIMITER);
    buf
}

pub fn is_policy_request(raw: &str) -> bool {
    raw.trim() == POLICY_REQUEST
}

pub fn is_bootstrap(message_type: &str) -> bool {
    BOOTSTRAP_BLACKLIST.contains(&message_type)
}

/// The cross-domain policy answered locally, granting port 80 and the listener port.
pub fn policy_response(port: u16) -> String {
    format!(
        "<?xml version=\"1.0\"?>\
         <!DOCTYPE cross-domain-policy SYSTEM \"http://www.adobe.com/xml/dtds/cross-domain-policy.dtd\">\
         <cross-domain-policy><allow-access-from domain=\"*\" to-ports=\"80,{}\" /></cross-domain-policy>",
        port
    )
}
