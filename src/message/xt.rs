//! Percent-delimited messages: `%xt%<cmd>%<arg>%...%`.

pub const XT_DELIMITER: char = '%';

/// Ordered `%` tokens. Empty leading/trailing tokens are kept so an untouched
/// packet serializes back to exactly what arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XtPacket {
    tokens: Vec<String>,
}

/// Typed view over the commands the core itself reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XtCommand {
    RoomJoin { routing_id: i64, room: String },
    /// `login` seen as a flat token list instead of the usual nested object.
    Login { params: Vec<String> },
    Other,
}

impl XtPacket {
    pub fn parse(raw: &str) -> Self {
        XtPacket {
            tokens: raw.split(XT_DELIMITER).map(str::to_string).collect(),
        }
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        XtPacket {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn tokens_mut(&mut self) -> &mut Vec<String> {
        &mut self.tokens
    }

    /// The 3rd token, e.g. `rj` in `%xt%rj%1%`.
    pub fn message_type(&self) -> Option<&str> {
        self.tokens.get(2).map(String::as_str)
    }

    /// Tokens after the command, without the empty trailer.
    pub fn args(&self) -> &[String] {
        let end = match self.tokens.last() {
            Some(last) if last.is_empty() => self.tokens.len() - 1,
            _ => self.tokens.len(),
        };
        self.tokens.get(3..end).unwrap_or(&[])
    }

    pub fn command(&self) -> XtCommand {
        match self.message_type() {
            Some("rj") => {
                let args = self.args();
                match (args.first().map(|a| a.parse::<i64>()), args.get(1)) {
                    (Some(Ok(routing_id)), Some(room)) => XtCommand::RoomJoin {
                        routing_id,
                        room: room.clone(),
                    },
                    _ => XtCommand::Other,
                }
            }
            Some("login") => XtCommand::Login {
                params: self.args().to_vec(),
            },
            _ => XtCommand::Other,
        }
    }

    pub fn to_wire(&self) -> String {
        self.tokens.join("%")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_round_trip() {
        for raw in ["%xt%rj%1%", "%xt%o%cmd%-1%a%%b%", "%a%b%"] {
            assert_eq!(XtPacket::parse(raw).to_wire(), raw);
        }
    }

    #[test]
    fn type_is_third_token() {
        let packet = XtPacket::parse("%xt%rj%1%");
        assert_eq!(packet.message_type(), Some("rj"));
        assert_eq!(packet.args(), &["1".to_string()]);
    }

    #[test]
    fn room_join_view() {
        let packet = XtPacket::parse("%xt%rj%4012%jamaa_township.room_main%");
        assert_eq!(
            packet.command(),
            XtCommand::RoomJoin {
                routing_id: 4012,
                room: "jamaa_township.room_main".to_string()
            }
        );
        // Missing room name falls back to the generic view.
        assert_eq!(XtPacket::parse("%xt%rj%1%").command(), XtCommand::Other);
    }

    #[test]
    fn mutation_is_serialized() {
        let mut packet = XtPacket::parse("%xt%rj%1%");
        packet.tokens_mut()[3] = "2".to_string();
        assert_eq!(packet.to_wire(), "%xt%rj%2%");
    }
}
