//! Notifications and replies sent from the server to the client.

use std::{borrow::Cow, str::FromStr, time::Duration};

use crate::{
    codec::escape::unescape,
    error::{ServerError, TlcpError, TlcpResult},
    types::{DiffFormat, RequestId, SubscriptionId},
};

/// One positional value of an update line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateValue {
    /// Replace the field; `None` is the null value.
    Text(Option<String>),
    /// Leave this many fields unchanged.
    Unchanged(u16),
    /// Patch the previous value of the field.
    Patch { format: DiffFormat, diff: String },
}

/// Message sent from the server to the client.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    ClearSnapshot {
        subscription_id: SubscriptionId,
        item: u32,
    },
    ClientIp {
        ip: String,
    },
    Configuration {
        subscription_id: SubscriptionId,
        max_frequency: Option<f32>,
        filtered: bool,
    },
    ConnectionOk {
        session_id: String,
        request_limit: u32,
        keep_alive: Option<Duration>,
        control_link: Option<String>,
    },
    ConnectionError {
        code: i32,
        message: String,
    },
    Constraint {
        bandwidth: Option<f32>,
    },
    Error {
        code: i32,
        message: String,
    },
    End {
        code: i32,
        message: String,
    },
    EndOfSnapshot {
        subscription_id: SubscriptionId,
        item: u32,
    },
    Loop {
        expected_delay: Duration,
    },
    MessageDone {
        sequence: Option<String>,
        prog: u64,
        response: String,
    },
    MessageFail {
        sequence: Option<String>,
        prog: u64,
        code: i32,
        message: String,
    },
    NoOp,
    Overflow {
        subscription_id: SubscriptionId,
        item: u32,
        size: u32,
    },
    Probe,
    Progressive {
        progressive: u64,
    },
    RequestOk {
        request_id: RequestId,
    },
    RequestError {
        request_id: RequestId,
        code: i32,
        message: String,
    },
    Synchronize {
        seconds: u64,
    },
    SubscriptionOk {
        subscription_id: SubscriptionId,
        item_count: u16,
        field_count: u16,
    },
    SubscriptionCommandOk {
        subscription_id: SubscriptionId,
        item_count: u16,
        field_count: u16,
        key_field: u16,
        command_field: u16,
    },
    ServerName {
        name: String,
    },
    UnsubscriptionOk {
        subscription_id: SubscriptionId,
    },
    Update {
        subscription_id: SubscriptionId,
        item: u32,
        values: Vec<UpdateValue>,
    },
}

impl ServerMessage {
    /// Build a message from the fields of one line.
    pub fn from_fields(fields: &[Cow<'_, str>]) -> TlcpResult<Self> {
        let line = Line { fields };
        let message = match line.get(0)? {
            "CLIENTIP" => Self::ClientIp {
                ip: line.text(1)?,
            },
            "CONF" => Self::Configuration {
                subscription_id: line.subscription(1)?,
                max_frequency: line.get(2)?.parse().ok(),
                filtered: line.get(3)? == "filtered",
            },
            "CONS" => Self::Constraint {
                bandwidth: line.get(1)?.parse().ok(),
            },
            "CONERR" => Self::ConnectionError {
                code: line.parse(1)?,
                message: line.text(2)?,
            },
            "CONOK" => Self::ConnectionOk {
                session_id: line.get(1)?.to_string(),
                request_limit: line.parse(2)?,
                keep_alive: line
                    .optional(3)?
                    .map(|millis| parse_field::<u64>(millis).map(Duration::from_millis))
                    .transpose()?,
                control_link: line.optional(4)?.map(str::to_string),
            },
            "CS" => Self::ClearSnapshot {
                subscription_id: line.subscription(1)?,
                item: line.parse(2)?,
            },
            "END" => Self::End {
                code: line.parse(1)?,
                message: line.text(2)?,
            },
            "EOS" => Self::EndOfSnapshot {
                subscription_id: line.subscription(1)?,
                item: line.parse(2)?,
            },
            "ERROR" => Self::Error {
                code: line.parse(1)?,
                message: line.text(2)?,
            },
            "LOOP" => Self::Loop {
                expected_delay: Duration::from_millis(line.parse(1)?),
            },
            "MSGDONE" => Self::MessageDone {
                sequence: line.optional(1)?.map(str::to_string),
                prog: line.parse(2)?,
                response: line.text(3)?,
            },
            "MSGFAIL" => Self::MessageFail {
                sequence: line.optional(1)?.map(str::to_string),
                prog: line.parse(2)?,
                code: line.parse(3)?,
                message: line.text(4)?,
            },
            "NOOP" => Self::NoOp,
            "OV" => Self::Overflow {
                subscription_id: line.subscription(1)?,
                item: line.parse(2)?,
                size: line.parse(3)?,
            },
            "PROBE" => Self::Probe,
            "PROG" => Self::Progressive {
                progressive: line.parse(1)?,
            },
            "UNSUB" => Self::UnsubscriptionOk {
                subscription_id: line.subscription(1)?,
            },
            "REQOK" => Self::RequestOk {
                request_id: RequestId::from(line.get(1)?),
            },
            "REQERR" => Self::RequestError {
                request_id: RequestId::from(line.get(1)?),
                code: line.parse(2)?,
                message: line.text(3)?,
            },
            "SERVNAME" => Self::ServerName {
                name: line.text(1)?,
            },
            "SYNC" => Self::Synchronize {
                seconds: line.parse(1)?,
            },
            "SUBOK" => Self::SubscriptionOk {
                subscription_id: line.subscription(1)?,
                item_count: line.parse(2)?,
                field_count: line.parse(3)?,
            },
            "SUBCMD" => Self::SubscriptionCommandOk {
                subscription_id: line.subscription(1)?,
                item_count: line.parse(2)?,
                field_count: line.parse(3)?,
                key_field: line.parse(4)?,
                command_field: line.parse(5)?,
            },
            "U" => Self::Update {
                subscription_id: line.subscription(1)?,
                item: line.parse(2)?,
                values: fields
                    .iter()
                    .skip(3)
                    .map(|value| parse_update_value(value))
                    .collect::<TlcpResult<_>>()?,
            },
            tag => return Err(TlcpError::decode(format!("Unknown message: {tag}"))),
        };
        Ok(message)
    }

    /// Subscription this message refers to, if any.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        match self {
            Self::ClearSnapshot {
                subscription_id, ..
            }
            | Self::Configuration {
                subscription_id, ..
            }
            | Self::EndOfSnapshot {
                subscription_id, ..
            }
            | Self::Overflow {
                subscription_id, ..
            }
            | Self::SubscriptionOk {
                subscription_id, ..
            }
            | Self::SubscriptionCommandOk {
                subscription_id, ..
            }
            | Self::UnsubscriptionOk { subscription_id }
            | Self::Update {
                subscription_id, ..
            } => Some(*subscription_id),
            _ => None,
        }
    }

    /// Whether this message counts towards the recovery progressive.
    ///
    /// Subscription events and message outcomes are data notifications.
    pub fn is_data_notification(&self) -> bool {
        self.subscription_id().is_some()
            || matches!(self, Self::MessageDone { .. } | Self::MessageFail { .. })
    }

    /// Session-fatal server exception carried by this message.
    pub fn server_error(&self) -> Option<ServerError> {
        match self {
            Self::ConnectionError { code, message } => Some(ServerError::ConnectionError {
                code: *code,
                message: message.clone(),
            }),
            Self::End { code, message } => Some(ServerError::End {
                code: *code,
                message: message.clone(),
            }),
            Self::Error { code, message } => Some(ServerError::Error {
                code: *code,
                message: message.clone(),
            }),
            _ => None,
        }
    }

    /// Wire tag, for diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ClearSnapshot { .. } => "CS",
            Self::ClientIp { .. } => "CLIENTIP",
            Self::Configuration { .. } => "CONF",
            Self::ConnectionOk { .. } => "CONOK",
            Self::ConnectionError { .. } => "CONERR",
            Self::Constraint { .. } => "CONS",
            Self::Error { .. } => "ERROR",
            Self::End { .. } => "END",
            Self::EndOfSnapshot { .. } => "EOS",
            Self::Loop { .. } => "LOOP",
            Self::MessageDone { .. } => "MSGDONE",
            Self::MessageFail { .. } => "MSGFAIL",
            Self::NoOp => "NOOP",
            Self::Overflow { .. } => "OV",
            Self::Probe => "PROBE",
            Self::Progressive { .. } => "PROG",
            Self::RequestOk { .. } => "REQOK",
            Self::RequestError { .. } => "REQERR",
            Self::Synchronize { .. } => "SYNC",
            Self::SubscriptionOk { .. } => "SUBOK",
            Self::SubscriptionCommandOk { .. } => "SUBCMD",
            Self::ServerName { .. } => "SERVNAME",
            Self::UnsubscriptionOk { .. } => "UNSUB",
            Self::Update { .. } => "U",
        }
    }
}

struct Line<'a, 'b> {
    fields: &'a [Cow<'b, str>],
}

impl Line<'_, '_> {
    fn get(&self, index: usize) -> TlcpResult<&str> {
        self.fields.get(index).map(|field| field.as_ref()).ok_or_else(|| {
            TlcpError::decode(format!(
                "Missing field {index} in line: {}",
                self.fields.join(",")
            ))
        })
    }

    fn parse<T: FromStr>(&self, index: usize) -> TlcpResult<T> {
        parse_field(self.get(index)?)
    }

    fn subscription(&self, index: usize) -> TlcpResult<SubscriptionId> {
        self.parse(index).map(SubscriptionId)
    }

    /// Unescaped text field.
    fn text(&self, index: usize) -> TlcpResult<String> {
        Ok(unescape(self.get(index)?)?.into_owned())
    }

    /// Field where `*` stands for an absent value.
    fn optional(&self, index: usize) -> TlcpResult<Option<&str>> {
        self.get(index).map(|field| Some(field).filter(|field| *field != "*"))
    }
}

fn parse_field<T: FromStr>(field: &str) -> TlcpResult<T> {
    field
        .parse()
        .map_err(|_| TlcpError::decode(format!("Invalid field value: {field}")))
}

fn parse_update_value(value: &str) -> TlcpResult<UpdateValue> {
    match value {
        "" => Ok(UpdateValue::Unchanged(1)),
        "$" => Ok(UpdateValue::Text(Some(String::new()))),
        "#" => Ok(UpdateValue::Text(None)),
        _ => match value.strip_prefix('^') {
            None => Ok(UpdateValue::Text(Some(unescape(value)?.into_owned()))),
            Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => {
                parse_field(rest).map(UpdateValue::Unchanged)
            }
            Some(rest) => {
                let mut chars = rest.chars();
                let code = chars
                    .next()
                    .ok_or_else(|| TlcpError::decode("Empty diff marker in update"))?;
                let format = DiffFormat::from_code(code)
                    .ok_or_else(|| TlcpError::decode(format!("Unknown diff format: {code}")))?;
                Ok(UpdateValue::Patch {
                    format,
                    diff: unescape(chars.as_str())?.into_owned(),
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> TlcpResult<ServerMessage> {
        let fields: Vec<Cow<'_, str>> = line.split(',').map(Cow::Borrowed).collect();
        ServerMessage::from_fields(&fields)
    }

    #[test]
    fn test_connection_ok() {
        let message = parse("CONOK,S1,50000,5000,*").expect("valid");
        assert_eq!(
            message,
            ServerMessage::ConnectionOk {
                session_id: "S1".into(),
                request_limit: 50000,
                keep_alive: Some(Duration::from_millis(5000)),
                control_link: None,
            }
        );

        let message = parse("CONOK,S2,50000,5000,node1.example.com").expect("valid");
        assert!(matches!(
            message,
            ServerMessage::ConnectionOk { control_link: Some(ref link), .. } if link == "node1.example.com"
        ));
    }

    #[test]
    fn test_errors_are_unescaped() {
        assert_eq!(
            parse("CONERR,4,bad%20adapter").expect("valid"),
            ServerMessage::ConnectionError {
                code: 4,
                message: "bad adapter".into()
            }
        );
        let end = parse("END,31,closed").expect("valid");
        assert_eq!(
            end.server_error(),
            Some(ServerError::End {
                code: 31,
                message: "closed".into()
            })
        );
    }

    #[test]
    fn test_configuration_and_constraint() {
        assert_eq!(
            parse("CONF,3,unlimited,filtered").expect("valid"),
            ServerMessage::Configuration {
                subscription_id: SubscriptionId(3),
                max_frequency: None,
                filtered: true,
            }
        );
        assert_eq!(
            parse("CONF,3,2.5,unfiltered").expect("valid"),
            ServerMessage::Configuration {
                subscription_id: SubscriptionId(3),
                max_frequency: Some(2.5),
                filtered: false,
            }
        );
        assert_eq!(
            parse("CONS,unlimited").expect("valid"),
            ServerMessage::Constraint { bandwidth: None }
        );
    }

    #[test]
    fn test_message_results() {
        assert_eq!(
            parse("MSGDONE,*,1,OK").expect("valid"),
            ServerMessage::MessageDone {
                sequence: None,
                prog: 1,
                response: "OK".into()
            }
        );
        assert_eq!(
            parse("MSGFAIL,orders,2,-5,rejected").expect("valid"),
            ServerMessage::MessageFail {
                sequence: Some("orders".into()),
                prog: 2,
                code: -5,
                message: "rejected".into()
            }
        );
    }

    #[test]
    fn test_subscription_messages() {
        assert_eq!(
            parse("SUBCMD,2,1,4,1,2").expect("valid"),
            ServerMessage::SubscriptionCommandOk {
                subscription_id: SubscriptionId(2),
                item_count: 1,
                field_count: 4,
                key_field: 1,
                command_field: 2,
            }
        );
        assert_eq!(
            parse("OV,2,1,12").expect("valid"),
            ServerMessage::Overflow {
                subscription_id: SubscriptionId(2),
                item: 1,
                size: 12
            }
        );
    }

    #[test]
    fn test_update_values() {
        let fields: Vec<Cow<'_, str>> = ["U", "1", "1", "", "^3", "$", "#", "a%2Cb", "^Tbd%25"]
            .into_iter()
            .map(Cow::Borrowed)
            .collect();
        let message = ServerMessage::from_fields(&fields).expect("valid");
        assert_eq!(
            message,
            ServerMessage::Update {
                subscription_id: SubscriptionId(1),
                item: 1,
                values: vec![
                    UpdateValue::Unchanged(1),
                    UpdateValue::Unchanged(3),
                    UpdateValue::Text(Some(String::new())),
                    UpdateValue::Text(None),
                    UpdateValue::Text(Some("a,b".into())),
                    UpdateValue::Patch {
                        format: DiffFormat::TlcpDiff,
                        diff: "bd%".into()
                    },
                ],
            }
        );
    }

    #[test]
    fn test_json_patch_marker() {
        let fields: Vec<Cow<'_, str>> = ["U", "1", "1", "^P[]"].into_iter().map(Cow::Borrowed).collect();
        let message = ServerMessage::from_fields(&fields).expect("valid");
        assert!(matches!(
            message,
            ServerMessage::Update { ref values, .. }
                if values[0] == UpdateValue::Patch { format: DiffFormat::JsonPatch, diff: "[]".into() }
        ));
    }

    #[test]
    fn test_classification() {
        assert!(parse("U,1,1,a").expect("valid").is_data_notification());
        assert!(parse("SUBOK,1,1,1").expect("valid").is_data_notification());
        assert!(parse("UNSUB,1").expect("valid").is_data_notification());
        assert!(parse("MSGDONE,*,1,").expect("valid").is_data_notification());
        assert!(!parse("REQOK,s1").expect("valid").is_data_notification());
        assert!(!parse("PROG,4").expect("valid").is_data_notification());
        assert!(!parse("NOOP").expect("valid").is_data_notification());
        assert!(!parse("LOOP,0").expect("valid").is_data_notification());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(parse("BOGUS,1"), Err(TlcpError::Decode { .. })));
        assert!(matches!(parse("SUBOK,1,1"), Err(TlcpError::Decode { .. })));
        assert!(matches!(parse("PROG,x"), Err(TlcpError::Decode { .. })));
        assert!(matches!(parse("SUBOK,1,70000,1"), Err(TlcpError::Decode { .. })));
    }
}
