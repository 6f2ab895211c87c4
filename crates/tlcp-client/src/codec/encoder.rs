//! Request encoder.

use super::{
    constants::{CRLF, PARAMETER_SEPARATOR, SEND_THRESHOLD},
    escape::escape_into,
};
use crate::message::{ClientMessage, CreateSession, RequestName};

/// Writes requests into a reusable text buffer.
///
/// A frame starts with [`encode`](Self::encode); further requests with the
/// same name may be appended with
/// [`encode_parameters`](Self::encode_parameters).
#[derive(Debug, Default)]
pub struct TlcpEncoder {
    buffer: String,
    frame: Option<RequestName>,
}

impl TlcpEncoder {
    pub fn new() -> Self {
        Self {
            buffer: String::with_capacity(128),
            frame: None,
        }
    }

    /// Append the request line and the parameters of `message`.
    pub fn encode(&mut self, message: &ClientMessage) {
        let name = message.name();
        self.buffer.push_str(name.as_str());
        self.buffer.push_str(CRLF);
        self.frame.get_or_insert(name);
        self.encode_parameters(message);
    }

    /// Append only the parameter line of `message`.
    pub fn encode_parameters(&mut self, message: &ClientMessage) {
        for (index, parameter) in message.parameters().iter().enumerate() {
            if index > 0 {
                self.buffer.push(PARAMETER_SEPARATOR);
            }
            self.buffer.push_str(parameter.key);
            self.buffer.push('=');
            if parameter.escape {
                escape_into(&mut self.buffer, &parameter.value);
            } else {
                self.buffer.push_str(&parameter.value);
            }
        }
        self.buffer.push_str(CRLF);
    }

    /// Whether `message` may be appended to the current frame.
    ///
    /// Only `control` and `msg` requests are batched, only with requests of
    /// the same name, and only while the frame is below the send threshold.
    pub fn accepts(&self, message: &ClientMessage) -> bool {
        let name = message.name();
        self.frame == Some(name) && name.is_batchable() && self.buffer.len() < SEND_THRESHOLD
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    /// Take the encoded frame, leaving the encoder ready for the next one.
    pub fn take_frame(&mut self) -> String {
        self.frame = None;
        let capacity = self.buffer.capacity();
        std::mem::replace(&mut self.buffer, String::with_capacity(capacity))
    }

    pub fn clear(&mut self) {
        self.frame = None;
        self.buffer.clear();
    }
}

/// Encode a single request.
pub fn encode(message: &ClientMessage) -> String {
    let mut encoder = TlcpEncoder::new();
    encoder.encode(message);
    encoder.take_frame()
}

/// Body of a one-shot `create_session` request carrying unacknowledged
/// messages, for stateless HTTP delivery.
pub fn encode_combo_request<'a>(
    create: &CreateSession,
    messages: impl IntoIterator<Item = &'a str>,
) -> String {
    let mut encoder = TlcpEncoder::new();
    encoder.encode_parameters(&ClientMessage::CreateSession(create.clone()));
    let mut body = encoder.take_frame();
    for message in messages {
        body.push_str("LS_message=");
        escape_into(&mut body, message);
        body.push_str("&LS_outcome=false");
        body.push_str(CRLF);
    }
    body
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        field_list::FieldList,
        message::{BindSession, SendMessage, Subscribe, Unsubscribe},
        types::{DiffFormat, SubscriptionId, SubscriptionMode},
    };

    fn subscribe(id: u32) -> ClientMessage {
        ClientMessage::Subscribe(Subscribe {
            subscription_id: SubscriptionId(id),
            data_adapter: "QUOTE".into(),
            mode: SubscriptionMode::Merge,
            item_group: "item&1".into(),
            fields: FieldList::new(["last", "bid"]),
            request_snapshot: false,
            ack: false,
        })
    }

    #[test]
    fn test_heartbeat() {
        assert_eq!(encode(&ClientMessage::Heartbeat), "heartbeat\r\n\r\n");
    }

    #[test]
    fn test_subscribe_is_escaped() {
        assert_eq!(
            encode(&subscribe(1)),
            "control\r\nLS_reqId=s1&LS_subId=1&LS_op=add&LS_data_adapter=QUOTE&LS_mode=MERGE\
             &LS_group=item%261&LS_schema=bid last&LS_snapshot=false&LS_ack=false\r\n"
        );
    }

    #[test]
    fn test_create_session() {
        let mut create = CreateSession::new("DEFAULT");
        create.keep_alive = Some(Duration::from_millis(5000));
        create.supported_diffs = vec![DiffFormat::TlcpDiff];
        create.reduce_head = true;
        assert_eq!(
            encode(&ClientMessage::CreateSession(create)),
            "create_session\r\nLS_cid=mgQkwtwdysogQz2BJ4Ji kOj2Bg&LS_keepalive_millis=5000\
             &LS_supported_diffs=T&LS_reduce_head=true\r\n"
        );
    }

    #[test]
    fn test_message_escaping() {
        let message = SendMessage::new("a=1&b=2\r\n", None, Some(7))
            .expect("valid")
            .ack(false);
        assert_eq!(
            encode(&ClientMessage::Message(message)),
            "msg\r\nLS_reqId=m7&LS_message=a%3D1%26b%3D2%0D%0A&LS_ack=false&LS_msg_prog=7\r\n"
        );
    }

    #[test]
    fn test_batch_of_controls() {
        let mut encoder = TlcpEncoder::new();
        encoder.encode(&subscribe(1));
        let unsubscribe = ClientMessage::Unsubscribe(Unsubscribe {
            subscription_id: SubscriptionId(1),
        });
        assert!(encoder.accepts(&unsubscribe));
        encoder.encode_parameters(&unsubscribe);
        assert!(!encoder.accepts(&ClientMessage::Heartbeat));
        assert!(!encoder.accepts(&ClientMessage::BindSession(BindSession::new("S1"))));

        let frame = encoder.take_frame();
        assert!(frame.starts_with("control\r\nLS_reqId=s1&"));
        assert!(frame.ends_with("\r\nLS_reqId=u1&LS_subId=1&LS_op=delete\r\n"));
        assert_eq!(frame.matches("control").count(), 1);
        assert!(encoder.is_empty());
    }

    #[test]
    fn test_batch_stops_at_threshold() {
        let mut encoder = TlcpEncoder::new();
        encoder.encode(&subscribe(0));
        let mut id = 1;
        while encoder.accepts(&subscribe(id)) {
            encoder.encode_parameters(&subscribe(id));
            id += 1;
        }
        assert!(encoder.len() >= SEND_THRESHOLD);
        assert!(id > 1);
    }

    #[test]
    fn test_heartbeat_frames_are_never_batched() {
        let mut encoder = TlcpEncoder::new();
        encoder.encode(&ClientMessage::Heartbeat);
        assert!(!encoder.accepts(&ClientMessage::Heartbeat));
    }

    #[test]
    fn test_combo_request() {
        let mut create = CreateSession::new("DEMO");
        create.polling = Some(Duration::ZERO);
        let body = encode_combo_request(&create, ["hello", "a&b"]);
        assert_eq!(
            body,
            "LS_adapter_set=DEMO&LS_cid=mgQkwtwdysogQz2BJ4Ji kOj2Bg&LS_polling=true\
             &LS_polling_millis=0&LS_supported_diffs=\r\n\
             LS_message=hello&LS_outcome=false\r\n\
             LS_message=a%26b&LS_outcome=false\r\n"
        );
    }
}
