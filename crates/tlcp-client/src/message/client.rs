//! Requests sent from the client to the server.

use std::{
    borrow::Cow,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::{
    error::{TlcpError, TlcpResult},
    field_list::FieldList,
    types::{Credentials, DiffFormat, RequestId, SubscriptionId, SubscriptionMode, Ttl},
};

/// Client identifier announced on session creation.
pub const CLIENT_CID: &str = "mgQkwtwdysogQz2BJ4Ji kOj2Bg";

/// Adapter set used when none is configured; never sent on the wire.
pub const DEFAULT_ADAPTER_SET: &str = "DEFAULT";

static MESSAGE_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

/// Request line name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestName {
    BindSession,
    Control,
    CreateSession,
    Heartbeat,
    Message,
}

impl RequestName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BindSession => "bind_session",
            Self::Control => "control",
            Self::CreateSession => "create_session",
            Self::Heartbeat => "heartbeat",
            Self::Message => "msg",
        }
    }

    /// Whether consecutive requests with this name may share one frame.
    pub fn is_batchable(self) -> bool {
        matches!(self, Self::Control | Self::Message)
    }
}

/// A single `key=value` request parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter<'a> {
    pub key: &'static str,
    pub value: Cow<'a, str>,
    /// Whether the value may contain reserved characters.
    pub escape: bool,
}

/// Collects parameters, skipping absent values.
#[derive(Default)]
struct Parameters<'a>(Vec<Parameter<'a>>);

impl<'a> Parameters<'a> {
    fn text(&mut self, key: &'static str, value: Option<&'a str>, escape: bool) -> &mut Self {
        if let Some(value) = value {
            self.0.push(Parameter {
                key,
                value: Cow::Borrowed(value),
                escape,
            });
        }
        self
    }

    fn owned(&mut self, key: &'static str, value: Option<String>, escape: bool) -> &mut Self {
        if let Some(value) = value {
            self.0.push(Parameter {
                key,
                value: Cow::Owned(value),
                escape,
            });
        }
        self
    }

    fn number(&mut self, key: &'static str, value: Option<impl fmt::Display>) -> &mut Self {
        self.owned(key, value.map(|value| value.to_string()), false)
    }

    fn millis(&mut self, key: &'static str, value: Option<Duration>) -> &mut Self {
        self.number(key, value.map(|value| value.as_millis()))
    }

    fn flag(&mut self, key: &'static str, value: Option<bool>) -> &mut Self {
        self.text(key, value.map(|value| if value { "true" } else { "false" }), false)
    }

    fn finish(&mut self) -> Vec<Parameter<'a>> {
        std::mem::take(&mut self.0)
    }
}

/// `create_session` request.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateSession {
    pub adapter_set: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Option<Duration>,
    pub inactivity: Option<Duration>,
    /// Requests a polling session when set.
    pub polling: Option<Duration>,
    pub supported_diffs: Vec<DiffFormat>,
    pub reduce_head: bool,
    pub ttl: Ttl,
    pub send_sync: bool,
}

impl CreateSession {
    pub fn new(adapter_set: impl Into<String>) -> Self {
        Self {
            adapter_set: adapter_set.into(),
            credentials: None,
            keep_alive: None,
            inactivity: None,
            polling: None,
            supported_diffs: Vec::new(),
            reduce_head: false,
            ttl: Ttl::Unknown,
            send_sync: true,
        }
    }

    fn parameters(&self) -> Vec<Parameter<'_>> {
        let streaming = self.polling.is_none();
        let diffs: String = self.supported_diffs.iter().map(|diff| diff.code()).collect();
        let ttl = match self.ttl {
            Ttl::Unknown => None,
            Ttl::Unlimited => Some("unlimited".to_string()),
            Ttl::Millis(millis) => Some(millis.to_string()),
        };
        Parameters::default()
            .text(
                "LS_adapter_set",
                Some(self.adapter_set.as_str()).filter(|name| *name != DEFAULT_ADAPTER_SET),
                true,
            )
            .text("LS_cid", Some(CLIENT_CID), true)
            .text(
                "LS_user",
                self.credentials.as_ref().map(|c| c.user.as_str()),
                true,
            )
            .text(
                "LS_password",
                self.credentials
                    .as_ref()
                    .map(|c| c.password.as_str())
                    .filter(|password| !password.is_empty()),
                true,
            )
            .millis("LS_keepalive_millis", self.keep_alive.filter(|_| streaming))
            .millis("LS_inactivity_millis", self.inactivity.filter(|_| streaming))
            .flag("LS_polling", self.polling.map(|_| true))
            .millis("LS_polling_millis", self.polling)
            .owned("LS_supported_diffs", Some(diffs), false)
            .flag("LS_reduce_head", Some(true).filter(|_| self.reduce_head))
            .owned("LS_ttl_millis", ttl, false)
            .flag(
                "LS_send_sync",
                Some(false).filter(|_| !self.send_sync && streaming),
            )
            .finish()
    }
}

/// `bind_session` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindSession {
    pub session: String,
    /// Number of data notifications already processed.
    pub recovery_from: Option<u64>,
    pub keep_alive: Option<Duration>,
    pub inactivity: Option<Duration>,
    pub send_sync: bool,
}

impl BindSession {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            recovery_from: None,
            keep_alive: None,
            inactivity: None,
            send_sync: true,
        }
    }

    fn parameters(&self) -> Vec<Parameter<'_>> {
        Parameters::default()
            .text("LS_session", Some(self.session.as_str()), false)
            .number("LS_recovery_from", self.recovery_from)
            .millis("LS_keepalive_millis", self.keep_alive)
            .millis("LS_inactivity_millis", self.inactivity)
            .flag("LS_send_sync", Some(false).filter(|_| !self.send_sync))
            .finish()
    }
}

/// `control` request destroying the session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Destroy {
    pub cause_code: Option<i32>,
    pub cause_message: Option<String>,
    pub close_socket: bool,
}

impl Destroy {
    pub const REQUEST_ID: &'static str = "destroy";

    fn parameters(&self) -> Vec<Parameter<'_>> {
        Parameters::default()
            .text("LS_op", Some("destroy"), false)
            .text("LS_reqId", Some(Self::REQUEST_ID), false)
            .number("LS_cause_code", self.cause_code)
            .text("LS_cause_message", self.cause_message.as_deref(), true)
            .flag("LS_close_socket", Some(true).filter(|_| self.close_socket))
            .finish()
    }
}

/// `msg` request carrying an application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendMessage {
    id: RequestId,
    pub message: String,
    pub sequence: Option<String>,
    pub ack: bool,
    pub outcome: bool,
    pub prog: Option<u64>,
}

impl SendMessage {
    /// Build a message, deriving its request id.
    ///
    /// Unordered messages with a progressive are identified by `m<prog>`;
    /// any other message gets a process-wide `M<n>` id.
    pub fn new(
        message: impl Into<String>,
        sequence: Option<String>,
        prog: Option<u64>,
    ) -> TlcpResult<Self> {
        if sequence.as_deref() == Some("*") {
            return Err(TlcpError::config("Invalid sequence name: *"));
        }
        let id = match (&sequence, prog) {
            (None, Some(prog)) => RequestId::from(format!("m{prog}")),
            _ => RequestId::from(format!(
                "M{}",
                MESSAGE_ID_GENERATOR.fetch_add(1, Ordering::Relaxed) + 1
            )),
        };
        Ok(Self {
            id,
            message: message.into(),
            sequence,
            ack: true,
            outcome: true,
            prog,
        })
    }

    /// Set whether the server acknowledges the request with `REQOK`.
    #[must_use]
    pub fn ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    /// Set whether the server reports `MSGDONE`/`MSGFAIL`.
    #[must_use]
    pub fn outcome(mut self, outcome: bool) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    fn parameters(&self) -> Vec<Parameter<'_>> {
        Parameters::default()
            .text("LS_reqId", Some(self.id.as_str()), false)
            .text("LS_message", Some(self.message.as_str()), true)
            .text("LS_sequence", self.sequence.as_deref(), true)
            .flag("LS_ack", Some(false).filter(|_| !self.ack))
            .flag("LS_outcome", Some(false).filter(|_| !self.outcome))
            .number("LS_msg_prog", self.prog)
            .finish()
    }
}

/// `control` request adding a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribe {
    pub subscription_id: SubscriptionId,
    pub data_adapter: String,
    pub mode: SubscriptionMode,
    pub item_group: String,
    pub fields: FieldList,
    pub request_snapshot: bool,
    pub ack: bool,
}

impl Subscribe {
    fn parameters(&self) -> Vec<Parameter<'_>> {
        Parameters::default()
            .owned(
                "LS_reqId",
                Some(RequestId::subscribe(self.subscription_id).to_string()),
                false,
            )
            .number("LS_subId", Some(self.subscription_id))
            .text("LS_op", Some("add"), false)
            .text("LS_data_adapter", Some(self.data_adapter.as_str()), true)
            .text("LS_mode", Some(self.mode.as_str()), false)
            .text("LS_group", Some(self.item_group.as_str()), true)
            .owned("LS_schema", Some(self.fields.schema()), true)
            .flag("LS_snapshot", Some(self.request_snapshot))
            .flag("LS_ack", Some(false).filter(|_| !self.ack))
            .finish()
    }
}

/// `control` request removing a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unsubscribe {
    pub subscription_id: SubscriptionId,
}

impl Unsubscribe {
    fn parameters(&self) -> Vec<Parameter<'_>> {
        Parameters::default()
            .owned(
                "LS_reqId",
                Some(RequestId::unsubscribe(self.subscription_id).to_string()),
                false,
            )
            .number("LS_subId", Some(self.subscription_id))
            .text("LS_op", Some("delete"), false)
            .finish()
    }
}

/// Message sent from the client to the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    CreateSession(CreateSession),
    BindSession(BindSession),
    Destroy(Destroy),
    Heartbeat,
    Message(SendMessage),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
}

impl ClientMessage {
    /// Request line this message is sent on.
    pub fn name(&self) -> RequestName {
        match self {
            Self::CreateSession(_) => RequestName::CreateSession,
            Self::BindSession(_) => RequestName::BindSession,
            Self::Destroy(_) | Self::Subscribe(_) | Self::Unsubscribe(_) => RequestName::Control,
            Self::Heartbeat => RequestName::Heartbeat,
            Self::Message(_) => RequestName::Message,
        }
    }

    /// Identifier correlating this request with the server reply.
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::CreateSession(_) => RequestId::from("CREATE_SESSION"),
            Self::BindSession(_) => RequestId::from("BIND_SESSION"),
            Self::Destroy(_) => RequestId::from(Destroy::REQUEST_ID),
            Self::Heartbeat => RequestId::from("HEARTBEAT"),
            Self::Message(message) => message.id().clone(),
            Self::Subscribe(subscribe) => RequestId::subscribe(subscribe.subscription_id),
            Self::Unsubscribe(unsubscribe) => RequestId::unsubscribe(unsubscribe.subscription_id),
        }
    }

    /// Ordered request parameters.
    pub fn parameters(&self) -> Vec<Parameter<'_>> {
        match self {
            Self::CreateSession(create) => create.parameters(),
            Self::BindSession(bind) => bind.parameters(),
            Self::Destroy(destroy) => destroy.parameters(),
            Self::Heartbeat => Vec::new(),
            Self::Message(message) => message.parameters(),
            Self::Subscribe(subscribe) => subscribe.parameters(),
            Self::Unsubscribe(unsubscribe) => unsubscribe.parameters(),
        }
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name().as_str())?;
        for (index, parameter) in self.parameters().iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", parameter.key, parameter.value)?;
        }
        f.write_str(")")
    }
}
