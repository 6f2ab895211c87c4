//! Streaming parser turning inbound text into [`ServerMessage`]s.

use std::{borrow::Cow, str::Chars};

use super::constants::{CR, FIELD_SEPARATOR, LF, UPDATE_HEADER_FIELDS, VALUE_SEPARATOR};
use crate::{
    error::{TlcpError, TlcpResult},
    message::ServerMessage,
};

/// Incremental parser for one connection.
///
/// Text may be fed in arbitrary chunks; a message is emitted as soon as its
/// terminating CR is seen. Not meant to be shared between connections.
#[derive(Debug, Default)]
pub struct TlcpParser {
    buffer: String,
    fields: Vec<Cow<'static, str>>,
    /// Set while parsing a `U` line, where `|` and `,` swap roles.
    parsing_update: bool,
}

impl TlcpParser {
    pub fn new() -> Self {
        Self {
            buffer: String::with_capacity(128),
            fields: Vec::with_capacity(16),
            parsing_update: false,
        }
    }

    /// Parse `text`, yielding every message it completes.
    ///
    /// A framing or decode error resets the parser; the connection it
    /// belongs to should be dropped.
    pub fn parse<'p, 't>(&'p mut self, text: &'t str) -> Messages<'p, 't> {
        Messages {
            parser: self,
            chars: text.chars(),
        }
    }

    /// Whether a partial line is buffered.
    pub fn has_partial_line(&self) -> bool {
        !self.buffer.is_empty() || !self.fields.is_empty()
    }

    fn in_update_values(&self) -> bool {
        self.parsing_update && self.fields.len() >= UPDATE_HEADER_FIELDS
    }

    fn push_char(&mut self, c: char) -> TlcpResult<Option<ServerMessage>> {
        match c {
            VALUE_SEPARATOR if self.in_update_values() => self.on_field_end(),
            FIELD_SEPARATOR if !self.in_update_values() => self.on_field_end(),
            CR => return self.on_line_end().map(Some),
            LF => {
                if self.has_partial_line() {
                    let line = self.fields.join(",");
                    self.reset();
                    return Err(TlcpError::decode(format!("Unexpected line feed after: {line}")));
                }
            }
            other => self.buffer.push(other),
        }
        Ok(None)
    }

    fn on_field_end(&mut self) {
        let mut chars = self.buffer.chars();
        let field = match (chars.next(), chars.next()) {
            (None, _) => Cow::Borrowed(""),
            (Some(c), None) => match c {
                '#' => Cow::Borrowed("#"),
                '$' => Cow::Borrowed("$"),
                '*' => Cow::Borrowed("*"),
                '0' => Cow::Borrowed("0"),
                '1' => Cow::Borrowed("1"),
                'U' => {
                    if self.fields.is_empty() {
                        self.parsing_update = true;
                    }
                    Cow::Borrowed("U")
                }
                _ => Cow::Owned(self.buffer.clone()),
            },
            _ => Cow::Owned(self.buffer.clone()),
        };
        self.fields.push(field);
        self.buffer.clear();
    }

    fn on_line_end(&mut self) -> TlcpResult<ServerMessage> {
        self.on_field_end();
        let message = ServerMessage::from_fields(&self.fields);
        self.reset();
        message
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.fields.clear();
        self.parsing_update = false;
    }
}

/// Iterator over the messages completed by one chunk of text.
pub struct Messages<'p, 't> {
    parser: &'p mut TlcpParser,
    chars: Chars<'t>,
}

impl Iterator for Messages<'_, '_> {
    type Item = TlcpResult<ServerMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        for c in self.chars.by_ref() {
            match self.parser.push_char(c) {
                Ok(None) => {}
                Ok(Some(message)) => return Some(Ok(message)),
                Err(err) => return Some(Err(err)),
            }
        }
        None
    }
}
