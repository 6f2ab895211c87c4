//! Common constants used across the codec.

/// Carriage return.
pub(crate) const CR: char = '\r';
/// Newline.
pub(crate) const LF: char = '\n';
/// Line terminator of every request and response line.
pub(crate) const CRLF: &str = "\r\n";

/// Field separator.
pub(crate) const FIELD_SEPARATOR: char = ',';
/// Value separator of update lines.
pub(crate) const VALUE_SEPARATOR: char = '|';
/// Parameter separator in request bodies.
pub(crate) const PARAMETER_SEPARATOR: char = '&';

/// Fields preceding the values of an update line (`U,<sub>,<item>`).
pub(crate) const UPDATE_HEADER_FIELDS: usize = 3;

/// Frames are closed once a batch reaches this many bytes.
pub const SEND_THRESHOLD: usize = 8 * 1024;

/// Protocol version spoken by this client.
pub const TLCP_VERSION: &str = "2.5.0";
/// WebSocket sub-protocol to negotiate.
pub const TLCP_SUBPROTOCOL: &str = "TLCP-2.5.0.lightstreamer.com";
/// Path of the streaming endpoint.
pub const TLCP_PATH: &str = "/lightstreamer";
