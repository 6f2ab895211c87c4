//! TLCP wire codec.
//!
//! Requests are encoded as a request line followed by one `&` separated
//! parameter line:
//!
//! ```text
//! control\r\n
//! LS_reqId=s1&LS_subId=1&LS_op=add&...\r\n
//! ```
//!
//! Server lines are `,` separated positional fields keyed by a leading tag.
//! On update lines (`U,<sub>,<item>,...`) values are separated by `|` and a
//! `,` inside a value is literal.
//!
//! # Module Structure
//!
//! - `escape`: value escaping and `%XX` decoding
//! - `encoder`: request encoding and frame batching
//! - `parser`: incremental line parser
//! - `stream`: adapter from a stream of text frames to server messages

pub(crate) mod constants;
pub mod encoder;
pub mod escape;
pub mod parser;
pub mod stream;

pub use constants::{SEND_THRESHOLD, TLCP_PATH, TLCP_SUBPROTOCOL, TLCP_VERSION};
pub use encoder::{TlcpEncoder, encode, encode_combo_request};
pub use escape::{escape, unescape};
pub use parser::TlcpParser;
pub use stream::ServerMessageStream;
