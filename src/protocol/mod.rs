//! MPD wire protocol: line transport, command encoding and response parsing.
//!
//! The protocol is line-oriented UTF-8 text:
//!
//! ```text
//! greeting:  OK MPD <major>.<minor>.<patch>
//! command:   <name>[ "<arg>"]*
//! success:   OK
//! failure:   ACK [<code>@<index>] {<command>} <message>
//! data:      <key>: <value>
//! binary:    binary: <length>\n<length raw bytes>\n
//! ```

pub mod command;
pub mod response;
pub mod transport;

pub use command::{quote, Command, CommandList};
pub use response::{
    read_list_response, read_response, AckCode, AckError, ListResponse, Response, MAX_BINARY_SIZE,
};
pub use transport::LineTransport;
