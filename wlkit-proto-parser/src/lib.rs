//! Parser for Wayland protocol XML files.
//!
//! Produces the runtime protocol model consumed by the code generator:
//! interfaces with their positional requests, events and enums, plus the
//! set of interfaces referenced but not defined in the document.

mod parser;
mod types;

pub use parser::ProtocolError;
pub use types::*;

/// Parse a protocol XML document.
pub fn parse_protocol(xml: &str) -> Result<Protocol, ProtocolError> {
    parser::Parser::new(xml).parse()
}
