use std::collections::BTreeSet;

/// A parsed protocol document.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub name: String,
    pub interfaces: Vec<Interface>,
    /// Interfaces referenced by `object`/`new_id` arguments but not defined
    /// in this document. Generators use this to wire cross-protocol imports.
    pub extern_interfaces: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub version: u32,
    pub summary: Option<String>,
    pub requests: Vec<Message>,
    pub events: Vec<Message>,
    pub enums: Vec<Enum>,
}

/// A request or an event. Opcodes are positional within the owning list.
#[derive(Debug, Clone)]
pub struct Message {
    pub name: String,
    /// Destroys the object. At most one request per interface; a few events
    /// carry it too (`wl_callback.done`).
    pub is_destructor: bool,
    pub since: u32,
    pub summary: Option<String>,
    pub args: Vec<Argument>,
}

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub arg_type: ArgType,
    pub summary: Option<String>,
}

/// Wayland argument types, as spelled in protocol XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgType {
    /// 32-bit signed integer.
    Int,
    /// 32-bit unsigned integer.
    Uint,
    /// 32-bit unsigned integer carrying a value of the named enum.
    Enum(String),
    /// Signed 24.8 fixed-point number.
    Fixed,
    /// Length-prefixed, NUL-terminated string.
    String { allow_null: bool },
    /// Reference to an existing object.
    Object {
        allow_null: bool,
        iface: Option<String>,
    },
    /// Object created by this message. Without a declared interface the
    /// wire form expands to (interface string, version, id); the model
    /// keeps it as a single argument.
    NewId { iface: Option<String> },
    /// Length-prefixed blob.
    Array,
    /// File descriptor, transmitted out of band.
    Fd,
}

#[derive(Debug, Clone)]
pub struct Enum {
    pub name: String,
    pub is_bitfield: bool,
    pub summary: Option<String>,
    pub items: Vec<EnumItem>,
}

#[derive(Debug, Clone)]
pub struct EnumItem {
    pub name: String,
    pub value: u32,
    pub since: u32,
    pub summary: Option<String>,
}
