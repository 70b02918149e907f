use std::collections::BTreeSet;

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event as XmlEvent};

use crate::types::*;

/// A schema violation in a protocol XML document. Fatal at load time.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml attribute: {0}")]
    Attr(#[from] AttrError),
    #[error("unexpected end of document")]
    UnexpectedEof,
    #[error("expected a <protocol> root element")]
    MissingProtocol,
    #[error("<{tag}> is missing the mandatory `{attr}` attribute")]
    MissingAttribute { tag: String, attr: &'static str },
    #[error("unknown argument type `{0}`")]
    UnknownArgType(String),
    #[error("`{0}` is not a valid number")]
    InvalidNumber(String),
}

pub struct Parser<'a> {
    reader: quick_xml::Reader<&'a [u8]>,
    /// Interface names referenced by object/new_id arguments.
    referenced: BTreeSet<String>,
}

fn tag_name(tag: &BytesStart) -> String {
    String::from_utf8_lossy(tag.name().as_ref()).into_owned()
}

fn get_attr(tag: &BytesStart, attr: &'static str) -> Result<Option<String>, ProtocolError> {
    match tag.try_get_attribute(attr)? {
        Some(value) => Ok(Some(value.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

fn require_attr(tag: &BytesStart, attr: &'static str) -> Result<String, ProtocolError> {
    get_attr(tag, attr)?.ok_or_else(|| ProtocolError::MissingAttribute {
        tag: tag_name(tag),
        attr,
    })
}

fn parse_u32(text: &str) -> Result<u32, ProtocolError> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| ProtocolError::InvalidNumber(text.to_owned()))
}

impl<'a> Parser<'a> {
    pub fn new(xml: &'a str) -> Self {
        Self {
            reader: quick_xml::Reader::from_str(xml),
            referenced: BTreeSet::new(),
        }
    }

    pub fn parse(mut self) -> Result<Protocol, ProtocolError> {
        loop {
            match self.reader.read_event()? {
                XmlEvent::Eof => return Err(ProtocolError::MissingProtocol),
                XmlEvent::Start(tag) if tag.name().as_ref() == b"protocol" => {
                    return self.parse_protocol(tag);
                }
                XmlEvent::Start(tag) => self.skip(&tag)?,
                _ => (),
            }
        }
    }

    /// Skip the subtree of an unrecognized element.
    fn skip(&mut self, tag: &BytesStart) -> Result<(), ProtocolError> {
        self.reader.read_to_end(tag.name())?;
        Ok(())
    }

    fn parse_protocol(&mut self, tag: BytesStart<'a>) -> Result<Protocol, ProtocolError> {
        let name = require_attr(&tag, "name")?;
        let mut interfaces: Vec<Interface> = Vec::new();

        loop {
            match self.reader.read_event()? {
                XmlEvent::Eof => return Err(ProtocolError::UnexpectedEof),
                XmlEvent::Start(tag) => match tag.name().as_ref() {
                    b"interface" => interfaces.push(self.parse_interface(tag)?),
                    _ => self.skip(&tag)?,
                },
                XmlEvent::Empty(tag) if tag.name().as_ref() == b"interface" => {
                    interfaces.push(Interface {
                        name: require_attr(&tag, "name")?,
                        version: parse_u32(&require_attr(&tag, "version")?)?,
                        summary: None,
                        requests: Vec::new(),
                        events: Vec::new(),
                        enums: Vec::new(),
                    });
                }
                XmlEvent::End(end) if end.name() == tag.name() => break,
                _ => (),
            }
        }

        let mut extern_interfaces = std::mem::take(&mut self.referenced);
        for iface in &interfaces {
            extern_interfaces.remove(&iface.name);
        }

        Ok(Protocol {
            name,
            interfaces,
            extern_interfaces,
        })
    }

    fn parse_interface(&mut self, tag: BytesStart<'a>) -> Result<Interface, ProtocolError> {
        let mut interface = Interface {
            name: require_attr(&tag, "name")?,
            version: parse_u32(&require_attr(&tag, "version")?)?,
            summary: None,
            requests: Vec::new(),
            events: Vec::new(),
            enums: Vec::new(),
        };

        loop {
            match self.reader.read_event()? {
                XmlEvent::Eof => return Err(ProtocolError::UnexpectedEof),
                XmlEvent::Start(tag) => match tag.name().as_ref() {
                    b"request" => {
                        let msg = self.parse_message(tag)?;
                        interface.requests.push(msg);
                    }
                    b"event" => interface.events.push(self.parse_message(tag)?),
                    b"enum" => interface.enums.push(self.parse_enum(tag)?),
                    b"description" => {
                        interface.summary = get_attr(&tag, "summary")?;
                        self.skip(&tag)?;
                    }
                    _ => self.skip(&tag)?,
                },
                XmlEvent::Empty(tag) => match tag.name().as_ref() {
                    b"request" => interface.requests.push(Self::message_attrs(&tag)?),
                    b"event" => interface.events.push(Self::message_attrs(&tag)?),
                    b"description" => interface.summary = get_attr(&tag, "summary")?,
                    _ => (),
                },
                XmlEvent::End(end) if end.name() == tag.name() => break,
                _ => (),
            }
        }

        Ok(interface)
    }

    /// The attribute-only part of a request/event, shared with the
    /// self-closing tag form.
    fn message_attrs(tag: &BytesStart) -> Result<Message, ProtocolError> {
        Ok(Message {
            name: require_attr(tag, "name")?,
            is_destructor: get_attr(tag, "type")?.as_deref() == Some("destructor"),
            since: match get_attr(tag, "since")? {
                Some(since) => parse_u32(&since)?,
                None => 1,
            },
            summary: None,
            args: Vec::new(),
        })
    }

    fn parse_message(&mut self, tag: BytesStart<'a>) -> Result<Message, ProtocolError> {
        let mut message = Self::message_attrs(&tag)?;

        loop {
            match self.reader.read_event()? {
                XmlEvent::Eof => return Err(ProtocolError::UnexpectedEof),
                XmlEvent::Empty(tag) => match tag.name().as_ref() {
                    b"arg" => message.args.push(self.parse_arg(&tag)?),
                    b"description" => message.summary = get_attr(&tag, "summary")?,
                    _ => (),
                },
                XmlEvent::Start(tag) => match tag.name().as_ref() {
                    b"arg" => {
                        message.args.push(self.parse_arg(&tag)?);
                        self.skip(&tag)?;
                    }
                    b"description" => {
                        message.summary = get_attr(&tag, "summary")?;
                        self.skip(&tag)?;
                    }
                    _ => self.skip(&tag)?,
                },
                XmlEvent::End(end) if end.name() == tag.name() => break,
                _ => (),
            }
        }

        Ok(message)
    }

    fn parse_arg(&mut self, tag: &BytesStart) -> Result<Argument, ProtocolError> {
        let name = require_attr(tag, "name")?;
        let type_name = require_attr(tag, "type")?;
        let allow_null = get_attr(tag, "allow-null")?.as_deref() == Some("true");
        let enum_name = get_attr(tag, "enum")?;
        let iface = get_attr(tag, "interface")?;
        let summary = get_attr(tag, "summary")?;

        if let Some(iface) = &iface {
            self.referenced.insert(iface.clone());
        }

        let arg_type = match type_name.as_str() {
            "int" => ArgType::Int,
            "uint" => match enum_name {
                Some(enum_name) => ArgType::Enum(enum_name),
                None => ArgType::Uint,
            },
            "fixed" => ArgType::Fixed,
            "string" => ArgType::String { allow_null },
            "array" => ArgType::Array,
            "fd" => ArgType::Fd,
            "object" => ArgType::Object { allow_null, iface },
            "new_id" => ArgType::NewId { iface },
            _ => return Err(ProtocolError::UnknownArgType(type_name)),
        };

        Ok(Argument {
            name,
            arg_type,
            summary,
        })
    }

    fn parse_enum(&mut self, tag: BytesStart<'a>) -> Result<Enum, ProtocolError> {
        let mut en = Enum {
            name: require_attr(&tag, "name")?,
            is_bitfield: get_attr(&tag, "bitfield")?.as_deref() == Some("true"),
            summary: None,
            items: Vec::new(),
        };

        loop {
            match self.reader.read_event()? {
                XmlEvent::Eof => return Err(ProtocolError::UnexpectedEof),
                XmlEvent::Empty(tag) if tag.name().as_ref() == b"entry" => {
                    en.items.push(Self::parse_entry(&tag)?);
                }
                XmlEvent::Start(tag) => match tag.name().as_ref() {
                    b"entry" => {
                        en.items.push(Self::parse_entry(&tag)?);
                        self.skip(&tag)?;
                    }
                    b"description" => {
                        en.summary = get_attr(&tag, "summary")?;
                        self.skip(&tag)?;
                    }
                    _ => self.skip(&tag)?,
                },
                XmlEvent::End(end) if end.name() == tag.name() => break,
                _ => (),
            }
        }

        Ok(en)
    }

    fn parse_entry(tag: &BytesStart) -> Result<EnumItem, ProtocolError> {
        Ok(EnumItem {
            name: require_attr(tag, "name")?,
            value: parse_u32(&require_attr(tag, "value")?)?,
            since: match get_attr(tag, "since")? {
                Some(since) => parse_u32(&since)?,
                None => 1,
            },
            summary: get_attr(tag, "summary")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{parse_protocol, ArgType, ProtocolError};

    const SAMPLE: &str = r#"
        <protocol name="sample">
          <copyright>who cares</copyright>
          <interface name="wl_foo" version="3">
            <description summary="a foo"/>
            <request name="destroy" type="destructor"/>
            <request name="make" since="2">
              <arg name="id" type="new_id" interface="wl_bar"/>
              <arg name="flags" type="uint" enum="mode"/>
              <arg name="label" type="string" allow-null="true"/>
            </request>
            <request name="link">
              <arg name="peer" type="object" interface="wl_peer" allow-null="true"/>
              <arg name="anything" type="new_id"/>
            </request>
            <event name="done">
              <arg name="serial" type="uint"/>
              <arg name="data" type="array"/>
              <arg name="source" type="fd"/>
            </event>
            <enum name="mode" bitfield="true">
              <entry name="none" value="0"/>
              <entry name="fast" value="0x10" since="2"/>
            </enum>
          </interface>
          <interface name="wl_bar" version="1"/>
        </protocol>
    "#;

    #[test]
    fn parses_interfaces_and_opcodes() {
        let protocol = parse_protocol(SAMPLE).unwrap();
        assert_eq!(protocol.name, "sample");
        assert_eq!(protocol.interfaces.len(), 2);

        let foo = &protocol.interfaces[0];
        assert_eq!(foo.name, "wl_foo");
        assert_eq!(foo.version, 3);
        assert_eq!(foo.summary.as_deref(), Some("a foo"));

        // Opcodes are positional.
        assert_eq!(foo.requests[0].name, "destroy");
        assert!(foo.requests[0].is_destructor);
        assert_eq!(foo.requests[1].name, "make");
        assert_eq!(foo.requests[1].since, 2);
        assert!(!foo.requests[1].is_destructor);

        assert_eq!(foo.events.len(), 1);
        assert_eq!(foo.events[0].args.len(), 3);
        assert_eq!(foo.events[0].args[2].arg_type, ArgType::Fd);
    }

    #[test]
    fn arg_modifiers() {
        let protocol = parse_protocol(SAMPLE).unwrap();
        let make = &protocol.interfaces[0].requests[1];
        assert_eq!(
            make.args[0].arg_type,
            ArgType::NewId {
                iface: Some("wl_bar".into())
            }
        );
        assert_eq!(make.args[1].arg_type, ArgType::Enum("mode".into()));
        assert_eq!(make.args[2].arg_type, ArgType::String { allow_null: true });

        let link = &protocol.interfaces[0].requests[2];
        assert_eq!(
            link.args[0].arg_type,
            ArgType::Object {
                allow_null: true,
                iface: Some("wl_peer".into())
            }
        );
        // An interface-less new_id stays a single argument in the model.
        assert_eq!(link.args[1].arg_type, ArgType::NewId { iface: None });
    }

    #[test]
    fn extern_set_excludes_defined_interfaces() {
        let protocol = parse_protocol(SAMPLE).unwrap();
        assert!(protocol.extern_interfaces.contains("wl_peer"));
        assert!(!protocol.extern_interfaces.contains("wl_bar"));
        assert_eq!(protocol.extern_interfaces.len(), 1);
    }

    #[test]
    fn enum_values_decimal_and_hex() {
        let protocol = parse_protocol(SAMPLE).unwrap();
        let mode = &protocol.interfaces[0].enums[0];
        assert!(mode.is_bitfield);
        assert_eq!(mode.items[0].value, 0);
        assert_eq!(mode.items[1].value, 16);
        assert_eq!(mode.items[1].since, 2);
    }

    #[test]
    fn unknown_elements_are_ignored() {
        let xml = r#"
            <protocol name="p">
              <mystery><deeply><nested/></deeply></mystery>
              <interface name="wl_x" version="1">
                <novelty attr="1"/>
              </interface>
            </protocol>
        "#;
        let protocol = parse_protocol(xml).unwrap();
        assert_eq!(protocol.interfaces.len(), 1);
    }

    #[test]
    fn unknown_arg_type_is_fatal() {
        let xml = r#"
            <protocol name="p">
              <interface name="wl_x" version="1">
                <request name="r"><arg name="a" type="quaternion"/></request>
              </interface>
            </protocol>
        "#;
        assert!(matches!(
            parse_protocol(xml),
            Err(ProtocolError::UnknownArgType(t)) if t == "quaternion"
        ));
    }

    #[test]
    fn missing_mandatory_attributes_are_fatal() {
        let no_version = r#"<protocol name="p"><interface name="wl_x"/></protocol>"#;
        assert!(matches!(
            parse_protocol(no_version),
            Err(ProtocolError::MissingAttribute { attr: "version", .. })
        ));

        let no_name = r#"<protocol><interface name="wl_x" version="1"/></protocol>"#;
        assert!(matches!(
            parse_protocol(no_name),
            Err(ProtocolError::MissingAttribute { attr: "name", .. })
        ));
    }
}
