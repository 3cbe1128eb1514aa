//! The introspection data model and its XML parser.
//!
//! The parser is deliberately tolerant: unknown elements and attributes are
//! skipped, only the structure the client needs is kept.

use std::{collections::HashMap, error::Error as StdError, fmt};

use quick_xml::{events::BytesStart, events::Event, Reader};

#[derive(Debug)]
pub struct SchemaError(String);

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid introspection data: {}", self.0)
    }
}

impl StdError for SchemaError {}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArgDecl {
    pub name: Option<String>,
    pub signature: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Method {
    pub inputs: Vec<ArgDecl>,
    pub outputs: Vec<ArgDecl>,
}

impl Method {
    /// The concatenated signature of the input arguments.
    pub fn input_signature(&self) -> String {
        self.inputs.iter().map(|arg| arg.signature.as_str()).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignalDecl {
    pub args: Vec<ArgDecl>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Property {
    pub signature: String,
    pub access: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Interface {
    pub methods: HashMap<String, Method>,
    pub signals: HashMap<String, SignalDecl>,
    pub properties: HashMap<String, Property>,
}

/// One introspected node: its interfaces in document order (traversal order
/// matters for member inference) and the names of its child nodes.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub interfaces: Vec<(String, Interface)>,
    pub nodes: Vec<String>,
}

fn attr(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

enum Member {
    None,
    Method(String, Method),
    Signal(String, SignalDecl),
}

/// Streaming parser state; one instance parses one document.
struct Parser {
    schema: Schema,
    iface: Option<(String, Interface)>,
    member: Member,
    /// nesting depth of open elements; the root node sits at depth 0
    depth: usize,
}

impl Parser {
    fn open(&mut self, e: &BytesStart, empty: bool) {
        match e.name().as_ref() {
            // only direct children of the root node are child paths
            b"node" if self.depth == 1 => {
                if let Some(name) = attr(e, "name") {
                    self.schema.nodes.push(name);
                }
            }

            b"interface" if self.depth == 1 && self.iface.is_none() => {
                if let Some(name) = attr(e, "name") {
                    if empty {
                        self.schema.interfaces.push((name, Interface::default()));
                    } else {
                        self.iface = Some((name, Interface::default()));
                    }
                }
            }

            b"method" if self.iface.is_some() => {
                if let Some(name) = attr(e, "name") {
                    if empty {
                        self.close_member(Member::Method(name, Method::default()));
                    } else {
                        self.member = Member::Method(name, Method::default());
                    }
                }
            }

            b"signal" if self.iface.is_some() => {
                if let Some(name) = attr(e, "name") {
                    if empty {
                        self.close_member(Member::Signal(name, SignalDecl::default()));
                    } else {
                        self.member = Member::Signal(name, SignalDecl::default());
                    }
                }
            }

            b"property" => {
                if let (Some((.., iface)), Some(name), Some(signature)) =
                    (self.iface.as_mut(), attr(e, "name"), attr(e, "type"))
                {
                    let access = attr(e, "access").unwrap_or_else(|| "read".into());
                    iface.properties.insert(name, Property { signature, access });
                }
            }

            b"arg" => {
                let Some(signature) = attr(e, "type") else { return };
                let decl = ArgDecl { name: attr(e, "name"), signature };
                match &mut self.member {
                    Member::Method(.., method) => {
                        if attr(e, "direction").as_deref() == Some("out") {
                            method.outputs.push(decl);
                        } else {
                            method.inputs.push(decl);
                        }
                    }
                    Member::Signal(.., signal) => signal.args.push(decl),
                    Member::None => {}
                }
            }

            _ => {} // unknown elements are skipped
        }

        if !empty {
            self.depth += 1;
        }
    }

    fn close(&mut self, name: &[u8]) {
        self.depth = self.depth.saturating_sub(1);
        match name {
            b"interface" => {
                if let Some(entry) = self.iface.take() {
                    self.schema.interfaces.push(entry);
                }
            }
            b"method" | b"signal" => {
                let member = std::mem::replace(&mut self.member, Member::None);
                self.close_member(member);
            }
            _ => {}
        }
    }

    fn close_member(&mut self, member: Member) {
        let Some((.., iface)) = self.iface.as_mut() else { return };
        match member {
            Member::Method(name, method) => {
                iface.methods.insert(name, method);
            }
            Member::Signal(name, signal) => {
                iface.signals.insert(name, signal);
            }
            Member::None => {}
        }
    }
}

impl Schema {
    pub fn from_xml(text: &str) -> Result<Schema, SchemaError> {
        let mut reader = Reader::from_str(text);
        let mut parser = Parser {
            schema: Schema::default(),
            iface: None,
            member: Member::None,
            depth: 0,
        };

        loop {
            match reader.read_event().map_err(|e| SchemaError(e.to_string()))? {
                Event::Eof => break,
                Event::Start(e) => parser.open(&e, false),
                Event::Empty(e) => parser.open(&e, true),
                Event::End(e) => parser.close(e.name().as_ref()),
                _ => {}
            }
        }

        if let Some(entry) = parser.iface.take() {
            parser.schema.interfaces.push(entry);
        }
        Ok(parser.schema)
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|(n, ..)| n == name).map(|(.., i)| i)
    }

    /// Seeds the standard interfaces every object answers to, so member
    /// resolution works against peers that do not list them.
    pub fn add_defaults(&mut self) {
        let mut add = |name: &str, build: fn(&mut Interface)| {
            if self.interface(name).is_none() {
                let mut iface = Interface::default();
                build(&mut iface);
                self.interfaces.push((name.to_string(), iface));
            }
        };

        add("org.freedesktop.DBus.Introspectable", |iface| {
            iface.methods.insert("Introspect".into(), method(&[], &["s"]));
        });
        add("org.freedesktop.DBus.Properties", |iface| {
            iface.methods.insert("Get".into(), method(&["s", "s"], &["v"]));
            iface.methods.insert("Set".into(), method(&["s", "s", "v"], &[]));
            iface.methods.insert("GetAll".into(), method(&["s"], &["a{sv}"]));
        });
        add("org.freedesktop.DBus.Peer", |iface| {
            iface.methods.insert("Ping".into(), method(&[], &[]));
            iface.methods.insert("GetMachineId".into(), method(&[], &["s"]));
        });
    }
}

fn method(inputs: &[&str], outputs: &[&str]) -> Method {
    let decl = |sig: &&str| ArgDecl { name: None, signature: (*sig).into() };
    Method {
        inputs: inputs.iter().map(decl).collect(),
        outputs: outputs.iter().map(decl).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.example.Settings">
    <method name="ReadOne">
      <arg name="namespace" type="s" direction="in"/>
      <arg name="key" type="s" direction="in"/>
      <arg name="value" type="v" direction="out"/>
    </method>
    <method name="Reset"/>
    <signal name="SettingChanged">
      <arg name="namespace" type="s"/>
      <arg name="key" type="s"/>
      <arg name="value" type="v"/>
    </signal>
    <property name="version" type="u" access="read"/>
    <annotation name="org.example.Whatever" value="ignored"/>
  </interface>
  <interface name="org.example.Extra">
    <method name="Bump">
      <arg type="u"/>
    </method>
  </interface>
  <node name="child_a"/>
  <node name="child_b"/>
  <mystery>
    <node name="not_a_child"/>
  </mystery>
</node>
"#;

    #[test]
    fn parses_interfaces_in_document_order() {
        let schema = Schema::from_xml(SAMPLE).unwrap();
        let names: Vec<&str> = schema.interfaces.iter().map(|(n, ..)| n.as_str()).collect();
        assert_eq!(names, ["org.example.Settings", "org.example.Extra"]);
    }

    #[test]
    fn parses_members() {
        let schema = Schema::from_xml(SAMPLE).unwrap();
        let iface = schema.interface("org.example.Settings").unwrap();

        let read_one = &iface.methods["ReadOne"];
        assert_eq!(read_one.input_signature(), "ss");
        assert_eq!(read_one.outputs.len(), 1);
        assert_eq!(read_one.outputs[0].signature, "v");

        assert!(iface.methods.contains_key("Reset"));
        assert_eq!(iface.signals["SettingChanged"].args.len(), 3);
        assert_eq!(iface.properties["version"].signature, "u");
        assert_eq!(iface.properties["version"].access, "read");

        // args without a direction default to inputs
        assert_eq!(schema.interface("org.example.Extra").unwrap().methods["Bump"].input_signature(), "u");
    }

    #[test]
    fn parses_child_nodes() {
        let schema = Schema::from_xml(SAMPLE).unwrap();
        assert_eq!(schema.nodes, ["child_a", "child_b"]);
    }

    #[test]
    fn defaults_do_not_override() {
        let xml = r#"<node><interface name="org.freedesktop.DBus.Properties">
            <method name="Get"><arg type="s"/><arg type="s"/><arg type="s"/></method>
        </interface></node>"#;
        let mut schema = Schema::from_xml(xml).unwrap();
        schema.add_defaults();

        let props = schema.interface("org.freedesktop.DBus.Properties").unwrap();
        assert_eq!(props.methods["Get"].input_signature(), "sss");
        assert!(schema.interface("org.freedesktop.DBus.Peer").is_some());
    }

    #[test]
    fn rejects_broken_xml() {
        assert!(Schema::from_xml("<node><interface").is_err());
    }
}
