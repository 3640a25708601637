//! Bound objects: the path tree, method-call resolution and the
//! introspection XML emitter.
//!
//! Paths form a logical tree but are stored as a flat sorted map of
//! absolute paths; direct children of a node are found by a lexicographic
//! prefix scan. Binding a path implicitly provides
//! `org.freedesktop.DBus.Introspectable.Introspect` on it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::rc::Rc;

use log::trace;

use crate::connection::Connection;
use crate::error::*;
use crate::message::{self, Message};

/// Error name sent when a method call names an unbound path.
pub const ERROR_INVALID_PATH: &str = "nz.co.foobar.DBus.InvalidPath";
/// Error name sent when no bound interface provides the requested member.
pub const ERROR_INVALID_METHOD: &str = "nz.co.foobar.DBus.InvalidMethod";

pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

/// An error a method handler reports back to the caller; marshaled as an
/// Error reply carrying the name and optional text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub name: String,
    pub message: Option<String>,
}

impl CallError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> CallError {
        CallError {
            name: name.into(),
            message: Some(message.into()),
        }
    }

    pub fn bare(name: impl Into<String>) -> CallError {
        CallError {
            name: name.into(),
            message: None,
        }
    }
}

pub type MethodResult = std::result::Result<(), CallError>;
pub type MethodHandler = Rc<RefCell<dyn FnMut(&mut Connection, &Message) -> MethodResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: Option<String>,
    pub signature: String,
    pub direction: Option<Direction>,
}

/// A callable member of an interface.
pub struct Method {
    pub name: String,
    pub args: Vec<Argument>,
    pub annotations: Vec<(String, String)>,
    pub(crate) handler: MethodHandler,
}

impl Method {
    pub fn new(
        name: impl Into<String>,
        handler: impl FnMut(&mut Connection, &Message) -> MethodResult + 'static,
    ) -> Method {
        Method {
            name: name.into(),
            args: Vec::new(),
            annotations: Vec::new(),
            handler: Rc::new(RefCell::new(handler)),
        }
    }

    pub fn in_arg(mut self, name: &str, signature: &str) -> Self {
        self.args.push(Argument {
            name: Some(name.to_string()),
            signature: signature.to_string(),
            direction: Some(Direction::In),
        });
        self
    }

    pub fn out_arg(mut self, name: &str, signature: &str) -> Self {
        self.args.push(Argument {
            name: Some(name.to_string()),
            signature: signature.to_string(),
            direction: Some(Direction::Out),
        });
        self
    }

    pub fn annotate(mut self, name: &str, value: &str) -> Self {
        self.annotations.push((name.to_string(), value.to_string()));
        self
    }
}

/// A signal an interface declares; emission goes through the factory.
pub struct Signal {
    pub name: String,
    pub args: Vec<Argument>,
    pub annotations: Vec<(String, String)>,
}

impl Signal {
    pub fn new(name: impl Into<String>) -> Signal {
        Signal {
            name: name.into(),
            args: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn arg(mut self, name: &str, signature: &str) -> Self {
        self.args.push(Argument {
            name: Some(name.to_string()),
            signature: signature.to_string(),
            direction: None,
        });
        self
    }

    pub fn annotate(mut self, name: &str, value: &str) -> Self {
        self.annotations.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }
}

/// A declared property; it appears in introspection data only.
pub struct Property {
    pub name: String,
    pub signature: String,
    pub access: Access,
    pub annotations: Vec<(String, String)>,
}

impl Property {
    pub fn new(name: impl Into<String>, signature: &str, access: Access) -> Property {
        Property {
            name: name.into(),
            signature: signature.to_string(),
            access,
            annotations: Vec::new(),
        }
    }

    pub fn annotate(mut self, name: &str, value: &str) -> Self {
        self.annotations.push((name.to_string(), value.to_string()));
        self
    }
}

/// A named set of methods, signals and properties bound at a path.
pub struct Interface {
    pub name: String,
    pub(crate) methods: Vec<Method>,
    pub(crate) signals: Vec<Signal>,
    pub(crate) properties: Vec<Property>,
    pub(crate) annotations: Vec<(String, String)>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Interface {
        Interface {
            name: name.into(),
            methods: Vec::new(),
            signals: Vec::new(),
            properties: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn method(mut self, m: Method) -> Self {
        self.methods.push(m);
        self
    }

    pub fn signal(mut self, s: Signal) -> Self {
        self.signals.push(s);
        self
    }

    pub fn property(mut self, p: Property) -> Self {
        self.properties.push(p);
        self
    }

    pub fn annotate(mut self, name: &str, value: &str) -> Self {
        self.annotations.push((name.to_string(), value.to_string()));
        self
    }

    fn find_method(&self, member: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == member)
    }
}

#[derive(Default)]
struct Node {
    interfaces: Vec<Interface>,
}

/// How a method call resolves against the tree.
pub(crate) enum Resolved {
    /// The implicit `Introspectable.Introspect`.
    Introspect,
    Handler(MethodHandler),
}

pub(crate) enum DispatchMiss {
    Path,
    Method,
}

#[derive(Default)]
pub(crate) struct ObjectRegistry {
    nodes: BTreeMap<String, Node>,
}

impl ObjectRegistry {
    /// Creates the node if absent; idempotent.
    pub(crate) fn add_object(&mut self, path: &str) -> Result<()> {
        if !message::valid_object_path(path) {
            return Err(context!(ErrorKind::InvalidMessage(format!(
                "malformed object path '{}'",
                path
            ))));
        }
        self.nodes.entry(path.to_string()).or_default();
        Ok(())
    }

    /// Binds `interface` at `path`, replacing a same-named interface.
    pub(crate) fn bind(&mut self, path: &str, interface: Interface) -> Result<()> {
        if !message::valid_object_path(path) {
            return Err(context!(ErrorKind::InvalidMessage(format!(
                "malformed object path '{}'",
                path
            ))));
        }
        trace!("bind {} at {}", interface.name, path);
        let node = self.nodes.entry(path.to_string()).or_default();
        if let Some(slot) = node.interfaces.iter_mut().find(|i| i.name == interface.name) {
            *slot = interface;
        } else {
            node.interfaces.push(interface);
        }
        Ok(())
    }

    /// Removes one interface; the node goes away with its last interface.
    pub(crate) fn unbind(&mut self, path: &str, interface: &str) {
        if let Some(node) = self.nodes.get_mut(path) {
            node.interfaces.retain(|i| i.name != interface);
            trace!("unbind {} at {}", interface, path);
            if node.interfaces.is_empty() {
                self.nodes.remove(path);
            }
        }
    }

    /// Removes the node and everything bound to it.
    pub(crate) fn unbind_all(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            trace!("unbind all at {}", path);
        }
    }

    pub(crate) fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Resolution order: unknown path first, then the implicit
    /// Introspectable, then `(path, interface)` lookup, then first-match
    /// iteration in insertion order when no interface header was sent.
    pub(crate) fn resolve(
        &self,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> std::result::Result<Resolved, DispatchMiss> {
        let node = self.nodes.get(path).ok_or(DispatchMiss::Path)?;
        match interface {
            Some(INTROSPECTABLE_INTERFACE) => {
                if member == "Introspect" {
                    Ok(Resolved::Introspect)
                } else {
                    Err(DispatchMiss::Method)
                }
            }
            Some(name) => {
                let iface = node
                    .interfaces
                    .iter()
                    .find(|i| i.name == name)
                    .ok_or(DispatchMiss::Method)?;
                iface
                    .find_method(member)
                    .map(|m| Resolved::Handler(Rc::clone(&m.handler)))
                    .ok_or(DispatchMiss::Method)
            }
            None => {
                if member == "Introspect" {
                    return Ok(Resolved::Introspect);
                }
                node.interfaces
                    .iter()
                    .find_map(|i| i.find_method(member))
                    .map(|m| Resolved::Handler(Rc::clone(&m.handler)))
                    .ok_or(DispatchMiss::Method)
            }
        }
    }

    /// Introspection XML for `path`, or `None` when nothing is bound there.
    pub(crate) fn introspect(&self, path: &str) -> Option<String> {
        let node = self.nodes.get(path)?;
        let mut xml = String::from(
            "<!DOCTYPE node PUBLIC \"-//freedesktop/DTD D-BUS Object Introspection 1.0//EN\"\n\
             \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n\
             <node>\n",
        );

        xml.push_str(concat!(
            "  <interface name=\"org.freedesktop.DBus.Introspectable\">\n",
            "    <method name=\"Introspect\">\n",
            "      <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n",
            "    </method>\n",
            "  </interface>\n",
        ));

        for iface in &node.interfaces {
            let _ = writeln!(xml, "  <interface name=\"{}\">", escape(&iface.name));
            for m in &iface.methods {
                let _ = writeln!(xml, "    <method name=\"{}\">", escape(&m.name));
                for a in &m.args {
                    emit_arg(&mut xml, a);
                }
                for (k, v) in &m.annotations {
                    emit_annotation(&mut xml, k, v);
                }
                xml.push_str("    </method>\n");
            }
            for s in &iface.signals {
                let _ = writeln!(xml, "    <signal name=\"{}\">", escape(&s.name));
                for a in &s.args {
                    emit_arg(&mut xml, a);
                }
                for (k, v) in &s.annotations {
                    emit_annotation(&mut xml, k, v);
                }
                xml.push_str("    </signal>\n");
            }
            for p in &iface.properties {
                let _ = writeln!(
                    xml,
                    "    <property name=\"{}\" type=\"{}\" access=\"{}\">",
                    escape(&p.name),
                    escape(&p.signature),
                    p.access.as_str()
                );
                for (k, v) in &p.annotations {
                    emit_annotation(&mut xml, k, v);
                }
                xml.push_str("    </property>\n");
            }
            for (k, v) in &iface.annotations {
                let _ = writeln!(
                    xml,
                    "    <annotation name=\"{}\" value=\"{}\"/>",
                    escape(k),
                    escape(v)
                );
            }
            xml.push_str("  </interface>\n");
        }

        for child in self.direct_children(path) {
            let _ = writeln!(xml, "  <node name=\"{}\"/>", escape(child));
        }

        xml.push_str("</node>\n");
        Some(xml)
    }

    /// Tail segments of the direct children of `path`, deduplicated. A
    /// direct child extends the path by exactly one segment.
    fn direct_children<'a>(&'a self, path: &str) -> Vec<&'a str> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut out: Vec<&str> = Vec::new();
        for key in self
            .nodes
            .range(prefix.clone()..)
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix.as_str()))
        {
            let tail = &key[prefix.len()..];
            if tail.is_empty() {
                continue;
            }
            let segment = tail.split('/').next().unwrap_or(tail);
            if out.last() != Some(&segment) {
                out.push(segment);
            }
        }
        out
    }
}

fn emit_arg(xml: &mut String, a: &Argument) {
    xml.push_str("      <arg");
    if let Some(ref n) = a.name {
        let _ = write!(xml, " name=\"{}\"", escape(n));
    }
    let _ = write!(xml, " type=\"{}\"", escape(&a.signature));
    if let Some(d) = a.direction {
        let _ = write!(xml, " direction=\"{}\"", d.as_str());
    }
    xml.push_str("/>\n");
}

fn emit_annotation(xml: &mut String, name: &str, value: &str) {
    let _ = writeln!(
        xml,
        "      <annotation name=\"{}\" value=\"{}\"/>",
        escape(name),
        escape(value)
    );
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Method {
        Method::new("Noop", |_, _| Ok(()))
    }

    fn registry_with(paths: &[&str]) -> ObjectRegistry {
        let mut r = ObjectRegistry::default();
        for p in paths {
            r.bind(p, Interface::new("org.example.I").method(noop()))
                .unwrap();
        }
        r
    }

    #[test]
    fn direct_children_only() {
        let r = registry_with(&["/a", "/a/b", "/a/b/c", "/a/d"]);
        assert_eq!(r.direct_children("/a"), vec!["b", "d"]);
        assert_eq!(r.direct_children("/a/b"), vec!["c"]);
        assert_eq!(r.direct_children("/a/b/c"), Vec::<&str>::new());
    }

    #[test]
    fn root_children() {
        let r = registry_with(&["/a", "/b/c"]);
        assert_eq!(r.direct_children("/"), vec!["a", "b"]);
    }

    #[test]
    fn introspect_lists_children_and_interfaces() {
        let r = registry_with(&["/a", "/a/b", "/a/b/c", "/a/d"]);
        let xml = r.introspect("/a").unwrap();
        assert!(xml.contains("<node name=\"b\"/>"));
        assert!(xml.contains("<node name=\"d\"/>"));
        assert!(!xml.contains("<node name=\"c\"/>"));
        assert!(xml.contains("<interface name=\"org.example.I\">"));
        assert!(xml.contains("org.freedesktop.DBus.Introspectable"));
        assert!(xml.starts_with("<!DOCTYPE node PUBLIC"));
    }

    #[test]
    fn resolve_prefers_named_interface() {
        let mut r = ObjectRegistry::default();
        r.bind("/o", Interface::new("a.A").method(Method::new("M", |_, _| Ok(()))))
            .unwrap();
        r.bind("/o", Interface::new("a.B").method(Method::new("M", |_, _| Ok(()))))
            .unwrap();

        assert!(matches!(
            r.resolve("/o", Some("a.B"), "M"),
            Ok(Resolved::Handler(_))
        ));
        // Without an interface header the first bound interface wins.
        assert!(matches!(r.resolve("/o", None, "M"), Ok(Resolved::Handler(_))));
        assert!(matches!(
            r.resolve("/o", Some("a.C"), "M"),
            Err(DispatchMiss::Method)
        ));
        assert!(matches!(
            r.resolve("/nope", None, "M"),
            Err(DispatchMiss::Path)
        ));
        assert!(matches!(
            r.resolve("/o", Some("a.A"), "Missing"),
            Err(DispatchMiss::Method)
        ));
    }

    #[test]
    fn implicit_introspectable() {
        let r = registry_with(&["/a"]);
        assert!(matches!(
            r.resolve("/a", Some(INTROSPECTABLE_INTERFACE), "Introspect"),
            Ok(Resolved::Introspect)
        ));
        assert!(matches!(
            r.resolve("/a", None, "Introspect"),
            Ok(Resolved::Introspect)
        ));
        assert!(matches!(
            r.resolve("/a", Some(INTROSPECTABLE_INTERFACE), "Other"),
            Err(DispatchMiss::Method)
        ));
    }

    #[test]
    fn unbind_drops_empty_nodes() {
        let mut r = registry_with(&["/a"]);
        r.unbind("/a", "org.example.I");
        assert!(!r.contains("/a"));
        assert!(matches!(r.resolve("/a", None, "M"), Err(DispatchMiss::Path)));
    }

    #[test]
    fn bind_replaces_same_name() {
        let mut r = ObjectRegistry::default();
        r.bind("/o", Interface::new("a.A").method(Method::new("Old", |_, _| Ok(()))))
            .unwrap();
        r.bind("/o", Interface::new("a.A").method(Method::new("New", |_, _| Ok(()))))
            .unwrap();
        assert!(matches!(r.resolve("/o", Some("a.A"), "Old"), Err(DispatchMiss::Method)));
        assert!(matches!(r.resolve("/o", Some("a.A"), "New"), Ok(Resolved::Handler(_))));
    }

    #[test]
    fn xml_escapes_attribute_values() {
        let mut r = ObjectRegistry::default();
        r.bind(
            "/e",
            Interface::new("a.A").annotate("doc", "a < b & \"c\""),
        )
        .unwrap();
        let xml = r.introspect("/e").unwrap();
        assert!(xml.contains("a &lt; b &amp; &quot;c&quot;"));
    }
}
