//! Message type identity and routing-key derivation.
//!
//! Every routable message type carries a [`TypeDescriptor`]: a namespace, a
//! bare type name and, for generic types, the descriptors of its type
//! arguments. The descriptor yields two stable strings:
//!
//! - the **qualified name** (`ns.Foo<ns.Bar,ns.Baz>`), used as the type's
//!   identity in the route table and in configuration files;
//! - the **routing key** (`app_ns_Foo[ns_Bar,ns_Baz]`), used to address the
//!   queue/subject a type travels on.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Structural identity of a message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    /// Dot-separated namespace (may be empty).
    pub namespace: String,
    /// Bare type name without generic arguments.
    pub name: String,
    /// Generic type arguments, in declaration order.
    pub args: Vec<TypeDescriptor>,
}

impl TypeDescriptor {
    /// Create a descriptor for a non-generic type.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Attach generic type arguments.
    pub fn with_args(mut self, args: impl IntoIterator<Item = TypeDescriptor>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    /// Derive a descriptor from the compiler's name for `T`.
    ///
    /// `my_crate::orders::Place<my_crate::orders::Line>` becomes namespace
    /// `my_crate.orders`, name `Place`, one argument. The compiler's type name
    /// is only stable within one toolchain, so types exchanged with peers built
    /// separately should override [`Message::descriptor`] explicitly.
    pub fn of<T: ?Sized>() -> Self {
        parse_type_name(std::any::type_name::<T>())
    }

    /// Qualified name used as the type's identity: `ns.Name<ns.Arg,...>`.
    pub fn qualified_name(&self) -> String {
        let mut out = String::new();
        self.write_qualified(&mut out);
        out
    }

    fn write_qualified(&self, out: &mut String) {
        if !self.namespace.is_empty() {
            out.push_str(&self.namespace);
            out.push('.');
        }
        out.push_str(&self.name);
        if !self.args.is_empty() {
            out.push('<');
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                arg.write_qualified(out);
            }
            out.push('>');
        }
    }

    /// Routing key for this type, optionally prefixed.
    ///
    /// Format: `[prefix '.'] namespace '_' name ['[' arg0 ',' arg1 ... ']']`
    /// with every `.` replaced by `_`. Arguments are expanded recursively the
    /// same way (without the prefix).
    pub fn routing_key(&self, prefix: Option<&str>) -> String {
        let mut raw = String::new();
        if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
            raw.push_str(prefix);
            raw.push('.');
        }
        self.write_routing_name(&mut raw);
        raw.replace('.', "_")
    }

    fn write_routing_name(&self, out: &mut String) {
        if !self.namespace.is_empty() {
            out.push_str(&self.namespace);
            out.push('_');
        }
        out.push_str(&self.name);
        if !self.args.is_empty() {
            out.push('[');
            for arg in &self.args {
                arg.write_routing_name(out);
                out.push(',');
            }
            // Collapse the trailing ",]" left by the loop.
            out.pop();
            out.push(']');
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// A type that can travel through the router.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Structural identity of this type.
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::of::<Self>()
    }
}

/// A message answered by exactly one handler.
pub trait Request: Message {
    /// Value returned by the handler.
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// A message delivered to every subscribed handler.
pub trait Notification: Message {}

/// Parse a Rust type path such as `a::b::Foo<a::Bar, u32>`.
fn parse_type_name(input: &str) -> TypeDescriptor {
    let mut parser = TypeNameParser {
        chars: input.as_bytes(),
        pos: 0,
    };
    let descriptor = parser.parse();
    if parser.pos < input.len() {
        // Tuples, slices, references and other shapes we do not decompose.
        return TypeDescriptor::new("", input.replace("::", ".").replace(' ', ""));
    }
    descriptor
}

struct TypeNameParser<'a> {
    chars: &'a [u8],
    pos: usize,
}

impl TypeNameParser<'_> {
    fn parse(&mut self) -> TypeDescriptor {
        let start = self.pos;
        while self.pos < self.chars.len() && !matches!(self.chars[self.pos], b'<' | b'>' | b',') {
            self.pos += 1;
        }
        let path = String::from_utf8_lossy(&self.chars[start..self.pos])
            .trim()
            .to_string();

        let (namespace, name) = match path.rfind("::") {
            Some(idx) => (path[..idx].replace("::", "."), path[idx + 2..].to_string()),
            None => (String::new(), path),
        };

        let mut args = Vec::new();
        if self.peek() == Some(b'<') {
            self.pos += 1;
            loop {
                self.skip_spaces();
                args.push(self.parse());
                self.skip_spaces();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b'>') => {
                        self.pos += 1;
                        break;
                    }
                    _ => break,
                }
            }
        }

        TypeDescriptor {
            namespace,
            name,
            args,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.chars.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }
}
