use std::fmt;

use crate::message::{Message, MessageKind};
use crate::object_path::ObjectPath;

/// The message kind selected by a [`MatchRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MatchKind {
    fn as_str(self) -> &'static str {
        match self {
            MatchKind::MethodCall => "method_call",
            MatchKind::MethodReturn => "method_return",
            MatchKind::Error => "error",
            MatchKind::Signal => "signal",
        }
    }

    fn matches(self, kind: &MessageKind) -> bool {
        matches!(
            (self, kind),
            (MatchKind::MethodCall, MessageKind::MethodCall { .. })
                | (MatchKind::MethodReturn, MessageKind::MethodReturn { .. })
                | (MatchKind::Error, MessageKind::Error { .. })
                | (MatchKind::Signal, MessageKind::Signal { .. })
        )
    }
}

/// A filter for inbound messages, also rendered into the bus rule syntax
/// used by `AddMatch` and `RemoveMatch`.
///
/// # Examples
///
/// ```
/// use minibus::MatchRule;
///
/// let rule = MatchRule::signal()
///     .with_interface("org.freedesktop.DBus")
///     .with_member("NameOwnerChanged");
///
/// assert_eq!(
///     rule.to_string(),
///     "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'",
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    kind: Option<MatchKind>,
    sender: Option<String>,
    path: Option<ObjectPath>,
    interface: Option<String>,
    member: Option<String>,
}

impl MatchRule {
    /// An empty rule matching every message.
    pub fn new() -> Self {
        Self::default()
    }

    /// A rule matching signals.
    pub fn signal() -> Self {
        Self {
            kind: Some(MatchKind::Signal),
            ..Self::default()
        }
    }

    pub fn with_kind(self, kind: MatchKind) -> Self {
        Self {
            kind: Some(kind),
            ..self
        }
    }

    pub fn with_sender(self, sender: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            ..self
        }
    }

    pub fn with_path(self, path: ObjectPath) -> Self {
        Self {
            path: Some(path),
            ..self
        }
    }

    pub fn with_interface(self, interface: impl Into<String>) -> Self {
        Self {
            interface: Some(interface.into()),
            ..self
        }
    }

    pub fn with_member(self, member: impl Into<String>) -> Self {
        Self {
            member: Some(member.into()),
            ..self
        }
    }

    /// Evaluate the rule against a message.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(kind) = self.kind {
            if !kind.matches(message.kind()) {
                return false;
            }
        }

        if let Some(sender) = &self.sender {
            if message.sender() != Some(sender.as_str()) {
                return false;
            }
        }

        if let Some(path) = &self.path {
            if message.path() != Some(path) {
                return false;
            }
        }

        if let Some(interface) = &self.interface {
            if message.interface() != Some(interface.as_str()) {
                return false;
            }
        }

        if let Some(member) = &self.member {
            if message.member() != Some(member.as_str()) {
                return false;
            }
        }

        true
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";

        let mut item = |f: &mut fmt::Formatter<'_>, key: &str, value: &str| {
            let result = write!(f, "{sep}{key}='{value}'");
            sep = ",";
            result
        };

        if let Some(kind) = self.kind {
            item(f, "type", kind.as_str())?;
        }

        if let Some(sender) = &self.sender {
            item(f, "sender", sender)?;
        }

        if let Some(path) = &self.path {
            item(f, "path", path.as_str())?;
        }

        if let Some(interface) = &self.interface {
            item(f, "interface", interface)?;
        }

        if let Some(member) = &self.member {
            item(f, "member", member)?;
        }

        Ok(())
    }
}
