//! Exporting local objects: the capability trait implemented by user
//! interfaces, and the adapter supplying the standard `Peer`, `Properties`
//! and `Introspectable` behavior in front of them.

use crate::error::DispatchError;
use crate::message::Body;
use crate::signature::Signature;
use crate::value::Value;

pub(crate) use self::introspect::standard_interfaces;
mod introspect;

pub(crate) use self::machine_id::machine_id;
mod machine_id;


pub(crate) const PEER: &str = "org.freedesktop.DBus.Peer";
pub(crate) const PROPERTIES: &str = "org.freedesktop.DBus.Properties";
pub(crate) const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

/// Access mode of an exported property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }
}

/// A named argument of a method or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub name: Option<String>,
    pub signature: Signature,
}

impl ArgInfo {
    pub fn new(name: impl Into<String>, signature: Signature) -> Self {
        Self {
            name: Some(name.into()),
            signature,
        }
    }

    pub fn unnamed(signature: Signature) -> Self {
        Self {
            name: None,
            signature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub in_args: Vec<ArgInfo>,
    pub out_args: Vec<ArgInfo>,
}

impl MethodInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_args: Vec::new(),
            out_args: Vec::new(),
        }
    }

    pub fn with_in_arg(mut self, arg: ArgInfo) -> Self {
        self.in_args.push(arg);
        self
    }

    pub fn with_out_arg(mut self, arg: ArgInfo) -> Self {
        self.out_args.push(arg);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub signature: Signature,
    pub access: Access,
}

impl PropertyInfo {
    pub fn new(name: impl Into<String>, signature: Signature, access: Access) -> Self {
        Self {
            name: name.into(),
            signature,
            access,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
}

impl SignalInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: ArgInfo) -> Self {
        self.args.push(arg);
        self
    }
}

/// The description of one interface: its methods, properties and signals,
/// as surfaced through introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
    pub properties: Vec<PropertyInfo>,
    pub signals: Vec<SignalInfo>,
}

impl InterfaceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: MethodInfo) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_signal(mut self, signal: SignalInfo) -> Self {
        self.signals.push(signal);
        self
    }

    fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }

    fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }
}

/// The capability set implemented by an exported interface.
///
/// Callbacks run on the connection's read loop, so inbound calls on one
/// connection dispatch strictly in arrival order.
pub trait Interface: Send + Sync {
    /// Describe the interface for introspection and property access checks.
    fn info(&self) -> InterfaceInfo;

    /// Invoke a method. The returned [`Body`] becomes the reply.
    fn call(&self, member: &str, args: &[Value]) -> Result<Body, DispatchError>;

    /// Read a property. The adapter wraps the value into a variant using
    /// the signature declared in [`info`].
    ///
    /// [`info`]: Self::info
    fn get_property(&self, name: &str) -> Result<Value, DispatchError> {
        Err(DispatchError::UnknownProperty(name.to_owned()))
    }

    /// Write a property.
    fn set_property(&self, name: &str, value: Value) -> Result<(), DispatchError> {
        let _ = value;
        Err(DispatchError::UnknownProperty(name.to_owned()))
    }
}

/// The result of dispatching an inbound method call to an [`Object`].
#[derive(Debug)]
pub(crate) struct DispatchOutcome {
    /// The reply payload.
    pub(crate) body: Body,
    /// Set when a `Properties.Set` succeeded and `PropertiesChanged` must
    /// be emitted.
    pub(crate) properties_changed: Option<PropertyChange>,
}

impl DispatchOutcome {
    fn reply(body: Body) -> Self {
        Self {
            body,
            properties_changed: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PropertyChange {
    pub(crate) interface: String,
    pub(crate) name: String,
    pub(crate) signature: Signature,
    pub(crate) value: Value,
}

/// A set of interfaces exported under one object path.
///
/// The standard `Peer`, `Properties` and `Introspectable` interfaces are
/// answered by the adapter itself and take precedence; everything else is
/// forwarded to the matching user interface.
///
/// # Examples
///
/// ```
/// use minibus::{Body, DispatchError, Interface, InterfaceInfo, MethodInfo, Object, Value};
///
/// struct Echo;
///
/// impl Interface for Echo {
///     fn info(&self) -> InterfaceInfo {
///         InterfaceInfo::new("org.example.Echo")
///             .with_method(MethodInfo::new("Echo"))
///     }
///
///     fn call(&self, member: &str, args: &[Value]) -> Result<Body, DispatchError> {
///         match member {
///             "Echo" => Ok(Body::empty()),
///             _ => Err(DispatchError::UnknownMethod(member.to_owned())),
///         }
///     }
/// }
///
/// let object = Object::new().with_interface(Echo);
/// ```
#[derive(Default)]
pub struct Object {
    interfaces: Vec<(String, Box<dyn Interface>)>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interface to this object.
    pub fn with_interface(mut self, interface: impl Interface + 'static) -> Self {
        let name = interface.info().name;
        self.interfaces.push((name, Box::new(interface)));
        self
    }

    fn interface(&self, name: &str) -> Result<&dyn Interface, DispatchError> {
        self.interfaces
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, i)| &**i)
            .ok_or_else(|| DispatchError::UnknownInterface(name.to_owned()))
    }

    /// The introspection descriptions of the user interfaces.
    pub(crate) fn interface_infos(&self) -> Vec<InterfaceInfo> {
        self.interfaces.iter().map(|(_, i)| i.info()).collect()
    }

    /// Dispatch an inbound method call: standard interfaces first, then the
    /// user interfaces.
    pub(crate) fn dispatch(
        &self,
        interface: Option<&str>,
        member: &str,
        args: &[Value],
    ) -> Result<DispatchOutcome, DispatchError> {
        match interface {
            Some(PEER) => self.peer_call(member, args).map(DispatchOutcome::reply),
            Some(PROPERTIES) => self.properties_call(member, args),
            Some(INTROSPECTABLE) => match member {
                "Introspect" => Ok(DispatchOutcome::reply(self.introspect_body())),
                _ => Err(DispatchError::UnknownMethod(member.to_owned())),
            },
            Some(name) => self
                .interface(name)?
                .call(member, args)
                .map(DispatchOutcome::reply),
            // Without an INTERFACE field the member is searched across
            // interfaces, standard ones first.
            None => {
                match member {
                    "Ping" | "GetMachineId" => {
                        return self.peer_call(member, args).map(DispatchOutcome::reply);
                    }
                    "Get" | "Set" | "GetAll" => {
                        return self.properties_call(member, args);
                    }
                    "Introspect" => {
                        return Ok(DispatchOutcome::reply(self.introspect_body()));
                    }
                    _ => {}
                }

                for (_, interface) in &self.interfaces {
                    if interface.info().has_method(member) {
                        return interface.call(member, args).map(DispatchOutcome::reply);
                    }
                }

                Err(DispatchError::UnknownMethod(member.to_owned()))
            }
        }
    }

    fn peer_call(&self, member: &str, args: &[Value]) -> Result<Body, DispatchError> {
        match member {
            "Ping" => {
                expect_no_args(args)?;
                Ok(Body::empty())
            }
            "GetMachineId" => {
                expect_no_args(args)?;
                Ok(Body::new(
                    Signature::parse("s").expect("valid signature"),
                    vec![Value::String(machine_id().to_owned())],
                ))
            }
            _ => Err(DispatchError::UnknownMethod(member.to_owned())),
        }
    }

    fn properties_call(
        &self,
        member: &str,
        args: &[Value],
    ) -> Result<DispatchOutcome, DispatchError> {
        match member {
            "Get" => {
                let [Value::String(interface), Value::String(name)] = args else {
                    return Err(DispatchError::InvalidArgs("expected (ss)".to_owned()));
                };

                let target = self.interface(interface)?;
                let info = target.info();

                let Some(property) = info.property(name) else {
                    return Err(DispatchError::UnknownProperty(name.clone()));
                };

                let value = target.get_property(name)?;

                Ok(DispatchOutcome::reply(Body::new(
                    Signature::parse("v").expect("valid signature"),
                    vec![Value::variant(property.signature.clone(), value)],
                )))
            }
            "Set" => {
                let [Value::String(interface), Value::String(name), value] = args else {
                    return Err(DispatchError::InvalidArgs("expected (ssv)".to_owned()));
                };

                let target = self.interface(interface)?;
                let info = target.info();

                let Some(property) = info.property(name) else {
                    return Err(DispatchError::UnknownProperty(name.clone()));
                };

                if !property.access.writable() {
                    return Err(DispatchError::PropertyReadOnly(name.clone()));
                }

                let value = value.clone().unwrap_variant();
                target.set_property(name, value.clone())?;

                Ok(DispatchOutcome {
                    body: Body::empty(),
                    properties_changed: Some(PropertyChange {
                        interface: interface.clone(),
                        name: name.clone(),
                        signature: property.signature.clone(),
                        value,
                    }),
                })
            }
            "GetAll" => {
                let [Value::String(interface)] = args else {
                    return Err(DispatchError::InvalidArgs("expected (s)".to_owned()));
                };

                let target = self.interface(interface)?;
                let info = target.info();

                let mut entries = Vec::new();

                for property in &info.properties {
                    if !property.access.readable() {
                        continue;
                    }

                    let value = target.get_property(&property.name)?;
                    entries.push((
                        Value::String(property.name.clone()),
                        Value::variant(property.signature.clone(), value),
                    ));
                }

                Ok(DispatchOutcome::reply(Body::new(
                    Signature::parse("a{sv}").expect("valid signature"),
                    vec![Value::Dict(entries)],
                )))
            }
            _ => Err(DispatchError::UnknownMethod(member.to_owned())),
        }
    }

    fn introspect_body(&self) -> Body {
        Body::new(
            Signature::parse("s").expect("valid signature"),
            vec![Value::String(self.introspect())],
        )
    }

    /// The introspection XML document for this object.
    pub fn introspect(&self) -> String {
        let mut infos = standard_interfaces();
        infos.extend(self.interface_infos());
        introspect::to_xml(&infos)
    }
}

fn expect_no_args(args: &[Value]) -> Result<(), DispatchError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(DispatchError::InvalidArgs("expected no arguments".to_owned()))
    }
}
