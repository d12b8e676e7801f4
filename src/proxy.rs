//! A thin client façade for calling methods and accessing properties on a
//! remote object.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::export::{INTROSPECTABLE, PROPERTIES};
use crate::message::{Body, Flags, Message};
use crate::object_path::ObjectPath;
use crate::signature::Signature;
use crate::value::Value;

/// A handle to one interface of one remote object.
///
/// # Examples
///
/// ```no_run
/// use minibus::{Body, Connection, Proxy};
///
/// # #[tokio::main] async fn main() -> minibus::Result<()> {
/// let connection = Connection::session_bus().await?;
///
/// let proxy = Proxy::new(
///     &connection,
///     "org.freedesktop.DBus",
///     "/org/freedesktop/DBus",
///     "org.freedesktop.DBus",
/// )?;
///
/// let reply = proxy.call("GetId", Body::empty()).await?;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct Proxy {
    connection: Connection,
    destination: String,
    path: ObjectPath,
    interface: String,
}

impl Proxy {
    /// Construct a proxy for `interface` of the object at `path` within the
    /// service `destination`.
    pub fn new(
        connection: &Connection,
        destination: impl Into<String>,
        path: impl AsRef<str>,
        interface: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            connection: connection.clone(),
            destination: destination.into(),
            path: ObjectPath::new(path)?,
            interface: interface.into(),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Call `member` on the proxied interface and await its reply payload.
    pub async fn call(&self, member: &str, body: Body) -> Result<Body> {
        self.call_on(&self.interface, member, body).await
    }

    /// Call `member` on an explicit interface of the same object.
    pub async fn call_on(&self, interface: &str, member: &str, body: Body) -> Result<Body> {
        let message = Message::method_call(&self.path, member)?
            .with_interface(interface)
            .with_destination(&*self.destination)
            .with_body(body.signature, &body.values)?;

        let reply = self.connection.call(message).await?;

        Ok(Body::new(reply.signature().clone(), reply.arguments()?))
    }

    /// Call `member` with `NO_REPLY_EXPECTED`, returning once the message
    /// is on the wire.
    pub async fn call_noreply(&self, member: &str, body: Body) -> Result<()> {
        let message = Message::method_call(&self.path, member)?
            .with_interface(&*self.interface)
            .with_destination(&*self.destination)
            .with_flags(Flags::NO_REPLY_EXPECTED)
            .with_body(body.signature, &body.values)?;

        self.connection.send(message).await?;
        Ok(())
    }

    /// Read a property through `org.freedesktop.DBus.Properties.Get`,
    /// unwrapping the reply variant.
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        let body = Body::new(
            Signature::parse("ss").expect("valid signature"),
            vec![
                Value::String(self.interface.clone()),
                Value::String(name.to_owned()),
            ],
        );

        let mut reply = self.call_on(PROPERTIES, "Get", body).await?;

        match reply.values.pop() {
            Some(value) if reply.values.is_empty() => Ok(value.unwrap_variant()),
            _ => Err(Error::BodySignatureMismatch),
        }
    }

    /// Write a property through `org.freedesktop.DBus.Properties.Set`.
    ///
    /// `signature` declares the variant's inner type.
    pub async fn set_property(
        &self,
        name: &str,
        signature: Signature,
        value: Value,
    ) -> Result<()> {
        let body = Body::new(
            Signature::parse("ssv").expect("valid signature"),
            vec![
                Value::String(self.interface.clone()),
                Value::String(name.to_owned()),
                Value::variant(signature, value),
            ],
        );

        self.call_on(PROPERTIES, "Set", body).await?;
        Ok(())
    }

    /// Read every property of the proxied interface through
    /// `org.freedesktop.DBus.Properties.GetAll`.
    pub async fn get_all_properties(&self) -> Result<Vec<(String, Value)>> {
        let body = Body::new(
            Signature::parse("s").expect("valid signature"),
            vec![Value::String(self.interface.clone())],
        );

        let mut reply = self.call_on(PROPERTIES, "GetAll", body).await?;

        let Some(Value::Dict(entries)) = reply.values.pop().filter(|_| reply.values.is_empty())
        else {
            return Err(Error::BodySignatureMismatch);
        };

        entries
            .into_iter()
            .map(|(key, value)| match key {
                Value::String(key) => Ok((key, value.unwrap_variant())),
                _ => Err(Error::BodySignatureMismatch),
            })
            .collect()
    }

    /// Fetch the introspection XML of the proxied object.
    pub async fn introspect(&self) -> Result<String> {
        let mut reply = self
            .call_on(INTROSPECTABLE, "Introspect", Body::empty())
            .await?;

        match reply.values.pop() {
            Some(Value::String(xml)) if reply.values.is_empty() => Ok(xml),
            _ => Err(Error::BodySignatureMismatch),
        }
    }
}
