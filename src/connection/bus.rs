//! Wrappers for the housekeeping calls every bus daemon implements on
//! `org.freedesktop.DBus`.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::message::{Body, Message};
use crate::signature::Signature;
use crate::value::Value;

use super::{Connection, MatchRule};

pub(crate) const BUS_SERVICE: &str = "org.freedesktop.DBus";
pub(crate) const BUS_PATH: &str = "/org/freedesktop/DBus";
pub(crate) const BUS_INTERFACE: &str = "org.freedesktop.DBus";

bitflags! {
    /// Flags accepted by [`Connection::request_name`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestNameFlags: u32 {
        /// Allow another peer to take the name over.
        const ALLOW_REPLACEMENT = 0x1;
        /// Take the name over from its current owner if permitted.
        const REPLACE_EXISTING = 0x2;
        /// Fail instead of queueing when the name is taken.
        const DO_NOT_QUEUE = 0x4;
    }
}

/// The reply of [`Connection::request_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    /// The caller is now the primary owner.
    PrimaryOwner,
    /// The name is taken; the caller has been queued.
    InQueue,
    /// The name is taken and the caller asked not to queue.
    Exists,
    /// The caller already owns the name.
    AlreadyOwner,
}

/// The reply of [`Connection::release_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

impl Connection {
    /// The `Hello` handshake naming this connection, issued once on open.
    pub(crate) async fn hello(&self) -> Result<String> {
        let reply = self.bus_call("Hello", Body::empty()).await?;
        single_string(reply)
    }

    /// Request ownership of a well-known name.
    pub async fn request_name(
        &self,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<RequestNameReply> {
        let body = Body::new(
            Signature::parse("su").expect("valid signature"),
            vec![Value::String(name.to_owned()), Value::Uint32(flags.bits())],
        );

        match single_u32(self.bus_call("RequestName", body).await?)? {
            1 => Ok(RequestNameReply::PrimaryOwner),
            2 => Ok(RequestNameReply::InQueue),
            3 => Ok(RequestNameReply::Exists),
            4 => Ok(RequestNameReply::AlreadyOwner),
            _ => Err(Error::BodySignatureMismatch),
        }
    }

    /// Release a well-known name.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        let body = Body::new(
            Signature::parse("s").expect("valid signature"),
            vec![Value::String(name.to_owned())],
        );

        match single_u32(self.bus_call("ReleaseName", body).await?)? {
            1 => Ok(ReleaseNameReply::Released),
            2 => Ok(ReleaseNameReply::NonExistent),
            3 => Ok(ReleaseNameReply::NotOwner),
            _ => Err(Error::BodySignatureMismatch),
        }
    }

    /// Every name currently on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.bus_call("ListNames", Body::empty()).await?;

        let mut args = reply.arguments()?;

        let Some(Value::Array(values)) = args.pop().filter(|_| args.is_empty()) else {
            return Err(Error::BodySignatureMismatch);
        };

        values
            .into_iter()
            .map(|value| match value {
                Value::String(s) => Ok(s),
                _ => Err(Error::BodySignatureMismatch),
            })
            .collect()
    }

    /// Whether `name` currently has an owner.
    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        let body = Body::new(
            Signature::parse("s").expect("valid signature"),
            vec![Value::String(name.to_owned())],
        );

        let reply = self.bus_call("NameHasOwner", body).await?;
        let mut args = reply.arguments()?;

        match args.pop().filter(|_| args.is_empty()) {
            Some(Value::Bool(b)) => Ok(b),
            _ => Err(Error::BodySignatureMismatch),
        }
    }

    /// The unique name owning `name`.
    pub async fn get_name_owner(&self, name: &str) -> Result<String> {
        let body = Body::new(
            Signature::parse("s").expect("valid signature"),
            vec![Value::String(name.to_owned())],
        );

        single_string(self.bus_call("GetNameOwner", body).await?)
    }

    /// The globally unique id of the bus.
    pub async fn get_id(&self) -> Result<String> {
        single_string(self.bus_call("GetId", Body::empty()).await?)
    }

    /// Register a match rule with the bus.
    pub async fn add_match(&self, rule: &MatchRule) -> Result<()> {
        let body = Body::new(
            Signature::parse("s").expect("valid signature"),
            vec![Value::String(rule.to_string())],
        );

        self.bus_call("AddMatch", body).await?;
        Ok(())
    }

    /// Remove a previously registered match rule.
    pub async fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        let body = Body::new(
            Signature::parse("s").expect("valid signature"),
            vec![Value::String(rule.to_string())],
        );

        self.bus_call("RemoveMatch", body).await?;
        Ok(())
    }

    async fn bus_call(&self, member: &str, body: Body) -> Result<Message> {
        let message = Message::method_call(BUS_PATH, member)?
            .with_interface(BUS_INTERFACE)
            .with_destination(BUS_SERVICE)
            .with_body(body.signature, &body.values)?;

        self.call(message).await
    }
}

fn single_string(reply: Message) -> Result<String> {
    let mut args = reply.arguments()?;

    match args.pop().filter(|_| args.is_empty()) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(Error::BodySignatureMismatch),
    }
}

fn single_u32(reply: Message) -> Result<u32> {
    let mut args = reply.arguments()?;

    match args.pop().filter(|_| args.is_empty()) {
        Some(Value::Uint32(n)) => Ok(n),
        _ => Err(Error::BodySignatureMismatch),
    }
}
