//! Pure Rust asynchronous D-Bus client library for Tokio.
//!
//! The crate connects to a bus over a unix socket, authenticates through
//! SASL, and exchanges framed binary messages: method calls with correlated
//! replies, signals routed by match rules, and inbound calls dispatched to
//! locally exported objects carrying the standard `Peer`, `Properties` and
//! `Introspectable` interfaces.
//!
//! # Examples
//!
//! ```no_run
//! use minibus::{Body, Connection, Proxy};
//!
//! # #[tokio::main] async fn main() -> minibus::Result<()> {
//! let connection = Connection::session_bus().await?;
//!
//! let proxy = Proxy::new(
//!     &connection,
//!     "org.freedesktop.DBus",
//!     "/org/freedesktop/DBus",
//!     "org.freedesktop.DBus",
//! )?;
//!
//! let names = connection.list_names().await?;
//! println!("{names:?}");
//! # Ok(()) }
//! ```

#[doc(inline)]
pub use self::address::{Address, Transport};
mod address;

#[doc(inline)]
pub use self::codec::{Deserializer, Endianness, Serializer};
pub mod codec;

#[doc(inline)]
pub use self::connection::{
    Connection, ConnectionState, MatchKind, MatchRule, ReleaseNameReply, RequestNameFlags,
    RequestNameReply, SignalStream,
};
mod connection;

#[doc(inline)]
pub use self::error::{DispatchError, Error, Result};
mod error;

#[doc(inline)]
pub use self::export::{
    Access, ArgInfo, Interface, InterfaceInfo, MethodInfo, Object, PropertyInfo, SignalInfo,
};
mod export;

#[doc(inline)]
pub use self::message::{Body, Flags, Message, MessageKind};
mod message;

#[doc(inline)]
pub use self::object_path::ObjectPath;
mod object_path;

#[doc(inline)]
pub use self::proxy::Proxy;
mod proxy;

mod sasl;

#[doc(inline)]
pub use self::signature::{Element, Signature, SignatureError};
mod signature;

#[doc(inline)]
pub use self::value::Value;
mod value;
