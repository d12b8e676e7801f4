//! D-Bus server address handling.
//!
//! An address is a semicolon-separated list of `transport:key=value,...`
//! entries, tried left to right when connecting. Unknown keys are parsed
//! permissively and ignored.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const ENV_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// A single transport within an [`Address`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Transport {
    /// `unix:path=...`, a filesystem socket.
    UnixPath(PathBuf),
    /// `unix:abstract=...`, an abstract-namespace socket (Linux).
    UnixAbstract(Vec<u8>),
    /// `tcp:host=...,port=...`. Parsed for completeness; connecting over
    /// TCP is not supported.
    Tcp { host: String, port: u16 },
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::UnixPath(path) => write!(f, "unix:path={}", path.display()),
            Transport::UnixAbstract(name) => {
                write!(f, "unix:abstract={}", String::from_utf8_lossy(name))
            }
            Transport::Tcp { host, port } => write!(f, "tcp:host={host},port={port}"),
        }
    }
}

/// A parsed D-Bus address: one or more transports to try in order.
///
/// # Examples
///
/// ```
/// use minibus::{Address, Transport};
///
/// let address: Address = "unix:path=/tmp/bus,guid=0123;unix:abstract=alt".parse()?;
/// assert_eq!(address.transports().len(), 2);
/// assert_eq!(
///     address.transports()[0],
///     Transport::UnixPath("/tmp/bus".into())
/// );
/// # Ok::<_, minibus::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    transports: Vec<Transport>,
}

impl Address {
    /// Construct an address from a single transport.
    pub fn new(transport: Transport) -> Self {
        Self {
            transports: vec![transport],
        }
    }

    /// The transports to try, in order.
    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    /// The session bus address.
    ///
    /// Consults `DBUS_SESSION_BUS_ADDRESS`, falling back to
    /// `$XDG_RUNTIME_DIR/bus`, then `/run/user/<uid>/bus`.
    pub fn session() -> Result<Self> {
        if let Ok(address) = env::var(ENV_SESSION_BUS) {
            return address.parse();
        }

        let runtime_dir = env::var(ENV_RUNTIME_DIR).unwrap_or_else(|_| {
            let uid = unsafe { libc::getuid() };
            format!("/run/user/{uid}")
        });

        Ok(Self::new(Transport::UnixPath(
            PathBuf::from(runtime_dir).join("bus"),
        )))
    }

    /// The system bus address.
    ///
    /// Consults `DBUS_SYSTEM_BUS_ADDRESS`, falling back to the well-known
    /// `/var/run/dbus/system_bus_socket`.
    pub fn system() -> Result<Self> {
        match env::var(ENV_SYSTEM_BUS) {
            Ok(address) => address.parse(),
            Err(..) => DEFAULT_SYSTEM_BUS.parse(),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut transports = Vec::new();

        for entry in s.split(';') {
            if entry.is_empty() {
                continue;
            }

            transports.push(parse_transport(entry)?);
        }

        if transports.is_empty() {
            return Err(Error::InvalidAddress(s.to_owned()));
        }

        Ok(Self { transports })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for transport in &self.transports {
            if !first {
                f.write_str(";")?;
            }

            first = false;
            transport.fmt(f)?;
        }

        Ok(())
    }
}

fn parse_transport(entry: &str) -> Result<Transport> {
    let (kind, options) = entry
        .split_once(':')
        .ok_or_else(|| Error::InvalidAddress(entry.to_owned()))?;

    let mut path = None;
    let mut abstract_name = None;
    let mut host = None;
    let mut port = None;

    for option in options.split(',') {
        if option.is_empty() {
            continue;
        }

        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| Error::InvalidAddress(entry.to_owned()))?;

        match key {
            "path" => path = Some(value),
            "abstract" => abstract_name = Some(value),
            "host" => host = Some(value),
            "port" => port = Some(value),
            // Unknown keys, e.g. guid, are ignored.
            _ => {}
        }
    }

    match kind {
        "unix" => match (path, abstract_name) {
            (Some(path), None) => Ok(Transport::UnixPath(PathBuf::from(path))),
            (None, Some(name)) => Ok(Transport::UnixAbstract(name.as_bytes().to_vec())),
            _ => Err(Error::InvalidAddress(entry.to_owned())),
        },
        "tcp" => {
            let host = host.ok_or_else(|| Error::InvalidAddress(entry.to_owned()))?;
            let port = port
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::InvalidAddress(entry.to_owned()))?;

            Ok(Transport::Tcp {
                host: host.to_owned(),
                port,
            })
        }
        _ => Err(Error::InvalidAddress(entry.to_owned())),
    }
}
