//! The connection actor: transport bring-up, SASL, serial allocation, the
//! background read loop, reply correlation, signal routing, and the
//! exported-object registry.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::address::{Address, Transport};
use crate::error::{Error, Result};
use crate::export::Object;
use crate::message::{Message, MessageKind};
use crate::object_path::ObjectPath;
use crate::sasl::{self, AuthMechanism};
use crate::value::Value;

pub use self::bus::{ReleaseNameReply, RequestNameFlags, RequestNameReply};
mod bus;

pub use self::match_rule::{MatchKind, MatchRule};
mod match_rule;

mod reader;

#[cfg(test)]
mod tests;

/// The lifecycle state of a [`Connection`].
///
/// Transitions are one-way: `Disconnected → Connecting → Authenticating →
/// Connected`, with `Disconnected` also the terminal state after
/// [`Connection::close`] and `Error` the terminal state after a failure.
#[derive(Debug, Clone, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// The connection failed; the original error is preserved.
    Error(Arc<Error>),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(error) => write!(f, "error ({error})"),
        }
    }
}

pub(crate) struct Inner {
    address: Address,
    state: Mutex<ConnectionState>,
    /// The write half of the stream. Writes are mutually exclusive so the
    /// bytes of one message are never interleaved with another.
    write: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Next outbound serial. Incremented under the write lock; zero is
    /// skipped on wrap.
    serial: AtomicU32,
    server_guid: OnceLock<String>,
    unique_name: OnceLock<String>,
    /// Waiters for replies, keyed by the serial of the outbound call.
    pending: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    objects: Mutex<HashMap<ObjectPath, Object>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Subscription {
    id: u64,
    rule: MatchRule,
    sender: mpsc::UnboundedSender<Message>,
}

impl Inner {
    fn next_serial(&self) -> NonZeroU32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);

            if let Some(serial) = NonZeroU32::new(serial) {
                return serial;
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("state lock") = state;
    }

    /// Resolve every pending waiter with *connection closed* by dropping
    /// its sender.
    fn fail_pending(&self) {
        self.pending.lock().expect("pending lock").clear();
    }
}

/// A connection to a D-Bus bus.
///
/// The connection is a single logical actor: any number of callers may use
/// a clone of the handle concurrently, while internal state is only touched
/// under its locks and inbound traffic is handled by one background read
/// loop.
///
/// # Examples
///
/// ```no_run
/// use minibus::Connection;
///
/// # #[tokio::main] async fn main() -> minibus::Result<()> {
/// let connection = Connection::session_bus().await?;
/// println!("{:?}", connection.unique_name());
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Construct a connection to the given address, initially disconnected.
    pub fn new(address: Address) -> Self {
        Self {
            inner: Arc::new(Inner {
                address,
                state: Mutex::new(ConnectionState::Disconnected),
                write: tokio::sync::Mutex::new(None),
                serial: AtomicU32::new(1),
                server_guid: OnceLock::new(),
                unique_name: OnceLock::new(),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                objects: Mutex::new(HashMap::new()),
                reader: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Connect and open a connection to the session bus.
    pub async fn session_bus() -> Result<Self> {
        let connection = Self::new(Address::session()?);
        connection.open().await?;
        Ok(connection)
    }

    /// Connect and open a connection to the system bus.
    pub async fn system_bus() -> Result<Self> {
        let connection = Self::new(Address::system()?);
        connection.open().await?;
        Ok(connection)
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().expect("state lock").clone()
    }

    /// The unique name assigned by the bus, once `Hello` has completed.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.unique_name.get().map(String::as_str)
    }

    /// The GUID of the server, once authenticated.
    pub fn server_guid(&self) -> Option<&str> {
        self.inner.server_guid.get().map(String::as_str)
    }

    /// Bring the connection up: transport, SASL, read loop, `Hello`.
    ///
    /// Any step failing moves the connection into the error state with the
    /// reason preserved.
    pub async fn open(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("state lock");

            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                ref other => return Err(Error::InvalidState(other.clone())),
            }
        }

        match self.open_steps().await {
            Ok(()) => Ok(()),
            Err(error) => {
                let error = error.shared();
                self.inner.set_state(ConnectionState::Error(error.clone()));
                Err(Error::Shared(error))
            }
        }
    }

    async fn open_steps(&self) -> Result<()> {
        let mut stream = connect_any(&self.inner.address).await?;

        self.inner.set_state(ConnectionState::Authenticating);

        // File descriptor passing is not wired up, so it is not negotiated.
        let handshake = sasl::authenticate(&mut stream, AuthMechanism::DEFAULT, false).await?;
        let _ = self.inner.server_guid.set(handshake.guid);

        let (read, write) = stream.into_split();
        *self.inner.write.lock().await = Some(write);
        self.inner.set_state(ConnectionState::Connected);

        let handle = tokio::spawn(reader::run(
            read,
            handshake.leftover,
            Arc::downgrade(&self.inner),
        ));
        *self.inner.reader.lock().expect("reader lock") = Some(handle);

        let name = self.hello().await?;
        let _ = self.inner.unique_name.set(name);
        Ok(())
    }

    /// Tear the connection down.
    ///
    /// Pending callers resolve with [`Error::Closed`]; exported objects and
    /// signal subscriptions are dropped.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().expect("state lock");

            if matches!(*state, ConnectionState::Disconnected) {
                return;
            }

            *state = ConnectionState::Disconnected;
        }

        if let Some(handle) = self.inner.reader.lock().expect("reader lock").take() {
            handle.abort();
        }

        *self.inner.write.lock().await = None;
        self.inner.fail_pending();
        self.inner.subscriptions.lock().expect("subscriptions lock").clear();
        self.inner.objects.lock().expect("objects lock").clear();
    }

    /// Send a message without waiting for any reply.
    ///
    /// The serial is assigned here and returned.
    pub async fn send(&self, message: Message) -> Result<NonZeroU32> {
        self.send_with_waiter(message, None).await
    }

    async fn send_with_waiter(
        &self,
        message: Message,
        waiter: Option<oneshot::Sender<Message>>,
    ) -> Result<NonZeroU32> {
        let mut guard = self.inner.write.lock().await;

        let Some(stream) = guard.as_mut() else {
            return Err(Error::Closed);
        };

        // Serial allocation happens under the write lock, so serial numbers
        // reflect write order.
        let serial = self.inner.next_serial();
        let message = message.with_serial(serial);
        let bytes = message.serialize()?;

        if let Some(waiter) = waiter {
            self.inner
                .pending
                .lock()
                .expect("pending lock")
                .insert(serial.get(), waiter);
        }

        if let Err(error) = stream.write_all(&bytes).await {
            self.inner
                .pending
                .lock()
                .expect("pending lock")
                .remove(&serial.get());
            return Err(error.into());
        }

        Ok(serial)
    }

    /// Send a method call and await the matching reply.
    ///
    /// An error reply resolves into [`Error::Remote`]. Cancelling the
    /// future detaches the waiter; a late reply is then logged and dropped.
    pub async fn call(&self, message: Message) -> Result<Message> {
        if !message.expects_reply() {
            return Err(Error::NoReply);
        }

        let (tx, rx) = oneshot::channel();
        let serial = self.send_with_waiter(message, Some(tx)).await?;

        let _guard = PendingGuard {
            inner: Arc::downgrade(&self.inner),
            serial: serial.get(),
        };

        let reply = rx.await.map_err(|_| Error::Closed)?;

        if let MessageKind::Error { error_name, .. } = reply.kind() {
            let name = error_name.clone();

            let text = reply
                .arguments()
                .ok()
                .and_then(|args| args.into_iter().next())
                .and_then(|value| match value {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .unwrap_or_default();

            return Err(Error::Remote {
                name,
                message: text,
            });
        }

        Ok(reply)
    }

    /// Like [`call`], resolving with [`Error::TimedOut`] when no reply
    /// arrives in time.
    ///
    /// [`call`]: Self::call
    pub async fn call_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        match tokio::time::timeout(timeout, self.call(message)).await {
            Ok(result) => result,
            Err(..) => Err(Error::TimedOut),
        }
    }

    /// Subscribe to signals matching `rule`.
    ///
    /// Registers the rule locally and with the bus through `AddMatch`. The
    /// local registration happens first so a signal racing the `AddMatch`
    /// reply is not lost. Dropping the stream detaches the subscription.
    pub async fn subscribe(&self, rule: MatchRule) -> Result<SignalStream> {
        let (sender, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .push(Subscription {
                id,
                rule: rule.clone(),
                sender,
            });

        if let Err(error) = self.add_match(&rule).await {
            self.inner
                .subscriptions
                .lock()
                .expect("subscriptions lock")
                .retain(|sub| sub.id != id);
            return Err(error);
        }

        Ok(SignalStream {
            id,
            inner: Arc::downgrade(&self.inner),
            rx,
        })
    }

    /// Export an object at `path`, making it callable by peers.
    ///
    /// Returns `false` when the path is already taken.
    pub fn export(&self, path: ObjectPath, object: Object) -> bool {
        let mut objects = self.inner.objects.lock().expect("objects lock");

        if objects.contains_key(&path) {
            return false;
        }

        objects.insert(path, object);
        true
    }

    /// Remove the object exported at `path`.
    pub fn unexport(&self, path: &ObjectPath) -> bool {
        self.inner
            .objects
            .lock()
            .expect("objects lock")
            .remove(path)
            .is_some()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .field("unique_name", &self.unique_name())
            .finish_non_exhaustive()
    }
}

/// Detaches a reply waiter when its caller goes away.
struct PendingGuard {
    inner: Weak<Inner>,
    serial: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .pending
                .lock()
                .expect("pending lock")
                .remove(&self.serial);
        }
    }
}

/// A stream of signals matching one [`MatchRule`], in arrival order.
pub struct SignalStream {
    id: u64,
    inner: Weak<Inner>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl SignalStream {
    /// The next matching signal, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subscriptions
                .lock()
                .expect("subscriptions lock")
                .retain(|sub| sub.id != self.id);
        }
    }
}

/// Try the transports of `address` left to right.
async fn connect_any(address: &Address) -> Result<UnixStream> {
    let mut last_error = None;

    for transport in address.transports() {
        match connect_transport(transport).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                debug!("failed to connect `{transport}`: {error}");
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::InvalidAddress(address.to_string())))
}

async fn connect_transport(transport: &Transport) -> Result<UnixStream> {
    match transport {
        Transport::UnixPath(path) => Ok(UnixStream::connect(path).await?),
        #[cfg(target_os = "linux")]
        Transport::UnixAbstract(name) => {
            use std::os::linux::net::SocketAddrExt;

            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
            let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
            stream.set_nonblocking(true)?;
            Ok(UnixStream::from_std(stream)?)
        }
        other => Err(Error::UnsupportedTransport(other.to_string())),
    }
}
