//! Connection-level tests against a miniature bus speaking real SASL and
//! wire framing over a unix socket.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::address::Address;
use crate::error::Error;
use crate::export::{Access, Interface, InterfaceInfo, MethodInfo, Object, PropertyInfo};
use crate::message::{frame_remaining, Body, Message, MessageKind, FIXED_HEADER_LEN};
use crate::signature::Signature;
use crate::value::Value;

use super::{Connection, ConnectionState, MatchRule};

const GUID: &str = "0123456789abcdef0123456789abcdef";

fn sig(text: &str) -> Signature {
    Signature::parse(text).unwrap()
}

/// One accepted peer of the miniature bus.
struct TestBus {
    stream: UnixStream,
    buf: Vec<u8>,
    serial: u32,
}

impl TestBus {
    /// Bind a fresh socket for `name` and return its address.
    fn listen(name: &str) -> (UnixListener, Address) {
        let path: PathBuf =
            std::env::temp_dir().join(format!("minibus-test-{}-{name}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        let address: Address = format!("unix:path={}", path.display()).parse().unwrap();
        (listener, address)
    }

    /// Accept one client and drive it through SASL and `Hello`.
    async fn accept(listener: &UnixListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();

        let mut bus = Self {
            stream,
            buf: Vec::new(),
            serial: 0,
        };

        let auth = bus.read_line().await;
        assert!(auth.starts_with("AUTH "), "{auth}");
        bus.write_line(&format!("OK {GUID}")).await;

        let begin = bus.read_line().await;
        assert_eq!(begin, "BEGIN");

        let hello = bus.recv().await;
        assert_eq!(hello.member(), Some("Hello"));
        assert_eq!(hello.destination(), Some("org.freedesktop.DBus"));

        let reply = hello
            .reply()
            .unwrap()
            .with_body(sig("s"), &[Value::String(":1.0".into())])
            .unwrap();
        bus.send(reply).await;

        bus
    }

    async fn fill(&mut self) {
        let mut chunk = [0; 4096];
        let n = self.stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer hung up");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(i) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..i + 1).collect();
                let line = String::from_utf8(line).unwrap();
                return line.trim_matches(['\0', '\r', '\n']).to_owned();
            }

            self.fill().await;
        }
    }

    async fn write_line(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Receive one framed message.
    async fn recv(&mut self) -> Message {
        while self.buf.len() < FIXED_HEADER_LEN {
            self.fill().await;
        }

        let total = FIXED_HEADER_LEN + frame_remaining(&self.buf[..FIXED_HEADER_LEN]).unwrap();

        while self.buf.len() < total {
            self.fill().await;
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();
        Message::parse(&frame).unwrap()
    }

    /// Send a message with a bus-side serial, returning that serial.
    async fn send(&mut self, message: Message) -> NonZeroU32 {
        self.serial += 1;
        let serial = NonZeroU32::new(self.serial).unwrap();
        let bytes = message.with_serial(serial).serialize().unwrap();
        self.stream.write_all(&bytes).await.unwrap();
        serial
    }

    /// Receive a method call and reply to it with an empty body.
    async fn ack_next_call(&mut self, member: &str) -> Message {
        let call = self.recv().await;
        assert_eq!(call.member(), Some(member), "{call:?}");
        let reply = call.reply().unwrap();
        self.send(reply).await;
        call
    }
}

async fn connect(address: &Address) -> Connection {
    let connection = Connection::new(address.clone());
    connection.open().await.unwrap();
    connection
}

#[tokio::test]
async fn open_transitions_and_hello() {
    let (listener, address) = TestBus::listen("open");
    let server = tokio::spawn(async move { TestBus::accept(&listener).await });

    let connection = Connection::new(address);
    assert!(matches!(connection.state(), ConnectionState::Disconnected));

    connection.open().await.unwrap();

    assert!(connection.state().is_connected());
    assert_eq!(connection.unique_name(), Some(":1.0"));
    assert_eq!(connection.server_guid(), Some(GUID));

    // A second open is rejected in the connected state.
    assert!(matches!(
        connection.open().await,
        Err(Error::InvalidState(ConnectionState::Connected))
    ));

    connection.close().await;
    assert!(matches!(connection.state(), ConnectionState::Disconnected));

    server.await.unwrap();
}

#[tokio::test]
async fn call_gets_its_reply() {
    let (listener, address) = TestBus::listen("call");

    let server = tokio::spawn(async move {
        let mut bus = TestBus::accept(&listener).await;

        let call = bus.recv().await;
        assert_eq!(call.member(), Some("Echo"));
        assert_eq!(
            call.arguments().unwrap(),
            [Value::String("hello".into())]
        );

        let reply = call
            .reply()
            .unwrap()
            .with_body(sig("s"), &[Value::String("hello back".into())])
            .unwrap();
        bus.send(reply).await;
    });

    let connection = connect(&address).await;

    let message = Message::method_call("/org/example", "Echo")
        .unwrap()
        .with_interface("org.example.Test")
        .with_body(sig("s"), &[Value::String("hello".into())])
        .unwrap();

    let reply = connection.call(message).await.unwrap();
    assert_eq!(
        reply.arguments().unwrap(),
        [Value::String("hello back".into())]
    );

    server.await.unwrap();
}

#[tokio::test]
async fn error_reply_surfaces_as_remote_error() {
    let (listener, address) = TestBus::listen("remote-error");

    let server = tokio::spawn(async move {
        let mut bus = TestBus::accept(&listener).await;

        let call = bus.recv().await;
        let reply = call
            .error_reply("org.example.Error.Boom", "it broke")
            .unwrap();
        bus.send(reply).await;
    });

    let connection = connect(&address).await;

    let message = Message::method_call("/org/example", "Boom").unwrap();
    let error = connection.call(message).await.unwrap_err();

    match error {
        Error::Remote { name, message } => {
            assert_eq!(name, "org.example.Error.Boom");
            assert_eq!(message, "it broke");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    server.await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_correlate_out_of_order() {
    let (listener, address) = TestBus::listen("concurrent");

    let server = tokio::spawn(async move {
        let mut bus = TestBus::accept(&listener).await;

        let mut calls = Vec::new();

        for _ in 0..3 {
            calls.push(bus.recv().await);
        }

        // Reply in reverse arrival order; correlation is by serial.
        for call in calls.into_iter().rev() {
            let args = call.arguments().unwrap();
            let [Value::String(text)] = &args[..] else {
                panic!("expected a string body");
            };

            let reply = call
                .reply()
                .unwrap()
                .with_body(sig("s"), &[Value::String(format!("re:{text}"))])
                .unwrap();
            bus.send(reply).await;
        }
    });

    let connection = connect(&address).await;

    let call = |text: &str| {
        let connection = connection.clone();
        let message = Message::method_call("/org/example", "Echo")
            .unwrap()
            .with_body(sig("s"), &[Value::String(text.into())])
            .unwrap();
        async move { connection.call(message).await }
    };

    let (a, b, c) = tokio::join!(call("a"), call("b"), call("c"));

    assert_eq!(a.unwrap().arguments().unwrap(), [Value::String("re:a".into())]);
    assert_eq!(b.unwrap().arguments().unwrap(), [Value::String("re:b".into())]);
    assert_eq!(c.unwrap().arguments().unwrap(), [Value::String("re:c".into())]);

    server.await.unwrap();
}

#[tokio::test]
async fn call_with_timeout_times_out() {
    let (listener, address) = TestBus::listen("timeout");

    let server = tokio::spawn(async move {
        let mut bus = TestBus::accept(&listener).await;
        // Swallow the call and never reply.
        let _call = bus.recv().await;
        // Hold the stream open until the client is done.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let connection = connect(&address).await;

    let message = Message::method_call("/org/example", "Hang").unwrap();
    let error = connection
        .call_with_timeout(message, Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(error, Error::TimedOut), "{error:?}");

    // The waiter is detached; the table does not leak.
    assert!(connection.inner.pending.lock().unwrap().is_empty());

    server.await.unwrap();
}

#[tokio::test]
async fn peer_hangup_fails_pending_calls() {
    let (listener, address) = TestBus::listen("hangup");

    let server = tokio::spawn(async move {
        let mut bus = TestBus::accept(&listener).await;
        let _call = bus.recv().await;
        // Drop the stream with the call outstanding.
    });

    let connection = connect(&address).await;

    let message = Message::method_call("/org/example", "Hang").unwrap();
    let error = connection.call(message).await.unwrap_err();
    assert!(matches!(error, Error::Closed), "{error:?}");

    // The failure reason is preserved on the connection.
    assert!(matches!(connection.state(), ConnectionState::Error(..)));

    server.await.unwrap();
}

#[tokio::test]
async fn signals_route_by_match_rule() {
    let (listener, address) = TestBus::listen("signals");

    let server = tokio::spawn(async move {
        let mut bus = TestBus::accept(&listener).await;

        let add_match = bus.ack_next_call("AddMatch").await;
        assert_eq!(
            add_match.arguments().unwrap(),
            [Value::String(
                "type='signal',interface='org.example.Clock',member='Tick'".into()
            )]
        );

        // The client signals readiness once its subscription is in place.
        bus.ack_next_call("Ready").await;

        // One non-matching and one matching signal.
        let tock = Message::signal("/clock", "org.example.Clock", "Tock").unwrap();
        bus.send(tock).await;

        let tick = Message::signal("/clock", "org.example.Clock", "Tick")
            .unwrap()
            .with_body(sig("u"), &[Value::Uint32(7)])
            .unwrap();
        bus.send(tick).await;
    });

    let connection = connect(&address).await;

    let rule = MatchRule::signal()
        .with_interface("org.example.Clock")
        .with_member("Tick");
    let mut stream = connection.subscribe(rule).await.unwrap();

    let ready = Message::method_call("/org/example", "Ready").unwrap();
    connection.call(ready).await.unwrap();

    let signal = stream.next().await.unwrap();
    assert_eq!(signal.member(), Some("Tick"));
    assert_eq!(signal.arguments().unwrap(), [Value::Uint32(7)]);

    server.await.unwrap();
}

struct Counter;

impl Interface for Counter {
    fn info(&self) -> InterfaceInfo {
        InterfaceInfo::new("org.example.Counter")
            .with_method(MethodInfo::new("Add"))
            .with_property(PropertyInfo::new(
                "Step",
                sig("u"),
                Access::ReadWrite,
            ))
    }

    fn call(&self, member: &str, args: &[Value]) -> Result<Body, crate::DispatchError> {
        match member {
            "Add" => match args {
                [Value::Uint32(a), Value::Uint32(b)] => Ok(Body::new(
                    sig("u"),
                    vec![Value::Uint32(a + b)],
                )),
                _ => Err(crate::DispatchError::InvalidArgs("expected (uu)".into())),
            },
            _ => Err(crate::DispatchError::UnknownMethod(member.to_owned())),
        }
    }

    fn get_property(&self, name: &str) -> Result<Value, crate::DispatchError> {
        match name {
            "Step" => Ok(Value::Uint32(1)),
            _ => Err(crate::DispatchError::UnknownProperty(name.to_owned())),
        }
    }

    fn set_property(&self, name: &str, _value: Value) -> Result<(), crate::DispatchError> {
        match name {
            "Step" => Ok(()),
            _ => Err(crate::DispatchError::UnknownProperty(name.to_owned())),
        }
    }
}

#[tokio::test]
async fn exported_object_answers_method_calls() {
    let (listener, address) = TestBus::listen("export");

    let server = tokio::spawn(async move {
        let mut bus = TestBus::accept(&listener).await;

        // The client signals readiness once its object is exported.
        bus.ack_next_call("Ready").await;

        // A call to the exported object.
        let call = Message::method_call("/counter", "Add")
            .unwrap()
            .with_interface("org.example.Counter")
            .with_sender(":1.9")
            .with_body(sig("uu"), &[Value::Uint32(2), Value::Uint32(3)])
            .unwrap();
        let call_serial = bus.send(call).await;

        let reply = bus.recv().await;
        assert!(matches!(reply.kind(), MessageKind::MethodReturn { .. }));
        assert_eq!(reply.reply_serial(), Some(call_serial));
        assert_eq!(reply.destination(), Some(":1.9"));
        assert_eq!(reply.arguments().unwrap(), [Value::Uint32(5)]);

        // A call to a path nothing is exported at.
        let call = Message::method_call("/nowhere", "Add")
            .unwrap()
            .with_interface("org.example.Counter");
        bus.send(call).await;

        let reply = bus.recv().await;
        assert_eq!(
            reply.error_name(),
            Some("org.freedesktop.DBus.Error.UnknownObject")
        );

        // Peer.Ping is answered by the adapter.
        let call = Message::method_call("/counter", "Ping")
            .unwrap()
            .with_interface("org.freedesktop.DBus.Peer");
        bus.send(call).await;

        let reply = bus.recv().await;
        assert!(matches!(reply.kind(), MessageKind::MethodReturn { .. }));

        // Properties.Set is answered and followed by PropertiesChanged.
        let call = Message::method_call("/counter", "Set")
            .unwrap()
            .with_interface("org.freedesktop.DBus.Properties")
            .with_body(
                sig("ssv"),
                &[
                    Value::String("org.example.Counter".into()),
                    Value::String("Step".into()),
                    Value::variant(sig("u"), Value::Uint32(4)),
                ],
            )
            .unwrap();
        bus.send(call).await;

        let reply = bus.recv().await;
        assert!(matches!(reply.kind(), MessageKind::MethodReturn { .. }));

        let signal = bus.recv().await;
        assert_eq!(signal.member(), Some("PropertiesChanged"));
        assert_eq!(signal.path().map(|p| p.as_str()), Some("/counter"));
        assert_eq!(
            signal.arguments().unwrap(),
            [
                Value::String("org.example.Counter".into()),
                Value::Dict(vec![(
                    Value::String("Step".into()),
                    Value::variant(sig("u"), Value::Uint32(4)),
                )]),
                Value::Array(Vec::new()),
            ]
        );
    });

    let connection = connect(&address).await;

    let exported = connection.export(
        "/counter".parse().unwrap(),
        Object::new().with_interface(Counter),
    );
    assert!(exported);

    // Exporting the same path again is refused.
    assert!(!connection.export(
        "/counter".parse().unwrap(),
        Object::new().with_interface(Counter),
    ));

    let ready = Message::method_call("/org/example", "Ready").unwrap();
    connection.call(ready).await.unwrap();

    server.await.unwrap();

    assert!(connection.unexport(&"/counter".parse().unwrap()));
}

#[tokio::test]
async fn serials_are_monotonic_and_skip_zero() {
    let connection = Connection::new("unix:path=/nonexistent".parse().unwrap());

    assert_eq!(connection.inner.next_serial().get(), 1);
    assert_eq!(connection.inner.next_serial().get(), 2);
    assert_eq!(connection.inner.next_serial().get(), 3);

    // Wrap skips zero.
    connection.inner.serial.store(u32::MAX, Ordering::Relaxed);
    assert_eq!(connection.inner.next_serial().get(), u32::MAX);
    assert_eq!(connection.inner.next_serial().get(), 1);
}

#[tokio::test]
async fn send_on_disconnected_connection() {
    let connection = Connection::new("unix:path=/nonexistent".parse().unwrap());

    let message = Message::method_call("/org/example", "Nop").unwrap();
    assert!(matches!(
        connection.send(message).await,
        Err(Error::Closed)
    ));
}
