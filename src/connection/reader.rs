//! The background read loop: framing, parsing, and inbound dispatch.

use std::io;
use std::sync::{Arc, Weak};

use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::net::unix::OwnedReadHalf;

use crate::error::{DispatchError, Error, Result};
use crate::export::DispatchOutcome;
use crate::message::{Message, MessageKind, FIXED_HEADER_LEN};
use crate::signature::Signature;
use crate::value::Value;

use super::{Connection, ConnectionState, Inner};

/// Read frames until the stream or the connection goes away. Owned by the
/// connection; the sole reader of the stream.
pub(super) async fn run(mut read: OwnedReadHalf, leftover: Vec<u8>, inner: Weak<Inner>) {
    let mut buf = leftover;

    loop {
        let frame = match next_frame(&mut read, &mut buf).await {
            Ok(frame) => frame,
            Err(error) => {
                fail(&inner, error);
                return;
            }
        };

        let message = match Message::parse(&frame) {
            Ok(message) => message,
            Err(error) => {
                fail(&inner, error);
                return;
            }
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };

        dispatch(&inner, message).await;
    }
}

/// Read one complete message frame: the first sixteen bytes carry enough to
/// compute the total length.
async fn next_frame(read: &mut OwnedReadHalf, buf: &mut Vec<u8>) -> Result<Vec<u8>> {
    fill(read, buf, FIXED_HEADER_LEN).await?;

    let remaining = crate::message::frame_remaining(&buf[..FIXED_HEADER_LEN])?;
    let total = FIXED_HEADER_LEN + remaining;

    fill(read, buf, total).await?;

    let rest = buf.split_off(total);
    Ok(std::mem::replace(buf, rest))
}

async fn fill(read: &mut OwnedReadHalf, buf: &mut Vec<u8>, n: usize) -> Result<()> {
    while buf.len() < n {
        let mut chunk = [0; 4096];
        let read = read.read(&mut chunk).await?;

        if read == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        buf.extend_from_slice(&chunk[..read]);
    }

    Ok(())
}

/// Terminate the loop: preserve the reason and fail every pending waiter
/// with *connection closed*.
fn fail(inner: &Weak<Inner>, error: Error) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    {
        let mut state = inner.state.lock().expect("state lock");

        match *state {
            // close() already won the race.
            ConnectionState::Disconnected => {}
            _ => {
                warn!("connection failed: {error}");
                *state = ConnectionState::Error(error.shared());
            }
        }
    }

    inner.fail_pending();
    inner.subscriptions.lock().expect("subscriptions lock").clear();
}

/// Route one inbound message, in arrival order.
async fn dispatch(inner: &Arc<Inner>, message: Message) {
    match message.kind() {
        MessageKind::MethodReturn { reply_serial } | MessageKind::Error { reply_serial, .. } => {
            let serial = reply_serial.get();

            let waiter = inner.pending.lock().expect("pending lock").remove(&serial);

            match waiter {
                Some(waiter) => {
                    if waiter.send(message).is_err() {
                        debug!("dropping reply to serial {serial}: caller went away");
                    }
                }
                None => {
                    debug!("dropping unmatched reply to serial {serial}");
                }
            }
        }
        MessageKind::Signal { .. } => {
            let mut subscriptions = inner.subscriptions.lock().expect("subscriptions lock");

            subscriptions.retain(|subscription| {
                if !subscription.rule.matches(&message) {
                    return true;
                }

                subscription.sender.send(message.clone()).is_ok()
            });
        }
        MessageKind::MethodCall { .. } => {
            handle_method_call(inner, message).await;
        }
    }
}

/// Resolve an inbound method call against the exported-object registry and
/// answer it.
async fn handle_method_call(inner: &Arc<Inner>, message: Message) {
    let outcome = {
        let MessageKind::MethodCall { path, member } = message.kind() else {
            unreachable!("checked by the caller");
        };

        match message.arguments() {
            Ok(args) => {
                let objects = inner.objects.lock().expect("objects lock");

                match objects.get(path) {
                    Some(object) => object.dispatch(message.interface(), member, &args),
                    None => Err(DispatchError::UnknownObject(path.to_string())),
                }
            }
            Err(error) => Err(DispatchError::InvalidArgs(error.to_string())),
        }
    };

    let connection = Connection::from_inner(inner.clone());
    let mut outgoing = Vec::new();

    match outcome {
        Ok(DispatchOutcome {
            body,
            properties_changed,
        }) => {
            if message.expects_reply() {
                match message
                    .reply()
                    .and_then(|reply| reply.with_body(body.signature, &body.values))
                {
                    Ok(reply) => outgoing.push(reply),
                    Err(error) => {
                        debug!("failed to build reply: {error}");
                    }
                }
            }

            if let Some(changed) = properties_changed {
                let signal = Message::signal(
                    message.path().expect("method calls carry a path").as_str(),
                    crate::export::PROPERTIES,
                    "PropertiesChanged",
                )
                .and_then(|signal| {
                    signal.with_body(
                        Signature::parse("sa{sv}as").expect("valid signature"),
                        &[
                            Value::String(changed.interface),
                            Value::Dict(vec![(
                                Value::String(changed.name),
                                Value::variant(changed.signature, changed.value),
                            )]),
                            Value::Array(Vec::new()),
                        ],
                    )
                });

                match signal {
                    Ok(signal) => outgoing.push(signal),
                    Err(error) => debug!("failed to build PropertiesChanged: {error}"),
                }
            }
        }
        Err(error) => {
            if message.expects_reply() {
                match message.error_reply(error.error_name(), error.to_string()) {
                    Ok(reply) => outgoing.push(reply),
                    Err(error) => debug!("failed to build error reply: {error}"),
                }
            }
        }
    }

    for message in outgoing {
        if let Err(error) = connection.send(message).await {
            debug!("failed to send reply: {error}");
            return;
        }
    }
}
