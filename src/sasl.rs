//! The SASL handshake D-Bus performs before switching to binary messages.
//!
//! The exchange is line oriented: CRLF-terminated ASCII commands, described
//! in the authentication protocol section of the D-Bus specification. Only
//! the client side is implemented.

use std::fmt;
use std::str::FromStr;

use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{Error, Result};

/// Authentication mechanisms offered by this client, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthMechanism {
    /// Credentials passed out-of-band over the unix socket.
    External,
    /// No authentication; some non-bus peers accept it.
    Anonymous,
}

impl AuthMechanism {
    pub(crate) const DEFAULT: &'static [AuthMechanism] =
        &[AuthMechanism::External, AuthMechanism::Anonymous];
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mech = match self {
            AuthMechanism::External => "EXTERNAL",
            AuthMechanism::Anonymous => "ANONYMOUS",
        };
        f.write_str(mech)
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXTERNAL" => Ok(AuthMechanism::External),
            "ANONYMOUS" => Ok(AuthMechanism::Anonymous),
            _ => Err(Error::UnsupportedMechanism(s.to_owned())),
        }
    }
}

/// A single command on the SASL wire, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Auth(AuthMechanism, Option<Vec<u8>>),
    Begin,
    NegotiateUnixFd,
    Ok(String),
    Rejected(Vec<String>),
    AgreeUnixFd,
    Error(String),
    Data(Option<Vec<u8>>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Auth(mech, None) => write!(f, "AUTH {mech}"),
            Command::Auth(mech, Some(resp)) => write!(f, "AUTH {mech} {}", hex::encode(resp)),
            Command::Begin => write!(f, "BEGIN"),
            Command::NegotiateUnixFd => write!(f, "NEGOTIATE_UNIX_FD"),
            Command::Ok(guid) => write!(f, "OK {guid}"),
            Command::Rejected(mechs) => write!(f, "REJECTED {}", mechs.join(" ")),
            Command::AgreeUnixFd => write!(f, "AGREE_UNIX_FD"),
            Command::Error(reason) => write!(f, "ERROR {reason}"),
            Command::Data(None) => write!(f, "DATA"),
            Command::Data(Some(data)) => write!(f, "DATA {}", hex::encode(data)),
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_ascii_whitespace();

        let cmd = match words.next() {
            Some("OK") => {
                let guid = words
                    .next()
                    .ok_or_else(|| Error::SaslProtocol("OK without a server GUID".into()))?;
                Command::Ok(guid.to_owned())
            }
            Some("REJECTED") => Command::Rejected(words.map(str::to_owned).collect()),
            Some("AGREE_UNIX_FD") => Command::AgreeUnixFd,
            Some("ERROR") => Command::Error(words.collect::<Vec<_>>().join(" ")),
            Some("DATA") => {
                let data = match words.next() {
                    Some(data) => Some(hex::decode(data).map_err(|e| {
                        Error::SaslProtocol(format!("invalid DATA hex: {e}"))
                    })?),
                    None => None,
                };
                Command::Data(data)
            }
            Some("BEGIN") => Command::Begin,
            Some("NEGOTIATE_UNIX_FD") => Command::NegotiateUnixFd,
            Some("AUTH") => {
                let mech = words
                    .next()
                    .ok_or_else(|| Error::SaslProtocol("AUTH without a mechanism".into()))?
                    .parse()?;
                let resp = match words.next() {
                    Some(resp) => Some(hex::decode(resp).map_err(|e| {
                        Error::SaslProtocol(format!("invalid AUTH hex: {e}"))
                    })?),
                    None => None,
                };
                Command::Auth(mech, resp)
            }
            _ => return Err(Error::SaslProtocol(format!("unknown command: {s}"))),
        };

        Ok(cmd)
    }
}

/// The outcome of a successful handshake.
#[derive(Debug)]
pub(crate) struct Handshake {
    /// The GUID of the server we authenticated against.
    pub(crate) guid: String,
    /// Whether the server agreed to pass file descriptors.
    pub(crate) cap_unix_fd: bool,
    /// Bytes received past the last SASL line; the start of the binary
    /// stream.
    pub(crate) leftover: Vec<u8>,
}

/// Authenticate the client side of `stream`.
///
/// Walks `mechanisms` front to back on `REJECTED`, optionally negotiates fd
/// passing (failure is non-fatal), and finishes with `BEGIN`, after which
/// the stream carries only binary D-Bus messages.
pub(crate) async fn authenticate(
    stream: &mut UnixStream,
    mechanisms: &[AuthMechanism],
    negotiate_unix_fd: bool,
) -> Result<Handshake> {
    // Credential preamble: a single zero byte before the first command.
    stream.write_all(b"\0").await?;

    let mut lines = LineReader::new();
    let mut mechanisms = mechanisms.iter();

    let guid = loop {
        let Some(mechanism) = mechanisms.next() else {
            return Err(Error::AuthRejected(String::new()));
        };

        send(stream, &auth_command(*mechanism)).await?;

        match recv(stream, &mut lines).await? {
            Command::Ok(guid) => break guid,
            Command::Rejected(offered) => {
                trace!("{mechanism} rejected, server offers {offered:?}");

                if mechanisms.len() == 0 {
                    return Err(Error::AuthRejected(offered.join(" ")));
                }
            }
            Command::Error(reason) => {
                trace!("{mechanism} failed: {reason}");
            }
            other => {
                return Err(Error::SaslProtocol(format!(
                    "unexpected AUTH response: {other}"
                )));
            }
        }
    };

    let mut cap_unix_fd = false;

    if negotiate_unix_fd {
        send(stream, &Command::NegotiateUnixFd).await?;

        match recv(stream, &mut lines).await? {
            Command::AgreeUnixFd => cap_unix_fd = true,
            // Refusal to pass fds is not fatal.
            Command::Error(reason) => trace!("fd passing rejected: {reason}"),
            other => {
                return Err(Error::SaslProtocol(format!(
                    "unexpected NEGOTIATE_UNIX_FD response: {other}"
                )));
            }
        }
    }

    send(stream, &Command::Begin).await?;

    Ok(Handshake {
        guid,
        cap_unix_fd,
        leftover: lines.buf,
    })
}

fn auth_command(mechanism: AuthMechanism) -> Command {
    let response = match mechanism {
        // The initial response is the uid as a decimal string, hex encoded.
        AuthMechanism::External => {
            let uid = unsafe { libc::getuid() };
            uid.to_string().into_bytes()
        }
        // An arbitrary trace string.
        AuthMechanism::Anonymous => b"minibus".to_vec(),
    };

    Command::Auth(mechanism, Some(response))
}

async fn send(stream: &mut UnixStream, command: &Command) -> Result<()> {
    let line = format!("{command}\r\n");
    trace!("sasl send: {command}");
    stream.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn recv(stream: &mut UnixStream, lines: &mut LineReader) -> Result<Command> {
    let line = lines.next_line(stream).await?;
    trace!("sasl recv: {line}");
    line.parse()
}

/// Buffered CRLF line reading over the raw stream.
struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    async fn next_line(&mut self, stream: &mut UnixStream) -> Result<String> {
        let mut scanned = 0;

        loop {
            if let Some(i) = self.buf[scanned..].iter().position(|&b| b == b'\n') {
                let end = scanned + i;

                if end == 0 || self.buf[end - 1] != b'\r' {
                    return Err(Error::SaslProtocol("invalid line ending".into()));
                }

                let rest = self.buf.split_off(end + 1);
                let mut line = std::mem::replace(&mut self.buf, rest);
                line.truncate(line.len() - 2);

                return String::from_utf8(line)
                    .map_err(|e| Error::SaslProtocol(format!("line is not UTF-8: {e}")));
            }

            scanned = self.buf.len();

            let mut chunk = [0; 256];
            let n = stream.read(&mut chunk).await?;

            if n == 0 {
                return Err(Error::SaslProtocol("unexpected EOF during handshake".into()));
            }

            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthMechanism, Command};

    #[test]
    fn command_render() {
        assert_eq!(
            Command::Auth(AuthMechanism::External, Some(b"1000".to_vec())).to_string(),
            "AUTH EXTERNAL 31303030"
        );
        assert_eq!(Command::Begin.to_string(), "BEGIN");
        assert_eq!(
            Command::NegotiateUnixFd.to_string(),
            "NEGOTIATE_UNIX_FD"
        );
    }

    #[test]
    fn command_parse() {
        assert_eq!(
            "OK a9556f1e0c5f3f8d9d6c0c9a61d21a8b".parse::<Command>().unwrap(),
            Command::Ok("a9556f1e0c5f3f8d9d6c0c9a61d21a8b".into())
        );
        assert_eq!(
            "REJECTED EXTERNAL DBUS_COOKIE_SHA1".parse::<Command>().unwrap(),
            Command::Rejected(vec!["EXTERNAL".into(), "DBUS_COOKIE_SHA1".into()])
        );
        assert_eq!(
            "AGREE_UNIX_FD".parse::<Command>().unwrap(),
            Command::AgreeUnixFd
        );
        assert_eq!(
            "ERROR not today".parse::<Command>().unwrap(),
            Command::Error("not today".into())
        );
        assert!("HELLO".parse::<Command>().is_err());
        assert!("OK".parse::<Command>().is_err());
    }

    #[tokio::test]
    async fn external_handshake() {
        let (mut client, mut server) = tokio::net::UnixStream::pair().unwrap();

        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};

            let mut buf = Vec::new();

            // Zero byte then the AUTH line.
            loop {
                let mut chunk = [0; 256];
                let n = server.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);

                if buf.ends_with(b"\r\n") {
                    break;
                }
            }

            assert_eq!(buf[0], 0);
            let line = std::str::from_utf8(&buf[1..]).unwrap();
            assert!(line.starts_with("AUTH EXTERNAL "), "{line}");

            server
                .write_all(b"OK 0123456789abcdef0123456789abcdef\r\n")
                .await
                .unwrap();

            // Expect BEGIN next.
            let mut buf = Vec::new();

            loop {
                let mut chunk = [0; 256];
                let n = server.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);

                if buf.ends_with(b"\r\n") {
                    break;
                }
            }

            assert_eq!(buf, b"BEGIN\r\n");
        });

        let handshake = super::authenticate(
            &mut client,
            &[AuthMechanism::External],
            false,
        )
        .await
        .unwrap();

        assert_eq!(handshake.guid, "0123456789abcdef0123456789abcdef");
        assert!(!handshake.cap_unix_fd);
        assert!(handshake.leftover.is_empty());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_falls_back_to_anonymous() {
        let (mut client, mut server) = tokio::net::UnixStream::pair().unwrap();

        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};

            let mut buf = Vec::new();
            let mut lines = 0;

            loop {
                let mut chunk = [0; 256];
                let n = server.read(&mut chunk).await.unwrap();

                if n == 0 {
                    break;
                }

                buf.extend_from_slice(&chunk[..n]);

                while let Some(i) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..i + 1).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim_matches(['\0', '\r', '\n']);

                    if line.is_empty() {
                        continue;
                    }

                    lines += 1;

                    match lines {
                        1 => {
                            assert!(line.starts_with("AUTH EXTERNAL"));
                            server.write_all(b"REJECTED ANONYMOUS\r\n").await.unwrap();
                        }
                        2 => {
                            assert!(line.starts_with("AUTH ANONYMOUS"), "{line}");
                            server.write_all(b"OK ffffffffffffffffffffffffffffffff\r\n")
                                .await
                                .unwrap();
                        }
                        _ => {
                            assert_eq!(line, "BEGIN");
                            return;
                        }
                    }
                }
            }
        });

        let handshake = super::authenticate(&mut client, AuthMechanism::DEFAULT, false)
            .await
            .unwrap();

        assert_eq!(handshake.guid, "ffffffffffffffffffffffffffffffff");
        server.await.unwrap();
    }
}
