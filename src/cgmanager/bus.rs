//! Client side of the cgroup manager's local bus socket. The daemon speaks
//! the standard message-bus wire protocol peer-to-peer, so there is no bus
//! daemon in between: the client authenticates, negotiates descriptor
//! passing and then issues method calls directly.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::sys::socket::{self, ControlMessage, MsgFlags, UnixAddr};

use super::message::{FieldKind, HeaderField, Message, MessageKind};
use super::serialize::BusSerialize;

// Big enough for one reply in the common case; longer replies arrive in
// several chunks.
const REPLY_BUF_SIZE: usize = 512;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("bus authentication failed: {0}")]
    Authentication(String),
    #[error("bus socket error: {0}")]
    Socket(#[from] nix::Error),
    #[error("connection closed by the cgroup manager")]
    Closed,
    #[error("malformed bus message: {0}")]
    Deserialization(String),
    #[error("method call failed: {0}")]
    MethodCall(String),
    #[error("bus feature not supported: {0}")]
    Unsupported(String),
    #[error("descriptor passing was not negotiated with the cgroup manager")]
    FdPassing,
}

impl BusError {
    /// Whether this failure means the connection itself is gone, as opposed
    /// to the daemon rejecting one request.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Socket(errno) => matches!(
                errno,
                Errno::EPIPE | Errno::ECONNRESET | Errno::ECONNABORTED | Errno::ENOTCONN
            ),
            _ => false,
        }
    }
}

fn uid_to_hex(uid: u32) -> String {
    uid.to_string()
        .bytes()
        .map(|b| format!("{b:x}"))
        .collect()
}

/// One authenticated connection to the daemon.
///
/// The connection itself is not safe for interleaved calls: replies carry no
/// routing back to their request here, so the owner serializes every
/// round-trip behind a mutex.
#[derive(Debug)]
pub struct BusConnection {
    socket: OwnedFd,
    serial: AtomicU32,
    fd_passing: bool,
}

impl BusConnection {
    /// Connects to the daemon socket and runs the authentication handshake,
    /// including descriptor-passing negotiation.
    pub fn connect(path: &str) -> Result<Self, BusError> {
        let socket = socket::socket(
            socket::AddressFamily::Unix,
            socket::SockType::Stream,
            socket::SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        socket::connect(socket.as_raw_fd(), &UnixAddr::new(path)?)?;

        let mut conn = Self {
            socket,
            serial: AtomicU32::new(0),
            fd_passing: false,
        };
        conn.authenticate()?;
        Ok(conn)
    }

    fn authenticate(&mut self) -> Result<(), BusError> {
        // The connection opens with a single null byte, then a line-based
        // auth exchange.
        self.send_raw(&[0])?;

        let uid = nix::unistd::geteuid().as_raw();
        self.send_raw(format!("AUTH EXTERNAL {}\r\n", uid_to_hex(uid)).as_bytes())?;
        let reply = self.recv_line()?;
        if !reply.starts_with("OK") {
            return Err(BusError::Authentication(format!(
                "expected OK, daemon said: {}",
                reply.trim_end()
            )));
        }

        // Descriptor passing must be agreed on before BEGIN; the chown
        // protocol cannot work without it.
        self.send_raw(b"NEGOTIATE_UNIX_FD\r\n")?;
        let reply = self.recv_line()?;
        if reply.starts_with("AGREE_UNIX_FD") {
            self.fd_passing = true;
        } else {
            tracing::warn!(
                "cgroup manager refused descriptor passing: {}",
                reply.trim_end()
            );
        }

        self.send_raw(b"BEGIN\r\n")?;
        Ok(())
    }

    pub fn supports_fd_passing(&self) -> bool {
        self.fd_passing
    }

    fn send_raw(&self, data: &[u8]) -> Result<(), BusError> {
        let mut sent = 0;
        while sent < data.len() {
            sent += socket::send(self.socket.as_raw_fd(), &data[sent..], MsgFlags::empty())?;
        }
        Ok(())
    }

    fn recv_line(&self) -> Result<String, BusError> {
        let mut buf = [0u8; 64];
        let received = socket::recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty())?;
        if received == 0 {
            return Err(BusError::Closed);
        }
        // The exchange is plain ascii.
        Ok(String::from_utf8_lossy(&buf[..received]).into_owned())
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Collects a complete reply off the socket. A reply can span several
    /// reads and one read can carry several messages; the caller splits them
    /// apart again.
    fn recv_reply(&self) -> Result<Vec<u8>, BusError> {
        let mut reply = Vec::with_capacity(REPLY_BUF_SIZE);
        loop {
            let mut chunk = [0u8; REPLY_BUF_SIZE];
            let received_bytes = {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let received = socket::recvmsg::<UnixAddr>(
                    self.socket.as_raw_fd(),
                    &mut iov,
                    None,
                    MsgFlags::empty(),
                )?;
                received.bytes
            };
            if received_bytes == 0 {
                return Err(BusError::Closed);
            }

            reply.extend_from_slice(&chunk[..received_bytes]);
            if received_bytes < REPLY_BUF_SIZE {
                break;
            }
        }
        Ok(reply)
    }

    fn send_message(&self, message: Message, fds: &[RawFd]) -> Result<(), BusError> {
        let wire = message.serialize();
        let iov = [IoSlice::new(&wire)];
        let cmsgs = if fds.is_empty() {
            vec![]
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };

        socket::sendmsg::<UnixAddr>(
            self.socket.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )?;
        Ok(())
    }

    /// One synchronous method call: send the request, wait for the reply,
    /// check it for an error and unmarshal the result. Descriptors in `fds`
    /// are attached to the request as ancillary data.
    pub fn method_call<Body, Output>(
        &self,
        object_path: &str,
        interface: &str,
        member: &str,
        body: Option<Body>,
        fds: &[RawFd],
    ) -> Result<Output, BusError>
    where
        Body: BusSerialize,
        Output: BusSerialize,
    {
        if !fds.is_empty() && !self.fd_passing {
            return Err(BusError::FdPassing);
        }

        let mut fields = vec![
            HeaderField::path(object_path),
            HeaderField::interface(interface),
            HeaderField::member(member),
        ];
        if !fds.is_empty() {
            fields.push(HeaderField::unix_fds(fds.len() as u32));
        }

        let mut serialized_body = Vec::new();
        if let Some(body) = body {
            fields.push(HeaderField::body_signature(&Body::signature()));
            body.serialize(&mut serialized_body);
        }

        let message = Message::method_call(self.next_serial(), fields, serialized_body);
        self.send_message(message, fds)?;

        let reply = self.recv_reply()?;
        let mut messages = Vec::new();
        let mut rest = &reply[..];
        while !rest.is_empty() {
            let (message, consumed) = Message::deserialize(rest)?;
            rest = &rest[consumed..];
            messages.push(message);
        }

        // An error reply wins over anything else in the same read; signals
        // are ignored outright.
        if let Some(error) = messages.iter().find(|m| m.kind == MessageKind::Error) {
            return Err(BusError::MethodCall(
                error
                    .error_text()
                    .unwrap_or_else(|| "unknown bus error".into()),
            ));
        }

        let reply = messages
            .iter()
            .find(|m| m.kind == MessageKind::MethodReturn)
            .ok_or_else(|| BusError::MethodCall(format!("no reply to {member}")))?;

        let expected_signature = Output::signature();
        if expected_signature.is_empty() {
            // Replies without a body have no signature field to check.
            let mut cursor = 0;
            return Output::deserialize(&[], &mut cursor);
        }

        let actual_signature = reply
            .field(FieldKind::BodySignature)
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if actual_signature != expected_signature {
            return Err(BusError::Deserialization(format!(
                "reply to {member} has signature '{actual_signature}', expected '{expected_signature}'"
            )));
        }

        let mut cursor = 0;
        Output::deserialize(&reply.body, &mut cursor)
    }
}
