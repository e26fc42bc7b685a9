//! The credential exchange the cgroup manager demands before it will chown a
//! cgroup tree into a user namespace. Identity crosses a trust boundary
//! here, so it travels as kernel-verified ancillary data on a datagram
//! socket pair rather than as ordinary message payload.

use std::io::IoSlice;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::sys::select::{select, FdSet};
use nix::sys::socket::{self, ControlMessage, MsgFlags, UnixAddr, UnixCredentials};
use nix::unistd::{self, getgid, getpid, getuid};

pub(crate) const CHOWN_OK: u8 = b'1';

#[derive(thiserror::Error, Debug)]
pub(crate) enum CredsError {
    #[error("credential socket error: {0}")]
    Socket(#[from] nix::Error),
    #[error("short read on credential socket")]
    ShortRead,
    #[error("cgroup manager rejected the credential exchange")]
    Rejected,
}

/// Sends one credential message: a single payload byte with an attached
/// (pid, uid, gid) triple the kernel verifies against the sender.
pub(crate) fn send_credentials(
    sock: BorrowedFd<'_>,
    pid: i32,
    uid: u32,
    gid: u32,
) -> Result<(), CredsError> {
    let creds = UnixCredentials::from(libc::ucred { pid, uid, gid });
    let cmsgs = [ControlMessage::ScmCredentials(&creds)];
    let iov = [IoSlice::new(b"p")];
    socket::sendmsg::<UnixAddr>(sock.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    Ok(())
}

/// Blocks until the daemon's next go-ahead byte arrives and returns it.
fn await_ready(sock: BorrowedFd<'_>) -> Result<u8, CredsError> {
    let mut readfds = FdSet::new();
    readfds.insert(sock);
    select(None, &mut readfds, None, None, None)?;

    let mut buf = [0u8; 1];
    if unistd::read(sock.as_raw_fd(), &mut buf)? != 1 {
        return Err(CredsError::ShortRead);
    }
    Ok(buf[0])
}

/// Runs the caller's half of the handshake after the far end of the socket
/// pair has been handed to the daemon:
///
/// proof of ownership first (our own pid/uid/gid), then the uid the cgroup
/// should end up owned by, each send gated on a ready byte from the daemon.
/// The final byte is the verdict. Must run inside the target user namespace
/// so the kernel translates both credential messages for the daemon.
pub(crate) fn exchange(sock: BorrowedFd<'_>, target_uid: u32) -> Result<(), CredsError> {
    await_ready(sock)?;
    send_credentials(
        sock,
        getpid().as_raw(),
        getuid().as_raw(),
        getgid().as_raw(),
    )?;

    await_ready(sock)?;
    send_credentials(sock, getpid().as_raw(), target_uid, 0)?;

    match await_ready(sock)? {
        CHOWN_OK => Ok(()),
        _ => Err(CredsError::Rejected),
    }
}

#[cfg(test)]
mod tests {
    use std::io::IoSliceMut;
    use std::os::fd::{AsFd, OwnedFd};

    use nix::sys::socket::{
        socketpair, sockopt, AddressFamily, ControlMessageOwned, SockFlag, SockType,
    };

    use super::*;

    fn credential_socketpair() -> (OwnedFd, OwnedFd) {
        let (near, far) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .expect("create socketpair");
        socket::setsockopt(&near, sockopt::PassCred, &true).expect("set SO_PASSCRED");
        socket::setsockopt(&far, sockopt::PassCred, &true).expect("set SO_PASSCRED");
        (near, far)
    }

    fn recv_credentials(sock: BorrowedFd<'_>) -> UnixCredentials {
        let mut buf = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_buf = nix::cmsg_space!(UnixCredentials);
        let msg = socket::recvmsg::<UnixAddr>(
            sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .expect("receive credential message");

        msg.cmsgs()
            .find_map(|cmsg| match cmsg {
                ControlMessageOwned::ScmCredentials(creds) => Some(creds),
                _ => None,
            })
            .expect("credential payload attached")
    }

    #[test]
    fn test_send_credentials_carries_verified_identity() {
        let (near, far) = credential_socketpair();

        send_credentials(
            near.as_fd(),
            getpid().as_raw(),
            getuid().as_raw(),
            getgid().as_raw(),
        )
        .expect("send credentials");

        let creds = recv_credentials(far.as_fd());
        assert_eq!(creds.pid(), getpid().as_raw());
        assert_eq!(creds.uid(), getuid().as_raw());
        assert_eq!(creds.gid(), getgid().as_raw());
    }

    /// The second protocol message claims gid 0, which the kernel only
    /// permits from a process that holds it (or CAP_SETGID). The full
    /// exchange can therefore only run where the suite runs as root.
    fn can_claim_root_gid() -> bool {
        nix::unistd::getgid().as_raw() == 0
    }

    #[test]
    fn test_exchange_happy_path() {
        if !can_claim_root_gid() {
            return;
        }
        let (near, far) = credential_socketpair();

        // Play the daemon on the far end. Without privileges the test can
        // only claim its own uid, so that stands in for the namespace uid.
        let daemon = std::thread::spawn(move || {
            unistd::write(far.as_fd(), b"r").expect("first go-ahead");
            let first = recv_credentials(far.as_fd());
            assert_eq!(first.uid(), getuid().as_raw());

            unistd::write(far.as_fd(), b"r").expect("second go-ahead");
            let second = recv_credentials(far.as_fd());
            assert_eq!(second.uid(), getuid().as_raw());
            assert_eq!(second.gid(), 0);

            unistd::write(far.as_fd(), &[CHOWN_OK]).expect("verdict");
        });

        exchange(near.as_fd(), getuid().as_raw()).expect("exchange");
        daemon.join().expect("daemon thread");
    }

    #[test]
    fn test_exchange_rejected_by_daemon() {
        if !can_claim_root_gid() {
            return;
        }
        let (near, far) = credential_socketpair();

        let daemon = std::thread::spawn(move || {
            unistd::write(far.as_fd(), b"r").expect("first go-ahead");
            recv_credentials(far.as_fd());
            unistd::write(far.as_fd(), b"r").expect("second go-ahead");
            recv_credentials(far.as_fd());
            unistd::write(far.as_fd(), b"0").expect("verdict");
        });

        let err = exchange(near.as_fd(), getuid().as_raw()).unwrap_err();
        assert!(matches!(err, CredsError::Rejected));
        daemon.join().expect("daemon thread");
    }

    #[test]
    fn test_exchange_fails_on_closed_socket() {
        let (near, far) = credential_socketpair();
        drop(far);

        // A closed datagram peer turns reads into immediate errors.
        assert!(exchange(near.as_fd(), getuid().as_raw()).is_err());
    }
}
