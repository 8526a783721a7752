//! Service manager readiness notifications (sd_notify protocol).
//!
//! Enabled only when `SYSTEMD_NOTIFY_ENABLE=true` and `NOTIFY_SOCKET` is set.
//! Every send is fire-and-forget: failures are logged and otherwise ignored.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ENABLE_VAR: &str = "SYSTEMD_NOTIFY_ENABLE";
const SOCKET_VAR: &str = "NOTIFY_SOCKET";

const READY: &str = "READY=1\nSTATUS=Service ready";
const STOPPING: &str = "STOPPING=1\nSTATUS=Service stopping...";

/// Sends lifecycle state to an external supervisor.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    socket: Option<PathBuf>,
}

impl Notifier {
    /// Build from `SYSTEMD_NOTIFY_ENABLE` and `NOTIFY_SOCKET`.
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var_os(ENABLE_VAR),
            std::env::var_os(SOCKET_VAR),
        )
    }

    fn from_vars(enable: Option<OsString>, socket: Option<OsString>) -> Self {
        if enable.as_deref() != Some(OsStr::new("true")) {
            debug!("{ENABLE_VAR} not set to true, skipping supervisor notifications");
            return Self::disabled();
        }
        match socket {
            Some(path) if !path.is_empty() => Self::with_socket(path),
            _ => {
                debug!("{SOCKET_VAR} not defined, skipping supervisor notifications");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { socket: None }
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(path.into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    /// Report that the listener is bound and accepting.
    pub fn ready(&self) {
        self.notify("ready", READY);
    }

    /// Report that shutdown has begun.
    pub fn stopping(&self) {
        self.notify("stopping", STOPPING);
    }

    fn notify(&self, state: &str, message: &str) {
        let Some(socket) = &self.socket else {
            return;
        };
        match send(socket, message.as_bytes()) {
            Ok(()) => debug!(state, socket = %socket.display(), "Supervisor notified"),
            Err(e) => warn!(state, socket = %socket.display(), error = %e, "Supervisor notification failed"),
        }
    }
}

fn send(socket: &Path, message: &[u8]) -> io::Result<()> {
    let sock = UnixDatagram::unbound()?;
    let sent = match abstract_name(socket) {
        Some(name) => send_abstract(&sock, name, message)?,
        None => sock.send_to(message, socket)?,
    };
    if sent != message.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short write on notification socket",
        ));
    }
    Ok(())
}

/// `@name` addresses a socket in the Linux abstract namespace.
fn abstract_name(socket: &Path) -> Option<&[u8]> {
    use std::os::unix::ffi::OsStrExt;
    socket.as_os_str().as_bytes().strip_prefix(b"@")
}

#[cfg(target_os = "linux")]
fn send_abstract(sock: &UnixDatagram, name: &[u8], message: &[u8]) -> io::Result<usize> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
    sock.send_to_addr(message, &addr)
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_sock: &UnixDatagram, _name: &[u8], _message: &[u8]) -> io::Result<usize> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract notification sockets are Linux-only",
    ))
}
