//! The production [`Session`] implementation: a real `TcpStream` driven
//! non-blockingly via tokio's `try_read`/`try_write`, so the synchronous
//! FSM `drive()` functions never touch `.await`.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::cluster::collab::{Session, SessionError};

enum ConnectState {
    /// Connecting in a background task; `Receiver` yields the socket (or
    /// the `io::Error`) once the async connect future resolves.
    Pending(oneshot::Receiver<std::io::Result<TcpStream>>),
    Connected(TcpStream),
}

/// A migration control-channel connection over real TCP.
pub struct TcpSession {
    state: ConnectState,
}

impl TcpSession {
    /// Spawns the async `connect` on the current Tokio runtime and returns
    /// immediately; `try_connect` polls for its result without blocking.
    #[must_use]
    pub fn connect(addr: SocketAddr) -> Self {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = TcpStream::connect(addr).await;
            let _ = tx.send(result);
        });
        Self {
            state: ConnectState::Pending(rx),
        }
    }

    /// Wraps an already-accepted inbound connection (the import side never
    /// dials out; it receives the socket from the listener).
    #[must_use]
    pub fn from_accepted(stream: TcpStream) -> Self {
        Self {
            state: ConnectState::Connected(stream),
        }
    }
}

impl Session for TcpSession {
    fn try_connect(&mut self) -> Result<bool, SessionError> {
        match &mut self.state {
            ConnectState::Connected(_) => Ok(true),
            ConnectState::Pending(rx) => match rx.try_recv() {
                Ok(Ok(stream)) => {
                    self.state = ConnectState::Connected(stream);
                    Ok(true)
                }
                Ok(Err(e)) => Err(SessionError::Io(e.to_string())),
                Err(oneshot::error::TryRecvError::Empty) => Ok(false),
                Err(oneshot::error::TryRecvError::Closed) => {
                    Err(SessionError::Io("connect task dropped".into()))
                }
            },
        }
    }

    fn try_read(&mut self, buf: &mut BytesMut) -> Result<usize, SessionError> {
        let ConnectState::Connected(stream) = &self.state else {
            return Ok(0);
        };
        let mut scratch = [0u8; 4096];
        match stream.try_read(&mut scratch) {
            Ok(0) => Err(SessionError::Closed),
            Ok(n) => {
                buf.extend_from_slice(&scratch[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(SessionError::Io(e.to_string())),
        }
    }

    fn try_write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        let ConnectState::Connected(stream) = &self.state else {
            return Ok(0);
        };
        match stream.try_write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(SessionError::Io(e.to_string())),
        }
    }

    fn authenticate(&mut self) -> Result<bool, SessionError> {
        // No cluster-auth secret configured is the common case; treat
        // connection readiness as authentication success. A deployment
        // that sets `requirepass`/`masterauth` plugs its check in here.
        Ok(matches!(self.state, ConnectState::Connected(_)))
    }

    fn buffered_bytes(&self) -> usize {
        0
    }
}
