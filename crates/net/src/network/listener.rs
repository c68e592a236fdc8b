use std::cell::RefCell;
use std::time::Duration;
use std::{fmt, io};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::{Dispatcher, WeakDispatcher};
use crate::network::{ConnectionImpl, ConnectionPtr};
use crate::{ConnectionConfig, NetworkError};

/// A bound socket that a [`Listener`] accepts on.
pub trait ListenSocket {
    /// `tcp://ip:port`
    fn name(&self) -> String;

    /// The raw descriptor, or `-1` once closed.
    fn fd(&self) -> RawFd;

    fn close(&self);
}

/// Accepts connections and hands them to [`ListenerCallbacks`].
pub trait Listener {
    /// Resumes accepting.
    fn enable(&self);

    /// Stops accepting; queued connections stay in the kernel backlog.
    fn disable(&self);

    fn local_address(&self) -> SocketAddr;
}

pub trait ListenerCallbacks {
    /// Ownership of the new connection passes to the callee.
    fn on_new_connection(&self, connection: ConnectionPtr);
}

/// A TCP socket bound and listening, not yet attached to any dispatcher.
pub struct TcpListenSocket {
    listener: RefCell<Option<StdTcpListener>>,
    local_address: SocketAddr,
}

impl TcpListenSocket {
    /// Binds `address`; port 0 picks an ephemeral port, see [`local_address`](Self::local_address).
    pub fn bind(address: SocketAddr) -> Result<Self, NetworkError> {
        let listener = StdTcpListener::bind(address).map_err(|e| NetworkError::bind(address, e))?;
        listener.set_nonblocking(true)?;
        let local_address = listener.local_addr()?;
        debug!(%local_address, "bound listen socket");
        Ok(Self { listener: RefCell::new(Some(listener)), local_address })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    fn try_clone(&self) -> Result<StdTcpListener, NetworkError> {
        let listener = self.listener.borrow();
        let listener = listener
            .as_ref()
            .ok_or_else(|| NetworkError::invalid_address(self.name(), "listen socket is closed"))?;
        Ok(listener.try_clone()?)
    }
}

impl ListenSocket for TcpListenSocket {
    fn name(&self) -> String {
        format!("tcp://{}", self.local_address)
    }

    fn fd(&self) -> RawFd {
        self.listener.borrow().as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn close(&self) {
        if self.listener.borrow_mut().take().is_some() {
            debug!(name = %self.name(), "closed listen socket");
        }
    }
}

impl fmt::Debug for TcpListenSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListenSocket").field("local_address", &self.local_address).field("fd", &self.fd()).finish()
    }
}

/// The accept loop for one [`TcpListenSocket`].
///
/// Each accepted stream is wrapped in a server [`ConnectionImpl`] and handed to the
/// callbacks right away. Dropping the listener stops accepting.
pub struct ListenerImpl {
    dispatcher: WeakDispatcher,
    listener: Rc<TcpListener>,
    local_address: SocketAddr,
    callbacks: Weak<dyn ListenerCallbacks>,
    config: ConnectionConfig,
    accept_task: RefCell<Option<JoinHandle<()>>>,
}

impl ListenerImpl {
    pub(crate) fn new(
        dispatcher: &Dispatcher,
        socket: &TcpListenSocket,
        callbacks: Weak<dyn ListenerCallbacks>,
        config: ConnectionConfig,
    ) -> Result<Self, NetworkError> {
        let std_listener = socket.try_clone()?;
        let listener = {
            let _guard = dispatcher.enter();
            TcpListener::from_std(std_listener)?
        };
        info!(name = %socket.name(), "listener created");

        let listener = Self {
            dispatcher: dispatcher.downgrade(),
            listener: Rc::new(listener),
            local_address: socket.local_address(),
            callbacks,
            config,
            accept_task: RefCell::new(None),
        };
        listener.enable();
        Ok(listener)
    }
}

/// Pause before accepting again after a failure that leaves the socket unable to accept,
/// such as running out of descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait before the next accept after `e`.
fn accept_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}

async fn accept_loop(
    dispatcher: WeakDispatcher,
    listener: Rc<TcpListener>,
    callbacks: Weak<dyn ListenerCallbacks>,
    config: ConnectionConfig,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                let backoff = accept_backoff(&e);
                warn!(cause = %e, ?backoff, "accept failed");
                if let Some(backoff) = backoff {
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }
        };

        let (Some(dispatcher), Some(callbacks)) = (dispatcher.upgrade(), callbacks.upgrade()) else {
            debug!(%remote, "listener owner gone, dropping accepted socket");
            return;
        };
        let connection = ConnectionImpl::new_server(&dispatcher, stream, remote, config);
        callbacks.on_new_connection(connection);
    }
}

impl Listener for ListenerImpl {
    fn enable(&self) {
        let mut task = self.accept_task.borrow_mut();
        if task.is_some() {
            return;
        }
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            error!(local_address = %self.local_address, "listener enabled after its dispatcher was dropped");
            return;
        };

        let source = dispatcher.active_source();
        let accept = accept_loop(
            self.dispatcher.clone(),
            Rc::clone(&self.listener),
            self.callbacks.clone(),
            self.config,
        );
        *task = Some(dispatcher.spawn_local(async move {
            let _source = source;
            accept.await;
        }));
        debug!(local_address = %self.local_address, "accepting");
    }

    fn disable(&self) {
        if let Some(task) = self.accept_task.borrow_mut().take() {
            task.abort();
            debug!(local_address = %self.local_address, "stopped accepting");
        }
    }

    fn local_address(&self) -> SocketAddr {
        self.local_address
    }
}

impl Drop for ListenerImpl {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

impl fmt::Debug for ListenerImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerImpl")
            .field("local_address", &self.local_address)
            .field("accepting", &self.accept_task.borrow().is_some())
            .finish_non_exhaustive()
    }
}
