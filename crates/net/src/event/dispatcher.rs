use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::runtime::{EnterGuard, Runtime};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, error, trace};

use super::Timer;
use crate::network::{
    ConnectionImpl, DnsResolverImpl, ListenerCallbacks, ListenerImpl, TcpListenSocket,
};
use crate::{ConnectionConfig, NetworkError};

/// How long a call to [`Dispatcher::run`] keeps the loop going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Run until [`Dispatcher::exit`] is called or no event source is left.
    Block,
    /// Run one pass over whatever work is ready, then return.
    NonBlock,
}

type PostCb = Box<dyn FnOnce(&Dispatcher) + Send>;

pub(crate) struct Inner {
    // dropped before the runtime so pending tasks release their sockets first
    local: LocalSet,
    runtime: Runtime,
    running: Cell<bool>,
    exit_requested: Cell<bool>,
    active_sources: Cell<usize>,
    wakeup: Notify,
    deferred: RefCell<Vec<Box<dyn Any>>>,
    post_tx: UnboundedSender<PostCb>,
    post_rx: RefCell<Option<UnboundedReceiver<PostCb>>>,
}

/// Handle to an event loop. Cloning is cheap and every clone drives the same loop.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<Inner>,
}

/// A non-owning reference to a [`Dispatcher`], held by tasks running on the loop itself.
#[derive(Clone)]
pub struct WeakDispatcher {
    inner: Weak<Inner>,
}

/// Keeps a `Block` run alive while held: an open socket, an armed timer, a pending resolve.
pub(crate) struct ActiveSource {
    inner: Weak<Inner>,
}

impl Drop for ActiveSource {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let remaining = inner.active_sources.get().saturating_sub(1);
            inner.active_sources.set(remaining);
            if remaining == 0 {
                inner.wakeup.notify_one();
            }
        }
    }
}

impl Dispatcher {
    /// Builds the runtime and the local task set this dispatcher drives.
    pub fn new() -> Result<Self, NetworkError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let (post_tx, post_rx) = mpsc::unbounded();
        let inner = Inner {
            local: LocalSet::new(),
            runtime,
            running: Cell::new(false),
            exit_requested: Cell::new(false),
            active_sources: Cell::new(0),
            wakeup: Notify::new(),
            deferred: RefCell::new(Vec::new()),
            post_tx,
            post_rx: RefCell::new(Some(post_rx)),
        };
        Ok(Self { inner: Rc::new(inner) })
    }

    /// Drives the loop on the calling thread.
    ///
    /// Not reentrant: calling `run` from a callback that is already running on this
    /// dispatcher logs an error and returns immediately.
    pub fn run(&self, run_type: RunType) {
        let inner = &self.inner;
        if inner.running.replace(true) {
            error!("dispatcher run called from inside its own loop");
            return;
        }
        self.start_post_drain();

        trace!(?run_type, active_sources = inner.active_sources.get(), "dispatcher run start");
        match run_type {
            RunType::Block => {
                inner.runtime.block_on(inner.local.run_until(async {
                    while !inner.exit_requested.get() && inner.active_sources.get() > 0 {
                        inner.wakeup.notified().await;
                    }
                }));
            }
            RunType::NonBlock => {
                // one turn lets the driver collect ready I/O, the next runs the woken tasks
                inner.runtime.block_on(inner.local.run_until(async {
                    tokio::task::yield_now().await;
                    tokio::task::yield_now().await;
                }));
            }
        }

        inner.exit_requested.set(false);
        inner.running.set(false);
        self.clear_deferred_delete_list();
        trace!(active_sources = inner.active_sources.get(), "dispatcher run end");
    }

    /// Stops the current `Block` run, or the next one if the loop is not running.
    pub fn exit(&self) {
        debug!("dispatcher exit requested");
        self.inner.exit_requested.set(true);
        self.inner.wakeup.notify_one();
    }

    /// Runs `callback` on this loop on a later turn. It never runs inline.
    pub fn post<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        let source = self.active_source();
        self.inner.local.spawn_local(async move {
            let _source = source;
            callback();
        });
    }

    /// A `Send` handle other threads use to post work onto this loop.
    pub fn poster(&self) -> Poster {
        Poster { tx: self.inner.post_tx.clone() }
    }

    pub fn create_timer<F>(&self, callback: F) -> Timer
    where
        F: Fn() + 'static,
    {
        Timer::new(self.downgrade(), Rc::new(callback))
    }

    /// Keeps `object` alive until the current loop turn is over.
    ///
    /// Used to release objects from inside their own callbacks.
    pub fn deferred_delete(&self, object: Box<dyn Any>) {
        let mut deferred = self.inner.deferred.borrow_mut();
        deferred.push(object);
        if deferred.len() == 1 {
            let weak = Rc::downgrade(&self.inner);
            self.inner.local.spawn_local(async move {
                if let Some(inner) = weak.upgrade() {
                    Dispatcher { inner }.clear_deferred_delete_list();
                }
            });
        }
    }

    /// Creates an outbound connection to a `tcp://ip:port` url. Call `connect` to start it.
    pub fn create_client_connection(&self, url: &str) -> Result<Rc<ConnectionImpl>, NetworkError> {
        self.create_client_connection_with_config(url, ConnectionConfig::default())
    }

    pub fn create_client_connection_with_config(
        &self,
        url: &str,
        config: ConnectionConfig,
    ) -> Result<Rc<ConnectionImpl>, NetworkError> {
        ConnectionImpl::new_client(self, url, config)
    }

    /// Starts accepting on `socket`, handing every accepted connection to `callbacks`.
    pub fn create_listener(
        &self,
        socket: &TcpListenSocket,
        callbacks: Weak<dyn ListenerCallbacks>,
        config: ConnectionConfig,
    ) -> Result<ListenerImpl, NetworkError> {
        ListenerImpl::new(self, socket, callbacks, config)
    }

    pub fn create_dns_resolver(&self) -> DnsResolverImpl {
        DnsResolverImpl::new(self)
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher { inner: Rc::downgrade(&self.inner) }
    }

    pub(crate) fn active_source(&self) -> ActiveSource {
        let inner = &self.inner;
        inner.active_sources.set(inner.active_sources.get() + 1);
        ActiveSource { inner: Rc::downgrade(inner) }
    }

    pub(crate) fn spawn_local<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.inner.local.spawn_local(future)
    }

    /// Enters the runtime context, needed to register sockets with the I/O driver.
    pub(crate) fn enter(&self) -> EnterGuard<'_> {
        self.inner.runtime.enter()
    }

    fn start_post_drain(&self) {
        let Some(mut rx) = self.inner.post_rx.borrow_mut().take() else {
            return;
        };
        let weak = self.downgrade();
        self.inner.local.spawn_local(async move {
            while let Some(callback) = rx.next().await {
                let Some(dispatcher) = weak.upgrade() else {
                    return;
                };
                callback(&dispatcher);
            }
        });
    }

    fn clear_deferred_delete_list(&self) {
        // dropped outside the borrow: a destructor may schedule more deletions
        let objects = std::mem::take(&mut *self.inner.deferred.borrow_mut());
        if !objects.is_empty() {
            trace!(count = objects.len(), "clearing deferred delete list");
        }
        drop(objects);
    }
}

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.inner.upgrade().map(|inner| Dispatcher { inner })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.inner.running.get())
            .field("active_sources", &self.inner.active_sources.get())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for WeakDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakDispatcher").finish_non_exhaustive()
    }
}

/// Posts closures onto a [`Dispatcher`] from any thread.
///
/// The closure receives the dispatcher once it runs on the loop thread.
#[derive(Clone)]
pub struct Poster {
    tx: UnboundedSender<PostCb>,
}

impl Poster {
    /// Queues `callback`; returns false when the dispatcher is gone.
    pub fn post<F>(&self, callback: F) -> bool
    where
        F: FnOnce(&Dispatcher) + Send + 'static,
    {
        self.tx.unbounded_send(Box::new(callback)).is_ok()
    }
}

impl fmt::Debug for Poster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poster").field("closed", &self.tx.is_closed()).finish()
    }
}
