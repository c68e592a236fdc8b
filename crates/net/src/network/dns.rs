use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, trace, trace_span, warn};

use crate::event::Dispatcher;

/// Receives the addresses of one lookup; an empty list means the lookup failed.
pub type ResolveCb = Box<dyn FnOnce(Vec<IpAddr>)>;

/// Asynchronous name resolution bound to a dispatcher.
pub trait DnsResolver {
    fn dispatcher(&self) -> Dispatcher;

    /// Looks `name` up and calls `callback` exactly once on a later loop turn.
    fn resolve(&self, name: &str, callback: ResolveCb);
}

struct PendingResolve {
    callback: ResolveCb,
    task: Option<JoinHandle<()>>,
}

type PendingMap = RefCell<HashMap<u64, PendingResolve>>;

/// Resolves through the system resolver on tokio's blocking pool.
///
/// Dropping the resolver cancels every lookup still in flight; their callbacks never run.
pub struct DnsResolverImpl {
    dispatcher: Dispatcher,
    pending: Rc<PendingMap>,
    next_request: Cell<u64>,
}

impl DnsResolverImpl {
    pub(crate) fn new(dispatcher: &Dispatcher) -> Self {
        Self { dispatcher: dispatcher.clone(), pending: Rc::new(RefCell::new(HashMap::new())), next_request: Cell::new(0) }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.borrow().len()
    }
}

fn lookup(name: &str) -> Vec<IpAddr> {
    match (name, 0).to_socket_addrs() {
        Ok(addresses) => {
            let mut resolved: Vec<IpAddr> = Vec::new();
            for address in addresses {
                if !resolved.contains(&address.ip()) {
                    resolved.push(address.ip());
                }
            }
            resolved
        }
        Err(e) => {
            debug!(name, cause = %e, "dns resolution failed");
            Vec::new()
        }
    }
}

async fn run_resolve(pending: Weak<PendingMap>, request: u64, name: String) {
    let span = tracing::Span::current();
    let lookup_name = name.clone();
    let handle = tokio::task::spawn_blocking(move || {
        trace_span!(parent: &span, "getaddrinfo").in_scope(|| {
            trace!("dns resolution starting");
            lookup(&lookup_name)
        })
    });

    let addresses = match handle.await {
        Ok(addresses) => addresses,
        Err(e) => {
            warn!(name, cause = %e, "dns lookup task failed");
            Vec::new()
        }
    };

    let Some(pending) = pending.upgrade() else {
        return;
    };
    let Some(entry) = pending.borrow_mut().remove(&request) else {
        return;
    };
    debug!(name, resolved = addresses.len(), "dns resolution complete");
    (entry.callback)(addresses);
}

impl DnsResolver for DnsResolverImpl {
    fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    fn resolve(&self, name: &str, callback: ResolveCb) {
        let request = self.next_request.get();
        self.next_request.set(request + 1);
        self.pending.borrow_mut().insert(request, PendingResolve { callback, task: None });

        let source = self.dispatcher.active_source();
        let resolve = run_resolve(Rc::downgrade(&self.pending), request, name.to_owned());
        let task = self.dispatcher.spawn_local(async move {
            let _source = source;
            resolve.await;
        });
        if let Some(entry) = self.pending.borrow_mut().get_mut(&request) {
            entry.task = Some(task);
        }
    }
}

impl Drop for DnsResolverImpl {
    fn drop(&mut self) {
        for (_, entry) in self.pending.borrow_mut().drain() {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
    }
}
