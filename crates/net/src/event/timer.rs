use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use super::WeakDispatcher;

/// A one-shot timer bound to a dispatcher.
///
/// Each [`enable`](Timer::enable) arms the timer once; re-enabling replaces the pending
/// expiry. A disabled or dropped timer never fires.
pub struct Timer {
    dispatcher: WeakDispatcher,
    callback: Rc<dyn Fn()>,
    pending: RefCell<Option<JoinHandle<()>>>,
}

impl Timer {
    pub(crate) fn new(dispatcher: WeakDispatcher, callback: Rc<dyn Fn()>) -> Self {
        Self { dispatcher, callback, pending: RefCell::new(None) }
    }

    pub fn enable(&self, timeout: Duration) {
        self.disable();
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return;
        };

        let source = dispatcher.active_source();
        let callback = Rc::clone(&self.callback);
        let handle = dispatcher.spawn_local(async move {
            let _source = source;
            tokio::time::sleep(timeout).await;
            trace!(?timeout, "timer fired");
            callback();
        });
        *self.pending.borrow_mut() = Some(handle);
    }

    pub fn disable(&self) {
        if let Some(handle) = self.pending.borrow_mut().take() {
            handle.abort();
        }
    }

    pub fn enabled(&self) -> bool {
        self.pending.borrow().as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.disable();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer").field("enabled", &self.enabled()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;
    use crate::event::{Dispatcher, RunType};

    #[test]
    fn fires_once_per_enable() {
        let dispatcher = Dispatcher::new().unwrap();
        let count = Rc::new(Cell::new(0));

        let timer = {
            let count = Rc::clone(&count);
            dispatcher.create_timer(move || count.set(count.get() + 1))
        };
        timer.enable(Duration::from_millis(5));
        dispatcher.run(RunType::Block);
        assert_eq!(count.get(), 1);

        timer.enable(Duration::from_millis(5));
        dispatcher.run(RunType::Block);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn disabled_timer_does_not_fire() {
        let dispatcher = Dispatcher::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let timer = {
            let fired = Rc::clone(&fired);
            dispatcher.create_timer(move || fired.set(true))
        };
        timer.enable(Duration::from_millis(5));
        assert!(timer.enabled());
        timer.disable();
        assert!(!timer.enabled());

        dispatcher.run(RunType::Block);
        assert!(!fired.get());
    }

    #[test]
    fn rearm_replaces_pending_expiry() {
        let dispatcher = Dispatcher::new().unwrap();
        let count = Rc::new(Cell::new(0));

        let timer = {
            let count = Rc::clone(&count);
            dispatcher.create_timer(move || count.set(count.get() + 1))
        };
        timer.enable(Duration::from_secs(3600));
        timer.enable(Duration::from_millis(1));
        dispatcher.run(RunType::Block);

        assert_eq!(count.get(), 1);
    }
}
