//! Runs a connection's read and write filter chains.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::buffer::Buffer;
use crate::network::{
    Connection, ConnectionImpl, ConnectionState, FilterStatus, ReadFilter, ReadFilterCallbacks, WriteFilter,
};
use crate::upstream::HostDescription;

#[derive(Default)]
pub(crate) struct FilterManager {
    read_filters: RefCell<Vec<Rc<dyn ReadFilter>>>,
    // newest first, so iteration runs in reverse installation order
    write_filters: RefCell<Vec<Rc<dyn WriteFilter>>>,
    upstream_host: RefCell<Option<Rc<dyn HostDescription>>>,
    iterating: Cell<bool>,
}

impl FilterManager {
    pub(crate) fn add_read_filter(&self, connection: Weak<ConnectionImpl>, filter: Rc<dyn ReadFilter>) {
        let index = {
            let mut filters = self.read_filters.borrow_mut();
            filters.push(Rc::clone(&filter));
            filters.len() - 1
        };
        filter.initialize_read_filter_callbacks(Rc::new(ReadFilterHandle { connection, index }));
    }

    pub(crate) fn add_write_filter(&self, filter: Rc<dyn WriteFilter>) {
        self.write_filters.borrow_mut().insert(0, filter);
    }

    /// New bytes are buffered: run the chain from the first filter.
    pub(crate) fn on_read(&self, connection: &Rc<ConnectionImpl>) {
        self.iterate(connection, 0);
    }

    pub(crate) fn on_continue_reading(&self, connection: &Rc<ConnectionImpl>, start: usize) {
        if self.iterating.get() {
            // resumed from inside a filter callback: pick it up on the next turn
            let weak = Rc::downgrade(connection);
            connection.dispatcher().post(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.filter_manager().on_continue_reading(&connection, start);
                }
            });
            return;
        }
        self.iterate(connection, start);
    }

    /// Runs `data` through the write filters; `StopIteration` keeps it from being queued.
    pub(crate) fn on_write(&self, data: &mut Buffer) -> FilterStatus {
        let filters = self.write_filters.borrow().clone();
        for filter in filters {
            if filter.on_write(data) == FilterStatus::StopIteration {
                return FilterStatus::StopIteration;
            }
        }
        FilterStatus::Continue
    }

    pub(crate) fn upstream_host(&self) -> Option<Rc<dyn HostDescription>> {
        self.upstream_host.borrow().clone()
    }

    pub(crate) fn set_upstream_host(&self, host: Rc<dyn HostDescription>) {
        *self.upstream_host.borrow_mut() = Some(host);
    }

    fn iterate(&self, connection: &Rc<ConnectionImpl>, start: usize) {
        if connection.read_buffer_len() == 0 {
            return;
        }
        let filters: Vec<_> = self.read_filters.borrow().iter().skip(start).cloned().collect();
        self.iterating.set(true);
        for (offset, filter) in filters.into_iter().enumerate() {
            if connection.state() != ConnectionState::Open {
                break;
            }

            // only StopIteration ends the chain, even once the buffer is drained
            let mut data = connection.take_read_buffer();
            trace!(connection_id = connection.id(), filter_index = start + offset, len = data.len(), "on_data");
            let status = filter.on_data(&mut data);
            connection.restore_read_buffer(data);

            if status == FilterStatus::StopIteration {
                break;
            }
        }
        self.iterating.set(false);
    }
}

/// The callback handle handed to one read filter.
///
/// It refers to the connection weakly and to its filter by position, so a filter holding
/// its handle does not keep itself or the connection alive.
struct ReadFilterHandle {
    connection: Weak<ConnectionImpl>,
    index: usize,
}

impl ReadFilterHandle {
    fn upgrade(&self) -> Rc<ConnectionImpl> {
        self.connection.upgrade().expect("read filter callbacks used after their connection was dropped")
    }
}

impl ReadFilterCallbacks for ReadFilterHandle {
    fn connection(&self) -> Rc<dyn Connection> {
        self.upgrade()
    }

    fn continue_reading(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.filter_manager().on_continue_reading(&connection, self.index + 1);
        }
    }

    fn upstream_host(&self) -> Option<Rc<dyn HostDescription>> {
        self.connection.upgrade().and_then(|connection| connection.filter_manager().upstream_host())
    }

    fn set_upstream_host(&self, host: Rc<dyn HostDescription>) {
        if let Some(connection) = self.connection.upgrade() {
            connection.filter_manager().set_upstream_host(host);
        }
    }
}
