use std::rc::Rc;

use crate::buffer::Buffer;
use crate::network::{Connection, ConnectionPtr};
use crate::upstream::HostDescription;

/// Whether later filters in the chain run for the current invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

/// Handle a read filter gets back to its connection when it is installed.
pub trait ReadFilterCallbacks {
    /// The connection the filter is installed on.
    ///
    /// # Panics
    ///
    /// If called after the connection was dropped, which cannot happen while the filter
    /// is owned by that connection.
    fn connection(&self) -> Rc<dyn Connection>;

    /// Resumes a chain stopped by this filter, starting at the next filter with the
    /// currently buffered data.
    fn continue_reading(&self);

    fn upstream_host(&self) -> Option<Rc<dyn HostDescription>>;

    fn set_upstream_host(&self, host: Rc<dyn HostDescription>);
}

pub trait ReadFilter {
    /// Called with everything read and not yet consumed. The buffer may only be used for
    /// the duration of the call.
    fn on_data(&self, data: &mut Buffer) -> FilterStatus;

    /// Called once, when the filter is added to a connection.
    fn initialize_read_filter_callbacks(&self, callbacks: Rc<dyn ReadFilterCallbacks>);
}

pub trait WriteFilter {
    fn on_write(&self, data: &mut Buffer) -> FilterStatus;
}

/// A filter on both paths.
pub trait Filter: ReadFilter + WriteFilter {}

impl<T: ReadFilter + WriteFilter> Filter for T {}

/// Builds the filter chain of each new connection.
pub trait FilterChainFactory {
    /// Installs filters on `connection`. Returning false declines the connection, which
    /// is then closed.
    fn create_filter_chain(&self, connection: &ConnectionPtr) -> bool;
}
