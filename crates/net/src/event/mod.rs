//! The single-threaded event loop
//!
//! A [`Dispatcher`] owns one current-thread tokio runtime and one `LocalSet`. Every
//! connection, listener, timer and resolve bound to it runs its callbacks on the thread
//! that calls [`Dispatcher::run`], and only while that call is in progress.
//!
//! Other threads talk to a dispatcher exclusively through a [`Poster`], which ships a
//! closure onto the loop instead of touching any of its state.

mod dispatcher;
mod timer;

pub use dispatcher::Dispatcher;
pub use dispatcher::Poster;
pub use dispatcher::RunType;
pub use dispatcher::WeakDispatcher;
pub(crate) use dispatcher::ActiveSource;
pub use timer::Timer;
