//! The upstream host capability read filters may attach to a connection.

/// An opaque description of the upstream host a connection is bound for.
///
/// Host selection happens outside this engine; filters only carry the result around.
pub trait HostDescription {
    /// `tcp://ip:port`
    fn url(&self) -> String;

    fn canary(&self) -> bool;

    fn zone(&self) -> String;
}
