/// Whether a draining server should turn away new connections.
pub trait DrainDecision {
    fn drain_close(&self) -> bool;
}
