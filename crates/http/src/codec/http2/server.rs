use std::fmt;
use std::rc::{Rc, Weak};

use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::Connection;
use tracing::debug;

use super::stream::Http2Core;
use crate::codec::{CodecConnection, Http2Settings, ServerCodec, ServerConnectionCallbacks};
use crate::protocol::{CodecError, Protocol};

/// The server side of HTTP/2.
///
/// Every stream the peer opens is announced through [`ServerConnectionCallbacks`]; the
/// streams progress independently and may be answered in any order.
pub struct Http2ServerCodec {
    core: Rc<Http2Core>,
}

impl Http2ServerCodec {
    pub fn new(
        connection: Weak<dyn Connection>,
        callbacks: Rc<dyn ServerConnectionCallbacks>,
        settings: Http2Settings,
    ) -> Rc<Self> {
        let core = Http2Core::server(connection, callbacks, settings);
        if let Err(e) = core.flush() {
            debug!(cause = %e, "server settings not written");
        }
        Rc::new(Self { core })
    }

    pub fn active_streams(&self) -> usize {
        self.core.num_streams()
    }
}

impl CodecConnection for Http2ServerCodec {
    fn dispatch(&self, data: &mut Buffer) -> Result<(), CodecError> {
        self.core.dispatch(data)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn go_away(&self) {
        self.core.go_away();
    }

    fn on_transport_close(&self) {
        self.core.on_transport_close();
    }
}

impl ServerCodec for Http2ServerCodec {}

impl fmt::Debug for Http2ServerCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2ServerCodec").field("core", &self.core).finish()
    }
}
