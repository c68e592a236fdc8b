//! The read filter that serves HTTP on an accepted connection.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use micro_proxy_net::buffer::Buffer;
use micro_proxy_net::network::{
    ConnectionBufferType, ConnectionCallbacks, ConnectionCloseType, ConnectionEvent, FilterStatus, ReadFilter,
    ReadFilterCallbacks,
};
use tracing::{debug, error, warn};

use crate::codec::http1::Http1ServerCodec;
use crate::codec::http2::Http2ServerCodec;
use crate::codec::{CodecSettings, CodecType, ServerCodec, ServerConnectionCallbacks};

/// Feeds every read into a server codec. The codec is bound to the connection once the
/// filter is installed; each stream the peer opens goes to the [`ServerConnectionCallbacks`].
pub struct ServerCodecFilter {
    codec_type: CodecType,
    settings: CodecSettings,
    callbacks: Rc<dyn ServerConnectionCallbacks>,
    self_ref: Weak<Self>,
    read_callbacks: RefCell<Option<Rc<dyn ReadFilterCallbacks>>>,
    codec: RefCell<Option<Rc<dyn ServerCodec>>>,
}

impl ServerCodecFilter {
    pub fn new(
        codec_type: CodecType,
        callbacks: Rc<dyn ServerConnectionCallbacks>,
        settings: CodecSettings,
    ) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            codec_type,
            settings,
            callbacks,
            self_ref: Weak::clone(self_ref),
            read_callbacks: RefCell::new(None),
            codec: RefCell::new(None),
        })
    }

    pub fn codec_type(&self) -> CodecType {
        self.codec_type
    }

    fn codec(&self) -> Option<Rc<dyn ServerCodec>> {
        self.codec.borrow().as_ref().map(Rc::clone)
    }
}

impl ReadFilter for ServerCodecFilter {
    fn on_data(&self, data: &mut Buffer) -> FilterStatus {
        let Some(codec) = self.codec() else {
            warn!("server codec filter received data before it was installed");
            return FilterStatus::StopIteration;
        };
        if let Err(e) = codec.dispatch(data) {
            let read_callbacks = self.read_callbacks.borrow().as_ref().map(Rc::clone);
            if let Some(read_callbacks) = read_callbacks {
                let connection = read_callbacks.connection();
                error!(connection_id = connection.id(), cause = %e, "http codec error, closing connection");
                connection.close(ConnectionCloseType::NoFlush);
            }
        }
        FilterStatus::StopIteration
    }

    fn initialize_read_filter_callbacks(&self, callbacks: Rc<dyn ReadFilterCallbacks>) {
        let connection = callbacks.connection();
        let weak = Rc::downgrade(&connection);
        let codec: Rc<dyn ServerCodec> = match self.codec_type {
            CodecType::Http1 => Http1ServerCodec::new(weak, Rc::clone(&self.callbacks), self.settings.http1()),
            CodecType::Http2 => Http2ServerCodec::new(weak, Rc::clone(&self.callbacks), self.settings.http2()),
        };
        debug!(connection_id = connection.id(), codec = ?self.codec_type, "server codec installed");

        connection.add_connection_callbacks(Weak::clone(&self.self_ref) as Weak<dyn ConnectionCallbacks>);
        *self.codec.borrow_mut() = Some(codec);
        *self.read_callbacks.borrow_mut() = Some(callbacks);
    }
}

impl ConnectionCallbacks for ServerCodecFilter {
    fn on_buffer_change(&self, _buffer_type: ConnectionBufferType, _old_size: u64, _delta: i64) {}

    fn on_event(&self, event: ConnectionEvent) {
        if !event.is_close() {
            return;
        }
        if let Some(codec) = self.codec() {
            debug!(event = ?event, "connection closed, resetting open server streams");
            codec.on_transport_close();
        }
    }
}

impl fmt::Debug for ServerCodecFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCodecFilter")
            .field("codec_type", &self.codec_type)
            .field("installed", &self.codec.borrow().is_some())
            .finish_non_exhaustive()
    }
}
