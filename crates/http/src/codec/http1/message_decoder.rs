use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::body::PayloadDecoder;
use crate::protocol::{Headers, Message, ParseError, PayloadItem, PayloadSize};

/// Decodes a sequence of messages: a head, then its payload items, then the next head.
///
/// `H` is the request or response head decoder. A message whose payload is
/// [`PayloadSize::Empty`] yields only its head.
#[derive(Debug, Clone)]
pub struct MessageDecoder<H> {
    header_decoder: H,
    payload_decoder: Option<PayloadDecoder>,
}

impl<H> MessageDecoder<H> {
    pub fn new(header_decoder: H) -> Self {
        Self { header_decoder, payload_decoder: None }
    }

    pub fn header_decoder_mut(&mut self) -> &mut H {
        &mut self.header_decoder
    }

    /// True between a head and the end of its payload.
    pub fn in_payload(&self) -> bool {
        self.payload_decoder.is_some()
    }

    /// Ends a payload delimited by the connection closing. Returns false if the current
    /// payload is framed any other way.
    pub fn finish_until_close(&mut self) -> bool {
        if self.payload_decoder.as_ref().is_some_and(PayloadDecoder::is_until_close) {
            self.payload_decoder = None;
            return true;
        }
        false
    }
}

impl<H: Default> Default for MessageDecoder<H> {
    fn default() -> Self {
        Self::new(H::default())
    }
}

impl<H> Decoder for MessageDecoder<H>
where
    H: Decoder<Item = (Headers, PayloadSize), Error = ParseError>,
{
    type Item = Message<(Headers, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item) => {
                    self.payload_decoder = None;
                    Some(Message::Payload(item))
                }
                None => None,
            };

            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((header, payload_size)) => {
                if !payload_size.is_empty() {
                    self.payload_decoder = Some(payload_size.into());
                }
                Some(Message::Header((header, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }
}
