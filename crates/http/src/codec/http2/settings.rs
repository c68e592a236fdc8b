use bytes::{Buf, BufMut, BytesMut};

use super::error::Http2Error;
use super::{DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE};
use crate::codec::Http2Settings;
use crate::ensure;

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// The parameters of one SETTINGS frame. Absent parameters keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsParams {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

impl SettingsParams {
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let mut put = |id: u16, value: Option<u32>| {
            if let Some(value) = value {
                dst.put_u16(id);
                dst.put_u32(value);
            }
        };
        put(HEADER_TABLE_SIZE, self.header_table_size);
        put(ENABLE_PUSH, self.enable_push.map(u32::from));
        put(MAX_CONCURRENT_STREAMS, self.max_concurrent_streams);
        put(INITIAL_WINDOW_SIZE, self.initial_window_size);
        put(MAX_FRAME_SIZE, self.max_frame_size);
        put(MAX_HEADER_LIST_SIZE, self.max_header_list_size);
    }

    pub(crate) fn encoded_len(&self) -> usize {
        let present = [
            self.header_table_size.is_some(),
            self.enable_push.is_some(),
            self.max_concurrent_streams.is_some(),
            self.initial_window_size.is_some(),
            self.max_frame_size.is_some(),
            self.max_header_list_size.is_some(),
        ];
        present.iter().filter(|p| **p).count() * 6
    }

    pub(crate) fn decode(mut payload: &[u8]) -> Result<Self, Http2Error> {
        ensure!(payload.len() % 6 == 0, Http2Error::frame_size("settings payload is not a multiple of 6"));

        let mut params = SettingsParams::default();
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            match id {
                HEADER_TABLE_SIZE => params.header_table_size = Some(value),
                ENABLE_PUSH => {
                    ensure!(value <= 1, Http2Error::protocol("ENABLE_PUSH must be 0 or 1"));
                    params.enable_push = Some(value == 1);
                }
                MAX_CONCURRENT_STREAMS => params.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    ensure!(value <= MAX_WINDOW_SIZE, Http2Error::FlowControl);
                    params.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    ensure!(
                        (DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value),
                        Http2Error::protocol("MAX_FRAME_SIZE out of range")
                    );
                    params.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => params.max_header_list_size = Some(value),
                // unknown identifiers are ignored
                _ => {}
            }
        }
        Ok(params)
    }
}

impl From<&Http2Settings> for SettingsParams {
    fn from(settings: &Http2Settings) -> Self {
        Self {
            header_table_size: Some(settings.header_table_size()),
            enable_push: Some(settings.enable_push()),
            max_concurrent_streams: Some(settings.max_concurrent_streams()),
            initial_window_size: Some(settings.initial_window_size()),
            max_frame_size: Some(settings.max_frame_size()),
            max_header_list_size: Some(settings.max_header_list_size()),
        }
    }
}

/// What the peer has told us so far; starts at the protocol defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PeerSettings {
    pub(crate) header_table_size: u32,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl PeerSettings {
    pub(crate) fn apply(&mut self, params: &SettingsParams) {
        if let Some(size) = params.header_table_size {
            self.header_table_size = size;
        }
        if let Some(streams) = params.max_concurrent_streams {
            self.max_concurrent_streams = Some(streams);
        }
        if let Some(size) = params.initial_window_size {
            self.initial_window_size = size;
        }
        if let Some(size) = params.max_frame_size {
            self.max_frame_size = size;
        }
        if let Some(size) = params.max_header_list_size {
            self.max_header_list_size = Some(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_settings_advertise_every_parameter() {
        let settings = Http2Settings::default().with_initial_window_size(1 << 20);
        let params = SettingsParams::from(&settings);

        let mut dst = BytesMut::new();
        params.encode(&mut dst);
        assert_eq!(dst.len(), params.encoded_len());
        assert_eq!(dst.len(), 36);

        let decoded = SettingsParams::decode(&dst).unwrap();
        assert_eq!(decoded.enable_push, Some(false));
        assert_eq!(decoded.initial_window_size, Some(1 << 20));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(SettingsParams::decode(&[0, 2, 0, 0, 0, 2]), Err(Http2Error::Protocol { .. })));
        assert!(matches!(SettingsParams::decode(&[0, 4, 0x80, 0, 0, 0]), Err(Http2Error::FlowControl)));
        assert!(matches!(SettingsParams::decode(&[0, 5, 0, 0, 0, 100]), Err(Http2Error::Protocol { .. })));
        assert!(matches!(SettingsParams::decode(&[0, 5, 0]), Err(Http2Error::FrameSize { .. })));
    }

    #[test]
    fn unknown_parameters_are_ignored() {
        let decoded = SettingsParams::decode(&[0, 0x42, 0, 0, 0, 7]).unwrap();
        assert_eq!(decoded, SettingsParams::default());

        let mut peer = PeerSettings::default();
        peer.apply(&SettingsParams { max_frame_size: Some(32_768), ..SettingsParams::default() });
        assert_eq!(peer.max_frame_size, 32_768);
        assert_eq!(peer.initial_window_size, 65_535);
    }
}
