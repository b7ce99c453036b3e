//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ErrorCode, ProtocolError};

const ID_HEADER_TABLE_SIZE: u16 = 0x1;
const ID_ENABLE_PUSH: u16 = 0x2;
const ID_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const ID_INITIAL_WINDOW_SIZE: u16 = 0x4;
const ID_MAX_FRAME_SIZE: u16 = 0x5;
const ID_MAX_HEADER_LIST_SIZE: u16 = 0x6;

pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;
pub const MAX_FRAME_SIZE_CEILING: u32 = 16_777_215;

/// One decoded SETTINGS entry. Entries are kept as a list because RFC 7540
/// Section 6.5.3 requires them to be applied in the order they appear, and
/// INITIAL_WINDOW_SIZE / MAX_FRAME_SIZE have per-entry side effects on live
/// streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(bool),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
}

/// The effective SETTINGS of one side of a connection.
#[derive(Debug, Clone)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Record one entry. Side effects on streams and HPACK contexts are the
    /// dispatcher's business; this only updates the effective values.
    pub fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::HeaderTableSize(v) => self.header_table_size = v,
            Setting::EnablePush(v) => self.enable_push = v,
            Setting::MaxConcurrentStreams(v) => self.max_concurrent_streams = Some(v),
            Setting::InitialWindowSize(v) => self.initial_window_size = v,
            Setting::MaxFrameSize(v) => self.max_frame_size = v,
            Setting::MaxHeaderListSize(v) => self.max_header_list_size = Some(v),
        }
    }

    /// The entries that differ from the RFC defaults. The server preface
    /// SETTINGS is empty when nothing was reconfigured.
    pub fn non_default_entries(&self) -> Vec<Setting> {
        let mut entries = Vec::new();
        if self.header_table_size != DEFAULT_HEADER_TABLE_SIZE {
            entries.push(Setting::HeaderTableSize(self.header_table_size));
        }
        if !self.enable_push {
            entries.push(Setting::EnablePush(false));
        }
        if let Some(v) = self.max_concurrent_streams {
            entries.push(Setting::MaxConcurrentStreams(v));
        }
        if self.initial_window_size != DEFAULT_INITIAL_WINDOW_SIZE {
            entries.push(Setting::InitialWindowSize(self.initial_window_size));
        }
        if self.max_frame_size != DEFAULT_MAX_FRAME_SIZE {
            entries.push(Setting::MaxFrameSize(self.max_frame_size));
        }
        if let Some(v) = self.max_header_list_size {
            entries.push(Setting::MaxHeaderListSize(v));
        }
        entries
    }

    /// Encode the non-default entries directly.
    pub fn encode_non_default(&self, dst: &mut BytesMut) {
        encode_entries(&self.non_default_entries(), dst);
    }
}

fn put_entry(dst: &mut BytesMut, id: u16, value: u32) {
    dst.put_u16(id);
    dst.put_u32(value);
}

/// Encode an entry list verbatim (used by tests building client frames).
pub fn encode_entries(entries: &[Setting], dst: &mut BytesMut) {
    for e in entries {
        match *e {
            Setting::HeaderTableSize(v) => put_entry(dst, ID_HEADER_TABLE_SIZE, v),
            Setting::EnablePush(v) => put_entry(dst, ID_ENABLE_PUSH, v as u32),
            Setting::MaxConcurrentStreams(v) => put_entry(dst, ID_MAX_CONCURRENT_STREAMS, v),
            Setting::InitialWindowSize(v) => put_entry(dst, ID_INITIAL_WINDOW_SIZE, v),
            Setting::MaxFrameSize(v) => put_entry(dst, ID_MAX_FRAME_SIZE, v),
            Setting::MaxHeaderListSize(v) => put_entry(dst, ID_MAX_HEADER_LIST_SIZE, v),
        }
    }
}

/// Decode a SETTINGS payload into an ordered entry list, rejecting illegal
/// values at parse time (RFC 7540 Section 6.5.2). Unknown identifiers are
/// skipped.
pub fn decode_entries(mut payload: &[u8]) -> Result<Vec<Setting>, ProtocolError> {
    if !payload.len().is_multiple_of(6) {
        return Err(ProtocolError::connection(
            ErrorCode::FrameSizeError,
            "SETTINGS payload is not a multiple of 6 octets",
        ));
    }
    let mut entries = Vec::with_capacity(payload.len() / 6);
    while payload.has_remaining() {
        let id = payload.get_u16();
        let value = payload.get_u32();
        match id {
            ID_HEADER_TABLE_SIZE => entries.push(Setting::HeaderTableSize(value)),
            ID_ENABLE_PUSH => match value {
                0 => entries.push(Setting::EnablePush(false)),
                1 => entries.push(Setting::EnablePush(true)),
                _ => {
                    return Err(ProtocolError::connection(
                        ErrorCode::ProtocolError,
                        "SETTINGS_ENABLE_PUSH must be 0 or 1",
                    ));
                }
            },
            ID_MAX_CONCURRENT_STREAMS => entries.push(Setting::MaxConcurrentStreams(value)),
            ID_INITIAL_WINDOW_SIZE => {
                if value > 0x7fff_ffff {
                    return Err(ProtocolError::connection(
                        ErrorCode::FlowControlError,
                        "SETTINGS_INITIAL_WINDOW_SIZE exceeds 2^31-1",
                    ));
                }
                entries.push(Setting::InitialWindowSize(value));
            }
            ID_MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_CEILING).contains(&value) {
                    return Err(ProtocolError::connection(
                        ErrorCode::ProtocolError,
                        "SETTINGS_MAX_FRAME_SIZE out of range",
                    ));
                }
                entries.push(Setting::MaxFrameSize(value));
            }
            ID_MAX_HEADER_LIST_SIZE => entries.push(Setting::MaxHeaderListSize(value)),
            _ => {}
        }
    }
    Ok(entries)
}
