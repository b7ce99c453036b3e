//! Engine configuration.

/// Tunables for a server connection. All of them have RFC-compatible
/// defaults; construct with `Config::default()` and override fields.
#[derive(Debug, Clone)]
pub struct Config {
    /// Read buffer sizing, advertised to the peer as our
    /// SETTINGS_MAX_FRAME_SIZE. Clamped to the legal range
    /// [16_384, 16_777_215] when the preface is emitted.
    pub read_buffer_size: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS we advertise and enforce against
    /// the peer.
    pub max_concurrent_streams: u32,
    /// SETTINGS_INITIAL_WINDOW_SIZE we advertise. When this exceeds the
    /// RFC default of 65_535, the preface also carries a connection-level
    /// WINDOW_UPDATE closing the gap.
    pub initial_window_size: u32,
    /// Request body buffer capacity when the request carries no
    /// content-length.
    pub request_body_buffer_size: usize,
    /// Response body buffer capacity allocated per active stream.
    pub response_body_buffer_size: usize,
    /// Our SETTINGS_ENABLE_PUSH. Pushing additionally requires the peer
    /// not to have disabled push on its side.
    pub enable_server_push: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_buffer_size: 16384,
            max_concurrent_streams: 256,
            initial_window_size: 65535,
            request_body_buffer_size: 4096,
            response_body_buffer_size: 4096,
            enable_server_push: true,
        }
    }
}
