use thiserror::Error;

/// Errors produced while decoding a wire packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Buffer shorter than the fixed header, or a field failed to decode.
    #[error("malformed or truncated packet header")]
    InvalidHeader,

    /// Version byte differs from the compiled protocol version.
    #[error("unsupported protocol version {found} (expected {expected})")]
    InvalidVersion { found: u8, expected: u8 },

    /// Recomputed checksum disagrees with the header field.
    #[error("checksum mismatch: computed {computed:#06x}, header carries {found:#06x}")]
    ChecksumMismatch { computed: u16, found: u16 },
}
