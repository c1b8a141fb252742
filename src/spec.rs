//! The informal specification of the termwire gateway protocol.

// Transport frame (one or more per websocket binary message):
// ```text
// | ciphertext_len | ciphertext          |
// |       2B       | 1..=4096, tag incl. |
// ```
// The ciphertext is AES-128-GCM sealed with a 12-byte counter nonce
// per direction; the length prefix stays in the clear.
pub(crate) const WIRE_FRAME_MAX_LEN: usize = 4096;
pub(crate) const WIRE_LEN_PREFIX: usize = 2;
pub(crate) const TAG_LEN: usize = 16;
pub(crate) const NONCE_LEN: usize = 12;
pub(crate) const PLAINTEXT_MAX_LEN: usize = WIRE_FRAME_MAX_LEN - TAG_LEN - WIRE_LEN_PREFIX;

// Application frame (plaintext inside the AEAD envelope):
// ```text
// | header | sub-header | data     |
// |   1B   |  2B/absent | variable |
// ```
// The 1-byte header packs a 2-bit type and 6 bits of data (control
// payload length, or a stream id). Stream frames carry a 2-byte
// sub-header: 3-bit marker and 13-bit body length, or on the first
// frame of a stream the initial form: 4-bit command id, 1 success bit
// and an 11-bit data word.
pub(crate) const HEADER_DATA_MAX: u8 = 0x3f;
pub(crate) const STREAM_COUNT: usize = HEADER_DATA_MAX as usize + 1;
pub(crate) const STREAM_BODY_MAX_LEN: usize = 0x1fff;
pub(crate) const STREAM_MARKER_MAX: u8 = 0x07;
pub(crate) const INITIAL_DATA_MAX: u16 = 0x07ff;
pub(crate) const COMMAND_ID_MAX: u8 = 0x0f;
pub(crate) const COMMAND_COUNT: usize = COMMAND_ID_MAX as usize + 1;

// Every stream payload write is prefixed with the 1-byte packet header
// and the 2-byte stream sub-header.
pub(crate) const STREAM_HEADER_SIZE: usize = 3;

// Auth handshake: the per-session random key and the HMAC-SHA512
// digest prefix the client must present.
pub(crate) const SESSION_RANDOM_LEN: usize = 32;
pub(crate) const AUTH_KEY_LEN: usize = 32;
pub(crate) const TRANSPORT_KEY_LEN: usize = 16;

// Wall-clock bucket for transport key derivation.
pub(crate) const KEY_TIME_BUCKET_SECS: u64 = 100;
