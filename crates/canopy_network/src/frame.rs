//! Length-prefixed framing.
//!
//! A frame is `[length][extension header][body]`. The length field counts
//! the extension header plus the body and is 1, 2 or 4 bytes wide, in big
//! or little endian. The extension header is reserved: written as zeros and
//! skipped on read. When encryption is on, the body is XXTEA-encrypted
//! before framing, and bounds apply to what actually goes on the wire.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;
use crate::xxtea;

fn default_len_field_width() -> u8 {
    2
}

fn default_ext_header_len() -> usize {
    2
}

fn default_min_len() -> usize {
    1
}

fn default_max_len() -> usize {
    4096
}

/// Wire layout settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Width of the length field in bytes: 1, 2 or 4
    #[serde(default = "default_len_field_width")]
    pub len_field_width: u8,
    /// Reserved bytes between the length field and the body
    #[serde(default = "default_ext_header_len")]
    pub ext_header_len: usize,
    /// Smallest accepted value of the length field
    #[serde(default = "default_min_len")]
    pub min_len: usize,
    /// Largest accepted value of the length field
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    /// Encode the length field little endian
    #[serde(default)]
    pub little_endian: bool,
    /// Encrypt bodies
    #[serde(default)]
    pub encrypt: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            len_field_width: default_len_field_width(),
            ext_header_len: default_ext_header_len(),
            min_len: default_min_len(),
            max_len: default_max_len(),
            little_endian: false,
            encrypt: false,
        }
    }
}

/// Encoder and decoder for one [`FrameConfig`]. Immutable once built, so a
/// single codec is shared by every connection.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    config: FrameConfig,
}

impl FrameCodec {
    /// Validates `config`. Bounds larger than the length field can express
    /// are clamped to its maximum.
    pub fn new(mut config: FrameConfig) -> Result<Self, FrameError> {
        let width_max = match config.len_field_width {
            1 => u8::MAX as usize,
            2 => u16::MAX as usize,
            4 => u32::MAX as usize,
            other => {
                return Err(FrameError::InvalidConfig(format!(
                    "length field width must be 1, 2 or 4, got {other}"
                )))
            }
        };
        config.max_len = config.max_len.min(width_max);
        config.min_len = config.min_len.min(width_max);

        if config.min_len > config.max_len {
            return Err(FrameError::InvalidConfig(format!(
                "min_len {} exceeds max_len {}",
                config.min_len, config.max_len
            )));
        }
        if config.ext_header_len > config.max_len {
            return Err(FrameError::InvalidConfig(format!(
                "ext_header_len {} exceeds max_len {}",
                config.ext_header_len, config.max_len
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn check_bounds(&self, len: usize) -> Result<(), FrameError> {
        if len > self.config.max_len {
            return Err(FrameError::TooLong { len, max: self.config.max_len });
        }
        if len < self.config.min_len {
            return Err(FrameError::TooShort { len, min: self.config.min_len });
        }
        Ok(())
    }

    /// Frames the concatenation of `parts` into one buffer ready to enqueue.
    pub fn encode(&self, parts: &[&[u8]]) -> Result<Vec<u8>, FrameError> {
        let body = parts.concat();
        let body = if self.config.encrypt { xxtea::encrypt(&body) } else { body };

        let len = self.config.ext_header_len + body.len();
        self.check_bounds(len)?;

        let width = usize::from(self.config.len_field_width);
        let mut frame = Vec::with_capacity(width + len);
        let len_bytes = (len as u32).to_be_bytes();
        match (self.config.len_field_width, self.config.little_endian) {
            (1, _) => frame.push(len as u8),
            (2, false) => frame.extend_from_slice(&(len as u16).to_be_bytes()),
            (2, true) => frame.extend_from_slice(&(len as u16).to_le_bytes()),
            (_, false) => frame.extend_from_slice(&len_bytes),
            (_, true) => frame.extend_from_slice(&(len as u32).to_le_bytes()),
        }
        frame.resize(width + self.config.ext_header_len, 0);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Reads one frame from `reader` and returns its body.
    ///
    /// Any I/O error, including end of stream mid-frame, is returned as is.
    pub async fn decode<R>(&self, reader: &mut R) -> Result<Vec<u8>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        let width = usize::from(self.config.len_field_width);
        reader.read_exact(&mut header[..width]).await?;

        let len = match (self.config.len_field_width, self.config.little_endian) {
            (1, _) => usize::from(header[0]),
            (2, false) => usize::from(u16::from_be_bytes([header[0], header[1]])),
            (2, true) => usize::from(u16::from_le_bytes([header[0], header[1]])),
            (_, false) => u32::from_be_bytes(header) as usize,
            (_, true) => u32::from_le_bytes(header) as usize,
        };
        self.check_bounds(len)?;
        if len < self.config.ext_header_len {
            return Err(FrameError::TooShort { len, min: self.config.ext_header_len });
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).await?;
        let body = data.split_off(self.config.ext_header_len);

        if self.config.encrypt {
            xxtea::decrypt(&body).ok_or(FrameError::Decrypt)
        } else {
            Ok(body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(config: FrameConfig) -> FrameCodec {
        FrameCodec::new(config).unwrap()
    }

    #[test]
    fn ping_with_default_layout() {
        let frame = codec(FrameConfig::default()).encode(&[b"PING"]).unwrap();
        assert_eq!(frame, [0x00, 0x06, 0x00, 0x00, 0x50, 0x49, 0x4E, 0x47]);
    }

    #[test]
    fn parts_are_concatenated() {
        let frame = codec(FrameConfig::default()).encode(&[b"PI", b"", b"NG"]).unwrap();
        assert_eq!(&frame[4..], b"PING");
    }

    #[test]
    fn length_field_width_and_byte_order() {
        let one = codec(FrameConfig { len_field_width: 1, ext_header_len: 0, ..FrameConfig::default() });
        assert_eq!(one.encode(&[b"ab"]).unwrap(), [2, b'a', b'b']);

        let little = codec(FrameConfig { little_endian: true, ..FrameConfig::default() });
        assert_eq!(&little.encode(&[b"ab"]).unwrap()[..2], [4, 0]);

        let wide = codec(FrameConfig { len_field_width: 4, ext_header_len: 1, ..FrameConfig::default() });
        assert_eq!(wide.encode(&[b"ab"]).unwrap(), [0, 0, 0, 3, 0, b'a', b'b']);

        let wide_le = codec(FrameConfig {
            len_field_width: 4,
            ext_header_len: 0,
            little_endian: true,
            ..FrameConfig::default()
        });
        assert_eq!(wide_le.encode(&[b"ab"]).unwrap(), [2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn bounds_cover_the_extension_header() {
        let codec = codec(FrameConfig::default());
        // empty body: 2 header bytes still satisfy min_len 1
        assert_eq!(codec.encode(&[]).unwrap(), [0, 2, 0, 0]);

        let big = vec![0u8; 4998];
        assert!(matches!(
            codec.encode(&[&big]),
            Err(FrameError::TooLong { len: 5000, max: 4096 })
        ));

        let strict = FrameCodec::new(FrameConfig { ext_header_len: 0, min_len: 3, ..FrameConfig::default() }).unwrap();
        assert!(matches!(strict.encode(&[b"ab"]), Err(FrameError::TooShort { len: 2, min: 3 })));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(FrameCodec::new(FrameConfig { len_field_width: 3, ..FrameConfig::default() }).is_err());
        assert!(FrameCodec::new(FrameConfig { min_len: 10, max_len: 5, ..FrameConfig::default() }).is_err());
        assert!(FrameCodec::new(FrameConfig { ext_header_len: 9000, ..FrameConfig::default() }).is_err());
    }

    #[test]
    fn max_len_is_clamped_to_the_field_width() {
        let codec = codec(FrameConfig { len_field_width: 1, max_len: 4096, ..FrameConfig::default() });
        assert_eq!(codec.config().max_len, 255);
    }

    #[tokio::test]
    async fn decode_reverses_encode() {
        for config in [
            FrameConfig::default(),
            FrameConfig { little_endian: true, len_field_width: 4, ..FrameConfig::default() },
            FrameConfig { encrypt: true, ..FrameConfig::default() },
        ] {
            let codec = codec(config);
            let frame = codec.encode(&[b"hello ", b"world"]).unwrap();
            let mut reader = &frame[..];
            assert_eq!(codec.decode(&mut reader).await.unwrap(), b"hello world");
            assert!(reader.is_empty());
        }
    }

    #[tokio::test]
    async fn encrypted_frames_do_not_carry_plaintext() {
        let codec = codec(FrameConfig { encrypt: true, ..FrameConfig::default() });
        let frame = codec.encode(&[b"secret payload"]).unwrap();
        assert!(!frame.windows(6).any(|w| w == b"secret"));
        let declared = usize::from(u16::from_be_bytes([frame[0], frame[1]]));
        assert_eq!(declared, frame.len() - 2);
    }

    #[tokio::test]
    async fn decode_enforces_bounds() {
        let codec = codec(FrameConfig { max_len: 16, ..FrameConfig::default() });

        let mut too_long: &[u8] = &[0x00, 0x20];
        assert!(matches!(
            codec.decode(&mut too_long).await,
            Err(FrameError::TooLong { len: 32, max: 16 })
        ));

        let mut too_short: &[u8] = &[0x00, 0x00];
        assert!(matches!(
            codec.decode(&mut too_short).await,
            Err(FrameError::TooShort { len: 0, min: 1 })
        ));

        // declared length shorter than the extension header
        let mut inside_header: &[u8] = &[0x00, 0x01, 0x00];
        assert!(matches!(
            codec.decode(&mut inside_header).await,
            Err(FrameError::TooShort { len: 1, min: 2 })
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_io_error() {
        let codec = codec(FrameConfig::default());
        let mut partial: &[u8] = &[0x00, 0x06, 0x00, 0x00, b'P'];
        let err = codec.decode(&mut partial).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_to_decrypt() {
        let codec = codec(FrameConfig { encrypt: true, ..FrameConfig::default() });
        let mut frame = codec.encode(&[b"integrity"]).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let mut reader = &frame[..];
        assert!(matches!(codec.decode(&mut reader).await, Err(FrameError::Decrypt)));
    }
}
