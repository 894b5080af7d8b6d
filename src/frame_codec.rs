use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::qos::QosProfile;
use aead::{Aead, Nonce};
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use rand::RngCore;
use tracing::{error, warn};

/// Framing pipeline applied to a whole message before fragmentation: optional
///  compression, then optional authenticated encryption with a fresh nonce per
///  message.
///
/// Frame layout without encryption:
/// ```ascii
/// 0: flag byte (bit 0: compressed, bit 1: encrypted)
/// 1: body (raw or compressed payload)
/// ```
///
/// With encryption the flag byte and body are sealed together and the frame is
/// ```ascii
/// 0:  nonce (12 bytes)
/// 12: ciphertext over (flag || body), including the 16 byte authentication tag
/// ```
pub struct FrameCodec {
    cipher: Option<Aes256Gcm>,
    compression: bool,
}

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_ENCRYPTED: u8 = 0x02;
const FLAG_KNOWN_MASK: u8 = FLAG_COMPRESSED | FLAG_ENCRYPTED;

/// payloads at or below this size are never compressed
const COMPRESSION_FLOOR: usize = 64;
const COMPRESSION_LEVEL: i32 = 3;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

impl FrameCodec {
    pub fn new(config: &LinkConfig) -> FrameCodec {
        FrameCodec {
            cipher: config
                .encryption_key
                .as_ref()
                .map(|key| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))),
            compression: config.compression,
        }
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.is_some()
    }

    /// framing bytes added around a payload for the given profile
    pub fn overhead(&self, qos: &QosProfile) -> usize {
        if qos.encryption {
            1 + NONCE_LEN + TAG_LEN
        } else {
            1
        }
    }

    pub fn seal(&self, payload: &[u8], qos: &QosProfile) -> Vec<u8> {
        let mut flag = 0u8;

        let body = if self.compression && qos.compression && payload.len() > COMPRESSION_FLOOR {
            match zstd::encode_all(payload, COMPRESSION_LEVEL) {
                // only worth carrying if it compresses to at most 80% of the original
                Ok(compressed) if compressed.len() * 5 <= payload.len() * 4 => {
                    flag |= FLAG_COMPRESSED;
                    compressed
                }
                Ok(_) => payload.to_vec(),
                Err(e) => {
                    warn!("compression failed, sending uncompressed: {}", e);
                    payload.to_vec()
                }
            }
        } else {
            payload.to_vec()
        };

        if !qos.encryption {
            let mut frame = Vec::with_capacity(1 + body.len());
            frame.push(flag);
            frame.extend_from_slice(&body);
            return frame;
        }

        flag |= FLAG_ENCRYPTED;
        let cipher = self
            .cipher
            .as_ref()
            .expect("encryption requested without a key - configuration validation should have caught this");

        let mut plaintext = Vec::with_capacity(1 + body.len());
        plaintext.push(flag);
        plaintext.extend_from_slice(&body);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        match cipher.encrypt(nonce, plaintext.as_slice()) {
            Ok(ciphertext) => {
                let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                frame.extend_from_slice(&nonce_bytes);
                frame.extend_from_slice(&ciphertext);
                frame
            }
            Err(e) => {
                error!("encryption error: {}", e);
                panic!("encryption error");
            }
        }
    }

    pub fn open(&self, frame: &[u8], qos: &QosProfile) -> Result<Vec<u8>, LinkError> {
        let plaintext: Vec<u8>;
        let (flag, body) = if qos.encryption {
            if frame.len() < NONCE_LEN + TAG_LEN + 1 {
                return Err(LinkError::Malformed("encrypted frame too short"));
            }
            let cipher = self
                .cipher
                .as_ref()
                .expect("encryption requested without a key - configuration validation should have caught this");

            let nonce = Nonce::<Aes256Gcm>::from_slice(&frame[..NONCE_LEN]);
            plaintext = cipher
                .decrypt(nonce, &frame[NONCE_LEN..])
                .map_err(|_| LinkError::AuthFailure)?;

            let flag = plaintext[0];
            if flag & FLAG_ENCRYPTED == 0 {
                return Err(LinkError::Malformed("sealed frame without encrypted flag"));
            }
            (flag, &plaintext[1..])
        } else {
            let Some((&flag, body)) = frame.split_first() else {
                return Err(LinkError::Malformed("empty frame"));
            };
            if flag & FLAG_ENCRYPTED != 0 {
                return Err(LinkError::Malformed("encrypted flag on a plaintext connection"));
            }
            (flag, body)
        };

        if flag & !FLAG_KNOWN_MASK != 0 {
            return Err(LinkError::Malformed("unknown frame flag bits"));
        }

        if flag & FLAG_COMPRESSED != 0 {
            if !self.compression {
                return Err(LinkError::Malformed("compressed flag on an uncompressed connection"));
            }
            zstd::decode_all(body).map_err(|_| LinkError::DecompressFailure)
        } else {
            Ok(body.to_vec())
        }
    }
}
