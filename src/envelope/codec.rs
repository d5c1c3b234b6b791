//! Бинарный кодек конверта.
//!
//! Формат (все целые — big-endian):
//!
//! ```text
//! "TBE" | version: u8 | flags: u8
//! header_count: u32
//! { key_len: u32 | key | value_len: u32 | value } * header_count
//! body_len: u32 | body
//! [crc32: u32]                      -- если установлен FLAG_CHECKSUM
//! ```
//!
//! Контрольная сумма считается по всем предшествующим байтам. Декодер
//! проверяет её, если флаг выставлен, независимо от локальной конфигурации.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use typebus_error::{DecodeError, EncodeError};

use super::{Envelope, Headers};

pub const ENVELOPE_MAGIC: &[u8; 3] = b"TBE";
pub const ENVELOPE_VERSION: u8 = 1;
const FLAG_CHECKSUM: u8 = 0b0000_0001;
const PREAMBLE_LEN: usize = 5;

/// Процессная конфигурация кодека.
static CODEC: OnceCell<EnvelopeCodec> = OnceCell::new();

/// Параметры кодека.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Максимум заголовков в одном конверте.
    pub max_headers: usize,
    /// Максимальный размер тела в байтах.
    pub max_body_bytes: usize,
    /// Дописывать ли CRC32 при кодировании.
    pub checksum: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_headers: 256,
            max_body_bytes: 16 * 1024 * 1024,
            checksum: true,
        }
    }
}

/// Кодек конверта. После установки неизменяем и разделяется всеми
/// воркерами только на чтение.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeCodec {
    config: CodecConfig,
}

/// Устанавливает процессный кодек.
///
/// Инициализация выполняется не более одного раза даже при конкурентном
/// первом обращении; последующие вызовы возвращают уже установленный кодек.
pub fn install_codec(config: CodecConfig) -> &'static EnvelopeCodec {
    let installed = CODEC.get_or_init(|| {
        debug!(?config, "Envelope codec configured");
        EnvelopeCodec::new(config)
    });
    if installed.config != config {
        warn!(
            active = ?installed.config,
            requested = ?config,
            "Envelope codec already configured, keeping active configuration"
        );
    }
    installed
}

/// Процессный кодек; при первом обращении без `install_codec` берётся
/// конфигурация по умолчанию.
pub fn codec() -> &'static EnvelopeCodec {
    CODEC.get_or_init(|| EnvelopeCodec::new(CodecConfig::default()))
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl EnvelopeCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn encode_envelope(
        &self,
        envelope: &Envelope,
    ) -> Result<Bytes, EncodeError> {
        self.encode(&envelope.headers, &envelope.body)
    }

    /// Кодирует заголовки и тело в байты записи брокера.
    pub fn encode(
        &self,
        headers: &Headers,
        body: &[u8],
    ) -> Result<Bytes, EncodeError> {
        if headers.len() > self.config.max_headers {
            return Err(EncodeError::TooManyHeaders {
                count: headers.len(),
                max: self.config.max_headers,
            });
        }
        if body.len() > self.config.max_body_bytes {
            return Err(EncodeError::BodyTooLarge {
                len: body.len(),
                max: self.config.max_body_bytes,
            });
        }

        let headers_len: usize = headers.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
        let mut out = Vec::with_capacity(PREAMBLE_LEN + 4 + headers_len + 4 + body.len() + 4);

        let flags = if self.config.checksum {
            FLAG_CHECKSUM
        } else {
            0
        };
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.push(ENVELOPE_VERSION);
        out.push(flags);

        // Запись в Vec не может завершиться ошибкой ввода-вывода.
        let _ = out.write_u32::<BigEndian>(headers.len() as u32);
        for (key, value) in headers {
            write_str(&mut out, key)?;
            write_str_for(&mut out, key, value)?;
        }

        let _ = out.write_u32::<BigEndian>(body.len() as u32);
        out.extend_from_slice(body);

        if self.config.checksum {
            let crc = crc32fast::hash(&out);
            let _ = out.write_u32::<BigEndian>(crc);
        }

        Ok(Bytes::from(out))
    }

    /// Декодирует запись брокера обратно в конверт.
    pub fn decode(
        &self,
        data: &[u8],
    ) -> Result<Envelope, DecodeError> {
        let mut r = Reader::new(data);

        if r.take(ENVELOPE_MAGIC.len())? != ENVELOPE_MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = r.take(1)?[0];
        if version != ENVELOPE_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let flags = r.take(1)?[0];

        let count = r.read_u32()? as usize;
        if count > self.config.max_headers {
            return Err(DecodeError::LimitExceeded {
                what: "header count",
                value: count,
                max: self.config.max_headers,
            });
        }

        let mut headers = Headers::new();
        for _ in 0..count {
            let key = r.read_string("header key")?;
            let value = r.read_string("header value")?;
            if headers.contains_key(&key) {
                return Err(DecodeError::DuplicateHeader { key });
            }
            headers.insert(key, value);
        }

        let body_len = r.read_u32()? as usize;
        if body_len > self.config.max_body_bytes {
            return Err(DecodeError::LimitExceeded {
                what: "body length",
                value: body_len,
                max: self.config.max_body_bytes,
            });
        }
        let body = Bytes::copy_from_slice(r.take(body_len)?);

        if flags & FLAG_CHECKSUM != 0 {
            let covered = r.position();
            let expected = r.read_u32()?;
            let actual = crc32fast::hash(&data[..covered]);
            if expected != actual {
                return Err(DecodeError::ChecksumMismatch { expected, actual });
            }
        }

        if r.remaining() != 0 {
            return Err(DecodeError::TrailingBytes(r.remaining()));
        }

        Ok(Envelope { headers, body })
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

fn write_str(
    out: &mut Vec<u8>,
    s: &str,
) -> Result<(), EncodeError> {
    write_str_for(out, s, s)
}

fn write_str_for(
    out: &mut Vec<u8>,
    key: &str,
    s: &str,
) -> Result<(), EncodeError> {
    let len = u32::try_from(s.len()).map_err(|_| EncodeError::HeaderTooLarge {
        key: key.to_string(),
        len: s.len(),
    })?;
    let _ = out.write_u32::<BigEndian>(len);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Курсор по срезу с проверкой границ до любой аллокации.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(
        &mut self,
        n: usize,
    ) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn read_string(
        &mut self,
        field: &'static str,
    ) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8 { field })
    }
}
