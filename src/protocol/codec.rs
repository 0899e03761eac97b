//! Binary track codec.
//!
//! Nodes identify tracks by an opaque base64 string. Underneath is a buffer
//! written with Java's `DataOutput`:
//!
//! ```text
//! i32     header: body length in bits 0-29, flags in bits 30-31
//! u8      version (only when flag bit 0 is set, else version 1)
//! utfm    title
//! utfm    author
//! u64     length in milliseconds
//! utf     identifier
//! bool    is_stream
//! ?utf    uri
//! utf     source name
//! ...     source-specific fields
//! u64     position
//! ```
//!
//! `utf` strings are a big-endian `u16` byte length followed by UTF-8.
//! `utfm` strings use the same framing around Java's modified UTF-8, which
//! encodes NUL as two bytes and characters outside the BMP as two
//! three-byte surrogate halves. A `?` marks a nullable field, prefixed by a
//! presence boolean.
//!
//! Decoding is best-effort past the source name: a buffer that ends early in
//! the source-specific fields still yields a track, flagged as incomplete.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::{
    error::{Error, Result},
    track::{SourceName, TrackInfo},
};

/// Version written by [`encode`].
pub const ENCODE_VERSION: u8 = 2;

/// Flag in the header that marks the presence of a version byte.
const FLAG_VERSIONED: u32 = 1;

/// Bits of the header holding the body length.
const LENGTH_MASK: u32 = (1 << 30) - 1;

/// Maximum encoded length of a single string.
const MAX_STRING_LENGTH: usize = u16::MAX as usize;

/// Result of decoding a track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub info: TrackInfo,

    /// Format version found in the buffer.
    pub version: u8,

    /// Whether the buffer held every field up to and including the position.
    pub complete: bool,
}

/// Decodes an encoded track.
///
/// # Errors
///
/// Returns `InvalidArgument` when `encoded` is not base64 or a mandatory
/// string is malformed, and `DataLoss` when the buffer ends before the source
/// name.
pub fn decode(encoded: &str) -> Result<Decoded> {
    let bytes = BASE64.decode(encoded.trim())?;
    let mut reader = DataReader::new(&bytes);

    let header = reader.read_u32()?;
    let flags = header >> 30;
    let version = if flags & FLAG_VERSIONED == 0 {
        1
    } else {
        reader.read_u8()?
    };

    let title = reader.read_utfm()?;
    let author = reader.read_utfm()?;
    let length = reader.read_u64()?;
    let identifier = reader.read_utf()?;
    let is_stream = reader.read_bool()?;
    let uri = reader.read_nullable_utf()?;
    let source_name: SourceName = reader
        .read_utf()?
        .parse()
        .unwrap_or_else(|never| match never {});

    let mut info = TrackInfo {
        title,
        author,
        length,
        identifier,
        is_stream,
        uri,
        is_seekable: !is_stream,
        source_name,
        position: 0,
        thumbnail: None,
        isrc: None,
        probe_info: None,
    };

    let complete = match read_extras(&mut reader, &mut info) {
        Ok(()) => true,
        Err(e) => {
            debug!(
                "partially decoded {} track {}: {e}",
                info.source_name, info.identifier
            );
            false
        }
    };

    Ok(Decoded {
        info,
        version,
        complete,
    })
}

/// Decodes an encoded track on the blocking thread pool.
///
/// # Errors
///
/// Returns the errors of [`decode`], or `Internal` when the worker panics.
pub async fn decode_async(encoded: &str) -> Result<Decoded> {
    let encoded = encoded.to_owned();
    tokio::task::spawn_blocking(move || decode(&encoded)).await?
}

/// Reads the source-specific fields and the trailing position.
///
/// Fields are stored on `info` as they are read, so that whatever was read
/// before a failure is kept.
fn read_extras(reader: &mut DataReader<'_>, info: &mut TrackInfo) -> Result<()> {
    match info.source_name {
        SourceName::Youtube => {
            info.thumbnail = Some(youtube_thumbnail(&info.identifier));
        }
        SourceName::Deezer | SourceName::Spotify | SourceName::AppleMusic => {
            info.isrc = reader.read_nullable_utfm()?;
            info.thumbnail = reader.read_nullable_utfm()?;
        }
        SourceName::YandexMusic => {
            info.thumbnail = reader.read_nullable_utfm()?;
        }
        SourceName::Local | SourceName::Http => {
            info.probe_info = reader.read_nullable_utfm()?;
        }
        _ => {}
    }

    // Tracks decoded from a node always start from the beginning.
    let _position = reader.read_u64()?;

    Ok(())
}

#[must_use]
pub fn youtube_thumbnail(identifier: &str) -> String {
    format!("https://img.youtube.com/vi/{identifier}/mqdefault.jpg")
}

/// Encodes track metadata into the form nodes accept.
///
/// YouTube thumbnails are derived from the identifier and not written.
///
/// # Errors
///
/// Returns `OutOfRange` when a string exceeds 65535 encoded bytes.
pub fn encode(info: &TrackInfo) -> Result<String> {
    let mut writer = DataWriter::default();

    writer.write_u8(ENCODE_VERSION);
    writer.write_utfm(&info.title)?;
    writer.write_utfm(&info.author)?;
    writer.write_u64(info.length);
    writer.write_utf(&info.identifier)?;
    writer.write_bool(info.is_stream);
    writer.write_nullable_utf(info.uri.as_deref())?;
    writer.write_utf(info.source_name.as_str())?;

    match info.source_name {
        SourceName::Deezer | SourceName::Spotify | SourceName::AppleMusic => {
            writer.write_nullable_utfm(info.isrc.as_deref())?;
            writer.write_nullable_utfm(info.thumbnail.as_deref())?;
        }
        SourceName::YandexMusic => {
            writer.write_nullable_utfm(info.thumbnail.as_deref())?;
        }
        SourceName::Local | SourceName::Http => {
            writer.write_nullable_utfm(info.probe_info.as_deref())?;
        }
        _ => {}
    }

    writer.write_u64(info.position);

    Ok(BASE64.encode(writer.finish()?))
}

/// Big-endian reader over a borrowed buffer.
#[derive(Debug)]
pub struct DataReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DataReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes not read yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::data_loss(format!(
                "need {n} bytes at offset {} but only {} remain",
                self.pos,
                self.remaining()
            )));
        }

        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.take_array::<1>().map(|[byte]| byte)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_u8().map(|byte| byte != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_be_bytes)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_utf(&mut self) -> Result<String> {
        let len = self.read_u16()?;
        let bytes = self.take(len.into())?;
        String::from_utf8(bytes.to_vec()).map_err(Into::into)
    }

    /// Reads a length-prefixed modified UTF-8 string.
    ///
    /// Unpaired surrogates are replaced by U+FFFD.
    pub fn read_utfm(&mut self) -> Result<String> {
        let len = self.read_u16()?;
        let bytes = self.take(len.into())?;
        let units = decode_modified_utf8(bytes)?;

        Ok(char::decode_utf16(units)
            .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect())
    }

    pub fn read_nullable_utf(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            self.read_utf().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn read_nullable_utfm(&mut self) -> Result<Option<String>> {
        if self.read_bool()? {
            self.read_utfm().map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Decodes modified UTF-8 into UTF-16 code units.
fn decode_modified_utf8(bytes: &[u8]) -> Result<Vec<u16>> {
    let malformed = |offset: usize| {
        Error::invalid_argument(format!("malformed modified UTF-8 at byte {offset}"))
    };
    let continuation = |offset: usize| -> Result<u16> {
        match bytes.get(offset) {
            Some(&byte) if byte & 0xC0 == 0x80 => Ok(u16::from(byte & 0x3F)),
            _ => Err(malformed(offset)),
        }
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while let Some(&byte) = bytes.get(i) {
        let unit = match byte >> 4 {
            0..=7 => {
                i += 1;
                u16::from(byte)
            }
            12 | 13 => {
                let low = continuation(i + 1)?;
                i += 2;
                (u16::from(byte & 0x1F) << 6) | low
            }
            14 => {
                let mid = continuation(i + 1)?;
                let low = continuation(i + 2)?;
                i += 3;
                (u16::from(byte & 0x0F) << 12) | (mid << 6) | low
            }
            _ => return Err(malformed(i)),
        };
        units.push(unit);
    }

    Ok(units)
}

/// Big-endian writer producing a track buffer.
#[derive(Debug, Default)]
pub struct DataWriter {
    buf: Vec<u8>,
}

impl DataWriter {
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value.into());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_framed(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u16::try_from(bytes.len()).map_err(|_| {
            Error::out_of_range(format!(
                "string of {} bytes exceeds {MAX_STRING_LENGTH} bytes",
                bytes.len()
            ))
        })?;

        self.write_u16(len);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_utf(&mut self, value: &str) -> Result<()> {
        self.write_framed(value.as_bytes())
    }

    /// Writes a length-prefixed modified UTF-8 string.
    #[expect(clippy::cast_possible_truncation)]
    pub fn write_utfm(&mut self, value: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(value.len());
        for unit in value.encode_utf16() {
            match unit {
                0x0001..=0x007F => bytes.push(unit as u8),
                0x0000 | 0x0080..=0x07FF => bytes.extend_from_slice(&[
                    0xC0 | ((unit >> 6) & 0x1F) as u8,
                    0x80 | (unit & 0x3F) as u8,
                ]),
                _ => bytes.extend_from_slice(&[
                    0xE0 | ((unit >> 12) & 0x0F) as u8,
                    0x80 | ((unit >> 6) & 0x3F) as u8,
                    0x80 | (unit & 0x3F) as u8,
                ]),
            }
        }

        self.write_framed(&bytes)
    }

    pub fn write_nullable_utf(&mut self, value: Option<&str>) -> Result<()> {
        self.write_bool(value.is_some());
        value.map_or(Ok(()), |value| self.write_utf(value))
    }

    pub fn write_nullable_utfm(&mut self, value: Option<&str>) -> Result<()> {
        self.write_bool(value.is_some());
        value.map_or(Ok(()), |value| self.write_utfm(value))
    }

    /// Returns the body without a header.
    #[must_use]
    pub fn into_body(self) -> Vec<u8> {
        self.buf
    }

    /// Returns the body behind a header marking it as versioned.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` when the body does not fit the 30 length bits.
    pub fn finish(self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.buf.len())
            .ok()
            .filter(|len| *len <= LENGTH_MASK)
            .ok_or_else(|| {
                Error::out_of_range(format!("track body of {} bytes", self.buf.len()))
            })?;

        let header = len | (FLAG_VERSIONED << 30);
        let mut bytes = Vec::with_capacity(4 + self.buf.len());
        bytes.extend_from_slice(&header.to_be_bytes());
        bytes.extend(self.buf);
        Ok(bytes)
    }
}
