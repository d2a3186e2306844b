// This package describes the on-disk layout of an aarddict volume (`.aar`).
//
// A volume is laid out as:
//
//   header | metadata | index1 | index2 | articles
//
// The header is fixed size and big-endian:
//
//   signature              4   b"aard"
//   sha1sum               40   ASCII hex SHA-1 of everything after this field
//   version                2
//   uuid                  16   shared by all volumes of one dictionary
//   volume                 2   1-based number of this volume
//   of                     2   total number of volumes
//   meta_length            4   length of the compressed metadata blob
//   index_count            4   number of index1 items
//   article_offset         4   absolute offset of the articles region
//   index1_item_format     4   struct format of an index1 item, NUL padded
//   key_length_format      2   struct format of the index2 length prefix
//   article_length_format  2   struct format of the article length prefix
//
// index1 is a fixed-width array of (index2 offset, article offset) pairs, both
// relative to the start of their region. index2 holds each title behind a
// 16-bit length, and the articles region holds each compressed article behind
// a 32-bit length. The format strings use Python `struct` notation so that
// existing aarddict readers can decode a volume without knowing the widths up
// front.

use std::io::{self, Read, Seek, SeekFrom};

use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::{Error, Result};

pub mod reader;

pub const SIGNATURE: &[u8; 4] = b"aard";
pub const VERSION: u16 = 1;

pub const SHA1_OFFSET: u64 = 4;
pub const SHA1_LEN: usize = 40;
/// The checksum covers every byte from here to the end of the file.
pub const CHECKSUM_START: u64 = SHA1_OFFSET + SHA1_LEN as u64;
pub const VOLUME_COUNT_OFFSET: u64 = CHECKSUM_START + 2 + 16 + 2;
pub const HEADER_LEN: u64 = 86;

pub const KEY_LENGTH_FORMAT: &[u8; 2] = b">H";
pub const ARTICLE_LENGTH_FORMAT: &[u8; 2] = b">L";
pub const KEY_LENGTH_LEN: u64 = 2;
pub const ARTICLE_LENGTH_LEN: u64 = 4;

/// Width of the article offset in index1 items. Chosen once per compile from
/// the maximum volume size and recorded in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    /// `>LL`: 32-bit index2 offset, 32-bit article offset.
    Narrow,
    /// `>LQ`: 32-bit index2 offset, 64-bit article offset.
    Wide,
}

impl IndexFormat {
    pub fn for_max_volume_size(max_volume_size: u64) -> Self {
        if max_volume_size > u32::MAX as u64 {
            IndexFormat::Wide
        } else {
            IndexFormat::Narrow
        }
    }

    pub fn descriptor(&self) -> &'static [u8; 4] {
        match self {
            IndexFormat::Narrow => b">LL\0",
            IndexFormat::Wide => b">LQ\0",
        }
    }

    pub fn from_descriptor(descriptor: &[u8]) -> Option<Self> {
        let end = descriptor
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(descriptor.len());
        match &descriptor[..end] {
            b">LL" => Some(IndexFormat::Narrow),
            b">LQ" => Some(IndexFormat::Wide),
            _ => None,
        }
    }

    pub fn item_len(&self) -> u64 {
        match self {
            IndexFormat::Narrow => 8,
            IndexFormat::Wide => 12,
        }
    }

    pub fn encode_item(&self, index2_offset: u32, article_offset: u64, out: &mut Vec<u8>) -> Result<()> {
        match self {
            IndexFormat::Narrow => {
                let offset = u32::try_from(article_offset).map_err(|_| {
                    Error::Config(format!(
                        "article offset {} does not fit a narrow index",
                        article_offset
                    ))
                })?;
                out.extend(index2_offset.to_be_bytes());
                out.extend(offset.to_be_bytes());
            }
            IndexFormat::Wide => {
                out.extend(index2_offset.to_be_bytes());
                out.extend(article_offset.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Decodes one item from the front of `buf`, which must hold at least
    /// `item_len` bytes.
    pub fn decode_item(&self, buf: &[u8]) -> (u32, u64) {
        let index2_offset = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let article_offset = match self {
            IndexFormat::Narrow => u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as u64,
            IndexFormat::Wide => {
                let mut b = [0_u8; 8];
                b.copy_from_slice(&buf[4..12]);
                u64::from_be_bytes(b)
            }
        };
        (index2_offset, article_offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub sha1sum: [u8; SHA1_LEN],
    pub version: u16,
    pub uuid: Uuid,
    pub volume: u16,
    pub total_volumes: u16,
    pub meta_length: u32,
    pub index_count: u32,
    pub article_offset: u32,
    pub index_format: IndexFormat,
}

impl Header {
    /// A header as first written: the checksum is zero filled and the volume
    /// count is 0, both patched once every volume exists.
    pub fn unpatched(
        uuid: Uuid,
        volume: u16,
        meta_length: u32,
        index_count: u32,
        article_offset: u32,
        index_format: IndexFormat,
    ) -> Self {
        Header {
            sha1sum: [0; SHA1_LEN],
            version: VERSION,
            uuid,
            volume,
            total_volumes: 0,
            meta_length,
            index_count,
            article_offset,
            index_format,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN as usize);
        out.extend(SIGNATURE);
        out.extend(self.sha1sum);
        out.extend(self.version.to_be_bytes());
        out.extend(self.uuid.as_bytes());
        out.extend(self.volume.to_be_bytes());
        out.extend(self.total_volumes.to_be_bytes());
        out.extend(self.meta_length.to_be_bytes());
        out.extend(self.index_count.to_be_bytes());
        out.extend(self.article_offset.to_be_bytes());
        out.extend(self.index_format.descriptor());
        out.extend(KEY_LENGTH_FORMAT);
        out.extend(ARTICLE_LENGTH_FORMAT);
        debug_assert_eq!(HEADER_LEN as usize, out.len());
        out
    }

    /// Decodes a header, trusting the format descriptors it carries rather
    /// than any widths known in advance.
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < HEADER_LEN as usize {
            return Err(format!("header needs {} bytes, found {}", HEADER_LEN, buf.len()));
        }
        if &buf[0..4] != SIGNATURE {
            return Err(format!("bad signature {:?}", &buf[0..4]));
        }

        let u16_at = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);

        let mut sha1sum = [0_u8; SHA1_LEN];
        sha1sum.copy_from_slice(&buf[4..44]);
        let mut uuid = [0_u8; 16];
        uuid.copy_from_slice(&buf[46..62]);

        let index_format = IndexFormat::from_descriptor(&buf[78..82])
            .ok_or_else(|| format!("unknown index1 item format {:?}", &buf[78..82]))?;
        if &buf[82..84] != KEY_LENGTH_FORMAT {
            return Err(format!("unsupported key length format {:?}", &buf[82..84]));
        }
        if &buf[84..86] != ARTICLE_LENGTH_FORMAT {
            return Err(format!("unsupported article length format {:?}", &buf[84..86]));
        }

        Ok(Header {
            sha1sum,
            version: u16_at(44),
            uuid: Uuid::from_bytes(uuid),
            volume: u16_at(62),
            total_volumes: u16_at(64),
            meta_length: u32_at(66),
            index_count: u32_at(70),
            article_offset: u32_at(74),
            index_format,
        })
    }

    pub fn index1_offset(&self) -> u64 {
        HEADER_LEN + self.meta_length as u64
    }

    pub fn index2_offset(&self) -> u64 {
        self.index1_offset() + self.index_count as u64 * self.index_format.item_len()
    }
}

/// Hex SHA-1 over everything from `CHECKSUM_START` to the end of `r`.
pub fn checksum<R: Read + Seek>(r: &mut R) -> io::Result<[u8; SHA1_LEN]> {
    r.seek(SeekFrom::Start(CHECKSUM_START))?;
    let mut hasher = Sha1::new();
    io::copy(r, &mut hasher)?;
    let hex = format!("{:x}", hasher.finalize());
    let mut out = [0_u8; SHA1_LEN];
    out.copy_from_slice(hex.as_bytes());
    Ok(out)
}
