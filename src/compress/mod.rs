use std::io::{Read, Write};

use bzip2::{read::BzDecoder, write::BzEncoder};
use flate2::{read::ZlibDecoder, write::ZlibEncoder};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
    Bz2,
}

const CANDIDATES: [Compression; 2] = [Compression::Zlib, Compression::Bz2];

impl Compression {
    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Zlib => {
                let mut e = ZlibEncoder::new(Vec::new(), flate2::Compression::best());
                e.write_all(data)?;
                e.finish()
            }
            Compression::Bz2 => {
                let mut e = BzEncoder::new(Vec::new(), bzip2::Compression::best());
                e.write_all(data)?;
                e.finish()
            }
        }
    }

    fn decompress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Compression::None => out.extend(data),
            Compression::Zlib => {
                ZlibDecoder::new(data).read_to_end(&mut out)?;
            }
            Compression::Bz2 => {
                BzDecoder::new(data).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }
}

/// Compresses with every candidate and keeps the smallest result. Data no
/// candidate manages to shrink is stored as is.
pub fn compress(data: &[u8]) -> Result<(Compression, Vec<u8>)> {
    let mut best = (Compression::None, None::<Vec<u8>>);
    for c in CANDIDATES {
        let out = c.compress(data).map_err(Error::Compression)?;
        let best_len = best.1.as_ref().map_or(data.len(), |b| b.len());
        if out.len() < best_len {
            best = (c, Some(out));
        }
    }
    match best {
        (c, Some(out)) => Ok((c, out)),
        (_, None) => Ok((Compression::None, data.to_vec())),
    }
}

/// Decodes data produced by `compress` without knowing which candidate won:
/// every candidate is tried in turn and bytes none of them accept are taken
/// to be uncompressed.
pub fn decompress(data: &[u8]) -> Vec<u8> {
    for c in CANDIDATES {
        if let Ok(out) = c.decompress(data) {
            return out;
        }
    }
    data.to_vec()
}
