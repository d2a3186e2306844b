use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};

use crate::{compress, Error, IoContext, Result};

use super::{checksum, Header, ARTICLE_LENGTH_LEN, HEADER_LEN, KEY_LENGTH_LEN};

/// Random access to the titles and articles of one finished volume.
///
/// Every offset is taken from the header, and the widths of index1 items come
/// from the format descriptor stored there.
#[derive(Debug)]
pub struct VolumeReader {
    path: PathBuf,
    file: File,
    header: Header,
    metadata: Map<String, Value>,
}

impl VolumeReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).at(&path)?;

        let mut buf = vec![0; HEADER_LEN as usize];
        read_exact_at(&file, 0, &mut buf, &path)?;
        let header = Header::decode(&buf).map_err(|reason| Error::Corrupt {
            path: path.clone(),
            reason,
        })?;

        let file_len = file.metadata().at(&path)?.len();
        if HEADER_LEN + header.meta_length as u64 > file_len {
            return Err(Error::Corrupt {
                path,
                reason: format!(
                    "metadata of {} bytes runs past the end of a {} byte file",
                    header.meta_length, file_len
                ),
            });
        }
        let mut blob = vec![0; header.meta_length as usize];
        read_exact_at(&file, HEADER_LEN, &mut blob, &path)?;
        let metadata = if blob.is_empty() {
            Map::new()
        } else {
            serde_json::from_slice(&compress::decompress(&blob))?
        };

        Ok(VolumeReader {
            path,
            file,
            header,
            metadata,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.header.index_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_at(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0; len as usize];
        read_exact_at(&self.file, offset, &mut buf, &self.path)?;
        Ok(buf)
    }

    fn item(&self, i: usize) -> Result<(u32, u64)> {
        assert!(i < self.len(), "index {} out of range for {} items", i, self.len());
        let format = self.header.index_format;
        let offset = self.header.index1_offset() + i as u64 * format.item_len();
        let buf = self.read_at(offset, format.item_len())?;
        Ok(format.decode_item(&buf))
    }

    pub fn title(&self, i: usize) -> Result<String> {
        let (index2_offset, _) = self.item(i)?;
        let at = self.header.index2_offset() + index2_offset as u64;
        let len = self.read_at(at, KEY_LENGTH_LEN)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as u64;
        let title = self.read_at(at + KEY_LENGTH_LEN, len)?;
        String::from_utf8(title).map_err(|e| Error::Corrupt {
            path: self.path.clone(),
            reason: format!("title {} is not utf-8: {}", i, e),
        })
    }

    /// The stored article bytes, still compressed.
    pub fn raw_article(&self, i: usize) -> Result<Vec<u8>> {
        let (_, article_offset) = self.item(i)?;
        let at = self.header.article_offset as u64 + article_offset;
        let len = self.read_at(at, ARTICLE_LENGTH_LEN)?;
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as u64;
        self.read_at(at + ARTICLE_LENGTH_LEN, len)
    }

    pub fn article(&self, i: usize) -> Result<Vec<u8>> {
        Ok(compress::decompress(&self.raw_article(i)?))
    }

    pub fn titles(&self) -> impl Iterator<Item = Result<String>> + '_ {
        (0..self.len()).map(move |i| self.title(i))
    }

    /// Recomputes the checksum and compares it with the stored one.
    pub fn verify_checksum(&self) -> Result<bool> {
        let sum = checksum(&mut &self.file).at(&self.path)?;
        Ok(sum == self.header.sha1sum)
    }
}

fn read_exact_at(mut file: &File, offset: u64, buf: &mut [u8], path: &Path) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).at(path)?;
    match file.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::Corrupt {
            path: path.to_path_buf(),
            reason: format!("{} bytes at offset {} run past the end", buf.len(), offset),
        }),
        Err(e) => Err(e).at(path),
    }
}
