// One output volume while it is being filled.
//
// Titles and articles arrive already in collation order. Each of the three
// body regions (index1, index2, articles) is accumulated in its own scratch
// file, and `finalize` concatenates header, metadata and the three regions
// into the volume's working file.
//
// A volume never grows past its size limit: `add` computes the footprint of
// the new entry first and only writes when the whole entry fits.

use std::{
    fs::File,
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    format::{Header, IndexFormat, ARTICLE_LENGTH_LEN, HEADER_LEN, KEY_LENGTH_LEN},
    fs::WorkDir,
    Error, IoContext, Result,
};

/// Outcome of offering an entry to a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// The entry would push the volume past its size limit. Nothing was
    /// written.
    ExceedsMaxSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Accumulating,
    Flushed,
}

#[derive(Debug)]
struct Region {
    path: PathBuf,
    w: BufWriter<File>,
    len: u64,
}

impl Region {
    fn create(dir: &WorkDir, name: &str) -> Result<Self> {
        Ok(Region {
            path: dir.join(name),
            w: BufWriter::new(dir.create(name)?),
            len: 0,
        })
    }

    fn write(&mut self, bufs: &[&[u8]]) -> Result<()> {
        for buf in bufs {
            self.w.write_all(buf).at(&self.path)?;
            self.len += buf.len() as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.w.flush().at(&self.path)
    }

    // Appends the whole region to `out` and removes the scratch file.
    fn drain_into<W: Write>(self, out: &mut W) -> Result<()> {
        let Region { path, w, .. } = self;
        let mut file = w.into_inner().map_err(|e| e.into_error()).at(&path)?;
        file.seek(SeekFrom::Start(0)).at(&path)?;
        io::copy(&mut file, out).at(&path)?;
        drop(file);
        std::fs::remove_file(&path).at(&path)
    }
}

#[derive(Debug)]
pub struct Volume {
    number: u16,
    format: IndexFormat,
    max_size: u64,
    index1: Region,
    index2: Region,
    articles: Region,
    index_count: u32,
    total: u64,
    state: State,
}

impl Volume {
    /// `header_reserved` is the part of the volume taken before index1 starts:
    /// the header plus the metadata blob.
    pub fn new(
        dir: &WorkDir,
        number: u16,
        format: IndexFormat,
        max_size: u64,
        header_reserved: u64,
    ) -> Result<Self> {
        debug!(volume = number, max_size, "new volume");
        Ok(Volume {
            number,
            format,
            max_size,
            index1: Region::create(dir, &format!("volume-{}.index1", number))?,
            index2: Region::create(dir, &format!("volume-{}.index2", number))?,
            articles: Region::create(dir, &format!("volume-{}.articles", number))?,
            index_count: 0,
            total: header_reserved,
            state: State::Accumulating,
        })
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn is_empty(&self) -> bool {
        self.index_count == 0
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Bytes the finished volume would take right now.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn region_lens(&self) -> (u64, u64, u64) {
        (self.index1.len, self.index2.len, self.articles.len)
    }

    /// Bytes one entry adds across the three regions.
    pub fn footprint(&self, title: &str, article: &[u8]) -> u64 {
        self.format.item_len()
            + KEY_LENGTH_LEN
            + title.len() as u64
            + ARTICLE_LENGTH_LEN
            + article.len() as u64
    }

    /// Appends one entry, or reports that it does not fit. `article` is the
    /// stored (already compressed) article.
    pub fn add(&mut self, title: &str, article: &[u8]) -> Result<Admission> {
        assert!(
            self.state == State::Accumulating,
            "volume {} was already flushed",
            self.number
        );

        let key_len = u16::try_from(title.len()).map_err(|_| Error::TitleTooLong(title.len()))?;
        let article_len =
            u32::try_from(article.len()).map_err(|_| Error::RecordTooLarge(article.len()))?;

        let footprint = self.footprint(title, article);
        if self.total + footprint > self.max_size || self.index_count == u32::MAX {
            return Ok(Admission::ExceedsMaxSize);
        }

        let index2_offset = u32::try_from(self.index2.len).map_err(|_| {
            Error::Config(format!(
                "index2 of volume {} outgrew 32-bit offsets",
                self.number
            ))
        })?;
        let mut item = Vec::with_capacity(self.format.item_len() as usize);
        self.format
            .encode_item(index2_offset, self.articles.len, &mut item)?;

        self.index1.write(&[&item[..]])?;
        self.index2
            .write(&[&key_len.to_be_bytes()[..], title.as_bytes()])?;
        self.articles
            .write(&[&article_len.to_be_bytes()[..], article])?;
        self.index_count += 1;
        self.total += footprint;
        Ok(Admission::Added)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.index1.flush()?;
        self.index2.flush()?;
        self.articles.flush()?;
        self.state = State::Flushed;
        Ok(())
    }

    /// Writes the complete volume to `path` with an unpatched header and
    /// removes the scratch files.
    pub fn finalize(mut self, path: &Path, uuid: Uuid, meta: &[u8]) -> Result<PathBuf> {
        if self.state == State::Accumulating {
            self.flush()?;
        }

        let meta_length = u32::try_from(meta.len())
            .map_err(|_| Error::Config(format!("metadata of {} bytes is too large", meta.len())))?;
        let article_offset = HEADER_LEN + meta.len() as u64 + self.index1.len + self.index2.len;
        let article_offset = u32::try_from(article_offset).map_err(|_| {
            Error::Config(format!(
                "articles of volume {} start past the 32-bit header field",
                self.number
            ))
        })?;
        let header = Header::unpatched(
            uuid,
            self.number,
            meta_length,
            self.index_count,
            article_offset,
            self.format,
        );

        let file = File::create(path).at(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&header.encode()).at(path)?;
        out.write_all(meta).at(path)?;
        let Volume {
            index1,
            index2,
            articles,
            ..
        } = self;
        index1.drain_into(&mut out)?;
        index2.drain_into(&mut out)?;
        articles.drain_into(&mut out)?;
        let file = out.into_inner().map_err(|e| e.into_error()).at(path)?;
        file.sync_all().at(path)?;

        info!(
            volume = header.volume,
            entries = header.index_count,
            path = %path.display(),
            "volume written"
        );
        Ok(path.to_path_buf())
    }
}
