// Variable length record files.
//
// A record file is a flat sequence of frames. Each frame starts with a signed
// 32-bit little-endian length followed by that many bytes of record data. The
// reserved length -1 marks the end of a chunk; a clean end of file after a
// complete frame is the end of the stream. Record contents are never
// inspected, so NUL and newline bytes are fine.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{Error, IoContext, Result};

pub const END_OF_CHUNK: i32 = -1;

const HEADER_LEN: usize = 4;
const BUF_SIZE: usize = 8 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Record(Vec<u8>),
    EndOfChunk,
    EndOfStream,
}

#[derive(Debug)]
enum Mode {
    Write(BufWriter<File>),
    Read(BufReader<File>),
    // Only observable if a mode switch failed halfway.
    Closed,
}

#[derive(Debug)]
pub struct RecordFile {
    path: PathBuf,
    mode: Mode,
}

impl RecordFile {
    /// Wraps a freshly created file, positioned for writing.
    pub fn new<P>(file: File, path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        RecordFile {
            path: path.into(),
            mode: Mode::Write(BufWriter::with_capacity(BUF_SIZE, file)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> &mut BufWriter<File> {
        match &mut self.mode {
            Mode::Write(w) => w,
            _ => panic!("record file {} is not open for writing", self.path.display()),
        }
    }

    fn write_len(&mut self, len: i32) -> Result<()> {
        let path = self.path.clone();
        self.writer().write_all(&len.to_le_bytes()).at(path)
    }

    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        let len = i32::try_from(record.len()).map_err(|_| Error::RecordTooLarge(record.len()))?;
        self.write_len(len)?;
        let path = self.path.clone();
        self.writer().write_all(record).at(path)
    }

    pub fn mark_end_of_chunk(&mut self) -> Result<()> {
        self.write_len(END_OF_CHUNK)
    }

    pub fn read_record(&mut self) -> Result<Frame> {
        let reader = match &mut self.mode {
            Mode::Read(r) => r,
            _ => panic!("record file {} is not open for reading", self.path.display()),
        };

        let mut header = [0_u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            match reader.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).at(&self.path),
            }
        }
        match filled {
            0 => return Ok(Frame::EndOfStream),
            HEADER_LEN => {}
            _ => {
                return Err(Error::Corrupt {
                    path: self.path.clone(),
                    reason: "truncated record header".into(),
                })
            }
        }

        let len = i32::from_le_bytes(header);
        if len == END_OF_CHUNK {
            return Ok(Frame::EndOfChunk);
        }
        let len = usize::try_from(len).map_err(|_| Error::Corrupt {
            path: self.path.clone(),
            reason: format!("negative record length {}", len),
        })?;

        let mut buf = vec![0; len];
        reader.read_exact(&mut buf).at(&self.path)?;
        Ok(Frame::Record(buf))
    }

    fn take_file(&mut self) -> Result<File> {
        match std::mem::replace(&mut self.mode, Mode::Closed) {
            Mode::Write(w) => w.into_inner().map_err(|e| e.into_error()).at(&self.path),
            Mode::Read(r) => Ok(r.into_inner()),
            Mode::Closed => Err(Error::Corrupt {
                path: self.path.clone(),
                reason: "record file was left closed by an earlier failure".into(),
            }),
        }
    }

    /// Flushes pending writes and positions the file at its start for reading.
    pub fn rewind(&mut self) -> Result<()> {
        let mut file = self.take_file()?;
        file.seek(SeekFrom::Start(0)).at(&self.path)?;
        self.mode = Mode::Read(BufReader::with_capacity(BUF_SIZE, file));
        Ok(())
    }

    /// Discards the contents and positions the file for writing.
    pub fn truncate(&mut self) -> Result<()> {
        let mut file = self.take_file()?;
        file.set_len(0).at(&self.path)?;
        file.seek(SeekFrom::Start(0)).at(&self.path)?;
        self.mode = Mode::Write(BufWriter::with_capacity(BUF_SIZE, file));
        Ok(())
    }

    /// Positions the file at its end for appending more records.
    pub fn resume(&mut self) -> Result<()> {
        let mut file = self.take_file()?;
        file.seek(SeekFrom::End(0)).at(&self.path)?;
        self.mode = Mode::Write(BufWriter::with_capacity(BUF_SIZE, file));
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Mode::Write(w) = &mut self.mode {
            w.flush().at(&self.path)?;
        }
        Ok(())
    }
}
