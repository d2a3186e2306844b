// Order-preserving tuple encoding.
//
// Every component is written with its 0x00 bytes escaped as 0x00 0xff, and
// components are joined by the separator 0x00 0x01. Because the separator sorts
// below every escaped byte sequence, comparing two encoded tuples bytewise gives
// the same answer as comparing the tuples component by component. Integers are
// written big-endian so that they participate in that ordering too.

use crate::{Error, Result};

const SEPARATOR: [u8; 2] = [0x00, 0x01];
const ESCAPED_00: [u8; 2] = [0x00, 0xff];

fn copy_escaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.iter().position(|x| *x == 0x00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                to.push(0xff);
                from = &from[(idx + 1)..];
            }
            None => {
                to.extend(from);
                return;
            }
        }
    }
}

fn copy_unescaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.windows(2).position(|w| w == ESCAPED_00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                from = &from[(idx + 2)..];
            }
            None => {
                to.extend(from);
                from = &from[from.len()..];
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyWriter {
    buf: Vec<u8>,
}

impl KeyWriter {
    pub fn new() -> Self {
        KeyWriter { buf: Vec::new() }
    }

    fn write(&mut self, buf: &[u8]) {
        copy_escaped(buf, &mut self.buf);
    }

    fn separator(&mut self) {
        self.buf.extend(SEPARATOR);
    }
}

#[derive(Debug, Default)]
pub struct KeyReader {
    buf: Vec<u8>,
    from: usize,
    scratch: Vec<u8>,
}

impl KeyReader {
    pub fn new() -> Self {
        KeyReader::default()
    }

    pub fn load(&mut self, buf: &[u8]) {
        self.buf.clear();
        self.buf.extend(buf);
        self.from = 0;
        self.scratch.clear();
    }

    pub fn next(&mut self) -> Result<&[u8]> {
        if self.from > self.buf.len() {
            return Err(Error::Encoding("read past the last component".into()));
        }
        let split_position = self.buf[self.from..]
            .windows(2)
            .position(|x| x == SEPARATOR)
            .unwrap_or(self.buf.len() - self.from);

        self.scratch.clear();
        copy_unescaped(
            &self.buf[self.from..self.from + split_position],
            &mut self.scratch,
        );
        self.from += split_position + 2;

        Ok(&self.scratch)
    }
}

pub trait Encode: std::fmt::Debug {
    fn write_bytes(&self, kw: &mut KeyWriter);

    fn encode(&self) -> Vec<u8> {
        let mut kw = KeyWriter::new();
        self.write_bytes(&mut kw);
        kw.buf
    }
}

pub trait Decode: Sized {
    fn decode(kr: &mut KeyReader) -> Result<Self>;

    fn decode_from(buf: &[u8]) -> Result<Self> {
        let mut kr = KeyReader::new();
        kr.load(buf);
        Self::decode(&mut kr)
    }
}

fn fixed<const N: usize>(buf: &[u8]) -> Result<[u8; N]> {
    buf.try_into()
        .map_err(|_| Error::Encoding(format!("expected {} bytes, found {}", N, buf.len())))
}

impl Encode for [u8] {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(self)
    }
}

impl Encode for Vec<u8> {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(self)
    }
}

impl Decode for Vec<u8> {
    fn decode(kr: &mut KeyReader) -> Result<Self> {
        Ok(kr.next()?.to_vec())
    }
}

impl Encode for str {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(self.as_bytes())
    }
}

impl Encode for String {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(self.as_bytes())
    }
}

impl Decode for String {
    fn decode(kr: &mut KeyReader) -> Result<Self> {
        String::from_utf8(kr.next()?.to_vec()).map_err(|e| Error::Encoding(e.to_string()))
    }
}

impl Encode for u8 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(&self.to_be_bytes())
    }
}

impl Decode for u8 {
    fn decode(kr: &mut KeyReader) -> Result<Self> {
        Ok(Self::from_be_bytes(fixed(kr.next()?)?))
    }
}

impl Encode for u64 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.write(&self.to_be_bytes())
    }
}

impl Decode for u64 {
    fn decode(kr: &mut KeyReader) -> Result<Self> {
        Ok(Self::from_be_bytes(fixed(kr.next()?)?))
    }
}

impl<A> Encode for &A
where
    A: Encode + ?Sized,
{
    fn write_bytes(&self, kw: &mut KeyWriter) {
        (*self).write_bytes(kw)
    }
}

impl<A, B> Encode for (A, B)
where
    A: Encode,
    B: Encode,
{
    fn write_bytes(&self, kw: &mut KeyWriter) {
        self.0.write_bytes(kw);
        kw.separator();
        self.1.write_bytes(kw);
    }
}

impl<A, B> Decode for (A, B)
where
    A: Decode,
    B: Decode,
{
    fn decode(kr: &mut KeyReader) -> Result<Self> {
        let a = A::decode(kr)?;
        let b = B::decode(kr)?;
        Ok((a, b))
    }
}
