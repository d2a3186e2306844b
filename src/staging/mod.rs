// Disk-backed staging for articles awaiting their collation order.
//
// Payloads are appended once to a flat payload file and never move. A second
// record file holds one small entry per article: its title, whether it is a
// redirect, and where its payload lives. Sorting only shuffles those entries;
// payloads are read back by offset as the sorted entries come out.
//
// Entries going through the sorter are encoded as
//
//   (sort key, (title, (redirect flag, (sequence, (offset, length)))))
//
// so that bytewise order is collation order, then title, then real articles
// ahead of redirects, then insertion order.

use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    config::SortConfig,
    encoding::{Decode, Encode},
    fs::WorkDir,
    recfile::{Frame, RecordFile},
    sort::ExternalSorter,
    Cancellation, Error, IoContext, Result,
};

const ARTICLE: u8 = 0;
const REDIRECT: u8 = 1;

const ENTRIES: &str = "entries";
const PAYLOADS: &str = "payloads";

type Entry = (String, (u8, (u64, u64)));
type SortedEntry = (Vec<u8>, (String, (u8, (u64, (u64, u64)))));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArticle {
    pub title: String,
    pub payload: Vec<u8>,
    pub is_redirect: bool,
}

pub struct ArticleStagingStore {
    dir: WorkDir,
    entries: RecordFile,
    payloads: BufWriter<File>,
    payloads_path: PathBuf,
    payload_reader: Option<File>,
    payload_len: u64,
    count: u64,
    sort: SortConfig,
    cancel: Cancellation,
}

impl ArticleStagingStore {
    pub fn new(parent: Option<&Path>, sort: &SortConfig) -> Result<Self> {
        sort.validate()?;
        let dir = WorkDir::new(parent, "aard-staging-")?;
        let entries = RecordFile::new(dir.create(ENTRIES)?, dir.join(ENTRIES));
        let payloads = BufWriter::new(dir.create(PAYLOADS)?);
        let payloads_path = dir.join(PAYLOADS);
        Ok(ArticleStagingStore {
            dir,
            entries,
            payloads,
            payloads_path,
            payload_reader: None,
            payload_len: 0,
            count: 0,
            sort: sort.clone(),
            cancel: Cancellation::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn assert_open(&self) {
        assert!(!self.dir.is_removed(), "staging store was already closed");
    }

    pub fn append(&mut self, title: &str, payload: &[u8], is_redirect: bool) -> Result<()> {
        self.assert_open();
        let flag = if is_redirect { REDIRECT } else { ARTICLE };
        let offset = self.write_payload(payload)?;
        self.entries
            .write_record(&(title, (flag, (offset, payload.len() as u64))).encode())?;
        self.count += 1;
        Ok(())
    }

    // Returns the offset of the payload. The running length always matches
    // the payload file, even if the entry for this payload is never written.
    fn write_payload(&mut self, payload: &[u8]) -> Result<u64> {
        let offset = self.payload_len;
        self.payloads.write_all(payload).at(&self.payloads_path)?;
        self.payload_len += payload.len() as u64;
        Ok(offset)
    }

    /// Sorts everything appended so far by `key` applied to each title and
    /// returns the articles in that order. More articles may be appended once
    /// the returned iterator is dropped.
    pub fn sorted<K>(&mut self, key: K) -> Result<SortedArticles<'_>>
    where
        K: Fn(&str) -> Vec<u8>,
    {
        self.assert_open();
        self.payloads.flush().at(&self.payloads_path)?;

        let mut sorter = ExternalSorter::bytewise(&self.sort, Some(self.dir.path()))?
            .with_cancellation(self.cancel.clone());

        self.entries.rewind()?;
        let mut seq: u64 = 0;
        loop {
            match self.entries.read_record()? {
                Frame::Record(buf) => {
                    let (title, (flag, (offset, len))) = Entry::decode_from(&buf)?;
                    let k = key(&title);
                    sorter.put((k, (title, (flag, (seq, (offset, len))))).encode())?;
                    seq += 1;
                }
                Frame::EndOfChunk => {
                    return Err(Error::Corrupt {
                        path: self.entries.path().to_path_buf(),
                        reason: "unexpected chunk marker in staged entries".into(),
                    })
                }
                Frame::EndOfStream => break,
            }
        }
        self.entries.resume()?;
        sorter.sort()?;
        debug!(articles = seq, chunks = sorter.chunks_spilled(), "staged articles sorted");

        let reader = match self.payload_reader.take() {
            Some(f) => f,
            None => File::open(&self.payloads_path).at(&self.payloads_path)?,
        };
        let payloads = self.payload_reader.insert(reader);
        Ok(SortedArticles {
            sorter,
            payloads,
            path: &self.payloads_path,
            remaining: seq,
        })
    }

    /// Removes every staged file. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        self.payload_reader = None;
        self.dir.cleanup()
    }
}

pub struct SortedArticles<'a> {
    sorter: ExternalSorter,
    payloads: &'a mut File,
    path: &'a Path,
    remaining: u64,
}

impl<'a> SortedArticles<'a> {
    /// Number of articles not yet returned.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn next_article(&mut self) -> Result<Option<StagedArticle>> {
        let record = match self.sorter.next_record()? {
            Some(record) => record,
            None => return Ok(None),
        };
        let (_, (title, (flag, (_, (offset, len))))) = SortedEntry::decode_from(&record)?;

        self.payloads.seek(SeekFrom::Start(offset)).at(self.path)?;
        let mut payload = vec![0; len as usize];
        self.payloads.read_exact(&mut payload).at(self.path)?;

        self.remaining -= 1;
        Ok(Some(StagedArticle {
            title,
            payload,
            is_redirect: flag == REDIRECT,
        }))
    }
}

impl<'a> Iterator for SortedArticles<'a> {
    type Item = Result<StagedArticle>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_article().transpose()
    }
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use crate::{config::SortConfig, Cancellation, Error};

    use super::{ArticleStagingStore, StagedArticle};

    fn small_sort() -> SortConfig {
        SortConfig {
            buffer_size: 256,
            fan_in: 3,
        }
    }

    fn random_title(rng: &mut impl Rng) -> String {
        let len = rng.gen_range(1..10);
        (0..len).map(|_| rng.gen_range('a'..='f')).collect()
    }

    fn collect(
        store: &mut ArticleStagingStore,
        key: impl Fn(&str) -> Vec<u8>,
    ) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for a in store.sorted(key)? {
            let a = a?;
            out.push((a.title, a.payload));
        }
        Ok(out)
    }

    #[test]
    fn test_sorted_by_key() -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();
        let data: Vec<(String, Vec<u8>)> = (0..100)
            .map(|_| {
                let t = random_title(&mut rng);
                let payload = format!("article {}", t).into_bytes();
                (t, payload)
            })
            .collect();

        let mut store = ArticleStagingStore::new(None, &small_sort())?;
        for (t, p) in &data {
            store.append(t, p, false)?;
        }
        assert_eq!(100, store.len());

        let mut expected = data.clone();
        expected.sort();
        assert_eq!(expected, collect(&mut store, |t| t.as_bytes().to_vec())?);

        let reversed = |t: &str| t.bytes().rev().collect::<Vec<u8>>();
        let mut expected = data.clone();
        expected.sort_by_key(|(t, _)| reversed(t));
        let got = collect(&mut store, reversed)?;
        // Equal keys mean equal titles, and equal titles carry equal payloads.
        assert_eq!(expected, got);

        store.close()?;
        Ok(())
    }

    #[test]
    fn test_duplicates_and_redirects() -> anyhow::Result<()> {
        let mut store = ArticleStagingStore::new(None, &SortConfig::default())?;
        store.append("b", b"", false)?;
        store.append("a", b"see x", true)?;
        store.append("a", b"first", false)?;
        store.append("a", b"second", false)?;

        let got = store
            .sorted(|t| t.as_bytes().to_vec())?
            .collect::<Result<Vec<_>, _>>()?;
        let article = |title: &str, payload: &[u8], is_redirect| StagedArticle {
            title: title.into(),
            payload: payload.to_vec(),
            is_redirect,
        };
        assert_eq!(
            vec![
                article("a", b"first", false),
                article("a", b"second", false),
                article("a", b"see x", true),
                article("b", b"", false),
            ],
            got
        );
        Ok(())
    }

    #[test]
    fn test_append_after_sorted() -> anyhow::Result<()> {
        let mut store = ArticleStagingStore::new(None, &small_sort())?;
        store.append("m", b"1", false)?;
        assert_eq!(1, store.sorted(|t| t.as_bytes().to_vec())?.count());
        store.append("c", b"2", false)?;
        assert_eq!(
            vec![("c".to_string(), b"2".to_vec()), ("m".to_string(), b"1".to_vec())],
            collect(&mut store, |t| t.as_bytes().to_vec())?
        );
        Ok(())
    }

    #[test]
    fn test_orphaned_payload_keeps_offsets() -> anyhow::Result<()> {
        let mut store = ArticleStagingStore::new(None, &small_sort())?;
        store.append("first", b"one", false)?;
        // The payload half of an append whose entry was never recorded.
        store.write_payload(b"orphan")?;
        store.append("second", b"two", false)?;
        assert_eq!(2, store.len());
        assert_eq!(
            vec![
                ("first".to_string(), b"one".to_vec()),
                ("second".to_string(), b"two".to_vec())
            ],
            collect(&mut store, |t| t.as_bytes().to_vec())?
        );
        Ok(())
    }

    #[test]
    fn test_close_removes_files() -> anyhow::Result<()> {
        let parent = tempfile::tempdir()?;
        let mut store = ArticleStagingStore::new(Some(parent.path()), &small_sort())?;
        for i in 0..50 {
            store.append(&format!("title {}", i), &[0; 100], i % 7 == 0)?;
        }
        assert_eq!(1, std::fs::read_dir(parent.path())?.count());
        store.close()?;
        store.close()?;
        assert_eq!(0, std::fs::read_dir(parent.path())?.count());
        Ok(())
    }

    #[test]
    fn test_cancelled_sort() -> anyhow::Result<()> {
        let cancel = Cancellation::new();
        let mut store =
            ArticleStagingStore::new(None, &small_sort())?.with_cancellation(cancel.clone());
        for i in 0..50 {
            store.append(&format!("t{}", i), b"x", false)?;
        }
        cancel.cancel();
        assert!(matches!(
            store.sorted(|t| t.as_bytes().to_vec()),
            Err(Error::Cancelled)
        ));
        store.close()?;
        Ok(())
    }
}
