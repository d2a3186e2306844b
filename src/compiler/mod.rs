// The compile session.
//
// Articles are staged as they arrive, from any number of producer threads.
// `compile` then runs single threaded: it sorts the staged articles by the
// collation key of their titles, fills volumes in that order (starting a new
// volume whenever the next entry does not fit), and writes each volume to a
// working file named `<output>.N`. Once every volume exists, the total volume
// count and the checksum are patched into each working file, and only then are
// the files renamed to their public names.

use std::{
    fs::{self, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    collation::{BinaryCollator, Collator},
    compress,
    config::CompilerConfig,
    format::{self, IndexFormat, HEADER_LEN, SHA1_OFFSET, VOLUME_COUNT_OFFSET},
    fs::WorkDir,
    staging::ArticleStagingStore,
    volume::{Admission, Volume},
    Cancellation, Error, IoContext, Result,
};

const PROGRESS_INTERVAL: u64 = 10_000;

/// One unit of upstream input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub title: String,
    pub payload: Vec<u8>,
    pub is_redirect: bool,
    /// Whether the article counts towards `Stats::articles`.
    pub counted: bool,
}

impl Article {
    pub fn new<T: Into<String>, P: Into<Vec<u8>>>(title: T, payload: P) -> Self {
        Article {
            title: title.into(),
            payload: payload.into(),
            is_redirect: false,
            counted: true,
        }
    }

    pub fn redirect<T: Into<String>, P: Into<Vec<u8>>>(title: T, payload: P) -> Self {
        Article {
            is_redirect: true,
            ..Article::new(title, payload)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub articles: u64,
    pub redirects: u64,
    pub skipped: u64,
    pub empty: u64,
    pub failed: u64,
    pub timed_out: u64,
}

struct Session {
    staging: ArticleStagingStore,
    metadata: Map<String, Value>,
    stats: Stats,
}

pub struct Compiler {
    config: CompilerConfig,
    uuid: Uuid,
    format: IndexFormat,
    collator: Box<dyn Collator>,
    cancel: Cancellation,
    dir: WorkDir,
    session: Mutex<Session>,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).at(parent)?;
            }
        }
        let cancel = Cancellation::new();
        let dir = WorkDir::new(config.work_dir.as_deref(), "aard-compile-")?;
        let staging = ArticleStagingStore::new(Some(dir.path()), &config.sort)?
            .with_cancellation(cancel.clone());
        let format = IndexFormat::for_max_volume_size(config.max_volume_size);
        let uuid = Uuid::new_v4();
        info!(
            output = %config.output.display(),
            max_volume_size = config.max_volume_size,
            ?format,
            %uuid,
            "starting compile"
        );

        Ok(Compiler {
            config,
            uuid,
            format,
            collator: Box::new(BinaryCollator),
            cancel,
            dir,
            session: Mutex::new(Session {
                staging,
                metadata: Map::new(),
                stats: Stats::default(),
            }),
        })
    }

    pub fn with_collator<C: Collator + 'static>(mut self, collator: C) -> Self {
        self.collator = Box::new(collator);
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn index_format(&self) -> IndexFormat {
        self.format
    }

    /// A handle that interrupts this compile from another thread.
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Stats {
        self.session.lock().stats
    }

    /// Sets a metadata entry unless the key is already set.
    pub fn add_metadata<K, V>(&self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        let key = key.into();
        let mut session = self.session.lock();
        if session.metadata.contains_key(&key) {
            warn!(key = %key, "metadata key already set, ignoring new value");
            return;
        }
        session.metadata.insert(key, value.into());
    }

    pub fn add(&self, article: Article) -> Result<()> {
        self.add_article(
            &article.title,
            &article.payload,
            article.is_redirect,
            article.counted,
        )
    }

    /// Stages one article. Blank titles, titles too long for the index and
    /// blank payloads are counted and dropped rather than reported as errors.
    pub fn add_article(
        &self,
        title: &str,
        payload: &[u8],
        is_redirect: bool,
        counted: bool,
    ) -> Result<()> {
        if title.trim().is_empty() {
            warn!("skipping article with blank title");
            self.session.lock().stats.skipped += 1;
            return Ok(());
        }
        if title.len() > u16::MAX as usize {
            warn!(
                len = title.len(),
                prefix = %title.chars().take(40).collect::<String>(),
                "skipping article with oversized title"
            );
            self.session.lock().stats.skipped += 1;
            return Ok(());
        }
        if payload.iter().all(|b| b.is_ascii_whitespace()) {
            debug!(title, "empty article");
            self.session.lock().stats.empty += 1;
            return Ok(());
        }

        let mut session = self.session.lock();
        session.staging.append(title, payload, is_redirect)?;
        if is_redirect {
            session.stats.redirects += 1;
        } else if counted {
            session.stats.articles += 1;
        }
        let staged = session.staging.len();
        if staged % PROGRESS_INTERVAL == 0 {
            debug!(staged, "staging progress");
        }
        Ok(())
    }

    pub fn record_failed(&self, title: &str) {
        warn!(title, "article failed to convert");
        self.session.lock().stats.failed += 1;
    }

    pub fn record_timed_out(&self, title: &str) {
        warn!(title, "article conversion timed out");
        self.session.lock().stats.timed_out += 1;
    }

    fn working_path(&self, volume: u16) -> PathBuf {
        let mut name = self.config.output.as_os_str().to_owned();
        name.push(format!(".{}", volume));
        PathBuf::from(name)
    }

    fn final_path(&self, volume: usize, total: usize) -> PathBuf {
        if total == 1 {
            return self.config.output.clone();
        }
        let stem = self
            .config
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.config
            .output
            .with_file_name(format!("{}.{}_of_{}.aar", stem, volume, total))
    }

    /// Builds every volume and returns their final paths in volume order.
    pub fn compile(mut self) -> Result<Vec<PathBuf>> {
        let mut working = Vec::new();
        let result = match self.write_volumes(&mut working) {
            Ok(()) => self.publish(&working).map_err(|e| {
                error!(
                    error = %e,
                    files = ?working,
                    "finishing volumes failed, working files left in place"
                );
                e
            }),
            Err(e) => {
                // An incomplete set of volumes is never published.
                discard(&working);
                Err(e)
            }
        };

        let staging_closed = self.session.get_mut().staging.close();
        let dir_removed = self.dir.cleanup();
        let paths = result?;
        staging_closed?;
        dir_removed?;
        Ok(paths)
    }

    fn write_volumes(&self, working: &mut Vec<PathBuf>) -> Result<()> {
        let mut session = self.session.lock();
        let session = &mut *session;

        let articles = session.stats.articles;
        if !session.metadata.contains_key("article_count") {
            session
                .metadata
                .insert("article_count".into(), articles.into());
        }
        let (_, meta) = compress::compress(&serde_json::to_vec(&session.metadata)?)?;
        let header_reserved = HEADER_LEN + meta.len() as u64;
        if header_reserved > self.config.max_volume_size {
            return Err(Error::Config(format!(
                "header and {} bytes of metadata exceed the max volume size {}",
                meta.len(),
                self.config.max_volume_size
            )));
        }

        let collator = &self.collator;
        let mut sorted = session.staging.sorted(|t| collator.sort_key(t))?;
        info!(articles = sorted.remaining(), "filling volumes");

        let mut volume = self.new_volume(1, header_reserved)?;
        while let Some(article) = sorted.next_article()? {
            self.cancel.check()?;
            let (_, data) = compress::compress(&article.payload)?;
            if volume.add(&article.title, &data)? == Admission::Added {
                continue;
            }

            let needed = header_reserved + volume.footprint(&article.title, &data);
            let too_large = || Error::ArticleTooLarge {
                title: article.title.clone(),
                needed,
                limit: self.config.max_volume_size,
            };
            if volume.is_empty() {
                return Err(too_large());
            }
            let next = volume.number().checked_add(1).ok_or_else(|| {
                Error::Config("volume count exceeds the 16-bit header field".into())
            })?;
            self.finalize(volume, &meta, working)?;
            volume = self.new_volume(next, header_reserved)?;
            if volume.add(&article.title, &data)? == Admission::ExceedsMaxSize {
                return Err(too_large());
            }
        }
        self.finalize(volume, &meta, working)
    }

    fn new_volume(&self, number: u16, header_reserved: u64) -> Result<Volume> {
        Volume::new(
            &self.dir,
            number,
            self.format,
            self.config.max_volume_size,
            header_reserved,
        )
    }

    fn finalize(&self, volume: Volume, meta: &[u8], working: &mut Vec<PathBuf>) -> Result<()> {
        let path = self.working_path(volume.number());
        // Recorded first so a failed write is still cleaned up.
        working.push(path.clone());
        volume.finalize(&path, self.uuid, meta)?;
        Ok(())
    }

    // Patches the volume count and checksum into every working file, then
    // renames them.
    fn publish(&self, working: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let total = u16::try_from(working.len())
            .map_err(|_| Error::Config("volume count exceeds the 16-bit header field".into()))?;
        for path in working {
            patch(path, total)?;
        }

        let mut paths = Vec::with_capacity(working.len());
        for (i, path) in working.iter().enumerate() {
            let to = self.final_path(i + 1, working.len());
            fs::rename(path, &to).at(path)?;
            paths.push(to);
        }
        info!(volumes = paths.len(), files = ?paths, "compile complete");
        Ok(paths)
    }
}

fn discard(working: &[PathBuf]) {
    for path in working {
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed working file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove working file"),
        }
    }
}

fn patch(path: &Path, total: u16) -> Result<()> {
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .at(path)?;
    f.seek(SeekFrom::Start(VOLUME_COUNT_OFFSET)).at(path)?;
    f.write_all(&total.to_be_bytes()).at(path)?;

    let sum = format::checksum(&mut f).at(path)?;
    f.seek(SeekFrom::Start(SHA1_OFFSET)).at(path)?;
    f.write_all(&sum).at(path)?;
    f.sync_all().at(path)?;
    debug!(path = %path.display(), total, "patched volume");
    Ok(())
}

#[cfg(test)]
mod test {
    use std::path::{Path, PathBuf};

    use rand::Rng;

    use crate::{
        collation::FoldingCollator,
        config::{CompilerConfig, SortConfig},
        format::{reader::VolumeReader, IndexFormat, HEADER_LEN},
        Error,
    };

    use super::{Article, Compiler, Stats};

    fn config(dir: &Path, max_volume_size: u64) -> CompilerConfig {
        CompilerConfig {
            output: dir.join("dict.aar"),
            max_volume_size,
            work_dir: Some(dir.join("work")),
            sort: SortConfig {
                buffer_size: 512,
                fan_in: 3,
            },
        }
    }

    fn aar_files(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.contains(".aar") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn titles(path: &Path) -> anyhow::Result<Vec<String>> {
        Ok(VolumeReader::open(path)?
            .titles()
            .collect::<Result<Vec<_>, _>>()?)
    }

    fn compile_abc(config: CompilerConfig) -> crate::Result<Vec<PathBuf>> {
        let compiler = Compiler::new(config)?;
        compiler.add(Article::new("b", "B"))?;
        compiler.add(Article::new("a", "A"))?;
        compiler.add(Article::new("c", "C"))?;
        compiler.compile()
    }

    #[test]
    fn test_single_volume() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = compile_abc(config(dir.path(), u32::MAX as u64))?;
        assert_eq!(vec![dir.path().join("dict.aar")], paths);
        assert_eq!(vec!["dict.aar"], aar_files(dir.path())?);

        let reader = VolumeReader::open(&paths[0])?;
        assert_eq!(1, reader.header().volume);
        assert_eq!(1, reader.header().total_volumes);
        assert_eq!(IndexFormat::Narrow, reader.header().index_format);
        assert_eq!(vec!["a", "b", "c"], titles(&paths[0])?);
        assert_eq!(b"A".to_vec(), reader.article(0)?);
        assert_eq!(b"B".to_vec(), reader.article(1)?);
        assert_eq!(b"C".to_vec(), reader.article(2)?);
        assert_eq!(3, reader.metadata()["article_count"]);
        assert!(reader.verify_checksum()?);

        // Scratch space is gone.
        assert_eq!(0, std::fs::read_dir(dir.path().join("work"))?.count());
        Ok(())
    }

    #[test]
    fn test_two_volumes() -> anyhow::Result<()> {
        let sizing = tempfile::tempdir()?;
        let paths = compile_abc(config(sizing.path(), u32::MAX as u64))?;
        let meta_length = VolumeReader::open(&paths[0])?.header().meta_length as u64;

        // Room for exactly two entries of a one-byte title and article.
        let entry = 8 + 2 + 1 + 4 + 1;
        let dir = tempfile::tempdir()?;
        let paths = compile_abc(config(dir.path(), HEADER_LEN + meta_length + 2 * entry))?;
        assert_eq!(
            vec![
                dir.path().join("dict.1_of_2.aar"),
                dir.path().join("dict.2_of_2.aar")
            ],
            paths
        );
        assert_eq!(vec!["dict.1_of_2.aar", "dict.2_of_2.aar"], aar_files(dir.path())?);

        let first = VolumeReader::open(&paths[0])?;
        let second = VolumeReader::open(&paths[1])?;
        assert_eq!(first.header().uuid, second.header().uuid);
        assert_eq!((1, 2), (first.header().volume, first.header().total_volumes));
        assert_eq!((2, 2), (second.header().volume, second.header().total_volumes));
        assert!(first.verify_checksum()? && second.verify_checksum()?);
        assert_eq!(vec!["a", "b"], titles(&paths[0])?);
        assert_eq!(vec!["c"], titles(&paths[1])?);
        for path in &paths {
            let len = std::fs::metadata(path)?.len();
            assert!(len <= HEADER_LEN + meta_length + 2 * entry);
        }
        Ok(())
    }

    #[test]
    fn test_article_and_redirect_share_title() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), u32::MAX as u64))?;
        compiler.add(Article::redirect("x", "see y"))?;
        compiler.add(Article::new("x", "the real x"))?;
        compiler.add(Article::new("w", "before x"))?;
        let paths = compiler.compile()?;

        let reader = VolumeReader::open(&paths[0])?;
        assert_eq!(vec!["w", "x", "x"], titles(&paths[0])?);
        assert_eq!(b"the real x".to_vec(), reader.article(1)?);
        assert_eq!(b"see y".to_vec(), reader.article(2)?);
        Ok(())
    }

    #[test]
    fn test_large_compressible_articles() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), u32::MAX as u64))?;
        let mut expected = Vec::new();
        for i in 0..200 {
            let title = format!("article {:03}", i);
            let payload = format!("<p>{}</p>", title).repeat(50 + i);
            compiler.add(Article::new(title.clone(), payload.clone()))?;
            expected.push((title, payload));
        }
        let paths = compiler.compile()?;

        let reader = VolumeReader::open(&paths[0])?;
        assert_eq!(200, reader.len());
        for (i, (title, payload)) in expected.iter().enumerate() {
            assert_eq!(*title, reader.title(i)?);
            assert!(reader.raw_article(i)?.len() < payload.len());
            assert_eq!(payload.as_bytes(), reader.article(i)?.as_slice());
        }
        assert!(reader.verify_checksum()?);
        Ok(())
    }

    #[test]
    fn test_checksum_detects_corruption() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = compile_abc(config(dir.path(), u32::MAX as u64))?;
        let mut bytes = std::fs::read(&paths[0])?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&paths[0], bytes)?;
        assert!(!VolumeReader::open(&paths[0])?.verify_checksum()?);
        Ok(())
    }

    #[test]
    fn test_metadata_first_write_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), u32::MAX as u64))?;
        compiler.add_metadata("title", "Wikipedia");
        compiler.add_metadata("title", "Other");
        compiler.add_metadata("article_count", 42);
        compiler.add(Article::new("a", "A"))?;
        let paths = compiler.compile()?;

        let reader = VolumeReader::open(&paths[0])?;
        let metadata = reader.metadata();
        assert_eq!("Wikipedia", metadata["title"]);
        assert_eq!(42, metadata["article_count"]);
        assert_eq!(
            vec!["title", "article_count"],
            metadata.keys().collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn test_stats() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), u32::MAX as u64))?;
        compiler.add(Article::new("one", "1"))?;
        compiler.add(Article::new("two", "2"))?;
        compiler.add(Article::redirect("uno", "one"))?;
        compiler.add_article("hidden", b"h", false, false)?;
        compiler.add(Article::new("  ", "blank title"))?;
        compiler.add(Article::new("x".repeat(70_000), "long title"))?;
        compiler.add(Article::new("nothing", " \n"))?;
        compiler.record_failed("broken");
        compiler.record_timed_out("slow");
        compiler.record_timed_out("slower");

        assert_eq!(
            Stats {
                articles: 2,
                redirects: 1,
                skipped: 2,
                empty: 1,
                failed: 1,
                timed_out: 2,
            },
            compiler.stats()
        );
        let paths = compiler.compile()?;
        assert_eq!(
            vec!["hidden", "one", "two", "uno"],
            titles(&paths[0])?
        );
        Ok(())
    }

    #[test]
    fn test_empty_compile() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = Compiler::new(config(dir.path(), u32::MAX as u64))?.compile()?;
        let reader = VolumeReader::open(&paths[0])?;
        assert!(reader.is_empty());
        assert_eq!(1, reader.header().total_volumes);
        assert!(reader.verify_checksum()?);
        Ok(())
    }

    #[test]
    fn test_metadata_exceeds_volume_size() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), HEADER_LEN + 14))?;
        assert!(matches!(compiler.compile(), Err(Error::Config(_))));
        assert!(aar_files(dir.path())?.is_empty());

        // Random text does not compress below the limit.
        let mut rng = rand::thread_rng();
        let description: String = (0..4000)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();
        let compiler = Compiler::new(config(dir.path(), 1024))?;
        compiler.add(Article::new("a", "A"))?;
        compiler.add_metadata("description", description);
        assert!(matches!(compiler.compile(), Err(Error::Config(_))));
        assert!(aar_files(dir.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_article_too_large() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), HEADER_LEN + 64))?;
        compiler.add(Article::new("small", "s"))?;
        compiler.add(Article::new("big", (0..=255).collect::<Vec<u8>>()))?;
        assert!(matches!(
            compiler.compile(),
            Err(Error::ArticleTooLarge { title, .. }) if title == "big"
        ));
        assert!(aar_files(dir.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_wide_index() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), u32::MAX as u64 + 1))?;
        assert_eq!(IndexFormat::Wide, compiler.index_format());
        compiler.add(Article::new("b", "B"))?;
        compiler.add(Article::new("a", "A"))?;
        let paths = compiler.compile()?;

        let reader = VolumeReader::open(&paths[0])?;
        assert_eq!(IndexFormat::Wide, reader.header().index_format);
        assert_eq!(&b">LQ\0"[..], &std::fs::read(&paths[0])?[78..82]);
        assert_eq!(vec!["a", "b"], titles(&paths[0])?);
        assert_eq!(b"B".to_vec(), reader.article(1)?);
        Ok(())
    }

    #[test]
    fn test_collator() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler =
            Compiler::new(config(dir.path(), u32::MAX as u64))?.with_collator(FoldingCollator);
        for t in ["b", "B", "a", "C"] {
            compiler.add(Article::new(t, t))?;
        }
        let paths = compiler.compile()?;
        assert_eq!(vec!["a", "b", "B", "C"], titles(&paths[0])?);
        Ok(())
    }

    #[test]
    fn test_cancelled_compile() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), u32::MAX as u64))?;
        for i in 0..100 {
            compiler.add(Article::new(format!("t{}", i), "x"))?;
        }
        compiler.cancellation().cancel();
        assert!(matches!(compiler.compile(), Err(Error::Cancelled)));
        assert!(aar_files(dir.path())?.is_empty());
        assert_eq!(0, std::fs::read_dir(dir.path().join("work"))?.count());
        Ok(())
    }

    #[test]
    fn test_concurrent_producers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let compiler = Compiler::new(config(dir.path(), u32::MAX as u64))?;
        std::thread::scope(|s| {
            for worker in 0..4 {
                let compiler = &compiler;
                s.spawn(move || {
                    for i in 0..100 {
                        let title = format!("{:03}-{}", i, worker);
                        compiler.add(Article::new(title.clone(), title)).unwrap();
                    }
                });
            }
        });
        assert_eq!(400, compiler.stats().articles);

        let paths = compiler.compile()?;
        let got = titles(&paths[0])?;
        let mut expected = got.clone();
        expected.sort();
        assert_eq!(400, got.len());
        assert_eq!(expected, got);
        Ok(())
    }
}
