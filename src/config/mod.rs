use std::path::{Path, PathBuf};

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::{format::HEADER_LEN, Error, IoContext, Result};

/// External sort tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    /// Bytes buffered in memory before a sorted chunk is spilled.
    pub buffer_size: usize,
    /// Number of chunk files merged at once.
    pub fan_in: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            buffer_size: 200_000,
            fan_in: 16,
        }
    }
}

impl SortConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config("sort buffer size must be positive".into()));
        }
        // With a single file a merge pass never reduces the chunk count.
        if self.fan_in < 2 {
            return Err(Error::Config(format!(
                "sort fan-in must be at least 2, got {}",
                self.fan_in
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Name of the dictionary as a single volume, e.g. `wiki.aar`. Multi-volume
    /// output is named `wiki.1_of_3.aar` and so on.
    pub output: PathBuf,
    /// Upper bound on the size of each volume file, in bytes. Accepts
    /// `"2000M"` style strings when deserialized.
    #[serde(deserialize_with = "deserialize_size")]
    pub max_volume_size: u64,
    /// Parent of the scratch directory. Defaults to the system temp dir.
    pub work_dir: Option<PathBuf>,
    pub sort: SortConfig,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("dictionary.aar"),
            max_volume_size: i32::MAX as u64,
            work_dir: None,
            sort: SortConfig::default(),
        }
    }
}

impl CompilerConfig {
    pub fn new<P: Into<PathBuf>>(output: P) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).at(path.as_ref())?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.sort.validate()?;
        if self.output.file_name().is_none() {
            return Err(Error::Config(format!(
                "output {:?} does not name a file",
                self.output
            )));
        }
        // Multi-volume names are derived as `<stem>.N_of_M.aar`.
        if self.output.extension().map_or(true, |ext| ext != "aar") {
            return Err(Error::Config(format!(
                "output {:?} must have the .aar extension",
                self.output
            )));
        }
        if self.max_volume_size <= HEADER_LEN {
            return Err(Error::Config(format!(
                "max volume size {} cannot hold a {} byte header",
                self.max_volume_size, HEADER_LEN
            )));
        }
        Ok(())
    }
}

/// Parses a byte count with an optional `K`, `M` or `G` suffix (powers of
/// 1024), e.g. `"2000M"`.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let digits = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match digits.chars().last() {
        Some('K') => (&digits[..digits.len() - 1], 1 << 10),
        Some('M') => (&digits[..digits.len() - 1], 1 << 20),
        Some('G') => (&digits[..digits.len() - 1], 1 << 30),
        _ => (digits, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| Error::Config(format!("invalid size {:?}", s)))
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_size(&s).map_err(de::Error::custom),
    }
}
