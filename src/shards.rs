//! Dataset shard location and assignment.
//!
//! A shard is a file whose name matches `shard_<NNNNN>.*`; the integer is its
//! shard index. Rank `r` of a `world_size`-worker job owns exactly the shards
//! with `index % world_size == r`, sorted by index. The assignment is a pure
//! function of `(rank, world_size, dataset_root)` and never changes mid-job.

use anyhow::{Context, Result, bail};
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// One discovered shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub index: u32,
    pub name: String,
}

/// A storage backend that can enumerate shards and open one as a line stream.
/// The local-directory backend is the only one shipped; remote object stores
/// plug in at this seam.
pub trait ShardStore {
    /// All shards, sorted by index.
    fn list(&self) -> Result<Vec<Shard>>;

    /// Open one shard as a buffered line reader.
    fn open(&self, shard: &Shard) -> Result<Box<dyn BufRead>>;

    /// The ordered subset of shards owned by `rank`.
    fn assigned(&self, rank: u32, world_size: u32) -> Result<Vec<Shard>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.index % world_size == rank)
            .collect())
    }
}

/// Shards stored as files in a local directory.
pub struct LocalShardStore {
    root: PathBuf,
}

impl LocalShardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalShardStore { root: root.into() }
    }
}

impl ShardStore for LocalShardStore {
    fn list(&self) -> Result<Vec<Shard>> {
        if !self.root.is_dir() {
            bail!("dataset directory not found: {}", self.root.display());
        }
        let mut shards = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("read dataset dir {}", self.root.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(index) = parse_shard_index(&name) {
                shards.push(Shard { index, name });
            }
        }
        shards.sort_by_key(|s| s.index);
        Ok(shards)
    }

    fn open(&self, shard: &Shard) -> Result<Box<dyn BufRead>> {
        let path = self.root.join(&shard.name);
        let file = std::fs::File::open(&path)
            .with_context(|| format!("open shard {}", path.display()))?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }
}

/// Parse the shard index out of a `shard_<NNNNN>.*` file name.
/// Returns `None` for anything that does not match the pattern.
pub fn parse_shard_index(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix("shard_")?;
    let digits = rest.split('.').next()?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
