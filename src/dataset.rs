//! Shard-file generator for demos and tests.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

/// Write `num_shards` files named `shard_<NNNNN>.txt` under `dir`, each with
/// `lines_per_shard` lines of `sample_id=<G>, shard=<S>` where `G` is a
/// globally increasing sample id.
pub fn make_dataset(dir: &Path, num_shards: u32, lines_per_shard: u64) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let mut global_id: u64 = 0;
    for s in 0..num_shards {
        let path = dir.join(format!("shard_{s:05}.txt"));
        let mut f = std::io::BufWriter::new(
            std::fs::File::create(&path).with_context(|| format!("create {}", path.display()))?,
        );
        for _ in 0..lines_per_shard {
            writeln!(f, "sample_id={global_id}, shard={s}")?;
            global_id += 1;
        }
        f.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shards::{LocalShardStore, ShardStore};
    use std::io::BufRead;

    #[test]
    fn writes_discoverable_shards() {
        let tmp = tempfile::tempdir().unwrap();
        make_dataset(tmp.path(), 3, 4).unwrap();

        let store = LocalShardStore::new(tmp.path());
        let shards = store.list().unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].name, "shard_00000.txt");

        let lines: Vec<String> = store
            .open(&shards[1])
            .unwrap()
            .lines()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "sample_id=4, shard=1");
    }
}
