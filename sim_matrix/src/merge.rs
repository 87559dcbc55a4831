//! Combines independently built pair stores into one
//!
//! The first input seeds the output by copying its directory. The remaining inputs are folded in
//! one at a time through [`PairStore::merge_from`], re-keyed by identifier. Any failure removes
//! the partial output.
use crate::error::{Error, Result};
use crate::pairs::{ImportStats, PairStore, StoreConfig};
use log::{info, warn};
use serde::{Serialize, Deserialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MergeConfig {
    pub frame_size: usize,
}

impl Default for MergeConfig {

    fn default() -> Self {
        Self {
            frame_size: 100_000,
        }
    }
}

impl MergeConfig {

    pub fn from_file(filename: &Path) -> Result<Self> {

        let serialized = fs::read_to_string(filename)?;
        let deserialized: Self = serde_yaml::from_str(&serialized)?;

        Ok(deserialized)
    }

    pub fn to_file(&self, filename: &Path) -> Result<()> {

        let serialized = serde_yaml::to_string(&self)?;
        fs::write(filename, serialized)?;

        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeStats {
    pub inputs: usize,
    pub records: usize,
    pub duplicates: usize,
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {

    fs::create_dir_all(to)?;

    for entry in fs::read_dir(from)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }

    Ok(())
}

fn merge_into(inputs: &[PathBuf], output: &Path, config: &MergeConfig) -> Result<MergeStats> {

    copy_dir(&inputs[0], output)?;

    let mut target = PairStore::open(output, true)?;
    target.config.frame_size = config.frame_size;

    let mut stats = MergeStats {
        inputs: 1,
        records: target.len(),
        duplicates: 0,
    };

    for input in inputs[1..].iter() {

        let other = PairStore::open(input, false)?;
        let ImportStats { imported, duplicates, .. } = target.merge_from(&other)?;

        stats.inputs += 1;
        stats.records += imported;
        stats.duplicates += duplicates;

        info!("merged input {} of {}: {}", stats.inputs, inputs.len(), input.display());
    }

    //copied config still names the first input's directory
    let mut store_config = StoreConfig::from_file(&output.join("config.yaml"))?;
    store_config.directory = output.to_string_lossy().to_string();
    store_config.to_file(&store_config.get_config_filename())?;

    target.close()?;

    Ok(stats)
}

/// Merges `inputs` in order into a new store at `output`.
///
/// Conflicting duplicates abort with [`Error::DuplicateRecord`] whatever the input order, and
/// leave no output behind.
pub fn merge(inputs: &[PathBuf], output: &Path, config: &MergeConfig) -> Result<MergeStats> {

    if inputs.is_empty() {
        return Err(Error::NotFound("merge input".into()));
    }

    if output.exists() {
        return Err(Error::AlreadyExists(output.to_path_buf()));
    }

    match merge_into(inputs, output, config) {
        Ok(stats) => {
            info!("merged {} stores into {}: {} records, {} duplicates",
                  stats.inputs, output.display(), stats.records, stats.duplicates);
            Ok(stats)
        },
        Err(e) => {
            warn!("merge into {} failed, removing partial output", output.display());
            let _ = fs::remove_dir_all(output);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::test_util::test_dir;
    use crate::data::RawTriple;

    fn build_store(directory: PathBuf, triples: &[(&str, &str, f64)]) -> PathBuf {

        let mut store = PairStore::create_with_config(StoreConfig::with_directory(&directory)).unwrap();
        let rows = triples.iter().map(|(a, b, s)| Ok(RawTriple::new(*a, *b, *s)));
        store.import(rows, false).unwrap();
        store.close().unwrap();

        directory
    }

    fn content(directory: &Path) -> Vec<(String, String, u64)> {

        let store = PairStore::open(directory, false).unwrap();
        let mut triples: Vec<(String, String, u64)> = store.triples(10).unwrap()
            .map(|x| x.unwrap())
            .map(|x| (x.a, x.b, (x.score * 10000.0).round() as u64))
            .collect();
        triples.sort();

        triples
    }

    #[test]
    fn merge_is_commutative_for_disjoint_inputs() {

        let root = test_dir("merge_commutative");
        let a = build_store(root.join("a"), &[("f1", "f2", 0.9), ("f2", "f3", 0.5)]);
        let b = build_store(root.join("b"), &[("f3", "f4", 0.7), ("f1", "f4", 0.2)]);

        let config = MergeConfig { frame_size: 1 };
        let ab = merge(&[a.clone(), b.clone()], &root.join("ab"), &config).unwrap();
        let ba = merge(&[b, a], &root.join("ba"), &config).unwrap();

        assert_eq!(ab.records, 4);
        assert_eq!(ba.records, 4);
        assert_eq!(content(&root.join("ab")), content(&root.join("ba")));
    }

    #[test]
    fn merge_conflict_fails_in_either_order() {

        let root = test_dir("merge_conflict");
        let a = build_store(root.join("a"), &[("f1", "f2", 0.9)]);
        let b = build_store(root.join("b"), &[("f2", "f1", 0.3)]);

        let config = MergeConfig::default();

        for (inputs, output) in [(vec![a.clone(), b.clone()], "ab"), (vec![b.clone(), a.clone()], "ba")] {
            let result = merge(&inputs, &root.join(output), &config);
            assert!(matches!(result, Err(Error::DuplicateRecord { .. })));
            assert!(!root.join(output).exists());
        }
    }

    #[test]
    fn merge_identical_duplicates_succeeds() {

        let root = test_dir("merge_identical");
        let a = build_store(root.join("a"), &[("f1", "f2", 0.9)]);
        let b = build_store(root.join("b"), &[("f1", "f2", 0.9), ("f2", "f3", 0.4)]);

        let stats = merge(&[a, b], &root.join("out"), &MergeConfig::default()).unwrap();

        assert_eq!(stats.records, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(content(&root.join("out")).len(), 2);
    }

    #[test]
    fn merge_refuses_existing_output() {

        let root = test_dir("merge_existing");
        let a = build_store(root.join("a"), &[("f1", "f2", 0.9)]);

        assert!(matches!(merge(&[a.clone()], &a, &MergeConfig::default()), Err(Error::AlreadyExists(_))));
        assert!(matches!(merge(&[], &root.join("out"), &MergeConfig::default()), Err(Error::NotFound(_))));
    }
}
