//! Converts a pair store into a dense matrix and back
//!
//! Freezing fixes the label order and dimension from the store's catalog before any score is
//! written. Rows are then built one band at a time: a band is a run of whole score blocks sized
//! to `memory_budget` cells, filled by a pass over the pair records (each record also lands in
//! its mirrored cell unless the matrix is single sided) and compressed straight into the score
//! file. Diagonal cells no record wrote are set to the identity score.
use crate::catalog::Catalog;
use crate::data::{FragmentIndex, PairRecord, RawScore};
use crate::error::{Error, Key, Result};
use crate::matrix::{DenseMatrix, MatrixConfig, ScoreWriter, Triangle};
use crate::pairs::{PairStore, StoreConfig};
use log::{info, warn};
use serde::{Serialize, Deserialize};
use std::fs;
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FreezeConfig {
    pub frame_size: usize,
    /// Matrix cells held in memory at once, at least one block of rows
    pub memory_budget: usize,
    pub single_sided: bool,
    pub compression_level: i32,
    pub block_rows: usize,
    /// Copy only the first `limit` pair records
    pub limit: Option<usize>,
}

impl Default for FreezeConfig {

    fn default() -> Self {
        Self {
            frame_size: 100_000,
            memory_budget: 64 * 1024 * 1024,
            single_sided: false,
            compression_level: 3,
            block_rows: 64,
            limit: None,
        }
    }
}

impl FreezeConfig {

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

fn check_index(index: FragmentIndex, dimension: usize) -> Result<usize> {

    match (index as usize) < dimension {
        true => Ok(index as usize),
        false => Err(Error::UnknownIdentifier(Key::Index(index))),
    }
}

/// Rows `start..start + rows` of the matrix under construction.
struct Band {
    start: usize,
    rows: usize,
    dimension: usize,
    cells: Vec<RawScore>,
    //diagonal cells written by a record
    diagonal: Vec<bool>,
}

impl Band {

    fn new(start: usize, rows: usize, dimension: usize) -> Self {
        Self {
            start,
            rows,
            dimension,
            cells: vec![0; rows * dimension],
            diagonal: vec![false; rows],
        }
    }

    fn set(&mut self, row: usize, column: usize, score: RawScore) {

        if row < self.start || row >= self.start + self.rows {
            return;
        }

        let local = row - self.start;
        self.cells[local * self.dimension + column] = score;

        if row == column {
            self.diagonal[local] = true;
        }
    }

    fn add_frame(&mut self, frame: &[PairRecord], single_sided: bool) -> Result<()> {

        for record in frame.iter() {

            let a = check_index(record.a, self.dimension)?;
            let b = check_index(record.b, self.dimension)?;

            self.set(a, b, record.score);
            if !single_sided {
                self.set(b, a, record.score);
            }
        }

        Ok(())
    }

    fn default_diagonal(&mut self, identity: RawScore) {

        for local in 0..self.rows {
            if !self.diagonal[local] {
                self.cells[local * self.dimension + self.start + local] = identity;
            }
        }
    }
}

/// Rows per band: whole blocks within the budget, never less than one block.
fn band_rows(dimension: usize, block_rows: usize, memory_budget: usize) -> usize {

    let blocks = match dimension {
        0 => 1,
        _ => (memory_budget / (dimension * block_rows)).max(1),
    };

    blocks * block_rows
}

fn freeze_into(store: &PairStore, matrix_config: &MatrixConfig, config: &FreezeConfig) -> Result<()> {

    let labels = store.catalog().labels();
    let dimension = labels.len();

    Catalog::write_labels(&matrix_config.get_labels_filename(), labels)?;

    let mut writer = ScoreWriter::create(&matrix_config.get_scores_filename(), dimension,
                                         matrix_config.block_rows, matrix_config.compression_level)?;

    let rows_per_band = band_rows(dimension, writer.block_rows(), config.memory_budget);
    let passes = (dimension + rows_per_band - 1) / rows_per_band;

    for (pass, start) in (0..dimension).step_by(rows_per_band).enumerate() {

        let mut band = Band::new(start, rows_per_band.min(dimension - start), dimension);

        for frame in store.iterate_limited(config.frame_size, config.limit)? {
            band.add_frame(&frame?, config.single_sided)?;
        }

        band.default_diagonal(matrix_config.precision);

        for block in band.cells.chunks(writer.block_rows() * dimension) {
            writer.write_block(block)?;
        }

        info!("froze rows {}..{} of {} (pass {} of {})", start, start + band.rows, dimension, pass + 1, passes);
    }

    writer.finish()?;

    matrix_config.to_file(&matrix_config.get_config_filename())
}

/// Freezes `store` into a new dense matrix directory. A failed freeze leaves nothing behind.
pub fn freeze(store: &PairStore, directory: &Path, config: &FreezeConfig) -> Result<DenseMatrix> {

    if directory.exists() {
        return Err(Error::AlreadyExists(directory.to_path_buf()));
    }

    fs::create_dir_all(directory)?;

    let matrix_config = MatrixConfig {
        directory: directory.to_string_lossy().to_string(),
        dimension: store.catalog().len(),
        single_sided: config.single_sided,
        precision: store.config.precision,
        compression_level: config.compression_level,
        block_rows: config.block_rows.max(1),
    };

    if let Err(e) = freeze_into(store, &matrix_config, config) {
        warn!("freeze into {} failed, removing partial output", directory.display());
        let _ = fs::remove_dir_all(directory);
        return Err(e);
    }

    DenseMatrix::open_cached(directory)
}

/// Turns a matrix back into a pair store holding every non-zero, off-diagonal pair once.
pub fn thaw(matrix: &DenseMatrix, config: StoreConfig) -> Result<PairStore> {

    let mut config = config;
    config.precision = matrix.config.precision;

    let mut store = PairStore::create_with_config(config)?;

    let labels = matrix.labels().all_labels()?;
    let triangle = match matrix.is_single_sided() {
        true => Triangle::Both,
        false => Triangle::Upper,
    };

    let rows = matrix.cells(triangle).map(|cell| {
        cell.map(|(a, b, score)| (labels[a as usize].clone(), labels[b as usize].clone(), score))
    });

    store.import_quantised(rows)?;

    Ok(store)
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::test_util::test_dir;
    use crate::data::RawTriple;
    use crate::error::Result;
    use assert_approx_eq::assert_approx_eq;

    fn build_store(directory: &Path, triples: &[(&str, &str, f64)], frame_size: usize) -> PairStore {

        let mut config = StoreConfig::with_directory(directory);
        config.frame_size = frame_size;

        let mut store = PairStore::create_with_config(config).unwrap();
        let rows: Vec<Result<RawTriple>> = triples.iter().map(|(a, b, s)| Ok(RawTriple::new(*a, *b, *s))).collect();
        store.import(rows, false).unwrap();

        store
    }

    fn all_rows(matrix: &DenseMatrix) -> Vec<Vec<u16>> {
        (0..matrix.dimension()).map(|i| matrix.scores().row(i).unwrap()).collect()
    }

    #[test]
    fn freeze_three_fragments() {

        let root = test_dir("freeze_three");
        let store = build_store(&root.join("pairs"), &[("f1", "f2", 0.9), ("f2", "f3", 0.5)], 10);

        let config = FreezeConfig { frame_size: 10, ..FreezeConfig::default() };
        let matrix = freeze(&store, &root.join("matrix"), &config).unwrap();

        assert_eq!(matrix.dimension(), 3);
        assert_approx_eq!(matrix.get("f1", "f2").unwrap(), 0.9);
        assert_approx_eq!(matrix.get("f2", "f1").unwrap(), 0.9);
        assert_approx_eq!(matrix.get("f3", "f2").unwrap(), 0.5);
        assert_eq!(matrix.get("f1", "f3").unwrap(), 0.0);

        for label in ["f1", "f2", "f3"] {
            assert_eq!(matrix.get(label, label).unwrap(), 1.0);
        }

        let mut files: Vec<String> = fs::read_dir(root.join("matrix")).unwrap()
            .map(|x| x.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        files.sort();
        assert_eq!(files, vec!["config.yaml", "labels", "scores"]);
    }

    #[test]
    fn freeze_is_symmetric_with_small_cache() {

        let root = test_dir("freeze_symmetric");

        let labels: Vec<String> = (0..40).map(|i| format!("frag{:02}", i)).collect();
        let triples: Vec<(&str, &str, f64)> = (0..40)
            .flat_map(|i| (0..40).map(move |j| (i, j)))
            .filter(|(i, j)| i < j && (i * 7 + j * 3) % 5 == 0)
            .map(|(i, j)| (labels[i].as_str(), labels[j].as_str(), ((i + j) % 100) as f64 / 100.0))
            .collect();

        let store = build_store(&root.join("pairs"), &triples, 13);

        //a single block per pass
        let config = FreezeConfig { frame_size: 11, memory_budget: 1, block_rows: 7, ..FreezeConfig::default() };
        let matrix = freeze(&store, &root.join("matrix"), &config).unwrap();

        let rows = all_rows(&matrix);
        for i in 0..rows.len() {
            for j in 0..rows.len() {
                assert_eq!(rows[i][j], rows[j][i]);
            }
        }
    }

    #[test]
    fn freeze_twice_is_identical() {

        let root = test_dir("freeze_idempotent");
        let store = build_store(&root.join("pairs"), &[("a", "b", 0.3), ("c", "b", 0.8), ("a", "d", 0.45)], 2);

        let config = FreezeConfig { frame_size: 2, ..FreezeConfig::default() };
        freeze(&store, &root.join("first"), &config).unwrap();
        freeze(&store, &root.join("second"), &config).unwrap();

        for name in ["labels", "scores"] {
            let first = fs::read(root.join("first").join(name)).unwrap();
            let second = fs::read(root.join("second").join(name)).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn freeze_single_sided_and_limit() {

        let root = test_dir("freeze_single_sided");
        let store = build_store(&root.join("pairs"), &[("a", "b", 0.9), ("b", "c", 0.6), ("c", "d", 0.7)], 10);

        let config = FreezeConfig { single_sided: true, limit: Some(2), ..FreezeConfig::default() };
        let matrix = freeze(&store, &root.join("matrix"), &config).unwrap();

        let rows = all_rows(&matrix);
        assert_ne!(rows[0][1], 0);
        assert_eq!(rows[1][0], 0);

        //beyond the limit
        assert_eq!(matrix.get("c", "d").unwrap(), 0.0);
        assert_approx_eq!(matrix.get("b", "a").unwrap(), 0.9);
    }

    #[test]
    fn freeze_refuses_existing_output() {

        let root = test_dir("freeze_existing");
        let store = build_store(&root.join("pairs"), &[("a", "b", 0.9)], 10);

        assert!(matches!(freeze(&store, &root.join("pairs"), &FreezeConfig::default()), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn thaw_returns_stored_pairs() {

        let root = test_dir("freeze_thaw");
        let store = build_store(&root.join("pairs"), &[("b", "a", 0.5877), ("b", "c", 0.4633)], 10);

        let matrix = freeze(&store, &root.join("matrix"), &FreezeConfig::default()).unwrap();
        let thawed = thaw(&matrix, StoreConfig::with_directory(root.join("thawed"))).unwrap();

        let mut triples: Vec<RawTriple> = thawed.triples(10).unwrap().map(|x| x.unwrap()).collect();
        triples.sort_by(|x, y| (&x.a, &x.b).cmp(&(&y.a, &y.b)));

        assert_eq!(triples, vec![RawTriple::new("a", "b", 0.5877), RawTriple::new("b", "c", 0.4633)]);

        //refreezing gives back the same scores
        let refrozen = freeze(&thawed, &root.join("refrozen"), &FreezeConfig::default()).unwrap();
        assert_eq!(refrozen.get("a", "b").unwrap(), matrix.get("a", "b").unwrap());
    }

    #[test]
    fn explicit_diagonal_is_kept() {

        let root = test_dir("freeze_diagonal");
        let store = build_store(&root.join("pairs"), &[("a", "a", 0.0), ("a", "b", 0.5), ("b", "b", 0.25)], 10);

        let matrix = freeze(&store, &root.join("matrix"), &FreezeConfig::default()).unwrap();

        assert_eq!(matrix.get("a", "a").unwrap(), 0.0);
        assert_approx_eq!(matrix.get("b", "b").unwrap(), 0.25);
        assert!(matches!(matrix.get("c", "c"), Err(Error::NotFound(_))));
    }

    #[test]
    fn band_size_does_not_change_output() {

        let root = test_dir("freeze_bands");

        let labels: Vec<String> = (0..23).map(|i| format!("frag{:02}", i)).collect();
        let triples: Vec<(&str, &str, f64)> = (0..23)
            .flat_map(|i| (0..23).map(move |j| (i, j)))
            .filter(|(i, j)| i < j && (i + 2 * j) % 3 == 0)
            .map(|(i, j)| (labels[i].as_str(), labels[j].as_str(), ((i * j) % 97) as f64 / 97.0))
            .collect();

        let store = build_store(&root.join("pairs"), &triples, 5);

        //one block of four rows per pass against everything in one pass
        let narrow = FreezeConfig { frame_size: 5, memory_budget: 1, block_rows: 4, ..FreezeConfig::default() };
        let wide = FreezeConfig { block_rows: 4, ..FreezeConfig::default() };

        freeze(&store, &root.join("narrow"), &narrow).unwrap();
        freeze(&store, &root.join("wide"), &wide).unwrap();

        assert_eq!(fs::read(root.join("narrow").join("scores")).unwrap(), fs::read(root.join("wide").join("scores")).unwrap());
        assert_eq!(band_rows(23, 4, 1), 4);
        assert_eq!(band_rows(23, 4, 23 * 9), 8);
    }
}
