//! Frozen, read-only dense score matrix
//!
//! A matrix is a directory holding `config.yaml`, a `labels` file fixing row and column order,
//! and a `scores` file. The score file stores the `n x n` cells as runs of whole rows
//! (blocks), each compressed on its own with zstd, behind a block index so a single row can be
//! read without touching the rest of the file:
//!
//! ```text
//! | n | block_rows | block_count | (offset, length) * block_count | block 0 | block 1 | ...
//! ```
//!
//! Labels can be served from disk ([`DenseMatrix::open`]) or held in memory
//! ([`DenseMatrix::open_cached`]) for query heavy use.
use crate::catalog::{Catalog, DiskCatalog, LabelLookup};
use crate::data::{decode_score, FragmentIndex, RawScore, DEFAULT_PRECISION};
use crate::error::{Error, Key, Result};
use crate::io::{read_header_value, write_header_value};
use crate::layout;
use byteorder::{ByteOrder, BigEndian};
use log::{debug, info};
use serde::{Serialize, Deserialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MatrixConfig {
    pub directory: String,
    pub dimension: usize,
    pub single_sided: bool,
    pub precision: RawScore,
    pub compression_level: i32,
    pub block_rows: usize,
}

impl Default for MatrixConfig {

    fn default() -> Self {
        Self {
            directory: "/tmp/matrix".to_string(),
            dimension: 0,
            single_sided: false,
            precision: DEFAULT_PRECISION,
            compression_level: 3,
            block_rows: 64,
        }
    }
}

impl MatrixConfig {

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

    pub fn get_directory(&self) -> PathBuf {
        PathBuf::from(&self.directory)
    }

    pub fn get_labels_filename(&self) -> PathBuf {
        self.get_directory().join("labels")
    }

    pub fn get_scores_filename(&self) -> PathBuf {
        self.get_directory().join("scores")
    }

    pub fn get_config_filename(&self) -> PathBuf {
        self.get_directory().join("config.yaml")
    }
}

/// Block compressed cell storage.
#[derive(Debug, Clone)]
pub struct ScoreFile {
    path: PathBuf,
    pub dimension: usize,
    pub block_rows: usize,
    blocks: Vec<(u64, u64)>,
}

impl ScoreFile {

    pub fn open(path: &Path) -> Result<Self> {

        let mut fd = OpenOptions::new()
                .read(true)
                .open(path)?;

        let dimension = read_header_value(&mut fd, layout::SCORES_DIMENSION_START)?;
        let block_rows = read_header_value(&mut fd, layout::SCORES_BLOCK_ROWS_START)?;
        let block_count = read_header_value(&mut fd, layout::SCORES_BLOCK_COUNT_START)?;

        if block_rows == 0 || block_count != (dimension + block_rows - 1) / block_rows {
            return Err(Error::corrupt(path, format!("{} blocks of {} rows cannot cover {} rows", block_count, block_rows, dimension)));
        }

        let file_len = fd.metadata()?.len();
        let mut blocks: Vec<(u64, u64)> = Vec::with_capacity(block_count);

        for i in 0..block_count {
            let entry = layout::SCORES_INDEX_START + i * layout::BLOCK_ENTRY_SIZE;
            let offset = read_header_value(&mut fd, entry)? as u64;
            let length = read_header_value(&mut fd, entry + layout::BLOCK_OFFSET_SIZE)? as u64;

            if offset + length > file_len {
                return Err(Error::corrupt(path, format!("block {} extends past end of file", i)));
            }
            blocks.push((offset, length));
        }

        Ok(Self {
            path: path.to_path_buf(),
            dimension,
            block_rows,
            blocks,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_of(&self, row: usize) -> usize {
        row / self.block_rows
    }

    pub fn rows_in_block(&self, block: usize) -> usize {
        self.block_rows.min(self.dimension - block * self.block_rows)
    }

    /// Decompresses one block into `rows_in_block x n` cells.
    pub fn read_block(&self, block: usize) -> Result<Vec<RawScore>> {

        let (offset, length) = match self.blocks.get(block) {
            Some(entry) => *entry,
            None => return Err(Error::corrupt(&self.path, format!("no block {}", block))),
        };

        let mut fd = OpenOptions::new()
                .read(true)
                .open(&self.path)?;

        let mut compressed: Vec<u8> = vec![0; length as usize];
        fd.seek(SeekFrom::Start(offset))?;
        fd.read_exact(&mut compressed)?;

        let mut raw: Vec<u8> = Vec::new();
        zstd::Decoder::new(&compressed[..])?.read_to_end(&mut raw)?;

        let cells = self.rows_in_block(block) * self.dimension;
        if raw.len() != cells * layout::CELL_SIZE {
            return Err(Error::corrupt(&self.path, format!("block {} holds {} bytes, expected {}", block, raw.len(), cells * layout::CELL_SIZE)));
        }

        let mut scores = vec![0 as RawScore; cells];
        BigEndian::read_u16_into(&raw, &mut scores);

        Ok(scores)
    }

    pub fn row(&self, row: usize) -> Result<Vec<RawScore>> {

        if row >= self.dimension {
            return Err(Error::NotFound(Key::Index(row as FragmentIndex)));
        }

        let block = self.block_of(row);
        let start = (row - block * self.block_rows) * self.dimension;

        let scores = self.read_block(block)?;

        Ok(scores[start..start + self.dimension].to_vec())
    }

    /// Gathers one column with a pass over every block.
    pub fn column(&self, column: usize) -> Result<Vec<RawScore>> {

        if column >= self.dimension {
            return Err(Error::NotFound(Key::Index(column as FragmentIndex)));
        }

        let mut cells: Vec<RawScore> = Vec::with_capacity(self.dimension);
        for block in 0..self.num_blocks() {
            let scores = self.read_block(block)?;
            cells.extend(scores.chunks(self.dimension).map(|row| row[column]));
        }

        Ok(cells)
    }
}

/// Writes a score file block by block, in row order.
///
/// The block index sits between the header and the data, so its space is reserved up front
/// and filled in by [`ScoreWriter::finish`].
pub struct ScoreWriter {
    path: PathBuf,
    fd: File,
    dimension: usize,
    block_rows: usize,
    block_count: usize,
    compression_level: i32,
    offset: u64,
    blocks: Vec<(u64, u64)>,
}

impl ScoreWriter {

    pub fn create(path: &Path, dimension: usize, block_rows: usize, compression_level: i32) -> Result<Self> {

        let block_rows = block_rows.max(1);
        let block_count = (dimension + block_rows - 1) / block_rows;

        let mut fd = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(true)
                .open(path)?;

        write_header_value(&mut fd, layout::SCORES_DIMENSION_START, dimension)?;
        write_header_value(&mut fd, layout::SCORES_BLOCK_ROWS_START, block_rows)?;
        write_header_value(&mut fd, layout::SCORES_BLOCK_COUNT_START, block_count)?;

        Ok(Self {
            path: path.to_path_buf(),
            fd,
            dimension,
            block_rows,
            block_count,
            compression_level,
            offset: (layout::SCORES_INDEX_START + block_count * layout::BLOCK_ENTRY_SIZE) as u64,
            blocks: Vec::with_capacity(block_count),
        })
    }

    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    /// Rows the next block must hold.
    pub fn next_block_rows(&self) -> usize {
        let start = self.blocks.len() * self.block_rows;
        self.block_rows.min(self.dimension.saturating_sub(start))
    }

    /// Compresses and appends the next block of `rows x n` cells.
    pub fn write_block(&mut self, cells: &[RawScore]) -> Result<()> {

        if self.blocks.len() >= self.block_count || cells.len() != self.next_block_rows() * self.dimension {
            return Err(Error::corrupt(&self.path, format!("block {} of {} cells does not fit a {}x{} matrix",
                                                          self.blocks.len(), cells.len(), self.dimension, self.dimension)));
        }

        let mut raw: Vec<u8> = vec![0; cells.len() * layout::CELL_SIZE];
        BigEndian::write_u16_into(cells, &mut raw);

        let mut encoder = zstd::Encoder::new(Vec::new(), self.compression_level)?;
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;

        self.fd.seek(SeekFrom::Start(self.offset))?;
        self.fd.write_all(&compressed)?;

        self.blocks.push((self.offset, compressed.len() as u64));
        self.offset += compressed.len() as u64;

        Ok(())
    }

    /// Writes the block index once every block is in.
    pub fn finish(mut self) -> Result<ScoreFile> {

        if self.blocks.len() != self.block_count {
            return Err(Error::corrupt(&self.path, format!("{} of {} blocks written", self.blocks.len(), self.block_count)));
        }

        for (i, (offset, length)) in self.blocks.iter().enumerate() {
            let entry = layout::SCORES_INDEX_START + i * layout::BLOCK_ENTRY_SIZE;
            write_header_value(&mut self.fd, entry, *offset as usize)?;
            write_header_value(&mut self.fd, entry + layout::BLOCK_OFFSET_SIZE, *length as usize)?;
        }

        self.fd.flush()?;

        debug!("wrote {} blocks of {} rows to {}", self.block_count, self.block_rows, self.path.display());

        Ok(ScoreFile {
            path: self.path,
            dimension: self.dimension,
            block_rows: self.block_rows,
            blocks: self.blocks,
        })
    }
}

pub struct DenseMatrix {
    pub config: MatrixConfig,
    labels: Box<dyn LabelLookup + Send + Sync>,
    scores: ScoreFile,
}

impl DenseMatrix {

    /// Opens a matrix answering label lookups from disk.
    pub fn open(directory: &Path) -> Result<Self> {

        let config = Self::read_config(directory)?;
        let labels = DiskCatalog::open(&config.get_labels_filename())?;

        Self::assemble(config, Box::new(labels))
    }

    /// Opens a matrix with every label held in memory.
    pub fn open_cached(directory: &Path) -> Result<Self> {

        let config = Self::read_config(directory)?;
        let labels = Catalog::open(&config.get_labels_filename(), false)?;

        Self::assemble(config, Box::new(labels))
    }

    fn read_config(directory: &Path) -> Result<MatrixConfig> {

        let mut config = MatrixConfig::from_file(&directory.join("config.yaml"))?;
        config.directory = directory.to_string_lossy().to_string();

        Ok(config)
    }

    fn assemble(config: MatrixConfig, labels: Box<dyn LabelLookup + Send + Sync>) -> Result<Self> {

        let scores = ScoreFile::open(&config.get_scores_filename())?;

        if labels.len() != scores.dimension || config.dimension != scores.dimension {
            return Err(Error::DimensionMismatch {
                labels: labels.len(),
                rows: scores.dimension,
                columns: config.dimension,
            });
        }

        info!("opened {}x{} matrix at {}", scores.dimension, scores.dimension, config.directory);

        Ok(Self {
            config,
            labels,
            scores,
        })
    }

    pub fn dimension(&self) -> usize {
        self.scores.dimension
    }

    pub fn is_single_sided(&self) -> bool {
        self.config.single_sided
    }

    pub fn labels(&self) -> &dyn LabelLookup {
        self.labels.as_ref()
    }

    pub fn scores(&self) -> &ScoreFile {
        &self.scores
    }

    pub fn index_of(&self, identifier: &str) -> Result<FragmentIndex> {

        match self.labels.index_of(identifier)? {
            Some(index) => Ok(index),
            None => Err(Error::NotFound(Key::from(identifier))),
        }
    }

    pub fn label_of(&self, index: FragmentIndex) -> Result<String> {
        self.labels.label_of(index)
    }

    pub fn decode(&self, raw: RawScore) -> f64 {
        decode_score(raw, self.config.precision)
    }

    /// Raw scores of every fragment against `index`. Single sided matrices combine the row with
    /// the column so each pair is seen whichever half it was written to.
    pub fn neighbours(&self, index: FragmentIndex) -> Result<Vec<RawScore>> {

        let mut cells = self.scores.row(index as usize)?;

        if self.config.single_sided {
            let column = self.scores.column(index as usize)?;
            for (cell, mirrored) in cells.iter_mut().zip(column.into_iter()) {
                *cell = (*cell).max(mirrored);
            }
        }

        Ok(cells)
    }

    /// Score between two identifiers, 0.0 for pairs never scored.
    pub fn get(&self, a: &str, b: &str) -> Result<f64> {

        let (i, j) = (self.index_of(a)? as usize, self.index_of(b)? as usize);

        let mut raw = self.scores.row(i)?[j];
        if raw == 0 && self.config.single_sided {
            raw = self.scores.row(j)?[i];
        }

        Ok(self.decode(raw))
    }

    /// Streams the non-zero, off-diagonal cells of one half (or both) of the matrix, a block of
    /// rows at a time.
    pub fn cells(&self, triangle: Triangle) -> Cells<'_> {

        Cells {
            scores: &self.scores,
            triangle,
            block: 0,
            current: Vec::new(),
            row: 0,
            column: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Triangle {
    /// Cells with `row < column`
    Upper,
    /// Cells with `row > column`
    Lower,
    Both,
}

impl Triangle {

    fn contains(&self, row: usize, column: usize) -> bool {
        match self {
            Triangle::Upper => row < column,
            Triangle::Lower => row > column,
            Triangle::Both => row != column,
        }
    }
}

pub struct Cells<'a> {
    scores: &'a ScoreFile,
    triangle: Triangle,
    block: usize,
    current: Vec<RawScore>,
    row: usize,
    column: usize,
}

impl<'a> Iterator for Cells<'a> {
    type Item = Result<(FragmentIndex, FragmentIndex, RawScore)>;

    fn next(&mut self) -> Option<Self::Item> {

        let n = self.scores.dimension;

        loop {
            //row and column index into the decompressed current block
            if self.row * n + self.column >= self.current.len() {

                if self.block >= self.scores.num_blocks() {
                    return None;
                }

                match self.scores.read_block(self.block) {
                    Ok(cells) => self.current = cells,
                    Err(e) => {
                        self.block = self.scores.num_blocks();
                        return Some(Err(e));
                    }
                }
                self.block += 1;
                self.row = 0;
                self.column = 0;
                continue;
            }

            let (row, column) = (self.row, self.column);
            let raw = self.current[row * n + column];

            self.column += 1;
            if self.column == n {
                self.column = 0;
                self.row += 1;
            }

            let global_row = (self.block - 1) * self.scores.block_rows + row;
            if raw != 0 && self.triangle.contains(global_row, column) {
                return Some(Ok((global_row as FragmentIndex, column as FragmentIndex, raw)));
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::test_util::test_dir;

    fn build_matrix(directory: &Path, labels: &[&str], cells: &[(usize, usize, RawScore)], block_rows: usize) -> DenseMatrix {

        let n = labels.len();
        let config = MatrixConfig {
            directory: directory.to_string_lossy().to_string(),
            dimension: n,
            block_rows,
            ..MatrixConfig::default()
        };

        let labels: Vec<String> = labels.iter().map(|x| x.to_string()).collect();
        Catalog::write_labels(&config.get_labels_filename(), &labels).unwrap();

        let mut dense = vec![0 as RawScore; n * n];
        for (i, j, score) in cells {
            dense[i * n + j] = *score;
        }

        let mut writer = ScoreWriter::create(&config.get_scores_filename(), n, block_rows, 3).unwrap();
        for block in dense.chunks(block_rows * n) {
            writer.write_block(block).unwrap();
        }
        writer.finish().unwrap();
        config.to_file(&config.get_config_filename()).unwrap();

        DenseMatrix::open(directory).unwrap()
    }

    #[test]
    fn rows_and_columns_across_blocks() {

        let directory = test_dir("matrix_blocks");
        let labels = ["a", "b", "c", "d", "e"];
        let cells: Vec<(usize, usize, RawScore)> = (0..5)
            .flat_map(|i| (0..5).map(move |j| (i, j, (i * 10 + j) as RawScore)))
            .collect();

        let matrix = build_matrix(&directory, &labels, &cells, 2);

        assert_eq!(matrix.scores().num_blocks(), 3);
        assert_eq!(matrix.scores().row(4).unwrap(), vec![40, 41, 42, 43, 44]);
        assert_eq!(matrix.scores().column(1).unwrap(), vec![1, 11, 21, 31, 41]);
        assert!(matches!(matrix.scores().row(5), Err(Error::NotFound(Key::Index(5)))));
    }

    #[test]
    fn cells_by_triangle() {

        let directory = test_dir("matrix_cells");
        let cells = [(0, 0, 9), (0, 2, 3), (1, 0, 4), (2, 1, 5), (1, 2, 6)];

        let matrix = build_matrix(&directory, &["a", "b", "c"], &cells, 2);

        let upper: Vec<(u32, u32, RawScore)> = matrix.cells(Triangle::Upper).map(|x| x.unwrap()).collect();
        let lower: Vec<(u32, u32, RawScore)> = matrix.cells(Triangle::Lower).map(|x| x.unwrap()).collect();

        assert_eq!(upper, vec![(0, 2, 3), (1, 2, 6)]);
        assert_eq!(lower, vec![(1, 0, 4), (2, 1, 5)]);
        assert_eq!(matrix.cells(Triangle::Both).count(), 4);
    }

    #[test]
    fn cached_and_disk_labels_agree() {

        let directory = test_dir("matrix_labels");
        build_matrix(&directory, &["x", "y", "z"], &[(0, 2, 100)], 64);

        let on_disk = DenseMatrix::open(&directory).unwrap();
        let cached = DenseMatrix::open_cached(&directory).unwrap();

        for matrix in [on_disk, cached] {
            assert_eq!(matrix.index_of("z").unwrap(), 2);
            assert_eq!(matrix.label_of(1).unwrap(), "y");
            assert!(matches!(matrix.index_of("w"), Err(Error::NotFound(Key::Label(_)))));
        }
    }

    #[test]
    fn single_sided_reads_either_half() {

        let directory = test_dir("matrix_single_sided");
        let labels = ["a", "b", "c"];
        let cells = [(0, 1, 39321), (2, 0, 32767)];

        build_matrix(&directory, &labels, &cells, 64);

        let mut config = MatrixConfig::from_file(&directory.join("config.yaml")).unwrap();
        config.single_sided = true;
        config.to_file(&directory.join("config.yaml")).unwrap();

        let matrix = DenseMatrix::open(&directory).unwrap();

        assert_eq!(matrix.get("b", "a").unwrap(), 0.6);
        assert_eq!(matrix.neighbours(0).unwrap(), vec![0, 39321, 32767]);
    }

    #[test]
    fn label_count_mismatch_is_detected() {

        let directory = test_dir("matrix_mismatch");
        build_matrix(&directory, &["a", "b", "c"], &[], 64);

        let labels: Vec<String> = vec!["a".to_string(), "b".to_string()];
        Catalog::write_labels(&directory.join("labels"), &labels).unwrap();

        assert!(matches!(DenseMatrix::open(&directory),
                         Err(Error::DimensionMismatch { labels: 2, rows: 3, columns: 3 })));
    }

    #[test]
    fn truncated_scores_are_corrupt() {

        let directory = test_dir("matrix_truncated");
        build_matrix(&directory, &["a", "b", "c"], &[(0, 1, 5)], 1);

        let scores = directory.join("scores");
        let len = fs::metadata(&scores).unwrap().len();
        OpenOptions::new().write(true).open(&scores).unwrap().set_len(len - 4).unwrap();

        assert!(matches!(DenseMatrix::open(&directory), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn writer_rejects_misshapen_blocks() {

        let directory = test_dir("matrix_writer");
        let filename = directory.join("scores");

        let mut writer = ScoreWriter::create(&filename, 3, 2, 3).unwrap();
        assert!(writer.write_block(&[1, 2, 3]).is_err());

        writer.write_block(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(writer.next_block_rows(), 1);
        writer.write_block(&[7, 8, 9]).unwrap();
        assert!(writer.write_block(&[7, 8, 9]).is_err());

        let scores = writer.finish().unwrap();
        assert_eq!(scores.row(2).unwrap(), vec![7, 8, 9]);
        assert_eq!(ScoreFile::open(&filename).unwrap().column(0).unwrap(), vec![1, 4, 7]);
    }
}
