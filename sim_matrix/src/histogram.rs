//! Score distribution of a pair store or a frozen matrix, gathered in one streaming pass.
//!
//! Scores are bucketed on their four decimal digit value, so a bucket width of 0.0001 gives
//! one bucket per distinct score. Raw binning counts the stored integers instead.
use crate::data::{decode_score, RawScore};
use crate::error::Result;
use crate::matrix::{DenseMatrix, Triangle};
use crate::pairs::PairStore;
use log::{info, warn};
use std::collections::BTreeMap;
use std::io::Write;

const SCORE_UNITS: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Binning {
    /// One bucket per stored integer score
    Raw,
    /// Fixed width buckets, in units of 0.0001
    Width(u32),
}

impl Binning {

    pub fn width(bucket: f64) -> Self {
        Binning::Width(((bucket * SCORE_UNITS).round() as u32).max(1))
    }
}

#[derive(Debug, Clone)]
pub struct Histogram {
    binning: Binning,
    precision: RawScore,
    counts: BTreeMap<u32, usize>,
    total: usize,
    cutoff: Option<f64>,
    below: usize,
}

impl Histogram {

    pub fn new(binning: Binning, precision: RawScore) -> Self {
        Self {
            binning,
            precision,
            counts: BTreeMap::new(),
            total: 0,
            cutoff: None,
            below: 0,
        }
    }

    pub fn add(&mut self, raw: RawScore) {

        let score = decode_score(raw, self.precision);

        let key = match self.binning {
            Binning::Raw => raw as u32,
            Binning::Width(width) => {
                let units = (score * SCORE_UNITS).round() as u32;
                units / width * width
            }
        };

        *self.counts.entry(key).or_insert(0) += 1;
        self.total += 1;

        if let Some(cutoff) = self.cutoff {
            if score < cutoff {
                self.below += 1;
            }
        }
    }

    /// Every stored pair, read `frame_size` records at a time.
    pub fn from_store(store: &PairStore, frame_size: usize, binning: Binning, cutoff: Option<f64>) -> Result<Self> {

        let mut histogram = Self::new(binning, store.config.precision);
        histogram.cutoff = cutoff;

        for frame in store.iterate(frame_size)? {
            for record in frame? {
                histogram.add(record.score);
            }
        }

        histogram.log_summary();

        Ok(histogram)
    }

    /// Non-zero cells of one half of a matrix, or of both halves when single sided.
    pub fn from_matrix(matrix: &DenseMatrix, lower_triangle: bool, binning: Binning, cutoff: Option<f64>) -> Result<Self> {

        let mut histogram = Self::new(binning, matrix.config.precision);
        histogram.cutoff = cutoff;

        let triangle = match (matrix.is_single_sided(), lower_triangle) {
            (true, _) => Triangle::Both,
            (false, true) => Triangle::Lower,
            (false, false) => Triangle::Upper,
        };

        for cell in matrix.cells(triangle) {
            let (_, _, raw) = cell?;
            histogram.add(raw);
        }

        histogram.log_summary();

        Ok(histogram)
    }

    fn log_summary(&self) {

        info!("counted {} scores in {} buckets", self.total, self.counts.len());

        if let (Some(cutoff), true) = (self.cutoff, self.below > 0) {
            warn!("{} scores fall below cutoff {}", self.below, cutoff);
        }
    }

    /// Lower bound of each non-empty bucket with its count, in ascending order.
    pub fn buckets(&self) -> Vec<(f64, usize)> {

        self.counts.iter()
            .map(|(key, count)| match self.binning {
                Binning::Raw => (*key as f64, *count),
                Binning::Width(_) => (*key as f64 / SCORE_UNITS, *count),
            })
            .collect()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Scores strictly below the cutoff given when counting.
    pub fn count_below(&self) -> usize {
        self.below
    }

    pub fn write_tsv<W: Write>(&self, writer: &mut W) -> Result<()> {

        writeln!(writer, "score\tcount")?;
        for (score, count) in self.buckets() {
            writeln!(writer, "{}\t{}", score, count)?;
        }
        writer.flush()?;

        Ok(())
    }
}
