//! Sparse, append-only store of scored fragment pairs
//!
//! A store is a directory holding `config.yaml`, a `labels` file (the identifier catalog) and a
//! `pairs` file of paged `(a, b, score)` records. Records are only ever appended: by importing
//! raw triples or by merging another store. Each unordered pair is stored once; a pair arriving
//! again with the same score is skipped, with a different score it is a [`Error::DuplicateRecord`].
//!
//! Orientation is canonical by identifier: a pair is stored as `(a, b)` with `a <= b` unless the
//! store is a full matrix or the import was told to drop the upper triangle instead.
use crate::catalog::Catalog;
use crate::data::{decode_score, encode_score, FragmentIndex, PairRecord, RawScore, RawTriple, DEFAULT_PRECISION};
use crate::dedup::Staging;
use crate::error::{Error, Key, Result};
use crate::io::{PairFrames, PairPager};
use crate::query::ExportFilter;
use log::{info, warn};
use serde::{Serialize, Deserialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub directory: String,
    pub precision: RawScore,
    pub full_matrix: bool,
    pub page_length: usize,
    pub frame_size: usize,
    pub cache_pages: Option<usize>,
}

impl Default for StoreConfig {

    fn default() -> Self {
        Self {
            directory: "/tmp/pairs".to_string(),
            precision: DEFAULT_PRECISION,
            full_matrix: false,
            page_length: 4096,
            frame_size: 100_000,
            cache_pages: Some(1024),
        }
    }
}

impl StoreConfig {

    pub fn with_directory<P: AsRef<Path>>(directory: P) -> Self {

        let mut config = Self::default();
        config.directory = directory.as_ref().to_string_lossy().to_string();
        config
    }

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

    pub fn get_pairs_filename(&self) -> PathBuf {
        self.get_directory().join("pairs")
    }

    pub fn get_config_filename(&self) -> PathBuf {
        self.get_directory().join("config.yaml")
    }

    pub fn get_staging_directory(&self) -> PathBuf {
        self.get_directory().join("staging")
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImportStats {
    pub imported: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

fn duplicate_error(record: &PairRecord, existing: RawScore, catalog: &Catalog, precision: RawScore) -> Error {

    let label = |index: FragmentIndex| match catalog.resolve(index) {
        Ok(label) => label.to_string(),
        Err(_) => Key::Index(index).to_string(),
    };

    Error::DuplicateRecord {
        a: label(record.a),
        b: label(record.b),
        existing: decode_score(existing, precision),
        incoming: decode_score(record.score, precision),
    }
}

#[derive(Debug)]
pub struct PairStore {
    pub config: StoreConfig,
    catalog: Catalog,
    pager: PairPager,
}

impl PairStore {

    pub fn create_with_config(config: StoreConfig) -> Result<Self> {

        let directory = config.get_directory();

        if directory.exists() {
            return Err(Error::AlreadyExists(directory));
        }

        fs::create_dir_all(&directory)?;

        let catalog = Catalog::create(&config.get_labels_filename())?;
        let pager = PairPager::new(&config.get_pairs_filename(), config.page_length, true, config.cache_pages)?;
        config.to_file(&config.get_config_filename())?;

        Ok(Self {
            config,
            catalog,
            pager,
        })
    }

    pub fn force_create_with_config(config: StoreConfig) -> Result<Self> {

        let directory = config.get_directory();
        if directory.exists() {
            fs::remove_dir_all(&directory)?;
        }

        Self::create_with_config(config)
    }

    pub fn open(directory: &Path, writable: bool) -> Result<Self> {

        let mut config = StoreConfig::from_file(&directory.join("config.yaml"))?;
        config.directory = directory.to_string_lossy().to_string();

        let catalog = Catalog::open(&config.get_labels_filename(), writable)?;
        let pager = PairPager::new(&config.get_pairs_filename(), config.page_length, false, config.cache_pages)?;

        Ok(Self {
            config,
            catalog,
            pager,
        })
    }

    pub fn directory(&self) -> PathBuf {
        self.config.get_directory()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn len(&self) -> usize {
        self.pager.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pager.is_empty()
    }

    fn check_writable(&self) -> Result<()> {

        match self.catalog.is_writable() {
            true => Ok(()),
            false => Err(Error::ReadOnly(self.directory())),
        }
    }

    /// Appends raw `(identifier_a, identifier_b, score)` rows.
    ///
    /// With `ignore_upper_triangle` rows whose first identifier sorts after the second are
    /// dropped, for inputs that list every pair in both orientations. Otherwise such rows are
    /// flipped into canonical orientation (unless the store is a full matrix).
    pub fn import<I>(&mut self, rows: I, ignore_upper_triangle: bool) -> Result<ImportStats>
    where I: IntoIterator<Item = Result<RawTriple>> {

        self.check_writable()?;

        let precision = self.config.precision;
        let full_matrix = self.config.full_matrix;
        let mut skipped = 0;

        let quantised = rows.into_iter().filter_map(|row| {

            let row = match row.and_then(|row| row.validate().map(|_| row)) {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            };

            let row = match (ignore_upper_triangle, row.is_upper_triangle()) {
                (true, true) => {
                    skipped += 1;
                    return None;
                },
                (false, true) if !full_matrix => row.swapped(),
                _ => row,
            };

            Some(encode_score(row.score, precision).map(|score| (row.a, row.b, score)))
        });

        let mut stats = self.append(quantised)?;
        stats.skipped = skipped;

        if skipped > 0 {
            warn!("skipped {} upper triangle rows", skipped);
        }

        info!("imported {} pairs into {} ({} duplicates, {} skipped)",
              stats.imported, self.config.directory, stats.duplicates, stats.skipped);

        Ok(stats)
    }

    /// Appends rows whose scores are already quantised at this store's precision.
    pub fn import_quantised<I>(&mut self, rows: I) -> Result<ImportStats>
    where I: IntoIterator<Item = Result<(String, String, RawScore)>> {

        self.check_writable()?;

        let full_matrix = self.config.full_matrix;
        let oriented = rows.into_iter().map(|row| {
            row.map(|(a, b, score)| match !full_matrix && a > b {
                true => (b, a, score),
                false => (a, b, score),
            })
        });

        let stats = self.append(oriented)?;

        info!("imported {} quantised pairs into {}", stats.imported, self.config.directory);

        Ok(stats)
    }

    fn staging(&self) -> Result<Staging> {

        Staging::create(&self.config.get_staging_directory(), self.config.page_length,
                        self.config.cache_pages, self.config.frame_size, self.config.full_matrix)
    }

    /// Runs `stage` to fill a fresh staging area, then appends the staged records not yet
    /// stored. Nothing is appended when staging fails or a record conflicts.
    fn with_staging<F>(&mut self, stage: F) -> Result<ImportStats>
    where F: FnOnce(&mut Self, &mut Staging) -> Result<()> {

        let mut staging = self.staging()?;

        let result = stage(&mut *self, &mut staging).and_then(|_| self.commit(&mut staging));
        let removed = staging.remove();

        let stats = result?;
        removed?;

        Ok(stats)
    }

    fn append<I>(&mut self, rows: I) -> Result<ImportStats>
    where I: Iterator<Item = Result<(String, String, RawScore)>> {
        self.with_staging(|store, staging| store.stage_rows(staging, rows))
    }

    fn stage_rows<I>(&mut self, staging: &mut Staging, rows: I) -> Result<()>
    where I: Iterator<Item = Result<(String, String, RawScore)>> {

        for row in rows {
            let (a, b, score) = row?;
            let a = self.catalog.lookup(&a)?;
            let b = self.catalog.lookup(&b)?;
            staging.push(&PairRecord::new(a, b, score))?;
        }

        Ok(())
    }

    /// Checks the staged records against everything already stored and among themselves, then
    /// appends the ones not yet present.
    fn commit(&mut self, staging: &mut Staging) -> Result<ImportStats> {

        let mut stats = ImportStats::default();

        if staging.is_empty() {
            return Ok(stats);
        }

        self.pager.flush()?;

        let catalog = &self.catalog;
        let precision = self.config.precision;
        stats.duplicates = staging.check(&self.pager, |record, existing| duplicate_error(record, existing, catalog, precision))?;

        for record in staging.accepted()? {
            self.pager.append(&record?)?;
            stats.imported += 1;
        }

        self.flush()?;

        Ok(stats)
    }

    /// Streams stored records in frames of `chunk_size`, from the first record.
    pub fn iterate(&self, chunk_size: usize) -> Result<PairFrames> {
        self.pager.frames(chunk_size, None)
    }

    /// Like [`PairStore::iterate`] but stops after `limit` records.
    pub fn iterate_limited(&self, chunk_size: usize, limit: Option<usize>) -> Result<PairFrames> {
        self.pager.frames(chunk_size, limit)
    }

    /// Streams stored pairs resolved to identifiers, keeping the stored scores.
    pub fn labelled(&self, chunk_size: usize) -> Result<Labelled<'_>> {

        Ok(Labelled {
            frames: self.iterate(chunk_size)?,
            current: Vec::new().into_iter(),
            catalog: &self.catalog,
        })
    }

    /// Streams stored pairs resolved to identifiers and fractional scores.
    pub fn triples(&self, chunk_size: usize) -> Result<impl Iterator<Item = Result<RawTriple>> + '_> {

        let precision = self.config.precision;
        let rows = self.labelled(chunk_size)?
            .map(move |row| row.map(|(a, b, score)| RawTriple::new(a, b, decode_score(score, precision))));

        Ok(rows)
    }

    /// Appends every record of `other`, re-keyed through identifiers into this store's index
    /// space. Conflicting duplicates abort with [`Error::DuplicateRecord`].
    pub fn merge_from(&mut self, other: &PairStore) -> Result<ImportStats> {

        self.check_writable()?;

        if other.config.precision != self.config.precision {
            return Err(Error::PrecisionMismatch {
                expected: self.config.precision,
                found: other.config.precision,
            });
        }

        let mut remap: Vec<FragmentIndex> = Vec::with_capacity(other.catalog.len());
        for label in other.catalog.labels().iter() {
            remap.push(self.catalog.lookup(label)?);
        }

        let translate = |index: FragmentIndex| match remap.get(index as usize) {
            Some(x) => Ok(*x),
            None => Err(Error::UnknownIdentifier(Key::Index(index))),
        };

        let stats = self.with_staging(|store, staging| {

            for frame in other.iterate(store.config.frame_size)? {
                for record in frame? {
                    staging.push(&PairRecord::new(translate(record.a)?, translate(record.b)?, record.score))?;
                }
            }

            Ok(())
        })?;

        info!("merged {} pairs from {} into {} ({} duplicates)",
              stats.imported, other.config.directory, self.config.directory, stats.duplicates);

        Ok(stats)
    }

    /// Copies the pairs passing `filter` into a new store described by `config`. Stored scores
    /// are copied as they are, so the copy never disagrees with its source.
    pub fn filter_into(&self, config: StoreConfig, filter: &ExportFilter) -> Result<PairStore> {

        let mut config = config;
        config.precision = self.config.precision;

        let mut output = PairStore::create_with_config(config)?;

        let rows = self.labelled(self.config.frame_size)?
            .filter(|row| match row {
                Ok((a, b, _)) => filter.passes(a, b),
                Err(_) => true,
            })
            .take(filter.limit.unwrap_or(usize::MAX));

        output.import_quantised(rows)?;

        Ok(output)
    }

    pub fn flush(&mut self) -> Result<()> {

        self.pager.flush()?;
        self.catalog.flush()?;

        Ok(())
    }

    /// Flushes everything to disk. The store must be closed before it is merged or frozen by
    /// another process.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

/// Stored pairs as `(identifier_a, identifier_b, raw score)`, one frame read at a time.
pub struct Labelled<'a> {
    frames: PairFrames,
    current: std::vec::IntoIter<PairRecord>,
    catalog: &'a Catalog,
}

impl<'a> Iterator for Labelled<'a> {
    type Item = Result<(String, String, RawScore)>;

    fn next(&mut self) -> Option<Self::Item> {

        loop {
            if let Some(record) = self.current.next() {

                let a = match self.catalog.resolve(record.a) {
                    Ok(x) => x.to_string(),
                    Err(e) => return Some(Err(e)),
                };
                let b = match self.catalog.resolve(record.b) {
                    Ok(x) => x.to_string(),
                    Err(e) => return Some(Err(e)),
                };

                return Some(Ok((a, b, record.score)));
            }

            match self.frames.next()? {
                Ok(frame) => self.current = frame.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
