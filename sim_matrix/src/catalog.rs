//! Bidirectional mapping between fragment identifiers and the dense indices used in pair and
//! score files.
//!
//! A label file is an entry count followed by fixed-width identifiers; the index of an
//! identifier is its position in the file, so indices are assigned in insertion order and
//! are reproducible. [`Catalog`] keeps the whole mapping resident and can assign new indices,
//! [`DiskCatalog`] answers single lookups straight from disk without loading anything.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, BigEndian};
use log::debug;

use crate::data::{FragmentIdentifier, FragmentIndex};
use crate::error::{Error, Key, Result};
use crate::layout;

/// Read side shared by the resident and on-disk catalogs
pub trait LabelLookup {

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_of(&self, identifier: &str) -> Result<Option<FragmentIndex>>;

    fn label_of(&self, index: FragmentIndex) -> Result<String>;

    /// Every label in index order.
    fn all_labels(&self) -> Result<Vec<String>> {
        (0..self.len()).map(|i| self.label_of(index_from_usize(i)?)).collect()
    }
}

fn calc_offset(index: usize) -> u64 {
    (layout::LABEL_DATA_START + index * layout::LABEL_SIZE) as u64
}

fn read_count(fd: &mut File, filename: &Path) -> Result<usize> {

    let mut buf = [0u8; layout::LABEL_COUNT_SIZE];
    fd.seek(SeekFrom::Start(layout::LABEL_COUNT_START as u64))?;
    fd.read_exact(&mut buf)?;

    let layout::Value(count) = layout::Value::try_from(buf)?;

    let expected_len = calc_offset(count);
    let actual_len = fd.metadata()?.len();
    if actual_len < expected_len {
        return Err(Error::corrupt(filename, format!("{} labels announced but file holds {} bytes", count, actual_len)));
    }

    Ok(count)
}

fn index_from_usize(value: usize) -> Result<FragmentIndex> {
    FragmentIndex::try_from(value).map_err(|_| Error::corrupt("labels", "catalog exceeds index space"))
}

/// Resident catalog. Writable catalogs assign a new index the first time an identifier is seen.
#[derive(Debug)]
pub struct Catalog {
    filename: PathBuf,
    labels: Vec<String>,
    index: HashMap<String, FragmentIndex>,
    persisted: usize,
    writable: bool,
}

impl Catalog {

    /// Creates an empty, writable label file, truncating any previous content.
    pub fn create(filename: &Path) -> Result<Self> {

        let mut fd = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(true)
                    .open(filename)?;

        fd.write_all(&0u64.to_be_bytes())?;

        Ok(Self {
            filename: filename.to_path_buf(),
            labels: Vec::new(),
            index: HashMap::new(),
            persisted: 0,
            writable: true,
        })
    }

    /// Bulk-loads an existing label file.
    pub fn open(filename: &Path, writable: bool) -> Result<Self> {

        let labels = DiskCatalog::open(filename)?.iter()?.collect::<Result<Vec<String>>>()?;

        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), index_from_usize(i)?).is_some() {
                return Err(Error::corrupt(filename, format!("label {} appears twice", label)));
            }
        }

        debug!("loaded {} labels from {}", labels.len(), filename.display());

        Ok(Self {
            filename: filename.to_path_buf(),
            persisted: labels.len(),
            labels,
            index,
            writable,
        })
    }

    /// Writes a fresh label file holding `labels` in order.
    pub fn write_labels(filename: &Path, labels: &[String]) -> Result<Self> {

        let mut catalog = Self::create(filename)?;
        for label in labels.iter() {
            catalog.lookup(label)?;
        }
        catalog.flush()?;

        Ok(catalog)
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns the index of `identifier`, assigning the next free one when the catalog is writable.
    pub fn lookup(&mut self, identifier: &str) -> Result<FragmentIndex> {

        if let Some(index) = self.index.get(identifier) {
            return Ok(*index);
        }

        if !self.writable {
            return Err(Error::UnknownIdentifier(Key::from(identifier)));
        }

        FragmentIdentifier::from_str(identifier)?;

        let index = index_from_usize(self.labels.len())?;
        self.labels.push(identifier.to_string());
        self.index.insert(identifier.to_string(), index);

        Ok(index)
    }

    pub fn get(&self, identifier: &str) -> Option<FragmentIndex> {
        self.index.get(identifier).copied()
    }

    pub fn resolve(&self, index: FragmentIndex) -> Result<&str> {

        match self.labels.get(index as usize) {
            Some(label) => Ok(label.as_str()),
            None => Err(Error::NotFound(Key::Index(index))),
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Appends labels assigned since the last flush and updates the entry count.
    pub fn flush(&mut self) -> Result<()> {

        if self.persisted == self.labels.len() {
            return Ok(());
        }

        let mut fd = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&self.filename)?;

        fd.seek(SeekFrom::Start(calc_offset(self.persisted)))?;

        let mut buf: Vec<u8> = Vec::with_capacity((self.labels.len() - self.persisted) * layout::LABEL_SIZE);
        for label in self.labels[self.persisted..].iter() {
            buf.extend_from_slice(&FragmentIdentifier::from_str(label)?.0);
        }
        fd.write_all(&buf)?;

        let mut count_arr = [0u8; layout::LABEL_COUNT_SIZE];
        BigEndian::write_u64(&mut count_arr, self.labels.len() as u64);
        fd.seek(SeekFrom::Start(layout::LABEL_COUNT_START as u64))?;
        fd.write_all(&count_arr)?;

        self.persisted = self.labels.len();

        Ok(())
    }
}

impl LabelLookup for Catalog {

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn index_of(&self, identifier: &str) -> Result<Option<FragmentIndex>> {
        Ok(self.get(identifier))
    }

    fn label_of(&self, index: FragmentIndex) -> Result<String> {
        self.resolve(index).map(|x| x.to_string())
    }

    fn all_labels(&self) -> Result<Vec<String>> {
        Ok(self.labels.clone())
    }
}

/// Read-only catalog answering lookups by seeking into the label file.
#[derive(Debug, Clone)]
pub struct DiskCatalog {
    filename: PathBuf,
    num_entries: usize,
}

impl DiskCatalog {

    pub fn open(filename: &Path) -> Result<Self> {

        let mut fd = OpenOptions::new()
                    .read(true)
                    .open(filename)?;

        let num_entries = read_count(&mut fd, filename)?;

        Ok(Self {
            filename: filename.to_path_buf(),
            num_entries,
        })
    }

    pub fn len(&self) -> usize {
        self.num_entries
    }

    pub fn resolve(&self, index: FragmentIndex) -> Result<String> {

        if index as usize >= self.num_entries {
            return Err(Error::NotFound(Key::Index(index)));
        }

        let mut fd = OpenOptions::new()
                    .read(true)
                    .open(&self.filename)?;

        let mut buf = [0u8; layout::LABEL_SIZE];
        fd.seek(SeekFrom::Start(calc_offset(index as usize)))?;
        fd.read_exact(&mut buf)?;

        FragmentIdentifier(buf).to_string()
    }

    /// Linear scan for `identifier`.
    pub fn lookup(&self, identifier: &str) -> Result<FragmentIndex> {

        for (i, label) in self.iter()?.enumerate() {
            if label? == identifier {
                return index_from_usize(i);
            }
        }

        Err(Error::NotFound(Key::from(identifier)))
    }

    /// Streams labels in index order.
    pub fn iter(&self) -> Result<LabelIter> {

        let mut fd = OpenOptions::new()
                    .read(true)
                    .open(&self.filename)?;

        fd.seek(SeekFrom::Start(layout::LABEL_DATA_START as u64))?;

        Ok(LabelIter {
            reader: BufReader::new(fd),
            remaining: self.num_entries,
        })
    }

    /// Loads the whole mapping into memory.
    pub fn load(&self, writable: bool) -> Result<Catalog> {
        Catalog::open(&self.filename, writable)
    }
}

impl LabelLookup for DiskCatalog {

    fn len(&self) -> usize {
        self.num_entries
    }

    fn index_of(&self, identifier: &str) -> Result<Option<FragmentIndex>> {

        match self.lookup(identifier) {
            Ok(index) => Ok(Some(index)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn label_of(&self, index: FragmentIndex) -> Result<String> {
        self.resolve(index)
    }

    fn all_labels(&self) -> Result<Vec<String>> {
        self.iter()?.collect()
    }
}

pub struct LabelIter {
    reader: BufReader<File>,
    remaining: usize,
}

impl Iterator for LabelIter {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {

        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let mut buf = [0u8; layout::LABEL_SIZE];
        match self.reader.read_exact(&mut buf) {
            Ok(_) => Some(FragmentIdentifier(buf).to_string()),
            Err(e) => {
                self.remaining = 0;
                Some(Err(Error::from(e)))
            }
        }
    }
}
