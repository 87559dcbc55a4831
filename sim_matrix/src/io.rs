//! Handles read and write for whole pages and matrix rows on disk
//!
//! [`PairPager`] appends pair records into fixed-length pages and keeps recently touched pages in
//! a bounded cache. [`PairFrames`] streams records back in frames of a chosen size.

use crate::data::PairRecord;
use crate::error::{Error, Result};
use crate::layout;
use crate::page::PairPage;
use byteorder::{ByteOrder, BigEndian};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) fn read_header_value(fd: &mut File, offset: usize) -> Result<usize> {

    let mut arr: [u8; layout::PTR_SIZE] = [0x00; layout::PTR_SIZE];
    fd.seek(SeekFrom::Start(offset as u64))?;
    fd.read_exact(&mut arr)?;

    let layout::Value(value) = layout::Value::try_from(arr)?;

    Ok(value)
}

pub(crate) fn write_header_value(fd: &mut File, offset: usize, value: usize) -> Result<()> {

    let mut arr: [u8; layout::PTR_SIZE] = [0x00; layout::PTR_SIZE];
    BigEndian::write_u64(&mut arr, value as u64);

    fd.seek(SeekFrom::Start(offset as u64))?;
    fd.write_all(&arr)?;

    Ok(())
}

#[derive(Debug)]
pub struct PairPager {
    path: PathBuf,
    pub next_free_index: usize, //this is the next available page slot
    pub num_records: usize,
    pub page_length: usize,
    cache: HashMap<usize, PairPage>,
    cache_limit: Option<usize>,
}

impl PairPager {

    pub fn new(path: &Path, page_length: usize, create: bool, cache_limit: Option<usize>) -> Result<Self> {

        if page_length < layout::PAGE_DATA_START + layout::PAIR_RECORD_SIZE {
            return Err(Error::corrupt(path, format!("page length {} cannot hold a single record", page_length)));
        }

        match create {
            true => {

                let mut fd = OpenOptions::new()
                        .create(true)
                        .read(true)
                        .write(true)
                        .truncate(true)
                        .open(path)?;

                write_header_value(&mut fd, layout::HEADER_CURSOR_START, 0)?;
                write_header_value(&mut fd, layout::HEADER_RECORDS_START, 0)?;

                Ok(Self {
                    path: path.to_path_buf(),
                    next_free_index: 0,
                    num_records: 0,
                    page_length,
                    cache: HashMap::new(),
                    cache_limit,
                })
            },
            false => {

                let mut fd = OpenOptions::new()
                    .read(true)
                    .open(path)?;

                let next_free_index = read_header_value(&mut fd, layout::HEADER_CURSOR_START)?;
                let num_records = read_header_value(&mut fd, layout::HEADER_RECORDS_START)?;

                let expected_len = (layout::FILE_DATA_START + next_free_index * page_length) as u64;
                if fd.metadata()?.len() < expected_len {
                    return Err(Error::corrupt(path, format!("{} pages announced but file is shorter", next_free_index)));
                }

                Ok(Self {
                    path: path.to_path_buf(),
                    next_free_index,
                    num_records,
                    page_length,
                    cache: HashMap::new(),
                    cache_limit,
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn calc_offset(&self, address: &usize) -> u64 {

        let offset = (address * self.page_length) as u64;
        layout::FILE_DATA_START as u64 + offset
    }

    pub fn get_page(&self, address: &usize) -> Result<PairPage> {

        match self.cache.get(address) {
            Some(page) => Ok(page.clone()),
            None => self._read_page(address),
        }
    }

    pub fn _read_page(&self, address: &usize) -> Result<PairPage> {

        let mut page: Vec<u8> = vec![0; self.page_length];

        let mut file = OpenOptions::new()
                    .read(true)
                    .open(&self.path)?;

        file.seek(SeekFrom::Start(self.calc_offset(address)))?;
        file.read_exact(&mut page)?;

        PairPage::from_arr(&page, self.page_length, &self.path)
    }

    pub fn len(&self) -> usize {
        self.num_records
    }

    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }

    pub fn num_pages(&self) -> usize {
        self.next_free_index
    }

    pub fn get_cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Appends a record to the last page, opening a new page when it is full.
    pub fn append(&mut self, record: &PairRecord) -> Result<()> {

        let added = match self.next_free_index {
            0 => false,
            _ => {
                let address = self.next_free_index - 1;
                if !self.cache.contains_key(&address) {
                    let page = self._read_page(&address)?;
                    self.cache.insert(address, page);
                }

                match self.cache.get_mut(&address) {
                    Some(page) => page.add_record(record),
                    None => false,
                }
            }
        };

        if !added {
            let mut page = PairPage::new(self.page_length);
            page.add_record(record);
            self.cache.insert(self.next_free_index, page);
            self.next_free_index += 1;
        }

        self.num_records += 1;
        self.check_cache()?;

        Ok(())
    }

    /// Writes every cached page and the header, keeping only the open tail page cached.
    pub fn flush(&mut self) -> Result<()> {

        let mut keys: Vec<usize> = self.cache.keys().copied().collect();
        keys.sort();

        for key in keys.iter() {
            if let Some(page) = self.cache.get(key) {
                self._write_page_at_offset(page, key)?;
            }
        }

        let tail_address = self.next_free_index.checked_sub(1);
        self.cache.retain(|key, _| Some(*key) == tail_address);

        self._write_header()
    }

    pub fn flush_keys(&mut self, keys: Vec<usize>) -> Result<()> {

        for key in keys.iter() {

            if let Some(page) = self.cache.remove(key) {
                self._write_page_at_offset(&page, key)?;
            }
        }

        Ok(())
    }

    pub fn check_cache(&mut self) -> Result<()> {

        match self.cache_limit {
            None => Ok(()),
            Some(limit) => {
                match self.cache.len() > limit {
                    true => self._evict(),
                    false => Ok(()),
                }
            }
        }
    }

    fn _evict(&mut self) -> Result<()> {

        let evict_prop = 0.1;
        let evict_num = ((self.cache.len() as f32 * evict_prop) as usize).max(1);
        let tail_address = self.next_free_index.checked_sub(1);

        let keys_to_flush: Vec<usize> = self.cache.keys()
            .filter(|key| Some(**key) != tail_address)
            .take(evict_num)
            .copied()
            .collect();

        debug!("evicting {} pages from {}", keys_to_flush.len(), self.path.display());

        self.flush_keys(keys_to_flush)
    }

    fn _write_header(&mut self) -> Result<()> {

        let mut file = OpenOptions::new()
                    .write(true)
                    .open(&self.path)?;

        write_header_value(&mut file, layout::HEADER_CURSOR_START, self.next_free_index)?;
        write_header_value(&mut file, layout::HEADER_RECORDS_START, self.num_records)?;

        Ok(())
    }

    pub fn _write_page_at_offset(&self, page: &PairPage, address: &usize) -> Result<()> {

        let mut file = OpenOptions::new()
                    .write(true)
                    .open(&self.path)?;

        file.seek(SeekFrom::Start(self.calc_offset(address)))?;
        file.write_all(page.get_data())?;

        Ok(())
    }

    /// Streams the records persisted so far in frames of `frame_size`, stopping after `limit`
    /// records when given.
    pub fn frames(&self, frame_size: usize, limit: Option<usize>) -> Result<PairFrames> {
        PairFrames::open(&self.path, self.page_length, frame_size, limit)
    }
}

/// Single forward pass over a pair file, one frame of records at a time.
pub struct PairFrames {
    path: PathBuf,
    reader: BufReader<File>,
    page_length: usize,
    num_pages: usize,
    next_page: usize,
    frame_size: usize,
    remaining: usize,
    buffer: VecDeque<PairRecord>,
}

impl PairFrames {

    pub fn open(path: &Path, page_length: usize, frame_size: usize, limit: Option<usize>) -> Result<Self> {

        let mut fd = OpenOptions::new()
                    .read(true)
                    .open(path)?;

        let num_pages = read_header_value(&mut fd, layout::HEADER_CURSOR_START)?;
        let num_records = read_header_value(&mut fd, layout::HEADER_RECORDS_START)?;

        fd.seek(SeekFrom::Start(layout::FILE_DATA_START as u64))?;

        let remaining = match limit {
            Some(limit) => limit.min(num_records),
            None => num_records,
        };

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(fd),
            page_length,
            num_pages,
            next_page: 0,
            frame_size: frame_size.max(1),
            remaining,
            buffer: VecDeque::new(),
        })
    }

    fn read_next_page(&mut self) -> Result<()> {

        let mut arr: Vec<u8> = vec![0; self.page_length];
        self.reader.read_exact(&mut arr)?;
        self.next_page += 1;

        let page = PairPage::from_arr(&arr, self.page_length, &self.path)?;
        self.buffer.extend(page.get_records());

        Ok(())
    }
}

impl Iterator for PairFrames {
    type Item = Result<Vec<PairRecord>>;

    fn next(&mut self) -> Option<Self::Item> {

        let wanted = self.frame_size.min(self.remaining);

        while self.buffer.len() < wanted && self.next_page < self.num_pages {
            if let Err(e) = self.read_next_page() {
                self.remaining = 0;
                return Some(Err(e));
            }
        }

        let take = wanted.min(self.buffer.len());
        if take == 0 {
            if self.remaining > 0 {
                self.remaining = 0;
                return Some(Err(Error::corrupt(&self.path, "pair file holds fewer records than its header")));
            }
            return None;
        }

        self.remaining -= take;

        Some(Ok(self.buffer.drain(..take).collect()))
    }
}
