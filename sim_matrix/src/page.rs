//! A page is a fixed-length byte array holding a run of pair records.
//!
//! Pages are the unit the pair pager reads, caches and writes back.

use std::path::Path;

use crate::data::PairRecord;
use crate::error::{Error, Result};
use crate::layout;

#[derive(Debug, Clone, PartialEq)]
pub enum PageType {
    Pairs = 2,
}

#[derive(Debug, Clone)]
pub struct PairPage {
    pub data: Vec<u8>,
    pub tail: usize,
    pub page_length: usize,
}

impl PairPage {

    pub fn new(page_length: usize) -> Self {

        let mut s = Self {
            data: vec![0u8; page_length],
            tail: 0,
            page_length,
        };

        s.data[layout::PAGE_TYPE_OFFSET] = PageType::Pairs as u8;
        s.data[layout::IS_EMPTY_OFFSET] = 1;

        s
    }

    pub fn get_data(&self) -> &Vec<u8> {
        &self.data
    }

    pub fn from_arr(arr: &[u8], page_length: usize, filename: &Path) -> Result<Self> {

        if arr.len() != page_length {
            return Err(Error::corrupt(filename, format!("page of {} bytes, expected {}", arr.len(), page_length)));
        }

        if arr[layout::PAGE_TYPE_OFFSET] != PageType::Pairs as u8 {
            return Err(Error::corrupt(filename, format!("unexpected page type {}", arr[layout::PAGE_TYPE_OFFSET])));
        }

        let tail_arr: [u8; layout::TAIL_SIZE] = arr[layout::TAIL_OFFSET..layout::TAIL_OFFSET + layout::TAIL_SIZE]
            .try_into()
            .map_err(|_| Error::corrupt(filename, "page tail"))?;
        let tail = u32::from_be_bytes(tail_arr) as usize;

        let page = Self {
            data: arr.to_vec(),
            tail,
            page_length,
        };

        if tail > page.get_capacity() {
            return Err(Error::corrupt(filename, format!("page tail {} beyond capacity {}", tail, page.get_capacity())));
        }

        Ok(page)
    }

    pub fn get_records(&self) -> Vec<PairRecord> {

        (0..self.tail).filter_map(|offset| self.get_record_at(offset)).collect()
    }

    /// Appends `record`, returning false when the page has no room left.
    pub fn add_record(&mut self, record: &PairRecord) -> bool {

        if self.is_full() {
            return false;
        }

        let start = layout::PAGE_DATA_START + (self.tail * layout::PAIR_RECORD_SIZE);
        self.data[start..start + layout::PAIR_RECORD_SIZE].copy_from_slice(&record.to_arr());

        self.tail += 1;

        //ensure tail value is updated
        let coerced_tail = self.tail as u32;
        self.data[layout::TAIL_OFFSET..layout::TAIL_OFFSET + layout::TAIL_SIZE].copy_from_slice(&coerced_tail.to_be_bytes());
        self.data[layout::IS_EMPTY_OFFSET] = 0;

        true
    }

    pub fn get_record_at(&self, offset: usize) -> Option<PairRecord> {

        if offset >= self.tail {
            return None;
        }

        let start = layout::PAGE_DATA_START + (offset * layout::PAIR_RECORD_SIZE);
        let slice = &self.data[start..start + layout::PAIR_RECORD_SIZE];

        Some(PairRecord::from_slice(slice))
    }

    pub fn is_full(&self) -> bool {
        self.tail >= self.get_capacity()
    }

    pub fn get_capacity(&self) -> usize {
        (self.page_length - layout::PAGE_DATA_START) / layout::PAIR_RECORD_SIZE
    }

    pub fn len(&self) -> usize {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.tail == 0
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn quick_test_new_page_works() {
        let page = PairPage::new(4096);

        assert!(page.is_empty());
        assert_eq!(page.get_data()[layout::IS_EMPTY_OFFSET], 1);
    }

    #[test]
    fn quick_add_pair_record() {
        let mut page = PairPage::new(4096);

        assert!(page.add_record(&PairRecord::new(0, 1, 100)));
        assert!(page.add_record(&PairRecord::new(1, 2, 200)));

        assert_eq!(page.len(), 2);
        assert_eq!(page.get_record_at(1), Some(PairRecord::new(1, 2, 200)));
        assert_eq!(page.get_record_at(2), None);
    }

    #[test]
    fn quick_test_get_capacity() {

        let mut page = PairPage::new(4096);
        let capacity = page.get_capacity();

        assert_eq!(capacity, (4096 - layout::PAGE_DATA_START) / layout::PAIR_RECORD_SIZE);

        for i in 0..capacity + 10 {
            let added = page.add_record(&PairRecord::new(i as u32, 0, 1));
            assert_eq!(added, i < capacity);
        }

        assert!(page.is_full());
    }

    #[test]
    fn page_bytes_round_trip() {

        let mut page = PairPage::new(256);
        page.add_record(&PairRecord::new(7, 9, 65535));

        let parsed = PairPage::from_arr(page.get_data(), 256, Path::new("mem")).unwrap();

        assert_eq!(parsed.get_records(), vec![PairRecord::new(7, 9, 65535)]);
    }

    #[test]
    fn wrong_page_type_is_corrupt() {

        let arr = vec![0u8; 256];
        assert!(PairPage::from_arr(&arr, 256, Path::new("mem")).is_err());
    }
}
