//! Sets constants for the disk layout of label, pair and score files


use std::mem::size_of;
use std::convert::TryFrom;

use crate::error::Error;


pub const PTR_SIZE: usize = size_of::<u64>();


pub struct Value (pub usize);

/// Converts an 8 byte array to a usize as a BigEndian integer.
impl TryFrom<[u8; PTR_SIZE]> for Value {
    type Error = Error;

    fn try_from(arr: [u8; PTR_SIZE]) -> Result<Self, Self::Error> {
        let value = u64::from_be_bytes(arr);
        let value = usize::try_from(value)
            .map_err(|_| Error::corrupt("header", format!("value {} does not fit in usize", value)))?;
        Ok(Self(value))
    }
}

/// Converts a single byte to a usize.
impl TryFrom<[u8; 1]> for Value {
    type Error = Error;

    fn try_from(arr: [u8; 1]) -> Result<Self, Self::Error> {
        Ok(Self(usize::from(arr[0])))
    }
}

//for label files
pub const LABEL_COUNT_START: usize = 0;
pub const LABEL_COUNT_SIZE: usize = PTR_SIZE;

pub const LABEL_SIZE: usize = 64;

pub const LABEL_DATA_START: usize = LABEL_COUNT_START + LABEL_COUNT_SIZE;

//for PairRecord
pub const INDEX_A_START: usize = 0;
pub const INDEX_A_SIZE: usize = 4;

pub const INDEX_B_START: usize = INDEX_A_START + INDEX_A_SIZE;
pub const INDEX_B_SIZE: usize = 4;

pub const SCORE_START: usize = INDEX_B_START + INDEX_B_SIZE;
pub const SCORE_SIZE: usize = 2;

pub const PAIR_RECORD_SIZE: usize = SCORE_START + SCORE_SIZE;

//for generic Page
pub const PAGE_TYPE_OFFSET: usize = 0;
pub const PAGE_TYPE_SIZE: usize = 1;

pub const TAIL_OFFSET: usize = PAGE_TYPE_OFFSET + PAGE_TYPE_SIZE;
pub const TAIL_SIZE: usize = 4;

pub const IS_EMPTY_OFFSET: usize = TAIL_OFFSET + TAIL_SIZE;
pub const IS_EMPTY_SIZE: usize = 1;

pub const PAGE_DATA_START: usize = IS_EMPTY_OFFSET + IS_EMPTY_SIZE;

//for whole pair file
pub const HEADER_CURSOR_START: usize = 0;
pub const HEADER_CURSOR_SIZE: usize = PTR_SIZE;

pub const HEADER_RECORDS_START: usize = HEADER_CURSOR_START + HEADER_CURSOR_SIZE;
pub const HEADER_RECORDS_SIZE: usize = PTR_SIZE;

pub const FILE_DATA_START: usize = HEADER_RECORDS_START + HEADER_RECORDS_SIZE;

//for score files
pub const CELL_SIZE: usize = SCORE_SIZE;

pub const SCORES_DIMENSION_START: usize = 0;
pub const SCORES_DIMENSION_SIZE: usize = PTR_SIZE;

pub const SCORES_BLOCK_ROWS_START: usize = SCORES_DIMENSION_START + SCORES_DIMENSION_SIZE;
pub const SCORES_BLOCK_ROWS_SIZE: usize = PTR_SIZE;

pub const SCORES_BLOCK_COUNT_START: usize = SCORES_BLOCK_ROWS_START + SCORES_BLOCK_ROWS_SIZE;
pub const SCORES_BLOCK_COUNT_SIZE: usize = PTR_SIZE;

pub const SCORES_INDEX_START: usize = SCORES_BLOCK_COUNT_START + SCORES_BLOCK_COUNT_SIZE;

//one (offset, length) entry per compressed block
pub const BLOCK_OFFSET_SIZE: usize = PTR_SIZE;
pub const BLOCK_LENGTH_SIZE: usize = PTR_SIZE;
pub const BLOCK_ENTRY_SIZE: usize = BLOCK_OFFSET_SIZE + BLOCK_LENGTH_SIZE;

//for duplicate check bucket files: a pair record followed by its staging sequence number
pub const SEQUENCE_START: usize = PAIR_RECORD_SIZE;
pub const SEQUENCE_SIZE: usize = PTR_SIZE;

pub const BUCKET_ENTRY_SIZE: usize = SEQUENCE_START + SEQUENCE_SIZE;
