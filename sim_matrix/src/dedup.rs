//! Duplicate check of a batch of incoming pair records against a store
//!
//! Incoming records are first staged in a pair file of their own. The check then hash
//! partitions stored and staged records by pair key into bucket files sized to fit in memory,
//! and settles one bucket at a time: a staged pair already seen with the same score is marked
//! present in a verdict file (one byte per staged record), a different score is a conflict.
//! Every record is read a fixed number of times whatever the size of the store.
use crate::data::{FragmentIndex, PairRecord, RawScore};
use crate::error::{Error, Result};
use crate::io::{PairFrames, PairPager};
use crate::layout;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use log::debug;
use rustc_hash::{FxHashMap, FxHasher};
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

//open bucket writers at once
const MAX_BUCKETS: usize = 512;

//sequence number of records already in the store
const STORED: u64 = u64::MAX;

const PRESENT: u8 = 1;

/// Records waiting to be appended to a store, kept on disk until checked.
#[derive(Debug)]
pub struct Staging {
    directory: PathBuf,
    pager: PairPager,
    frame_size: usize,
    full_matrix: bool,
}

impl Staging {

    /// Starts an empty staging area in `directory`, replacing any left by an earlier run.
    pub fn create(directory: &Path, page_length: usize, cache_pages: Option<usize>, frame_size: usize, full_matrix: bool) -> Result<Self> {

        if directory.exists() {
            fs::remove_dir_all(directory)?;
        }
        fs::create_dir_all(directory)?;

        let pager = PairPager::new(&directory.join("pairs"), page_length, true, cache_pages)?;

        Ok(Self {
            directory: directory.to_path_buf(),
            pager,
            frame_size: frame_size.max(1),
            full_matrix,
        })
    }

    pub fn push(&mut self, record: &PairRecord) -> Result<()> {
        self.pager.append(record)
    }

    pub fn len(&self) -> usize {
        self.pager.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pager.is_empty()
    }

    fn bucket_filename(&self, bucket: usize) -> PathBuf {
        self.directory.join(format!("bucket.{}", bucket))
    }

    fn verdicts_filename(&self) -> PathBuf {
        self.directory.join("verdicts")
    }

    fn bucket_count(&self, stored: usize) -> usize {
        ((stored + self.len()) / self.frame_size + 1).min(MAX_BUCKETS)
    }

    fn bucket_of(&self, record: &PairRecord, buckets: usize) -> usize {

        let mut hasher = FxHasher::default();
        record.key(self.full_matrix).hash(&mut hasher);

        (hasher.finish() % buckets as u64) as usize
    }

    /// Checks every staged record against `stored` and against the staged records before it.
    ///
    /// Returns the number of staged records already present with the same score. A pair
    /// present with a different score is turned into an error by `conflict`, called with the
    /// incoming record and the score it collides with. `stored` must be flushed.
    pub fn check<F>(&mut self, stored: &PairPager, conflict: F) -> Result<usize>
    where F: Fn(&PairRecord, RawScore) -> Error {

        self.pager.flush()?;

        let buckets = self.bucket_count(stored.len());
        self.partition(stored, buckets)?;

        let mut verdicts = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.verdicts_filename())?;
        verdicts.set_len(self.len() as u64)?;

        let mut duplicates = 0;

        for bucket in 0..buckets {

            let filename = self.bucket_filename(bucket);
            let entries = read_bucket(&filename)?;

            let mut scores: FxHashMap<(FragmentIndex, FragmentIndex), RawScore> = FxHashMap::default();
            let mut present: Vec<u64> = Vec::new();

            //stored entries come first, staged ones follow in arrival order
            for (record, sequence) in entries.into_iter() {

                let key = record.key(self.full_matrix);

                match scores.get(&key) {
                    Some(existing) if *existing == record.score => {
                        if sequence != STORED {
                            present.push(sequence);
                        }
                    },
                    Some(existing) => return Err(conflict(&record, *existing)),
                    None => { scores.insert(key, record.score); },
                }
            }

            present.sort_unstable();
            for sequence in present.iter() {
                verdicts.seek(SeekFrom::Start(*sequence))?;
                verdicts.write_all(&[PRESENT])?;
            }

            duplicates += present.len();
            fs::remove_file(&filename)?;
        }

        verdicts.flush()?;

        debug!("checked {} staged records in {} buckets, {} already present", self.len(), buckets, duplicates);

        Ok(duplicates)
    }

    fn partition(&self, stored: &PairPager, buckets: usize) -> Result<()> {

        let mut writers: Vec<BufWriter<File>> = Vec::with_capacity(buckets);
        for bucket in 0..buckets {
            writers.push(BufWriter::new(File::create(self.bucket_filename(bucket))?));
        }

        for frame in stored.frames(self.frame_size, None)? {
            for record in frame? {
                write_entry(&mut writers[self.bucket_of(&record, buckets)], &record, STORED)?;
            }
        }

        let mut sequence: u64 = 0;
        for frame in self.pager.frames(self.frame_size, None)? {
            for record in frame? {
                write_entry(&mut writers[self.bucket_of(&record, buckets)], &record, sequence)?;
                sequence += 1;
            }
        }

        for writer in writers.iter_mut() {
            writer.flush()?;
        }

        Ok(())
    }

    /// Staged records not marked present by [`Staging::check`], in arrival order.
    pub fn accepted(&self) -> Result<Accepted> {

        Ok(Accepted {
            frames: self.pager.frames(self.frame_size, None)?,
            current: Vec::new().into_iter(),
            verdicts: BufReader::new(File::open(self.verdicts_filename())?),
        })
    }

    pub fn remove(self) -> Result<()> {

        fs::remove_dir_all(&self.directory)?;

        Ok(())
    }
}

fn write_entry(writer: &mut BufWriter<File>, record: &PairRecord, sequence: u64) -> Result<()> {

    writer.write_all(&record.to_arr())?;
    writer.write_u64::<BigEndian>(sequence)?;

    Ok(())
}

fn read_bucket(filename: &Path) -> Result<Vec<(PairRecord, u64)>> {

    let data = fs::read(filename)?;

    if data.len() % layout::BUCKET_ENTRY_SIZE != 0 {
        return Err(Error::corrupt(filename, format!("{} bytes is not a whole number of entries", data.len())));
    }

    let entries = data.chunks(layout::BUCKET_ENTRY_SIZE)
        .map(|entry| {
            let record = PairRecord::from_slice(&entry[..layout::PAIR_RECORD_SIZE]);
            let sequence = BigEndian::read_u64(&entry[layout::SEQUENCE_START..]);
            (record, sequence)
        })
        .collect();

    Ok(entries)
}

/// Staged records that passed the duplicate check.
pub struct Accepted {
    frames: PairFrames,
    current: std::vec::IntoIter<PairRecord>,
    verdicts: BufReader<File>,
}

impl Iterator for Accepted {
    type Item = Result<PairRecord>;

    fn next(&mut self) -> Option<Self::Item> {

        loop {
            if let Some(record) = self.current.next() {
                match self.verdicts.read_u8() {
                    Ok(PRESENT) => continue,
                    Ok(_) => return Some(Ok(record)),
                    Err(e) => return Some(Err(e.into())),
                }
            }

            match self.frames.next()? {
                Ok(frame) => self.current = frame.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
