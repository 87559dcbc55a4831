use byteorder::{ByteOrder, BigEndian};
use std::fmt;
use ascii::AsciiStr;
use crate::layout;
use crate::error::{Error, Result};

/// Dense integer index assigned to a fragment identifier by a catalog.
pub type FragmentIndex = u32;

/// Raw quantised score as stored in pair and score files.
pub type RawScore = u16;

pub const MAX_IDENTIFIER_LENGTH: usize = layout::LABEL_SIZE;

/// Scores are stored as `floor(score * precision)`.
pub const DEFAULT_PRECISION: RawScore = 65535;

/// Fixed-width, NUL-padded ASCII form of a fragment identifier as written in label files.
#[derive(PartialEq, Clone)]
pub struct FragmentIdentifier(pub [u8; layout::LABEL_SIZE]);

impl FragmentIdentifier {

    pub fn from_str(data: &str) -> Result<Self> {

        let ascii = AsciiStr::from_ascii(data)
            .map_err(|_| Error::InvalidIdentifier(data.to_string()))?;

        if ascii.is_empty() || ascii.len() > MAX_IDENTIFIER_LENGTH || data.contains('\0') {
            return Err(Error::InvalidIdentifier(data.to_string()));
        }

        let mut fill_arr = [0u8; layout::LABEL_SIZE];
        fill_arr[..ascii.len()].copy_from_slice(ascii.as_bytes());

        Ok(Self(fill_arr))
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {

        let arr: [u8; layout::LABEL_SIZE] = data.try_into()
            .map_err(|_| Error::corrupt("labels", "label slice with incorrect length"))?;

        Ok(Self(arr))
    }

    pub fn to_string(&self) -> Result<String> {

        let end = self.0.iter().position(|x| *x == 0).unwrap_or(layout::LABEL_SIZE);
        let ascii = AsciiStr::from_ascii(&self.0[..end])
            .map_err(|_| Error::corrupt("labels", "label is not ASCII"))?;

        Ok(ascii.to_string())
    }
}

impl fmt::Debug for FragmentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_string() {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:?}", &self.0[..]),
        }
    }
}

/// Converts a fractional score into its stored form.
pub fn encode_score(score: f64, precision: RawScore) -> Result<RawScore> {

    if !(0.0..=1.0).contains(&score) {
        return Err(Error::ScoreOutOfRange(score));
    }

    Ok((score * precision as f64) as RawScore)
}

/// Converts a stored score back into a fraction rounded up to the decimal digits the precision
/// can represent, so 0.9 stored at 65535 reads back as 0.9.
pub fn decode_score(raw: RawScore, precision: RawScore) -> f64 {

    let precision = precision as f64;
    let precision10 = 10f64.powf(precision.log10().floor());

    (precision10 * raw as f64 / precision).ceil() / precision10
}

/// Fragment pair with its score, stored as indices into the owning catalog.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct PairRecord {
    pub a: FragmentIndex,
    pub b: FragmentIndex,
    pub score: RawScore,
}

impl PairRecord {

    pub fn new(a: FragmentIndex, b: FragmentIndex, score: RawScore) -> Self {
        Self { a, b, score }
    }

    /// Key used for duplicate detection. Unordered unless the store holds both triangles.
    pub fn key(&self, full_matrix: bool) -> (FragmentIndex, FragmentIndex) {

        match full_matrix || self.a <= self.b {
            true => (self.a, self.b),
            false => (self.b, self.a),
        }
    }

    pub fn from_slice(record_slice: &[u8]) -> Self {

        let a = Parser::get_u32_from_array(record_slice, layout::INDEX_A_START);
        let b = Parser::get_u32_from_array(record_slice, layout::INDEX_B_START);
        let score = Parser::get_u16_from_array(record_slice, layout::SCORE_START);

        Self { a, b, score }
    }

    pub fn to_arr(&self) -> [u8; layout::PAIR_RECORD_SIZE] {

        let mut arr = [0u8; layout::PAIR_RECORD_SIZE];

        BigEndian::write_u32(&mut arr[layout::INDEX_A_START..layout::INDEX_A_START + layout::INDEX_A_SIZE], self.a);
        BigEndian::write_u32(&mut arr[layout::INDEX_B_START..layout::INDEX_B_START + layout::INDEX_B_SIZE], self.b);
        BigEndian::write_u16(&mut arr[layout::SCORE_START..layout::SCORE_START + layout::SCORE_SIZE], self.score);

        arr
    }
}

/// One validated `(identifier_a, identifier_b, score)` row from a raw import source.
#[derive(Debug, PartialEq, Clone)]
pub struct RawTriple {
    pub a: String,
    pub b: String,
    pub score: f64,
}

impl RawTriple {

    pub fn new<A: Into<String>, B: Into<String>>(a: A, b: B, score: f64) -> Self {
        Self { a: a.into(), b: b.into(), score }
    }

    /// Checks identifiers and score range at the import boundary.
    pub fn validate(&self) -> Result<()> {

        FragmentIdentifier::from_str(&self.a)?;
        FragmentIdentifier::from_str(&self.b)?;

        if !(0.0..=1.0).contains(&self.score) {
            return Err(Error::ScoreOutOfRange(self.score));
        }

        Ok(())
    }

    /// Whether the row lies in the upper triangle, ordering fragments by identifier.
    pub fn is_upper_triangle(&self) -> bool {
        self.a > self.b
    }

    pub fn swapped(self) -> Self {
        Self { a: self.b, b: self.a, score: self.score }
    }
}


pub struct Parser {}

impl Parser {

    pub fn get_u32_from_array(data: &[u8], offset: usize) -> u32 {
        BigEndian::read_u32(&data[offset..offset + 4])
    }

    pub fn get_u16_from_array(data: &[u8], offset: usize) -> u16 {
        BigEndian::read_u16(&data[offset..offset + 2])
    }

    pub fn get_usize_from_array(data: &[u8], offset: usize) -> Result<usize> {

        let arr = coerce_pointer(&data[offset..offset + layout::PTR_SIZE])?;
        let layout::Value(value) = layout::Value::try_from(arr)?;

        Ok(value)
    }
}

pub fn coerce_pointer(value: &[u8]) -> Result<[u8; layout::PTR_SIZE]> {
    value.try_into().map_err(|_| Error::corrupt("header", "slice with incorrect length"))
}

#[cfg(test)]
mod test {

    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn identifier_to_fixed_width_and_back() {

        let identifier = FragmentIdentifier::from_str("3wyl_3KB_frag20").unwrap();

        assert_eq!(identifier.to_string().unwrap(), "3wyl_3KB_frag20");
        assert_eq!(identifier.0[15], 0);
    }

    #[test]
    fn identifier_rejects_bad_input() {

        let too_long = "x".repeat(MAX_IDENTIFIER_LENGTH + 1);

        assert!(matches!(FragmentIdentifier::from_str(&too_long), Err(Error::InvalidIdentifier(_))));
        assert!(matches!(FragmentIdentifier::from_str("fragé"), Err(Error::InvalidIdentifier(_))));
        assert!(matches!(FragmentIdentifier::from_str(""), Err(Error::InvalidIdentifier(_))));
    }

    #[test]
    fn scores_keep_four_digits() {

        for score in [0.0, 0.4633, 0.5, 0.5877, 0.6, 0.7, 0.873, 0.9, 1.0] {
            let raw = encode_score(score, DEFAULT_PRECISION).unwrap();
            assert_approx_eq!(decode_score(raw, DEFAULT_PRECISION), score, 1e-9);
        }
    }

    #[test]
    fn score_out_of_range() {

        assert!(matches!(encode_score(1.2, DEFAULT_PRECISION), Err(Error::ScoreOutOfRange(_))));
        assert!(matches!(encode_score(-0.1, DEFAULT_PRECISION), Err(Error::ScoreOutOfRange(_))));
    }

    #[test]
    fn pair_record_bytes() {

        let record = PairRecord::new(3, 70000, 58981);
        let arr = record.to_arr();

        assert_eq!(arr.len(), layout::PAIR_RECORD_SIZE);
        assert_eq!(PairRecord::from_slice(&arr), record);
    }

    #[test]
    fn pair_key_is_unordered() {

        let forward = PairRecord::new(1, 2, 10);
        let backward = PairRecord::new(2, 1, 10);

        assert_eq!(forward.key(false), backward.key(false));
        assert_ne!(forward.key(true), backward.key(true));
    }
}
