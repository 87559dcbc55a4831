//! Readers for the raw score formats produced by the external neighbor search, and the TSV writer
//! shared by export and conversion.
//!
//! Both readers yield [`RawTriple`] rows lazily. Self pairs are dropped since the diagonal is
//! implied by the dense matrix.
use crate::data::RawTriple;
use crate::error::{Error, Result};
use log::warn;
use std::io::{BufRead, Lines, Write};

pub const TSV_HEADER: [&str; 3] = ["frag_id1", "frag_id2", "score"];

const FPNEIGH_QUERY_PREFIX: &str = "Compounds similar to ";

fn parse_score(field: &str, line: usize) -> Result<f64> {

    field.trim().parse::<f64>()
        .map_err(|_| Error::parse(line, format!("score {:?} is not a number", field)))
}

/// `identifier_a<TAB>identifier_b<TAB>score` rows.
pub struct TsvReader<R: BufRead> {
    lines: Lines<R>,
    line: usize,
    skip_header: bool,
}

impl<R: BufRead> TsvReader<R> {

    pub fn new(reader: R, has_header: bool) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
            skip_header: has_header,
        }
    }

    fn parse_line(&self, text: &str) -> Result<Option<RawTriple>> {

        let fields: Vec<&str> = text.split('\t').collect();

        if fields.len() != 3 {
            return Err(Error::parse(self.line, format!("expected 3 tab separated fields, found {}", fields.len())));
        }

        let (a, b) = (fields[0].trim(), fields[1].trim());
        if a == b {
            return Ok(None);
        }

        let score = parse_score(fields[2], self.line)?;

        Ok(Some(RawTriple::new(a, b, score)))
    }
}

impl<R: BufRead> Iterator for TsvReader<R> {
    type Item = Result<RawTriple>;

    fn next(&mut self) -> Option<Self::Item> {

        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(Error::Io(e))),
            };
            self.line += 1;

            if self.skip_header {
                self.skip_header = false;
                continue;
            }

            if text.trim().is_empty() {
                continue;
            }

            match self.parse_line(&text) {
                Ok(Some(triple)) => return Some(Ok(triple)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Blocks of `Compounds similar to <query>:` followed by `<hit> <score>` lines.
///
/// With `ignore_upper_triangle` hits sorting before their query are dropped, as the search
/// tool reports every pair from both sides.
pub struct FpneighReader<R: BufRead> {
    lines: Lines<R>,
    line: usize,
    query: Option<String>,
    ignore_upper_triangle: bool,
}

impl<R: BufRead> FpneighReader<R> {

    pub fn new(reader: R, ignore_upper_triangle: bool) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
            query: None,
            ignore_upper_triangle,
        }
    }

    fn parse_line(&mut self, text: &str) -> Result<Option<RawTriple>> {

        if let Some(rest) = text.strip_prefix(FPNEIGH_QUERY_PREFIX) {
            let query = rest.trim().trim_end_matches(':');
            if query.is_empty() {
                return Err(Error::parse(self.line, "query header without identifier"));
            }
            self.query = Some(query.to_string());
            return Ok(None);
        }

        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(Error::parse(self.line, format!("expected hit and score, found {} fields", fields.len())));
        }

        let query = match &self.query {
            Some(query) => query,
            None => return Err(Error::parse(self.line, "hit before any query header")),
        };

        let hit = fields[0];
        if query == hit || (self.ignore_upper_triangle && query.as_str() > hit) {
            return Ok(None);
        }

        let score = parse_score(fields[1], self.line)?;

        Ok(Some(RawTriple::new(query.clone(), hit, score)))
    }
}

impl<R: BufRead> Iterator for FpneighReader<R> {
    type Item = Result<RawTriple>;

    fn next(&mut self) -> Option<Self::Item> {

        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(Error::Io(e))),
            };
            self.line += 1;

            if text.trim().is_empty() {
                continue;
            }

            match self.parse_line(&text) {
                Ok(Some(triple)) => return Some(Ok(triple)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Writes triples as tab separated lines, returning how many were written.
pub fn write_tsv<W, I>(writer: &mut W, rows: I, header: bool) -> Result<usize>
where W: Write, I: IntoIterator<Item = Result<RawTriple>> {

    if header {
        writeln!(writer, "{}", TSV_HEADER.join("\t"))?;
    }

    let mut written = 0;
    for row in rows {
        let row = row?;
        writeln!(writer, "{}\t{}\t{}", row.a, row.b, row.score)?;
        written += 1;
    }

    writer.flush()?;

    Ok(written)
}

/// Rewrites an fpneigh file as TSV with a header line.
pub fn fpneigh2tsv<R: BufRead, W: Write>(reader: R, writer: &mut W) -> Result<usize> {

    let written = write_tsv(writer, FpneighReader::new(reader, false), true)?;

    if written == 0 {
        warn!("fpneigh input held no pairs");
    }

    Ok(written)
}
