//! Read side of a frozen matrix: nearest neighbours of one fragment and filtered bulk export.
//! Neighbours can also be found on an unfrozen pair store with a scan of its records.
use crate::data::{decode_score, FragmentIndex, RawScore, RawTriple};
use crate::error::{Error, Key, Result};
use crate::matrix::{DenseMatrix, Triangle};
use crate::pairs::PairStore;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::io::BufRead;

/// Identifier suffix of the first fragment of a ligand
pub const FRAG1_SUFFIX: &str = "frag1";

const PDB_CODE_LENGTH: usize = 4;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Hit {
    pub identifier: String,
    pub score: f64,
}

impl Hit {

    pub fn new<S: Into<String>>(identifier: S, score: f64) -> Self {
        Self {
            identifier: identifier.into(),
            score,
        }
    }
}

pub fn hits_to_json(query: &str, hits: &[Hit]) -> Result<String> {

    #[derive(Serialize)]
    struct Response<'a> {
        query: &'a str,
        hits: &'a [Hit],
    }

    Ok(serde_json::to_string_pretty(&Response { query, hits })?)
}

fn cutoff_to_raw(cutoff: f64, precision: RawScore) -> RawScore {
    (cutoff.clamp(0.0, 1.0) * precision as f64) as RawScore
}

/// Fragments scoring at least `cutoff` against `query`, best first, ties by identifier.
///
/// The query itself and pairs never scored are left out. Fails with `NotFound` when the
/// query is not a label of the matrix.
pub fn most_similar(matrix: &DenseMatrix, query: &str, cutoff: f64, limit: Option<usize>) -> Result<Vec<Hit>> {

    let index = matrix.index_of(query)?;
    let cells = matrix.neighbours(index)?;

    let min_raw = cutoff_to_raw(cutoff, matrix.config.precision);

    let mut hits: Vec<Hit> = Vec::new();
    for (column, raw) in cells.into_iter().enumerate() {

        if column == index as usize || raw == 0 || raw < min_raw {
            continue;
        }

        hits.push(Hit::new(matrix.label_of(column as u32)?, matrix.decode(raw)));
    }

    Ok(rank(hits, limit))
}

/// Best first, ties by identifier, cut to `limit`.
fn rank(mut hits: Vec<Hit>, limit: Option<usize>) -> Vec<Hit> {

    hits.sort_by(|x, y| {
        y.score.partial_cmp(&x.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| x.identifier.cmp(&y.identifier))
    });

    if let Some(limit) = limit {
        hits.truncate(limit);
    }

    hits
}

/// [`most_similar`] answered from an unfrozen store by streaming its records once.
///
/// Pairs are matched on either member. A pair stored in both orientations (full matrix
/// stores) counts once, with its higher score.
pub fn most_similar_in_store(store: &PairStore, query: &str, cutoff: f64, limit: Option<usize>) -> Result<Vec<Hit>> {

    let index = match store.catalog().get(query) {
        Some(index) => index,
        None => return Err(Error::NotFound(Key::from(query))),
    };

    let precision = store.config.precision;
    let min_raw = cutoff_to_raw(cutoff, precision);

    let mut best: FxHashMap<FragmentIndex, RawScore> = FxHashMap::default();

    for frame in store.iterate(store.config.frame_size)? {
        for record in frame? {

            let other = match (record.a == index, record.b == index) {
                (true, false) => record.b,
                (false, true) => record.a,
                _ => continue,
            };

            if record.score == 0 || record.score < min_raw {
                continue;
            }

            let score = best.entry(other).or_insert(0);
            *score = (*score).max(record.score);
        }
    }

    let mut hits: Vec<Hit> = Vec::with_capacity(best.len());
    for (other, raw) in best.into_iter() {
        hits.push(Hit::new(store.catalog().resolve(other)?, decode_score(raw, precision)));
    }

    Ok(rank(hits, limit))
}

/// Structure code of a fragment: its first four characters, lower-cased.
pub fn pdb_code(identifier: &str) -> String {
    identifier.chars().take(PDB_CODE_LENGTH).collect::<String>().to_lowercase()
}

/// Reads one structure code per line.
pub fn load_pdb_codes<R: BufRead>(reader: R) -> Result<HashSet<String>> {

    let mut codes = HashSet::new();
    for line in reader.lines() {
        let line = line?;
        let code = line.trim();
        if !code.is_empty() {
            codes.insert(code.to_lowercase());
        }
    }

    Ok(codes)
}

#[derive(Debug, Clone, PartialEq)]
pub enum PdbFilter {
    Allow(HashSet<String>),
    Deny(HashSet<String>),
}

impl PdbFilter {

    fn passes(&self, a: &str, b: &str) -> bool {
        match self {
            PdbFilter::Allow(codes) => codes.contains(&pdb_code(a)) || codes.contains(&pdb_code(b)),
            PdbFilter::Deny(codes) => !codes.contains(&pdb_code(a)) && !codes.contains(&pdb_code(b)),
        }
    }
}

/// Predicates applied to pairs on export and filtering. Unset predicates pass everything.
#[derive(Debug, Default, Clone)]
pub struct ExportFilter {
    /// Keep only pairs with a member in this set
    pub keep: Option<HashSet<String>>,
    /// Drop pairs with a member in this set
    pub skip: Option<HashSet<String>>,
    /// Keep only pairs with a member ending in `frag1`
    pub frag1: bool,
    pub pdb: Option<PdbFilter>,
    pub limit: Option<usize>,
}

impl ExportFilter {

    pub fn passes(&self, a: &str, b: &str) -> bool {

        if let Some(keep) = &self.keep {
            if !keep.contains(a) && !keep.contains(b) {
                return false;
            }
        }

        if let Some(skip) = &self.skip {
            if skip.contains(a) || skip.contains(b) {
                return false;
            }
        }

        if self.frag1 && !a.ends_with(FRAG1_SUFFIX) && !b.ends_with(FRAG1_SUFFIX) {
            return false;
        }

        match &self.pdb {
            Some(pdb) => pdb.passes(a, b),
            None => true,
        }
    }

    /// Lazily filters `rows`, stopping after `limit` accepted rows. Errors are passed through.
    pub fn apply<'a, I>(&'a self, rows: I) -> impl Iterator<Item = Result<RawTriple>> + 'a
    where I: IntoIterator<Item = Result<RawTriple>>, I::IntoIter: 'a {

        rows.into_iter()
            .filter(move |row| match row {
                Ok(row) => self.passes(&row.a, &row.b),
                Err(_) => true,
            })
            .take(self.limit.unwrap_or(usize::MAX))
    }
}

/// Streams the scored pairs of a matrix that pass `filter`, each pair once.
pub fn export<'a>(matrix: &'a DenseMatrix, filter: &'a ExportFilter) -> Result<impl Iterator<Item = Result<RawTriple>> + 'a> {

    let labels = matrix.labels().all_labels()?;

    let triangle = match matrix.is_single_sided() {
        true => Triangle::Both,
        false => Triangle::Upper,
    };

    let rows = matrix.cells(triangle).map(move |cell| {
        cell.map(|(a, b, raw)| RawTriple::new(labels[a as usize].clone(), labels[b as usize].clone(), matrix.decode(raw)))
    });

    Ok(filter.apply(rows))
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::test_util::test_dir;
    use crate::data::{encode_score, DEFAULT_PRECISION};
    use crate::freeze::{freeze, FreezeConfig};
    use crate::pairs::StoreConfig;
    use assert_approx_eq::assert_approx_eq;
    use rand::prelude::*;
    use std::io::Cursor;
    use std::path::Path;

    fn frozen(root: &Path, triples: &[(String, String, f64)], single_sided: bool) -> DenseMatrix {

        let mut store = PairStore::create_with_config(StoreConfig::with_directory(root.join("pairs"))).unwrap();
        let rows = triples.iter().map(|(a, b, s)| Ok(RawTriple::new(a.clone(), b.clone(), *s)));
        store.import(rows, false).unwrap();

        let config = FreezeConfig { frame_size: 10, single_sided, ..FreezeConfig::default() };
        freeze(&store, &root.join("matrix"), &config).unwrap()
    }

    fn owned(triples: &[(&str, &str, f64)]) -> Vec<(String, String, f64)> {
        triples.iter().map(|(a, b, s)| (a.to_string(), b.to_string(), *s)).collect()
    }

    fn four_fragments(name: &str, single_sided: bool) -> DenseMatrix {
        let triples = owned(&[("a", "b", 0.9), ("a", "c", 0.5), ("b", "c", 0.6), ("c", "d", 0.7)]);
        frozen(&test_dir(name), &triples, single_sided)
    }

    #[test]
    fn most_similar_three_fragments() {

        let triples = owned(&[("f1", "f2", 0.9), ("f2", "f3", 0.5)]);
        let matrix = frozen(&test_dir("query_three"), &triples, false);

        let hits = most_similar(&matrix, "f1", 0.6, Some(5)).unwrap();

        assert_eq!(hits, vec![Hit::new("f2", 0.9)]);
    }

    #[test]
    fn most_similar_cutoff_and_limit() {

        let matrix = four_fragments("query_four", false);

        assert_eq!(most_similar(&matrix, "c", 0.55, None).unwrap(), vec![Hit::new("d", 0.7), Hit::new("b", 0.6)]);
        assert_eq!(most_similar(&matrix, "c", 0.55, Some(1)).unwrap(), vec![Hit::new("d", 0.7)]);
        assert!(most_similar(&matrix, "c", 0.9, None).unwrap().is_empty());
        assert!(matches!(most_similar(&matrix, "f", 0.45, None), Err(Error::NotFound(_))));
    }

    #[test]
    fn most_similar_single_sided_sees_both_halves() {

        let matrix = four_fragments("query_single_sided", true);

        let hits = most_similar(&matrix, "c", 0.0, None).unwrap();

        assert_eq!(hits, vec![Hit::new("d", 0.7), Hit::new("b", 0.6), Hit::new("a", 0.5)]);
    }

    #[test]
    fn most_similar_breaks_ties_by_identifier() {

        let triples = owned(&[("q", "z", 0.5), ("a", "q", 0.5), ("m", "q", 0.8)]);
        let matrix = frozen(&test_dir("query_ties"), &triples, false);

        let hits = most_similar(&matrix, "q", 0.1, None).unwrap();
        let identifiers: Vec<&str> = hits.iter().map(|x| x.identifier.as_str()).collect();

        assert_eq!(identifiers, vec!["m", "a", "z"]);
    }

    #[test]
    fn most_similar_matches_brute_force() {

        let mut rng = StdRng::seed_from_u64(42);
        let labels: Vec<String> = (0..30).map(|i| format!("{}_frag{}", 1000 + i, i % 3 + 1)).collect();

        let mut triples: Vec<(String, String, f64)> = Vec::new();
        for i in 0..labels.len() {
            for j in i + 1..labels.len() {
                if rng.gen_bool(0.3) {
                    let score = rng.gen_range(1..=10000) as f64 / 10000.0;
                    triples.push((labels[i].clone(), labels[j].clone(), score));
                }
            }
        }

        let matrix = frozen(&test_dir("query_brute_force"), &triples, false);

        for _ in 0..20 {

            let query = &labels[rng.gen_range(0..labels.len())];
            let cutoff = rng.gen_range(0.0..1.0);
            let limit = rng.gen_range(1..10);

            let mut expected: Vec<Hit> = triples.iter()
                .filter_map(|(a, b, s)| match (a == query, b == query) {
                    (true, _) => Some((b.clone(), encode_score(*s, DEFAULT_PRECISION).unwrap())),
                    (_, true) => Some((a.clone(), encode_score(*s, DEFAULT_PRECISION).unwrap())),
                    _ => None,
                })
                .filter(|(_, raw)| *raw >= cutoff_to_raw(cutoff, DEFAULT_PRECISION))
                .map(|(identifier, raw)| Hit::new(identifier, decode_score(raw, DEFAULT_PRECISION)))
                .collect();
            expected.sort_by(|x, y| y.score.partial_cmp(&x.score).unwrap().then_with(|| x.identifier.cmp(&y.identifier)));
            expected.truncate(limit);

            let found = most_similar(&matrix, query, cutoff, Some(limit)).unwrap();

            assert_eq!(found.len(), expected.len());
            for (x, y) in found.iter().zip(expected.iter()) {
                assert_eq!(x.identifier, y.identifier);
                assert_approx_eq!(x.score, y.score);
            }
        }
    }

    #[test]
    fn export_each_pair_once() {

        let matrix = four_fragments("query_export", false);
        let filter = ExportFilter::default();

        let rows: Vec<RawTriple> = export(&matrix, &filter).unwrap().map(|x| x.unwrap()).collect();

        assert_eq!(rows, vec![
            RawTriple::new("a", "b", 0.9),
            RawTriple::new("a", "c", 0.5),
            RawTriple::new("b", "c", 0.6),
            RawTriple::new("c", "d", 0.7),
        ]);
    }

    #[test]
    fn export_filters() {

        let matrix = four_fragments("query_export_filters", false);

        let mut filter = ExportFilter::default();
        filter.skip = Some(["a".to_string()].into_iter().collect());
        filter.limit = Some(1);

        let rows: Vec<RawTriple> = export(&matrix, &filter).unwrap().map(|x| x.unwrap()).collect();
        assert_eq!(rows, vec![RawTriple::new("b", "c", 0.6)]);

        let mut filter = ExportFilter::default();
        filter.keep = Some(["d".to_string()].into_iter().collect());

        let rows: Vec<RawTriple> = export(&matrix, &filter).unwrap().map(|x| x.unwrap()).collect();
        assert_eq!(rows, vec![RawTriple::new("c", "d", 0.7)]);
    }

    #[test]
    fn frag1_and_pdb_predicates() {

        let mut filter = ExportFilter::default();
        filter.frag1 = true;

        assert!(filter.passes("1abc_XYZ_frag1", "2xyz_ABC_frag3"));
        assert!(!filter.passes("1abc_XYZ_frag2", "2xyz_ABC_frag3"));

        let codes = load_pdb_codes(Cursor::new("1ABC\n\n3def\n")).unwrap();
        assert_eq!(pdb_code("1ABC_XYZ_frag1"), "1abc");

        let mut filter = ExportFilter::default();
        filter.pdb = Some(PdbFilter::Allow(codes.clone()));
        assert!(filter.passes("1ABC_XYZ_frag1", "2xyz_ABC_frag3"));
        assert!(!filter.passes("4zzz_XYZ_frag1", "2xyz_ABC_frag3"));

        filter.pdb = Some(PdbFilter::Deny(codes));
        assert!(!filter.passes("3def_XYZ_frag1", "2xyz_ABC_frag3"));
        assert!(filter.passes("4zzz_XYZ_frag1", "2xyz_ABC_frag3"));
    }

    #[test]
    fn hits_as_json() {

        let json = hits_to_json("f1", &[Hit::new("f2", 0.9)]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["query"], "f1");
        assert_eq!(value["hits"][0]["identifier"], "f2");
        assert_eq!(value["hits"][0]["score"], 0.9);
    }

    #[test]
    fn store_and_matrix_agree() {

        let root = test_dir("query_store");

        let mut rng = StdRng::seed_from_u64(7);
        let labels: Vec<String> = (0..25).map(|i| format!("frag{:02}", i)).collect();

        let mut rows: Vec<Result<RawTriple>> = Vec::new();
        for i in 0..labels.len() {
            for j in i + 1..labels.len() {
                if rng.gen_bool(0.4) {
                    let score = rng.gen_range(1..=10000) as f64 / 10000.0;
                    //reversed rows are flipped on import
                    match rng.gen_bool(0.5) {
                        true => rows.push(Ok(RawTriple::new(labels[i].clone(), labels[j].clone(), score))),
                        false => rows.push(Ok(RawTriple::new(labels[j].clone(), labels[i].clone(), score))),
                    }
                }
            }
        }

        let mut config = StoreConfig::with_directory(root.join("pairs"));
        config.frame_size = 17;
        let mut store = PairStore::create_with_config(config).unwrap();
        store.import(rows, false).unwrap();

        let matrix = freeze(&store, &root.join("matrix"), &FreezeConfig::default()).unwrap();

        for query in labels.iter() {
            for (cutoff, limit) in [(0.0, None), (0.5, Some(3)), (0.9, Some(10))] {
                assert_eq!(most_similar_in_store(&store, query, cutoff, limit).unwrap(),
                           most_similar(&matrix, query, cutoff, limit).unwrap());
            }
        }

        assert!(matches!(most_similar_in_store(&store, "missing", 0.5, None), Err(Error::NotFound(_))));
    }

    #[test]
    fn store_query_counts_full_matrix_pairs_once() {

        let mut config = StoreConfig::with_directory(test_dir("query_store_full").join("pairs"));
        config.full_matrix = true;
        let mut store = PairStore::create_with_config(config).unwrap();

        let rows = vec![Ok(RawTriple::new("a", "b", 0.5)), Ok(RawTriple::new("b", "a", 0.5)), Ok(RawTriple::new("c", "a", 0.7))];
        store.import(rows, false).unwrap();

        let hits = most_similar_in_store(&store, "a", 0.1, None).unwrap();

        assert_eq!(hits, vec![Hit::new("c", 0.7), Hit::new("b", 0.5)]);
    }
}
