//! Disk-based storage for pairwise similarity scores between chemical fragments.
//!
//! Scores arrive as raw `(fragment, fragment, score)` triples from an external neighbor search,
//! usually in many independently computed batches. Each batch is imported into a sparse
//! [`pairs::PairStore`], batches are combined with [`merge::merge`], and the result is frozen
//! into a block compressed [`matrix::DenseMatrix`] that answers nearest neighbor queries
//! ([`query::most_similar`]) and bulk exports without loading the whole matrix.
//!
//! Fragments are addressed by dense integer indices assigned by a [`catalog::Catalog`] in
//! insertion order. Indices are local to one store, so everything that crosses stores is keyed
//! by identifier. All pair and matrix data is streamed in bounded frames; only the catalog is
//! held fully in memory.
//!
//! TODO
//! - [x] paged pair store with duplicate detection
//! - [x] merge and freeze in bounded memory
//! - [x] block compressed dense matrix with row queries
//! - [ ] keep a decompressed block cache for repeated queries on the same rows
//!
pub mod error;
pub mod layout;
pub mod data;
pub mod catalog;
pub mod page;
pub mod io;
pub mod dedup;
pub mod pairs;
pub mod reader;
pub mod merge;
pub mod matrix;
pub mod freeze;
pub mod query;
pub mod histogram;

#[cfg(test)]
mod test_util;
