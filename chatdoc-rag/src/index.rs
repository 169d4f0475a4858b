//! Flat (brute-force) vector index using squared Euclidean distance.
//!
//! The index has no point deletion: entries are only ever appended or
//! replaced wholesale by [`FlatIndex::rebuild`]. Offsets returned by
//! [`FlatIndex::search`] refer to insertion order since the last rebuild,
//! which the engine keeps aligned with the document store's iteration order.

use std::cmp::Ordering;

use crate::error::{RagError, Result};

/// One search hit: the vector's offset in the index and its squared distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub offset: usize,
    pub distance: f32,
}

impl Neighbor {
    /// Similarity in `(0, 1]`, monotonically decreasing in distance.
    pub fn similarity(&self) -> f32 {
        similarity(self.distance)
    }
}

/// Convert a squared Euclidean distance into a similarity score.
pub fn similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Squared Euclidean distance between two equal-length vectors.
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn check_finite(vector: &[f32]) -> Result<()> {
    if vector.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(RagError::IndexError("vector has NaN or infinite components".into()))
    }
}

/// Exact nearest-neighbor index over fixed-dimension vectors.
///
/// The dimension is unset until the first insertion (or a non-empty rebuild)
/// and fixed from then on; vectors are stored contiguously.
#[derive(Debug, Clone, Default)]
pub struct FlatIndex {
    dimension: Option<usize>,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty, unconfigured index.
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixed dimension, if any vector has been inserted.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Number of vectors in the index.
    pub fn len(&self) -> usize {
        match self.dimension {
            Some(dim) if dim > 0 => self.data.len() / dim,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(RagError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    /// Append a vector. The first insertion fixes the dimension.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::DimensionMismatch`] if the vector's length differs
    /// from the fixed dimension, or [`RagError::IndexError`] for an empty
    /// vector or one with NaN or infinite components.
    pub fn insert(&mut self, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(RagError::IndexError("cannot index an empty vector".into()));
        }
        check_finite(vector)?;
        self.check_dimension(vector.len())?;
        self.dimension = Some(vector.len());
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Replace the whole index content with `vectors`, in order.
    ///
    /// An empty input leaves the index empty with its dimension unset. On
    /// error the previous content is kept.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::DimensionMismatch`] if the vectors disagree on length.
    pub fn rebuild<'a, I>(&mut self, vectors: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let mut rebuilt = FlatIndex::new();
        for vector in vectors {
            rebuilt.insert(vector)?;
        }
        *self = rebuilt;
        Ok(())
    }

    /// Return up to `k` nearest vectors by ascending squared distance.
    ///
    /// Ties are broken by offset. An empty index returns an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::DimensionMismatch`] if the query's length differs
    /// from the fixed dimension, and [`RagError::IndexError`] if it has NaN or
    /// infinite components.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        let Some(dim) = self.dimension else {
            return Ok(Vec::new());
        };
        self.check_dimension(query.len())?;
        check_finite(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut neighbors: Vec<Neighbor> = self
            .data
            .chunks_exact(dim)
            .enumerate()
            .map(|(offset, vector)| Neighbor { offset, distance: squared_euclidean(vector, query) })
            .collect();

        let by_distance = |a: &Neighbor, b: &Neighbor| -> Ordering {
            a.distance.total_cmp(&b.distance).then(a.offset.cmp(&b.offset))
        };
        if k < neighbors.len() {
            neighbors.select_nth_unstable_by(k - 1, by_distance);
            neighbors.truncate(k);
        }
        neighbors.sort_by(by_distance);
        Ok(neighbors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_index_returns_nothing() {
        let index = FlatIndex::new();
        assert!(index.is_empty());
        assert_eq!(index.dimension(), None);
        assert!(index.search(&[1.0, 2.0], 5).unwrap().is_empty());
    }

    #[test]
    fn first_insert_fixes_dimension() {
        let mut index = FlatIndex::new();
        index.insert(&[0.0, 0.0]).unwrap();
        assert_eq!(index.dimension(), Some(2));

        let err = index.insert(&[0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn search_orders_by_ascending_distance() {
        let mut index = FlatIndex::new();
        index.insert(&[10.0, 0.0]).unwrap();
        index.insert(&[1.0, 0.0]).unwrap();
        index.insert(&[3.0, 0.0]).unwrap();

        let hits = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], Neighbor { offset: 1, distance: 1.0 });
        assert_eq!(hits[1], Neighbor { offset: 2, distance: 9.0 });
    }

    #[test]
    fn non_finite_vectors_are_rejected() {
        let mut index = FlatIndex::new();
        assert!(matches!(index.insert(&[f32::NAN, 0.0]), Err(RagError::IndexError(_))));
        assert!(index.is_empty());
        assert_eq!(index.dimension(), None);

        index.insert(&[1.0, 0.0]).unwrap();
        assert!(matches!(index.insert(&[0.0, f32::INFINITY]), Err(RagError::IndexError(_))));
        assert!(matches!(index.search(&[f32::NAN, 0.0], 1), Err(RagError::IndexError(_))));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn overflowing_distances_still_sort_last() {
        let mut index = FlatIndex::new();
        index.insert(&[f32::MAX, 0.0]).unwrap();
        index.insert(&[4.0, 0.0]).unwrap();
        index.insert(&[1.0, 0.0]).unwrap();

        let hits = index.search(&[0.0, 0.0], 3).unwrap();
        let offsets: Vec<usize> = hits.iter().map(|hit| hit.offset).collect();
        assert_eq!(offsets, vec![2, 1, 0]);
        assert_eq!(hits[2].distance, f32::INFINITY);
    }

    #[test]
    fn search_returns_all_when_k_exceeds_size() {
        let mut index = FlatIndex::new();
        index.insert(&[1.0]).unwrap();
        index.insert(&[2.0]).unwrap();
        assert_eq!(index.search(&[0.0], 10).unwrap().len(), 2);
    }

    #[test]
    fn search_rejects_wrong_query_dimension() {
        let mut index = FlatIndex::new();
        index.insert(&[1.0, 1.0]).unwrap();
        assert!(matches!(
            index.search(&[1.0], 1),
            Err(RagError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn rebuild_replaces_content() {
        let mut index = FlatIndex::new();
        index.insert(&[1.0, 1.0]).unwrap();
        index.insert(&[2.0, 2.0]).unwrap();

        let survivors = [vec![5.0, 5.0]];
        index.rebuild(survivors.iter().map(Vec::as_slice)).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.search(&[5.0, 5.0], 1).unwrap()[0].offset, 0);

        index.rebuild(std::iter::empty()).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.dimension(), None);
    }

    #[test]
    fn failed_rebuild_keeps_previous_content() {
        let mut index = FlatIndex::new();
        index.insert(&[1.0]).unwrap();
        let mixed = [vec![1.0, 2.0], vec![1.0]];
        assert!(index.rebuild(mixed.iter().map(Vec::as_slice)).is_err());
        assert_eq!(index.len(), 1);
        assert_eq!(index.dimension(), Some(1));
    }

    #[test]
    fn similarity_is_bounded_and_decreasing() {
        assert_eq!(similarity(0.0), 1.0);
        assert!(similarity(1.0) < similarity(0.5));
        assert!(similarity(1e9) > 0.0);
    }
}
