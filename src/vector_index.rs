//! Per-repository nearest-neighbor index registry.
//!
//! Each repository owns a flat (exhaustive) index over squared-L2 distance
//! plus one [`EmbeddingMetadata`] row per vector. The registry is the single
//! owner of this state: the ingestion orchestrator appends, the deletion
//! path removes, and any number of retrievers read concurrently.
//!
//! # Persistence
//!
//! Every successful [`add`](VectorIndexRegistry::add) writes the whole
//! repository index through to `<data_dir>/repo_<id>.index` and
//! `<data_dir>/repo_<id>_meta.json` before returning. There is no background
//! flush. [`load_all`](VectorIndexRegistry::load_all) rehydrates the registry
//! at startup, skipping files that are missing a partner or fail to parse.
//!
//! Index file layout (little-endian):
//!
//! ```text
//! "RLVI" | version: u32 | dims: u32 | count: u64 | count × dims × f32
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

use crate::error::IndexError;
use crate::models::EmbeddingMetadata;

const MAGIC: &[u8; 4] = b"RLVI";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Exhaustive squared-L2 index over fixed-dimension vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatL2Index {
    dims: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: bad.len(),
            });
        }
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.data.truncate(len * self.dims);
    }

    /// Up to `k` `(position, distance)` pairs, nearest first. Ties keep
    /// insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if query.len() != self.dims || k == 0 || self.dims == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(pos, v)| (pos, squared_l2(query, v)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for v in &self.data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            return Err(IndexError::Corrupt("bad header".to_string()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(IndexError::Corrupt(format!("unsupported version {}", version)));
        }
        let dims = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[12..20]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let payload = &bytes[HEADER_LEN..];
        let expected = count
            .checked_mul(dims)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| IndexError::Corrupt("size overflow".to_string()))?;
        if payload.len() != expected {
            return Err(IndexError::Corrupt(format!(
                "expected {} payload bytes, found {}",
                expected,
                payload.len()
            )));
        }

        let data = payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self { dims, data })
    }
}

/// Squared Euclidean distance. Callers guarantee equal lengths.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Result of a k-nearest-neighbor query: positions into the repository's
/// metadata and their distances, nearest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub ids: Vec<usize>,
    pub distances: Vec<f32>,
}

impl SearchHits {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

struct RepoIndex {
    index: FlatL2Index,
    metadata: Vec<EmbeddingMetadata>,
}

/// Process-wide mapping from repository id to its index.
pub struct VectorIndexRegistry {
    base_dir: PathBuf,
    indexes: RwLock<HashMap<i64, RepoIndex>>,
}

pub fn index_path(base_dir: &Path, repo_id: i64) -> PathBuf {
    base_dir.join(format!("repo_{}.index", repo_id))
}

pub fn metadata_path(base_dir: &Path, repo_id: i64) -> PathBuf {
    base_dir.join(format!("repo_{}_meta.json", repo_id))
}

fn parse_repo_id(file_name: &str) -> Option<i64> {
    file_name
        .strip_prefix("repo_")?
        .strip_suffix(".index")?
        .parse()
        .ok()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

impl VectorIndexRegistry {
    /// Empty registry persisting under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Registry populated from every `repo_<id>.index` under `base_dir`.
    pub fn load_all(base_dir: impl Into<PathBuf>) -> Self {
        let registry = Self::new(base_dir);
        let entries = match std::fs::read_dir(&registry.base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                info!(dir = %registry.base_dir.display(), error = %e, "no persisted vector indexes");
                return registry;
            }
        };

        let mut loaded = HashMap::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(repo_id) = parse_repo_id(&name) else {
                continue;
            };
            match registry.read_repo(repo_id) {
                Ok(repo) => {
                    info!(repo_id, vectors = repo.index.len(), "loaded vector index");
                    loaded.insert(repo_id, repo);
                }
                Err(e) => warn!(repo_id, error = %e, "skipping unreadable vector index"),
            }
        }

        *registry
            .indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner) = loaded;
        registry
    }

    fn read_repo(&self, repo_id: i64) -> Result<RepoIndex, IndexError> {
        let index = FlatL2Index::from_bytes(&std::fs::read(index_path(&self.base_dir, repo_id))?)?;
        let metadata: Vec<EmbeddingMetadata> = serde_json::from_str(&std::fs::read_to_string(
            metadata_path(&self.base_dir, repo_id),
        )?)?;
        if metadata.len() != index.len() {
            return Err(IndexError::LengthMismatch {
                vectors: index.len(),
                metadata: metadata.len(),
            });
        }
        Ok(RepoIndex { index, metadata })
    }

    fn persist(&self, repo_id: i64, repo: &RepoIndex) -> Result<(), IndexError> {
        std::fs::create_dir_all(&self.base_dir)?;
        write_atomic(&index_path(&self.base_dir, repo_id), &repo.index.to_bytes())?;
        write_atomic(
            &metadata_path(&self.base_dir, repo_id),
            serde_json::to_string(&repo.metadata)?.as_bytes(),
        )?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Append vectors for a repository and write the index through to disk.
    ///
    /// The first insert fixes the dimensionality. On any failure the
    /// in-memory index is left as it was before the call.
    pub fn add(
        &self,
        repo_id: i64,
        vectors: &[Vec<f32>],
        metadata: Vec<EmbeddingMetadata>,
    ) -> Result<(), IndexError> {
        if vectors.len() != metadata.len() {
            return Err(IndexError::LengthMismatch {
                vectors: vectors.len(),
                metadata: metadata.len(),
            });
        }
        let Some(first) = vectors.first() else {
            return Ok(());
        };

        let mut indexes = self.indexes.write().unwrap_or_else(PoisonError::into_inner);
        let created = !indexes.contains_key(&repo_id);
        let repo = indexes.entry(repo_id).or_insert_with(|| RepoIndex {
            index: FlatL2Index::new(first.len()),
            metadata: Vec::new(),
        });

        let before = repo.index.len();
        let result = match repo.index.add(vectors) {
            Ok(()) => {
                repo.metadata.extend(metadata);
                self.persist(repo_id, repo)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if created {
                indexes.remove(&repo_id);
            } else if let Some(repo) = indexes.get_mut(&repo_id) {
                repo.index.truncate(before);
                repo.metadata.truncate(before);
            }
            return Err(e);
        }
        Ok(())
    }

    /// k-nearest neighbors by squared L2. Empty when the repository has no
    /// index or the query dimensionality does not match.
    pub fn search(&self, repo_id: i64, query: &[f32], k: usize) -> SearchHits {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let Some(repo) = indexes.get(&repo_id) else {
            return SearchHits::default();
        };
        if query.len() != repo.index.dims() {
            warn!(
                repo_id,
                expected = repo.index.dims(),
                actual = query.len(),
                "query dimensionality mismatch"
            );
            return SearchHits::default();
        }
        let (ids, distances) = repo.index.search(query, k).into_iter().unzip();
        SearchHits { ids, distances }
    }

    /// Metadata rows for the given search positions, in the same order.
    /// Positions outside the metadata are dropped.
    pub fn resolve(&self, repo_id: i64, ids: &[usize]) -> Vec<EmbeddingMetadata> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        let Some(repo) = indexes.get(&repo_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|&id| repo.metadata.get(id).cloned())
            .collect()
    }

    pub fn metadata(&self, repo_id: i64) -> Vec<EmbeddingMetadata> {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes
            .get(&repo_id)
            .map(|repo| repo.metadata.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, repo_id: i64) -> usize {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes.get(&repo_id).map(|r| r.index.len()).unwrap_or(0)
    }

    pub fn contains(&self, repo_id: i64) -> bool {
        let indexes = self.indexes.read().unwrap_or_else(PoisonError::into_inner);
        indexes.contains_key(&repo_id)
    }

    /// Remove a repository's index from memory and disk. Idempotent.
    pub fn delete(&self, repo_id: i64) -> Result<(), IndexError> {
        self.indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&repo_id);

        for path in [
            index_path(&self.base_dir, repo_id),
            metadata_path(&self.base_dir, repo_id),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(chunk_id: i64) -> EmbeddingMetadata {
        EmbeddingMetadata {
            chunk_id,
            file_path: format!("f{}.rs", chunk_id),
            token_count: 10,
        }
    }

    #[test]
    fn test_search_orders_by_distance() {
        let tmp = TempDir::new().unwrap();
        let registry = VectorIndexRegistry::new(tmp.path());
        registry
            .add(
                1,
                &[vec![0.0, 0.0], vec![5.0, 5.0], vec![1.0, 0.0]],
                vec![meta(10), meta(11), meta(12)],
            )
            .unwrap();

        let hits = registry.search(1, &[0.9, 0.0], 2);
        assert_eq!(hits.ids, vec![2, 0]);
        assert!((hits.distances[0] - 0.01).abs() < 1e-5);
        assert!((hits.distances[1] - 0.81).abs() < 1e-5);

        let resolved = registry.resolve(1, &hits.ids);
        assert_eq!(resolved[0].chunk_id, 12);
        assert_eq!(resolved[1].chunk_id, 10);
    }

    #[test]
    fn test_search_missing_repo_is_empty() {
        let tmp = TempDir::new().unwrap();
        let registry = VectorIndexRegistry::new(tmp.path());
        assert!(registry.search(42, &[1.0], 4).is_empty());
    }

    #[test]
    fn test_dimension_fixed_by_first_insert() {
        let tmp = TempDir::new().unwrap();
        let registry = VectorIndexRegistry::new(tmp.path());
        registry.add(1, &[vec![1.0, 2.0]], vec![meta(1)]).unwrap();

        let err = registry
            .add(1, &[vec![1.0, 2.0, 3.0]], vec![meta(2)])
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(registry.len(1), 1);
        assert!(registry.search(1, &[1.0, 2.0, 3.0], 1).is_empty());
    }

    #[test]
    fn test_write_through_and_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let registry = VectorIndexRegistry::new(tmp.path());
            registry.add(3, &[vec![1.0, 0.0]], vec![meta(1)]).unwrap();
            registry.add(3, &[vec![0.0, 1.0]], vec![meta(2)]).unwrap();
            registry.add(4, &[vec![0.5]], vec![meta(9)]).unwrap();
        }

        let reloaded = VectorIndexRegistry::load_all(tmp.path());
        assert_eq!(reloaded.len(3), 2);
        assert_eq!(reloaded.len(4), 1);
        assert_eq!(reloaded.metadata(3), vec![meta(1), meta(2)]);
        assert_eq!(reloaded.search(3, &[0.0, 1.0], 1).ids, vec![1]);
    }

    #[test]
    fn test_load_all_skips_corrupt_files() {
        let tmp = TempDir::new().unwrap();
        let registry = VectorIndexRegistry::new(tmp.path());
        registry.add(1, &[vec![1.0]], vec![meta(1)]).unwrap();

        std::fs::write(index_path(tmp.path(), 2), b"garbage").unwrap();
        std::fs::write(metadata_path(tmp.path(), 2), b"[]").unwrap();
        std::fs::write(index_path(tmp.path(), 3), FlatL2Index::new(1).to_bytes()).unwrap();

        let reloaded = VectorIndexRegistry::load_all(tmp.path());
        assert!(reloaded.contains(1));
        assert!(!reloaded.contains(2));
        assert!(!reloaded.contains(3));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let registry = VectorIndexRegistry::new(tmp.path());
        registry.add(1, &[vec![1.0]], vec![meta(1)]).unwrap();
        assert!(index_path(tmp.path(), 1).exists());

        registry.delete(1).unwrap();
        assert!(!registry.contains(1));
        assert!(!index_path(tmp.path(), 1).exists());
        assert!(!metadata_path(tmp.path(), 1).exists());
        registry.delete(1).unwrap();
    }

    #[test]
    fn test_bytes_round_trip_rejects_truncation() {
        let mut index = FlatL2Index::new(3);
        index.add(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        let bytes = index.to_bytes();
        assert_eq!(FlatL2Index::from_bytes(&bytes).unwrap(), index);
        assert!(FlatL2Index::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let tmp = TempDir::new().unwrap();
        let registry = VectorIndexRegistry::new(tmp.path());
        assert!(registry.add(1, &[vec![1.0]], vec![]).is_err());
        assert!(!registry.contains(1));
    }
}
