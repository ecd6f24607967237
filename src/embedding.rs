//! Embedding providers for the semantic half of similarity scoring.
//!
//! The engine never depends on a particular model. [`EmbeddingProvider`] is
//! the seam; [`LexicalHashEmbedder`] is a deterministic, offline baseline
//! using feature hashing over tokens, and [`BoundedEmbedder`] wraps any
//! provider so a slow or hung backend costs at most one timeout per call.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use blake3::Hasher;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use tracing::debug;

use crate::error::SimilarityComputationError;

/// Default embedding dimensionality for lexical embeddings.
pub const DEFAULT_EMBEDDING_DIM: usize = 64;

/// Turns text into a fixed-length vector.
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds one piece of text.
    ///
    /// # Errors
    ///
    /// Any failure; callers degrade to lexical-only scoring.
    fn embed(&self, text: &str) -> Result<Vec<f32>, SimilarityComputationError>;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;
}

fn tokenize(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty())
}

/// Feature-hashing embedder.
///
/// Not a neural model: texts that share tokens land close together, which
/// is enough to exercise the semantic path deterministically.
#[derive(Debug, Clone, Copy)]
pub struct LexicalHashEmbedder {
    dim: usize,
}

impl Default for LexicalHashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl LexicalHashEmbedder {
    /// An embedder producing `dim`-dimensional vectors.
    #[must_use]
    pub const fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// Embeds `text`; never fails.
    #[must_use]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        if self.dim == 0 {
            return Vec::new();
        }

        let mut vec = vec![0.0f32; self.dim];
        for token in tokenize(&text.to_lowercase()) {
            let mut h = Hasher::new();
            h.update(token.as_bytes());
            let hash = h.finalize();
            let bytes = hash.as_bytes();

            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&bytes[..8]);
            #[allow(clippy::cast_possible_truncation)]
            let idx = (u64::from_le_bytes(bucket) % self.dim as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0f32 } else { -1.0f32 };
            vec[idx] += sign;
        }

        let norm2: f64 = vec.iter().map(|&x| f64::from(x) * f64::from(x)).sum();
        if norm2 > 0.0 {
            #[allow(clippy::cast_possible_truncation)]
            let inv = norm2.sqrt().recip() as f32;
            for x in &mut vec {
                *x *= inv;
            }
        }
        vec
    }
}

impl EmbeddingProvider for LexicalHashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, SimilarityComputationError> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Cosine similarity, or `None` for mismatched lengths or zero vectors.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= 0.0 || nb <= 0.0 {
        return None;
    }
    Some(dot / (na.sqrt() * nb.sqrt()))
}

type EmbedReply = Result<Vec<f32>, SimilarityComputationError>;

struct EmbedJob {
    text: String,
    reply: Sender<EmbedReply>,
}

/// Runs a provider on a dedicated worker thread with a per-call timeout.
///
/// Calls beyond the queue capacity fail fast instead of piling up behind a
/// slow backend.
pub struct BoundedEmbedder {
    tx: Sender<EmbedJob>,
    _worker: JoinHandle<()>,
    timeout: Duration,
    dimension: usize,
}

impl BoundedEmbedder {
    /// Starts the worker.
    ///
    /// # Errors
    ///
    /// `ProviderUnavailable` if the thread cannot be spawned.
    pub fn start(
        inner: Arc<dyn EmbeddingProvider>,
        timeout: Duration,
        queue_capacity: usize,
    ) -> Result<Self, SimilarityComputationError> {
        let (tx, rx) = bounded::<EmbedJob>(queue_capacity.max(1));
        let dimension = inner.dimension();
        let worker = thread::Builder::new()
            .name("kc-embedder".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let result = inner.embed(&job.text);
                    // The caller may have timed out and gone away.
                    let _ = job.reply.send(result);
                }
                debug!("embedding worker stopped");
            })
            .map_err(|e| SimilarityComputationError::ProviderUnavailable {
                message: format!("cannot spawn embedding worker: {e}"),
            })?;

        Ok(Self {
            tx,
            _worker: worker,
            timeout,
            dimension,
        })
    }
}

impl EmbeddingProvider for BoundedEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, SimilarityComputationError> {
        let (reply, rx) = bounded::<EmbedReply>(1);
        match self.tx.try_send(EmbedJob {
            text: text.to_string(),
            reply,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(SimilarityComputationError::ProviderUnavailable {
                    message: "embedding queue full".to_string(),
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(SimilarityComputationError::WorkerDisconnected)
            }
        }

        let vector = rx.recv_timeout(self.timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => SimilarityComputationError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => SimilarityComputationError::WorkerDisconnected,
        })??;

        if vector.len() != self.dimension {
            return Err(SimilarityComputationError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Bounded memo of embeddings keyed by a hash of the text.
///
/// When full, the cache is cleared rather than evicting entry by entry.
#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    entries: RwLock<HashMap<[u8; 32], Arc<[f32]>>>,
}

impl EmbeddingCache {
    /// A capacity of zero disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(text: &str) -> [u8; 32] {
        *blake3::hash(text.as_bytes()).as_bytes()
    }

    /// Returns the cached vector for `text`, computing it on a miss.
    ///
    /// # Errors
    ///
    /// Whatever `compute` returns; failures are not cached.
    pub fn get_or_compute<E>(
        &self,
        text: &str,
        compute: impl FnOnce(&str) -> Result<Vec<f32>, E>,
    ) -> Result<Arc<[f32]>, E> {
        if self.capacity == 0 {
            return compute(text).map(Arc::from);
        }
        let key = Self::key(text);
        if let Ok(guard) = self.entries.read() {
            if let Some(hit) = guard.get(&key) {
                return Ok(Arc::clone(hit));
            }
        }

        let vector: Arc<[f32]> = Arc::from(compute(text)?);
        if let Ok(mut guard) = self.entries.write() {
            if guard.len() >= self.capacity {
                guard.clear();
            }
            guard.entry(key).or_insert_with(|| Arc::clone(&vector));
        }
        Ok(vector)
    }

    /// Number of cached vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |g| g.len())
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
