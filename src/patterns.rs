//! Content-addressed cache of learned patterns.
//!
//! Entries are keyed by `(dataset fingerprint, label)`. The fingerprint covers
//! the sorted identifiers of every training example passed in, so any change to
//! the training set invalidates every label's entry.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capabilities::{CallLimiter, PatternLearner};
use crate::config::PatternConfig;
use crate::constants::patterns::{CACHE_ENTRY_VERSION, CACHE_FILE_EXTENSION, CACHE_FILE_PREFIX};
use crate::data::{LabeledExample, Pattern};
use crate::errors::PipelineError;
use crate::hash::{fingerprint_with, sorted_ids_fingerprint, update_part};
use crate::transport::fs::{list_files, read_optional, write_atomic};
use crate::types::{Detail, Fingerprint, Label};

/// Cache key for one label of one training set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Fingerprint over the sorted example identifiers.
    pub fingerprint: Fingerprint,
    /// Label the patterns belong to.
    pub label: Label,
}

impl CacheKey {
    /// Build the key for `label` over `examples`.
    pub fn for_examples(label: &str, examples: &[LabeledExample]) -> Self {
        Self {
            fingerprint: sorted_ids_fingerprint(examples.iter().map(|ex| ex.id.as_str())),
            label: label.to_string(),
        }
    }

    /// Digest combining fingerprint and label; used as the storage address.
    pub fn digest(&self) -> Fingerprint {
        fingerprint_with(|hasher| {
            update_part(hasher, &self.fingerprint);
            update_part(hasher, &self.label);
        })
    }
}

/// Persisted cache entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedPatterns {
    /// Entry format version.
    pub version: u8,
    /// Key the entry was stored under.
    pub key: CacheKey,
    /// Patterns, highest confidence first.
    pub patterns: Vec<Pattern>,
    /// When the patterns were learned.
    pub learned_at: DateTime<Utc>,
}

/// Storage backend for pattern cache entries.
pub trait PatternCache: Send + Sync {
    /// Return the entry for `key`, if present.
    fn load(&self, key: &CacheKey) -> Result<Option<CachedPatterns>, PipelineError>;
    /// Persist `entry`, replacing any previous entry for the same key.
    fn store(&self, entry: &CachedPatterns) -> Result<(), PipelineError>;
}

/// Process-local cache backend.
#[derive(Default)]
pub struct InMemoryPatternCache {
    entries: RwLock<HashMap<CacheKey, CachedPatterns>>,
}

impl InMemoryPatternCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().map(|guard| guard.len()).unwrap_or(0)
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PatternCache for InMemoryPatternCache {
    fn load(&self, key: &CacheKey) -> Result<Option<CachedPatterns>, PipelineError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| PipelineError::PatternCache("lock poisoned".into()))?
            .get(key)
            .cloned())
    }

    fn store(&self, entry: &CachedPatterns) -> Result<(), PipelineError> {
        self.entries
            .write()
            .map_err(|_| PipelineError::PatternCache("lock poisoned".into()))?
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }
}

/// Directory-backed cache: one JSON file per key, replaced atomically.
pub struct FilePatternCache {
    dir: PathBuf,
}

impl fmt::Debug for FilePatternCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePatternCache")
            .field("dir", &self.dir)
            .finish()
    }
}

impl FilePatternCache {
    /// Open (or create) a cache rooted at `dir`.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, PipelineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path holding the entry for `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!(
            "{CACHE_FILE_PREFIX}{}.{CACHE_FILE_EXTENSION}",
            key.digest()
        ))
    }

    /// Every readable entry in the cache directory.
    pub fn entries(&self) -> Vec<CachedPatterns> {
        list_files(&self.dir, CACHE_FILE_PREFIX, CACHE_FILE_EXTENSION)
            .into_iter()
            .filter_map(|path| {
                let bytes = std::fs::read(&path).ok()?;
                match serde_json::from_slice::<CachedPatterns>(&bytes) {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        debug!(
                            "[counterfactuals:patterns] skipping unreadable cache file {}: {err}",
                            path.display()
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

impl PatternCache for FilePatternCache {
    fn load(&self, key: &CacheKey) -> Result<Option<CachedPatterns>, PipelineError> {
        let path = self.path_for(key);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let entry: CachedPatterns = serde_json::from_slice(&bytes).map_err(|err| {
            PipelineError::PatternCache(format!("corrupt cache entry {}: {err}", path.display()))
        })?;
        if entry.version != CACHE_ENTRY_VERSION || entry.key != *key {
            warn!(
                "[counterfactuals:patterns] ignoring stale cache entry {}",
                path.display()
            );
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn store(&self, entry: &CachedPatterns) -> Result<(), PipelineError> {
        let path = self.path_for(&entry.key);
        let raw = serde_json::to_vec_pretty(entry)?;
        write_atomic(&path, &raw).map_err(|err| {
            PipelineError::PatternCache(format!(
                "failed writing cache entry {}: {err}",
                path.display()
            ))
        })
    }
}

/// Where a label's patterns came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PatternOrigin {
    /// Served from the cache without calling the learner.
    Cached,
    /// Freshly learned and persisted.
    Learned,
    /// Too few examples to learn from; general-edit for this label.
    InsufficientExamples,
    /// The learner failed; general-edit for this label. Not cached.
    LearnerFailed(Detail),
}

/// Patterns resolved for one label.
#[derive(Clone, Debug, PartialEq)]
pub struct LearnedPatterns {
    /// Label.
    pub label: Label,
    /// Cache key for this label and training set.
    pub key: CacheKey,
    /// Ordered by confidence, highest first.
    pub patterns: Vec<Pattern>,
    /// Where the patterns came from.
    pub origin: PatternOrigin,
}

impl LearnedPatterns {
    /// True when generation must fall back to general edits.
    pub fn is_general_edit(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Content-addressed pattern store fronting a learner.
pub struct PatternStore {
    cache: Arc<dyn PatternCache>,
    learner: Arc<dyn PatternLearner>,
    config: PatternConfig,
    limiter: Arc<CallLimiter>,
    timeout: Duration,
}

impl PatternStore {
    /// Create a store over `cache` and `learner` with no call timeout.
    pub fn new(
        cache: Arc<dyn PatternCache>,
        learner: Arc<dyn PatternLearner>,
        config: PatternConfig,
    ) -> Self {
        Self {
            cache,
            learner,
            config,
            limiter: Arc::new(CallLimiter::default()),
            timeout: Duration::ZERO,
        }
    }

    /// Bound each learner call by `timeout` (zero disables the bound).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share `limiter` with other collaborator callers.
    pub fn with_limiter(mut self, limiter: Arc<CallLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Return cached patterns for `label`, learning and persisting them on a miss.
    ///
    /// Learner failures degrade this label to general-edit and are not cached.
    /// Cache read/write failures are logged and treated as a miss / skipped write.
    pub fn get_or_learn(
        &self,
        label: &str,
        training_examples: &[LabeledExample],
        force_relearn: bool,
    ) -> LearnedPatterns {
        let key = CacheKey::for_examples(label, training_examples);

        if !force_relearn {
            match self.cache.load(&key) {
                Ok(Some(entry)) => {
                    debug!(
                        "[counterfactuals:patterns] cache hit for '{label}' ({} patterns)",
                        entry.patterns.len()
                    );
                    return LearnedPatterns {
                        label: label.to_string(),
                        key,
                        patterns: entry.patterns,
                        origin: PatternOrigin::Cached,
                    };
                }
                Ok(None) => {}
                Err(err) => warn!(
                    "[counterfactuals:patterns] cache read for '{label}' failed, relearning: {err}"
                ),
            }
        }

        let mut label_examples: Vec<LabeledExample> = training_examples
            .iter()
            .filter(|example| example.label == label)
            .cloned()
            .collect();
        label_examples.sort_by(|a, b| a.id.cmp(&b.id));

        if label_examples.len() < self.config.min_learning_examples {
            info!(
                "[counterfactuals:patterns] '{label}' has {} examples (< {}), using general edits",
                label_examples.len(),
                self.config.min_learning_examples
            );
            self.persist(&key, Vec::new());
            return LearnedPatterns {
                label: label.to_string(),
                key,
                patterns: Vec::new(),
                origin: PatternOrigin::InsufficientExamples,
            };
        }

        label_examples.truncate(self.config.max_learning_examples);
        let learner = Arc::clone(&self.learner);
        let owned_label = label.to_string();
        let learned = self.limiter.call(self.timeout, move || {
            learner.learn(&owned_label, &label_examples)
        });

        match learned {
            Ok(raw) => {
                let patterns = self.normalize(label, raw);
                info!(
                    "[counterfactuals:patterns] learned {} patterns for '{label}'",
                    patterns.len()
                );
                self.persist(&key, patterns.clone());
                LearnedPatterns {
                    label: label.to_string(),
                    key,
                    patterns,
                    origin: PatternOrigin::Learned,
                }
            }
            Err(err) => {
                warn!(
                    "[counterfactuals:patterns] learner failed for '{label}', using general edits: {err}"
                );
                LearnedPatterns {
                    label: label.to_string(),
                    key,
                    patterns: Vec::new(),
                    origin: PatternOrigin::LearnerFailed(err.to_string()),
                }
            }
        }
    }

    fn normalize(&self, label: &str, raw: Vec<Pattern>) -> Vec<Pattern> {
        let mut patterns: Vec<Pattern> = raw
            .into_iter()
            .filter(|pattern| !pattern.tokens.is_empty())
            .map(|mut pattern| {
                pattern.label = label.to_string();
                pattern.confidence = if pattern.confidence.is_finite() {
                    pattern.confidence.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                pattern
            })
            .collect();
        patterns.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });
        patterns.truncate(self.config.max_patterns_per_label);
        for (idx, pattern) in patterns.iter_mut().enumerate() {
            if pattern.id.trim().is_empty() {
                pattern.id = format!("{label}::p{idx}");
            }
        }
        patterns
    }

    fn persist(&self, key: &CacheKey, patterns: Vec<Pattern>) {
        let entry = CachedPatterns {
            version: CACHE_ENTRY_VERSION,
            key: key.clone(),
            patterns,
            learned_at: Utc::now(),
        };
        if let Err(err) = self.cache.store(&entry) {
            warn!(
                "[counterfactuals:patterns] failed to persist patterns for '{}': {err}",
                key.label
            );
        }
    }
}
