/// Constants used by the three-stage quality filter.
pub mod filter {
    /// Default minimum pattern-consistency score for C2.
    pub const DEFAULT_C2_THRESHOLD: f32 = 0.6;
    /// Default minimum primary label-flip score for C3.
    pub const DEFAULT_C3_THRESHOLD: f32 = 0.7;
    /// Minimum trimmed character count for a candidate text.
    pub const DEFAULT_MIN_CHARS: usize = 5;
    /// Maximum character count for a candidate text.
    pub const DEFAULT_MAX_CHARS: usize = 1024;
    /// Minimum share of alphabetic characters that must be Latin script.
    pub const DEFAULT_MIN_LATIN_SHARE: f32 = 0.6;
    /// Word count above which the repetition check applies.
    pub const REPETITION_MIN_WORDS: usize = 3;
    /// Prefixes that indicate the model echoed its instructions.
    pub const LEAKAGE_PREFIXES: &[&str] = &[
        "original:",
        "counterfactual:",
        "label:",
        "target:",
        "instructions:",
        "example:",
        "generate",
        "json:",
    ];
    /// Template and chat-format tokens that must never appear verbatim.
    pub const LEAKAGE_TOKENS: &[&str] = &[
        "{{",
        "}}",
        "{%",
        "<|system|>",
        "<|user|>",
        "<|assistant|>",
        "[INST]",
        "[/INST]",
    ];
    /// Structural remnants of JSON or markdown wrapping.
    pub const REMNANT_TOKENS: &[&str] = &["{", "}", "[", "]", "```", "json"];
    /// Truncation suffixes.
    pub const ELLIPSIS_SUFFIXES: &[&str] = &["...", "..", "\u{2026}"];
}

/// Constants used by candidate generation.
pub mod generation {
    /// Default number of retries per candidate slot (attempts = retries + 1).
    pub const DEFAULT_RETRIES: u32 = 2;
    /// Default per-attempt timeout for a generation or scoring call.
    pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
    /// Default linear backoff step between attempts.
    pub const DEFAULT_BACKOFF_MS: u64 = 500;
    /// Default candidates requested per seed.
    pub const DEFAULT_NUM_CANDIDATES: usize = 1;
    /// Default number of concurrent in-flight collaborator calls.
    pub const DEFAULT_CONCURRENCY: usize = 2;
    /// Upper bound applied to configured concurrency.
    pub const MAX_CONCURRENCY: usize = 16;
    /// Prefix for generated candidate identifiers.
    pub const CANDIDATE_ID_PREFIX: &str = "cf-";
    /// Hex characters kept from the candidate digest.
    pub const CANDIDATE_ID_HEX_LEN: usize = 16;
}

/// Constants used by pattern learning and the pattern cache.
pub mod patterns {
    /// Maximum number of patterns retained per label.
    pub const MAX_PATTERNS_PER_LABEL: usize = 5;
    /// Maximum number of examples handed to the learner per label.
    pub const MAX_LEARNING_EXAMPLES: usize = 8;
    /// Labels with fewer examples than this skip learning entirely.
    pub const MIN_LEARNING_EXAMPLES: usize = 2;
    /// Version tag written into every cache entry.
    pub const CACHE_ENTRY_VERSION: u8 = 1;
    /// File name prefix for cache entries.
    pub const CACHE_FILE_PREFIX: &str = "patterns_";
    /// File extension for cache entries.
    pub const CACHE_FILE_EXTENSION: &str = "json";
    /// Separator between rule tokens in the compact rule string.
    pub const RULE_SEPARATOR: char = '+';
}

/// Constants used by demonstration selection.
pub mod selection {
    /// Default composite weight for the C2 pattern score.
    pub const DEFAULT_WEIGHT_C2: f32 = 0.40;
    /// Default composite weight for the C3 primary flip score.
    pub const DEFAULT_WEIGHT_FLIP: f32 = 0.35;
    /// Default composite weight for the C3 soft flip score.
    pub const DEFAULT_WEIGHT_SOFT: f32 = 0.25;
    /// Default number of demonstrations to select.
    pub const DEFAULT_TARGET_K: usize = 10;
    /// Default maximum pairwise similarity between selected members.
    pub const DEFAULT_DIVERSITY_COS_MAX: f32 = 0.9;
    /// Default tie-break seed.
    pub const DEFAULT_SEED: u64 = 42;
    /// Offset mixed into the tie-break seed so selection draws differ from other seeded streams.
    pub const TIE_BREAK_SEED_OFFSET: u64 = 0x7E1E_B4EA;
}

/// Constants used by persisted artifacts.
pub mod artifacts {
    /// Version tag written into DemoSet artifacts.
    pub const DEMO_SET_VERSION: u8 = 1;
    /// File name prefix for DemoSet artifacts.
    pub const DEMO_FILE_PREFIX: &str = "demos_";
    /// File extension for DemoSet artifacts.
    pub const DEMO_FILE_EXTENSION: &str = "json";
    /// Fingerprint characters used in artifact file names.
    pub const FILE_FINGERPRINT_LEN: usize = 16;
    /// Suffix used for in-flight temp files before rename.
    pub const TEMP_SUFFIX: &str = "tmp";
}

/// Constants used for collaborator names in logs and errors.
pub mod collaborators {
    /// Name reported for the pattern learner.
    pub const LEARNER: &str = "pattern_learner";
    /// Name reported for the text generator.
    pub const GENERATOR: &str = "text_generator";
    /// Name reported for the text scorer.
    pub const SCORER: &str = "text_scorer";
    /// Name reported for the text embedder.
    pub const EMBEDDER: &str = "text_embedder";
}
