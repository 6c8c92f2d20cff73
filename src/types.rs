/// Class label declared by the task.
/// Examples: `price`, `service`, `anger`
pub type Label = String;
/// Stable identifier of a labeled training example (used for cache fingerprints).
/// Example: `restaurant::train::0042`
pub type ExampleId = String;
/// Identifier of a learned pattern, unique within its label.
/// Example: `price::p0`
pub type PatternId = String;
/// Identifier of a generated candidate (stable for a given seed, target, slot, and run seed).
/// Example: `cf-3f9a61c0d2e4b7a1`
pub type CandidateId = String;
/// Lowercase hex digest produced by the content-addressing hasher.
/// Example: `9c1e5d...` (64 hex chars)
pub type Fingerprint = String;
/// Free-form warning or diagnostic detail attached to records and events.
/// Examples: `unmatched quotes`, `learner timed out after 30000ms`
pub type Detail = String;
