//! `linkwise-linkage`: Fellegi-Sunter probabilistic record linkage engine.
//!
//! Pure engine crate: receives pre-loaded tables and an execution backend,
//! returns candidate pairs, comparison vectors, scores, EM training sessions
//! and a reconciled model. No CLI dependencies.

pub mod backend;
pub mod blocking;
pub mod comparison;
pub mod config;
pub mod em;
pub mod error;
pub mod estimate;
pub mod library;
pub mod linker;
pub mod load;
pub mod memory;
pub mod model;
pub mod predicate;
pub mod reconcile;
pub mod scoring;
pub mod state;
pub mod summary;
pub mod term_frequency;
pub mod vectors;

pub use backend::{Backend, QueryDescription, QueryResult, TableHandle};
pub use blocking::CandidateSet;
pub use comparison::{Comparison, ComparisonLevel, LevelId};
pub use config::LinkerConfig;
pub use em::{CancelToken, EmOptions, EmTrainingSession, SessionRecord, SessionState, TrainingWarning};
pub use error::LinkError;
pub use linker::Linker;
pub use memory::MemoryBackend;
pub use model::{CandidatePair, ComparisonVector, LinkType, PredictionRow, Record, ScoredPair, Table, Value};
pub use predicate::{BlockingRule, Predicate, PredicateCompiler};
pub use reconcile::Reconciliation;
pub use state::ModelState;
