//! # tandem-core — Operation-log documents with collaborative containers
//!
//! Every change to a document is an immutable [`Op`]. A [`Document`] keeps
//! the ops it needs and derives its state by replaying them in
//! `(date, source)` order, so replicas holding the same op set converge no
//! matter the order ops arrived in.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  ops   ┌──────────────┐ replay ┌──────────────────────┐
//! │ Mutator     │ ─────► │ Document     │ ─────► │ FieldValue tree      │
//! │ (+ Clock)   │        │ (op log)     │        │ Scalar │ Object      │
//! └─────────────┘        └──────┬───────┘        │ Array  │ Text        │
//!                               │ distill        │ Counter│ Flag        │
//!                               ▼                └──────────────────────┘
//!                        ┌──────────────┐
//!                        │ VersionVector│ ──► ops_to_send(remote version)
//!                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`op`] — op records and the fixed op vocabulary
//! - [`clock`] — monotonic op dates
//! - [`version`] — canonical version vectors
//! - [`sequence`] — tombstoned position-id sequences (arrays, strings)
//! - [`scalar`] — counters and flags
//! - [`value`] — the document field tree
//! - [`document`] — op log, distillation and replay
//! - [`mutation`] — index-addressed mutators emitting ops
//! - [`diff`] — array, id-list and string edit scripts
//! - [`projection`] — field-filtered collection views

pub mod clock;
pub mod diff;
pub mod document;
pub mod mutation;
pub mod op;
pub mod projection;
pub mod scalar;
pub mod sequence;
pub mod value;
pub mod version;

pub use clock::Clock;
pub use diff::{apply_diffs, diff_ids, edit_script, EditOp, QueryDiff};
pub use document::{distill, DocBundle, Document};
pub use mutation::{MutationError, Mutator};
pub use op::{new_id, Op, OpKind};
pub use projection::{Projection, ProjectionError, ID_FIELD};
pub use scalar::{Counter, Flag};
pub use sequence::Sequence;
pub use value::FieldValue;
pub use version::{VersionParseError, VersionVector};
