//! Classfile reading and writing for the class tree.
//!
//! The reader expands stack-map frames into pseudo-instructions so that
//! instruction cloning can never carry stale frames; the writer ignores
//! frame nodes and recomputes both `max_stack` and the `StackMapTable`
//! through a dataflow pass, resolving common-superclass queries through
//! [`SuperclassResolver`].

pub mod frames;
pub mod reader;
pub mod writer;

pub use frames::{NoResolver, SuperclassResolver};
pub use reader::{parse, parse_header, ClassHeader};
pub use writer::write;
