//! Reduction by key: a partitioned probing hash table and the phases around the exchange.

pub mod index_function;
pub mod reduce_post_phase;
pub mod reduce_pre_phase;
pub mod reduce_probing_hash_table;
pub mod reduce_table;

pub use index_function::{IndexFunction, IndexResult, ReduceByHash};
pub use reduce_post_phase::ReducePostPhase;
pub use reduce_pre_phase::{ReducePrePhase, StreamEmitter};
pub use reduce_probing_hash_table::ReduceProbingHashTable;
pub use reduce_table::{Emitter, TableContext};
