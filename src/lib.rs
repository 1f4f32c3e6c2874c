//! Materialized transitive-closure index over a forest of SeaORM entities.
//!
//! Every entity row carries an optional parent reference and a soft-delete
//! flag; a companion closure table stores one `(ancestor, descendant, depth)`
//! row per connected pair so that ancestor, descendant and child lookups never
//! recurse at read time. [`ClosureIndexRepository`] owns all writes to both
//! tables: node creation, subtree soft-deletion and reparenting each run as a
//! single transaction. PostgreSQL and SQLite connections are supported.

pub mod closure;
pub mod config;
pub mod error;
pub mod lock;
pub mod repository;
pub mod traits;

pub mod prelude {
    //! Convenient re-exports for consumers.
    pub use crate::config::{
        AdvisoryLockStrategy, ClosureIndexConfig, ClosureIndexOptions, ReparentScope,
        TransactionIsolation,
    };
    pub use crate::error::ClosureIndexError;
    pub use crate::repository::ClosureIndexRepository;
    pub use crate::traits::ClosureIndexModel;
}

#[doc(hidden)]
pub mod __private {
    pub use once_cell;
}

pub use closure::ClosureEdge;
pub use closure_index_macros::ClosureIndexModel as ClosureIndexModelDerive;
#[doc(hidden)]
pub use closure_index_macros::ClosureIndexModel;
pub use config::{
    AdvisoryLockKey, AdvisoryLockStrategy, ClosureIndexConfig, ClosureIndexOptions,
    ReparentScope, TransactionIsolation,
};
pub use error::ClosureIndexError;
pub use repository::ClosureIndexRepository;
pub use traits::ClosureIndexModel;
