//! Query building, compilation, and execution.
//!
//! The pipeline, in the order a query flows through it:
//!
//! - [`queryset`] - [`QuerySet`] and [`Manager`], the lazy builder facade
//! - [`spec`] - [`QuerySpec`], the accumulated description of one query
//! - [`lookups`] - [`Q`] filter trees and typed lookups
//! - [`crawler`] - relation path resolution
//! - [`operators`] - operator names to SQL
//! - [`compiler`] - SQL generation with join de-duplication
//! - [`executor`] - batched fetching, prefetching, deletes and saves
//! - [`parser`] - rows to instances through the result cache
//! - [`bulk`] - bulk create and bulk update

pub mod bulk;
pub mod compiler;
pub mod crawler;
pub mod executor;
pub mod lookups;
pub mod operators;
pub mod parser;
pub mod queryset;
pub mod spec;

pub use compiler::{CompiledQuery, Compiler, RowLayout};
pub use crawler::{crawl_relationship, CrawlResult, LOOKUP_SEP, PK};
pub use executor::Executor;
pub use lookups::{Lookup, Q};
pub use operators::OperatorTable;
pub use parser::ResultCache;
pub use queryset::{Manager, QuerySet};
pub use spec::{
    Distinct, EmbedParent, ExtraColumn, ExtraExpr, LockStrength, LockWait, Prefetch, QuerySpec,
    RowLock, SetOp,
};
