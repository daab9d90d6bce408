//! Interfaces to the host database.
//!
//! The engine never talks to a database directly. Everything it needs
//! (catalog lookups, routine definitions, query execution, cursors and
//! savepoints) goes through the traits in this module. [`MemoryHost`] is a
//! complete in-memory implementation.

mod memory;

pub use memory::{MemoryHost, StatementHandler, Tables};

use crate::routine::RoutineDefinition;
use crate::types::{CatalogType, Oid, RowDescriptor, TypeDescriptor};
use crate::value::{io, Datum};
use crate::Result;
use std::rc::Rc;

/// Catalog of types and their text conversion routines.
pub trait TypeCatalog {
    /// Looks up a type by identifier.
    fn lookup_type(&self, type_oid: Oid) -> Result<Option<CatalogType>>;

    /// Resolves a type name (as written in `server.prepare`) to an identifier.
    fn type_oid(&self, name: &str) -> Result<Option<Oid>>;

    /// Text input routine of the type.
    fn input(&self, desc: &TypeDescriptor, text: &str, type_mod: i32) -> Result<Datum> {
        io::input(desc, text, type_mod)
    }

    /// Text output routine of the type.
    fn output(&self, desc: &TypeDescriptor, datum: &Datum) -> Result<String> {
        io::output(desc, datum)
    }
}

/// A module evaluated when an engine starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitModule {
    /// Global name the module's value is published under.
    pub name: String,
    /// Module source.
    pub source: String,
}

/// Source of routine definitions.
pub trait RoutineStore {
    /// Current definition of a routine.
    fn lookup_routine(&self, routine: Oid) -> Result<Option<RoutineDefinition>>;

    /// Modules to evaluate at engine start-up.
    fn init_modules(&self) -> Result<Vec<InitModule>> {
        Ok(Vec::new())
    }
}

/// Direction of a cursor fetch or move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    /// Next `count` rows.
    Forward,
    /// Previous `count` rows.
    Backward,
    /// Row at absolute position `count`.
    Absolute,
    /// Row at `count` relative to the current one.
    Relative,
}

/// Rows returned by a query or fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSet {
    /// Layout of every row.
    pub descriptor: Rc<RowDescriptor>,
    /// Rows in order.
    pub rows: Vec<Vec<Option<Datum>>>,
}

impl RowSet {
    /// Creates an empty row set with the given layout.
    pub fn empty(descriptor: Rc<RowDescriptor>) -> Self {
        Self { descriptor, rows: Vec::new() }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Kind of statement a query executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Row-returning query.
    Select,
    /// INSERT
    Insert,
    /// UPDATE
    Update,
    /// DELETE
    Delete,
    /// Anything else.
    Utility,
}

/// Outcome of [`QueryExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Statement kind.
    pub kind: StatementKind,
    /// Rows processed.
    pub processed: usize,
    /// Returned rows, for row-returning statements.
    pub rows: Option<RowSet>,
}

/// Savepoint identifier handed out by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SavepointId(pub u64);

/// Query execution, cursors and savepoints.
pub trait QueryExecutor {
    /// Executes `sql`. `limit` of 0 means no limit.
    fn execute(&self, sql: &str, params: &[Option<Datum>], read_only: bool, limit: usize) -> Result<QueryResult>;

    /// Opens a cursor over `sql` and returns its portal name.
    fn open_cursor(&self, sql: &str, params: &[Option<Datum>], name: Option<&str>, read_only: bool) -> Result<String>;

    /// True when a portal called `name` is open.
    fn cursor_exists(&self, name: &str) -> bool;

    /// Fetches rows from a cursor.
    fn fetch(&self, cursor: &str, direction: FetchDirection, count: i64) -> Result<RowSet>;

    /// Repositions a cursor without returning rows.
    fn move_cursor(&self, cursor: &str, direction: FetchDirection, count: i64) -> Result<()>;

    /// Closes a cursor.
    fn close_cursor(&self, cursor: &str) -> Result<()>;

    /// True inside an open transaction.
    fn in_transaction(&self) -> bool;

    /// Starts a savepoint.
    fn begin_savepoint(&self) -> Result<SavepointId>;

    /// Releases (commits) a savepoint.
    fn release_savepoint(&self, id: SavepointId) -> Result<()>;

    /// Rolls back to a savepoint and discards it.
    fn rollback_savepoint(&self, id: SavepointId) -> Result<()>;
}

/// Everything the engine needs from its host.
pub trait Host: TypeCatalog + RoutineStore + QueryExecutor {
    /// Receives messages from `print`, `info`, `notice` and friends.
    fn notice(&self, level: log::Level, message: &str) {
        log::log!(target: "pllua", level, "{}", message);
    }
}
