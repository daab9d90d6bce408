//! In-memory host.
//!
//! `MemoryHost` keeps a type catalog, routine definitions and a handful of
//! named tables in memory. Statements are not parsed: each statement text is
//! registered up front together with a handler that runs against the
//! tables. Savepoints snapshot the tables and restore them on rollback, so
//! work done inside a failed protected call disappears exactly as it would
//! in a real database.

use super::{
    FetchDirection, Host, InitModule, QueryExecutor, QueryResult, RoutineStore, RowSet, SavepointId,
    StatementKind, TypeCatalog,
};
use crate::error::ErrorReport;
use crate::routine::{RoutineDefinition, RowStamp};
use crate::types::{oid, Alignment, Attribute, CatalogType, Oid, RowDescriptor};
use crate::value::Datum;
use crate::{Error, Result};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

/// Handler that runs one registered statement.
pub type StatementHandler = Box<dyn Fn(&mut Tables, &[Option<Datum>]) -> Result<QueryResult>>;

#[derive(Debug, Clone)]
struct Table {
    descriptor: Rc<RowDescriptor>,
    rows: Vec<Vec<Option<Datum>>>,
}

/// Named tables of a [`MemoryHost`].
#[derive(Debug, Clone, Default)]
pub struct Tables {
    tables: BTreeMap<String, Table>,
}

impl Tables {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::Host(ErrorReport::new(format!("relation \"{}\" does not exist", name)).with_code("42P01")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| Error::Host(ErrorReport::new(format!("relation \"{}\" does not exist", name)).with_code("42P01")))
    }

    /// Layout of a table.
    pub fn descriptor(&self, name: &str) -> Result<Rc<RowDescriptor>> {
        Ok(Rc::clone(&self.table(name)?.descriptor))
    }

    /// All rows of a table.
    pub fn rows(&self, name: &str) -> Result<RowSet> {
        let table = self.table(name)?;
        Ok(RowSet { descriptor: Rc::clone(&table.descriptor), rows: table.rows.clone() })
    }

    /// Appends a row.
    pub fn insert(&mut self, name: &str, row: Vec<Option<Datum>>) -> Result<()> {
        let table = self.table_mut(name)?;
        if row.len() != table.descriptor.len() {
            return Err(Error::Host(
                ErrorReport::new(format!("INSERT has {} values for {} columns", row.len(), table.descriptor.len()))
                    .with_code("42601"),
            ));
        }
        table.rows.push(row);
        Ok(())
    }

    /// Removes rows matching `pred`, returning how many were removed.
    pub fn delete_where(&mut self, name: &str, pred: impl Fn(&[Option<Datum>]) -> bool) -> Result<usize> {
        let table = self.table_mut(name)?;
        let before = table.rows.len();
        table.rows.retain(|r| !pred(r));
        Ok(before - table.rows.len())
    }
}

struct Portal {
    rows: RowSet,
    // 1-based index of the current row; 0 is before the first row.
    position: usize,
}

struct Statement {
    kind: StatementKind,
    handler: Rc<StatementHandler>,
}

struct Savepoint {
    id: SavepointId,
    tables: Tables,
    portals: HashSet<String>,
}

struct State {
    types: HashMap<Oid, CatalogType>,
    type_names: HashMap<String, Oid>,
    routines: HashMap<Oid, RoutineDefinition>,
    relations: HashMap<Oid, String>,
    tables: Tables,
    statements: HashMap<String, Statement>,
    failing: HashMap<String, ErrorReport>,
    portals: HashMap<String, Portal>,
    savepoints: Vec<Savepoint>,
    modules: Vec<InitModule>,
    notices: Vec<(log::Level, String)>,
    executed: Vec<String>,
}

/// Complete in-memory [`Host`].
///
/// # Example
///
/// ```rust
/// use pllua::host::{MemoryHost, QueryExecutor};
/// use pllua::types::{oid, Attribute};
/// use pllua::value::Datum;
///
/// let host = MemoryHost::new();
/// host.define_table("items", vec![Attribute::new("id", oid::INT4)]);
/// host.define_insert("insert into items values ($1)", "items");
/// host.execute("insert into items values ($1)", &[Some(Datum::Int4(1))], false, 0).unwrap();
/// assert_eq!(host.table_rows("items").len(), 1);
/// ```
pub struct MemoryHost {
    state: RefCell<State>,
    next_oid: Cell<Oid>,
    next_xid: Cell<u32>,
    next_id: Cell<u64>,
    in_transaction: Cell<bool>,
    fail_rollback: Cell<bool>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// Creates a host with the builtin type catalog.
    pub fn new() -> Self {
        let host = Self {
            state: RefCell::new(State {
                types: HashMap::new(),
                type_names: HashMap::new(),
                routines: HashMap::new(),
                relations: HashMap::new(),
                tables: Tables::default(),
                statements: HashMap::new(),
                failing: HashMap::new(),
                portals: HashMap::new(),
                savepoints: Vec::new(),
                modules: Vec::new(),
                notices: Vec::new(),
                executed: Vec::new(),
            }),
            next_oid: Cell::new(16384),
            next_xid: Cell::new(100),
            next_id: Cell::new(1),
            in_transaction: Cell::new(true),
            fail_rollback: Cell::new(false),
        };
        host.register_builtins();
        host
    }

    fn register_builtins(&self) {
        use Alignment::*;
        let scalars: &[(Oid, &str, i16, bool, Alignment, Oid)] = &[
            (oid::BOOL, "bool", 1, true, Char, oid::BOOL_ARRAY),
            (oid::BYTEA, "bytea", -1, false, Int, oid::BYTEA_ARRAY),
            (oid::INT8, "int8", 8, true, Double, oid::INT8_ARRAY),
            (oid::INT2, "int2", 2, true, Short, oid::INT2_ARRAY),
            (oid::INT4, "int4", 4, true, Int, oid::INT4_ARRAY),
            (oid::TEXT, "text", -1, false, Int, oid::TEXT_ARRAY),
            (oid::JSON, "json", -1, false, Int, oid::JSON_ARRAY),
            (oid::FLOAT4, "float4", 4, true, Int, oid::FLOAT4_ARRAY),
            (oid::FLOAT8, "float8", 8, true, Double, oid::FLOAT8_ARRAY),
            (oid::BPCHAR, "bpchar", -1, false, Int, oid::BPCHAR_ARRAY),
            (oid::VARCHAR, "varchar", -1, false, Int, oid::VARCHAR_ARRAY),
            (oid::NUMERIC, "numeric", -1, false, Int, oid::NUMERIC_ARRAY),
            (oid::REFCURSOR, "refcursor", -1, false, Int, oid::REFCURSOR_ARRAY),
        ];
        for (type_oid, name, len, by_value, align, array_oid) in scalars {
            self.add_type(CatalogType::base(*type_oid, *name, *len, *by_value, *align));
            self.add_type(CatalogType::array(*array_oid, format!("_{}", name), *type_oid, *align));
            self.alias(&format!("{}[]", name), *array_oid);
        }
        self.add_type(CatalogType::pseudo(oid::VOID, "void"));
        self.add_type(CatalogType::pseudo(oid::TRIGGER, "trigger"));
        self.add_type(CatalogType::pseudo(oid::RECORD, "record"));
        self.add_type(CatalogType::array(oid::RECORD_ARRAY, "_record", oid::RECORD, Double));

        for (alias, type_oid) in [
            ("boolean", oid::BOOL),
            ("smallint", oid::INT2),
            ("integer", oid::INT4),
            ("int", oid::INT4),
            ("bigint", oid::INT8),
            ("real", oid::FLOAT4),
            ("double precision", oid::FLOAT8),
            ("character varying", oid::VARCHAR),
            ("character", oid::BPCHAR),
            ("integer[]", oid::INT4_ARRAY),
            ("bigint[]", oid::INT8_ARRAY),
        ] {
            self.alias(alias, type_oid);
        }
    }

    fn add_type(&self, entry: CatalogType) {
        let mut state = self.state.borrow_mut();
        state.type_names.insert(entry.name.clone(), entry.oid);
        state.types.insert(entry.oid, entry);
    }

    fn alias(&self, name: &str, type_oid: Oid) {
        self.state.borrow_mut().type_names.insert(name.to_string(), type_oid);
    }

    fn allocate_oid(&self) -> Oid {
        let oid = self.next_oid.get();
        self.next_oid.set(oid + 1);
        oid
    }

    fn allocate_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn next_stamp(&self) -> RowStamp {
        let xid = self.next_xid.get();
        self.next_xid.set(xid + 1);
        RowStamp::new(xid, xid / 64, (xid % 64) as u16 + 1)
    }

    /// Defines an enum type and returns its identifier.
    pub fn define_enum(&self, name: &str, labels: &[&str]) -> Oid {
        let oid = self.allocate_oid();
        self.add_type(CatalogType::enumeration(oid, name, labels.iter().map(|l| l.to_string()).collect()));
        oid
    }

    /// Defines a domain over `base` and returns its identifier.
    pub fn define_domain(&self, name: &str, base: Oid, type_mod: i32) -> Oid {
        let oid = self.allocate_oid();
        let base_entry = self.state.borrow().types.get(&base).cloned();
        let entry = match base_entry {
            Some(base) => CatalogType::domain(oid, name, &base, type_mod),
            None => CatalogType {
                class: crate::types::TypeClass::Domain,
                base: Some(base),
                base_type_mod: type_mod,
                ..CatalogType::base(oid, name, -1, false, Alignment::Int)
            },
        };
        self.add_type(entry);
        oid
    }

    /// Defines a composite type and returns its identifier.
    pub fn define_composite(&self, name: &str, attributes: Vec<Attribute>) -> Oid {
        let oid = self.allocate_oid();
        self.add_type(CatalogType::composite(oid, name, attributes));
        oid
    }

    /// Defines an array type over `element` and returns its identifier.
    pub fn define_array(&self, element: Oid) -> Oid {
        let oid = self.allocate_oid();
        let (name, align) = match self.state.borrow().types.get(&element) {
            Some(e) => (format!("_{}", e.name), e.align),
            None => (format!("_{}", element), Alignment::Int),
        };
        self.add_type(CatalogType::array(oid, name, element, align));
        oid
    }

    /// Creates an empty table (and its row type). Returns the relation id.
    pub fn define_table(&self, name: &str, attributes: Vec<Attribute>) -> Oid {
        let oid = self.define_composite(name, attributes.clone());
        let descriptor = Rc::new(RowDescriptor::new(oid, attributes));
        let mut state = self.state.borrow_mut();
        state.tables.tables.insert(name.to_string(), Table { descriptor, rows: Vec::new() });
        state.relations.insert(oid, name.to_string());
        oid
    }

    /// Layout of a table.
    pub fn table_descriptor(&self, name: &str) -> Result<Rc<RowDescriptor>> {
        self.state.borrow().tables.descriptor(name)
    }

    /// Current rows of a table (empty when the table does not exist).
    pub fn table_rows(&self, name: &str) -> Vec<Vec<Option<Datum>>> {
        self.state.borrow().tables.rows(name).map(|r| r.rows).unwrap_or_default()
    }

    /// Appends a row to a table directly.
    pub fn insert_row(&self, name: &str, row: Vec<Option<Datum>>) -> Result<()> {
        self.state.borrow_mut().tables.insert(name, row)
    }

    /// Registers a statement with its handler.
    pub fn define_statement(
        &self,
        sql: &str,
        kind: StatementKind,
        handler: impl Fn(&mut Tables, &[Option<Datum>]) -> Result<QueryResult> + 'static,
    ) {
        let statement = Statement { kind, handler: Rc::new(Box::new(handler)) };
        self.state.borrow_mut().statements.insert(sql.to_string(), statement);
    }

    /// Registers `sql` as "select every row of `table`".
    pub fn define_select(&self, sql: &str, table: &str) {
        let table = table.to_string();
        self.define_statement(sql, StatementKind::Select, move |tables, _| {
            let rows = tables.rows(&table)?;
            Ok(QueryResult { kind: StatementKind::Select, processed: rows.len(), rows: Some(rows) })
        });
    }

    /// Registers `sql` as "insert one row built from the parameters".
    pub fn define_insert(&self, sql: &str, table: &str) {
        let table = table.to_string();
        self.define_statement(sql, StatementKind::Insert, move |tables, params| {
            tables.insert(&table, params.to_vec())?;
            Ok(QueryResult { kind: StatementKind::Insert, processed: 1, rows: None })
        });
    }

    /// Registers `sql` as "delete every row of `table`".
    pub fn define_delete(&self, sql: &str, table: &str) {
        let table = table.to_string();
        self.define_statement(sql, StatementKind::Delete, move |tables, _| {
            let processed = tables.delete_where(&table, |_| true)?;
            Ok(QueryResult { kind: StatementKind::Delete, processed, rows: None })
        });
    }

    /// Makes every execution of `sql` fail with `report`.
    pub fn fail_statement(&self, sql: &str, report: ErrorReport) {
        self.state.borrow_mut().failing.insert(sql.to_string(), report);
    }

    /// Makes the next savepoint rollback fail.
    pub fn fail_next_rollback(&self) {
        self.fail_rollback.set(true);
    }

    /// Sets whether a transaction is open.
    pub fn set_in_transaction(&self, value: bool) {
        self.in_transaction.set(value);
    }

    /// Stores a routine definition under a fresh identifier and stamp.
    pub fn create_routine(&self, mut def: RoutineDefinition) -> Oid {
        def.oid = self.allocate_oid();
        def.stamp = self.next_stamp();
        let oid = def.oid;
        self.state.borrow_mut().routines.insert(oid, def);
        oid
    }

    /// Replaces a routine's body, giving the definition a new stamp.
    pub fn replace_routine_source(&self, routine: Oid, source: &str) {
        let stamp = self.next_stamp();
        if let Some(def) = self.state.borrow_mut().routines.get_mut(&routine) {
            def.source = source.to_string();
            def.stamp = stamp;
        }
    }

    /// Removes a routine.
    pub fn drop_routine(&self, routine: Oid) {
        self.state.borrow_mut().routines.remove(&routine);
    }

    /// Adds a module evaluated by engines created afterwards.
    pub fn add_init_module(&self, name: &str, source: &str) {
        self.state
            .borrow_mut()
            .modules
            .push(InitModule { name: name.to_string(), source: source.to_string() });
    }

    /// Messages received through [`Host::notice`].
    pub fn notices(&self) -> Vec<(log::Level, String)> {
        self.state.borrow().notices.clone()
    }

    /// Statement texts executed so far.
    pub fn executed(&self) -> Vec<String> {
        self.state.borrow().executed.clone()
    }

    /// Number of open portals.
    pub fn open_portals(&self) -> usize {
        self.state.borrow().portals.len()
    }

    /// Number of active savepoints.
    pub fn savepoint_depth(&self) -> usize {
        self.state.borrow().savepoints.len()
    }

    /// Name of a relation by identifier.
    pub fn relation_name(&self, relation: Oid) -> Option<String> {
        self.state.borrow().relations.get(&relation).cloned()
    }

    fn run(&self, sql: &str, params: &[Option<Datum>], read_only: bool) -> Result<QueryResult> {
        let handler = {
            let mut state = self.state.borrow_mut();
            state.executed.push(sql.to_string());
            if let Some(report) = state.failing.get(sql) {
                return Err(Error::Host(report.clone()));
            }
            let statement = state.statements.get(sql).ok_or_else(|| {
                Error::Host(ErrorReport::new(format!("syntax error at or near \"{}\"", sql)).with_code("42601"))
            })?;
            if read_only && statement.kind != StatementKind::Select {
                return Err(Error::Host(
                    ErrorReport::new("statement is not allowed in a read-only execution").with_code("0A000"),
                ));
            }
            Rc::clone(&statement.handler)
        };
        let mut state = self.state.borrow_mut();
        handler(&mut state.tables, params)
    }
}

impl TypeCatalog for MemoryHost {
    fn lookup_type(&self, type_oid: Oid) -> Result<Option<CatalogType>> {
        Ok(self.state.borrow().types.get(&type_oid).cloned())
    }

    fn type_oid(&self, name: &str) -> Result<Option<Oid>> {
        Ok(self.state.borrow().type_names.get(&name.trim().to_ascii_lowercase()).copied())
    }
}

impl RoutineStore for MemoryHost {
    fn lookup_routine(&self, routine: Oid) -> Result<Option<RoutineDefinition>> {
        Ok(self.state.borrow().routines.get(&routine).cloned())
    }

    fn init_modules(&self) -> Result<Vec<InitModule>> {
        Ok(self.state.borrow().modules.clone())
    }
}

impl QueryExecutor for MemoryHost {
    fn execute(&self, sql: &str, params: &[Option<Datum>], read_only: bool, limit: usize) -> Result<QueryResult> {
        let mut result = self.run(sql, params, read_only)?;
        if let Some(rows) = result.rows.as_mut() {
            if limit > 0 && rows.rows.len() > limit {
                rows.rows.truncate(limit);
                result.processed = limit;
            }
        }
        Ok(result)
    }

    fn open_cursor(&self, sql: &str, params: &[Option<Datum>], name: Option<&str>, read_only: bool) -> Result<String> {
        if let Some(name) = name {
            if self.cursor_exists(name) {
                return Err(Error::Host(
                    ErrorReport::new(format!("cursor \"{}\" already in use", name)).with_code("42P03"),
                ));
            }
        }
        let result = self.run(sql, params, read_only)?;
        let rows = result.rows.ok_or_else(|| {
            Error::Host(ErrorReport::new("cannot open a cursor on a statement that returns no rows").with_code("42P11"))
        })?;
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("<unnamed portal {}>", self.allocate_id()),
        };
        self.state.borrow_mut().portals.insert(name.clone(), Portal { rows, position: 0 });
        Ok(name)
    }

    fn cursor_exists(&self, name: &str) -> bool {
        self.state.borrow().portals.contains_key(name)
    }

    fn fetch(&self, cursor: &str, direction: FetchDirection, count: i64) -> Result<RowSet> {
        let mut state = self.state.borrow_mut();
        let portal = state.portals.get_mut(cursor).ok_or_else(|| {
            Error::Host(ErrorReport::new(format!("cursor \"{}\" does not exist", cursor)).with_code("34000"))
        })?;
        let total = portal.rows.rows.len();
        let mut out = Vec::new();
        match direction {
            FetchDirection::Forward => {
                for _ in 0..count.max(0) {
                    if portal.position >= total {
                        portal.position = total + 1;
                        break;
                    }
                    portal.position += 1;
                    out.push(portal.rows.rows[portal.position - 1].clone());
                }
            }
            FetchDirection::Backward => {
                for _ in 0..count.max(0) {
                    if portal.position <= 1 {
                        portal.position = 0;
                        break;
                    }
                    portal.position -= 1;
                    out.push(portal.rows.rows[portal.position - 1].clone());
                }
            }
            FetchDirection::Absolute | FetchDirection::Relative => {
                let target = match direction {
                    FetchDirection::Absolute if count < 0 => total as i64 + 1 + count,
                    FetchDirection::Absolute => count,
                    _ => portal.position as i64 + count,
                };
                portal.position = target.clamp(0, total as i64 + 1) as usize;
                if target >= 1 && target <= total as i64 {
                    out.push(portal.rows.rows[target as usize - 1].clone());
                }
            }
        }
        Ok(RowSet { descriptor: Rc::clone(&portal.rows.descriptor), rows: out })
    }

    fn move_cursor(&self, cursor: &str, direction: FetchDirection, count: i64) -> Result<()> {
        self.fetch(cursor, direction, count).map(|_| ())
    }

    fn close_cursor(&self, cursor: &str) -> Result<()> {
        match self.state.borrow_mut().portals.remove(cursor) {
            Some(_) => Ok(()),
            None => Err(Error::Host(
                ErrorReport::new(format!("cursor \"{}\" does not exist", cursor)).with_code("34000"),
            )),
        }
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction.get()
    }

    fn begin_savepoint(&self) -> Result<SavepointId> {
        let id = SavepointId(self.allocate_id());
        let mut state = self.state.borrow_mut();
        let snapshot = Savepoint {
            id,
            tables: state.tables.clone(),
            portals: state.portals.keys().cloned().collect(),
        };
        state.savepoints.push(snapshot);
        Ok(id)
    }

    fn release_savepoint(&self, id: SavepointId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        match state.savepoints.last() {
            Some(top) if top.id == id => {
                state.savepoints.pop();
                Ok(())
            }
            _ => Err(Error::host(format!("savepoint {} is not the innermost one", id.0))),
        }
    }

    fn rollback_savepoint(&self, id: SavepointId) -> Result<()> {
        if self.fail_rollback.replace(false) {
            return Err(Error::Host(ErrorReport::new("could not roll back to savepoint").with_code("XX000")));
        }
        let mut state = self.state.borrow_mut();
        match state.savepoints.last() {
            Some(top) if top.id == id => {}
            _ => return Err(Error::host(format!("savepoint {} is not the innermost one", id.0))),
        }
        if let Some(savepoint) = state.savepoints.pop() {
            state.tables = savepoint.tables;
            state.portals.retain(|name, _| savepoint.portals.contains(name));
        }
        Ok(())
    }
}

impl Host for MemoryHost {
    fn notice(&self, level: log::Level, message: &str) {
        log::log!(target: "pllua", level, "{}", message);
        self.state.borrow_mut().notices.push((level, message.to_string()));
    }
}
