//! Routine definitions and their compiled form.
//!
//! A routine's source body is wrapped into a chunk that defines a named
//! local function and returns it; the function is kept in the Lua registry
//! and reused until the catalog row that defines the routine changes.

mod cache;

pub use cache::RoutineCache;

use crate::types::Oid;
use mlua::RegistryKey;
use std::fmt;

/// Identity of the catalog row a routine was compiled from: the creating
/// transaction plus the physical row position. Any redefinition changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowStamp {
    /// Creating transaction id.
    pub xmin: u32,
    /// Physical row position (block, offset).
    pub tid: (u32, u16),
}

impl RowStamp {
    /// Creates a stamp.
    pub fn new(xmin: u32, block: u32, offset: u16) -> Self {
        Self { xmin, tid: (block, offset) }
    }
}

impl fmt::Display for RowStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@({},{})", self.xmin, self.tid.0, self.tid.1)
    }
}

/// A routine as the catalog describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineDefinition {
    /// Routine identifier.
    pub oid: Oid,
    /// Routine name.
    pub name: String,
    /// Body source.
    pub source: String,
    /// Argument names; an empty name marks an unnamed argument.
    pub arg_names: Vec<String>,
    /// Argument types.
    pub arg_types: Vec<Oid>,
    /// Result type.
    pub result_type: Oid,
    /// True for set-returning routines.
    pub returns_set: bool,
    /// Catalog row identity.
    pub stamp: RowStamp,
}

impl RoutineDefinition {
    /// Creates a definition with no arguments returning `result_type`.
    pub fn new(oid: Oid, name: impl Into<String>, source: impl Into<String>, result_type: Oid) -> Self {
        Self {
            oid,
            name: name.into(),
            source: source.into(),
            arg_names: Vec::new(),
            arg_types: Vec::new(),
            result_type,
            returns_set: false,
            stamp: RowStamp::new(1, 0, 1),
        }
    }

    /// Appends a named argument. Pass an empty name for an unnamed one.
    pub fn arg(mut self, name: impl Into<String>, type_oid: Oid) -> Self {
        self.arg_names.push(name.into());
        self.arg_types.push(type_oid);
        self
    }

    /// Marks the routine as set-returning.
    pub fn returns_set(mut self, value: bool) -> Self {
        self.returns_set = value;
        self
    }
}

/// A compiled routine held by the [`RoutineCache`].
#[derive(Debug)]
pub struct RoutineEntry {
    /// Routine identifier.
    pub oid: Oid,
    /// Routine name.
    pub name: String,
    /// Catalog row identity the entry was compiled from.
    pub stamp: RowStamp,
    /// Argument types.
    pub arg_types: Vec<Oid>,
    /// Result type.
    pub result_type: Oid,
    /// True for set-returning routines.
    pub returns_set: bool,
    /// True when the routine receives its arguments through `...`.
    pub variadic: bool,
    pub(crate) function: RegistryKey,
}

impl RoutineEntry {
    /// True for trigger routines.
    pub fn is_trigger(&self) -> bool {
        self.result_type == crate::types::oid::TRIGGER
    }
}

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// True when `name` can be used as a Lua identifier.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric()) && !LUA_KEYWORDS.contains(&name)
}

/// Maps an arbitrary routine name to a usable identifier.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out: String =
        name.chars().map(|c| if c == '_' || c.is_ascii_alphanumeric() { c } else { '_' }).collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if LUA_KEYWORDS.contains(&out.as_str()) {
        out.push('_');
    }
    out
}

/// Parameter list for a definition, or `None` when the routine must take
/// its arguments through `...`: it declares none, or one of its names is
/// unnamed, invalid or repeated.
pub(crate) fn parameter_list(def: &RoutineDefinition) -> Option<String> {
    if def.arg_names.is_empty() {
        return None;
    }
    let mut seen = std::collections::HashSet::new();
    for name in &def.arg_names {
        if !is_identifier(name) || !seen.insert(name.as_str()) {
            return None;
        }
    }
    Some(def.arg_names.join(", "))
}

/// Builds the chunk that defines and returns the routine's function. The
/// body starts on the first line so script line numbers match the source.
pub(crate) fn build_chunk(def: &RoutineDefinition) -> (String, bool) {
    let name = sanitize_identifier(&def.name);
    let (params, variadic) = match parameter_list(def) {
        Some(params) => (params, false),
        None => ("...".to_string(), true),
    };
    let chunk = format!(
        "local {name} {name} = function({params}) {body}\nend return {name}",
        name = name,
        params = params,
        body = def.source
    );
    (chunk, variadic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::oid;

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("total_sum"));
        assert!(!is_identifier("end"));
        assert!(!is_identifier("2x"));
        assert!(!is_identifier(""));

        assert_eq!(sanitize_identifier("my-func"), "my_func");
        assert_eq!(sanitize_identifier("9lives"), "_9lives");
        assert_eq!(sanitize_identifier("while"), "while_");
    }

    #[test]
    fn test_build_chunk_named_args() {
        let def = RoutineDefinition::new(1, "add", "return a + b", oid::INT4)
            .arg("a", oid::INT4)
            .arg("b", oid::INT4);
        let (chunk, variadic) = build_chunk(&def);
        assert!(!variadic);
        assert_eq!(chunk, "local add add = function(a, b) return a + b\nend return add");
    }

    #[test]
    fn test_build_chunk_variadic_fallback() {
        let def = RoutineDefinition::new(1, "f", "return select('#', ...)", oid::INT4)
            .arg("a", oid::INT4)
            .arg("", oid::INT4);
        let (chunk, variadic) = build_chunk(&def);
        assert!(variadic);
        assert!(chunk.contains("function(...)"));

        let dup = RoutineDefinition::new(2, "g", "return 1", oid::INT4).arg("x", oid::INT4).arg("x", oid::INT4);
        assert!(parameter_list(&dup).is_none());

        let (chunk, variadic) = build_chunk(&RoutineDefinition::new(3, "h", "return ...", oid::TRIGGER));
        assert!(variadic);
        assert_eq!(chunk, "local h h = function(...) return ...\nend return h");
    }

    #[test]
    fn test_row_stamp_display() {
        assert_eq!(RowStamp::new(7, 3, 2).to_string(), "7@(3,2)");
    }
}
