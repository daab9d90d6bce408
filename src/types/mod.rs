//! Type descriptors and the per-engine type cache.
//!
//! A [`TypeDescriptor`] is the engine's resolved view of a catalog type:
//! its kind (base, domain, enum, array, composite, pseudo), storage length
//! and alignment, plus kind-specific data such as enum labels or the row
//! layout of a composite.

mod cache;

pub use cache::{CacheStats, TypeCache};

use std::rc::Rc;

/// Object identifier of a catalog entry.
pub type Oid = u32;

/// Type identifiers the marshaling engine knows directly.
pub mod oid {
    use super::Oid;

    /// boolean
    pub const BOOL: Oid = 16;
    /// bytea
    pub const BYTEA: Oid = 17;
    /// bigint
    pub const INT8: Oid = 20;
    /// smallint
    pub const INT2: Oid = 21;
    /// integer
    pub const INT4: Oid = 23;
    /// text
    pub const TEXT: Oid = 25;
    /// json
    pub const JSON: Oid = 114;
    /// real
    pub const FLOAT4: Oid = 700;
    /// double precision
    pub const FLOAT8: Oid = 701;
    /// character(n)
    pub const BPCHAR: Oid = 1042;
    /// character varying(n)
    pub const VARCHAR: Oid = 1043;
    /// numeric(p, s)
    pub const NUMERIC: Oid = 1700;
    /// refcursor
    pub const REFCURSOR: Oid = 1790;
    /// record (pseudo)
    pub const RECORD: Oid = 2249;
    /// void (pseudo)
    pub const VOID: Oid = 2278;
    /// trigger (pseudo)
    pub const TRIGGER: Oid = 2279;

    /// boolean[]
    pub const BOOL_ARRAY: Oid = 1000;
    /// bytea[]
    pub const BYTEA_ARRAY: Oid = 1001;
    /// smallint[]
    pub const INT2_ARRAY: Oid = 1005;
    /// integer[]
    pub const INT4_ARRAY: Oid = 1007;
    /// text[]
    pub const TEXT_ARRAY: Oid = 1009;
    /// character(n)[]
    pub const BPCHAR_ARRAY: Oid = 1014;
    /// character varying(n)[]
    pub const VARCHAR_ARRAY: Oid = 1015;
    /// bigint[]
    pub const INT8_ARRAY: Oid = 1016;
    /// real[]
    pub const FLOAT4_ARRAY: Oid = 1021;
    /// double precision[]
    pub const FLOAT8_ARRAY: Oid = 1022;
    /// numeric[]
    pub const NUMERIC_ARRAY: Oid = 1231;
    /// json[]
    pub const JSON_ARRAY: Oid = 199;
    /// refcursor[]
    pub const REFCURSOR_ARRAY: Oid = 2201;
    /// record[]
    pub const RECORD_ARRAY: Oid = 2287;
}

/// Catalog classification of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    /// Base (scalar or array) type.
    Base,
    /// Composite (row) type.
    Composite,
    /// Domain over another type.
    Domain,
    /// Enumerated type.
    Enum,
    /// Pseudo-type.
    Pseudo,
}

/// Storage alignment of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// 1 byte
    Char,
    /// 2 bytes
    Short,
    /// 4 bytes
    Int,
    /// 8 bytes
    Double,
}

impl Alignment {
    /// Alignment in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Alignment::Char => 1,
            Alignment::Short => 2,
            Alignment::Int => 4,
            Alignment::Double => 8,
        }
    }

    /// Rounds `len` up to this alignment.
    pub fn align(self, len: usize) -> usize {
        let a = self.bytes();
        (len + a - 1) & !(a - 1)
    }
}

/// One attribute (column) of a row layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Column name.
    pub name: String,
    /// Column type.
    pub type_oid: Oid,
    /// Column type modifier (-1 for none).
    pub type_mod: i32,
}

impl Attribute {
    /// Creates an attribute without a type modifier.
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self { name: name.into(), type_oid, type_mod: -1 }
    }

    /// Sets the type modifier.
    pub fn with_type_mod(mut self, type_mod: i32) -> Self {
        self.type_mod = type_mod;
        self
    }
}

/// Ordered row layout of a composite type or query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptor {
    /// Composite type identifier, or [`oid::RECORD`] for anonymous rows.
    pub type_oid: Oid,
    /// Columns in order.
    pub attributes: Vec<Attribute>,
}

impl RowDescriptor {
    /// Creates a row layout.
    pub fn new(type_oid: Oid, attributes: Vec<Attribute>) -> Self {
        Self { type_oid, attributes }
    }

    /// Creates an anonymous row layout.
    pub fn anonymous(attributes: Vec<Attribute>) -> Self {
        Self::new(oid::RECORD, attributes)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// True when the layout has no columns.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Position of the column called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }
}

/// Raw catalog entry as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogType {
    /// Type identifier.
    pub oid: Oid,
    /// Type name.
    pub name: String,
    /// Classification.
    pub class: TypeClass,
    /// Storage length: positive for fixed width, -1 for varlena, -2 for cstring.
    pub len: i16,
    /// Passed by value.
    pub by_value: bool,
    /// Storage alignment.
    pub align: Alignment,
    /// Element type for array types.
    pub element: Option<Oid>,
    /// Underlying type for domains.
    pub base: Option<Oid>,
    /// Domain type modifier.
    pub base_type_mod: i32,
    /// Column layout for composite types.
    pub attributes: Vec<Attribute>,
    /// Labels for enum types, in sort order.
    pub labels: Vec<String>,
}

impl CatalogType {
    /// Creates a base type entry.
    pub fn base(oid: Oid, name: impl Into<String>, len: i16, by_value: bool, align: Alignment) -> Self {
        Self {
            oid,
            name: name.into(),
            class: TypeClass::Base,
            len,
            by_value,
            align,
            element: None,
            base: None,
            base_type_mod: -1,
            attributes: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Creates an array type entry over `element`.
    pub fn array(oid: Oid, name: impl Into<String>, element: Oid, align: Alignment) -> Self {
        Self { element: Some(element), ..Self::base(oid, name, -1, false, align) }
    }

    /// Creates a pseudo-type entry.
    pub fn pseudo(oid: Oid, name: impl Into<String>) -> Self {
        Self { class: TypeClass::Pseudo, ..Self::base(oid, name, 4, true, Alignment::Int) }
    }

    /// Creates a composite type entry.
    pub fn composite(oid: Oid, name: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self {
            class: TypeClass::Composite,
            attributes,
            ..Self::base(oid, name, -1, false, Alignment::Double)
        }
    }

    /// Creates an enum type entry.
    pub fn enumeration(oid: Oid, name: impl Into<String>, labels: Vec<String>) -> Self {
        Self { class: TypeClass::Enum, labels, ..Self::base(oid, name, 4, true, Alignment::Int) }
    }

    /// Creates a domain entry over `base`.
    pub fn domain(oid: Oid, name: impl Into<String>, base: &CatalogType, type_mod: i32) -> Self {
        Self {
            class: TypeClass::Domain,
            base: Some(base.oid),
            base_type_mod: type_mod,
            ..Self::base(oid, name, base.len, base.by_value, base.align)
        }
    }
}

/// Kind-specific part of a resolved type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    /// Scalar base type.
    Base,
    /// Domain: values marshal as the underlying type.
    Domain {
        /// Underlying type.
        base: Oid,
        /// Underlying type modifier.
        type_mod: i32,
    },
    /// Enumerated type.
    Enum {
        /// Labels in sort order.
        labels: Vec<String>,
    },
    /// Array over `element`.
    Array {
        /// Element type.
        element: Oid,
    },
    /// Composite row type.
    Composite(Rc<RowDescriptor>),
    /// Pseudo-type (void, trigger, record).
    Pseudo,
}

/// Resolved, immutable description of a type. Shared through the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    /// Type identifier.
    pub oid: Oid,
    /// Type name.
    pub name: String,
    /// Kind and kind-specific data.
    pub kind: TypeKind,
    /// Storage length.
    pub len: i16,
    /// Passed by value.
    pub by_value: bool,
    /// Storage alignment.
    pub align: Alignment,
}

impl TypeDescriptor {
    /// True for array types.
    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array { .. })
    }

    /// True for composite types and the anonymous record pseudo-type.
    pub fn is_row(&self) -> bool {
        matches!(self.kind, TypeKind::Composite(_)) || self.oid == oid::RECORD
    }

    /// Rejects types a routine cannot accept as an argument.
    pub fn check_argument(&self) -> crate::Result<()> {
        match self.kind {
            TypeKind::Pseudo if self.oid != oid::RECORD => Err(crate::Error::conversion(format!(
                "functions cannot take type '{}'",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// Rejects types a routine cannot return.
    pub fn check_result(&self) -> crate::Result<()> {
        match self.kind {
            TypeKind::Pseudo if !matches!(self.oid, oid::VOID | oid::TRIGGER | oid::RECORD) => {
                Err(crate::Error::conversion(format!("functions cannot return type '{}'", self.name)))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(Alignment::Int.align(5), 8);
        assert_eq!(Alignment::Double.align(8), 8);
        assert_eq!(Alignment::Char.align(3), 3);
        assert_eq!(Alignment::Short.align(3), 4);
    }

    #[test]
    fn test_row_descriptor_position() {
        let desc = RowDescriptor::anonymous(vec![
            Attribute::new("id", oid::INT4),
            Attribute::new("name", oid::TEXT),
        ]);
        assert_eq!(desc.position("name"), Some(1));
        assert_eq!(desc.position("missing"), None);
        assert_eq!(desc.len(), 2);
    }

    #[test]
    fn test_pseudo_type_rules() {
        let void = TypeDescriptor {
            oid: oid::VOID,
            name: "void".into(),
            kind: TypeKind::Pseudo,
            len: 4,
            by_value: true,
            align: Alignment::Int,
        };
        assert!(void.check_result().is_ok());
        assert!(void.check_argument().is_err());

        let record = TypeDescriptor { oid: oid::RECORD, name: "record".into(), ..void.clone() };
        assert!(record.check_argument().is_ok());
        assert!(record.is_row());

        let trigger = TypeDescriptor { oid: oid::TRIGGER, name: "trigger".into(), ..void };
        assert!(trigger.check_result().is_ok());
        assert!(trigger.check_argument().is_err());
    }
}
