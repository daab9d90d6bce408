//! Array conversion.
//!
//! Relational arrays become nested tables keyed by the real subscripts, so
//! lower bounds survive the trip. In the other direction the array's shape
//! is discovered from the table: each nesting level is a dimension whose
//! bounds are the smallest and largest integer keys seen at that level, and
//! subscripts with no value are NULL.

use super::Marshaler;
use crate::script::{ScriptKey, ScriptTable, ScriptValue};
use crate::types::{oid, Oid, TypeKind};
use crate::value::{ArrayDim, ArrayValue, Datum};
use crate::{Error, Result};

pub(super) fn to_script(m: &Marshaler<'_>, arr: &ArrayValue, element: Oid) -> Result<ScriptValue> {
    if arr.is_empty() {
        return Ok(ScriptValue::Table(ScriptTable::new()));
    }
    let dims = arr.dims();
    let strides = strides(dims);
    build_level(m, arr, element, &strides, 0, 0).map(ScriptValue::Table)
}

fn strides(dims: &[ArrayDim]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for d in (0..dims.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * dims[d + 1].len;
    }
    strides
}

fn build_level(
    m: &Marshaler<'_>,
    arr: &ArrayValue,
    element: Oid,
    strides: &[usize],
    level: usize,
    base: usize,
) -> Result<ScriptTable> {
    let dim = arr.dims()[level];
    let last = level + 1 == arr.ndims();
    let mut table = ScriptTable::new();
    for i in 0..dim.len {
        let key = ScriptKey::Integer(dim.lower as i64 + i as i64);
        let offset = base + i * strides[level];
        if last {
            if let Some(datum) = &arr.elements()[offset] {
                table.insert(key, m.to_script(Some(datum), element)?);
            }
        } else {
            let sub = build_level(m, arr, element, strides, level + 1, offset)?;
            table.insert(key, ScriptValue::Table(sub));
        }
    }
    Ok(table)
}

/// Tables are leaf values, not sub-dimensions, for row and json elements.
fn tables_are_leaves(m: &Marshaler<'_>, element: Oid) -> Result<bool> {
    let (desc, _) = m.types.resolve_domain(m.host, element, -1)?;
    Ok(desc.is_row() || desc.oid == oid::JSON)
}

struct Shape {
    bounds: Vec<(i64, i64)>,
    max_dims: usize,
    leaf_tables: bool,
}

impl Shape {
    /// Records the keys of `table` at `level` and returns the number of
    /// dimensions from this level down, or `None` for an empty table.
    fn scan(&mut self, table: &ScriptTable, level: usize) -> Result<Option<usize>> {
        let mut depth: Option<usize> = None;
        for (key, value) in table {
            let index = match key {
                ScriptKey::Integer(i) => *i,
                ScriptKey::String(_) => continue,
            };
            if level >= self.max_dims {
                return Err(Error::conversion(format!(
                    "number of array dimensions exceeds the maximum allowed ({})",
                    self.max_dims
                )));
            }
            if index < i32::MIN as i64 || index > i32::MAX as i64 {
                return Err(Error::conversion(format!("array subscript {} is out of range", index)));
            }
            if self.bounds.len() <= level {
                self.bounds.push((index, index));
            } else {
                let (lo, hi) = &mut self.bounds[level];
                *lo = (*lo).min(index);
                *hi = (*hi).max(index);
            }

            let below = match value {
                ScriptValue::Table(sub) if !self.leaf_tables => self.scan(sub, level + 1)?.map(|d| d + 1),
                _ => Some(1),
            };
            match (depth, below) {
                (None, b) => depth = b,
                (Some(a), Some(b)) if a != b => {
                    return Err(Error::conversion(
                        "multidimensional arrays must have sub-arrays with matching dimensions",
                    ))
                }
                _ => {}
            }
        }
        Ok(depth)
    }
}

pub(super) fn to_relational(m: &Marshaler<'_>, value: &ScriptValue, element: Oid) -> Result<Datum> {
    let table = match value {
        ScriptValue::Table(t) => t,
        other => return Err(Error::conversion(format!("cannot convert {} to an array", other.type_name()))),
    };

    let mut shape = Shape {
        bounds: Vec::new(),
        max_dims: m.options.max_array_dims,
        leaf_tables: tables_are_leaves(m, element)?,
    };
    let ndims = match shape.scan(table, 0)? {
        Some(n) => n,
        None => return Ok(Datum::Array(ArrayValue::empty(element))),
    };

    let dims: Vec<ArrayDim> = shape.bounds[..ndims]
        .iter()
        .map(|(lo, hi)| ArrayDim::new((hi - lo + 1) as usize, *lo as i32))
        .collect();

    // element slots count against the ceiling before anything is converted
    let limit = m.options.max_alloc_size;
    let max_slots = limit / std::mem::size_of::<Option<Datum>>();
    let mut nitems = 1usize;
    for d in &dims {
        nitems = nitems
            .checked_mul(d.len)
            .filter(|n| *n <= max_slots)
            .ok_or_else(|| Error::size(format!("array size exceeds the maximum allowed ({})", limit)))?;
    }

    let strides = strides(&dims);
    let mut elements: Vec<Option<Datum>> = vec![None; nitems];
    fill(m, table, element, &dims, &strides, 0, 0, &mut elements)?;

    let arr = ArrayValue::new(element, dims, elements)?;
    let elem_desc = m.types.get(m.host, element)?;
    let (len, align) = match &elem_desc.kind {
        TypeKind::Domain { base, .. } => {
            let base = m.types.get(m.host, *base)?;
            (base.len, base.align)
        }
        _ => (elem_desc.len, elem_desc.align),
    };
    let size = arr.encoded_size_for(len, align);
    if size > limit {
        return Err(Error::size(format!(
            "array size {} exceeds the maximum allowed ({})",
            size, limit
        )));
    }
    Ok(Datum::Array(arr))
}

#[allow(clippy::too_many_arguments)]
fn fill(
    m: &Marshaler<'_>,
    table: &ScriptTable,
    element: Oid,
    dims: &[ArrayDim],
    strides: &[usize],
    level: usize,
    base: usize,
    out: &mut [Option<Datum>],
) -> Result<()> {
    let last = level + 1 == dims.len();
    for (key, value) in table {
        let index = match key {
            ScriptKey::Integer(i) => *i,
            ScriptKey::String(_) => continue,
        };
        let offset = base + (index - dims[level].lower as i64) as usize * strides[level];
        if last {
            out[offset] = m.to_relational(value, element, -1)?;
        } else if let ScriptValue::Table(sub) = value {
            fill(m, sub, element, dims, strides, level + 1, offset, out)?;
        }
    }
    Ok(())
}
