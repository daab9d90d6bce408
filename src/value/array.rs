use super::Datum;
use crate::types::{Alignment, Oid};
use crate::{Error, Result};

/// Extent of one array dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDim {
    /// Number of elements along this dimension.
    pub len: usize,
    /// Subscript of the first element.
    pub lower: i32,
}

impl ArrayDim {
    /// Creates a dimension.
    pub fn new(len: usize, lower: i32) -> Self {
        Self { len, lower }
    }

    /// Subscript of the last element.
    pub fn upper(&self) -> i32 {
        self.lower + self.len as i32 - 1
    }
}

/// N-dimensional array with per-dimension lower bounds.
///
/// Elements are stored in row-major order; `None` marks a NULL element.
/// An array with no dimensions is the canonical empty array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    element_type: Oid,
    dims: Vec<ArrayDim>,
    elements: Vec<Option<Datum>>,
}

impl ArrayValue {
    /// Creates an array. The element count must equal the product of the
    /// dimension lengths.
    pub fn new(element_type: Oid, dims: Vec<ArrayDim>, elements: Vec<Option<Datum>>) -> Result<Self> {
        let count = dims.iter().try_fold(1usize, |acc, d| acc.checked_mul(d.len));
        let count = count.ok_or_else(|| Error::size("array size exceeds the maximum allowed"))?;

        if dims.is_empty() || count == 0 {
            if !elements.is_empty() {
                return Err(Error::conversion("empty array cannot carry elements"));
            }
            return Ok(Self::empty(element_type));
        }

        if count != elements.len() {
            return Err(Error::conversion(format!(
                "array dimensions describe {} elements but {} were given",
                count,
                elements.len()
            )));
        }

        for d in &dims {
            if (d.lower as i64) + (d.len as i64) - 1 > i32::MAX as i64 {
                return Err(Error::size("array upper bound is too large"));
            }
        }

        Ok(Self { element_type, dims, elements })
    }

    /// Creates the empty array.
    pub fn empty(element_type: Oid) -> Self {
        Self { element_type, dims: Vec::new(), elements: Vec::new() }
    }

    /// Creates a one-dimensional array with lower bound 1.
    pub fn from_vec(element_type: Oid, elements: Vec<Option<Datum>>) -> Self {
        if elements.is_empty() {
            return Self::empty(element_type);
        }
        let dims = vec![ArrayDim::new(elements.len(), 1)];
        Self { element_type, dims, elements }
    }

    /// Creates an array from its physical form: the non-null values in
    /// order plus an optional null bitmap (bit set = value present).
    pub fn from_dense(
        element_type: Oid,
        dims: Vec<ArrayDim>,
        values: Vec<Datum>,
        bitmap: Option<&[u8]>,
    ) -> Result<Self> {
        let count: usize = dims.iter().map(|d| d.len).product();
        let elements = match bitmap {
            None => values.into_iter().map(Some).collect(),
            Some(bits) => {
                if bits.len() < (count + 7) / 8 {
                    return Err(Error::conversion("null bitmap is too short"));
                }
                let mut values = values.into_iter();
                let mut elements = Vec::with_capacity(count);
                for i in 0..count {
                    if bits[i / 8] & (1 << (i % 8)) != 0 {
                        let v = values
                            .next()
                            .ok_or_else(|| Error::conversion("null bitmap marks more values than given"))?;
                        elements.push(Some(v));
                    } else {
                        elements.push(None);
                    }
                }
                if values.next().is_some() {
                    return Err(Error::conversion("more values given than the null bitmap marks"));
                }
                elements
            }
        };
        Self::new(element_type, dims, elements)
    }

    /// Element type.
    pub fn element_type(&self) -> Oid {
        self.element_type
    }

    /// Dimensions, outermost first.
    pub fn dims(&self) -> &[ArrayDim] {
        &self.dims
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Elements in row-major order.
    pub fn elements(&self) -> &[Option<Datum>] {
        &self.elements
    }

    /// Consumes the array, returning its elements.
    pub fn into_elements(self) -> Vec<Option<Datum>> {
        self.elements
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True for the empty array.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// True when any element is NULL.
    pub fn has_nulls(&self) -> bool {
        self.elements.iter().any(Option::is_none)
    }

    /// Null bitmap of the physical form, present only when the array has
    /// NULL elements.
    pub fn null_bitmap(&self) -> Option<Vec<u8>> {
        if !self.has_nulls() {
            return None;
        }
        let mut bits = vec![0u8; (self.elements.len() + 7) / 8];
        for (i, e) in self.elements.iter().enumerate() {
            if e.is_some() {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        Some(bits)
    }

    /// Row-major offset of a subscript, honoring lower bounds.
    pub fn offset(&self, subscript: &[i32]) -> Option<usize> {
        if subscript.len() != self.dims.len() || self.dims.is_empty() {
            return None;
        }
        let mut offset = 0usize;
        for (s, d) in subscript.iter().zip(&self.dims) {
            if *s < d.lower || *s > d.upper() {
                return None;
            }
            offset = offset * d.len + (*s - d.lower) as usize;
        }
        Some(offset)
    }

    /// Element at `subscript`; `None` when out of range or NULL.
    pub fn get(&self, subscript: &[i32]) -> Option<&Datum> {
        self.offset(subscript).and_then(|i| self.elements[i].as_ref())
    }

    /// Size of the header: fixed part, dimension vector and null bitmap.
    pub fn overhead(ndims: usize, nitems: usize, has_nulls: bool) -> usize {
        let bitmap = if has_nulls { (nitems + 7) / 8 } else { 0 };
        Alignment::Double.align(16 + 8 * ndims + bitmap)
    }

    /// Encoded size assuming variable-length, int-aligned elements.
    pub fn encoded_size(&self) -> usize {
        self.encoded_size_for(-1, Alignment::Int)
    }

    /// Encoded size for elements of the given storage length and alignment.
    pub fn encoded_size_for(&self, elem_len: i16, align: Alignment) -> usize {
        let mut size = Self::overhead(self.dims.len(), self.elements.len(), self.has_nulls());
        for d in self.elements.iter().flatten() {
            size = align.align(size) + element_size(d, elem_len);
        }
        size
    }
}

/// Stored size of one element.
pub(crate) fn element_size(datum: &Datum, elem_len: i16) -> usize {
    match elem_len {
        n if n > 0 => n as usize,
        -2 => datum.data_size() + 1,
        _ => datum.data_size() + 4,
    }
}
