#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::HashSet;
use std::collections::TryReserveError;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tf_types::{
    DType, ErrorKind, ErrorRecord, Scalar, TypeError, cast_scalar, parse_datetime, parse_float64,
    parse_int64,
};

/// Packed validity bitmap: bit set means the slot holds a value.
#[derive(Debug, Clone, Default, Eq)]
pub struct ValidityMask {
    words: Vec<u64>,
    len: usize,
}

impl ValidityMask {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_bools<I: IntoIterator<Item = bool>>(bits: I) -> Self {
        let mut mask = Self::new();
        for bit in bits {
            mask.push(bit);
        }
        mask
    }

    #[must_use]
    pub fn all_valid(len: usize) -> Self {
        let word_count = len.div_ceil(64);
        let mut words = vec![u64::MAX; word_count];
        let remainder = len % 64;
        if remainder > 0 && !words.is_empty() {
            let last = words.len() - 1;
            words[last] = (1_u64 << remainder) - 1;
        }
        Self { words, len }
    }

    #[must_use]
    pub fn all_invalid(len: usize) -> Self {
        Self {
            words: vec![0_u64; len.div_ceil(64)],
            len,
        }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len {
            return;
        }
        if value {
            self.words[idx / 64] |= 1_u64 << (idx % 64);
        } else {
            self.words[idx / 64] &= !(1_u64 << (idx % 64));
        }
    }

    pub fn push(&mut self, value: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        self.len += 1;
        self.set(self.len - 1, value);
    }

    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        let needed = (self.len + additional).div_ceil(64);
        self.words.try_reserve(needed.saturating_sub(self.words.len()))
    }

    #[must_use]
    pub fn count_valid(&self) -> usize {
        let full_words = self.len / 64;
        let mut count: u32 = self.words[..full_words]
            .iter()
            .map(|w| w.count_ones())
            .sum();
        let remainder = self.len % 64;
        if remainder > 0 && full_words < self.words.len() {
            let mask = (1_u64 << remainder) - 1;
            count += (self.words[full_words] & mask).count_ones();
        }
        count as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|idx| self.get(idx))
    }
}

impl PartialEq for ValidityMask {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bits().eq(other.bits())
    }
}

impl Serialize for ValidityMask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let bits: Vec<bool> = self.bits().collect();
        let mut state = serializer.serialize_struct("ValidityMask", 1)?;
        state.serialize_field("bits", &bits)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ValidityMask {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            bits: Vec<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Self::from_bools(raw.bits))
    }
}

/// Dense typed buffer. Slots whose validity bit is clear hold an unspecified
/// placeholder and must never be read as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum ColumnData {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Utf8(Vec<String>),
}

impl ColumnData {
    #[must_use]
    pub fn empty(dtype: DType) -> Self {
        match dtype {
            DType::Int64 => Self::Int64(Vec::new()),
            DType::Float64 => Self::Float64(Vec::new()),
            DType::Utf8 => Self::Utf8(Vec::new()),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Utf8(_) => DType::Utf8,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int64(d) => d.len(),
            Self::Float64(d) => d.len(),
            Self::Utf8(d) => d.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        match self {
            Self::Int64(d) => d.try_reserve(additional),
            Self::Float64(d) => d.try_reserve(additional),
            Self::Utf8(d) => d.try_reserve(additional),
        }
    }

    fn push_placeholder(&mut self) {
        match self {
            Self::Int64(d) => d.push(0),
            Self::Float64(d) => d.push(0.0),
            Self::Utf8(d) => d.push(String::new()),
        }
    }
}

/// Element-wise comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOp {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    /// Apply to an ordering; `None` means unordered (NaN), where only `!=` holds.
    #[must_use]
    pub fn holds(self, ordering: Option<Ordering>) -> bool {
        match ordering {
            None => matches!(self, Self::Ne),
            Some(ord) => match self {
                Self::Eq => ord == Ordering::Equal,
                Self::Ne => ord != Ordering::Equal,
                Self::Lt => ord == Ordering::Less,
                Self::Le => ord != Ordering::Greater,
                Self::Gt => ord == Ordering::Greater,
                Self::Ge => ord != Ordering::Less,
            },
        }
    }
}

/// Hashable view of a present cell. NaN collapses to one canonical key and
/// `-0.0` to `0.0`, so grouping and dedup treat them as single values.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum CellKey<'a> {
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
}

impl CellKey<'_> {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() {
            Self::FloatBits(f64::NAN.to_bits())
        } else if value == 0.0 {
            Self::FloatBits(0.0_f64.to_bits())
        } else {
            Self::FloatBits(value.to_bits())
        }
    }
}

/// Total order for present floats used by sorting: NaN sorts after every number.
#[must_use]
pub fn compare_f64_nan_last(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

#[derive(Debug, Error)]
pub enum ColumnError {
    #[error("column length mismatch: left={left}, right={right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("position {position} out of bounds for length {len}")]
    PositionOutOfBounds { position: usize, len: usize },
    #[error("column '{column}' has dtype {expected}, value of dtype {found} does not fit")]
    DtypeMismatch {
        column: String,
        expected: DType,
        found: DType,
    },
    #[error("{op} is not supported for {dtype} column '{column}'")]
    UnsupportedDtype {
        op: &'static str,
        column: String,
        dtype: DType,
    },
    #[error("row {row} of column '{column}': {source}")]
    Cell {
        column: String,
        row: usize,
        #[source]
        source: TypeError,
    },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("allocation failed: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

impl ErrorRecord for ColumnError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Cell { source, .. } | Self::Type(source) => source.kind(),
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            _ => ErrorKind::InvalidArgument,
        }
    }

    fn row(&self) -> Option<usize> {
        match self {
            Self::Cell { row, .. } => Some(*row),
            _ => None,
        }
    }
}

/// A named, typed, null-aware vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    name: String,
    data: ColumnData,
    validity: ValidityMask,
}

impl Series {
    #[must_use]
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            data: ColumnData::empty(dtype),
            validity: ValidityMask::new(),
        }
    }

    pub fn with_capacity(
        name: impl Into<String>,
        dtype: DType,
        capacity: usize,
    ) -> Result<Self, ColumnError> {
        let mut series = Self::new(name, dtype);
        series.try_reserve(capacity)?;
        Ok(series)
    }

    /// Build from cells; each must be null or fit `dtype` (Int64 widens into Float64).
    pub fn from_scalars(
        name: impl Into<String>,
        dtype: DType,
        values: Vec<Scalar>,
    ) -> Result<Self, ColumnError> {
        let mut series = Self::with_capacity(name, dtype, values.len())?;
        for value in values {
            series.push(value)?;
        }
        Ok(series)
    }

    pub fn from_i64<I: IntoIterator<Item = Option<i64>>>(name: impl Into<String>, values: I) -> Self {
        let mut data = Vec::new();
        let mut validity = ValidityMask::new();
        for value in values {
            validity.push(value.is_some());
            data.push(value.unwrap_or_default());
        }
        Self {
            name: name.into(),
            data: ColumnData::Int64(data),
            validity,
        }
    }

    pub fn from_f64<I: IntoIterator<Item = Option<f64>>>(name: impl Into<String>, values: I) -> Self {
        let mut data = Vec::new();
        let mut validity = ValidityMask::new();
        for value in values {
            validity.push(value.is_some());
            data.push(value.unwrap_or_default());
        }
        Self {
            name: name.into(),
            data: ColumnData::Float64(data),
            validity,
        }
    }

    pub fn from_strs<S, I>(name: impl Into<String>, values: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = Option<S>>,
    {
        let mut data = Vec::new();
        let mut validity = ValidityMask::new();
        for value in values {
            validity.push(value.is_some());
            data.push(value.map(Into::into).unwrap_or_default());
        }
        Self {
            name: name.into(),
            data: ColumnData::Utf8(data),
            validity,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.validity.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    #[must_use]
    pub fn validity(&self) -> &ValidityMask {
        &self.validity
    }

    /// Number of non-null cells.
    #[must_use]
    pub fn count(&self) -> usize {
        self.validity.count_valid()
    }

    #[must_use]
    pub fn null_count(&self) -> usize {
        self.len() - self.count()
    }

    /// True for null cells and for positions past the end.
    #[must_use]
    pub fn is_null(&self, idx: usize) -> bool {
        !self.validity.get(idx)
    }

    /// `None` when out of range, `Some(Scalar::Null)` for a null cell.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<Scalar> {
        if idx >= self.len() {
            return None;
        }
        if !self.validity.get(idx) {
            return Some(Scalar::Null);
        }
        Some(match &self.data {
            ColumnData::Int64(d) => Scalar::Int64(d[idx]),
            ColumnData::Float64(d) => Scalar::Float64(d[idx]),
            ColumnData::Utf8(d) => Scalar::Utf8(d[idx].clone()),
        })
    }

    pub fn value(&self, idx: usize) -> Result<Scalar, ColumnError> {
        self.get(idx).ok_or(ColumnError::PositionOutOfBounds {
            position: idx,
            len: self.len(),
        })
    }

    #[must_use]
    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        match &self.data {
            ColumnData::Int64(d) if self.validity.get(idx) => Some(d[idx]),
            _ => None,
        }
    }

    /// Numeric cell widened to f64.
    #[must_use]
    pub fn get_f64(&self, idx: usize) -> Option<f64> {
        if !self.validity.get(idx) {
            return None;
        }
        match &self.data {
            ColumnData::Int64(d) => Some(d[idx] as f64),
            ColumnData::Float64(d) => Some(d[idx]),
            ColumnData::Utf8(_) => None,
        }
    }

    #[must_use]
    pub fn get_str(&self, idx: usize) -> Option<&str> {
        match &self.data {
            ColumnData::Utf8(d) if self.validity.get(idx) => Some(d[idx].as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn key(&self, idx: usize) -> Option<CellKey<'_>> {
        if !self.validity.get(idx) {
            return None;
        }
        Some(match &self.data {
            ColumnData::Int64(d) => CellKey::Int64(d[idx]),
            ColumnData::Float64(d) => CellKey::from_f64(d[idx]),
            ColumnData::Utf8(d) => CellKey::Utf8(d[idx].as_str()),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Scalar> + '_ {
        (0..self.len()).map(|idx| self.get(idx).unwrap_or(Scalar::Null))
    }

    /// Present values as f64, skipping nulls. Fails for Utf8 columns.
    pub fn numeric_values(&self) -> Result<Vec<f64>, ColumnError> {
        self.require_numeric("numeric reduction")?;
        Ok((0..self.len()).filter_map(|idx| self.get_f64(idx)).collect())
    }

    pub fn require_numeric(&self, op: &'static str) -> Result<(), ColumnError> {
        if self.dtype().is_numeric() {
            Ok(())
        } else {
            Err(ColumnError::UnsupportedDtype {
                op,
                column: self.name.clone(),
                dtype: self.dtype(),
            })
        }
    }

    pub fn try_reserve(&mut self, additional: usize) -> Result<(), ColumnError> {
        self.data.try_reserve(additional)?;
        self.validity.try_reserve(additional)?;
        Ok(())
    }

    /// Check that `value` fits this column without modifying it.
    pub fn check_fits(&self, value: &Scalar) -> Result<(), ColumnError> {
        match (value.dtype(), self.dtype()) {
            (None, _) => Ok(()),
            (Some(found), expected) if found == expected => Ok(()),
            (Some(DType::Int64), DType::Float64) => Ok(()),
            (Some(found), expected) => Err(ColumnError::DtypeMismatch {
                column: self.name.clone(),
                expected,
                found,
            }),
        }
    }

    pub fn push(&mut self, value: Scalar) -> Result<(), ColumnError> {
        self.check_fits(&value)?;
        match (&mut self.data, value) {
            (data, Scalar::Null) => {
                data.push_placeholder();
                self.validity.push(false);
                return Ok(());
            }
            (ColumnData::Int64(d), Scalar::Int64(v)) => d.push(v),
            (ColumnData::Float64(d), Scalar::Float64(v)) => d.push(v),
            (ColumnData::Float64(d), Scalar::Int64(v)) => d.push(v as f64),
            (ColumnData::Utf8(d), Scalar::Utf8(v)) => d.push(v),
            (data, other) => {
                return Err(ColumnError::DtypeMismatch {
                    column: self.name.clone(),
                    expected: data.dtype(),
                    found: other.dtype().unwrap_or(data.dtype()),
                });
            }
        }
        self.validity.push(true);
        Ok(())
    }

    pub fn push_null(&mut self) {
        self.data.push_placeholder();
        self.validity.push(false);
    }

    fn empty_like(&self, capacity: usize) -> Result<Self, ColumnError> {
        Self::with_capacity(self.name.clone(), self.dtype(), capacity)
    }

    fn push_from(&mut self, source: &Self, idx: usize) {
        if !source.validity.get(idx) {
            self.push_null();
            return;
        }
        match (&mut self.data, &source.data) {
            (ColumnData::Int64(d), ColumnData::Int64(s)) => d.push(s[idx]),
            (ColumnData::Float64(d), ColumnData::Float64(s)) => d.push(s[idx]),
            (ColumnData::Utf8(d), ColumnData::Utf8(s)) => d.push(s[idx].clone()),
            (data, _) => {
                data.push_placeholder();
                self.validity.push(false);
                return;
            }
        }
        self.validity.push(true);
    }

    pub fn take(&self, positions: &[usize]) -> Result<Self, ColumnError> {
        let mut out = self.empty_like(positions.len())?;
        for &position in positions {
            if position >= self.len() {
                return Err(ColumnError::PositionOutOfBounds {
                    position,
                    len: self.len(),
                });
            }
            out.push_from(self, position);
        }
        Ok(out)
    }

    /// Gather by optional positions; `None` (or out of range) yields null.
    pub fn reindex_by_positions(&self, positions: &[Option<usize>]) -> Result<Self, ColumnError> {
        let mut out = self.empty_like(positions.len())?;
        for slot in positions {
            match slot {
                Some(idx) if *idx < self.len() => out.push_from(self, *idx),
                _ => out.push_null(),
            }
        }
        Ok(out)
    }

    pub fn filter_by_mask(&self, mask: &[bool]) -> Result<Self, ColumnError> {
        if mask.len() != self.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: mask.len(),
            });
        }
        let kept = mask.iter().filter(|keep| **keep).count();
        let mut out = self.empty_like(kept)?;
        for (idx, _) in mask.iter().enumerate().filter(|(_, keep)| **keep) {
            out.push_from(self, idx);
        }
        Ok(out)
    }

    /// Positions `[start, end)`, clamped to the column length.
    pub fn slice(&self, start: usize, end: usize) -> Result<Self, ColumnError> {
        let end = end.min(self.len());
        let start = start.min(end);
        let positions = (start..end).collect::<Vec<_>>();
        self.take(&positions)
    }

    pub fn map_cells<F>(&self, dtype: DType, mut func: F) -> Result<Self, ColumnError>
    where
        F: FnMut(usize, Scalar) -> Result<Scalar, TypeError>,
    {
        let mut out = Self::with_capacity(self.name.clone(), dtype, self.len())?;
        for (row, value) in self.iter().enumerate() {
            let mapped = func(row, value).map_err(|source| ColumnError::Cell {
                column: self.name.clone(),
                row,
                source,
            })?;
            out.push(mapped).map_err(|err| match err {
                ColumnError::DtypeMismatch { expected, found, .. } => ColumnError::Cell {
                    column: self.name.clone(),
                    row,
                    source: TypeError::InvalidCast {
                        from: found,
                        to: expected,
                    },
                },
                other => other,
            })?;
        }
        Ok(out)
    }

    pub fn astype(&self, dtype: DType) -> Result<Self, ColumnError> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        self.map_cells(dtype, |_, value| cast_scalar(&value, dtype))
    }

    /// Parse a string column as numbers: Int64 when every present cell is an
    /// integer, Float64 otherwise. With `coerce`, unparsable cells become null.
    pub fn to_numeric(&self, coerce: bool) -> Result<Self, ColumnError> {
        let ColumnData::Utf8(_) = &self.data else {
            return Ok(self.clone());
        };
        let all_int = (0..self.len())
            .filter_map(|idx| self.get_str(idx))
            .all(|text| text.trim().is_empty() || parse_int64(text).is_ok());
        let target = if all_int { DType::Int64 } else { DType::Float64 };
        self.map_cells(target, |_, value| match value {
            Scalar::Utf8(text) if text.trim().is_empty() => Ok(Scalar::Null),
            Scalar::Utf8(text) => {
                let parsed = if all_int {
                    parse_int64(&text).map(Scalar::Int64)
                } else {
                    parse_float64(&text).map(Scalar::Float64)
                };
                match parsed {
                    Err(_) if coerce => Ok(Scalar::Null),
                    other => other,
                }
            }
            other => Ok(other),
        })
    }

    /// Parse ISO-8601 strings into Int64 epoch seconds.
    pub fn to_datetime(&self, coerce: bool) -> Result<Self, ColumnError> {
        match self.dtype() {
            DType::Int64 => Ok(self.clone()),
            DType::Float64 => Err(ColumnError::UnsupportedDtype {
                op: "to_datetime",
                column: self.name.clone(),
                dtype: DType::Float64,
            }),
            DType::Utf8 => self.map_cells(DType::Int64, |_, value| match value {
                Scalar::Utf8(text) if text.trim().is_empty() => Ok(Scalar::Null),
                Scalar::Utf8(text) => match parse_datetime(&text) {
                    Ok(seconds) => Ok(Scalar::Int64(seconds)),
                    Err(_) if coerce => Ok(Scalar::Null),
                    Err(err) => Err(err),
                },
                other => Ok(other),
            }),
        }
    }

    #[must_use]
    pub fn isna(&self) -> Vec<bool> {
        self.validity.bits().map(|valid| !valid).collect()
    }

    #[must_use]
    pub fn notna(&self) -> Vec<bool> {
        self.validity.bits().collect()
    }

    /// Replace nulls with `fill`, which must be castable to this dtype.
    pub fn fillna(&self, fill: &Scalar) -> Result<Self, ColumnError> {
        let fill = cast_scalar(fill, self.dtype())?;
        self.map_cells(self.dtype(), |_, value| {
            Ok(if value.is_null() { fill.clone() } else { value })
        })
    }

    /// Keep cells where `cond` is true; replace the rest with `other`.
    pub fn where_mask(&self, cond: &[bool], other: &Scalar) -> Result<Self, ColumnError> {
        if cond.len() != self.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: cond.len(),
            });
        }
        let other = cast_scalar(other, self.dtype())?;
        self.map_cells(self.dtype(), |row, value| {
            Ok(if cond[row] { value } else { other.clone() })
        })
    }

    /// Replace cells where `cond` is true with `other`.
    pub fn mask(&self, cond: &[bool], other: &Scalar) -> Result<Self, ColumnError> {
        let inverted = cond.iter().map(|c| !c).collect::<Vec<_>>();
        self.where_mask(&inverted, other)
    }

    /// Bound numeric cells to `[lower, upper]`. Nulls and NaN pass through.
    pub fn clip(&self, lower: Option<f64>, upper: Option<f64>) -> Result<Self, ColumnError> {
        self.require_numeric("clip")?;
        let dtype = self.dtype();
        self.map_cells(dtype, |_, value| {
            Ok(match value {
                Scalar::Float64(v) if !v.is_nan() => {
                    let v = lower.map_or(v, |lo| if v < lo { lo } else { v });
                    Scalar::Float64(upper.map_or(v, |hi| if v > hi { hi } else { v }))
                }
                Scalar::Int64(v) => {
                    let mut out = v;
                    if let Some(lo) = lower
                        && (v as f64) < lo
                    {
                        out = lo.ceil() as i64;
                    }
                    if let Some(hi) = upper
                        && (out as f64) > hi
                    {
                        out = hi.floor() as i64;
                    }
                    Scalar::Int64(out)
                }
                other => other,
            })
        })
    }

    /// Replace every cell equal to `from` (NaN matches NaN, null matches null) with `to`.
    pub fn replace(&self, from: &Scalar, to: &Scalar) -> Result<Self, ColumnError> {
        let from = match cast_scalar(from, self.dtype()) {
            Ok(cast) => cast,
            // A value that cannot live in this column never matches.
            Err(_) => return Ok(self.clone()),
        };
        let to = cast_scalar(to, self.dtype())?;
        self.map_cells(self.dtype(), |_, value| {
            Ok(if value.semantic_eq(&from) { to.clone() } else { value })
        })
    }

    /// Compare each cell against `rhs`. Null cells, a null `rhs` and dtype
    /// mismatches (string vs number) are false; NaN is unordered.
    #[must_use]
    pub fn compare_scalar(&self, op: ComparisonOp, rhs: &Scalar) -> Vec<bool> {
        (0..self.len())
            .map(|idx| self.compare_cell(idx, op, rhs))
            .collect()
    }

    #[must_use]
    pub fn compare_cell(&self, idx: usize, op: ComparisonOp, rhs: &Scalar) -> bool {
        if !self.validity.get(idx) {
            return false;
        }
        let ordering = match (&self.data, rhs) {
            (ColumnData::Int64(d), Scalar::Int64(r)) => Some(d[idx].cmp(r)),
            (ColumnData::Int64(d), Scalar::Float64(r)) => (d[idx] as f64).partial_cmp(r),
            (ColumnData::Float64(d), Scalar::Float64(r)) => d[idx].partial_cmp(r),
            (ColumnData::Float64(d), Scalar::Int64(r)) => d[idx].partial_cmp(&(*r as f64)),
            (ColumnData::Utf8(d), Scalar::Utf8(r)) => Some(d[idx].as_str().cmp(r.as_str())),
            _ => return false,
        };
        op.holds(ordering)
    }

    /// Order two present cells of this column (NaN last); nulls compare greater.
    #[must_use]
    pub fn compare_positions(&self, left: usize, right: usize) -> Ordering {
        match (self.validity.get(left), self.validity.get(right)) {
            (false, false) => Ordering::Equal,
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (true, true) => match &self.data {
                ColumnData::Int64(d) => d[left].cmp(&d[right]),
                ColumnData::Float64(d) => compare_f64_nan_last(d[left], d[right]),
                ColumnData::Utf8(d) => d[left].cmp(&d[right]),
            },
        }
    }

    /// Distinct cells in first-occurrence order; a null appears once if present.
    pub fn unique(&self) -> Result<Self, ColumnError> {
        let mut seen = HashSet::new();
        let mut saw_null = false;
        let mut positions = Vec::new();
        for idx in 0..self.len() {
            match self.key(idx) {
                Some(key) => {
                    if seen.insert(key) {
                        positions.push(idx);
                    }
                }
                None if !saw_null => {
                    saw_null = true;
                    positions.push(idx);
                }
                None => {}
            }
        }
        self.take(&positions)
    }

    /// Number of distinct present values.
    #[must_use]
    pub fn nunique(&self) -> usize {
        (0..self.len())
            .filter_map(|idx| self.key(idx))
            .collect::<HashSet<_>>()
            .len()
    }

    /// Same name, dtype and cells (NaN equals NaN, null positions must line up).
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.dtype() == other.dtype()
            && self.len() == other.len()
            && self.iter().zip(other.iter()).all(|(a, b)| a.semantic_eq(&b))
    }
}

#[cfg(test)]
mod tests {
    use tf_types::{DType, ErrorKind, ErrorRecord, Scalar};

    use super::{CellKey, ColumnError, ComparisonOp, Series, ValidityMask};

    fn scores() -> Series {
        Series::from_f64("score", [Some(98.5), None, Some(f64::NAN), Some(73.25)])
    }

    #[test]
    fn validity_mask_push_crosses_word_boundary() {
        let mut mask = ValidityMask::new();
        for idx in 0..130 {
            mask.push(idx % 3 != 0);
        }
        assert_eq!(mask.len(), 130);
        assert!(!mask.get(0));
        assert!(mask.get(64));
        assert!(!mask.get(129));
        assert_eq!(mask.count_valid(), 130 - 44);
    }

    #[test]
    fn validity_mask_all_valid_and_invalid() {
        let valid = ValidityMask::all_valid(100);
        assert_eq!(valid.count_valid(), 100);
        let invalid = ValidityMask::all_invalid(100);
        assert_eq!(invalid.count_valid(), 0);
        assert!(!invalid.get(99));
    }

    #[test]
    fn validity_mask_serde_round_trip() {
        let mask = ValidityMask::from_bools([true, false, true]);
        let json = serde_json::to_string(&mask).expect("serialize");
        assert!(json.contains("\"bits\""));
        let back: ValidityMask = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(mask, back);
    }

    #[test]
    fn null_and_nan_are_distinct() {
        let s = scores();
        assert_eq!(s.len(), 4);
        assert_eq!(s.count(), 3);
        assert_eq!(s.null_count(), 1);
        assert_eq!(s.get(1), Some(Scalar::Null));
        assert!(s.get(2).expect("in range").is_nan());
        assert_eq!(s.get(9), None);
    }

    #[test]
    fn push_type_checks_and_widens_ints_into_floats() {
        let mut s = Series::new("x", DType::Float64);
        s.push(Scalar::Int64(2)).expect("widen");
        s.push(Scalar::Null).expect("null");
        let err = s.push(Scalar::Utf8("a".to_owned())).expect_err("mismatch");
        assert!(matches!(err, ColumnError::DtypeMismatch { .. }));
        assert_eq!(s.len(), 2);
        assert_eq!(s.get(0), Some(Scalar::Float64(2.0)));
    }

    #[test]
    fn reindex_injects_nulls() {
        let s = Series::from_i64("v", [Some(10), Some(20)]);
        let out = s
            .reindex_by_positions(&[Some(1), None, Some(0)])
            .expect("reindex");
        assert_eq!(
            out.iter().collect::<Vec<_>>(),
            vec![Scalar::Int64(20), Scalar::Null, Scalar::Int64(10)]
        );
    }

    #[test]
    fn take_rejects_out_of_range_positions() {
        let s = Series::from_i64("v", [Some(1)]);
        let err = s.take(&[3]).expect_err("oob");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn filter_by_mask_checks_length() {
        let s = Series::from_i64("v", [Some(1), Some(2), None]);
        let out = s.filter_by_mask(&[true, false, true]).expect("filter");
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![Scalar::Int64(1), Scalar::Null]);
        assert!(s.filter_by_mask(&[true]).is_err());
    }

    #[test]
    fn astype_numeric_to_string_and_back() {
        let s = Series::from_f64("f", [Some(1.5), None, Some(f64::NAN)]);
        let text = s.astype(DType::Utf8).expect("to string");
        assert_eq!(text.get_str(0), Some("1.5"));
        assert!(text.is_null(1));
        assert_eq!(text.get_str(2), Some("nan"));
        let back = text.astype(DType::Float64).expect("back");
        assert!(back.semantic_eq(&s));
    }

    #[test]
    fn astype_failure_reports_the_row() {
        let s = Series::from_strs("s", [Some("1"), Some("x")]);
        let err = s.astype(DType::Int64).expect_err("bad cell");
        assert_eq!(err.kind(), ErrorKind::Parse);
        assert_eq!(err.row(), Some(1));
    }

    #[test]
    fn to_numeric_picks_int_or_float() {
        let ints = Series::from_strs("s", [Some("1"), None, Some("3")]);
        assert_eq!(ints.to_numeric(false).expect("ints").dtype(), DType::Int64);
        let floats = Series::from_strs("s", [Some("1"), Some("2.5")]);
        assert_eq!(floats.to_numeric(false).expect("floats").dtype(), DType::Float64);
        let dirty = Series::from_strs("s", [Some("1.5"), Some("oops")]);
        assert!(dirty.to_numeric(false).is_err());
        let coerced = dirty.to_numeric(true).expect("coerce");
        assert!(coerced.is_null(1));
    }

    #[test]
    fn to_datetime_parses_iso_dates() {
        let s = Series::from_strs("d", [Some("1970-01-02"), None]);
        let out = s.to_datetime(false).expect("parse");
        assert_eq!(out.get_i64(0), Some(86_400));
        assert!(out.is_null(1));
    }

    #[test]
    fn fillna_where_mask_and_replace() {
        let s = Series::from_i64("v", [Some(1), None, Some(3)]);
        let filled = s.fillna(&Scalar::Int64(0)).expect("fill");
        assert_eq!(filled.get_i64(1), Some(0));
        assert!(s.fillna(&Scalar::Utf8("x".to_owned())).is_err());

        let kept = s
            .where_mask(&[true, true, false], &Scalar::Int64(-1))
            .expect("where");
        assert_eq!(kept.get_i64(2), Some(-1));
        assert!(kept.is_null(1));

        let masked = s.mask(&[true, false, false], &Scalar::Null).expect("mask");
        assert!(masked.is_null(0));

        let replaced = s.replace(&Scalar::Int64(3), &Scalar::Int64(30)).expect("replace");
        assert_eq!(replaced.get_i64(2), Some(30));
    }

    #[test]
    fn clip_bounds_numeric_cells() {
        let s = Series::from_f64("f", [Some(-5.0), Some(0.5), Some(f64::NAN), None, Some(9.0)]);
        let out = s.clip(Some(0.0), Some(1.0)).expect("clip");
        assert_eq!(out.get_f64(0), Some(0.0));
        assert_eq!(out.get_f64(1), Some(0.5));
        assert!(out.get_f64(2).expect("nan").is_nan());
        assert!(out.is_null(3));
        assert_eq!(out.get_f64(4), Some(1.0));
        let strings = Series::from_strs("s", [Some("a")]);
        assert!(strings.clip(None, None).is_err());
    }

    #[test]
    fn compare_scalar_null_and_nan_semantics() {
        let s = scores();
        assert_eq!(
            s.compare_scalar(ComparisonOp::Gt, &Scalar::Float64(80.0)),
            vec![true, false, false, false]
        );
        assert_eq!(
            s.compare_scalar(ComparisonOp::Ne, &Scalar::Float64(80.0)),
            vec![true, false, true, true]
        );
        assert_eq!(
            s.compare_scalar(ComparisonOp::Eq, &Scalar::Utf8("98.5".to_owned())),
            vec![false; 4]
        );
    }

    #[test]
    fn int_comparisons_are_exact() {
        let s = Series::from_i64("big", [Some(9_007_199_254_740_993)]);
        assert_eq!(
            s.compare_scalar(ComparisonOp::Eq, &Scalar::Int64(9_007_199_254_740_992)),
            vec![false]
        );
    }

    #[test]
    fn compare_positions_puts_nan_before_null() {
        let s = scores();
        assert_eq!(s.compare_positions(3, 0), std::cmp::Ordering::Less);
        assert_eq!(s.compare_positions(2, 0), std::cmp::Ordering::Greater);
        assert_eq!(s.compare_positions(1, 2), std::cmp::Ordering::Greater);
    }

    #[test]
    fn unique_keeps_first_occurrence_and_one_null() {
        let s = Series::from_f64(
            "f",
            [Some(2.0), None, Some(f64::NAN), Some(2.0), None, Some(f64::NAN), Some(-0.0), Some(0.0)],
        );
        let out = s.unique().expect("unique");
        assert_eq!(out.len(), 4);
        assert_eq!(s.nunique(), 3);
        assert_eq!(s.key(6), Some(CellKey::from_f64(0.0)));
    }

    #[test]
    fn slice_clamps() {
        let s = Series::from_i64("v", [Some(1), Some(2), Some(3)]);
        assert_eq!(s.slice(1, 10).expect("slice").len(), 2);
        assert_eq!(s.slice(5, 10).expect("slice").len(), 0);
    }
}
