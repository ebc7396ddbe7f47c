#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::collections::TryReserveError;
use std::fmt;
use std::io;

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tf_columnar::{CellKey, ColumnError, Series};
use tf_index::{Index, IndexError, IndexLabel};
use tf_types::{
    DType, ErrorKind, ErrorRecord, NullTokens, Scalar, TypeError, cast_scalar, common_dtype,
    format_f64, format_scalar, parse_field,
};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown column '{0}'")]
    UnknownColumn(String),
    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),
    #[error("column '{name}' has length {found}, frame has {expected} rows")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("expected {expected} values per row, got {found}")]
    RowWidth { expected: usize, found: usize },
    #[error("row position {position} out of bounds for {len} rows")]
    RowOutOfBounds { position: usize, len: usize },
    #[error("row {row}, column {col}: {source}")]
    Field {
        row: usize,
        col: usize,
        #[source]
        source: TypeError,
    },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("allocation failed: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

impl ErrorRecord for FrameError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Field { source, .. } | Self::Type(source) => source.kind(),
            Self::Column(err) => err.kind(),
            Self::Io(_) => ErrorKind::Io,
            Self::OutOfMemory(_) => ErrorKind::OutOfMemory,
            _ => ErrorKind::InvalidArgument,
        }
    }

    fn row(&self) -> Option<usize> {
        match self {
            Self::Field { row, .. } => Some(*row),
            Self::Column(err) => err.row(),
            _ => None,
        }
    }

    fn col(&self) -> Option<usize> {
        match self {
            Self::Field { col, .. } => Some(*col),
            _ => None,
        }
    }
}

/// One key of a multi-column sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default = "default_true")]
    pub ascending: bool,
}

fn default_true() -> bool {
    true
}

impl SortKey {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropNaHow {
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeep {
    First,
    Last,
    None,
}

fn normalize_head_take(n: i64, len: usize) -> usize {
    let magnitude = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
    if n >= 0 {
        magnitude.min(len)
    } else {
        len.saturating_sub(magnitude)
    }
}

fn normalize_tail_start(n: i64, len: usize) -> usize {
    let magnitude = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
    if n >= 0 {
        len - magnitude.min(len)
    } else {
        magnitude.min(len)
    }
}

fn label_from_cell(value: &Scalar, row: usize) -> Result<IndexLabel, FrameError> {
    match value {
        Scalar::Int64(v) => Ok(IndexLabel::Int64(*v)),
        Scalar::Utf8(v) => Ok(IndexLabel::Utf8(v.clone())),
        Scalar::Float64(v) => Ok(IndexLabel::Utf8(format_f64(*v))),
        Scalar::Null => Err(FrameError::Invalid(format!(
            "set_index: null label at row {row}"
        ))),
    }
}

/// `base`, or `base` followed by as many `_` as it takes to avoid every
/// name in `taken`. Used for generated label columns.
#[must_use]
pub fn free_column_name<'a, I>(base: &str, taken: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let taken = taken.into_iter().collect::<HashSet<_>>();
    let mut name = base.to_owned();
    while taken.contains(name.as_str()) {
        name.push('_');
    }
    name
}

/// Ordered, uniquely named, equal-length columns plus an optional row index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFrame {
    columns: Vec<Series>,
    positions: BTreeMap<String, usize>,
    index: Option<Index>,
    index_name: Option<String>,
    nrows: usize,
}

impl DataFrame {
    /// Empty frame with the given schema; `capacity` pre-reserves row storage.
    pub fn new(names: &[&str], dtypes: &[DType], capacity: usize) -> Result<Self, FrameError> {
        if names.len() != dtypes.len() {
            return Err(FrameError::RowWidth {
                expected: names.len(),
                found: dtypes.len(),
            });
        }
        let columns = names
            .iter()
            .zip(dtypes)
            .map(|(name, dtype)| Series::with_capacity(*name, *dtype, capacity))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_series(columns)
    }

    pub fn from_series(columns: Vec<Series>) -> Result<Self, FrameError> {
        let nrows = columns.first().map_or(0, Series::len);
        Self::from_parts(columns, None, None, nrows)
    }

    fn from_parts(
        columns: Vec<Series>,
        index: Option<Index>,
        index_name: Option<String>,
        nrows: usize,
    ) -> Result<Self, FrameError> {
        let mut positions = BTreeMap::new();
        for (idx, series) in columns.iter().enumerate() {
            if series.len() != nrows {
                return Err(FrameError::LengthMismatch {
                    name: series.name().to_owned(),
                    expected: nrows,
                    found: series.len(),
                });
            }
            if positions.insert(series.name().to_owned(), idx).is_some() {
                return Err(FrameError::DuplicateColumn(series.name().to_owned()));
            }
        }
        if let Some(index) = &index {
            index.check_len(nrows)?;
        }
        Ok(Self {
            columns,
            positions,
            index,
            index_name,
            nrows,
        })
    }

    /// Same row labels, new columns of the same length.
    fn with_columns(&self, columns: Vec<Series>) -> Result<Self, FrameError> {
        Self::from_parts(
            columns,
            self.index.clone(),
            self.index_name.clone(),
            self.nrows,
        )
    }

    fn map_columns<F>(&self, mut func: F) -> Result<Self, FrameError>
    where
        F: FnMut(&Series) -> Result<Series, FrameError>,
    {
        let columns = self
            .columns
            .iter()
            .map(&mut func)
            .collect::<Result<Vec<_>, _>>()?;
        self.with_columns(columns)
    }

    /// Deep copy; the two frames share no storage afterwards.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }

    // ── Append: the one in-place mutator ───────────────────────────────

    /// Parse and append one row of text fields. On any failure the frame is
    /// left exactly as before the call.
    pub fn append_row(&mut self, fields: &[&str]) -> Result<(), FrameError> {
        self.append_fields(fields, None)
    }

    /// Like [`append_row`](Self::append_row), also treating `na` tokens as null.
    pub fn append_row_with_na(
        &mut self,
        fields: &[&str],
        na: &NullTokens,
    ) -> Result<(), FrameError> {
        self.append_fields(fields, Some(na))
    }

    fn append_fields(
        &mut self,
        fields: &[&str],
        na: Option<&NullTokens>,
    ) -> Result<(), FrameError> {
        self.check_width(fields.len())?;
        let row = self.nrows;
        let values = fields
            .iter()
            .zip(&self.columns)
            .enumerate()
            .map(|(col, (text, series))| {
                parse_field(text, series.dtype(), na)
                    .map_err(|source| FrameError::Field { row, col, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.commit_row(values)
    }

    /// Append typed cells. Each must be null or fit its column's dtype.
    pub fn append_scalars(&mut self, values: Vec<Scalar>) -> Result<(), FrameError> {
        self.check_width(values.len())?;
        for (col, (value, series)) in values.iter().zip(&self.columns).enumerate() {
            series.check_fits(value).map_err(|_| FrameError::Field {
                row: self.nrows,
                col,
                source: TypeError::InvalidCast {
                    from: value.dtype().unwrap_or(series.dtype()),
                    to: series.dtype(),
                },
            })?;
        }
        self.commit_row(values)
    }

    fn check_width(&self, found: usize) -> Result<(), FrameError> {
        if found == self.columns.len() {
            Ok(())
        } else {
            Err(FrameError::RowWidth {
                expected: self.columns.len(),
                found,
            })
        }
    }

    fn commit_row(&mut self, values: Vec<Scalar>) -> Result<(), FrameError> {
        // Reserve everywhere first so the pushes below cannot fail halfway.
        for series in &mut self.columns {
            series.try_reserve(1)?;
        }
        for (series, value) in self.columns.iter_mut().zip(values) {
            series.push(value)?;
        }
        if let Some(index) = &mut self.index {
            index.push(IndexLabel::Int64(self.nrows as i64));
        }
        self.nrows += 1;
        Ok(())
    }

    // ── Read surface ───────────────────────────────────────────────────

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.nrows
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nrows == 0
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(Series::name).collect()
    }

    #[must_use]
    pub fn dtypes(&self) -> Vec<DType> {
        self.columns.iter().map(Series::dtype).collect()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn column(&self, name: &str) -> Result<&Series, FrameError> {
        self.column_index(name)
            .map(|idx| &self.columns[idx])
            .ok_or_else(|| FrameError::UnknownColumn(name.to_owned()))
    }

    #[must_use]
    pub fn column_at(&self, idx: usize) -> Option<&Series> {
        self.columns.get(idx)
    }

    /// Iterate `(column position, series)` in column order.
    pub fn columns(&self) -> impl Iterator<Item = (usize, &Series)> {
        self.columns.iter().enumerate()
    }

    /// Restartable iterator over `(row position, row view)`.
    #[must_use]
    pub fn rows(&self) -> Rows<'_> {
        Rows {
            frame: self,
            next: 0,
        }
    }

    pub fn row(&self, position: usize) -> Result<RowView<'_>, FrameError> {
        self.check_row(position)?;
        Ok(RowView {
            frame: self,
            row: position,
        })
    }

    fn check_row(&self, position: usize) -> Result<(), FrameError> {
        if position < self.nrows {
            Ok(())
        } else {
            Err(FrameError::RowOutOfBounds {
                position,
                len: self.nrows,
            })
        }
    }

    pub fn get_cell(&self, row: usize, column: &str) -> Result<Scalar, FrameError> {
        let series = self.column(column)?;
        self.check_row(row)?;
        Ok(series.value(row)?)
    }

    /// `Ok(None)` for a null cell; an error for an unknown column, a row out
    /// of range or a column that is not Int64.
    pub fn get_i64(&self, row: usize, column: &str) -> Result<Option<i64>, FrameError> {
        let series = self.typed_column(column, row, DType::Int64)?;
        Ok(series.get_i64(row))
    }

    /// Numeric cell widened to f64.
    pub fn get_f64(&self, row: usize, column: &str) -> Result<Option<f64>, FrameError> {
        let series = self.column(column)?;
        self.check_row(row)?;
        series.require_numeric("get_f64")?;
        Ok(series.get_f64(row))
    }

    pub fn get_str(&self, row: usize, column: &str) -> Result<Option<&str>, FrameError> {
        let series = self.typed_column(column, row, DType::Utf8)?;
        Ok(series.get_str(row))
    }

    fn typed_column(&self, column: &str, row: usize, dtype: DType) -> Result<&Series, FrameError> {
        let series = self.column(column)?;
        self.check_row(row)?;
        if series.dtype() != dtype {
            return Err(ColumnError::DtypeMismatch {
                column: column.to_owned(),
                expected: series.dtype(),
                found: dtype,
            }
            .into());
        }
        Ok(series)
    }

    #[must_use]
    pub fn index(&self) -> Option<&Index> {
        self.index.as_ref()
    }

    #[must_use]
    pub fn index_name(&self) -> Option<&str> {
        self.index_name.as_deref()
    }

    fn row_index(&self) -> Cow<'_, Index> {
        match &self.index {
            Some(index) => Cow::Borrowed(index),
            None => Cow::Owned(Index::range(self.nrows)),
        }
    }

    #[must_use]
    pub fn row_label(&self, position: usize) -> Option<IndexLabel> {
        match &self.index {
            Some(index) => index.labels().get(position).cloned(),
            None if position < self.nrows => Some(IndexLabel::Int64(position as i64)),
            None => None,
        }
    }

    // ── Column selection ───────────────────────────────────────────────

    /// Matches `df[[names...]]`: the named columns in the requested order.
    pub fn select(&self, names: &[&str]) -> Result<Self, FrameError> {
        let columns = names
            .iter()
            .map(|name| self.column(name).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        self.with_columns(columns)
    }

    pub fn drop_columns(&self, names: &[&str]) -> Result<Self, FrameError> {
        for name in names {
            self.column(name)?;
        }
        let columns = self
            .columns
            .iter()
            .filter(|series| !names.contains(&series.name()))
            .cloned()
            .collect();
        self.with_columns(columns)
    }

    pub fn rename_columns(&self, renames: &[(&str, &str)]) -> Result<Self, FrameError> {
        for (from, _) in renames {
            self.column(from)?;
        }
        let columns = self
            .columns
            .iter()
            .map(|series| {
                match renames.iter().find(|(from, _)| *from == series.name()) {
                    Some((_, to)) => series.clone().with_name(*to),
                    None => series.clone(),
                }
            })
            .collect();
        self.with_columns(columns)
    }

    /// Replace the column of the same name in place, or append it at the end.
    pub fn with_column(&self, series: Series) -> Result<Self, FrameError> {
        let mut columns = self.columns.clone();
        match self.column_index(series.name()) {
            Some(idx) => columns[idx] = series,
            None => columns.push(series),
        }
        if self.columns.is_empty() && self.index.is_none() {
            return Self::from_series(columns);
        }
        self.with_columns(columns)
    }

    // ── Row selection ──────────────────────────────────────────────────

    /// Rows at `positions`, in that order; positions may repeat.
    pub fn take_rows(&self, positions: &[usize]) -> Result<Self, FrameError> {
        for &position in positions {
            self.check_row(position)?;
        }
        let columns = self
            .columns
            .iter()
            .map(|series| series.take(positions))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_parts(
            columns,
            self.index.as_ref().map(|index| index.take(positions)),
            self.index_name.clone(),
            positions.len(),
        )
    }

    /// Keep rows where `mask` is true.
    pub fn filter_mask(&self, mask: &[bool]) -> Result<Self, FrameError> {
        if mask.len() != self.nrows {
            return Err(FrameError::LengthMismatch {
                name: "mask".to_owned(),
                expected: self.nrows,
                found: mask.len(),
            });
        }
        let positions = mask
            .iter()
            .enumerate()
            .filter_map(|(idx, keep)| keep.then_some(idx))
            .collect::<Vec<_>>();
        self.take_rows(&positions)
    }

    /// Keep rows for which `predicate` holds.
    pub fn filter<F>(&self, mut predicate: F) -> Result<Self, FrameError>
    where
        F: FnMut(&RowView<'_>) -> bool,
    {
        let mask = self.rows().map(|(_, row)| predicate(&row)).collect::<Vec<_>>();
        self.filter_mask(&mask)
    }

    /// Stable multi-key sort. Nulls sort after every value in either
    /// direction; NaN is the greatest present value.
    pub fn sort_values(&self, keys: &[SortKey]) -> Result<Self, FrameError> {
        let columns = keys
            .iter()
            .map(|key| Ok((self.column(&key.column)?, key.ascending)))
            .collect::<Result<Vec<_>, FrameError>>()?;
        debug!("sort_values: {} rows by {} keys", self.nrows, keys.len());
        let mut order = (0..self.nrows).collect::<Vec<_>>();
        order.sort_by(|&a, &b| {
            for (series, ascending) in &columns {
                let ord = match (series.is_null(a), series.is_null(b)) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    (false, false) if *ascending => series.compare_positions(a, b),
                    (false, false) => series.compare_positions(a, b).reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        self.take_rows(&order)
    }

    /// Matches `df.head(n)`; a negative `n` drops the last `-n` rows.
    pub fn head(&self, n: i64) -> Result<Self, FrameError> {
        self.iloc_slice(0, normalize_head_take(n, self.nrows))
    }

    /// Matches `df.tail(n)`; a negative `n` drops the first `-n` rows.
    pub fn tail(&self, n: i64) -> Result<Self, FrameError> {
        self.iloc_slice(normalize_tail_start(n, self.nrows), self.nrows)
    }

    /// Rows `[start, end)` by position, clamped to the frame.
    pub fn iloc_slice(&self, start: usize, end: usize) -> Result<Self, FrameError> {
        let end = end.min(self.nrows);
        let start = start.min(end);
        self.take_rows(&(start..end).collect::<Vec<_>>())
    }

    /// The first row carrying `label` (default labels are `0..n`).
    pub fn loc(&self, label: &IndexLabel) -> Result<Self, FrameError> {
        let position = self.row_index().require_position(label)?;
        self.take_rows(&[position])
    }

    /// Rows from the first `start` label through the last `end` label, inclusive.
    pub fn loc_slice(&self, start: &IndexLabel, end: &IndexLabel) -> Result<Self, FrameError> {
        let positions = self.row_index().slice_positions(start, end)?;
        self.take_rows(&positions)
    }

    /// Move `column` into the row index.
    pub fn set_index(&self, column: &str) -> Result<Self, FrameError> {
        let series = self.column(column)?;
        let labels = series
            .iter()
            .enumerate()
            .map(|(row, value)| label_from_cell(&value, row))
            .collect::<Result<Vec<_>, _>>()?;
        let columns = self
            .columns
            .iter()
            .filter(|s| s.name() != column)
            .cloned()
            .collect();
        Self::from_parts(
            columns,
            Some(Index::new(labels)),
            Some(column.to_owned()),
            self.nrows,
        )
    }

    /// Materialize the row labels as the first column and return to default
    /// labels. The column takes the index's name, else `index`.
    ///
    /// Matches `df.reset_index()`: fails with `DuplicateColumn` when a data
    /// column already carries that name.
    pub fn reset_index(&self) -> Result<Self, FrameError> {
        let name = self.index_name.clone().unwrap_or_else(|| "index".to_owned());
        let index = self.row_index();
        let all_int = index
            .labels()
            .iter()
            .all(|label| matches!(label, IndexLabel::Int64(_)));
        let labels = if all_int {
            Series::from_i64(
                name,
                index.labels().iter().map(|label| match label {
                    IndexLabel::Int64(v) => Some(*v),
                    IndexLabel::Utf8(_) => None,
                }),
            )
        } else {
            Series::from_strs(name, index.labels().iter().map(|label| Some(label.to_string())))
        };
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.push(labels);
        columns.extend(self.columns.iter().cloned());
        Self::from_parts(columns, None, None, self.nrows)
    }

    // ── Null handling ──────────────────────────────────────────────────

    /// Int64 0/1 indicator frame, 1 where the cell is null.
    pub fn isna(&self) -> Result<Self, FrameError> {
        self.map_columns(|series| {
            Ok(Series::from_i64(
                series.name(),
                series.isna().into_iter().map(|na| Some(i64::from(na))),
            ))
        })
    }

    /// Int64 0/1 indicator frame, 1 where the cell holds a value.
    pub fn notna(&self) -> Result<Self, FrameError> {
        self.map_columns(|series| {
            Ok(Series::from_i64(
                series.name(),
                series.notna().into_iter().map(|valid| Some(i64::from(valid))),
            ))
        })
    }

    /// Matches `df.dropna(how=..., subset=...)` row-wise.
    pub fn dropna(&self, how: DropNaHow, subset: Option<&[&str]>) -> Result<Self, FrameError> {
        let selected = match subset {
            Some(names) => names
                .iter()
                .map(|name| self.column(name))
                .collect::<Result<Vec<_>, _>>()?,
            None => self.columns.iter().collect(),
        };
        if selected.is_empty() {
            return Ok(self.clone());
        }
        let keep = (0..self.nrows)
            .map(|row| {
                let missing = selected.iter().filter(|s| s.is_null(row)).count();
                match how {
                    DropNaHow::Any => missing == 0,
                    DropNaHow::All => missing < selected.len(),
                }
            })
            .collect::<Vec<_>>();
        self.filter_mask(&keep)
    }

    /// Fill nulls in every column the fill value can be cast into; other
    /// columns are left unchanged.
    pub fn fillna(&self, fill: &Scalar) -> Result<Self, FrameError> {
        self.map_columns(|series| {
            if cast_scalar(fill, series.dtype()).is_ok() {
                Ok(series.fillna(fill)?)
            } else {
                Ok(series.clone())
            }
        })
    }

    pub fn fillna_column(&self, column: &str, fill: &Scalar) -> Result<Self, FrameError> {
        let filled = self.column(column)?.fillna(fill)?;
        self.with_column(filled)
    }

    /// Matches `df.where(cond, other)`: keep cells on rows where `cond` holds.
    pub fn where_mask(&self, cond: &[bool], other: &Scalar) -> Result<Self, FrameError> {
        self.map_columns(|series| Ok(series.where_mask(cond, other)?))
    }

    /// Matches `df.mask(cond, other)`: replace cells on rows where `cond` holds.
    pub fn mask(&self, cond: &[bool], other: &Scalar) -> Result<Self, FrameError> {
        self.map_columns(|series| Ok(series.mask(cond, other)?))
    }

    /// Clip every numeric column; string columns pass through.
    pub fn clip(&self, lower: Option<f64>, upper: Option<f64>) -> Result<Self, FrameError> {
        if let (Some(lo), Some(hi)) = (lower, upper)
            && lo > hi
        {
            return Err(FrameError::Invalid(format!(
                "clip: lower bound {lo} exceeds upper bound {hi}"
            )));
        }
        self.map_columns(|series| {
            if series.dtype().is_numeric() {
                Ok(series.clip(lower, upper)?)
            } else {
                Ok(series.clone())
            }
        })
    }

    pub fn replace(&self, from: &Scalar, to: &Scalar) -> Result<Self, FrameError> {
        self.map_columns(|series| {
            if cast_scalar(to, series.dtype()).is_ok() {
                Ok(series.replace(from, to)?)
            } else {
                Ok(series.clone())
            }
        })
    }

    // ── Dedup and counting ─────────────────────────────────────────────

    fn resolve_subset(&self, subset: Option<&[&str]>) -> Result<Vec<&Series>, FrameError> {
        match subset {
            Some(names) => names.iter().map(|name| self.column(name)).collect(),
            None => Ok(self.columns.iter().collect()),
        }
    }

    /// Matches `df.duplicated(subset=..., keep=...)`. Nulls equal nulls and
    /// NaN equals NaN here.
    pub fn duplicated(
        &self,
        subset: Option<&[&str]>,
        keep: DuplicateKeep,
    ) -> Result<Vec<bool>, FrameError> {
        let selected = self.resolve_subset(subset)?;
        let row_key = |row: usize| {
            selected
                .iter()
                .map(|series| series.key(row))
                .collect::<Vec<Option<CellKey>>>()
        };
        let mut flags = vec![false; self.nrows];
        match keep {
            DuplicateKeep::First => {
                let mut seen = HashSet::new();
                for (row, flag) in flags.iter_mut().enumerate() {
                    *flag = !seen.insert(row_key(row));
                }
            }
            DuplicateKeep::Last => {
                let mut seen = HashSet::new();
                for (row, flag) in flags.iter_mut().enumerate().rev() {
                    *flag = !seen.insert(row_key(row));
                }
            }
            DuplicateKeep::None => {
                let mut counts = HashMap::<_, usize>::new();
                for row in 0..self.nrows {
                    *counts.entry(row_key(row)).or_default() += 1;
                }
                for (row, flag) in flags.iter_mut().enumerate() {
                    *flag = counts.get(&row_key(row)).is_some_and(|count| *count > 1);
                }
            }
        }
        Ok(flags)
    }

    pub fn drop_duplicates(
        &self,
        subset: Option<&[&str]>,
        keep: DuplicateKeep,
    ) -> Result<Self, FrameError> {
        let duplicated = self.duplicated(subset, keep)?;
        let keep_mask = duplicated.into_iter().map(|dup| !dup).collect::<Vec<_>>();
        self.filter_mask(&keep_mask)
    }

    /// Distinct values of `column` in first-occurrence order.
    pub fn unique(&self, column: &str) -> Result<Series, FrameError> {
        Ok(self.column(column)?.unique()?)
    }

    pub fn nunique(&self, column: &str) -> Result<usize, FrameError> {
        Ok(self.column(column)?.nunique())
    }

    /// Matches `df[column].value_counts()`: distinct non-null values with a
    /// `count` column, most frequent first, ties in first-appearance order.
    pub fn value_counts(&self, column: &str) -> Result<Self, FrameError> {
        let series = self.column(column)?;
        let mut slots = HashMap::new();
        let mut firsts = Vec::new();
        let mut counts = Vec::<i64>::new();
        for row in 0..self.nrows {
            let Some(key) = series.key(row) else {
                continue;
            };
            match slots.entry(key) {
                Entry::Occupied(slot) => counts[*slot.get()] += 1,
                Entry::Vacant(slot) => {
                    slot.insert(firsts.len());
                    firsts.push(row);
                    counts.push(1);
                }
            }
        }
        let mut order = (0..firsts.len()).collect::<Vec<_>>();
        order.sort_by(|a, b| counts[*b].cmp(&counts[*a]));
        let positions = order.iter().map(|slot| firsts[*slot]).collect::<Vec<_>>();
        let values = series.take(&positions)?;
        let counts = Series::from_i64("count", order.iter().map(|slot| Some(counts[*slot])));
        Self::from_series(vec![values, counts])
    }

    // ── Sampling ───────────────────────────────────────────────────────

    /// Draw `n` rows with the caller's generator. Without replacement `n`
    /// may not exceed the row count.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        replace: bool,
        rng: &mut R,
    ) -> Result<Self, FrameError> {
        let positions = if replace {
            if self.nrows == 0 && n > 0 {
                return Err(FrameError::Invalid(
                    "cannot sample from an empty frame".to_owned(),
                ));
            }
            (0..n).map(|_| rng.gen_range(0..self.nrows)).collect::<Vec<_>>()
        } else {
            if n > self.nrows {
                return Err(FrameError::Invalid(format!(
                    "cannot sample {n} rows from {} without replacement",
                    self.nrows
                )));
            }
            rand::seq::index::sample(rng, self.nrows, n).into_vec()
        };
        debug!("sample: {n} of {} rows (replace={replace})", self.nrows);
        self.take_rows(&positions)
    }

    /// Sample `round(frac * rows)` rows.
    pub fn sample_frac<R: Rng + ?Sized>(
        &self,
        frac: f64,
        replace: bool,
        rng: &mut R,
    ) -> Result<Self, FrameError> {
        if !frac.is_finite() || frac < 0.0 || (!replace && frac > 1.0) {
            return Err(FrameError::Invalid(format!("invalid sample fraction {frac}")));
        }
        let n = (frac * self.nrows as f64).round() as usize;
        self.sample(n, replace, rng)
    }

    // ── Callbacks ──────────────────────────────────────────────────────

    /// Build a new column by mapping every row view through `func`.
    pub fn apply<F>(&self, name: &str, dtype: DType, mut func: F) -> Result<Series, FrameError>
    where
        F: FnMut(&RowView<'_>) -> Result<Scalar, FrameError>,
    {
        let mut out = Series::with_capacity(name, dtype, self.nrows)?;
        for (row, view) in self.rows() {
            let value = func(&view)?;
            out.push(value).map_err(|err| match err {
                ColumnError::DtypeMismatch {
                    expected, found, ..
                } => FrameError::Field {
                    row,
                    col: self.columns.len(),
                    source: TypeError::InvalidCast {
                        from: found,
                        to: expected,
                    },
                },
                other => other.into(),
            })?;
        }
        Ok(out)
    }

    /// Map each cell of `column` through `func`. The column keeps its dtype
    /// when every output fits it, else takes the common dtype of the outputs.
    pub fn transform<F>(&self, column: &str, func: F) -> Result<Self, FrameError>
    where
        F: FnMut(&Scalar) -> Scalar,
    {
        let mapped = transform_series(self.column(column)?, func)?;
        self.with_column(mapped)
    }

    /// Map every cell of every column through `func`.
    pub fn applymap<F>(&self, mut func: F) -> Result<Self, FrameError>
    where
        F: FnMut(&Scalar) -> Scalar,
    {
        self.map_columns(|series| transform_series(series, &mut func))
    }

    // ── Casting ────────────────────────────────────────────────────────

    pub fn astype(&self, column: &str, dtype: DType) -> Result<Self, FrameError> {
        let cast = self.column(column)?.astype(dtype)?;
        self.with_column(cast)
    }

    pub fn to_numeric(&self, column: &str, coerce: bool) -> Result<Self, FrameError> {
        let parsed = self.column(column)?.to_numeric(coerce)?;
        self.with_column(parsed)
    }

    /// Parse an ISO-8601 string column into Int64 epoch seconds.
    pub fn to_datetime(&self, column: &str, coerce: bool) -> Result<Self, FrameError> {
        let parsed = self.column(column)?.to_datetime(coerce)?;
        self.with_column(parsed)
    }

    // ── Rendering ──────────────────────────────────────────────────────

    /// Write the aligned rendering of [`Display`](fmt::Display) to `sink`.
    pub fn write_to(&self, sink: &mut dyn io::Write) -> Result<(), FrameError> {
        write!(sink, "{self}")?;
        Ok(())
    }

    /// Row/column counts and per-column non-null counts.
    pub fn info(&self, sink: &mut dyn io::Write) -> Result<(), FrameError> {
        writeln!(
            sink,
            "DataFrame: {} rows x {} columns",
            self.nrows,
            self.columns.len()
        )?;
        let width = self
            .columns
            .iter()
            .map(|s| s.name().len())
            .max()
            .unwrap_or(0)
            .max("Column".len());
        writeln!(sink, "{:>3}  {:<width$}  {:>8}  Dtype", "#", "Column", "Non-Null")?;
        for (idx, series) in self.columns() {
            writeln!(
                sink,
                "{idx:>3}  {:<width$}  {:>8}  {}",
                series.name(),
                series.count(),
                series.dtype()
            )?;
        }
        Ok(())
    }

    /// Cell-for-cell equality: names, dtypes, null positions, labels. NaN
    /// equals NaN.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.nrows == other.nrows
            && self.index == other.index
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| a.semantic_eq(b))
    }
}

fn transform_series<F>(series: &Series, mut func: F) -> Result<Series, FrameError>
where
    F: FnMut(&Scalar) -> Scalar,
{
    let values = series.iter().map(|value| func(&value)).collect::<Vec<_>>();
    let fits = values.iter().all(|value| series.check_fits(value).is_ok());
    let dtype = if fits {
        series.dtype()
    } else {
        let mut dtypes = values.iter().filter_map(Scalar::dtype);
        let first = dtypes.next().unwrap_or(series.dtype());
        dtypes.try_fold(first, common_dtype)?
    };
    Ok(Series::from_scalars(series.name(), dtype, values)?)
}

fn render_cell(value: &Scalar) -> String {
    match value {
        Scalar::Null => "null".to_owned(),
        other => format_scalar(other),
    }
}

impl fmt::Display for DataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            return writeln!(f, "Empty DataFrame ({} rows)", self.nrows);
        }
        let mut grid: Vec<Vec<String>> = Vec::with_capacity(self.columns.len() + 1);
        if let Some(index) = &self.index {
            let mut cells = vec![self.index_name.clone().unwrap_or_default()];
            cells.extend(index.labels().iter().map(ToString::to_string));
            grid.push(cells);
        }
        for series in &self.columns {
            let mut cells = Vec::with_capacity(self.nrows + 1);
            cells.push(series.name().to_owned());
            cells.extend(series.iter().map(|value| render_cell(&value)));
            grid.push(cells);
        }
        let widths = grid
            .iter()
            .map(|cells| cells.iter().map(|c| c.chars().count()).max().unwrap_or(0))
            .collect::<Vec<_>>();
        for line in 0..=self.nrows {
            let rendered = grid
                .iter()
                .zip(&widths)
                .map(|(cells, width)| format!("{:>width$}", cells[line]))
                .collect::<Vec<_>>();
            writeln!(f, "{}", rendered.join("  "))?;
        }
        Ok(())
    }
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    frame: &'a DataFrame,
    row: usize,
}

impl<'a> RowView<'a> {
    #[must_use]
    pub fn position(&self) -> usize {
        self.row
    }

    #[must_use]
    pub fn label(&self) -> Option<IndexLabel> {
        self.frame.row_label(self.row)
    }

    /// `None` for an unknown column; `Some(Scalar::Null)` for a null cell.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<Scalar> {
        self.frame.column(column).ok()?.get(self.row)
    }

    #[must_use]
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.frame.column(column).ok()?.get_i64(self.row)
    }

    #[must_use]
    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.frame.column(column).ok()?.get_f64(self.row)
    }

    #[must_use]
    pub fn get_str(&self, column: &str) -> Option<&'a str> {
        self.frame.column(column).ok()?.get_str(self.row)
    }

    #[must_use]
    pub fn values(&self) -> Vec<Scalar> {
        self.frame
            .columns
            .iter()
            .map(|series| series.get(self.row).unwrap_or(Scalar::Null))
            .collect()
    }
}

/// Iterator returned by [`DataFrame::rows`].
#[derive(Debug, Clone)]
pub struct Rows<'a> {
    frame: &'a DataFrame,
    next: usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = (usize, RowView<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.frame.nrows {
            return None;
        }
        let row = self.next;
        self.next += 1;
        Some((
            row,
            RowView {
                frame: self.frame,
                row,
            },
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.frame.nrows.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Rows<'_> {}
