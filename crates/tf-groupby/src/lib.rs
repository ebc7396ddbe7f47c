#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tf_columnar::{CellKey, ColumnData, ColumnError, Series, compare_f64_nan_last};
use tf_frame::{DataFrame, FrameError, free_column_name};
use tf_types::{DType, ErrorKind, ErrorRecord, Scalar, TypeError, format_scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupByOptions {
    /// Drop rows whose key contains a null. When false, null keys form a group.
    pub dropna: bool,
}

impl Default for GroupByOptions {
    fn default() -> Self {
        Self { dropna: true }
    }
}

/// Aggregation function selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggOp {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    Median,
    Std,
    First,
    Last,
}

impl AggOp {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
            Self::Std => "std",
            Self::First => "first",
            Self::Last => "last",
        }
    }

    /// Ops that also accept Utf8 input.
    #[must_use]
    pub fn accepts_strings(self) -> bool {
        matches!(self, Self::Count | Self::First | Self::Last)
    }

    /// Output dtype for an input column of `input` dtype.
    #[must_use]
    pub fn output_dtype(self, input: DType) -> DType {
        match self {
            Self::Count => DType::Int64,
            Self::Mean | Self::Median | Self::Std => DType::Float64,
            Self::Sum | Self::Min | Self::Max | Self::First | Self::Last => input,
        }
    }
}

impl fmt::Display for AggOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggOp {
    type Err = GroupByError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "mean" => Self::Mean,
            "min" => Self::Min,
            "max" => Self::Max,
            "median" => Self::Median,
            "std" => Self::Std,
            "first" => Self::First,
            "last" => Self::Last,
            _ => return Err(GroupByError::UnknownOp(s.to_owned())),
        })
    }
}

/// One output column: `op` applied to `column`, named `{column}_{op}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggSpec {
    pub column: String,
    pub op: AggOp,
}

impl AggSpec {
    #[must_use]
    pub fn new(column: impl Into<String>, op: AggOp) -> Self {
        Self {
            column: column.into(),
            op,
        }
    }

    #[must_use]
    pub fn output_name(&self) -> String {
        format!("{}_{}", self.column, self.op)
    }
}

#[derive(Debug, Error)]
pub enum GroupByError {
    #[error("group-by requires at least one key column")]
    NoKeys,
    #[error("{values} value columns were given with {ops} aggregation ops")]
    SpecLength { values: usize, ops: usize },
    #[error("unknown aggregation '{0}'")]
    UnknownOp(String),
    #[error("{op} is not supported for {dtype} column '{column}'")]
    UnsupportedOp {
        op: AggOp,
        column: String,
        dtype: DType,
    },
    #[error("{op} of column '{column}' overflows int64")]
    Overflow { op: AggOp, column: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl ErrorRecord for GroupByError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(err) => err.kind(),
            Self::Column(err) => err.kind(),
            Self::Type(err) => err.kind(),
            _ => ErrorKind::InvalidArgument,
        }
    }
}

// ── Grouping ───────────────────────────────────────────────────────────

/// Row membership of each distinct key, in first-occurrence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIndex {
    first_positions: Vec<usize>,
    members: Vec<Vec<usize>>,
}

impl GroupIndex {
    /// Group `frame` rows by the values of `keys`.
    pub fn build(
        frame: &DataFrame,
        keys: &[&str],
        options: GroupByOptions,
    ) -> Result<Self, GroupByError> {
        if keys.is_empty() {
            return Err(GroupByError::NoKeys);
        }
        let key_columns = keys
            .iter()
            .map(|name| frame.column(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut slots = HashMap::<Vec<Option<CellKey<'_>>>, usize>::new();
        let mut index = Self {
            first_positions: Vec::new(),
            members: Vec::new(),
        };
        let mut dropped = 0_usize;
        for row in 0..frame.num_rows() {
            let key = key_columns
                .iter()
                .map(|series| series.key(row))
                .collect::<Vec<_>>();
            if options.dropna && key.iter().any(Option::is_none) {
                dropped += 1;
                continue;
            }
            let next = index.members.len();
            let slot = *slots.entry(key).or_insert(next);
            if slot == next {
                index.first_positions.push(row);
                index.members.push(Vec::new());
            }
            index.members[slot].push(row);
        }
        debug!(
            "grouped {} rows by {:?} into {} groups ({} null-key rows dropped)",
            frame.num_rows(),
            keys,
            index.len(),
            dropped
        );
        Ok(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Position of each group's first row.
    #[must_use]
    pub fn first_positions(&self) -> &[usize] {
        &self.first_positions
    }

    #[must_use]
    pub fn members(&self, group: usize) -> &[usize] {
        self.members.get(group).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[usize]> + '_ {
        self.members.iter().map(Vec::as_slice)
    }
}

// ── Aggregation kernels ────────────────────────────────────────────────

fn check_op(series: &Series, op: AggOp) -> Result<(), GroupByError> {
    if series.dtype() == DType::Utf8 && !op.accepts_strings() {
        return Err(GroupByError::UnsupportedOp {
            op,
            column: series.name().to_owned(),
            dtype: series.dtype(),
        });
    }
    Ok(())
}

fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((ss / (n - 1.0)).sqrt())
}

fn median_of(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(|a, b| compare_f64_nan_last(*a, *b));
    let mid = values.len() / 2;
    Some(if values.len().is_multiple_of(2) {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// Reduce the non-null cells of `series` at `rows`.
///
/// A group with no non-null cells yields `count = 0` and null for every
/// other op. A NaN cell makes every arithmetic op NaN.
pub fn aggregate(series: &Series, rows: &[usize], op: AggOp) -> Result<Scalar, GroupByError> {
    check_op(series, op)?;
    let present = rows
        .iter()
        .copied()
        .filter(|&row| !series.is_null(row))
        .collect::<Vec<_>>();

    match op {
        AggOp::Count => return Ok(Scalar::Int64(present.len() as i64)),
        AggOp::First => {
            return Ok(present
                .first()
                .and_then(|&row| series.get(row))
                .unwrap_or(Scalar::Null));
        }
        AggOp::Last => {
            return Ok(present
                .last()
                .and_then(|&row| series.get(row))
                .unwrap_or(Scalar::Null));
        }
        _ => {}
    }
    if present.is_empty() {
        return Ok(Scalar::Null);
    }

    if let ColumnData::Int64(data) = series.data() {
        let overflow = || GroupByError::Overflow {
            op,
            column: series.name().to_owned(),
        };
        let mut ints = present.iter().map(|&row| data[row]);
        match op {
            AggOp::Sum => {
                let total = ints.try_fold(0_i64, i64::checked_add).ok_or_else(overflow)?;
                return Ok(Scalar::Int64(total));
            }
            AggOp::Min => return Ok(ints.min().map_or(Scalar::Null, Scalar::Int64)),
            AggOp::Max => return Ok(ints.max().map_or(Scalar::Null, Scalar::Int64)),
            _ => {}
        }
    }

    let mut values = present
        .iter()
        .filter_map(|&row| series.get_f64(row))
        .collect::<Vec<_>>();
    let poisoned = values.iter().any(|v| v.is_nan());
    let result = match op {
        _ if poisoned => Some(f64::NAN),
        AggOp::Sum => Some(values.iter().sum()),
        AggOp::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
        AggOp::Min => values.iter().copied().reduce(f64::min),
        AggOp::Max => values.iter().copied().reduce(f64::max),
        AggOp::Median => median_of(&mut values),
        AggOp::Std => sample_std(&values),
        AggOp::Count | AggOp::First | AggOp::Last => None,
    };
    Ok(result.map_or(Scalar::Null, Scalar::Float64))
}

fn aggregate_groups(
    series: &Series,
    groups: &GroupIndex,
    op: AggOp,
    name: String,
) -> Result<Series, GroupByError> {
    check_op(series, op)?;
    let mut out = Series::with_capacity(name, op.output_dtype(series.dtype()), groups.len())?;
    for (group, rows) in groups.iter().enumerate() {
        let value = aggregate(series, rows, op)?;
        trace!("group {group}: {}({}) = {value}", op, series.name());
        out.push(value)?;
    }
    Ok(out)
}

// ── Entry points ───────────────────────────────────────────────────────

/// Matches `df.groupby(key).agg({value: op, ...})`.
///
/// `value_columns[i]` is aggregated with `ops[i]`; the output holds the key
/// column followed by one `{value}_{op}` column per pair.
pub fn groupby_agg(
    frame: &DataFrame,
    key_column: &str,
    value_columns: &[&str],
    ops: &[AggOp],
) -> Result<DataFrame, GroupByError> {
    if value_columns.len() != ops.len() {
        return Err(GroupByError::SpecLength {
            values: value_columns.len(),
            ops: ops.len(),
        });
    }
    let specs = value_columns
        .iter()
        .zip(ops)
        .map(|(column, op)| AggSpec::new(*column, *op))
        .collect::<Vec<_>>();
    groupby_agg_multi(frame, &[key_column], &specs, GroupByOptions::default())
}

/// Group by several key columns; keys lead the output in the given order.
pub fn groupby_agg_multi(
    frame: &DataFrame,
    keys: &[&str],
    specs: &[AggSpec],
    options: GroupByOptions,
) -> Result<DataFrame, GroupByError> {
    for spec in specs {
        check_op(frame.column(&spec.column)?, spec.op)?;
    }
    let groups = GroupIndex::build(frame, keys, options)?;

    let mut columns = Vec::with_capacity(keys.len() + specs.len());
    for key in keys {
        columns.push(frame.column(key)?.take(groups.first_positions())?);
    }
    for spec in specs {
        columns.push(aggregate_groups(
            frame.column(&spec.column)?,
            &groups,
            spec.op,
            spec.output_name(),
        )?);
    }
    Ok(DataFrame::from_series(columns)?)
}

/// Row count per group, as a `size` column after the keys.
pub fn groupby_size(
    frame: &DataFrame,
    keys: &[&str],
    options: GroupByOptions,
) -> Result<DataFrame, GroupByError> {
    let groups = GroupIndex::build(frame, keys, options)?;
    let mut columns = Vec::with_capacity(keys.len() + 1);
    for key in keys {
        columns.push(frame.column(key)?.take(groups.first_positions())?);
    }
    columns.push(Series::from_i64(
        "size",
        groups.iter().map(|rows| Some(rows.len() as i64)),
    ));
    Ok(DataFrame::from_series(columns)?)
}

/// Matches `pd.pivot_table(df, index=index, columns=columns, values=values, aggfunc=op)`.
///
/// Rows with a null in `index` or `columns` are dropped. Output columns are
/// the `index` column followed by one column per distinct `columns` value in
/// first-appearance order, named by its text form; a label that repeats an
/// earlier column name takes trailing underscores. Missing combinations are
/// null, or `0` for `count`.
pub fn pivot_table(
    frame: &DataFrame,
    index: &str,
    columns: &str,
    values: &str,
    op: AggOp,
) -> Result<DataFrame, GroupByError> {
    let value_series = frame.column(values)?;
    check_op(value_series, op)?;
    let column_series = frame.column(columns)?;

    let rows = GroupIndex::build(frame, &[index], GroupByOptions::default())?;
    let wide = GroupIndex::build(frame, &[columns], GroupByOptions::default())?;
    let mut wide_slot = vec![None; frame.num_rows()];
    for (slot, members) in wide.iter().enumerate() {
        for &row in members {
            wide_slot[row] = Some(slot);
        }
    }

    // cells[wide][row group] holds the member rows of each combination.
    let mut cells = vec![vec![Vec::new(); rows.len()]; wide.len()];
    for (group, members) in rows.iter().enumerate() {
        for &row in members {
            if let Some(slot) = wide_slot[row] {
                cells[slot][group].push(row);
            }
        }
    }
    debug!(
        "pivot {index} x {columns}: {} rows, {} columns",
        rows.len(),
        wide.len()
    );

    let dtype = op.output_dtype(value_series.dtype());
    let mut out = Vec::with_capacity(wide.len() + 1);
    out.push(frame.column(index)?.take(rows.first_positions())?);
    let mut taken = vec![index.to_owned()];
    for (slot, &first) in wide.first_positions().iter().enumerate() {
        let text = format_scalar(&column_series.value(first)?);
        let label = free_column_name(&text, taken.iter().map(String::as_str));
        taken.push(label.clone());
        let mut series = Series::with_capacity(label, dtype, rows.len())?;
        for members in &cells[slot] {
            let value = if members.is_empty() && op == AggOp::Count {
                Scalar::Int64(0)
            } else if members.is_empty() {
                Scalar::Null
            } else {
                aggregate(value_series, members, op)?
            };
            series.push(value)?;
        }
        out.push(series);
    }
    Ok(DataFrame::from_series(out)?)
}

#[cfg(test)]
mod tests {
    use tf_columnar::Series;
    use tf_frame::DataFrame;
    use tf_types::{DType, ErrorKind, ErrorRecord, Scalar};

    use super::{
        AggOp, AggSpec, GroupByError, GroupByOptions, GroupIndex, aggregate, groupby_agg,
        groupby_agg_multi, groupby_size, pivot_table,
    };

    fn sales() -> DataFrame {
        DataFrame::from_series(vec![
            Series::from_strs(
                "region",
                [Some("east"), Some("west"), Some("east"), None, Some("west"), Some("north")],
            ),
            Series::from_strs(
                "quarter",
                [Some("q1"), Some("q1"), Some("q2"), Some("q1"), Some("q2"), Some("q2")],
            ),
            Series::from_i64("units", [Some(3), Some(5), Some(4), Some(100), None, None]),
            Series::from_f64(
                "price",
                [Some(1.5), Some(2.0), Some(2.5), Some(9.0), Some(4.0), None],
            ),
        ])
        .expect("sales")
    }

    #[test]
    fn groups_follow_first_occurrence_and_skip_null_keys() {
        let out = groupby_agg(
            &sales(),
            "region",
            &["units", "units", "price"],
            &[AggOp::Sum, AggOp::Count, AggOp::Mean],
        )
        .expect("groupby");
        assert_eq!(
            out.column_names(),
            vec!["region", "units_sum", "units_count", "price_mean"]
        );
        assert_eq!(out.num_rows(), 3);
        assert_eq!(out.get_str(0, "region").expect("key"), Some("east"));
        assert_eq!(out.get_str(1, "region").expect("key"), Some("west"));
        assert_eq!(out.get_str(2, "region").expect("key"), Some("north"));
        assert_eq!(out.get_i64(0, "units_sum").expect("sum"), Some(7));
        assert_eq!(out.get_i64(1, "units_sum").expect("sum"), Some(5));
        assert_eq!(out.get_i64(1, "units_count").expect("count"), Some(1));
        assert_eq!(out.get_f64(0, "price_mean").expect("mean"), Some(2.0));
        assert_eq!(out.get_f64(1, "price_mean").expect("mean"), Some(3.0));
    }

    #[test]
    fn all_null_group_counts_zero_and_nulls_the_rest() {
        let out = groupby_agg(
            &sales(),
            "region",
            &["units", "units", "units", "price"],
            &[AggOp::Count, AggOp::Sum, AggOp::Max, AggOp::Std],
        )
        .expect("groupby");
        assert_eq!(out.get_i64(2, "units_count").expect("count"), Some(0));
        assert_eq!(out.get_cell(2, "units_sum").expect("sum"), Scalar::Null);
        assert_eq!(out.get_cell(2, "units_max").expect("max"), Scalar::Null);
        assert_eq!(out.get_cell(2, "price_std").expect("std"), Scalar::Null);
    }

    #[test]
    fn output_dtypes_follow_the_op() {
        let out = groupby_agg(
            &sales(),
            "region",
            &["units", "units", "units", "units", "price"],
            &[AggOp::Min, AggOp::Mean, AggOp::Median, AggOp::First, AggOp::Sum],
        )
        .expect("groupby");
        assert_eq!(
            out.dtypes(),
            vec![
                DType::Utf8,
                DType::Int64,
                DType::Float64,
                DType::Float64,
                DType::Int64,
                DType::Float64
            ]
        );
        assert_eq!(out.get_f64(0, "units_median").expect("median"), Some(3.5));
    }

    #[test]
    fn numeric_ops_on_strings_are_rejected() {
        let err = groupby_agg(&sales(), "quarter", &["region"], &[AggOp::Sum])
            .expect_err("sum of strings");
        assert!(matches!(err, GroupByError::UnsupportedOp { op: AggOp::Sum, .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let out = groupby_agg(
            &sales(),
            "quarter",
            &["region", "region", "region"],
            &[AggOp::Count, AggOp::First, AggOp::Last],
        )
        .expect("string ops");
        assert_eq!(out.get_i64(0, "region_count").expect("count"), Some(2));
        assert_eq!(out.get_str(0, "region_first").expect("first"), Some("east"));
        assert_eq!(out.get_str(1, "region_last").expect("last"), Some("north"));
    }

    #[test]
    fn mismatched_spec_lengths_and_unknown_columns_fail() {
        assert!(matches!(
            groupby_agg(&sales(), "region", &["units"], &[]),
            Err(GroupByError::SpecLength { values: 1, ops: 0 })
        ));
        assert!(groupby_agg(&sales(), "missing", &["units"], &[AggOp::Sum]).is_err());
        assert!(groupby_agg(&sales(), "region", &["missing"], &[AggOp::Sum]).is_err());
    }

    #[test]
    fn nan_poisons_arithmetic_ops() {
        let series = Series::from_f64("x", [Some(1.0), Some(f64::NAN), None, Some(3.0)]);
        let rows = [0, 1, 2, 3];
        for op in [AggOp::Sum, AggOp::Mean, AggOp::Min, AggOp::Max, AggOp::Median, AggOp::Std] {
            let value = aggregate(&series, &rows, op).expect("aggregate");
            assert!(value.is_nan(), "{op}");
        }
        assert_eq!(aggregate(&series, &rows, AggOp::Count).expect("count"), Scalar::Int64(3));
        assert_eq!(
            aggregate(&series, &[0, 3], AggOp::Std).expect("std"),
            Scalar::Float64(2.0_f64.sqrt())
        );
    }

    #[test]
    fn int_sum_overflow_is_an_error() {
        let series = Series::from_i64("x", [Some(i64::MAX), Some(1)]);
        assert!(matches!(
            aggregate(&series, &[0, 1], AggOp::Sum),
            Err(GroupByError::Overflow { .. })
        ));
        assert_eq!(
            aggregate(&series, &[0, 1], AggOp::Mean).expect("mean"),
            Scalar::Float64((i64::MAX as f64 + 1.0) / 2.0)
        );
    }

    #[test]
    fn multi_key_groups_and_null_key_groups() {
        let specs = [AggSpec::new("units", AggOp::Sum)];
        let out = groupby_agg_multi(
            &sales(),
            &["quarter", "region"],
            &specs,
            GroupByOptions::default(),
        )
        .expect("multi");
        assert_eq!(out.column_names(), vec!["quarter", "region", "units_sum"]);
        assert_eq!(out.num_rows(), 5);

        let kept = groupby_agg_multi(
            &sales(),
            &["region"],
            &specs,
            GroupByOptions { dropna: false },
        )
        .expect("null group");
        assert_eq!(kept.num_rows(), 4);
        assert_eq!(kept.get_cell(2, "region").expect("key"), Scalar::Null);
        assert_eq!(kept.get_i64(2, "units_sum").expect("sum"), Some(100));
    }

    #[test]
    fn group_index_and_size() {
        let groups = GroupIndex::build(&sales(), &["quarter"], GroupByOptions::default())
            .expect("groups");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.members(0), &[0, 1, 3]);
        assert_eq!(groups.members(1), &[2, 4, 5]);
        assert!(groups.members(9).is_empty());

        let size = groupby_size(&sales(), &["quarter"], GroupByOptions::default()).expect("size");
        assert_eq!(size.get_i64(1, "size").expect("size"), Some(3));
        assert!(matches!(
            GroupIndex::build(&sales(), &[], GroupByOptions::default()),
            Err(GroupByError::NoKeys)
        ));
    }

    #[test]
    fn pivot_reshapes_and_fills_missing_cells() {
        let out = pivot_table(&sales(), "region", "quarter", "units", AggOp::Sum).expect("pivot");
        assert_eq!(out.column_names(), vec!["region", "q1", "q2"]);
        assert_eq!(out.num_rows(), 3);
        assert_eq!(out.get_i64(0, "q1").expect("cell"), Some(3));
        assert_eq!(out.get_i64(0, "q2").expect("cell"), Some(4));
        // west/q2 exists but every value is null; north/q1 never occurs.
        assert_eq!(out.get_cell(1, "q2").expect("cell"), Scalar::Null);
        assert_eq!(out.get_cell(2, "q1").expect("cell"), Scalar::Null);

        let counts =
            pivot_table(&sales(), "region", "quarter", "units", AggOp::Count).expect("pivot");
        assert_eq!(counts.get_i64(2, "q1").expect("missing"), Some(0));
        assert_eq!(counts.get_i64(1, "q2").expect("all null"), Some(0));
    }

    #[test]
    fn pivot_column_labels_use_text_form() {
        let frame = DataFrame::from_series(vec![
            Series::from_strs("k", [Some("a"), Some("a"), Some("b")]),
            Series::from_i64("year", [Some(2024), Some(2025), Some(2024)]),
            Series::from_f64("v", [Some(1.0), Some(2.0), Some(3.0)]),
        ])
        .expect("frame");
        let out = pivot_table(&frame, "k", "year", "v", AggOp::Mean).expect("pivot");
        assert_eq!(out.column_names(), vec!["k", "2024", "2025"]);
        assert_eq!(out.get_f64(1, "2024").expect("cell"), Some(3.0));
        assert_eq!(out.get_f64(1, "2025").expect("cell"), None);
    }

    #[test]
    fn pivot_labels_never_collide_with_the_index_or_each_other() {
        let frame = DataFrame::from_series(vec![
            Series::from_strs("a", [Some("x"), Some("x"), Some("y"), Some("y")]),
            Series::from_strs("c", [Some("a"), Some("b"), Some("a"), Some("a_")]),
            Series::from_i64("v", [Some(1), Some(2), Some(3), Some(4)]),
        ])
        .expect("frame");
        let out = pivot_table(&frame, "a", "c", "v", AggOp::Sum).expect("pivot");
        assert_eq!(out.column_names(), vec!["a", "a_", "b", "a__"]);
        assert_eq!(out.get_str(0, "a").expect("index"), Some("x"));
        assert_eq!(out.get_i64(0, "a_").expect("x/a"), Some(1));
        assert_eq!(out.get_i64(1, "a_").expect("y/a"), Some(3));
        assert_eq!(out.get_i64(1, "a__").expect("y/a_"), Some(4));
        assert_eq!(out.get_i64(0, "a__").expect("x/a_"), None);
    }

    #[test]
    fn agg_op_parses_and_serializes() {
        assert_eq!("MEDIAN".parse::<AggOp>().expect("parse"), AggOp::Median);
        assert!("mode".parse::<AggOp>().is_err());
        let json = serde_json::to_string(&AggSpec::new("x", AggOp::Std)).expect("json");
        assert_eq!(json, r#"{"column":"x","op":"std"}"#);
        let options: GroupByOptions = serde_json::from_str("{}").expect("defaults");
        assert!(options.dropna);
    }
}
