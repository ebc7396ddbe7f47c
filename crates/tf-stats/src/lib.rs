#![forbid(unsafe_code)]

use std::cmp::Ordering;

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tf_columnar::{ColumnData, ColumnError, Series, compare_f64_nan_last};
use tf_frame::{DataFrame, FrameError, free_column_name};
use tf_types::{DType, ErrorKind, ErrorRecord};

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("{op} of column '{column}' has no non-null values")]
    NoValues { op: &'static str, column: String },
    #[error("{op} of column '{column}' needs at least {needed} values, found {found}")]
    TooFewValues {
        op: &'static str,
        column: String,
        needed: usize,
        found: usize,
    },
    #[error("{op} is not supported for {dtype} column '{column}'")]
    UnsupportedDtype {
        op: &'static str,
        column: String,
        dtype: DType,
    },
    #[error("quantile {0} is outside [0, 1]")]
    Quantile(f64),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

impl ErrorRecord for StatsError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(err) => err.kind(),
            Self::Column(err) => err.kind(),
            _ => ErrorKind::InvalidArgument,
        }
    }
}

/// Summary of one numeric column. `sum` and `mean` are `None` when `count` is 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub count: usize,
    pub nulls: usize,
    pub sum: Option<f64>,
    pub mean: Option<f64>,
}

fn numeric_column<'a>(
    frame: &'a DataFrame,
    column: &str,
    op: &'static str,
) -> Result<&'a Series, StatsError> {
    let series = frame.column(column)?;
    if series.dtype() == DType::Utf8 {
        return Err(StatsError::UnsupportedDtype {
            op,
            column: column.to_owned(),
            dtype: series.dtype(),
        });
    }
    Ok(series)
}

/// Non-null values of a numeric column, failing when there are fewer than `needed`.
fn present_values(
    frame: &DataFrame,
    column: &str,
    op: &'static str,
    needed: usize,
) -> Result<Vec<f64>, StatsError> {
    let values = numeric_column(frame, column, op)?.numeric_values()?;
    match values.len() {
        0 => Err(StatsError::NoValues {
            op,
            column: column.to_owned(),
        }),
        found if found < needed => Err(StatsError::TooFewValues {
            op,
            column: column.to_owned(),
            needed,
            found,
        }),
        _ => Ok(values),
    }
}

pub fn column_stats(frame: &DataFrame, column: &str) -> Result<ColumnStats, StatsError> {
    let series = numeric_column(frame, column, "column_stats")?;
    let values = series.numeric_values()?;
    let sum = (!values.is_empty()).then(|| values.iter().sum::<f64>());
    Ok(ColumnStats {
        count: values.len(),
        nulls: series.null_count(),
        sum,
        mean: sum.map(|total| total / values.len() as f64),
    })
}

/// Non-null cells of any dtype.
pub fn count(frame: &DataFrame, column: &str) -> Result<usize, StatsError> {
    Ok(frame.column(column)?.count())
}

pub fn sum(frame: &DataFrame, column: &str) -> Result<f64, StatsError> {
    Ok(present_values(frame, column, "sum", 1)?.iter().sum())
}

/// Matches `df[column].mean()`, except that an all-null column is an error.
pub fn mean(frame: &DataFrame, column: &str) -> Result<f64, StatsError> {
    let values = present_values(frame, column, "mean", 1)?;
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

fn extreme(values: &[f64], pick: fn(f64, f64) -> f64) -> f64 {
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    values.iter().copied().reduce(pick).unwrap_or(f64::NAN)
}

pub fn min(frame: &DataFrame, column: &str) -> Result<f64, StatsError> {
    Ok(extreme(&present_values(frame, column, "min", 1)?, f64::min))
}

pub fn max(frame: &DataFrame, column: &str) -> Result<f64, StatsError> {
    Ok(extreme(&present_values(frame, column, "max", 1)?, f64::max))
}

/// Linear interpolation between closest ranks of sorted values.
fn percentile_linear(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = pos - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| compare_f64_nan_last(*a, *b));
    values
}

/// `q`-quantile with linear interpolation, `q` in `[0, 1]`.
pub fn quantile(frame: &DataFrame, column: &str, q: f64) -> Result<f64, StatsError> {
    if !(0.0..=1.0).contains(&q) {
        return Err(StatsError::Quantile(q));
    }
    let values = present_values(frame, column, "quantile", 1)?;
    if values.iter().any(|v| v.is_nan()) {
        return Ok(f64::NAN);
    }
    Ok(percentile_linear(&sorted(values), q))
}

/// Midpoint of the sorted non-null values; the two middle values are averaged
/// for even counts.
pub fn median(frame: &DataFrame, column: &str) -> Result<f64, StatsError> {
    quantile(frame, column, 0.5)
}

fn sample_variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
}

/// Sample variance (divides by `count - 1`).
pub fn var(frame: &DataFrame, column: &str) -> Result<f64, StatsError> {
    Ok(sample_variance(&present_values(frame, column, "var", 2)?))
}

/// Sample standard deviation; needs at least two non-null values.
pub fn std(frame: &DataFrame, column: &str) -> Result<f64, StatsError> {
    Ok(sample_variance(&present_values(frame, column, "std", 2)?).sqrt())
}

/// Average ranks starting at 1; tied cells share the mean of their positions.
///
/// Any dtype is ranked in its sort order (NaN after every number). Nulls stay
/// null in the Float64 result.
pub fn rank(frame: &DataFrame, column: &str) -> Result<Series, StatsError> {
    let series = frame.column(column)?;
    let mut order = (0..series.len())
        .filter(|&row| !series.is_null(row))
        .collect::<Vec<_>>();
    order.sort_by(|a, b| series.compare_positions(*a, *b));

    let mut ranks = vec![None; series.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len()
            && series.compare_positions(order[start], order[end]) == Ordering::Equal
        {
            end += 1;
        }
        // Positions start..end hold ranks start+1..=end.
        let average = (start + 1 + end) as f64 / 2.0;
        for &row in &order[start..end] {
            ranks[row] = Some(average);
        }
        start = end;
    }
    Ok(Series::from_f64(series.name(), ranks))
}

/// `value[i] - value[i - 1]`; null at row 0 and next to any null.
/// Int64 stays Int64 with overflow producing null.
pub fn diff(frame: &DataFrame, column: &str) -> Result<Series, StatsError> {
    let series = numeric_column(frame, column, "diff")?;
    let rows = 0..series.len();
    Ok(match series.data() {
        ColumnData::Int64(_) => Series::from_i64(
            series.name(),
            rows.map(|row| {
                let prev = row.checked_sub(1)?;
                series.get_i64(row)?.checked_sub(series.get_i64(prev)?)
            }),
        ),
        _ => Series::from_f64(
            series.name(),
            rows.map(|row| {
                let prev = row.checked_sub(1)?;
                Some(series.get_f64(row)? - series.get_f64(prev)?)
            }),
        ),
    })
}

// ── Pairwise and frame summaries ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pairwise {
    Cov,
    Corr,
}

/// Rows where both cells are present. `None` below two rows or when a
/// correlation has zero variance.
fn pairwise(x: &Series, y: &Series, stat: Pairwise) -> Option<f64> {
    let pairs = (0..x.len())
        .filter_map(|row| Some((x.get_f64(row)?, y.get_f64(row)?)))
        .collect::<Vec<_>>();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in &pairs {
        let (dx, dy) = (a - mean_x, b - mean_y);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    match stat {
        Pairwise::Cov => Some(sxy / (n - 1.0)),
        Pairwise::Corr => {
            let denom = (sxx * syy).sqrt();
            (denom != 0.0).then(|| sxy / denom)
        }
    }
}

fn numeric_columns(frame: &DataFrame) -> Vec<&Series> {
    frame
        .columns()
        .map(|(_, series)| series)
        .filter(|series| series.dtype().is_numeric())
        .collect()
}

fn pairwise_frame(frame: &DataFrame, stat: Pairwise) -> Result<DataFrame, StatsError> {
    let numeric = numeric_columns(frame);
    debug!("{stat:?} matrix over {} numeric columns", numeric.len());
    let mut columns = Vec::with_capacity(numeric.len() + 1);
    let label = free_column_name("column", numeric.iter().map(|series| series.name()));
    columns.push(Series::from_strs(
        label,
        numeric.iter().map(|series| Some(series.name())),
    ));
    for y in &numeric {
        columns.push(Series::from_f64(
            y.name(),
            numeric.iter().map(|x| pairwise(x, y, stat)),
        ));
    }
    Ok(DataFrame::from_series(columns)?)
}

/// Pearson correlation matrix of the numeric columns, pairwise excluding nulls.
/// Row labels live in a leading `column` column (`column_` and so on when a
/// numeric column already has that name).
pub fn corr(frame: &DataFrame) -> Result<DataFrame, StatsError> {
    pairwise_frame(frame, Pairwise::Corr)
}

/// Sample covariance matrix of the numeric columns, pairwise excluding nulls.
pub fn cov(frame: &DataFrame) -> Result<DataFrame, StatsError> {
    pairwise_frame(frame, Pairwise::Cov)
}

pub const DESCRIBE_ROWS: [&str; 6] = ["count", "mean", "std", "min", "50%", "max"];

/// Matches `df.describe()` restricted to count/mean/std/min/50%/max, one
/// Float64 column per numeric column after a leading `stat` label column.
/// The label column takes trailing underscores when a numeric column is
/// already named `stat`.
pub fn describe(frame: &DataFrame) -> Result<DataFrame, StatsError> {
    let numeric = numeric_columns(frame);
    let mut columns = Vec::with_capacity(numeric.len() + 1);
    let label = free_column_name("stat", numeric.iter().map(|series| series.name()));
    columns.push(Series::from_strs(label, DESCRIBE_ROWS.map(Some)));
    for series in numeric {
        let values = series.numeric_values()?;
        let count = values.len() as f64;
        let mean = (!values.is_empty()).then(|| values.iter().sum::<f64>() / count);
        let std = (values.len() > 1).then(|| sample_variance(&values).sqrt());
        let has_nan = values.iter().any(|v| v.is_nan());
        let values = sorted(values);
        let (low, mid, high) = match (values.first(), values.last()) {
            (Some(_), Some(_)) if has_nan => (Some(f64::NAN), Some(f64::NAN), Some(f64::NAN)),
            (Some(first), Some(last)) => (
                Some(*first),
                Some(percentile_linear(&values, 0.5)),
                Some(*last),
            ),
            _ => (None, None, None),
        };
        columns.push(Series::from_f64(
            series.name(),
            [Some(count), mean, std, low, mid, high],
        ));
    }
    Ok(DataFrame::from_series(columns)?)
}

#[cfg(test)]
mod tests {
    use tf_columnar::Series;
    use tf_frame::DataFrame;
    use tf_types::{DType, ErrorKind, ErrorRecord, Scalar};

    use super::{
        ColumnStats, StatsError, column_stats, corr, count, cov, describe, diff, max, mean,
        median, min, quantile, rank, std, sum, var,
    };

    fn scores() -> DataFrame {
        DataFrame::from_series(vec![
            Series::from_i64("id", [Some(1), Some(2), None]),
            Series::from_f64("score", [Some(98.5), None, Some(73.25)]),
            Series::from_strs("name", [Some("a"), Some("b"), Some("c")]),
        ])
        .expect("frame")
    }

    #[test]
    fn column_stats_excludes_nulls() {
        let stats = column_stats(&scores(), "score").expect("stats");
        assert_eq!(
            stats,
            ColumnStats {
                count: 2,
                nulls: 1,
                sum: Some(171.75),
                mean: Some(85.875),
            }
        );
        assert_eq!(mean(&scores(), "score").expect("mean"), 85.875);
        assert_eq!(count(&scores(), "name").expect("count"), 3);
    }

    #[test]
    fn empty_columns_report_zero_count_but_accessors_fail() {
        let frame = DataFrame::from_series(vec![Series::from_f64("x", [None, None])])
            .expect("frame");
        let stats = column_stats(&frame, "x").expect("stats");
        assert_eq!(stats.count, 0);
        assert_eq!(stats.nulls, 2);
        assert_eq!(stats.sum, None);
        assert_eq!(stats.mean, None);
        assert!(matches!(sum(&frame, "x"), Err(StatsError::NoValues { .. })));
        assert!(matches!(mean(&frame, "x"), Err(StatsError::NoValues { .. })));
    }

    #[test]
    fn std_needs_two_values() {
        let deviation = std(&scores(), "id").expect("two ids");
        assert!((deviation - 0.5_f64.sqrt()).abs() < 1e-12);
        assert_eq!(var(&scores(), "id").expect("var"), 0.5);
        let single = DataFrame::from_series(vec![Series::from_i64("x", [Some(4), None])])
            .expect("frame");
        let err = std(&single, "x").expect_err("one value");
        assert!(matches!(err, StatsError::TooFewValues { needed: 2, found: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn strings_are_rejected_for_numeric_accessors() {
        let err = sum(&scores(), "name").expect_err("sum of strings");
        assert!(matches!(
            err,
            StatsError::UnsupportedDtype {
                dtype: DType::Utf8,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(sum(&scores(), "missing").is_err());
    }

    #[test]
    fn median_min_max_and_quantile() {
        let frame = DataFrame::from_series(vec![Series::from_f64(
            "x",
            [Some(4.0), None, Some(1.0), Some(3.0), Some(2.0)],
        )])
        .expect("frame");
        assert_eq!(median(&frame, "x").expect("median"), 2.5);
        assert_eq!(min(&frame, "x").expect("min"), 1.0);
        assert_eq!(max(&frame, "x").expect("max"), 4.0);
        assert_eq!(quantile(&frame, "x", 0.0).expect("q0"), 1.0);
        assert_eq!(quantile(&frame, "x", 0.25).expect("q25"), 1.75);
        assert!(matches!(quantile(&frame, "x", 1.5), Err(StatsError::Quantile(_))));

        let odd = DataFrame::from_series(vec![Series::from_i64("x", [Some(5), Some(1), Some(3)])])
            .expect("frame");
        assert_eq!(median(&odd, "x").expect("median"), 3.0);
    }

    #[test]
    fn nan_propagates() {
        let frame = DataFrame::from_series(vec![Series::from_f64(
            "x",
            [Some(1.0), Some(f64::NAN), Some(3.0)],
        )])
        .expect("frame");
        assert!(sum(&frame, "x").expect("sum").is_nan());
        assert!(min(&frame, "x").expect("min").is_nan());
        assert!(max(&frame, "x").expect("max").is_nan());
        assert!(median(&frame, "x").expect("median").is_nan());
        assert_eq!(count(&frame, "x").expect("count"), 3);
    }

    #[test]
    fn rank_averages_ties_and_keeps_nulls() {
        let frame = DataFrame::from_series(vec![
            Series::from_f64("x", [Some(3.0), Some(1.0), None, Some(3.0), Some(2.0)]),
            Series::from_strs("s", [Some("b"), Some("a"), Some("b"), None, Some("c")]),
        ])
        .expect("frame");
        let ranks = rank(&frame, "x").expect("rank");
        assert_eq!(ranks.dtype(), DType::Float64);
        assert_eq!(
            (0..5).map(|row| ranks.get_f64(row)).collect::<Vec<_>>(),
            vec![Some(3.5), Some(1.0), None, Some(3.5), Some(2.0)]
        );
        let text = rank(&frame, "s").expect("rank strings");
        assert_eq!(
            (0..5).map(|row| text.get_f64(row)).collect::<Vec<_>>(),
            vec![Some(2.5), Some(1.0), Some(2.5), None, Some(4.0)]
        );
    }

    #[test]
    fn diff_keeps_int_dtype_and_nulls_gaps() {
        let frame = DataFrame::from_series(vec![
            Series::from_i64("i", [Some(1), Some(4), None, Some(10), Some(i64::MIN)]),
            Series::from_f64("f", [Some(1.5), Some(1.0), Some(f64::NAN), None, Some(2.0)]),
        ])
        .expect("frame");
        let ints = diff(&frame, "i").expect("diff");
        assert_eq!(ints.dtype(), DType::Int64);
        assert_eq!(
            (0..5).map(|row| ints.get(row).expect("row")).collect::<Vec<_>>(),
            vec![Scalar::Null, Scalar::Int64(3), Scalar::Null, Scalar::Null, Scalar::Null]
        );
        let floats = diff(&frame, "f").expect("diff");
        assert_eq!(floats.get_f64(1), Some(-0.5));
        assert!(floats.get_f64(2).expect("nan").is_nan());
        assert_eq!(floats.get_f64(3), None);
        assert_eq!(floats.get_f64(4), None);
    }

    #[test]
    fn corr_and_cov_use_pairwise_complete_rows() {
        let frame = DataFrame::from_series(vec![
            Series::from_i64("a", [Some(1), Some(2), Some(3), Some(4)]),
            Series::from_f64("b", [Some(2.0), Some(4.0), None, Some(8.0)]),
            Series::from_f64("c", [Some(5.0), Some(5.0), Some(5.0), Some(5.0)]),
            Series::from_strs("label", [Some("w"), Some("x"), Some("y"), Some("z")]),
        ])
        .expect("frame");
        let matrix = corr(&frame).expect("corr");
        assert_eq!(matrix.column_names(), vec!["column", "a", "b", "c"]);
        assert_eq!(matrix.get_str(1, "column").expect("label"), Some("b"));
        let ab = matrix.get_f64(1, "a").expect("a-b").expect("defined");
        assert!((ab - 1.0).abs() < 1e-12);
        assert_eq!(matrix.get_f64(2, "c").expect("c-c"), None);

        let covariance = cov(&frame).expect("cov");
        assert_eq!(covariance.get_f64(0, "a").expect("var a"), Some(5.0 / 3.0));
        // a and b over rows 0, 1, 3: means 7/3 and 14/3.
        let ab = covariance.get_f64(0, "b").expect("cov").expect("defined");
        assert!((ab - 14.0 / 3.0).abs() < 1e-12);
        assert_eq!(covariance.get_f64(2, "c").expect("var c"), Some(0.0));
    }

    #[test]
    fn describe_summarizes_numeric_columns() {
        let out = describe(&scores()).expect("describe");
        assert_eq!(out.column_names(), vec!["stat", "id", "score"]);
        assert_eq!(out.get_str(4, "stat").expect("label"), Some("50%"));
        assert_eq!(out.get_f64(0, "score").expect("count"), Some(2.0));
        assert_eq!(out.get_f64(1, "score").expect("mean"), Some(85.875));
        assert_eq!(out.get_f64(3, "id").expect("min"), Some(1.0));
        assert_eq!(out.get_f64(4, "id").expect("median"), Some(1.5));
        assert_eq!(out.get_f64(5, "score").expect("max"), Some(98.5));

        let single = DataFrame::from_series(vec![Series::from_f64("x", [Some(7.0), None])])
            .expect("frame");
        let out = describe(&single).expect("describe");
        assert_eq!(out.get_f64(2, "x").expect("std"), None);
        assert_eq!(out.get_f64(4, "x").expect("median"), Some(7.0));
    }

    #[test]
    fn label_columns_step_aside_for_same_named_data() {
        let frame = DataFrame::from_series(vec![
            Series::from_f64("column", [Some(1.0), Some(2.0), Some(3.0)]),
            Series::from_f64("stat", [Some(2.0), Some(4.0), Some(7.0)]),
        ])
        .expect("frame");

        let matrix = corr(&frame).expect("corr");
        assert_eq!(matrix.column_names(), vec!["column_", "column", "stat"]);
        assert_eq!(matrix.get_str(1, "column_").expect("label"), Some("stat"));
        let self_corr = matrix.get_f64(0, "column").expect("cell").expect("defined");
        assert!((self_corr - 1.0).abs() < 1e-12);
        assert_eq!(cov(&frame).expect("cov").num_columns(), 3);

        let summary = describe(&frame).expect("describe");
        assert_eq!(summary.column_names(), vec!["stat_", "column", "stat"]);
        assert_eq!(summary.get_str(5, "stat_").expect("label"), Some("max"));
        assert_eq!(summary.get_f64(0, "stat").expect("count"), Some(3.0));
        assert_eq!(summary.get_f64(5, "stat").expect("max"), Some(7.0));
    }

    #[test]
    fn column_stats_serialize() {
        let stats = column_stats(&scores(), "id").expect("stats");
        let json = serde_json::to_string(&stats).expect("json");
        assert_eq!(json, r#"{"count":2,"nulls":1,"sum":3.0,"mean":1.5}"#);
    }
}
