#![forbid(unsafe_code)]

//! Fixture-driven conformance harness.
//!
//! A fixture is one JSON file describing an operation, its input frames or
//! text, and either the expected output frame or a substring of the expected
//! error message. `run_suite` loads every fixture under the fixture root and
//! reports one [`CaseResult`] per file.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tf_columnar::{ColumnError, Series};
use tf_frame::{DataFrame, FrameError, SortKey};
use tf_groupby::{AggOp, AggSpec, GroupByError, GroupByOptions, groupby_agg_multi, pivot_table};
use tf_io::{CsvOptions, IoError, JsonOptions, read_csv_str, read_json_str, read_ndjson_str};
use tf_join::{JoinError, JoinOptions, join};
use tf_query::{QueryError, query};
use tf_stats::{StatsError, describe};
use tf_types::{DType, Scalar, TypeError, format_f64, format_scalar, parse_field};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("case {case_id}: missing `{field}`")]
    MissingInput {
        case_id: String,
        field: &'static str,
    },
    #[error("fixture cell {value} does not fit {dtype}")]
    Cell { value: String, dtype: DType },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Read(#[from] IoError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    GroupBy(#[from] GroupByError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Stats(#[from] StatsError),
}

// ── Fixture model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureOperation {
    ReadCsv,
    ReadJson,
    ReadNdjson,
    Join,
    GroupbyAgg,
    PivotTable,
    Query,
    SortValues,
    Describe,
}

/// A column as written in a fixture. Cells are JSON `null`, numbers, or
/// strings; numeric columns also accept text such as `"nan"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureColumn {
    pub name: String,
    pub dtype: DType,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureFrame {
    pub columns: Vec<FixtureColumn>,
}

impl FixtureFrame {
    pub fn to_frame(&self) -> Result<DataFrame, HarnessError> {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let cells = column
                    .values
                    .iter()
                    .map(|value| json_cell(value, column.dtype))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Series::from_scalars(&column.name, column.dtype, cells)?)
            })
            .collect::<Result<Vec<_>, HarnessError>>()?;
        Ok(DataFrame::from_series(columns)?)
    }

    #[must_use]
    pub fn from_frame(frame: &DataFrame) -> Self {
        let columns = frame
            .columns()
            .map(|(_, series)| FixtureColumn {
                name: series.name().to_owned(),
                dtype: series.dtype(),
                values: series.iter().map(|cell| cell_json(&cell)).collect(),
            })
            .collect();
        Self { columns }
    }
}

fn json_cell(value: &Value, dtype: DType) -> Result<Scalar, HarnessError> {
    let mismatch = || HarnessError::Cell {
        value: value.to_string(),
        dtype,
    };
    match (value, dtype) {
        (Value::Null, _) => Ok(Scalar::Null),
        (Value::Number(number), DType::Int64) => {
            number.as_i64().map(Scalar::Int64).ok_or_else(mismatch)
        }
        (Value::Number(number), DType::Float64) => {
            number.as_f64().map(Scalar::Float64).ok_or_else(mismatch)
        }
        (Value::String(text), DType::Utf8) => Ok(Scalar::Utf8(text.clone())),
        (Value::String(text), _) => Ok(parse_field(text, dtype, None)?),
        _ => Err(mismatch()),
    }
}

fn cell_json(cell: &Scalar) -> Value {
    match cell {
        Scalar::Null => Value::Null,
        Scalar::Int64(value) => Value::from(*value),
        Scalar::Float64(value) => serde_json::Number::from_f64(*value)
            .map_or_else(|| Value::String(format_f64(*value)), Value::Number),
        Scalar::Utf8(text) => Value::String(text.clone()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PivotSpec {
    pub index: String,
    pub columns: String,
    pub values: String,
    pub op: AggOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureCase {
    pub case_id: String,
    pub operation: FixtureOperation,
    #[serde(default)]
    pub frame: Option<FixtureFrame>,
    #[serde(default)]
    pub frame_right: Option<FixtureFrame>,
    #[serde(default)]
    pub input_text: Option<String>,
    #[serde(default)]
    pub csv_options: Option<CsvOptions>,
    #[serde(default)]
    pub json_options: Option<JsonOptions>,
    #[serde(default)]
    pub join: Option<JoinOptions>,
    #[serde(default)]
    pub groupby_keys: Option<Vec<String>>,
    #[serde(default)]
    pub agg_specs: Option<Vec<AggSpec>>,
    #[serde(default)]
    pub groupby_options: Option<GroupByOptions>,
    #[serde(default)]
    pub pivot: Option<PivotSpec>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sort_keys: Option<Vec<SortKey>>,
    #[serde(default)]
    pub expected_frame: Option<FixtureFrame>,
    #[serde(default)]
    pub expected_error_contains: Option<String>,
}

impl FixtureCase {
    fn require<'a, T>(&self, field: &'static str, value: Option<&'a T>) -> Result<&'a T, HarnessError> {
        value.ok_or_else(|| HarnessError::MissingInput {
            case_id: self.case_id.clone(),
            field,
        })
    }

    fn left_frame(&self) -> Result<DataFrame, HarnessError> {
        self.require("frame", self.frame.as_ref())?.to_frame()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub operation: FixtureOperation,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub fixture_count: usize,
    pub results: Vec<CaseResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.results
            .iter()
            .all(|result| result.status == CaseStatus::Pass)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.results
            .iter()
            .filter(|result| result.status == CaseStatus::Fail)
    }
}

// ── Execution ──────────────────────────────────────────────────────────

fn execute(case: &FixtureCase) -> Result<DataFrame, HarnessError> {
    match case.operation {
        FixtureOperation::ReadCsv => {
            let text = case.require("input_text", case.input_text.as_ref())?;
            let options = case.csv_options.clone().unwrap_or_default();
            Ok(read_csv_str(text, &options)?)
        }
        FixtureOperation::ReadJson | FixtureOperation::ReadNdjson => {
            let text = case.require("input_text", case.input_text.as_ref())?;
            let options = case.json_options.clone().unwrap_or_default();
            if case.operation == FixtureOperation::ReadJson {
                Ok(read_json_str(text, &options)?)
            } else {
                Ok(read_ndjson_str(text, &options)?)
            }
        }
        FixtureOperation::Join => {
            let right = case
                .require("frame_right", case.frame_right.as_ref())?
                .to_frame()?;
            let options = case.require("join", case.join.as_ref())?;
            Ok(join(&case.left_frame()?, &right, options)?)
        }
        FixtureOperation::GroupbyAgg => {
            let keys = case.require("groupby_keys", case.groupby_keys.as_ref())?;
            let keys = keys.iter().map(String::as_str).collect::<Vec<_>>();
            let specs = case.require("agg_specs", case.agg_specs.as_ref())?;
            let options = case.groupby_options.unwrap_or_default();
            Ok(groupby_agg_multi(&case.left_frame()?, &keys, specs, options)?)
        }
        FixtureOperation::PivotTable => {
            let spec = case.require("pivot", case.pivot.as_ref())?;
            Ok(pivot_table(
                &case.left_frame()?,
                &spec.index,
                &spec.columns,
                &spec.values,
                spec.op,
            )?)
        }
        FixtureOperation::Query => {
            let text = case.require("query", case.query.as_ref())?;
            Ok(query(&case.left_frame()?, text)?)
        }
        FixtureOperation::SortValues => {
            let keys = case.require("sort_keys", case.sort_keys.as_ref())?;
            Ok(case.left_frame()?.sort_values(keys)?)
        }
        FixtureOperation::Describe => Ok(describe(&case.left_frame()?)?),
    }
}

fn compare(case: &FixtureCase, outcome: Result<DataFrame, HarnessError>) -> Result<(), String> {
    if let Some(needle) = &case.expected_error_contains {
        return match outcome {
            Err(err) if err.to_string().contains(needle.as_str()) => Ok(()),
            Err(err) => Err(format!("error `{err}` does not contain `{needle}`")),
            Ok(frame) => Err(format!("expected an error containing `{needle}`, got\n{frame}")),
        };
    }
    let Some(expected) = &case.expected_frame else {
        return Err("case declares neither expected_frame nor expected_error_contains".to_owned());
    };
    let expected = expected
        .to_frame()
        .map_err(|err| format!("expected_frame is invalid: {err}"))?;
    match outcome {
        Ok(actual) if actual.semantic_eq(&expected) => Ok(()),
        Ok(actual) => Err(format!("expected\n{expected}\nactual\n{actual}")),
        Err(err) => Err(format!("unexpected error: {err}")),
    }
}

#[must_use]
pub fn run_case(case: &FixtureCase) -> CaseResult {
    let mismatch = compare(case, execute(case)).err();
    if let Some(detail) = &mismatch {
        warn!("case {} failed: {detail}", case.case_id);
    }
    CaseResult {
        case_id: case.case_id.clone(),
        operation: case.operation,
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
    }
}

/// Run a single fixture held in memory.
pub fn run_fixture_str(body: &str) -> Result<CaseResult, HarnessError> {
    let case: FixtureCase = serde_json::from_str(body)?;
    Ok(run_case(&case))
}

pub fn run_suite(config: &HarnessConfig) -> Result<SuiteReport, HarnessError> {
    let mut cases = list_fixture_files(&config.fixture_root)?
        .iter()
        .map(|path| load_fixture(path))
        .collect::<Result<Vec<_>, _>>()?;
    cases.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    debug!(
        "running {} fixtures from {}",
        cases.len(),
        config.fixture_root.display()
    );
    Ok(SuiteReport {
        fixture_count: cases.len(),
        results: cases.iter().map(run_case).collect(),
    })
}

fn load_fixture(path: &Path) -> Result<FixtureCase, HarnessError> {
    let body = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&body)?)
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

// ── Shared test inputs ─────────────────────────────────────────────────

/// Three rows, one missing id and one missing score.
pub const SCORES_CSV: &str = "id,score\n1,98.5\n2,\n,73.25\n";

/// Left and right frames keyed on `id` with duplicates, a null key on each
/// side, and one unmatched key on each side.
pub fn worked_example() -> Result<(DataFrame, DataFrame), FrameError> {
    let left = DataFrame::from_series(vec![
        Series::from_i64("id", [Some(1), Some(2), Some(2), Some(3), None, Some(4)]),
        Series::from_strs("l", ["a", "b", "c", "d", "e", "f"].map(Some)),
    ])?;
    let right = DataFrame::from_series(vec![
        Series::from_i64("id", [Some(1), Some(2), Some(2), Some(5), None, Some(3)]),
        Series::from_i64("r", [10, 20, 21, 50, 60, 30].map(Some)),
    ])?;
    Ok((left, right))
}

/// Rows rendered as text and sorted, for order-insensitive comparison.
#[must_use]
pub fn row_multiset(frame: &DataFrame) -> Vec<String> {
    let columns = frame.columns().map(|(_, series)| series).collect::<Vec<_>>();
    let mut rows = (0..frame.num_rows())
        .map(|row| {
            columns
                .iter()
                .map(|series| match series.get(row) {
                    Some(Scalar::Null) | None => "<null>".to_owned(),
                    Some(cell) => format_scalar(&cell),
                })
                .collect::<Vec<_>>()
                .join("\u{1f}")
        })
        .collect::<Vec<_>>();
    rows.sort();
    rows
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tf_types::{DType, Scalar};

    use super::{
        CaseStatus, FixtureFrame, HarnessConfig, HarnessError, SCORES_CSV, row_multiset,
        run_fixture_str, worked_example,
    };

    #[test]
    fn fixture_frame_accepts_nan_text_in_float_columns() {
        let fixture: FixtureFrame = serde_json::from_value(json!({
            "columns": [
                {"name": "x", "dtype": "float64", "values": [1.5, null, "nan", 2]}
            ]
        }))
        .expect("fixture");
        let frame = fixture.to_frame().expect("frame");
        let x = frame.column("x").expect("x");
        assert_eq!(x.get(0), Some(Scalar::Float64(1.5)));
        assert!(x.is_null(1));
        assert!(x.get(2).is_some_and(|cell| cell.is_nan()));
        assert_eq!(x.get(3), Some(Scalar::Float64(2.0)));
    }

    #[test]
    fn fixture_frame_rejects_fractional_int_cells() {
        let fixture: FixtureFrame = serde_json::from_value(json!({
            "columns": [{"name": "n", "dtype": "int64", "values": [1.5]}]
        }))
        .expect("fixture");
        let err = fixture.to_frame().expect_err("1.5 is not int64");
        assert!(matches!(err, HarnessError::Cell { dtype: DType::Int64, .. }));
    }

    #[test]
    fn from_frame_then_to_frame_preserves_cells() {
        let (left, _) = worked_example().expect("worked example");
        let rebuilt = FixtureFrame::from_frame(&left).to_frame().expect("rebuild");
        assert!(rebuilt.semantic_eq(&left));
    }

    #[test]
    fn in_memory_fixture_passes() {
        let body = json!({
            "case_id": "inline_read_csv",
            "operation": "read_csv",
            "input_text": SCORES_CSV,
            "expected_frame": {"columns": [
                {"name": "id", "dtype": "int64", "values": [1, 2, null]},
                {"name": "score", "dtype": "float64", "values": [98.5, null, 73.25]}
            ]}
        });
        let result = run_fixture_str(&body.to_string()).expect("parse");
        assert_eq!(result.status, CaseStatus::Pass, "{:?}", result.mismatch);
    }

    #[test]
    fn missing_input_is_reported_as_failure() {
        let body = json!({
            "case_id": "no_query",
            "operation": "query",
            "frame": {"columns": [{"name": "x", "dtype": "int64", "values": [1]}]},
            "expected_frame": {"columns": [{"name": "x", "dtype": "int64", "values": [1]}]}
        });
        let result = run_fixture_str(&body.to_string()).expect("parse");
        assert_eq!(result.status, CaseStatus::Fail);
        assert!(result.mismatch.expect("detail").contains("missing `query`"));
    }

    #[test]
    fn case_without_expectation_fails() {
        let body = json!({
            "case_id": "bare",
            "operation": "read_csv",
            "input_text": "a\n1\n"
        });
        let result = run_fixture_str(&body.to_string()).expect("parse");
        assert_eq!(result.status, CaseStatus::Fail);
    }

    #[test]
    fn row_multiset_ignores_row_order() {
        let (left, _) = worked_example().expect("worked example");
        let reversed = left.take_rows(&[5, 4, 3, 2, 1, 0]).expect("reverse");
        assert_eq!(row_multiset(&left), row_multiset(&reversed));
    }

    #[test]
    fn default_fixture_root_lives_in_the_crate() {
        let config = HarnessConfig::default();
        assert!(config.fixture_root.ends_with("fixtures"));
    }
}
