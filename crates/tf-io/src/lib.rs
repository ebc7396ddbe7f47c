#![forbid(unsafe_code)]

use std::fs::File;
use std::io;
use std::path::Path;

use csv::{QuoteStyle, ReaderBuilder, StringRecord, WriterBuilder};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tf_columnar::Series;
use tf_frame::{DataFrame, FrameError};
use tf_types::{
    DType, ErrorKind, ErrorRecord, NullTokens, Scalar, TypeError, format_f64, format_scalar,
    infer_dtype, parse_field,
};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("row {row}: expected {expected} fields, found {found}")]
    RowLength {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("row {row}, column '{column}': {source}")]
    Field {
        row: usize,
        col: usize,
        column: String,
        #[source]
        source: TypeError,
    },
    #[error("{declared} dtypes declared for {columns} columns")]
    DtypeCount { declared: usize, columns: usize },
    #[error("json record {record}: {message}")]
    JsonShape { record: usize, message: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl ErrorRecord for IoError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::RowLength { .. }
            | Self::Field { .. }
            | Self::JsonShape { .. }
            | Self::Utf8(_) => ErrorKind::Parse,
            Self::Json(err) if err.is_io() => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Parse,
            Self::Csv(err) if err.is_io_error() => ErrorKind::Io,
            Self::Csv(_) => ErrorKind::Parse,
            Self::Io(_) => ErrorKind::Io,
            Self::DtypeCount { .. } => ErrorKind::InvalidArgument,
            Self::Frame(err) => err.kind(),
        }
    }

    fn row(&self) -> Option<usize> {
        match self {
            Self::RowLength { row, .. } | Self::Field { row, .. } => Some(*row),
            Self::JsonShape { record, .. } => Some(*record),
            Self::Frame(err) => err.row(),
            _ => None,
        }
    }

    fn col(&self) -> Option<usize> {
        match self {
            Self::Field { col, .. } => Some(*col),
            Self::Frame(err) => err.col(),
            _ => None,
        }
    }
}

/// Reader options. `dtypes: None` infers a dtype per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub has_header: bool,
    pub dtypes: Option<Vec<DType>>,
    pub na_values: Option<NullTokens>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            dtypes: None,
            na_values: None,
        }
    }
}

impl CsvOptions {
    #[must_use]
    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dtypes(mut self, dtypes: Vec<DType>) -> Self {
        self.dtypes = Some(dtypes);
        self
    }

    #[must_use]
    pub fn with_na_values(mut self, na_values: NullTokens) -> Self {
        self.na_values = Some(na_values);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvWriteOptions {
    pub delimiter: u8,
    pub write_header: bool,
}

impl Default for CsvWriteOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            write_header: true,
        }
    }
}

/// Declared dtypes by column name; undeclared columns are inferred.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonOptions {
    pub dtypes: Vec<(String, DType)>,
    pub na_values: Option<NullTokens>,
}

impl JsonOptions {
    fn declared(&self, column: &str) -> Option<DType> {
        self.dtypes
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, dtype)| *dtype)
    }
}

// ── CSV / TSV ──────────────────────────────────────────────────────────

pub fn read_csv_str(input: &str, options: &CsvOptions) -> Result<DataFrame, IoError> {
    read_csv_reader(input.as_bytes(), options)
}

/// Same as [`read_csv_str`] with the delimiter forced to a tab.
pub fn read_tsv_str(input: &str, options: &CsvOptions) -> Result<DataFrame, IoError> {
    let options = CsvOptions {
        delimiter: b'\t',
        ..options.clone()
    };
    read_csv_reader(input.as_bytes(), &options)
}

pub fn read_csv_path(path: impl AsRef<Path>, options: &CsvOptions) -> Result<DataFrame, IoError> {
    read_csv_reader(File::open(path)?, options)
}

/// Read a whole CSV stream. Any malformed row aborts the read; no partial
/// frame is returned.
pub fn read_csv_reader<R: io::Read>(
    reader: R,
    options: &CsvOptions,
) -> Result<DataFrame, IoError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(options.has_header)
        .flexible(false)
        .from_reader(reader);

    let header = if options.has_header {
        Some(reader.headers()?.clone())
    } else {
        None
    };
    let header_rows = usize::from(options.has_header);

    let mut records: Vec<StringRecord> = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|err| match err.kind() {
            csv::ErrorKind::UnequalLengths {
                pos,
                expected_len,
                len,
            } => IoError::RowLength {
                row: pos
                    .as_ref()
                    .map_or(records.len(), |p| p.record() as usize)
                    .saturating_sub(header_rows),
                expected: *expected_len as usize,
                found: *len as usize,
            },
            _ => IoError::Csv(err),
        })?;
        records.push(record);
    }

    let names: Vec<String> = match &header {
        Some(header) => header.iter().map(str::to_owned).collect(),
        None => {
            let width = records.first().map_or(0, StringRecord::len);
            (0..width).map(|idx| format!("col{idx}")).collect()
        }
    };
    if let Some(first) = records.first()
        && first.len() != names.len()
    {
        return Err(IoError::RowLength {
            row: 0,
            expected: names.len(),
            found: first.len(),
        });
    }

    let na = options.na_values.as_ref();
    let dtypes = match &options.dtypes {
        Some(dtypes) if dtypes.len() != names.len() => {
            return Err(IoError::DtypeCount {
                declared: dtypes.len(),
                columns: names.len(),
            });
        }
        Some(dtypes) => dtypes.clone(),
        None => (0..names.len())
            .map(|col| infer_dtype(records.iter().map(|r| r.get(col).unwrap_or("")), na))
            .collect(),
    };

    let name_refs = names.iter().map(String::as_str).collect::<Vec<_>>();
    let mut frame = DataFrame::new(&name_refs, &dtypes, records.len())?;
    for record in &records {
        let fields = record.iter().collect::<Vec<_>>();
        let appended = match na {
            Some(tokens) => frame.append_row_with_na(&fields, tokens),
            None => frame.append_row(&fields),
        };
        appended.map_err(|err| match err {
            FrameError::Field { row, col, source } => IoError::Field {
                row,
                col,
                column: names[col].clone(),
                source,
            },
            other => other.into(),
        })?;
    }
    debug!(
        "read_csv: {} rows x {} columns",
        frame.num_rows(),
        frame.num_columns()
    );
    Ok(frame)
}

pub fn write_csv_string(frame: &DataFrame) -> Result<String, IoError> {
    let mut out = Vec::new();
    write_csv_writer(frame, &mut out, &CsvWriteOptions::default())?;
    Ok(String::from_utf8(out)?)
}

pub fn write_tsv_string(frame: &DataFrame) -> Result<String, IoError> {
    let mut out = Vec::new();
    let options = CsvWriteOptions {
        delimiter: b'\t',
        ..CsvWriteOptions::default()
    };
    write_csv_writer(frame, &mut out, &options)?;
    Ok(String::from_utf8(out)?)
}

pub fn write_csv_path(
    frame: &DataFrame,
    path: impl AsRef<Path>,
    options: &CsvWriteOptions,
) -> Result<(), IoError> {
    write_csv_writer(frame, File::create(path)?, options)
}

/// Write columns in frame order. Fields holding the delimiter, a quote or a
/// line break are quoted; nulls are written as empty fields. Row labels are
/// not written.
pub fn write_csv_writer<W: io::Write>(
    frame: &DataFrame,
    writer: W,
    options: &CsvWriteOptions,
) -> Result<(), IoError> {
    let mut writer = WriterBuilder::new()
        .delimiter(options.delimiter)
        .quote_style(QuoteStyle::Necessary)
        .from_writer(writer);
    if options.write_header {
        writer.write_record(frame.column_names())?;
    }
    for (_, row) in frame.rows() {
        writer.write_record(row.values().iter().map(format_scalar))?;
    }
    writer.flush()?;
    Ok(())
}

// ── JSON / NDJSON ──────────────────────────────────────────────────────

/// Read an array of objects. Columns are the union of keys in first-seen order.
pub fn read_json_str(input: &str, options: &JsonOptions) -> Result<DataFrame, IoError> {
    let document: Value = serde_json::from_str(input)?;
    let Value::Array(items) = document else {
        return Err(IoError::JsonShape {
            record: 0,
            message: "expected an array of objects".to_owned(),
        });
    };
    let records = items
        .into_iter()
        .enumerate()
        .map(|(record, item)| into_object(record, item))
        .collect::<Result<Vec<_>, _>>()?;
    frame_from_objects(&records, options)
}

/// Read one object per line; blank lines are skipped.
pub fn read_ndjson_str(input: &str, options: &JsonOptions) -> Result<DataFrame, IoError> {
    let records = input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(record, line)| into_object(record, serde_json::from_str(line)?))
        .collect::<Result<Vec<_>, _>>()?;
    frame_from_objects(&records, options)
}

pub fn read_json_path(path: impl AsRef<Path>, options: &JsonOptions) -> Result<DataFrame, IoError> {
    read_json_str(&std::fs::read_to_string(path)?, options)
}

pub fn read_ndjson_path(
    path: impl AsRef<Path>,
    options: &JsonOptions,
) -> Result<DataFrame, IoError> {
    read_ndjson_str(&std::fs::read_to_string(path)?, options)
}

fn into_object(record: usize, value: Value) -> Result<Map<String, Value>, IoError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(IoError::JsonShape {
            record,
            message: format!("expected an object, found {other}"),
        }),
    }
}

fn is_non_finite_token(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "nan" | "inf" | "-inf" | "infinity" | "-infinity"
    )
}

/// Int64 when every value is an integral number, Float64 when every value is
/// a number or a non-finite token (`"nan"`, `"inf"`), else Utf8.
fn infer_json_dtype<'a, I>(values: I, na: Option<&NullTokens>) -> DType
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut current = DType::Int64;
    let mut saw_number = false;
    for value in values {
        match value {
            Value::Null => {}
            Value::String(text) if tf_types::is_null_field(text, na) => {}
            Value::Number(number) if number.is_i64() => saw_number = true,
            Value::Number(_) => {
                saw_number = true;
                current = DType::Float64;
            }
            Value::String(text) if is_non_finite_token(text) => current = DType::Float64,
            _ => return DType::Utf8,
        }
    }
    if current == DType::Float64 && !saw_number {
        return DType::Utf8;
    }
    current
}

fn json_to_scalar(
    value: &Value,
    dtype: DType,
    na: Option<&NullTokens>,
) -> Result<Scalar, TypeError> {
    match (value, dtype) {
        (Value::Null, _) => Ok(Scalar::Null),
        (Value::String(text), _) => parse_field(text, dtype, na),
        (Value::Number(number), DType::Int64) => match number.as_i64() {
            Some(v) => Ok(Scalar::Int64(v)),
            None => tf_types::cast_scalar(
                &Scalar::Float64(number.as_f64().unwrap_or(f64::NAN)),
                DType::Int64,
            ),
        },
        (Value::Number(number), DType::Float64) => {
            Ok(Scalar::Float64(number.as_f64().unwrap_or(f64::NAN)))
        }
        (other, DType::Utf8) => Ok(Scalar::Utf8(other.to_string())),
        (other, _) => Err(TypeError::NonNumericValue {
            value: other.to_string(),
        }),
    }
}

fn frame_from_objects(
    records: &[Map<String, Value>],
    options: &JsonOptions,
) -> Result<DataFrame, IoError> {
    let mut names: Vec<&str> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !names.contains(&key.as_str()) {
                names.push(key);
            }
        }
    }
    let na = options.na_values.as_ref();
    let dtypes = names
        .iter()
        .map(|name| {
            options.declared(name).unwrap_or_else(|| {
                infer_json_dtype(records.iter().filter_map(|record| record.get(*name)), na)
            })
        })
        .collect::<Vec<_>>();

    let mut frame = DataFrame::new(&names, &dtypes, records.len())?;
    for (row, record) in records.iter().enumerate() {
        let cells = names
            .iter()
            .zip(&dtypes)
            .enumerate()
            .map(|(col, (name, dtype))| {
                let value = record.get(*name).unwrap_or(&Value::Null);
                json_to_scalar(value, *dtype, na).map_err(|source| IoError::Field {
                    row,
                    col,
                    column: (*name).to_owned(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        frame.append_scalars(cells)?;
    }
    debug!(
        "read_json: {} records x {} columns",
        frame.num_rows(),
        frame.num_columns()
    );
    Ok(frame)
}

fn scalar_to_json(value: Scalar) -> Value {
    match value {
        Scalar::Null => Value::Null,
        Scalar::Int64(v) => Value::Number(v.into()),
        Scalar::Float64(v) => {
            Number::from_f64(v).map_or_else(|| Value::String(format_f64(v)), Value::Number)
        }
        Scalar::Utf8(v) => Value::String(v),
    }
}

fn frame_objects(frame: &DataFrame) -> impl Iterator<Item = Value> + '_ {
    let names = frame
        .column_names()
        .into_iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    frame.rows().map(move |(_, row)| {
        let object = names
            .iter()
            .cloned()
            .zip(row.values().into_iter().map(scalar_to_json))
            .collect::<Map<_, _>>();
        Value::Object(object)
    })
}

/// Array of objects in column order.
pub fn write_json_string(frame: &DataFrame) -> Result<String, IoError> {
    Ok(serde_json::to_string(&Value::Array(
        frame_objects(frame).collect(),
    ))?)
}

/// One object per line, each line terminated by `\n`.
pub fn write_ndjson_string(frame: &DataFrame) -> Result<String, IoError> {
    let mut out = String::new();
    for object in frame_objects(frame) {
        out.push_str(&serde_json::to_string(&object)?);
        out.push('\n');
    }
    Ok(out)
}

// ── Bridge for external codecs ─────────────────────────────────────────

/// Build a frame from column definitions and typed rows.
pub fn frame_from_rows(
    names: &[&str],
    dtypes: &[DType],
    rows: Vec<Vec<Scalar>>,
) -> Result<DataFrame, IoError> {
    let mut frame = DataFrame::new(names, dtypes, rows.len())?;
    for row in rows {
        frame.append_scalars(row)?;
    }
    Ok(frame)
}

/// Columns of `frame` as `(name, dtype, cells)` for external codecs.
#[must_use]
pub fn frame_columns(frame: &DataFrame) -> Vec<(String, DType, Vec<Scalar>)> {
    frame
        .columns()
        .map(|(_, series): (usize, &Series)| {
            (
                series.name().to_owned(),
                series.dtype(),
                series.iter().collect(),
            )
        })
        .collect()
}
