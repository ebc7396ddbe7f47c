#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Int64,
    Float64,
    #[serde(rename = "string", alias = "utf8")]
    Utf8,
}

impl DType {
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int64 | Self::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Utf8 => "string",
        };
        f.write_str(name)
    }
}

impl FromStr for DType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int64" | "int" | "i64" => Ok(Self::Int64),
            "float64" | "float" | "f64" | "double" => Ok(Self::Float64),
            "string" | "str" | "utf8" => Ok(Self::Utf8),
            _ => Err(TypeError::UnknownDtype {
                name: s.to_owned(),
            }),
        }
    }
}

/// A single cell. `Null` is absence of a value; `Float64(NaN)` is a present value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null,
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Scalar {
    /// Dtype of a present value; `None` for `Null`, which fits every dtype.
    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Null => None,
            Self::Int64(_) => Some(DType::Int64),
            Self::Float64(_) => Some(DType::Float64),
            Self::Utf8(_) => Some(DType::Utf8),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Float64(v) if v.is_nan())
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null => Err(TypeError::ValueIsNull),
            Self::Utf8(v) => Err(TypeError::NonNumericValue { value: v.clone() }),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Cell equality for frame comparisons: NaN matches NaN and null matches null.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float64(a), Self::Float64(b)) => (a.is_nan() && b.is_nan()) || a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => f.write_str(&format_f64(*v)),
            Self::Utf8(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

// ── Error record ───────────────────────────────────────────────────────

/// Failure category shared by every fallible entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OutOfMemory,
    Io,
    Parse,
    InvalidArgument,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OutOfMemory => "out-of-memory",
            Self::Io => "io",
            Self::Parse => "parse",
            Self::InvalidArgument => "invalid-argument",
        };
        f.write_str(name)
    }
}

/// `{kind, message, row, col}` view over a crate error.
///
/// `row`/`col` point at the first offending cell when one exists.
pub trait ErrorRecord: std::error::Error {
    fn kind(&self) -> ErrorKind;

    fn row(&self) -> Option<usize> {
        None
    }

    fn col(&self) -> Option<usize> {
        None
    }

    fn message(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("cannot parse {text:?} as int64")]
    InvalidInt64 { text: String },
    #[error("cannot parse {text:?} as float64")]
    InvalidFloat64 { text: String },
    #[error("cannot parse {text:?} as a datetime")]
    InvalidDatetime { text: String },
    #[error("unknown dtype name {name:?}")]
    UnknownDtype { name: String },
    #[error("dtype coercion from {left} to {right} has no compatible common type")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("cannot cast {from} to {to}")]
    InvalidCast { from: DType, to: DType },
    #[error("cannot cast float {value} to int64 without loss")]
    LossyFloatToInt { value: f64 },
    #[error("value {value:?} is not numeric")]
    NonNumericValue { value: String },
    #[error("value is null")]
    ValueIsNull,
}

impl ErrorRecord for TypeError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInt64 { .. } | Self::InvalidFloat64 { .. } | Self::InvalidDatetime { .. } => {
                ErrorKind::Parse
            }
            _ => ErrorKind::InvalidArgument,
        }
    }
}

pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Float64, Int64};

    match (left, right) {
        (a, b) if a == b => Ok(a),
        (Int64, Float64) | (Float64, Int64) => Ok(Float64),
        _ => Err(TypeError::IncompatibleDtypes { left, right }),
    }
}

// ── Null detection ─────────────────────────────────────────────────────

/// Caller-supplied NA sentinel tokens, matched against the trimmed field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NullTokens {
    tokens: BTreeSet<String>,
}

impl NullTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// The usual spreadsheet/pandas sentinels. `nan` is deliberately absent: it is a float.
    #[must_use]
    pub fn pandas_default() -> Self {
        Self::new([
            "NA", "N/A", "n/a", "#N/A", "#NA", "#N/A N/A", "NULL", "null", "None", "<NA>",
        ])
    }

    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.tokens.contains(field)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn insert(&mut self, token: impl Into<String>) {
        self.tokens.insert(token.into());
    }
}

#[must_use]
pub fn is_null_field(text: &str, na: Option<&NullTokens>) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || na.is_some_and(|tokens| tokens.contains(trimmed))
}

// ── Value parser ───────────────────────────────────────────────────────

/// Strict base-10 int64: optional leading `-`, no trailing garbage.
pub fn parse_int64(text: &str) -> Result<i64, TypeError> {
    let trimmed = text.trim();
    if trimmed.starts_with('+') {
        return Err(TypeError::InvalidInt64 {
            text: text.to_owned(),
        });
    }
    trimmed.parse::<i64>().map_err(|_| TypeError::InvalidInt64 {
        text: text.to_owned(),
    })
}

/// Decimal or exponential float; `nan`/`inf` in any case map to the IEEE values.
pub fn parse_float64(text: &str) -> Result<f64, TypeError> {
    let trimmed = text.trim();
    trimmed.parse::<f64>().map_err(|_| TypeError::InvalidFloat64 {
        text: text.to_owned(),
    })
}

/// Convert one raw field into a typed cell, or `Scalar::Null`.
pub fn parse_field(text: &str, dtype: DType, na: Option<&NullTokens>) -> Result<Scalar, TypeError> {
    if is_null_field(text, na) {
        return Ok(Scalar::Null);
    }
    match dtype {
        DType::Int64 => parse_int64(text).map(Scalar::Int64),
        DType::Float64 => parse_float64(text).map(Scalar::Float64),
        DType::Utf8 => Ok(Scalar::Utf8(text.to_owned())),
    }
}

/// Narrowest dtype that accepts every non-null field.
pub fn infer_dtype<'a, I>(fields: I, na: Option<&NullTokens>) -> DType
where
    I: IntoIterator<Item = &'a str>,
{
    let mut current = DType::Int64;
    for field in fields {
        if is_null_field(field, na) {
            continue;
        }
        if current == DType::Int64 && parse_int64(field).is_ok() {
            continue;
        }
        if parse_float64(field).is_ok() {
            current = DType::Float64;
            continue;
        }
        return DType::Utf8;
    }
    current
}

/// Parse an ISO-8601 date or date-time into UTC epoch seconds.
pub fn parse_datetime(text: &str) -> Result<i64, TypeError> {
    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];

    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.timestamp());
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp())
        .ok_or_else(|| TypeError::InvalidDatetime {
            text: text.to_owned(),
        })
}

// ── Formatting ─────────────────────────────────────────────────────────

/// Shortest round-trip rendering; `nan`, `inf` and `-inf` for non-finite values.
#[must_use]
pub fn format_f64(value: f64) -> String {
    if value.is_nan() {
        "nan".to_owned()
    } else if value == f64::INFINITY {
        "inf".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_owned()
    } else {
        format!("{value:?}")
    }
}

/// Text form used by writers and `astype(Utf8)`; nulls become the empty string.
#[must_use]
pub fn format_scalar(value: &Scalar) -> String {
    match value {
        Scalar::Null => String::new(),
        Scalar::Int64(v) => v.to_string(),
        Scalar::Float64(v) => format_f64(*v),
        Scalar::Utf8(v) => v.clone(),
    }
}

/// Cast a cell to `target`. Nulls stay null.
pub fn cast_scalar(value: &Scalar, target: DType) -> Result<Scalar, TypeError> {
    match (value, target) {
        (Scalar::Null, _) => Ok(Scalar::Null),
        (Scalar::Int64(v), DType::Int64) => Ok(Scalar::Int64(*v)),
        (Scalar::Int64(v), DType::Float64) => Ok(Scalar::Float64(*v as f64)),
        (Scalar::Float64(v), DType::Float64) => Ok(Scalar::Float64(*v)),
        (Scalar::Float64(v), DType::Int64) => float_to_int(*v).map(Scalar::Int64),
        (Scalar::Utf8(v), DType::Utf8) => Ok(Scalar::Utf8(v.clone())),
        (Scalar::Utf8(v), numeric) => parse_field(v, numeric, None),
        (other, DType::Utf8) => Ok(Scalar::Utf8(format_scalar(other))),
    }
}

fn float_to_int(value: f64) -> Result<i64, TypeError> {
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    if !value.is_finite()
        || value != value.trunc()
        || value < i64::MIN as f64
        || value >= i64::MAX as f64
    {
        return Err(TypeError::LossyFloatToInt { value });
    }
    Ok(value as i64)
}

#[cfg(test)]
mod tests {
    use super::{
        DType, ErrorKind, ErrorRecord, NullTokens, Scalar, TypeError, cast_scalar, common_dtype,
        format_f64, format_scalar, infer_dtype, is_null_field, parse_datetime, parse_field,
    };

    #[test]
    fn empty_and_whitespace_fields_are_null_for_every_dtype() {
        for dtype in [DType::Int64, DType::Float64, DType::Utf8] {
            assert_eq!(parse_field("", dtype, None).expect("empty"), Scalar::Null);
            assert_eq!(parse_field("  \t", dtype, None).expect("blank"), Scalar::Null);
        }
    }

    #[test]
    fn na_tokens_map_to_null_independent_of_dtype() {
        let na = NullTokens::new(["NA", "missing"]);
        assert_eq!(
            parse_field("NA", DType::Int64, Some(&na)).expect("int na"),
            Scalar::Null
        );
        assert_eq!(
            parse_field(" missing ", DType::Utf8, Some(&na)).expect("str na"),
            Scalar::Null
        );
        assert_eq!(
            parse_field("NA", DType::Utf8, None).expect("no tokens"),
            Scalar::Utf8("NA".to_owned())
        );
    }

    #[test]
    fn int64_parse_is_strict() {
        assert_eq!(
            parse_field("-42", DType::Int64, None).expect("negative"),
            Scalar::Int64(-42)
        );
        for bad in ["12abc", "1.5", "+3", "9223372036854775808", "1 2"] {
            let err = parse_field(bad, DType::Int64, None).expect_err(bad);
            assert_eq!(err.kind(), ErrorKind::Parse, "{bad}");
        }
    }

    #[test]
    fn float64_parse_keeps_nan_as_a_value() {
        let nan = parse_field("NaN", DType::Float64, None).expect("nan");
        assert!(nan.is_nan());
        assert!(!nan.is_null());
        assert_eq!(
            parse_field("1.5e3", DType::Float64, None).expect("exp"),
            Scalar::Float64(1500.0)
        );
        assert!(parse_field("1.5x", DType::Float64, None).is_err());
    }

    #[test]
    fn strings_are_kept_verbatim() {
        assert_eq!(
            parse_field("  padded ", DType::Utf8, None).expect("string"),
            Scalar::Utf8("  padded ".to_owned())
        );
    }

    #[test]
    fn float_formatting_round_trips() {
        for value in [1.0, 85.875, 0.1, -2.5e-9, 1e300, f64::MAX] {
            let text = format_f64(value);
            assert_eq!(text.parse::<f64>().expect("reparse"), value, "{text}");
        }
        assert_eq!(format_f64(f64::NAN), "nan");
        assert_eq!(format_f64(f64::NEG_INFINITY), "-inf");
        assert_eq!(format_scalar(&Scalar::Int64(7)), "7");
        assert_eq!(format_scalar(&Scalar::Null), "");
    }

    #[test]
    fn cast_rules() {
        assert_eq!(
            cast_scalar(&Scalar::Int64(3), DType::Float64).expect("widen"),
            Scalar::Float64(3.0)
        );
        assert_eq!(
            cast_scalar(&Scalar::Float64(4.0), DType::Int64).expect("integral"),
            Scalar::Int64(4)
        );
        assert!(matches!(
            cast_scalar(&Scalar::Float64(4.5), DType::Int64),
            Err(TypeError::LossyFloatToInt { .. })
        ));
        assert_eq!(
            cast_scalar(&Scalar::Float64(f64::NAN), DType::Utf8).expect("nan text"),
            Scalar::Utf8("nan".to_owned())
        );
        assert_eq!(
            cast_scalar(&Scalar::Utf8("12".to_owned()), DType::Int64).expect("parse"),
            Scalar::Int64(12)
        );
        assert_eq!(cast_scalar(&Scalar::Null, DType::Utf8).expect("null"), Scalar::Null);
    }

    #[test]
    fn common_dtype_rejects_string_numeric_mix() {
        assert_eq!(
            common_dtype(DType::Int64, DType::Float64).expect("numeric"),
            DType::Float64
        );
        let err = common_dtype(DType::Utf8, DType::Int64).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "dtype coercion from string to int64 has no compatible common type"
        );
    }

    #[test]
    fn dtype_inference_widens() {
        assert_eq!(infer_dtype(["1", "", "3"], None), DType::Int64);
        assert_eq!(infer_dtype(["1", "2.5"], None), DType::Float64);
        assert_eq!(infer_dtype(["1", "nan"], None), DType::Float64);
        assert_eq!(infer_dtype(["1", "x"], None), DType::Utf8);
        assert_eq!(infer_dtype([], None), DType::Int64);
    }

    #[test]
    fn datetime_parsing_to_epoch_seconds() {
        assert_eq!(parse_datetime("1970-01-02").expect("date"), 86_400);
        assert_eq!(parse_datetime("1970-01-01 00:01:00").expect("naive"), 60);
        assert_eq!(
            parse_datetime("1970-01-01T01:00:00+01:00").expect("rfc3339"),
            0
        );
        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn dtype_names_round_trip() {
        for dtype in [DType::Int64, DType::Float64, DType::Utf8] {
            assert_eq!(dtype.to_string().parse::<DType>().expect("parse"), dtype);
        }
        let json = serde_json::to_string(&DType::Float64).expect("serialize");
        assert_eq!(json, "\"float64\"");
    }

    #[test]
    fn null_field_detection() {
        assert!(is_null_field(" ", None));
        assert!(!is_null_field("0", None));
        assert!(is_null_field("N/A", Some(&NullTokens::pandas_default())));
        assert!(!is_null_field("nan", Some(&NullTokens::pandas_default())));
    }

    #[test]
    fn semantic_eq_matches_nan_with_nan() {
        assert!(Scalar::Float64(f64::NAN).semantic_eq(&Scalar::Float64(f64::NAN)));
        assert!(!Scalar::Float64(f64::NAN).semantic_eq(&Scalar::Null));
        assert!(Scalar::Null.semantic_eq(&Scalar::Null));
    }
}
