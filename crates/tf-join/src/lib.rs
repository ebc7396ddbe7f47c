#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use bumpalo::{Bump, collections::Vec as BumpVec};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tf_columnar::{CellKey, ColumnError, Series};
use tf_frame::{DataFrame, FrameError};
use tf_types::{DType, ErrorKind, ErrorRecord, TypeError, common_dtype};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Outer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    Auto,
    Nested,
    Hash,
    Sorted,
}

/// Equality key: `left` column of the left frame against `right` of the right frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinKeyPair {
    pub left: String,
    pub right: String,
}

impl JoinKeyPair {
    #[must_use]
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            right: right.into(),
        }
    }

    /// Key column with the same name on both sides.
    #[must_use]
    pub fn same(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            left: name.clone(),
            right: name,
        }
    }
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Position buffers go to a bump arena unless the estimate exceeds the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinOptions {
    pub on: Vec<JoinKeyPair>,
    pub kind: JoinKind,
    pub strategy: JoinStrategy,
    /// Suffixes for colliding non-key columns: `(left, right)`.
    pub suffixes: (String, String),
    pub execution: JoinExecutionOptions,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            on: Vec::new(),
            kind: JoinKind::Inner,
            strategy: JoinStrategy::Auto,
            suffixes: (String::new(), "_right".to_owned()),
            execution: JoinExecutionOptions::default(),
        }
    }
}

impl JoinOptions {
    /// Join on same-named key columns.
    #[must_use]
    pub fn on(names: &[&str]) -> Self {
        Self {
            on: names.iter().map(|name| JoinKeyPair::same(*name)).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn kind(mut self, kind: JoinKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn strategy(mut self, strategy: JoinStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn suffixes(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.suffixes = (left.into(), right.into());
        self
    }
}

/// What a join actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTrace {
    pub strategy: JoinStrategy,
    pub matched_pairs: usize,
    pub output_rows: usize,
    pub used_arena: bool,
    pub estimated_bytes: usize,
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join requires at least one key pair")]
    NoKeys,
    #[error("{side} frame has no key column '{name}'")]
    UnknownKey { side: &'static str, name: String },
    #[error("key '{left}' ({left_dtype}) cannot be compared with '{right}' ({right_dtype})")]
    KeyDtype {
        left: String,
        right: String,
        left_dtype: DType,
        right_dtype: DType,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl ErrorRecord for JoinError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(err) => err.kind(),
            Self::Column(err) => err.kind(),
            Self::Type(err) => err.kind(),
            _ => ErrorKind::InvalidArgument,
        }
    }
}

// ── Key encoding ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyMode {
    Int,
    Float,
    Str,
}

/// One normalized key cell. Integral floats inside the i64 range encode as
/// `Int`, so Int64 and Float64 keys compare exactly rather than through a
/// lossy `i64 -> f64` conversion.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum KeyCell<'a> {
    Int(i64),
    Float(u64),
    Str(&'a str),
}

impl Ord for KeyCell<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => f64::from_bits(*a).total_cmp(&f64::from_bits(*b)),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for KeyCell<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl KeyCell<'_> {
    fn rank(&self) -> u8 {
        match self {
            Self::Int(_) => 0,
            Self::Float(_) => 1,
            Self::Str(_) => 2,
        }
    }
}

/// Row keys; `None` when any key cell is null or NaN, which never matches.
type RowKeys<'a> = Vec<Option<Vec<KeyCell<'a>>>>;

fn key_cell<'a>(series: &'a Series, row: usize, mode: KeyMode) -> Option<KeyCell<'a>> {
    match (series.key(row)?, mode) {
        (CellKey::Int64(v), KeyMode::Int | KeyMode::Float) => Some(KeyCell::Int(v)),
        (CellKey::FloatBits(bits), _) => float_cell(f64::from_bits(bits)),
        (CellKey::Utf8(text), _) => Some(KeyCell::Str(text)),
        (CellKey::Int64(_), KeyMode::Str) => None,
    }
}

/// 2^63; `i64::MAX as f64` rounds up to this, so the bound is exclusive.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

fn float_cell(value: f64) -> Option<KeyCell<'static>> {
    if value.is_nan() {
        return None;
    }
    if value == value.trunc() && (-I64_LIMIT..I64_LIMIT).contains(&value) {
        return Some(KeyCell::Int(value as i64));
    }
    match CellKey::from_f64(value) {
        CellKey::FloatBits(bits) => Some(KeyCell::Float(bits)),
        _ => None,
    }
}

fn encode_rows<'a>(columns: &[(&'a Series, KeyMode)], nrows: usize) -> RowKeys<'a> {
    (0..nrows)
        .map(|row| {
            columns
                .iter()
                .map(|(series, mode)| key_cell(series, row, *mode))
                .collect::<Option<Vec<_>>>()
        })
        .collect()
}

struct ResolvedKeys<'a> {
    left: Vec<(&'a Series, KeyMode)>,
    right: Vec<(&'a Series, KeyMode)>,
    output_dtypes: Vec<DType>,
}

fn resolve_keys<'a>(
    left: &'a DataFrame,
    right: &'a DataFrame,
    on: &[JoinKeyPair],
) -> Result<ResolvedKeys<'a>, JoinError> {
    if on.is_empty() {
        return Err(JoinError::NoKeys);
    }
    let mut resolved = ResolvedKeys {
        left: Vec::with_capacity(on.len()),
        right: Vec::with_capacity(on.len()),
        output_dtypes: Vec::with_capacity(on.len()),
    };
    for pair in on {
        let left_series = left.column(&pair.left).map_err(|_| JoinError::UnknownKey {
            side: "left",
            name: pair.left.clone(),
        })?;
        let right_series = right
            .column(&pair.right)
            .map_err(|_| JoinError::UnknownKey {
                side: "right",
                name: pair.right.clone(),
            })?;
        let dtype = common_dtype(left_series.dtype(), right_series.dtype()).map_err(|_| {
            JoinError::KeyDtype {
                left: pair.left.clone(),
                right: pair.right.clone(),
                left_dtype: left_series.dtype(),
                right_dtype: right_series.dtype(),
            }
        })?;
        let mode = match dtype {
            DType::Int64 => KeyMode::Int,
            DType::Float64 => KeyMode::Float,
            DType::Utf8 => KeyMode::Str,
        };
        resolved.left.push((left_series, mode));
        resolved.right.push((right_series, mode));
        resolved.output_dtypes.push(dtype);
    }
    Ok(resolved)
}

// ── Strategies: each returns matched (left, right) pairs ───────────────

fn nested_loop_pairs(left: &RowKeys<'_>, right: &RowKeys<'_>) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (l, left_key) in left.iter().enumerate() {
        let Some(left_key) = left_key else {
            continue;
        };
        for (r, right_key) in right.iter().enumerate() {
            if right_key.as_ref() == Some(left_key) {
                pairs.push((l, r));
            }
        }
    }
    pairs
}

/// Build a multimap on the smaller side and probe with the larger.
fn hash_pairs(left: &RowKeys<'_>, right: &RowKeys<'_>) -> Vec<(usize, usize)> {
    let build_left = left.len() <= right.len();
    let (build, probe) = if build_left {
        (left, right)
    } else {
        (right, left)
    };
    let mut table = HashMap::<&[KeyCell<'_>], Vec<usize>>::new();
    for (pos, key) in build.iter().enumerate() {
        if let Some(key) = key {
            table.entry(key.as_slice()).or_default().push(pos);
        }
    }
    trace!(
        "hash join: {} build keys from {} rows, probing {} rows",
        table.len(),
        build.len(),
        probe.len()
    );
    let mut pairs = Vec::new();
    for (probe_pos, key) in probe.iter().enumerate() {
        let Some(matches) = key.as_ref().and_then(|key| table.get(key.as_slice())) else {
            continue;
        };
        for &build_pos in matches {
            pairs.push(if build_left {
                (build_pos, probe_pos)
            } else {
                (probe_pos, build_pos)
            });
        }
    }
    pairs
}

/// Sort both sides by key, then merge equal runs as a cross product.
fn sort_merge_pairs(left: &RowKeys<'_>, right: &RowKeys<'_>) -> Vec<(usize, usize)> {
    fn sorted_present<'k, 'a>(keys: &'k RowKeys<'a>) -> Vec<(&'k [KeyCell<'a>], usize)> {
        let mut present = keys
            .iter()
            .enumerate()
            .filter_map(|(pos, key)| key.as_deref().map(|key| (key, pos)))
            .collect::<Vec<_>>();
        present.sort_by(|a, b| a.0.cmp(b.0));
        present
    }

    let left_sorted = sorted_present(left);
    let right_sorted = sorted_present(right);
    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < left_sorted.len() && j < right_sorted.len() {
        match left_sorted[i].0.cmp(right_sorted[j].0) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                let key = left_sorted[i].0;
                let left_end = i + left_sorted[i..].iter().take_while(|(k, _)| *k == key).count();
                let right_end =
                    j + right_sorted[j..].iter().take_while(|(k, _)| *k == key).count();
                for (_, l) in &left_sorted[i..left_end] {
                    for (_, r) in &right_sorted[j..right_end] {
                        pairs.push((*l, *r));
                    }
                }
                i = left_end;
                j = right_end;
            }
        }
    }
    pairs
}

// ── Canonical row order ────────────────────────────────────────────────

trait PositionBuffer {
    fn push_pair(&mut self, left: Option<usize>, right: Option<usize>);
}

impl PositionBuffer for (Vec<Option<usize>>, Vec<Option<usize>>) {
    fn push_pair(&mut self, left: Option<usize>, right: Option<usize>) {
        self.0.push(left);
        self.1.push(right);
    }
}

impl PositionBuffer for (BumpVec<'_, Option<usize>>, BumpVec<'_, Option<usize>>) {
    fn push_pair(&mut self, left: Option<usize>, right: Option<usize>) {
        self.0.push(left);
        self.1.push(right);
    }
}

/// Matched pairs sorted by `(left, right)` plus unmatched rows on each side.
struct MatchSet {
    pairs: Vec<(usize, usize)>,
    left_matched: Vec<bool>,
    right_matched: Vec<bool>,
}

impl MatchSet {
    fn new(mut pairs: Vec<(usize, usize)>, left_rows: usize, right_rows: usize) -> Self {
        pairs.sort_unstable();
        let mut left_matched = vec![false; left_rows];
        let mut right_matched = vec![false; right_rows];
        for &(l, r) in &pairs {
            left_matched[l] = true;
            right_matched[r] = true;
        }
        Self {
            pairs,
            left_matched,
            right_matched,
        }
    }

    fn output_rows(&self, kind: JoinKind) -> usize {
        let left_only = self.left_matched.iter().filter(|m| !**m).count();
        let right_only = self.right_matched.iter().filter(|m| !**m).count();
        self.pairs.len()
            + match kind {
                JoinKind::Inner => 0,
                JoinKind::Left => left_only,
                JoinKind::Right => right_only,
                JoinKind::Outer => left_only + right_only,
            }
    }

    /// Emit output positions: `inner`/`left` follow left order then right
    /// order within a left row; `right` follows right order; `outer` is the
    /// left-ordered rows followed by right-only rows.
    fn emit(&self, kind: JoinKind, out: &mut impl PositionBuffer) {
        match kind {
            JoinKind::Inner => {
                for &(l, r) in &self.pairs {
                    out.push_pair(Some(l), Some(r));
                }
            }
            JoinKind::Left | JoinKind::Outer => {
                let mut cursor = 0;
                for l in 0..self.left_matched.len() {
                    if !self.left_matched[l] {
                        out.push_pair(Some(l), None);
                        continue;
                    }
                    while cursor < self.pairs.len() && self.pairs[cursor].0 == l {
                        out.push_pair(Some(l), Some(self.pairs[cursor].1));
                        cursor += 1;
                    }
                }
                if kind == JoinKind::Outer {
                    for (r, matched) in self.right_matched.iter().enumerate() {
                        if !matched {
                            out.push_pair(None, Some(r));
                        }
                    }
                }
            }
            JoinKind::Right => {
                let mut by_right = self.pairs.clone();
                by_right.sort_unstable_by_key(|&(l, r)| (r, l));
                let mut cursor = 0;
                for r in 0..self.right_matched.len() {
                    if !self.right_matched[r] {
                        out.push_pair(None, Some(r));
                        continue;
                    }
                    while cursor < by_right.len() && by_right[cursor].1 == r {
                        out.push_pair(Some(by_right[cursor].0), Some(r));
                        cursor += 1;
                    }
                }
            }
        }
    }
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<Option<usize>>().saturating_mul(2))
}

// ── Output assembly ────────────────────────────────────────────────────

/// Key column: left value where present, else the right value.
fn coalesce_key(
    name: &str,
    dtype: DType,
    left: &Series,
    right: &Series,
) -> Result<Series, JoinError> {
    let mut out = Series::with_capacity(name, dtype, left.len())?;
    for row in 0..left.len() {
        let value = if left.is_null(row) {
            right.value(row)?
        } else {
            left.value(row)?
        };
        out.push(tf_types::cast_scalar(&value, dtype)?)?;
    }
    Ok(out)
}

fn assemble(
    left: &DataFrame,
    right: &DataFrame,
    options: &JoinOptions,
    keys: &ResolvedKeys<'_>,
    left_positions: &[Option<usize>],
    right_positions: &[Option<usize>],
) -> Result<DataFrame, JoinError> {
    let right_keys: HashSet<&str> = options.on.iter().map(|p| p.right.as_str()).collect();
    let right_values: HashSet<&str> = right
        .column_names()
        .into_iter()
        .filter(|name| !right_keys.contains(name))
        .collect();
    let (left_suffix, right_suffix) = &options.suffixes;

    let mut columns = Vec::with_capacity(left.num_columns() + right.num_columns());
    for (_, series) in left.columns() {
        let name = series.name();
        if let Some(slot) = options.on.iter().position(|p| p.left == name) {
            let left_key = series.reindex_by_positions(left_positions)?;
            let right_key = keys.right[slot].0.reindex_by_positions(right_positions)?;
            columns.push(coalesce_key(
                name,
                keys.output_dtypes[slot],
                &left_key,
                &right_key,
            )?);
            continue;
        }
        let mut out = series.reindex_by_positions(left_positions)?;
        if right_values.contains(name) && !left_suffix.is_empty() {
            out = out.with_name(format!("{name}{left_suffix}"));
        }
        columns.push(out);
    }

    let left_names: HashSet<&str> = left.column_names().into_iter().collect();
    for (_, series) in right.columns() {
        let name = series.name();
        if right_keys.contains(name) {
            continue;
        }
        let mut out = series.reindex_by_positions(right_positions)?;
        if left_names.contains(name) {
            out = out.with_name(format!("{name}{right_suffix}"));
        }
        columns.push(out);
    }
    Ok(DataFrame::from_series(columns)?)
}

// ── Entry points ───────────────────────────────────────────────────────

pub fn join(
    left: &DataFrame,
    right: &DataFrame,
    options: &JoinOptions,
) -> Result<DataFrame, JoinError> {
    let (frame, _) = join_with_trace(left, right, options)?;
    Ok(frame)
}

/// Join and report the resolved strategy and buffer placement.
pub fn join_with_trace(
    left: &DataFrame,
    right: &DataFrame,
    options: &JoinOptions,
) -> Result<(DataFrame, JoinTrace), JoinError> {
    let keys = resolve_keys(left, right, &options.on)?;
    let left_rows = encode_rows(&keys.left, left.num_rows());
    let right_rows = encode_rows(&keys.right, right.num_rows());

    let strategy = match options.strategy {
        JoinStrategy::Auto => JoinStrategy::Hash,
        forced => forced,
    };
    debug!(
        "join {:?}: {} x {} rows, strategy {:?} (requested {:?})",
        options.kind,
        left.num_rows(),
        right.num_rows(),
        strategy,
        options.strategy
    );
    let pairs = match strategy {
        JoinStrategy::Nested => nested_loop_pairs(&left_rows, &right_rows),
        JoinStrategy::Sorted => sort_merge_pairs(&left_rows, &right_rows),
        JoinStrategy::Hash | JoinStrategy::Auto => hash_pairs(&left_rows, &right_rows),
    };
    let matches = MatchSet::new(pairs, left.num_rows(), right.num_rows());
    let output_rows = matches.output_rows(options.kind);
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let used_arena =
        options.execution.use_arena && estimated_bytes <= options.execution.arena_budget_bytes;
    debug!("join buffers: {output_rows} rows, {estimated_bytes} bytes, arena={used_arena}");

    let frame = if used_arena {
        let arena = Bump::new();
        let mut buffers: (BumpVec<'_, Option<usize>>, BumpVec<'_, Option<usize>>) = (
            BumpVec::with_capacity_in(output_rows, &arena),
            BumpVec::with_capacity_in(output_rows, &arena),
        );
        matches.emit(options.kind, &mut buffers);
        assemble(left, right, options, &keys, &buffers.0, &buffers.1)?
    } else {
        let mut buffers: (Vec<Option<usize>>, Vec<Option<usize>>) = (
            Vec::with_capacity(output_rows),
            Vec::with_capacity(output_rows),
        );
        matches.emit(options.kind, &mut buffers);
        assemble(left, right, options, &keys, &buffers.0, &buffers.1)?
    };

    Ok((
        frame,
        JoinTrace {
            strategy,
            matched_pairs: matches.pairs.len(),
            output_rows,
            used_arena,
            estimated_bytes,
        },
    ))
}

/// Matches `pd.merge(left, right, on=names, how=kind)`.
pub fn merge(
    left: &DataFrame,
    right: &DataFrame,
    on: &[&str],
    kind: JoinKind,
) -> Result<DataFrame, JoinError> {
    join(left, right, &JoinOptions::on(on).kind(kind))
}
