//! Columnar session and master tables.
//!
//! Missing values are `None` throughout and are written as empty CSV fields
//! or JSON `null`; they are never conflated with zero.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;

use super::split::Partition;
use crate::error::{PipelineError, Result};
use crate::ingest::SessionMeta;

/// Fixed key columns written before the features.
pub const KEY_COLUMNS: [&str; 5] = [
    "session_id",
    "group_key",
    "timestamp",
    "label",
    "time_to_event",
];

/// Partition column appended once a split has been applied.
pub const PARTITION_COLUMN: &str = "partition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Text,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Numeric => f.write_str("numeric"),
            ColumnKind::Text => f.write_str("text"),
        }
    }
}

/// Name and type of one feature column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Numeric,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValues {
    Numeric(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
}

/// One feature column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: ColumnValues,
}

impl Column {
    pub fn numeric(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            values: ColumnValues::Numeric(values),
        }
    }

    pub fn text(name: impl Into<String>, values: Vec<Option<String>>) -> Self {
        Self {
            name: name.into(),
            values: ColumnValues::Text(values),
        }
    }

    /// A column of `len` sentinels.
    pub fn missing(spec: &ColumnSpec, len: usize) -> Self {
        match spec.kind {
            ColumnKind::Numeric => Self::numeric(spec.name.clone(), vec![None; len]),
            ColumnKind::Text => Self::text(spec.name.clone(), vec![None; len]),
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self.values {
            ColumnValues::Numeric(_) => ColumnKind::Numeric,
            ColumnValues::Text(_) => ColumnKind::Text,
        }
    }

    pub fn spec(&self) -> ColumnSpec {
        ColumnSpec {
            name: self.name.clone(),
            kind: self.kind(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.values {
            ColumnValues::Numeric(v) => v.len(),
            ColumnValues::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_numeric(&self) -> Option<&[Option<f64>]> {
        match &self.values {
            ColumnValues::Numeric(v) => Some(v),
            ColumnValues::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&[Option<String>]> {
        match &self.values {
            ColumnValues::Text(v) => Some(v),
            ColumnValues::Numeric(_) => None,
        }
    }

    pub fn is_missing(&self, row: usize) -> bool {
        match &self.values {
            ColumnValues::Numeric(v) => v[row].is_none(),
            ColumnValues::Text(v) => v[row].is_none(),
        }
    }

    /// Cell rendered for CSV output; empty for a sentinel.
    pub fn render(&self, row: usize) -> String {
        match &self.values {
            ColumnValues::Numeric(v) => v[row].map(|x| x.to_string()).unwrap_or_default(),
            ColumnValues::Text(v) => v[row].clone().unwrap_or_default(),
        }
    }

    fn append(&mut self, other: Column) {
        match (&mut self.values, other.values) {
            (ColumnValues::Numeric(a), ColumnValues::Numeric(b)) => a.extend(b),
            (ColumnValues::Text(a), ColumnValues::Text(b)) => a.extend(b),
            // Kinds are checked before concatenation
            _ => {}
        }
    }
}

/// Labels and features on one session's grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTable {
    pub session: SessionMeta,
    pub timestamps: Vec<DateTime<Utc>>,
    pub labels: Vec<u8>,
    pub time_to_event: Vec<f64>,
    pub columns: Vec<Column>,
}

impl SessionTable {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn schema(&self) -> Vec<ColumnSpec> {
        self.columns.iter().map(Column::spec).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Align session schemas to their union.
///
/// Columns keep first-seen order across sessions; a session lacking a
/// column gets it filled with sentinels. Two sessions disagreeing on a
/// column's type is a `SchemaMismatch`.
pub fn reconcile_schemas(tables: &mut [SessionTable]) -> Result<Vec<ColumnSpec>> {
    let mut canonical: Vec<ColumnSpec> = Vec::new();
    let mut seen: BTreeMap<String, (ColumnKind, String)> = BTreeMap::new();

    for table in tables.iter() {
        for column in &table.columns {
            let kind = column.kind();
            match seen.get(&column.name) {
                Some((expected, first_session)) if *expected != kind => {
                    return Err(PipelineError::SchemaMismatch {
                        column: column.name.clone(),
                        expected: *expected,
                        expected_session: first_session.clone(),
                        found: kind,
                        found_session: table.session.session_id.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    seen.insert(
                        column.name.clone(),
                        (kind, table.session.session_id.clone()),
                    );
                    canonical.push(column.spec());
                }
            }
        }
    }

    for table in tables.iter_mut() {
        let rows = table.len();
        let mut by_name: BTreeMap<String, Column> = std::mem::take(&mut table.columns)
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        table.columns = canonical
            .iter()
            .map(|spec| {
                by_name
                    .remove(&spec.name)
                    .unwrap_or_else(|| Column::missing(spec, rows))
            })
            .collect();
    }

    Ok(canonical)
}

/// Output format for the master table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFormat {
    #[default]
    Csv,
    Json,
}

impl TableFormat {
    /// Pick a format from a file extension, defaulting to CSV.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => TableFormat::Json,
            _ => TableFormat::Csv,
        }
    }
}

/// All sessions' rows, ordered by session start then grid time.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterTable {
    pub session_ids: Vec<String>,
    pub group_keys: Vec<String>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub labels: Vec<u8>,
    pub time_to_event: Vec<f64>,
    pub columns: Vec<Column>,
    pub partitions: Option<Vec<Partition>>,
}

#[derive(Serialize)]
struct JsonTable<'a> {
    rows: usize,
    session_id: &'a [String],
    group_key: &'a [String],
    timestamp: Vec<String>,
    label: &'a [u8],
    time_to_event: &'a [f64],
    #[serde(skip_serializing_if = "Option::is_none")]
    partition: Option<&'a [Partition]>,
    columns: &'a [Column],
}

impl MasterTable {
    /// Concatenate reconciled session tables in the given order.
    pub fn concat(tables: Vec<SessionTable>) -> Result<Self> {
        let schema = tables.first().map(SessionTable::schema).unwrap_or_default();
        let first_session = tables
            .first()
            .map(|t| t.session.session_id.clone())
            .unwrap_or_default();

        let mut master = MasterTable {
            session_ids: Vec::new(),
            group_keys: Vec::new(),
            timestamps: Vec::new(),
            labels: Vec::new(),
            time_to_event: Vec::new(),
            columns: schema
                .iter()
                .map(|spec| Column::missing(spec, 0))
                .collect(),
            partitions: None,
        };

        for table in tables {
            let found = table.schema();
            if found != schema {
                let (column, expected, found_kind) = first_difference(&schema, &found);
                return Err(PipelineError::SchemaMismatch {
                    column,
                    expected,
                    expected_session: first_session,
                    found: found_kind,
                    found_session: table.session.session_id.clone(),
                });
            }

            let rows = table.len();
            master
                .session_ids
                .extend(std::iter::repeat(table.session.session_id.clone()).take(rows));
            master
                .group_keys
                .extend(std::iter::repeat(table.session.group_key.clone()).take(rows));
            master.timestamps.extend(table.timestamps);
            master.labels.extend(table.labels);
            master.time_to_event.extend(table.time_to_event);
            for (target, column) in master.columns.iter_mut().zip(table.columns) {
                target.append(column);
            }
        }

        Ok(master)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn schema(&self) -> Vec<ColumnSpec> {
        self.columns.iter().map(Column::spec).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn positive_rows(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }

    /// Row indices belonging to a partition, in table order.
    pub fn partition_rows(&self, partition: Partition) -> Vec<usize> {
        match &self.partitions {
            Some(parts) => parts
                .iter()
                .enumerate()
                .filter(|(_, &p)| p == partition)
                .map(|(i, _)| i)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Row indices belonging to the given session.
    pub fn session_rows(&self, session_id: &str) -> Vec<usize> {
        self.session_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| id.as_str() == session_id)
            .map(|(i, _)| i)
            .collect()
    }

    fn header(&self) -> Vec<&str> {
        let mut header: Vec<&str> = KEY_COLUMNS.to_vec();
        header.extend(self.columns.iter().map(|c| c.name.as_str()));
        if self.partitions.is_some() {
            header.push(PARTITION_COLUMN);
        }
        header
    }

    /// Write as CSV with a header row.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(self.header())?;

        let width = KEY_COLUMNS.len() + self.columns.len() + 1;
        let mut record: Vec<String> = Vec::with_capacity(width);
        for row in 0..self.len() {
            record.clear();
            record.push(self.session_ids[row].clone());
            record.push(self.group_keys[row].clone());
            record.push(format_timestamp(self.timestamps[row]));
            record.push(self.labels[row].to_string());
            record.push(self.time_to_event[row].to_string());
            record.extend(self.columns.iter().map(|c| c.render(row)));
            if let Some(parts) = &self.partitions {
                record.push(parts[row].as_str().to_string());
            }
            csv.write_record(&record)?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Write as a columnar JSON document.
    pub fn write_json<W: Write>(&self, writer: W) -> Result<()> {
        let doc = JsonTable {
            rows: self.len(),
            session_id: &self.session_ids,
            group_key: &self.group_keys,
            timestamp: self.timestamps.iter().map(|&t| format_timestamp(t)).collect(),
            label: &self.labels,
            time_to_event: &self.time_to_event,
            partition: self.partitions.as_deref(),
            columns: &self.columns,
        };
        serde_json::to_writer_pretty(writer, &doc)?;
        Ok(())
    }

    /// Write to `path` in the given format, creating parent directories.
    pub fn save(&self, path: &Path, format: TableFormat) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        match format {
            TableFormat::Csv => self.write_csv(file),
            TableFormat::Json => self.write_json(file),
        }
    }
}

fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn first_difference(
    expected: &[ColumnSpec],
    found: &[ColumnSpec],
) -> (String, ColumnKind, ColumnKind) {
    for (i, spec) in found.iter().enumerate() {
        match expected.get(i) {
            Some(e) if e == spec => continue,
            Some(e) if e.name == spec.name => return (spec.name.clone(), e.kind, spec.kind),
            Some(e) => return (e.name.clone(), e.kind, spec.kind),
            None => return (spec.name.clone(), spec.kind, spec.kind),
        }
    }
    match expected.get(found.len()) {
        Some(e) => (e.name.clone(), e.kind, e.kind),
        None => (String::new(), ColumnKind::Numeric, ColumnKind::Numeric),
    }
}
