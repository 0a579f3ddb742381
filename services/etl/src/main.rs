//! ETL Service - Loads ship telemetry spreadsheet exports into the star schema
//!
//! Responsibilities:
//! - Discover spreadsheet exports (xlsx/xls/csv) in the data folder
//! - Parse the embedded sensor record carried by each row
//! - Validate every sensor field against fixed range/precision rules
//! - Resolve ship and calendar dimension keys, creating rows on first sight
//! - Bulk-insert facts in duplicate-safe batches, committing per batch
//!
//! Usage:
//!   cargo run --bin etl
//!   cargo run --bin etl -- --data-dir ./data --dry-run

use anyhow::{bail, Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Loads ship telemetry spreadsheets into the star schema")]
struct Args {
    /// Override DATA_FOLDER_PATH from the environment
    #[arg(long)]
    data_dir: Option<String>,

    /// Parse and validate files without loading anything
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    database_url: String,
    data_folder: PathBuf,
}

impl Config {
    fn from_env(args: &Args) -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL env var missing")?;
        let data_folder = match &args.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(
                std::env::var("DATA_FOLDER_PATH").context("DATA_FOLDER_PATH env var missing")?,
            ),
        };
        Ok(Self {
            database_url,
            data_folder,
        })
    }
}

// =============================================================================
// Sensor field validation
// =============================================================================

/// One entry of the fixed validation table: raw sensor key, destination
/// field, inclusive range, decimal precision.
#[derive(Debug)]
struct FieldRule {
    source: &'static str,
    target: &'static str,
    min: f64,
    max: f64,
    precision: u32,
}

const VALIDATION_RULES: &[FieldRule] = &[
    FieldRule { source: "LAT", target: "latitude", min: -90.0, max: 90.0, precision: 6 },
    FieldRule { source: "LON", target: "longitude", min: -180.0, max: 180.0, precision: 6 },
    FieldRule { source: "WINDIR", target: "wind_direction", min: 0.0, max: 360.0, precision: 2 },
    FieldRule { source: "WINSPE", target: "wind_speed", min: 0.0, max: 200.0, precision: 2 },
    FieldRule { source: "AIR_TEMP_AUT", target: "air_temperature", min: -50.0, max: 60.0, precision: 2 },
    FieldRule { source: "CTNK0_LIQ_VOL", target: "tank0_liquid_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK0_MAX_VOL", target: "tank0_max_volume", min: 0.0, max: 999999.99, precision: 2 },
    // Tank 0 reports its fill percentage under CTNK0_MAX_PERC; tanks 1-4 use
    // CTNKn_PERC. The upstream sensor naming is uneven, not ours to fix.
    FieldRule { source: "CTNK0_MAX_PERC", target: "tank0_percentage", min: 0.0, max: 100.0, precision: 2 },
    FieldRule { source: "CTNK1_LIQ_VOL", target: "tank1_liquid_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK1_MAX_VOL", target: "tank1_max_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK1_PERC", target: "tank1_percentage", min: 0.0, max: 100.0, precision: 2 },
    FieldRule { source: "CTNK2_LIQ_VOL", target: "tank2_liquid_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK2_MAX_VOL", target: "tank2_max_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK2_PERC", target: "tank2_percentage", min: 0.0, max: 100.0, precision: 2 },
    FieldRule { source: "CTNK3_LIQ_VOL", target: "tank3_liquid_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK3_MAX_VOL", target: "tank3_max_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK3_PERC", target: "tank3_percentage", min: 0.0, max: 100.0, precision: 2 },
    FieldRule { source: "CTNK4_LIQ_VOL", target: "tank4_liquid_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK4_MAX_VOL", target: "tank4_max_volume", min: 0.0, max: 999999.99, precision: 2 },
    FieldRule { source: "CTNK4_PERC", target: "tank4_percentage", min: 0.0, max: 100.0, precision: 2 },
    FieldRule { source: "CTNK0_VAP_PRES", target: "tank0_vapor_pressure", min: 0.0, max: 9999.99, precision: 2 },
    FieldRule { source: "CTNK0_VAP_TEMP", target: "tank0_vapor_temperature", min: -200.0, max: 200.0, precision: 2 },
    FieldRule { source: "CTNK1_VAP_PRES", target: "tank1_vapor_pressure", min: 0.0, max: 9999.99, precision: 2 },
    FieldRule { source: "CTNK1_VAP_TEMP", target: "tank1_vapor_temperature", min: -200.0, max: 200.0, precision: 2 },
    FieldRule { source: "CTNK2_VAP_PRES", target: "tank2_vapor_pressure", min: 0.0, max: 9999.99, precision: 2 },
    FieldRule { source: "CTNK2_VAP_TEMP", target: "tank2_vapor_temperature", min: -200.0, max: 200.0, precision: 2 },
    FieldRule { source: "CTNK3_VAP_PRES", target: "tank3_vapor_pressure", min: 0.0, max: 9999.99, precision: 2 },
    FieldRule { source: "CTNK3_VAP_TEMP", target: "tank3_vapor_temperature", min: -200.0, max: 200.0, precision: 2 },
    FieldRule { source: "CTNK4_VAP_PRES", target: "tank4_vapor_pressure", min: 0.0, max: 9999.99, precision: 2 },
    FieldRule { source: "CTNK4_VAP_TEMP", target: "tank4_vapor_temperature", min: -200.0, max: 200.0, precision: 2 },
];

/// Rounds half away from zero to `precision` decimal places.
fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Validates a decoded sensor record against the rule table. Fields that are
/// unknown, absent, null, non-numeric, or out of range are dropped (never
/// clamped); accepted values are rounded to the rule's precision. An empty
/// result is not an error; the caller decides what it means for the row.
fn validate_sensor_fields(
    raw: &HashMap<String, LiteralValue>,
    row_number: usize,
) -> HashMap<&'static str, f64> {
    let mut validated = HashMap::new();
    let mut validation_errors = 0;

    for rule in VALIDATION_RULES {
        let Some(value) = raw.get(rule.source) else {
            continue;
        };
        let numeric = match value {
            LiteralValue::Null => continue,
            LiteralValue::Number(n) => *n,
            // float() in the exporter accepts booleans; keep that behavior
            LiteralValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            LiteralValue::Text(s) => match s.trim().parse::<f64>() {
                Ok(n) => n,
                Err(e) => {
                    warn!(row = row_number, field = rule.source, error = %e, "could not convert field");
                    validation_errors += 1;
                    continue;
                }
            },
        };

        if !(rule.min <= numeric && numeric <= rule.max) {
            warn!(
                row = row_number,
                field = rule.target,
                value = numeric,
                min = rule.min,
                max = rule.max,
                "value out of range"
            );
            validation_errors += 1;
            continue;
        }

        validated.insert(rule.target, round_to(numeric, rule.precision));
    }

    if validation_errors > 0 {
        info!(row = row_number, errors = validation_errors, "field validation finished with errors");
    }

    validated
}

// =============================================================================
// Embedded record parser
// =============================================================================
//
// The data column carries a flat dictionary literal such as
//   {'LAT': 69.1234, 'LON': 33.5, 'CTNK0_LIQ_VOL': 1500.0, 'NOTE': 'ok'}
// Grammar, deliberately constrained (never an expression evaluator):
//   record = '{' (pair (',' pair)* ','?)? '}'
//   pair   = string ':' value
//   value  = number | string | 'True' | 'False' | 'None'
// Strings are single- or double-quoted with \\ \' \" \n \t escapes; numbers
// allow sign, decimal point, and exponent. Anything else is rejected.

#[derive(Debug, Clone, PartialEq)]
enum LiteralValue {
    Number(f64),
    Text(String),
    Bool(bool),
    Null,
}

struct LiteralScanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> LiteralScanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn parse_record(&mut self) -> Result<HashMap<String, LiteralValue>> {
        self.skip_whitespace();
        if self.bump() != Some('{') {
            bail!("expected '{{' at byte {}", self.pos);
        }
        let mut record = HashMap::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('}') => {
                    self.bump();
                    break;
                }
                Some('\'') | Some('"') => {
                    let key = self.parse_string()?;
                    self.skip_whitespace();
                    if self.bump() != Some(':') {
                        bail!("expected ':' after key {key:?}");
                    }
                    self.skip_whitespace();
                    let value = self.parse_value()?;
                    record.insert(key, value);
                    self.skip_whitespace();
                    match self.peek() {
                        Some(',') => {
                            self.bump();
                        }
                        Some('}') => {}
                        other => bail!("expected ',' or '}}' after value, found {other:?}"),
                    }
                }
                other => bail!("expected quoted key or '}}', found {other:?}"),
            }
        }
        self.skip_whitespace();
        if self.peek().is_some() {
            bail!("trailing content after record at byte {}", self.pos);
        }
        Ok(record)
    }

    fn parse_string(&mut self) -> Result<String> {
        let quote = match self.bump() {
            Some(q @ ('\'' | '"')) => q,
            other => bail!("expected string quote, found {other:?}"),
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                None => bail!("unterminated string"),
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c @ ('\'' | '"' | '\\')) => out.push(c),
                    other => bail!("unsupported escape {other:?}"),
                },
                Some(c) => out.push(c),
            }
        }
        Ok(out)
    }

    fn parse_value(&mut self) -> Result<LiteralValue> {
        match self.peek() {
            Some('\'') | Some('"') => Ok(LiteralValue::Text(self.parse_string()?)),
            Some(c) if c == '+' || c == '-' || c == '.' || c.is_ascii_digit() => {
                self.parse_number()
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let word = self.parse_word();
                match word.as_str() {
                    "True" => Ok(LiteralValue::Bool(true)),
                    "False" => Ok(LiteralValue::Bool(false)),
                    "None" => Ok(LiteralValue::Null),
                    other => bail!("unsupported literal {other:?}"),
                }
            }
            other => bail!("unsupported value start {other:?}"),
        }
    }

    fn parse_number(&mut self) -> Result<LiteralValue> {
        let start = self.pos;
        if matches!(self.peek(), Some('+') | Some('-')) {
            self.bump();
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.bump();
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            self.bump();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.bump();
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = &self.input[start..self.pos];
        let value: f64 = text
            .parse()
            .with_context(|| format!("invalid number {text:?}"))?;
        Ok(LiteralValue::Number(value))
    }

    fn parse_word(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            self.bump();
        }
        self.input[start..self.pos].to_string()
    }
}

fn parse_record_literal(input: &str) -> Result<HashMap<String, LiteralValue>> {
    LiteralScanner::new(input).parse_record()
}

/// Decodes and validates one data column value. Spreadsheet exports often
/// wrap the literal in an extra pair of double quotes and double the inner
/// ones; both are undone before scanning. Any decode failure degrades to an
/// empty map so a single malformed row never aborts file processing.
fn parse_data_column(data_str: &str, row_number: usize) -> HashMap<&'static str, f64> {
    let cleaned = data_str.trim().trim_matches('"').replace("\"\"", "\"");
    match parse_record_literal(&cleaned) {
        Ok(raw) => {
            let validated = validate_sensor_fields(&raw, row_number);
            if validated.is_empty() {
                warn!(row = row_number, "no fields survived validation");
            }
            validated
        }
        Err(e) => {
            warn!(row = row_number, error = %e, "failed to decode embedded record");
            HashMap::new()
        }
    }
}

// =============================================================================
// File processing
// =============================================================================

const DATA_SHEET: &str = "DATA";
const REQUIRED_COLUMNS: &[&str] = &["id_ship", "datetime", "data"];
const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xls", "csv"];

/// One source row after cell extraction, before validation. Blank and null
/// cells are already collapsed to None.
#[derive(Debug, Default)]
struct RawRow {
    id_ship: Option<String>,
    datetime: Option<String>,
    datetime_created: Option<String>,
    data: Option<String>,
}

/// One destination-shaped record, the in-memory batch unit handed to the
/// bulk loader. Field order mirrors the f_data column order.
#[derive(Debug, Clone)]
struct ProcessedRecord {
    ship_id: String,
    datetime: String,
    datetime_created: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    wind_direction: Option<f64>,
    wind_speed: Option<f64>,
    air_temperature: Option<f64>,
    tank0_liquid_volume: Option<f64>,
    tank0_max_volume: Option<f64>,
    tank0_percentage: Option<f64>,
    tank1_liquid_volume: Option<f64>,
    tank1_max_volume: Option<f64>,
    tank1_percentage: Option<f64>,
    tank2_liquid_volume: Option<f64>,
    tank2_max_volume: Option<f64>,
    tank2_percentage: Option<f64>,
    tank3_liquid_volume: Option<f64>,
    tank3_max_volume: Option<f64>,
    tank3_percentage: Option<f64>,
    tank4_liquid_volume: Option<f64>,
    tank4_max_volume: Option<f64>,
    tank4_percentage: Option<f64>,
    tank0_vapor_pressure: Option<f64>,
    tank0_vapor_temperature: Option<f64>,
    tank1_vapor_pressure: Option<f64>,
    tank1_vapor_temperature: Option<f64>,
    tank2_vapor_pressure: Option<f64>,
    tank2_vapor_temperature: Option<f64>,
    tank3_vapor_pressure: Option<f64>,
    tank3_vapor_temperature: Option<f64>,
    tank4_vapor_pressure: Option<f64>,
    tank4_vapor_temperature: Option<f64>,
    data_source: String,
}

impl ProcessedRecord {
    fn from_validated(
        ship_id: String,
        datetime: String,
        datetime_created: Option<String>,
        fields: &HashMap<&'static str, f64>,
        data_source: &str,
    ) -> Self {
        let f = |name: &str| fields.get(name).copied();
        Self {
            ship_id,
            datetime,
            datetime_created,
            latitude: f("latitude"),
            longitude: f("longitude"),
            wind_direction: f("wind_direction"),
            wind_speed: f("wind_speed"),
            air_temperature: f("air_temperature"),
            tank0_liquid_volume: f("tank0_liquid_volume"),
            tank0_max_volume: f("tank0_max_volume"),
            tank0_percentage: f("tank0_percentage"),
            tank1_liquid_volume: f("tank1_liquid_volume"),
            tank1_max_volume: f("tank1_max_volume"),
            tank1_percentage: f("tank1_percentage"),
            tank2_liquid_volume: f("tank2_liquid_volume"),
            tank2_max_volume: f("tank2_max_volume"),
            tank2_percentage: f("tank2_percentage"),
            tank3_liquid_volume: f("tank3_liquid_volume"),
            tank3_max_volume: f("tank3_max_volume"),
            tank3_percentage: f("tank3_percentage"),
            tank4_liquid_volume: f("tank4_liquid_volume"),
            tank4_max_volume: f("tank4_max_volume"),
            tank4_percentage: f("tank4_percentage"),
            tank0_vapor_pressure: f("tank0_vapor_pressure"),
            tank0_vapor_temperature: f("tank0_vapor_temperature"),
            tank1_vapor_pressure: f("tank1_vapor_pressure"),
            tank1_vapor_temperature: f("tank1_vapor_temperature"),
            tank2_vapor_pressure: f("tank2_vapor_pressure"),
            tank2_vapor_temperature: f("tank2_vapor_temperature"),
            tank3_vapor_pressure: f("tank3_vapor_pressure"),
            tank3_vapor_temperature: f("tank3_vapor_temperature"),
            tank4_vapor_pressure: f("tank4_vapor_pressure"),
            tank4_vapor_temperature: f("tank4_vapor_temperature"),
            data_source: data_source.to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FileStats {
    total_rows: usize,
    processed: usize,
    validation_errors: usize,
    processing_errors: usize,
}

impl FileStats {
    fn success_rate(&self) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            self.processed as f64 / self.total_rows as f64 * 100.0
        }
    }
}

/// Extracts one cell as trimmed text. Error cells are a hard error so they
/// surface as processing errors rather than silently becoming text.
fn cell_text(row: &[Data], idx: Option<usize>) -> Result<Option<String>> {
    let Some(idx) = idx else {
        return Ok(None);
    };
    let Some(cell) = row.get(idx) else {
        return Ok(None);
    };
    let text = match cell {
        Data::Empty => None,
        Data::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Data::Float(v) => Some(v.to_string()),
        Data::Int(v) => Some(v.to_string()),
        Data::Bool(v) => Some(v.to_string()),
        Data::DateTime(dt) => Some(
            dt.as_datetime()
                .context("unrepresentable datetime cell")?
                .format("%Y-%m-%d %H:%M:%S%.f")
                .to_string(),
        ),
        Data::DateTimeIso(s) => Some(s.clone()),
        Data::DurationIso(s) => Some(s.clone()),
        Data::Error(e) => bail!("cell error: {e:?}"),
    };
    Ok(text)
}

fn read_excel_rows(path: &Path) -> Result<Vec<Result<RawRow>>> {
    let mut workbook = open_workbook_auto(path).context("failed to open workbook")?;
    let range = workbook
        .worksheet_range(DATA_SHEET)
        .with_context(|| format!("missing sheet {DATA_SHEET:?}"))?;

    let mut rows_iter = range.rows();
    let headers: Vec<String> = rows_iter
        .next()
        .context("sheet has no header row")?
        .iter()
        .map(|cell| match cell {
            Data::String(s) => s.trim().to_string(),
            Data::Empty => String::new(),
            other => format!("{other}"),
        })
        .collect();

    let column = |name: &str| headers.iter().position(|h| h == name);
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| column(c).is_none())
        .collect();
    if !missing.is_empty() {
        bail!("missing required columns: {missing:?}");
    }

    let idx_ship = column("id_ship");
    let idx_datetime = column("datetime");
    let idx_created = column("datetime_created");
    let idx_data = column("data");

    let rows = rows_iter
        .map(|row| {
            Ok(RawRow {
                id_ship: cell_text(row, idx_ship)?,
                datetime: cell_text(row, idx_datetime)?,
                datetime_created: cell_text(row, idx_created)?,
                data: cell_text(row, idx_data)?,
            })
        })
        .collect();
    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct CsvSourceRow {
    id_ship: Option<String>,
    datetime: Option<String>,
    #[serde(default)]
    datetime_created: Option<String>,
    data: Option<String>,
}

fn read_csv_rows(path: &Path) -> Result<Vec<Result<RawRow>>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .context("failed to open csv file")?;

    let headers: Vec<String> = reader
        .headers()
        .context("failed to read csv headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !headers.iter().any(|h| h == c))
        .collect();
    if !missing.is_empty() {
        bail!("missing required columns: {missing:?}");
    }

    let rows = reader
        .deserialize::<CsvSourceRow>()
        .map(|result| {
            result
                .map(|row| RawRow {
                    id_ship: row.id_ship.filter(|s| !s.is_empty()),
                    datetime: row.datetime.filter(|s| !s.is_empty()),
                    datetime_created: row.datetime_created.filter(|s| !s.is_empty()),
                    data: row.data.filter(|s| !s.is_empty()),
                })
                .map_err(anyhow::Error::from)
        })
        .collect();
    Ok(rows)
}

fn read_source_rows(path: &Path) -> Result<Vec<Result<RawRow>>> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "xlsx" | "xls" => read_excel_rows(path),
        "csv" => read_csv_rows(path),
        other => bail!("unsupported file extension {other:?}"),
    }
}

/// Turns raw rows into destination records. Row-level problems are counted
/// and skipped, never propagated: missing required values and unparsable
/// embedded data are validation errors, unreadable cells are processing
/// errors. Row numbers in logs are 1-based and include the header row.
fn process_rows(rows: Vec<Result<RawRow>>, source_name: &str) -> (Vec<ProcessedRecord>, FileStats) {
    let mut stats = FileStats {
        total_rows: rows.len(),
        ..Default::default()
    };
    let mut records = Vec::new();

    for (idx, row) in rows.into_iter().enumerate() {
        let row_number = idx + 2;
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                error!(file = source_name, row = row_number, error = %e, "failed to read row");
                stats.processing_errors += 1;
                continue;
            }
        };

        let (Some(ship_id), Some(datetime), Some(data)) = (row.id_ship, row.datetime, row.data)
        else {
            warn!(file = source_name, row = row_number, "blank required values");
            stats.validation_errors += 1;
            continue;
        };

        let fields = parse_data_column(&data, row_number);
        if fields.is_empty() {
            warn!(file = source_name, row = row_number, "no usable sensor data");
            stats.validation_errors += 1;
            continue;
        }

        records.push(ProcessedRecord::from_validated(
            ship_id,
            datetime,
            row.datetime_created,
            &fields,
            source_name,
        ));
        stats.processed += 1;
    }

    (records, stats)
}

/// Processes one source file into destination records. Row-level problems
/// never escape; only a file-level failure (unreadable file, missing sheet
/// or columns) yields an empty batch, logged as a critical error.
fn process_file(path: &Path) -> Vec<ProcessedRecord> {
    let source_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    if let Ok(meta) = fs::metadata(path) {
        info!(file = %source_name, size_bytes = meta.len(), "processing source file");
    }

    let rows = match read_source_rows(path) {
        Ok(rows) => rows,
        Err(e) => {
            error!(file = %source_name, error = %e, "critical failure reading source file");
            return Vec::new();
        }
    };
    info!(file = %source_name, rows = rows.len(), "loaded rows");

    let (records, stats) = process_rows(rows, &source_name);
    info!(
        file = %source_name,
        total = stats.total_rows,
        processed = stats.processed,
        validation_errors = stats.validation_errors,
        processing_errors = stats.processing_errors,
        success_rate_pct = stats.success_rate(),
        "file processing statistics"
    );
    records
}

// =============================================================================
// Dimension resolution
// =============================================================================

fn truncate_to_minute(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Calendar attributes derived from a minute-truncated timestamp.
/// day_of_week is Monday=1 .. Sunday=7; weekends are days 6 and 7.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CalendarParts {
    date: NaiveDate,
    year: i32,
    month: i32,
    day: i32,
    hour: i32,
    minute: i32,
    quarter: i32,
    week_of_year: i32,
    day_of_week: i32,
    is_weekend: bool,
}

impl CalendarParts {
    fn derive(ts: NaiveDateTime) -> Self {
        let day_of_week = ts.weekday().number_from_monday() as i32;
        Self {
            date: ts.date(),
            year: ts.year(),
            month: ts.month() as i32,
            day: ts.day() as i32,
            hour: ts.hour() as i32,
            minute: ts.minute() as i32,
            quarter: (ts.month() as i32 - 1) / 3 + 1,
            week_of_year: ts.iso_week().week() as i32,
            day_of_week,
            is_weekend: day_of_week >= 6,
        }
    }
}

/// Returns the existing ship key or creates the dimension row. Lookup and
/// insert run in one transaction; a concurrent duplicate insert fails on the
/// primary key rather than corrupting the dimension.
async fn get_or_create_ship(pool: &PgPool, ship_id: &str) -> Result<String> {
    let mut tx = pool.begin().await?;

    let existing: Option<(String,)> =
        sqlx::query_as("SELECT ship_id FROM d_ship WHERE ship_id = $1")
            .bind(ship_id)
            .fetch_optional(&mut *tx)
            .await?;
    if let Some((id,)) = existing {
        tx.commit().await?;
        return Ok(id);
    }

    sqlx::query("INSERT INTO d_ship (ship_id) VALUES ($1)")
        .bind(ship_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(ship_id, "created ship dimension row");
    Ok(ship_id.to_string())
}

/// Returns the existing calendar key for the timestamp's minute or creates
/// the dimension row. Sub-minute differences collapse onto one key.
async fn get_or_create_datetime(pool: &PgPool, timestamp: NaiveDateTime) -> Result<NaiveDateTime> {
    let truncated = truncate_to_minute(timestamp);
    let parts = CalendarParts::derive(truncated);
    let mut tx = pool.begin().await?;

    let existing: Option<(NaiveDateTime,)> = sqlx::query_as(
        "SELECT datetime_id FROM d_calendar \
         WHERE year = $1 AND month = $2 AND day = $3 AND hour = $4 AND minute = $5",
    )
    .bind(parts.year)
    .bind(parts.month)
    .bind(parts.day)
    .bind(parts.hour)
    .bind(parts.minute)
    .fetch_optional(&mut *tx)
    .await?;
    if let Some((id,)) = existing {
        tx.commit().await?;
        return Ok(id);
    }

    sqlx::query(
        "INSERT INTO d_calendar (\
             datetime_id, date, year, month, day, hour, minute, \
             quarter, week_of_year, day_of_week, is_weekend\
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(truncated)
    .bind(parts.date)
    .bind(parts.year)
    .bind(parts.month)
    .bind(parts.day)
    .bind(parts.hour)
    .bind(parts.minute)
    .bind(parts.quarter)
    .bind(parts.week_of_year)
    .bind(parts.day_of_week)
    .bind(parts.is_weekend)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    info!(timestamp = %truncated, "created calendar dimension row");
    Ok(truncated)
}

// =============================================================================
// Bulk loading
// =============================================================================

const BATCH_SIZE: usize = 1000;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
];

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

/// Dimension keys already resolved during this load; repeated natural keys
/// are served from memory instead of re-querying.
#[derive(Debug, Default)]
struct DimensionCache {
    ships: HashMap<String, String>,
    calendar: HashMap<NaiveDateTime, NaiveDateTime>,
}

#[derive(Debug)]
struct FactRow {
    ship_id: String,
    datetime_id: NaiveDateTime,
    original_datetime: NaiveDateTime,
    record: ProcessedRecord,
}

/// Resolves dimension keys for one batch. Records whose timestamp fails
/// every accepted format are skipped with a warning.
async fn prepare_bulk_rows(
    pool: &PgPool,
    batch: &[ProcessedRecord],
    cache: &mut DimensionCache,
) -> Result<Vec<FactRow>> {
    let mut rows = Vec::with_capacity(batch.len());

    for record in batch {
        let Some(timestamp) = parse_timestamp(&record.datetime) else {
            warn!(ship_id = %record.ship_id, datetime = %record.datetime, "invalid timestamp, skipping record");
            continue;
        };

        let ship_id = match cache.ships.get(&record.ship_id) {
            Some(id) => id.clone(),
            None => {
                let id = get_or_create_ship(pool, &record.ship_id).await?;
                cache.ships.insert(record.ship_id.clone(), id.clone());
                id
            }
        };

        let truncated = truncate_to_minute(timestamp);
        let datetime_id = match cache.calendar.get(&truncated) {
            Some(id) => *id,
            None => {
                let id = get_or_create_datetime(pool, timestamp).await?;
                cache.calendar.insert(truncated, id);
                id
            }
        };

        rows.push(FactRow {
            ship_id,
            datetime_id,
            original_datetime: timestamp,
            record: record.clone(),
        });
    }

    Ok(rows)
}

async fn insert_fact_rows(tx: &mut Transaction<'_, Postgres>, rows: &[FactRow]) -> Result<()> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO f_data (\
             ship_id, datetime_id, latitude, longitude, \
             wind_direction, wind_speed, air_temperature, \
             tank0_liquid_volume, tank0_max_volume, tank0_percentage, \
             tank1_liquid_volume, tank1_max_volume, tank1_percentage, \
             tank2_liquid_volume, tank2_max_volume, tank2_percentage, \
             tank3_liquid_volume, tank3_max_volume, tank3_percentage, \
             tank4_liquid_volume, tank4_max_volume, tank4_percentage, \
             tank0_vapor_pressure, tank0_vapor_temperature, \
             tank1_vapor_pressure, tank1_vapor_temperature, \
             tank2_vapor_pressure, tank2_vapor_temperature, \
             tank3_vapor_pressure, tank3_vapor_temperature, \
             tank4_vapor_pressure, tank4_vapor_temperature, \
             data_source, original_datetime\
         ) ",
    );
    builder.push_values(rows, |mut b, row| {
        let r = &row.record;
        b.push_bind(&row.ship_id)
            .push_bind(row.datetime_id)
            .push_bind(r.latitude)
            .push_bind(r.longitude)
            .push_bind(r.wind_direction)
            .push_bind(r.wind_speed)
            .push_bind(r.air_temperature)
            .push_bind(r.tank0_liquid_volume)
            .push_bind(r.tank0_max_volume)
            .push_bind(r.tank0_percentage)
            .push_bind(r.tank1_liquid_volume)
            .push_bind(r.tank1_max_volume)
            .push_bind(r.tank1_percentage)
            .push_bind(r.tank2_liquid_volume)
            .push_bind(r.tank2_max_volume)
            .push_bind(r.tank2_percentage)
            .push_bind(r.tank3_liquid_volume)
            .push_bind(r.tank3_max_volume)
            .push_bind(r.tank3_percentage)
            .push_bind(r.tank4_liquid_volume)
            .push_bind(r.tank4_max_volume)
            .push_bind(r.tank4_percentage)
            .push_bind(r.tank0_vapor_pressure)
            .push_bind(r.tank0_vapor_temperature)
            .push_bind(r.tank1_vapor_pressure)
            .push_bind(r.tank1_vapor_temperature)
            .push_bind(r.tank2_vapor_pressure)
            .push_bind(r.tank2_vapor_temperature)
            .push_bind(r.tank3_vapor_pressure)
            .push_bind(r.tank3_vapor_temperature)
            .push_bind(r.tank4_vapor_pressure)
            .push_bind(r.tank4_vapor_temperature)
            .push_bind(&r.data_source)
            .push_bind(row.original_datetime);
    });
    builder.push(" ON CONFLICT (ship_id, datetime_id) DO NOTHING");
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

/// Loads processed records in duplicate-safe batches, committing each batch
/// independently. Returns the number of records submitted; rows dropped by
/// the conflict policy are not distinguishable from inserted ones. Batch
/// failures are skipped; anything outside the per-batch guard rolls back the
/// in-flight transaction and propagates with the loaded count attached.
async fn load_records(pool: &PgPool, records: &[ProcessedRecord]) -> Result<u64> {
    if records.is_empty() {
        warn!("no records to load");
        return Ok(0);
    }

    let mut records_loaded: u64 = 0;
    let mut cache = DimensionCache::default();

    for (batch_index, batch) in records.chunks(BATCH_SIZE).enumerate() {
        let batch_number = batch_index + 1;
        info!(batch = batch_number, rows = batch.len(), "loading batch");

        let rows = match prepare_bulk_rows(pool, batch, &mut cache).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(batch = batch_number, error = %e, "failed to prepare batch, skipping");
                continue;
            }
        };
        if rows.is_empty() {
            warn!(batch = batch_number, "no valid rows in batch");
            continue;
        }

        let mut tx = pool
            .begin()
            .await
            .with_context(|| format!("bulk load failed after {records_loaded} records"))?;
        match insert_fact_rows(&mut tx, &rows).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .with_context(|| format!("bulk load failed after {records_loaded} records"))?;
                records_loaded += rows.len() as u64;
                info!(
                    batch = batch_number,
                    rows = rows.len(),
                    "committed batch (duplicates skipped automatically)"
                );
            }
            Err(e) => {
                error!(batch = batch_number, error = %e, "bulk insert failed, skipping batch");
                tx.rollback().await.ok();
                continue;
            }
        }
    }

    info!(records = records_loaded, "bulk load complete");
    Ok(records_loaded)
}

// =============================================================================
// Schema management
// =============================================================================

const SCHEMA_SQL: &str = include_str!("../sql/create_schema.sql");
const REQUIRED_TABLES: &[&str] = &["d_ship", "d_calendar", "f_data"];

async fn validate_database_schema(pool: &PgPool) -> Result<bool> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
    )
    .fetch_all(pool)
    .await
    .context("failed to inspect database schema")?;

    let existing: HashSet<&str> = rows.iter().map(|(name,)| name.as_str()).collect();
    let missing: Vec<&str> = REQUIRED_TABLES
        .iter()
        .copied()
        .filter(|t| !existing.contains(t))
        .collect();
    if missing.is_empty() {
        info!("database schema validation passed");
        Ok(true)
    } else {
        warn!(?missing, "required tables are missing");
        Ok(false)
    }
}

async fn create_database_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("failed to create database schema")?;
    info!("database schema created");
    Ok(())
}

/// Connects and makes sure the star schema exists; creating it on miss.
/// Any failure here is fatal for the run.
async fn connect_to_db(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to database")?;
    info!("connected to PostgreSQL");

    if !validate_database_schema(&pool).await? {
        info!("attempting to create missing database schema");
        create_database_schema(&pool).await?;
        if !validate_database_schema(&pool).await? {
            bail!("database schema could not be created");
        }
    }
    Ok(pool)
}

// =============================================================================
// File discovery & orchestration
// =============================================================================

/// Lists candidate source files: case-insensitive extension match,
/// deduplicated, sorted. Empty or unreadable files are skipped with a
/// warning; a missing or non-directory path is fatal for the run.
fn discover_source_files(folder: &Path) -> Result<Vec<PathBuf>> {
    if !folder.exists() {
        bail!("data folder {} does not exist", folder.display());
    }
    if !folder.is_dir() {
        bail!("{} is not a directory", folder.display());
    }

    let entries = fs::read_dir(folder)
        .with_context(|| format!("cannot read data folder {}", folder.display()))?;
    let mut candidates = BTreeSet::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("cannot read entry in {}", folder.display()))?;
        let path = entry.path();
        let Some(ext) = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
        else {
            continue;
        };
        if !SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                candidates.insert(path);
            }
            Ok(_) => warn!(file = %path.display(), "skipping empty or invalid file"),
            Err(e) => warn!(file = %path.display(), error = %e, "cannot access file"),
        }
    }

    let files: Vec<PathBuf> = candidates.into_iter().collect();
    if files.is_empty() {
        warn!(
            folder = %folder.display(),
            extensions = ?SPREADSHEET_EXTENSIONS,
            "no source files found"
        );
    } else {
        info!(folder = %folder.display(), count = files.len(), "found source files");
        for path in files.iter().take(5) {
            info!(file = %path.display(), "queued");
        }
        if files.len() > 5 {
            info!(more = files.len() - 5, "additional files queued");
        }
    }
    Ok(files)
}

/// Drives the whole run: one file at a time, in order. A file that fails to
/// load is logged and skipped; discovery failures abort the run.
async fn run_etl(pool: &PgPool, data_folder: &Path, dry_run: bool) -> Result<()> {
    let files = discover_source_files(data_folder)?;
    let total_files = files.len();
    let mut total_records: u64 = 0;

    info!(files = total_files, "starting ETL run");
    for (i, path) in files.iter().enumerate() {
        let position = i + 1;
        info!(file = %path.display(), position, total_files, "processing file");

        let records = process_file(path);
        if records.is_empty() {
            warn!(file = %path.display(), position, "skipped: no valid records");
            continue;
        }

        if dry_run {
            info!(file = %path.display(), records = records.len(), "dry run, skipping load");
            total_records += records.len() as u64;
            continue;
        }

        match load_records(pool, &records).await {
            Ok(count) => {
                total_records += count;
                info!(file = %path.display(), position, records = count, "file loaded");
            }
            Err(e) => {
                error!(file = %path.display(), position, error = %e, "file failed, continuing");
            }
        }
    }

    info!(total_records, dry_run, "ETL run complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::from_env(&args)?;

    info!(
        data_folder = %config.data_folder.display(),
        dry_run = args.dry_run,
        "starting ship telemetry ETL"
    );

    let pool = connect_to_db(&config.database_url).await?;

    if let Err(e) = run_etl(&pool, &config.data_folder, args.dry_run).await {
        error!(error = %e, "ETL run failed");
        return Err(e);
    }

    pool.close().await;
    info!("ETL finished");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // ROUNDING - the mode is half away from zero, pinned here
    // -------------------------------------------------------------------------

    #[test]
    fn test_round_to_six_decimals() {
        assert_eq!(round_to(45.123456789, 6), 45.123457);
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_to(0.125, 2), 0.13);
        assert_eq!(round_to(-0.125, 2), -0.13);
        assert_eq!(round_to(2.5, 0), 3.0);
        assert_eq!(round_to(-2.5, 0), -3.0);
    }

    #[test]
    fn test_round_noop_when_already_exact() {
        assert_eq!(round_to(45.12, 2), 45.12);
        assert_eq!(round_to(-180.0, 6), -180.0);
    }

    // -------------------------------------------------------------------------
    // FIELD VALIDATION
    // -------------------------------------------------------------------------

    fn raw_map(entries: &[(&str, LiteralValue)]) -> HashMap<String, LiteralValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_out_of_range_dropped_not_clamped() {
        let raw = raw_map(&[("LAT", LiteralValue::Number(95.2))]);
        let validated = validate_sensor_fields(&raw, 2);
        assert!(validated.is_empty());
    }

    #[test]
    fn test_accepted_value_rounded_to_precision() {
        let raw = raw_map(&[("LAT", LiteralValue::Number(45.123456789))]);
        let validated = validate_sensor_fields(&raw, 2);
        assert_eq!(validated.get("latitude"), Some(&45.123457));
    }

    #[test]
    fn test_every_rule_accepts_bounds_and_rejects_outside() {
        for rule in VALIDATION_RULES {
            for bound in [rule.min, rule.max] {
                let raw = raw_map(&[(rule.source, LiteralValue::Number(bound))]);
                let validated = validate_sensor_fields(&raw, 2);
                let value = validated
                    .get(rule.target)
                    .unwrap_or_else(|| panic!("{} rejected its own bound {}", rule.source, bound));
                assert!((value - bound).abs() < 1e-9, "{}: {} != {}", rule.source, value, bound);
            }
            for outside in [rule.min - 1.0, rule.max + 1.0] {
                let raw = raw_map(&[(rule.source, LiteralValue::Number(outside))]);
                let validated = validate_sensor_fields(&raw, 2);
                assert!(
                    !validated.contains_key(rule.target),
                    "{} accepted out-of-range {}",
                    rule.source,
                    outside
                );
            }
        }
    }

    #[test]
    fn test_numeric_strings_are_converted() {
        let raw = raw_map(&[("WINSPE", LiteralValue::Text("7.25".to_string()))]);
        let validated = validate_sensor_fields(&raw, 2);
        assert_eq!(validated.get("wind_speed"), Some(&7.25));
    }

    #[test]
    fn test_malformed_string_dropped() {
        let raw = raw_map(&[("WINSPE", LiteralValue::Text("fast".to_string()))]);
        let validated = validate_sensor_fields(&raw, 2);
        assert!(validated.is_empty());
    }

    #[test]
    fn test_null_values_skipped() {
        let raw = raw_map(&[
            ("LAT", LiteralValue::Null),
            ("LON", LiteralValue::Number(10.0)),
        ]);
        let validated = validate_sensor_fields(&raw, 2);
        assert!(!validated.contains_key("latitude"));
        assert_eq!(validated.get("longitude"), Some(&10.0));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let raw = raw_map(&[("SPEED_OVER_GROUND", LiteralValue::Number(11.0))]);
        let validated = validate_sensor_fields(&raw, 2);
        assert!(validated.is_empty());
    }

    #[test]
    fn test_nan_string_rejected_by_range_check() {
        let raw = raw_map(&[("LAT", LiteralValue::Text("nan".to_string()))]);
        let validated = validate_sensor_fields(&raw, 2);
        assert!(validated.is_empty());
    }

    #[test]
    fn test_bool_converts_like_float() {
        let raw = raw_map(&[("WINSPE", LiteralValue::Bool(true))]);
        let validated = validate_sensor_fields(&raw, 2);
        assert_eq!(validated.get("wind_speed"), Some(&1.0));
    }

    // -------------------------------------------------------------------------
    // EMBEDDED RECORD PARSER
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_basic_record() {
        let record = parse_record_literal("{'LAT': 69.1, 'LON': 33.5}").unwrap();
        assert_eq!(record.get("LAT"), Some(&LiteralValue::Number(69.1)));
        assert_eq!(record.get("LON"), Some(&LiteralValue::Number(33.5)));
    }

    #[test]
    fn test_parse_double_quoted_keys() {
        let record = parse_record_literal("{\"LAT\": -12.5}").unwrap();
        assert_eq!(record.get("LAT"), Some(&LiteralValue::Number(-12.5)));
    }

    #[test]
    fn test_parse_number_shapes() {
        let record =
            parse_record_literal("{'A': 1, 'B': -2.5, 'C': +3., 'D': 1.5e2, 'E': .25}").unwrap();
        assert_eq!(record.get("A"), Some(&LiteralValue::Number(1.0)));
        assert_eq!(record.get("B"), Some(&LiteralValue::Number(-2.5)));
        assert_eq!(record.get("C"), Some(&LiteralValue::Number(3.0)));
        assert_eq!(record.get("D"), Some(&LiteralValue::Number(150.0)));
        assert_eq!(record.get("E"), Some(&LiteralValue::Number(0.25)));
    }

    #[test]
    fn test_parse_keyword_values() {
        let record =
            parse_record_literal("{'A': None, 'B': True, 'C': False, 'D': 'idle'}").unwrap();
        assert_eq!(record.get("A"), Some(&LiteralValue::Null));
        assert_eq!(record.get("B"), Some(&LiteralValue::Bool(true)));
        assert_eq!(record.get("C"), Some(&LiteralValue::Bool(false)));
        assert_eq!(record.get("D"), Some(&LiteralValue::Text("idle".to_string())));
    }

    #[test]
    fn test_parse_trailing_comma_and_empty() {
        assert_eq!(parse_record_literal("{'A': 1,}").unwrap().len(), 1);
        assert!(parse_record_literal("{}").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_trailing_junk() {
        assert!(parse_record_literal("{'A': 1} extra").is_err());
    }

    #[test]
    fn test_parse_rejects_nesting() {
        assert!(parse_record_literal("{'A': {'B': 1}}").is_err());
    }

    #[test]
    fn test_parse_rejects_unquoted_keys_and_calls() {
        assert!(parse_record_literal("{LAT: 1}").is_err());
        assert!(parse_record_literal("{'A': float('nan')}").is_err());
        assert!(parse_record_literal("{'A' 1}").is_err());
        assert!(parse_record_literal("{'A': 1").is_err());
    }

    #[test]
    fn test_parse_data_column_strips_export_quoting() {
        let validated = parse_data_column("\"{'LAT': 45.2}\"", 2);
        assert_eq!(validated.get("latitude"), Some(&45.2));

        let validated = parse_data_column("{\"\"LAT\"\": 45.2}", 2);
        assert_eq!(validated.get("latitude"), Some(&45.2));
    }

    #[test]
    fn test_parse_data_column_degrades_to_empty() {
        assert!(parse_data_column("not a record", 2).is_empty());
        assert!(parse_data_column("", 2).is_empty());
        assert!(parse_data_column("{'LAT': }", 2).is_empty());
    }

    #[test]
    fn test_parse_data_column_is_deterministic() {
        let input = "{'LAT': 45.123456789, 'WINSPE': 12.345, 'CTNK0_MAX_PERC': 50.0}";
        let first = parse_data_column(input, 2);
        let second = parse_data_column(input, 2);
        assert_eq!(first, second);
        assert_eq!(first.get("latitude"), Some(&45.123457));
    }

    // -------------------------------------------------------------------------
    // RECORD MATERIALIZATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_tank_percentage_source_keys() {
        let raw = raw_map(&[
            ("CTNK0_MAX_PERC", LiteralValue::Number(50.0)),
            ("CTNK1_PERC", LiteralValue::Number(60.0)),
        ]);
        let validated = validate_sensor_fields(&raw, 2);
        let record = ProcessedRecord::from_validated(
            "SHIP-1".to_string(),
            "2022-01-01 10:00:00".to_string(),
            None,
            &validated,
            "test.csv",
        );
        assert_eq!(record.tank0_percentage, Some(50.0));
        assert_eq!(record.tank1_percentage, Some(60.0));
        assert_eq!(record.tank2_percentage, None);
        assert_eq!(record.data_source, "test.csv");
    }

    // -------------------------------------------------------------------------
    // FILE PROCESSING
    // -------------------------------------------------------------------------

    fn write_csv(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_process_well_formed_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "export.csv",
            "id_ship,datetime,datetime_created,data\n\
             SHIP-1,2022-01-01 10:00:00,2022-01-01 10:05:00,\"{'LAT': 69.1, 'LON': 33.5}\"\n\
             SHIP-2,2022-01-01 10:01:00,2022-01-01 10:05:00,\"{'WINSPE': 12.0}\"\n",
        );

        let records = process_file(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ship_id, "SHIP-1");
        assert_eq!(records[0].latitude, Some(69.1));
        assert_eq!(records[0].longitude, Some(33.5));
        assert_eq!(records[0].datetime_created.as_deref(), Some("2022-01-01 10:05:00"));
        assert_eq!(records[0].data_source, "export.csv");
        assert_eq!(records[1].wind_speed, Some(12.0));
        assert_eq!(records[1].latitude, None);
    }

    #[test]
    fn test_process_rows_counts_error_kinds() {
        let rows = vec![
            Ok(RawRow {
                id_ship: Some("SHIP-1".to_string()),
                datetime: Some("2022-01-01 10:00:00".to_string()),
                datetime_created: None,
                data: Some("{'LAT': 69.1}".to_string()),
            }),
            // blank required value
            Ok(RawRow {
                id_ship: None,
                datetime: Some("2022-01-01 10:01:00".to_string()),
                datetime_created: None,
                data: Some("{'LAT': 69.1}".to_string()),
            }),
            // malformed embedded record
            Ok(RawRow {
                id_ship: Some("SHIP-1".to_string()),
                datetime: Some("2022-01-01 10:02:00".to_string()),
                datetime_created: None,
                data: Some("garbage".to_string()),
            }),
            // every field out of range
            Ok(RawRow {
                id_ship: Some("SHIP-1".to_string()),
                datetime: Some("2022-01-01 10:03:00".to_string()),
                datetime_created: None,
                data: Some("{'LAT': 95.2}".to_string()),
            }),
            Err(anyhow::anyhow!("cell error")),
        ];

        let (records, stats) = process_rows(rows, "export.csv");
        assert_eq!(records.len(), 1);
        assert_eq!(stats.total_rows, 5);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.validation_errors, 3);
        assert_eq!(stats.processing_errors, 1);
        assert!((stats.success_rate() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_rows_invalid_yields_empty_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "bad.csv",
            "id_ship,datetime,datetime_created,data\n\
             SHIP-1,2022-01-01 10:00:00,,not a record\n\
             SHIP-2,2022-01-01 10:01:00,,also garbage\n",
        );

        let records = process_file(&path);
        assert!(records.is_empty());
    }

    #[test]
    fn test_missing_required_column_is_file_level_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "headers.csv",
            "id_ship,datetime\nSHIP-1,2022-01-01 10:00:00\n",
        );

        let records = process_file(&path);
        assert!(records.is_empty());
    }

    #[test]
    fn test_short_row_is_processing_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "short.csv",
            "id_ship,datetime,datetime_created,data\nSHIP-1,2022-01-01 10:00:00\n",
        );
        let rows = read_csv_rows(&path).unwrap();
        let (records, stats) = process_rows(rows, "short.csv");
        assert!(records.is_empty());
        assert_eq!(stats.processing_errors, 1);
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        assert!(read_source_rows(Path::new("readings.parquet")).is_err());
    }

    #[test]
    fn test_success_rate_of_empty_file_is_zero() {
        let stats = FileStats::default();
        assert_eq!(stats.success_rate(), 0.0);
    }

    // -------------------------------------------------------------------------
    // CALENDAR DERIVATION
    // -------------------------------------------------------------------------

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_truncate_to_minute_collapses_seconds() {
        let a = truncate_to_minute(ts(2022, 1, 1, 10, 15, 30));
        let b = truncate_to_minute(ts(2022, 1, 1, 10, 15, 59));
        let c = truncate_to_minute(ts(2022, 1, 1, 10, 16, 0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, ts(2022, 1, 1, 10, 15, 0));
    }

    #[test]
    fn test_calendar_quarters() {
        assert_eq!(CalendarParts::derive(ts(2022, 1, 5, 0, 0, 0)).quarter, 1);
        assert_eq!(CalendarParts::derive(ts(2022, 3, 31, 0, 0, 0)).quarter, 1);
        assert_eq!(CalendarParts::derive(ts(2022, 4, 1, 0, 0, 0)).quarter, 2);
        assert_eq!(CalendarParts::derive(ts(2022, 6, 30, 0, 0, 0)).quarter, 2);
        assert_eq!(CalendarParts::derive(ts(2022, 12, 31, 0, 0, 0)).quarter, 4);
    }

    #[test]
    fn test_calendar_day_of_week_monday_is_one() {
        // 2024-01-01 was a Monday
        let monday = CalendarParts::derive(ts(2024, 1, 1, 12, 0, 0));
        assert_eq!(monday.day_of_week, 1);
        assert!(!monday.is_weekend);

        let friday = CalendarParts::derive(ts(2024, 1, 5, 12, 0, 0));
        assert_eq!(friday.day_of_week, 5);
        assert!(!friday.is_weekend);

        let saturday = CalendarParts::derive(ts(2024, 1, 6, 12, 0, 0));
        assert_eq!(saturday.day_of_week, 6);
        assert!(saturday.is_weekend);

        let sunday = CalendarParts::derive(ts(2024, 1, 7, 12, 0, 0));
        assert_eq!(sunday.day_of_week, 7);
        assert!(sunday.is_weekend);
    }

    #[test]
    fn test_calendar_iso_week_across_year_boundary() {
        // 2022-01-01 falls in ISO week 52 of 2021
        assert_eq!(CalendarParts::derive(ts(2022, 1, 1, 0, 0, 0)).week_of_year, 52);
        // 2024-12-30 falls in ISO week 1 of 2025
        assert_eq!(CalendarParts::derive(ts(2024, 12, 30, 0, 0, 0)).week_of_year, 1);
    }

    #[test]
    fn test_calendar_parts_fields() {
        let parts = CalendarParts::derive(ts(2022, 5, 17, 9, 41, 0));
        assert_eq!(parts.date, NaiveDate::from_ymd_opt(2022, 5, 17).unwrap());
        assert_eq!(parts.year, 2022);
        assert_eq!(parts.month, 5);
        assert_eq!(parts.day, 17);
        assert_eq!(parts.hour, 9);
        assert_eq!(parts.minute, 41);
        assert_eq!(parts.quarter, 2);
    }

    // -------------------------------------------------------------------------
    // TIMESTAMP PARSING
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(
            parse_timestamp("2022-01-01 10:15:30"),
            Some(ts(2022, 1, 1, 10, 15, 30))
        );
        assert_eq!(
            parse_timestamp("2022-01-01T10:15:30"),
            Some(ts(2022, 1, 1, 10, 15, 30))
        );
        assert_eq!(
            parse_timestamp("2022-01-01 10:15"),
            Some(ts(2022, 1, 1, 10, 15, 0))
        );
        assert_eq!(
            parse_timestamp("17/05/2022 09:41:00"),
            Some(ts(2022, 5, 17, 9, 41, 0))
        );
        assert_eq!(
            parse_timestamp(" 2022-01-01 10:15:30.250 "),
            NaiveDate::from_ymd_opt(2022, 1, 1)
                .unwrap()
                .and_hms_milli_opt(10, 15, 30, 250)
        );
        assert_eq!(parse_timestamp("soon"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    // -------------------------------------------------------------------------
    // FILE DISCOVERY
    // -------------------------------------------------------------------------

    #[test]
    fn test_discover_matches_extensions_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.XLSX"), b"stub").unwrap();
        fs::write(dir.path().join("a.csv"), b"stub").unwrap();
        fs::write(dir.path().join("notes.txt"), b"stub").unwrap();
        fs::write(dir.path().join("empty.xlsx"), b"").unwrap();

        let files = discover_source_files(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.csv", "b.XLSX"]);
    }

    #[test]
    fn test_discover_missing_folder_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_source_files(&dir.path().join("nope")).is_err());

        let file = dir.path().join("data.csv");
        fs::write(&file, b"stub").unwrap();
        assert!(discover_source_files(&file).is_err());
    }

    // -------------------------------------------------------------------------
    // DATABASE INTEGRATION - require a live PostgreSQL via DATABASE_URL:
    //   cargo test -- --ignored
    // -------------------------------------------------------------------------

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        connect_to_db(&url).await.expect("connect")
    }

    fn unique_suffix() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_resolve_ship_twice_creates_one_row() {
        let pool = test_pool().await;
        let ship_id = format!("TEST-SHIP-{}", unique_suffix());

        let first = get_or_create_ship(&pool, &ship_id).await.unwrap();
        let second = get_or_create_ship(&pool, &ship_id).await.unwrap();
        assert_eq!(first, second);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM d_ship WHERE ship_id = $1")
            .bind(&ship_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_same_minute_resolves_to_same_calendar_key() {
        let pool = test_pool().await;
        // a minute far in the past that real data will never collide with
        let base = ts(1971, 3, 14, 7, (unique_suffix() % 60) as u32, 0);

        let a = get_or_create_datetime(&pool, base + chrono::Duration::seconds(15))
            .await
            .unwrap();
        let b = get_or_create_datetime(&pool, base + chrono::Duration::seconds(45))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, base);

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM d_calendar WHERE datetime_id = $1")
                .bind(base)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database"]
    async fn test_reloading_same_batch_is_idempotent() {
        let pool = test_pool().await;
        let ship_id = format!("TEST-SHIP-{}", unique_suffix());

        let raw = raw_map(&[("LAT", LiteralValue::Number(69.1))]);
        let validated = validate_sensor_fields(&raw, 2);
        let record = ProcessedRecord::from_validated(
            ship_id.clone(),
            "2022-01-01 10:15:30".to_string(),
            None,
            &validated,
            "test.csv",
        );

        let submitted = load_records(&pool, std::slice::from_ref(&record)).await.unwrap();
        assert_eq!(submitted, 1);
        // second load submits again but the conflict policy drops the row
        load_records(&pool, std::slice::from_ref(&record)).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM f_data WHERE ship_id = $1")
            .bind(&ship_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
