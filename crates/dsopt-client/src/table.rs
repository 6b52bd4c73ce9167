//! Typed tables parsed from result archive members.
//!
//! Table support is a capability: [`TableReader`] implementations decide the
//! table type, and [`NoTables`] stands in when no table library is wanted.

use std::convert::Infallible;

use crate::errors::ClientError;

/// Column type in the result interchange format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Utf8,
    Int32,
    Float32,
}

/// Fixed column types of every result table. Columns not listed are
/// inferred.
pub const INTERCHANGE_COLUMNS: &[(&str, ColumnType)] = &[
    ("image_path", ColumnType::Utf8),
    ("label_path", ColumnType::Utf8),
    ("segments_mask_path", ColumnType::Utf8),
    ("segment_id", ColumnType::Int32),
    ("label", ColumnType::Utf8),
    ("bbox_id", ColumnType::Utf8),
    ("xmin", ColumnType::Float32),
    ("ymin", ColumnType::Float32),
    ("xmax", ColumnType::Float32),
    ("ymax", ColumnType::Float32),
    ("suspect_level", ColumnType::Float32),
    ("suggested_label", ColumnType::Utf8),
    ("suggested_label_conf", ColumnType::Float32),
    ("status", ColumnType::Utf8),
];

/// Header prefix of index columns written without a name.
pub const INDEX_PLACEHOLDER_PREFIX: &str = "Unnamed";

pub fn interchange_type(column: &str) -> Option<ColumnType> {
    INTERCHANGE_COLUMNS
        .iter()
        .find(|(name, _)| *name == column)
        .map(|(_, ty)| *ty)
}

/// Parses CSV archive members into tables.
pub trait TableReader: Send + Sync {
    type Table: Send;

    /// Parses one member. `Ok(None)` means tables are not supported.
    fn read_table(&self, member: &str, bytes: &[u8]) -> Result<Option<Self::Table>, ClientError>;
}

/// Table capability that never produces tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTables;

impl TableReader for NoTables {
    type Table = Infallible;

    fn read_table(&self, _member: &str, _bytes: &[u8]) -> Result<Option<Infallible>, ClientError> {
        Ok(None)
    }
}

#[cfg(feature = "polars")]
pub use polars_tables::{IndexedFrame, PolarsTables};

/// Table capability used when none is chosen explicitly.
#[cfg(feature = "polars")]
pub type DefaultTables = PolarsTables;
#[cfg(not(feature = "polars"))]
pub type DefaultTables = NoTables;

/// Splits the first line off `bytes`, returning the header and the offset
/// where data rows begin.
fn split_header(bytes: &[u8]) -> (&[u8], usize) {
    match bytes.iter().position(|b| *b == b'\n') {
        Some(idx) => {
            let header = &bytes[..idx];
            (header.strip_suffix(b"\r").unwrap_or(header), idx + 1)
        }
        None => (bytes, bytes.len()),
    }
}

/// Splits a CSV header line into field names, honoring double quotes.
fn header_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

fn quote_field(name: &str) -> String {
    if name.contains([',', '"']) {
        format!("\"{}\"", name.replace('"', "\"\""))
    } else {
        name.to_string()
    }
}

/// Gives empty header names the `Unnamed: {position}` placeholder so the
/// index repair step can find them. Returns the column names and the
/// rewritten CSV.
pub(crate) fn normalize_header(bytes: &[u8]) -> Result<(Vec<String>, Vec<u8>), ClientError> {
    let (header, body_start) = split_header(bytes);
    let header = std::str::from_utf8(header)
        .map_err(|e| ClientError::Table(format!("header is not valid UTF-8: {e}")))?;
    let header = header.strip_prefix('\u{feff}').unwrap_or(header);
    let names: Vec<String> = header_fields(header)
        .into_iter()
        .enumerate()
        .map(|(idx, name)| {
            if name.trim().is_empty() {
                format!("{INDEX_PLACEHOLDER_PREFIX}: {idx}")
            } else {
                name
            }
        })
        .collect();
    let mut out = names
        .iter()
        .map(|name| quote_field(name))
        .collect::<Vec<_>>()
        .join(",")
        .into_bytes();
    out.push(b'\n');
    out.extend_from_slice(&bytes[body_start.min(bytes.len())..]);
    Ok((names, out))
}

/// Index placeholder columns in sort order: the first is promoted to the
/// row index, the rest are dropped.
pub(crate) fn index_columns(names: &[String]) -> Vec<&str> {
    let mut found: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| name.starts_with(INDEX_PLACEHOLDER_PREFIX))
        .collect();
    found.sort_unstable();
    found
}

#[cfg(feature = "polars")]
mod polars_tables {
    use std::io::Cursor;
    use std::sync::Arc;

    use polars::prelude::*;

    use super::{ColumnType, TableReader, index_columns, interchange_type, normalize_header};
    use crate::errors::ClientError;

    /// A parsed table with its repaired row index.
    #[derive(Debug, Clone)]
    pub struct IndexedFrame {
        /// Promoted index column, when the file carried one.
        pub index: Option<Column>,
        pub frame: DataFrame,
    }

    impl IndexedFrame {
        pub fn height(&self) -> usize {
            self.frame.height()
        }

        pub fn width(&self) -> usize {
            self.frame.width()
        }
    }

    /// [`TableReader`] backed by polars.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PolarsTables;

    fn dtype(ty: ColumnType) -> DataType {
        match ty {
            ColumnType::Utf8 => DataType::String,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Float32 => DataType::Float32,
        }
    }

    impl TableReader for PolarsTables {
        type Table = IndexedFrame;

        fn read_table(&self, member: &str, bytes: &[u8]) -> Result<Option<IndexedFrame>, ClientError> {
            let table_err = |e: PolarsError| ClientError::Table(format!("{member}: {e}"));
            let (names, csv) = normalize_header(bytes)?;
            let overrides: Schema = names
                .iter()
                .filter_map(|name| {
                    interchange_type(name).map(|ty| (PlSmallStr::from(name.as_str()), dtype(ty)))
                })
                .collect();
            let mut frame = CsvReadOptions::default()
                .with_has_header(true)
                .with_schema_overwrite(Some(Arc::new(overrides)))
                .into_reader_with_file_handle(Cursor::new(csv))
                .finish()
                .map_err(table_err)?;

            let mut placeholders = index_columns(&names).into_iter();
            let index = match placeholders.next() {
                Some(name) => Some(frame.drop_in_place(name).map_err(table_err)?),
                None => None,
            };
            for name in placeholders {
                frame.drop_in_place(name).map_err(table_err)?;
            }
            Ok(Some(IndexedFrame { index, frame }))
        }
    }
}
