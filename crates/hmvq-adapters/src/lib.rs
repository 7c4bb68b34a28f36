//! Table readers: uploaded workbooks and JSON row dumps into `RawTable`.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::Context;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use hmvq_core::{CellValue, RawTable};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info_span};

pub const CRATE_NAME: &str = "hmvq-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// xlsx / xlsm / xlsb / xls / ods; first worksheet, first row is the header.
    Workbook,
    /// Array of objects keyed by column name.
    JsonRows,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unsupported table format: {0}")]
    UnsupportedFormat(String),
    #[error("unreadable workbook: {0}")]
    Workbook(String),
    #[error("workbook has no worksheets")]
    NoWorksheet,
    #[error("malformed JSON rows: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed JSON rows: {0}")]
    JsonShape(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub trait TableReader: Send + Sync {
    fn format(&self) -> TableFormat;
    fn read_bytes(&self, bytes: &[u8]) -> Result<RawTable, AdapterError>;
}

#[derive(Debug, Default)]
pub struct WorkbookReader;

impl TableReader for WorkbookReader {
    fn format(&self) -> TableFormat {
        TableFormat::Workbook
    }

    fn read_bytes(&self, bytes: &[u8]) -> Result<RawTable, AdapterError> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
            .map_err(|e| AdapterError::Workbook(e.to_string()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or(AdapterError::NoWorksheet)?
            .map_err(|e| AdapterError::Workbook(e.to_string()))?;

        let mut rows = range.rows();
        let headers: Vec<String> = rows
            .next()
            .map(|cells| cells.iter().map(|c| c.to_string().trim().to_string()).collect())
            .unwrap_or_default();
        let rows: Vec<Vec<CellValue>> = rows
            .map(|cells| cells.iter().map(cell_from_workbook).collect())
            .collect();
        Ok(RawTable { headers, rows })
    }
}

fn cell_from_workbook(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Error(_) => CellValue::Empty,
        other => CellValue::Text(other.to_string()),
    }
}

#[derive(Debug, Default)]
pub struct JsonRowsReader;

impl TableReader for JsonRowsReader {
    fn format(&self) -> TableFormat {
        TableFormat::JsonRows
    }

    fn read_bytes(&self, bytes: &[u8]) -> Result<RawTable, AdapterError> {
        let value: JsonValue = serde_json::from_slice(bytes)?;
        let JsonValue::Array(items) = value else {
            return Err(AdapterError::JsonShape("expected a top-level array of row objects".into()));
        };

        let mut objects = Vec::with_capacity(items.len());
        let mut headers: Vec<String> = Vec::new();
        for (idx, item) in items.into_iter().enumerate() {
            let JsonValue::Object(map) = item else {
                return Err(AdapterError::JsonShape(format!("row {idx} is not an object")));
            };
            for key in map.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
            objects.push(map);
        }

        let rows: Vec<Vec<CellValue>> = objects
            .iter()
            .map(|map| {
                headers
                    .iter()
                    .map(|h| map.get(h).map(cell_from_json).unwrap_or_default())
                    .collect()
            })
            .collect();
        Ok(RawTable { headers, rows })
    }
}

fn cell_from_json(value: &JsonValue) -> CellValue {
    match value {
        JsonValue::Null => CellValue::Empty,
        JsonValue::Bool(b) => CellValue::Bool(*b),
        JsonValue::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or_default(),
        JsonValue::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Text(other.to_string()),
    }
}

pub fn reader_for_format(format: TableFormat) -> Box<dyn TableReader> {
    match format {
        TableFormat::Workbook => Box::new(WorkbookReader),
        TableFormat::JsonRows => Box::new(JsonRowsReader),
    }
}

pub fn format_for_path(path: impl AsRef<Path>) -> Option<TableFormat> {
    let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(TableFormat::Workbook),
        "json" => Some(TableFormat::JsonRows),
        _ => None,
    }
}

pub fn format_for_content_type(content_type: &str) -> Option<TableFormat> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "application/json" => Some(TableFormat::JsonRows),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        | "application/vnd.ms-excel"
        | "application/vnd.ms-excel.sheet.macroenabled.12"
        | "application/vnd.oasis.opendocument.spreadsheet" => Some(TableFormat::Workbook),
        _ => None,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// An uploaded table plus the digest identifying that upload.
#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub source_name: String,
    pub sha256: String,
    pub format: TableFormat,
    pub table: RawTable,
}

pub fn read_table(
    source_name: impl Into<String>,
    bytes: &[u8],
    format: TableFormat,
) -> Result<LoadedTable, AdapterError> {
    let source_name = source_name.into();
    let _span = info_span!("read_table", source = %source_name, bytes = bytes.len()).entered();
    let table = reader_for_format(format).read_bytes(bytes)?;
    debug!(columns = table.headers.len(), rows = table.rows.len(), "table read");
    Ok(LoadedTable {
        source_name,
        sha256: sha256_hex(bytes),
        format,
        table,
    })
}

pub fn load_table(path: impl AsRef<Path>) -> Result<LoadedTable, AdapterError> {
    let path = path.as_ref();
    let format = format_for_path(path)
        .ok_or_else(|| AdapterError::UnsupportedFormat(path.display().to_string()))?;
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    read_table(name, &bytes, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;

    fn workbook_bytes() -> Vec<u8> {
        let mut workbook = Workbook::new();
        {
            let sheet = workbook.add_worksheet();
            for (col, header) in ["Description", "Corrective Action", "Total Hours", "Year", "Orig. Card #"]
                .iter()
                .enumerate()
            {
                sheet.write_string(0, col as u16, *header).unwrap();
            }
            sheet.write_string(1, 0, "Replace seal").unwrap();
            sheet.write_string(1, 1, "Replaced seal and tested").unwrap();
            sheet.write_number(1, 2, 4.5).unwrap();
            sheet.write_number(1, 3, 2023.0).unwrap();
            sheet.write_number(1, 4, 1001.0).unwrap();
            sheet.write_string(2, 0, "Inspect tire").unwrap();
            sheet.write_number(2, 2, 1.0).unwrap();
        }
        workbook.save_to_buffer().unwrap()
    }

    #[test]
    fn reads_first_worksheet_with_header_row() {
        let loaded = read_table("hmv_data.xlsx", &workbook_bytes(), TableFormat::Workbook).unwrap();
        let table = loaded.table;
        assert_eq!(table.headers[1], "Corrective Action");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0], CellValue::Text("Replace seal".into()));
        assert_eq!(table.rows[0][2], CellValue::Number(4.5));
        assert_eq!(table.rows[1][1], CellValue::Empty);
        assert_eq!(loaded.sha256.len(), 64);
    }

    #[test]
    fn garbage_bytes_are_not_a_workbook() {
        let err = WorkbookReader.read_bytes(b"definitely not a spreadsheet").unwrap_err();
        assert!(matches!(err, AdapterError::Workbook(_)));
    }

    #[test]
    fn json_rows_union_headers_and_map_nulls() {
        let json = br#"[
            {"Description": "Replace seal", "Total Hours": 4, "Year": null},
            {"Description": "Inspect tire", "Corrective Action": "Ok", "Total Hours": "1.5"}
        ]"#;
        let table = JsonRowsReader.read_bytes(json).unwrap();
        assert_eq!(table.headers.len(), 4);
        let hours = table.column_index("Total Hours").unwrap();
        let year = table.column_index("Year").unwrap();
        let action = table.column_index("Corrective Action").unwrap();
        assert_eq!(table.rows[0][hours], CellValue::Number(4.0));
        assert_eq!(table.rows[0][year], CellValue::Empty);
        assert_eq!(table.rows[0][action], CellValue::Empty);
        assert_eq!(table.rows[1][hours], CellValue::Text("1.5".into()));
    }

    #[test]
    fn json_rows_must_be_an_array_of_objects() {
        assert!(matches!(
            JsonRowsReader.read_bytes(br#"{"Description": "x"}"#),
            Err(AdapterError::JsonShape(_))
        ));
        assert!(matches!(
            JsonRowsReader.read_bytes(br#"[1, 2]"#),
            Err(AdapterError::JsonShape(_))
        ));
        assert!(matches!(JsonRowsReader.read_bytes(b"[{"), Err(AdapterError::Json(_))));
    }

    #[test]
    fn formats_resolve_from_extension_and_content_type() {
        assert_eq!(format_for_path("hmv_data.XLSX"), Some(TableFormat::Workbook));
        assert_eq!(format_for_path("rows.json"), Some(TableFormat::JsonRows));
        assert_eq!(format_for_path("notes.txt"), None);
        assert_eq!(
            format_for_content_type("application/json; charset=utf-8"),
            Some(TableFormat::JsonRows)
        );
        assert_eq!(
            format_for_content_type("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
            Some(TableFormat::Workbook)
        );
        assert_eq!(format_for_content_type("text/plain"), None);
    }

    #[test]
    fn load_table_reads_files_and_fingerprints_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmv_data.xlsx");
        let bytes = workbook_bytes();
        std::fs::write(&path, &bytes).unwrap();

        let loaded = load_table(&path).unwrap();
        assert_eq!(loaded.source_name, "hmv_data.xlsx");
        assert_eq!(loaded.format, TableFormat::Workbook);
        assert_eq!(loaded.sha256, sha256_hex(&bytes));

        let missing = load_table(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(missing, AdapterError::Anyhow(_)));
        assert!(matches!(
            load_table(dir.path().join("notes.txt")),
            Err(AdapterError::UnsupportedFormat(_))
        ));
    }
}
