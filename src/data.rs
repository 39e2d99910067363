use crate::normalize::detect_columns;
use crate::types::{Table, Value};
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub fn load_table(path: &Path) -> Result<Table> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    let table = read_table(file)
        .with_context(|| format!("Failed to read CSV file: {:?}", path))?;
    tracing::info!(rows = table.len(), columns = table.columns.len(), "loaded {:?}", path);
    Ok(table)
}

/// Reads CSV into a typed table. Recognised identifier and label columns stay
/// text so leading zeros survive; every other cell becomes a number when it
/// parses as one.
pub fn read_table<R: Read>(reader: R) -> Result<Table> {
    let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers: Vec<String> = rdr
        .headers()
        .context("CSV has no header row")?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let text_cols: Vec<usize> = detect_columns(&headers).values().copied().collect();
    let mut table = Table::new(headers);

    for result in rdr.records() {
        let record = result?;
        let row = record
            .iter()
            .enumerate()
            .map(|(idx, cell)| parse_cell(cell, text_cols.contains(&idx)))
            .collect();
        table.push_row(row);
    }

    Ok(table)
}

fn parse_cell(cell: &str, keep_text: bool) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Missing;
    }
    if !keep_text {
        if let Ok(n) = trimmed.parse::<f64>() {
            return Value::Number(n);
        }
    }
    Value::Text(cell.to_string())
}
