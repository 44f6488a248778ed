use std::path::Path;

use crate::error::LinkError;
use crate::model::{Record, Table, Value};

/// Load CSV text into a table. Every column becomes a field; empty cells are
/// null. `source_dataset_column`, when given, overrides the table name per row.
pub fn load_csv_table(
    table_name: &str,
    csv_data: &str,
    unique_id_column: &str,
    source_dataset_column: Option<&str>,
) -> Result<Table, LinkError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| LinkError::Io(e.to_string()))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let idx = |name: &str| -> Result<usize, LinkError> {
        headers.iter().position(|h| h == name).ok_or_else(|| LinkError::MissingColumn {
            table: table_name.into(),
            column: name.into(),
        })
    };

    let id_idx = idx(unique_id_column)?;
    let source_idx = match source_dataset_column {
        Some(column) => Some(idx(column)?),
        None => None,
    };

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| LinkError::Io(e.to_string()))?;
        let unique_id = row.get(id_idx).unwrap_or("");
        if unique_id.is_empty() {
            return Err(LinkError::Io(format!(
                "{table_name}: row {} has an empty '{unique_id_column}'",
                line + 2
            )));
        }
        let source = source_idx
            .and_then(|i| row.get(i))
            .filter(|s| !s.is_empty())
            .unwrap_or(table_name);

        let mut record = Record::new(unique_id, source);
        for (i, header) in headers.iter().enumerate() {
            record.fields.insert(header.clone(), Value::from(row.get(i).unwrap_or("")));
        }
        records.push(record);
    }

    log::debug!("loaded {} rows from '{table_name}'", records.len());
    Ok(Table::new(table_name, records))
}

/// Load a CSV file, naming the table after the file stem.
pub fn load_csv_file(
    path: &Path,
    unique_id_column: &str,
    source_dataset_column: Option<&str>,
) -> Result<Table, LinkError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| LinkError::Io(format!("{}: {e}", path.display())))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    load_csv_table(&name, &data, unique_id_column, source_dataset_column)
}
