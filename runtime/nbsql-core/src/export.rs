//! File-backed helpers: result exports, saved-script removal, and the SQL
//! generated for inline grid edits.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use csv::WriterBuilder;
use serde_json::{Map, Value};

use crate::commands::{ExportArgs, ExportContent, ExportFormat, SaveChangesArgs};
use crate::error::DispatchError;

/// Accepts a bare file name only: no separators, no `.`/`..`, no NUL.
pub fn sanitize_file_name(name: &str) -> Option<&str> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    if name.contains(['/', '\\', '\0']) {
        return None;
    }
    let path = Path::new(name);
    (path.file_name().and_then(|n| n.to_str()) == Some(name)).then_some(name)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes each dot-separated part of a possibly schema-qualified name.
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

pub fn quote_literal(value: Option<&str>) -> String {
    match value {
        Some(value) => format!("'{}'", value.replace('\'', "''")),
        None => "NULL".to_string(),
    }
}

fn render_csv(columns: &[String], rows: &[Vec<Option<String>>]) -> io::Result<String> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(
            (0..columns.len()).map(|idx| row.get(idx).and_then(|cell| cell.as_deref()).unwrap_or_default()),
        )?;
    }
    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn render_json(columns: &[String], rows: &[Vec<Option<String>>]) -> String {
    let records: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut record = Map::new();
            for (idx, column) in columns.iter().enumerate() {
                let value = row
                    .get(idx)
                    .cloned()
                    .flatten()
                    .map(Value::String)
                    .unwrap_or(Value::Null);
                record.insert(column.clone(), value);
            }
            Value::Object(record)
        })
        .collect();
    serde_json::to_string_pretty(&records).unwrap_or_else(|_| "[]".to_string())
}

fn render_sql(table: &str, columns: &[String], rows: &[Vec<Option<String>>]) -> String {
    let table = quote_qualified(table);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut out = String::new();
    for row in rows {
        let values = (0..columns.len())
            .map(|idx| quote_literal(row.get(idx).and_then(|cell| cell.as_deref())))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "INSERT INTO {table} ({column_list}) VALUES ({values});");
    }
    out
}

fn render_txt(columns: &[String], rows: &[Vec<Option<String>>]) -> String {
    let display = |cell: Option<&Option<String>>| -> String {
        match cell {
            Some(Some(value)) => value.replace('\n', " "),
            _ => "NULL".to_string(),
        }
    };
    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in rows {
        for (idx, width) in widths.iter_mut().enumerate() {
            *width = (*width).max(display(row.get(idx)).chars().count());
        }
    }
    let line = |cells: Vec<String>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };
    let mut out = String::new();
    out.push_str(&line(columns.to_vec()));
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.push('\n');
    for row in rows {
        out.push_str(&line((0..columns.len()).map(|idx| display(row.get(idx))).collect()));
        out.push('\n');
    }
    let _ = writeln!(out, "({} rows)", rows.len());
    out
}

/// Renders export content; `table` names the target of generated INSERTs.
pub fn render(format: ExportFormat, content: &ExportContent, table: &str) -> io::Result<String> {
    let body = match content {
        ExportContent::Text(text) => text.clone(),
        ExportContent::Table { columns, rows } => match format {
            ExportFormat::Csv => render_csv(columns, rows)?,
            ExportFormat::Json => render_json(columns, rows),
            ExportFormat::Sql => render_sql(table, columns, rows),
            ExportFormat::Txt => render_txt(columns, rows),
        },
    };
    Ok(body)
}

/// Writes an export under `dir` and returns its path.
pub fn write_export(dir: &Path, args: &ExportArgs) -> Result<PathBuf, DispatchError> {
    let name = sanitize_file_name(&args.filename).ok_or_else(|| {
        DispatchError::invalid("export_request", format!("invalid filename '{}'", args.filename))
    })?;
    let mut file_name = name.to_string();
    let stem = match Path::new(name).extension() {
        Some(_) => Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name)
            .to_string(),
        None => {
            file_name = format!("{name}.{}", args.format.extension());
            name.to_string()
        }
    };
    fs::create_dir_all(dir)
        .map_err(|err| DispatchError::io(format!("creating {}", dir.display()), err))?;
    let path = dir.join(file_name);
    let body = render(args.format, &args.content, &stem)
        .map_err(|err| DispatchError::io(format!("rendering {}", path.display()), err))?;
    fs::write(&path, body)
        .map_err(|err| DispatchError::io(format!("writing {}", path.display()), err))?;
    tracing::info!(path = %path.display(), format = args.format.extension(), "export written");
    Ok(path)
}

/// Removes a saved script from `dir`.
pub fn delete_script(dir: &Path, name: &str) -> Result<PathBuf, DispatchError> {
    let name = sanitize_file_name(name)
        .ok_or_else(|| DispatchError::invalid("script_delete", format!("invalid script name '{name}'")))?;
    let path = dir.join(name);
    fs::remove_file(&path)
        .map_err(|err| DispatchError::io(format!("deleting {}", path.display()), err))?;
    tracing::info!(path = %path.display(), "script deleted");
    Ok(path)
}

/// One `UPDATE` per edit, in edit order.
pub fn update_statements(args: &SaveChangesArgs) -> Result<Vec<String>, DispatchError> {
    if args.table.trim().is_empty() || args.key_column.trim().is_empty() {
        return Err(DispatchError::invalid(
            "saveChanges",
            "table and key_column are required",
        ));
    }
    let table = quote_qualified(args.table.trim());
    let key = quote_ident(args.key_column.trim());
    args.edits
        .iter()
        .map(|edit| {
            if edit.column.trim().is_empty() {
                return Err(DispatchError::invalid("saveChanges", "edit without a column"));
            }
            Ok(format!(
                "UPDATE {table} SET {} = {} WHERE {key} = {}",
                quote_ident(edit.column.trim()),
                quote_literal(edit.value.as_deref()),
                quote_literal(Some(edit.key.as_str())),
            ))
        })
        .collect()
}
