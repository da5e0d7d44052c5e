//! Append-only CSV log with in-place header migration.
//!
//! The log assumes a single writer. Two processes appending or migrating
//! the same file at once can interleave and corrupt it; no lock is taken.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Column name to value. Columns without an entry are written empty.
pub type Row = BTreeMap<String, String>;

/// Appends `row` to the CSV at `path`, creating or migrating it so the
/// header covers every column in `field_order`.
pub fn append(path: &Path, row: &Row, field_order: &[&str]) -> Result<()> {
    append_with_defaults(path, row, field_order, &[])
}

/// Same as [`append`], but columns named in `defaults` are filled with the
/// given value instead of an empty string on rows that predate them.
pub fn append_with_defaults(
    path: &Path,
    row: &Row,
    field_order: &[&str],
    defaults: &[(&str, &str)],
) -> Result<()> {
    if let Some(parent) = parent_dir(path) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let header = if path.is_file() { read_header(path)? } else { None };

    let header = match header {
        Some(existing) if covers(&existing, field_order) => Some(existing),
        Some(existing) => Some(migrate(path, &existing, field_order, defaults)?),
        None => None,
    };

    let unterminated = header.is_some() && !ends_with_newline(path)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open CSV log: {:?}", path))?;
    if unterminated {
        debug!("Terminating last line of {:?}", path);
        file.write_all(b"\n")?;
    }
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

    let columns = match header {
        Some(columns) => columns,
        None => {
            debug!("Writing header to {:?}", path);
            writer.write_record(field_order)?;
            field_order.iter().map(|f| f.to_string()).collect()
        }
    };

    writer.write_record(columns.iter().map(|c| row.get(c).map(String::as_str).unwrap_or("")))?;
    writer.flush().with_context(|| format!("Failed to write CSV log: {:?}", path))?;

    Ok(())
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

/// True for an empty file or one whose last byte is a newline.
fn ends_with_newline(path: &Path) -> Result<bool> {
    let mut file = File::open(path).with_context(|| format!("Failed to open CSV log: {:?}", path))?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn covers(header: &[String], field_order: &[&str]) -> bool {
    field_order.iter().all(|f| header.iter().any(|h| h == f))
}

/// First record of the file, or `None` when the file is empty.
fn read_header(path: &Path) -> Result<Option<Vec<String>>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV log: {:?}", path))?;

    let mut record = StringRecord::new();
    if reader.read_record(&mut record)? {
        Ok(Some(record.iter().map(str::to_string).collect()))
    } else {
        Ok(None)
    }
}

/// Rewrites the file under the full header and returns the new columns.
/// The original is only replaced once the rewritten copy is on disk.
fn migrate(
    path: &Path,
    existing: &[String],
    field_order: &[&str],
    defaults: &[(&str, &str)],
) -> Result<Vec<String>> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV log: {:?}", path))?;
    let rows = reader
        .records()
        .collect::<Result<Vec<StringRecord>, _>>()
        .with_context(|| format!("Failed to read CSV log: {:?}", path))?;

    let mut columns: Vec<String> = field_order.iter().map(|f| f.to_string()).collect();
    // Legacy columns outside the current order are kept at the end.
    let legacy: Vec<String> = existing
        .iter()
        .filter(|h| !field_order.contains(&h.as_str()))
        .cloned()
        .collect();
    columns.extend(legacy);

    info!(
        "Migrating {:?}: {} rows, header {:?} -> {:?}",
        path,
        rows.len(),
        existing,
        columns
    );

    let sources: Vec<Source> = columns
        .iter()
        .map(|column| match existing.iter().position(|h| h == column) {
            Some(index) => Source::Existing(index),
            None => Source::Default(
                defaults
                    .iter()
                    .find(|(name, _)| *name == column.as_str())
                    .map(|(_, value)| *value)
                    .unwrap_or(""),
            ),
        })
        .collect();

    let dir = parent_dir(path).unwrap_or_else(|| Path::new("."));
    let temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
    {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(temp.as_file());
        writer.write_record(&columns)?;
        for row in &rows {
            writer.write_record(sources.iter().map(|source| match source {
                Source::Existing(index) => row.get(*index).unwrap_or(""),
                Source::Default(value) => *value,
            }))?;
        }
        writer.flush()?;
    }
    let permissions = fs::metadata(path)?.permissions();
    temp.as_file().set_permissions(permissions)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .with_context(|| format!("Failed to replace CSV log: {:?}", path))?;

    Ok(columns)
}

enum Source<'a> {
    Existing(usize),
    Default(&'a str),
}
