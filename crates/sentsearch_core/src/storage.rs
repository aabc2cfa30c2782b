use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};

/// One row of the persisted metadata table (`data.csv`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRow {
    pub text: String,
    pub paragraph_id: String,
}

/// Writes a row-major f32 matrix as little-endian binary, framed by two
/// little-endian u64 values giving row and column counts.
pub fn save_matrix(path: &Path, rows: &[Vec<f32>], dim: usize) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&(rows.len() as u64).to_le_bytes())?;
    writer.write_all(&(dim as u64).to_le_bytes())?;
    for row in rows {
        for value in row {
            writer.write_all(&value.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn load_matrix(path: &Path) -> Result<Vec<Vec<f32>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut frame = [0u8; 8];
    reader.read_exact(&mut frame)?;
    let n_rows = u64::from_le_bytes(frame) as usize;
    reader.read_exact(&mut frame)?;
    let dim = u64::from_le_bytes(frame) as usize;

    let mut rows = Vec::with_capacity(n_rows);
    let mut buf = [0u8; 4];
    for _ in 0..n_rows {
        let mut row = Vec::with_capacity(dim);
        for _ in 0..dim {
            reader.read_exact(&mut buf).map_err(|_| {
                SearchError::index_load(path, "embedding matrix truncated")
            })?;
            row.push(f32::from_le_bytes(buf));
        }
        rows.push(row);
    }
    Ok(rows)
}

pub fn save_ids(path: &Path, ids: &[String]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for id in ids {
        writer.write_all(id.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn load_ids(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut ids = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.is_empty() {
            ids.push(line);
        }
    }
    Ok(ids)
}

pub fn save_metadata_rows(path: &Path, rows: &[MetadataRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn load_metadata_rows(path: &Path) -> Result<Vec<MetadataRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

pub fn save_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Creates a fresh timestamped run directory under `base`, so successive
/// mining runs never write into each other's artifacts.
pub fn make_timestamp_directory(base: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y-%m-%d_%H%M%S%.3f").to_string();
    let dir = base.join(stamp);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
