use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use serde::{Serialize, de::DeserializeOwned};

/// Error type for I/O operations
#[derive(Error, Debug)]
pub enum IoError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("IO error: {0}")]
    StdIo(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads a file to string with proper error handling
pub fn read_to_string(path: impl AsRef<Path>) -> Result<String, IoError> {
    let path = path.as_ref();
    fs::read_to_string(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IoError::FileNotFound(path.to_path_buf())
            } else {
                IoError::StdIo(e)
            }
        })
}

/// Appends a single line to a file, creating the file and its parent directories if needed
pub fn append_line(path: impl AsRef<Path>, line: &str) -> Result<(), IoError> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Serializes data to a binary file using bincode
pub fn serialize_to_file<T: Serialize>(
    path: impl AsRef<Path>,
    data: &T,
) -> Result<(), IoError> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, data)?;
    Ok(())
}

/// Deserializes data from a binary file using bincode
pub fn deserialize_from_file<T: DeserializeOwned>(
    path: impl AsRef<Path>,
) -> Result<T, IoError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            IoError::FileNotFound(path.to_path_buf())
        } else {
            IoError::StdIo(e)
        }
    })?;
    let reader = BufReader::new(file);
    let data = bincode::deserialize_from(reader)?;
    Ok(data)
}

/// Helper function to get all files with a specific extension in a directory, sorted by path
pub fn get_files_with_extension(
    dir: impl AsRef<Path>,
    extension: &str,
) -> Result<Vec<PathBuf>, IoError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            if let Some(ext) = path.extension() {
                if ext == extension {
                    files.push(path);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

fn ensure_parent_dir(path: &Path) -> Result<(), IoError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
