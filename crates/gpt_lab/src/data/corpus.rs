//! Raw text corpus reader: glob expansion plus transparent decompression.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use glob::glob;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::{LabError, Result};

const VALID_EXTS: [&str; 4] = ["txt", "md", "gz", "zst"];

/// Files matching `pattern` in sorted order. A plain path to an existing file
/// is accepted regardless of its extension.
pub fn expand(pattern: &str) -> Result<Vec<PathBuf>> {
    let direct = Path::new(pattern);
    if direct.is_file() {
        return Ok(vec![direct.to_path_buf()]);
    }

    let entries = glob(pattern)
        .map_err(|e| LabError::InvalidConfig(format!("bad input pattern '{pattern}': {e}")))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|p| {
            p.extension()
                .and_then(|s| s.to_str())
                .map_or(false, |ext| VALID_EXTS.contains(&ext))
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(LabError::MissingDataset {
            path: PathBuf::from(pattern),
            reason: "no input files match the pattern".to_string(),
        });
    }
    Ok(paths)
}

fn open_compressed_file(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");

    match ext {
        "gz" => Ok(Box::new(GzDecoder::new(file))),
        "zst" => Ok(Box::new(ZstdDecoder::new(file)?)),
        _ => Ok(Box::new(file)),
    }
}

pub fn read_file(path: &Path) -> Result<String> {
    let mut text = String::new();
    open_compressed_file(path)?.read_to_string(&mut text)?;
    Ok(text)
}

/// Concatenate all files in order, separated by `\n`.
pub fn read_corpus(paths: &[PathBuf]) -> Result<String> {
    let mut corpus = String::new();
    for (i, path) in paths.iter().enumerate() {
        if i > 0 {
            corpus.push('\n');
        }
        corpus.push_str(&read_file(path)?);
    }
    Ok(corpus)
}
