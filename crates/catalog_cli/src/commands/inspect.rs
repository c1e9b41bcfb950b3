//! Inspect command implementation.

use catalog_sync_engine::extract_archive;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Snapshot archive inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Archive path.
    pub archive: String,
    /// Archive size in bytes.
    pub size: u64,
    /// Extracted files.
    pub files: Vec<FileStats>,
    /// Records per declared payload type, over all record files.
    pub records: BTreeMap<String, usize>,
}

/// Statistics for a single extracted file.
#[derive(Debug, Serialize)]
pub struct FileStats {
    /// Path inside the archive.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Non-blank lines, for record files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
    /// Lines that are not JSON or lack a payload type.
    pub invalid_lines: usize,
}

/// Runs the inspect command.
///
/// The archive is extracted into a temporary directory, which rejects
/// entries that would land outside it.
pub fn run(archive: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !archive.is_file() {
        return Err(format!("No archive found at {:?}", archive).into());
    }

    let workdir = tempfile::tempdir()?;
    let mut extracted = extract_archive(archive, workdir.path())?;
    extracted.sort();

    let mut result = InspectResult {
        archive: archive.display().to_string(),
        size: std::fs::metadata(archive)?.len(),
        files: Vec::with_capacity(extracted.len()),
        records: BTreeMap::new(),
    };

    for path in &extracted {
        let relative = path.strip_prefix(workdir.path()).unwrap_or(path);
        let mut stats = FileStats {
            path: relative.display().to_string(),
            size: std::fs::metadata(path)?.len(),
            lines: None,
            invalid_lines: 0,
        };
        if path.extension().is_some_and(|ext| ext == "json") {
            let (lines, invalid) = count_records(path, &mut result.records)?;
            stats.lines = Some(lines);
            stats.invalid_lines = invalid;
        }
        result.files.push(stats);
    }

    // Output
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn count_records(
    path: &Path,
    records: &mut BTreeMap<String, usize>,
) -> Result<(usize, usize), Box<dyn std::error::Error>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut lines = 0;
    let mut invalid = 0;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        let declared = serde_json::from_str::<Value>(&line).ok().and_then(|record| {
            record
                .pointer("/payload/type")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        match declared {
            Some(resource_type) => *records.entry(resource_type).or_default() += 1,
            None => invalid += 1,
        }
    }
    Ok((lines, invalid))
}

fn print_text_output(result: &InspectResult) {
    println!("Snapshot Archive");
    println!("================");
    println!("Path: {}", result.archive);
    println!("Size: {} bytes", result.size);
    println!();
    println!("Files ({}):", result.files.len());
    for file in &result.files {
        match file.lines {
            Some(lines) => println!(
                "  {} ({} bytes, {} records, {} invalid)",
                file.path, file.size, lines, file.invalid_lines
            ),
            None => println!("  {} ({} bytes)", file.path, file.size),
        }
    }
    println!();
    println!("Records:");
    for (resource_type, count) in &result.records {
        println!("  {resource_type}: {count}");
    }
}
