// Software-trigger event files
//
// One line per event: `<local time, 6 decimals>\t0\t<code>`.

use crate::streaming::types::{Marker, StreamError, StreamResult};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Appends accepted markers to an event file
pub struct MarkerLog {
    path: PathBuf,
    file: File,
}

impl MarkerLog {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        log::info!("Writing trigger events to {}", path.display());
        Ok(Self { path, file })
    }

    pub fn append(&mut self, marker: &Marker) -> StreamResult<()> {
        writeln!(self.file, "{:.6}\t0\t{}", marker.timestamp, marker.code)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read an event file back into markers
pub fn read_marker_log(path: impl AsRef<Path>) -> StreamResult<Vec<Marker>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut markers = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let bad = |what: &str| {
            StreamError::Parse(format!(
                "{} line {}: {} in '{}'",
                path.display(),
                idx + 1,
                what,
                line.trim()
            ))
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(bad("expected 3 fields"));
        }
        let timestamp: f64 = fields[0].parse().map_err(|_| bad("bad timestamp"))?;
        let code: u32 = fields[2].parse().map_err(|_| bad("bad code"))?;
        markers.push(Marker::new(timestamp, code));
    }

    Ok(markers)
}
