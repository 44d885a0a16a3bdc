//! Per-node log directory: `score_reported.csv`, the mandate-performance
//! dump that accompanies the DSP-produced `radio.h5`/`timestamps.h5` and the
//! plain-text logs.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::ControlPlaneError;

/// One row appended to `score_reported.csv`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreReportRow {
    /// Measurement period this row reports.
    pub mp: u64,
    /// Count of mandates whose goal was stable at this MP.
    pub mandates_achieved: u32,
    /// Ensemble `mp_score` sum across all flows at this MP.
    pub total_score_achieved: u32,
}

/// Appends mandate-performance rows to `score_reported.csv` in a node's log
/// directory.
pub struct ScoreLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScoreLog {
    /// Opens (creating if needed) `score_reported.csv` under `log_dir`,
    /// writing the header if the file is new.
    pub fn open(log_dir: &Path) -> Result<Self, ControlPlaneError> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join("score_reported.csv");
        let is_new = !path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "mp,mandates_achieved,total_score_achieved")?;
        }
        Ok(Self { path, writer })
    }

    /// Appends one row and flushes it to disk.
    pub fn append_mp(&mut self, row: ScoreReportRow) -> Result<(), ControlPlaneError> {
        writeln!(
            self.writer,
            "{},{},{}",
            row.mp, row.mandates_achieved, row.total_score_achieved
        )?;
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes any buffered rows. Called on controller shutdown.
    pub fn finalize(&mut self) -> Result<(), ControlPlaneError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the path this log writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_once_and_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = ScoreLog::open(dir.path()).unwrap();
            log.append_mp(ScoreReportRow {
                mp: 0,
                mandates_achieved: 1,
                total_score_achieved: 2,
            })
            .unwrap();
        }
        {
            let mut log = ScoreLog::open(dir.path()).unwrap();
            log.append_mp(ScoreReportRow {
                mp: 1,
                mandates_achieved: 2,
                total_score_achieved: 4,
            })
            .unwrap();
        }

        let contents = std::fs::read_to_string(dir.path().join("score_reported.csv")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "mp,mandates_achieved,total_score_achieved");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "0,1,2");
        assert_eq!(lines[2], "1,2,4");
    }
}
