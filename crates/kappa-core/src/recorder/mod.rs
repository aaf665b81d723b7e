//! Run log and result table.
//!
//! Every structure gets one row in a fixed-column table that is rendered at
//! the end of the run. The context owns the log sink and is passed down
//! explicitly; progress bars go to stderr so the log file stays append-only.

use crate::domain::{KappaError, KappaResult};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Instant;

const BANNER: &str = concat!(
    "  _\n",
    " | | ____ _ _ __  _ __   __ _       _ __ ___\n",
    " | |/ / _` | '_ \\| '_ \\ / _` |_____| '__/ __|\n",
    " |   < (_| | |_) | |_) | (_| |_____| |  \\__ \\\n",
    " |_|\\_\\__,_| .__/| .__/ \\__,_|     |_|  |___/\n",
    "           |_|   |_|\n",
);

/// Column gutter in the rendered table.
const GUTTER: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Formula,
    SpgNum,
    SpgSame,
    Conv,
    Fc2Super,
    Fc3Super,
    FcCalcError,
    QMesh,
    Imaginary,
}

impl Column {
    pub const ALL: [Column; 9] = [
        Column::Formula,
        Column::SpgNum,
        Column::SpgSame,
        Column::Conv,
        Column::Fc2Super,
        Column::Fc3Super,
        Column::FcCalcError,
        Column::QMesh,
        Column::Imaginary,
    ];

    pub fn header(&self) -> &'static str {
        match self {
            Column::Formula => "Formula",
            Column::SpgNum => "SPG_num",
            Column::SpgSame => "SPG_same",
            Column::Conv => "Conv",
            Column::Fc2Super => "FC2_super",
            Column::Fc3Super => "FC3_super",
            Column::FcCalcError => "FC_calc_error",
            Column::QMesh => "Q_mesh",
            Column::Imaginary => "Imaginary",
        }
    }

    fn position(&self) -> usize {
        Column::ALL.iter().position(|column| column == self).unwrap_or(0)
    }
}

/// One cell per column per structure, filled in as stages complete.
#[derive(Debug, Clone)]
pub struct RunRecord {
    rows: Vec<[Option<String>; 9]>,
}

impl RunRecord {
    pub fn new(total: usize) -> Self {
        Self {
            rows: vec![Default::default(); total],
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn update(&mut self, index: usize, column: Column, value: impl ToString) {
        if let Some(row) = self.rows.get_mut(index) {
            row[column.position()] = Some(value.to_string());
        }
    }

    pub fn update_bool(&mut self, index: usize, column: Column, value: bool) {
        self.update(index, column, if value { "True" } else { "False" });
    }

    fn cell(&self, index: usize, column: usize) -> &str {
        self.rows[index][column].as_deref().unwrap_or("None")
    }

    /// Right-aligned table with a rule before the header, before every tenth
    /// row, and after the last one.
    pub fn render(&self) -> String {
        let mut widths = vec!["Index".len()];
        widths.extend(Column::ALL.iter().map(|column| column.header().len()));
        for (index, _) in self.rows.iter().enumerate() {
            widths[0] = widths[0].max(index.to_string().len());
            for column in 0..Column::ALL.len() {
                widths[column + 1] = widths[column + 1].max(self.cell(index, column).len());
            }
        }
        let bar_length = GUTTER * (widths.len() + 1) + widths.iter().sum::<usize>();
        let bar = "-".repeat(bar_length);

        let format_row = |cells: &[String]| -> String {
            let mut line = String::new();
            for (cell, width) in cells.iter().zip(&widths) {
                line.push_str(&format!("{cell:>pad$}", pad = width + GUTTER));
            }
            line
        };

        let mut out = String::new();
        out.push('\n');
        out.push_str(&bar);
        out.push('\n');
        let mut headers = vec!["Index".to_string()];
        headers.extend(Column::ALL.iter().map(|column| column.header().to_string()));
        out.push_str(&format_row(&headers));
        out.push('\n');
        for index in 0..self.rows.len() {
            if index % 10 == 0 {
                out.push_str(&bar);
                out.push('\n');
            }
            let mut cells = vec![index.to_string()];
            for column in 0..Column::ALL.len() {
                cells.push(self.cell(index, column).to_string());
            }
            out.push_str(&format_row(&cells));
            out.push('\n');
        }
        out.push_str(&bar);
        out.push('\n');
        out
    }
}

/// Where the run log goes.
enum LogSink {
    Stdout(io::Stdout),
    File(fs::File),
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogSink::Stdout(out) => out.write(buf),
            LogSink::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogSink::Stdout(out) => out.flush(),
            LogSink::File(file) => file.flush(),
        }
    }
}

/// Owns the run log, the wall clock, and the result table; passed through
/// the pipeline stages by reference.
pub struct RunContext {
    sink: LogSink,
    start: Instant,
    pub record: RunRecord,
}

impl RunContext {
    /// `log` of "-" writes to stdout, anything else is a file path.
    pub fn new(log: &str, total: usize) -> KappaResult<Self> {
        let sink = if log == "-" {
            LogSink::Stdout(io::stdout())
        } else {
            let file = fs::File::create(log).map_err(|error| {
                KappaError::io_system("LOG.OPEN", format!("{log}: {error}"))
            })?;
            LogSink::File(file)
        };
        Ok(Self {
            sink,
            start: Instant::now(),
            record: RunRecord::new(total),
        })
    }

    pub fn writeline(&mut self, line: &str) -> KappaResult<()> {
        writeln!(self.sink, "{line}")
            .and_then(|_| self.sink.flush())
            .map_err(|error| KappaError::io_system("LOG.WRITE", error.to_string()))
    }

    pub fn banner(&mut self) -> KappaResult<()> {
        write!(self.sink, "{BANNER}")
            .map_err(|error| KappaError::io_system("LOG.WRITE", error.to_string()))?;
        self.writeline(&format!("{:>21}", env!("CARGO_PKG_VERSION")))
    }

    /// Echo the effective configuration as `key : value` with the keys
    /// padded to a common width.
    pub fn log_config(&mut self, pairs: &[(String, String)]) -> KappaResult<()> {
        let width = pairs.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
        for (key, value) in pairs {
            self.writeline(&format!("{key:<width$} : {value}"))?;
        }
        Ok(())
    }

    pub fn log_results(&mut self) -> KappaResult<()> {
        let table = self.record.render();
        write!(self.sink, "{table}")
            .and_then(|_| self.sink.flush())
            .map_err(|error| KappaError::io_system("LOG.WRITE", error.to_string()))
    }

    pub fn terminate(&mut self) -> KappaResult<()> {
        let elapsed = self.start.elapsed().as_secs_f64();
        self.writeline(&format!(
            "Total elapsed time: {}",
            format_duration(elapsed)
        ))?;
        self.writeline("kappa-rs terminated.")
    }
}

/// H:MM:SS, hours unpadded.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Ephemeral carriage-return progress line on stderr.
pub struct ProgressBar {
    total: usize,
    description: String,
    bar_length: usize,
    start: Instant,
}

impl ProgressBar {
    pub fn new(total: usize, description: &str) -> Self {
        Self {
            total,
            description: description.to_string(),
            bar_length: 100usize.saturating_sub(description.len()).max(10),
            start: Instant::now(),
        }
    }

    fn line(&self, index: usize) -> String {
        let total = self.total.max(1);
        let percent = index as f64 / total as f64 * 100.0;
        let filled = (self.bar_length as f64 * index as f64 / total as f64).round() as usize;
        let filled = filled.min(self.bar_length);
        let eta = if index == 0 {
            "?".to_string()
        } else {
            let elapsed = self.start.elapsed().as_secs_f64();
            format_duration(elapsed * (total - index) as f64 / index as f64)
        };
        let elapsed = if index == 0 {
            format_duration(0.0)
        } else {
            format_duration(self.start.elapsed().as_secs_f64())
        };
        format!(
            "{}: {percent:.2}% [{}{}] {index}/{} [{elapsed}<{eta}]",
            self.description,
            "=".repeat(filled),
            " ".repeat(self.bar_length - filled),
            self.total
        )
    }

    pub fn update(&self, index: usize) {
        let mut err = io::stderr();
        let _ = write!(err, "\r{}", self.line(index));
        let _ = err.flush();
    }

    pub fn finish(&self) {
        let mut err = io::stderr();
        let _ = write!(
            err,
            "\r{}: 100.00% [{}] {}/{} [{}<{}]\n",
            self.description,
            "=".repeat(self.bar_length),
            self.total,
            self.total,
            format_duration(self.start.elapsed().as_secs_f64()),
            format_duration(0.0)
        );
        let _ = err.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unset_cells_render_as_none() {
        let mut record = RunRecord::new(1);
        record.update(0, Column::Formula, "Si");
        let table = record.render();
        assert!(table.contains("Si"));
        assert!(table.contains("None"));
    }

    #[test]
    fn table_is_right_aligned_with_a_three_space_gutter() {
        let mut record = RunRecord::new(2);
        for index in 0..2 {
            record.update(index, Column::Formula, "NaCl");
            record.update(index, Column::SpgNum, 225);
            record.update_bool(index, Column::SpgSame, true);
            record.update_bool(index, Column::Conv, true);
            record.update(index, Column::Fc2Super, "[2,2,2]*12");
            record.update(index, Column::Fc3Super, "[2,2,2]*96");
            record.update_bool(index, Column::FcCalcError, false);
            record.update(index, Column::QMesh, "[12,12,12]");
            record.update_bool(index, Column::Imaginary, false);
        }
        let table = record.render();
        let header_line = table
            .lines()
            .find(|line| line.contains("Index"))
            .unwrap();
        // "Index" is five wide, right-aligned into width + gutter.
        assert!(header_line.starts_with("   Index"));
        assert!(header_line.ends_with("Imaginary"));
        let row = table.lines().find(|line| line.contains("NaCl")).unwrap();
        assert!(row.contains("   True"));
        assert!(row.contains("   [2,2,2]*12"));
    }

    #[test]
    fn rules_repeat_every_ten_rows() {
        let record = RunRecord::new(25);
        let table = record.render();
        let rules = table
            .lines()
            .filter(|line| !line.is_empty() && line.chars().all(|c| c == '-'))
            .count();
        // Header rule, rows 0/10/20, final rule.
        assert_eq!(rules, 5);
    }

    #[test]
    fn context_writes_config_echo_and_summary_to_a_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.log");
        let mut context = RunContext::new(path.to_str().unwrap(), 1).unwrap();
        context.banner().unwrap();
        context
            .log_config(&[
                ("input_path".to_string(), "structures.extxyz".to_string()),
                ("fmax".to_string(), "0.0001".to_string()),
            ])
            .unwrap();
        context.record.update(0, Column::Formula, "Si");
        context.log_results().unwrap();
        context.terminate().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("input_path : structures.extxyz"));
        assert!(content.contains("fmax       : 0.0001"));
        assert!(content.contains("Total elapsed time: "));
        assert!(content.contains("kappa-rs terminated."));
        assert!(!content.contains('\r'));
    }

    #[test]
    fn durations_format_like_clock_readings() {
        assert_eq!(format_duration(0.0), "0:00:00");
        assert_eq!(format_duration(75.0), "0:01:15");
        assert_eq!(format_duration(3_700.0), "1:01:40");
        assert_eq!(format_duration(-5.0), "0:00:00");
    }

    #[test]
    fn progress_lines_carry_bar_and_counters() {
        let bar = ProgressBar::new(4, "relaxation");
        let line = bar.line(2);
        assert!(line.starts_with("relaxation: 50.00% ["));
        assert!(line.contains("] 2/4 ["));
        let start = bar.line(0);
        assert!(start.contains("<?]"));
    }
}
