//! Profile log
//!
//! Tab-separated, line-oriented output consumed by downstream report
//! tooling: one `experiment` line per completed experiment and one
//! `progress-point` line per counter at close. The format round-trips
//! through [`parse_line`]; progress-point names must not contain tabs,
//! commas, or colons.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::{LineId, LogError};
use crate::experiment::ExperimentRecord;

pub struct ProfileWriter {
    out: Box<dyn Write + Send>,
}

impl ProfileWriter {
    /// # Errors
    /// Propagates file creation failures.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(Box::new(BufWriter::new(file))))
    }

    #[must_use]
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    /// # Errors
    /// Propagates write failures.
    pub fn experiment(&mut self, record: &ExperimentRecord) -> std::io::Result<()> {
        let points = record
            .delta_points
            .iter()
            .map(|(name, delta)| format!("{name}:{delta}"))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(
            self.out,
            "experiment\tline={}\tspeedup={}\tduration_ns={}\tdelta_points={points}\tapplied_delay_ns={}",
            record.line.0, record.speedup, record.duration_ns, record.applied_delay_ns,
        )
    }

    /// # Errors
    /// Propagates write failures.
    pub fn progress_point(&mut self, name: &str, count: u64) -> std::io::Result<()> {
        writeln!(self.out, "progress-point\tname={name}\tcount={count}")
    }

    /// # Errors
    /// Propagates flush failures.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

/// One parsed line of a profile log.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileEntry {
    Experiment(ExperimentRecord),
    ProgressPoint { name: String, count: u64 },
}

/// Parse one line of a profile log.
///
/// # Errors
/// `LogError::Malformed` when the line is not a valid log record.
pub fn parse_line(line: &str) -> Result<ProfileEntry, LogError> {
    let mut fields = line.split('\t');
    let kind = fields.next().ok_or_else(|| malformed(line))?;
    match kind {
        "experiment" => {
            let line_id = LineId(parse_field(fields.next(), "line=", line)?);
            let speedup = parse_field::<f64>(fields.next(), "speedup=", line)?;
            let duration_ns = parse_field(fields.next(), "duration_ns=", line)?;
            let delta_points = parse_points(fields.next(), line)?;
            let applied_delay_ns = parse_field(fields.next(), "applied_delay_ns=", line)?;
            Ok(ProfileEntry::Experiment(ExperimentRecord {
                line: line_id,
                speedup,
                duration_ns,
                delta_points,
                applied_delay_ns,
            }))
        }
        "progress-point" => {
            let name = fields
                .next()
                .and_then(|f| f.strip_prefix("name="))
                .ok_or_else(|| malformed(line))?
                .to_string();
            let count = parse_field(fields.next(), "count=", line)?;
            Ok(ProfileEntry::ProgressPoint { name, count })
        }
        _ => Err(malformed(line)),
    }
}

/// Parse a whole log.
///
/// # Errors
/// `LogError::Malformed` on the first bad line.
pub fn parse_log(content: &str) -> Result<Vec<ProfileEntry>, LogError> {
    content.lines().filter(|l| !l.is_empty()).map(parse_line).collect()
}

fn malformed(line: &str) -> LogError {
    LogError::Malformed(line.to_string())
}

fn parse_field<T: std::str::FromStr>(
    field: Option<&str>,
    prefix: &str,
    line: &str,
) -> Result<T, LogError> {
    field
        .and_then(|f| f.strip_prefix(prefix))
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| malformed(line))
}

fn parse_points(field: Option<&str>, line: &str) -> Result<Vec<(String, u64)>, LogError> {
    let value = field.and_then(|f| f.strip_prefix("delta_points=")).ok_or_else(|| malformed(line))?;
    value
        .split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, delta) = pair.split_once(':').ok_or_else(|| malformed(line))?;
            Ok((name.to_string(), delta.parse().map_err(|_| malformed(line))?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Clonable in-memory sink so tests can read back what a writer
    /// produced.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn record() -> ExperimentRecord {
        ExperimentRecord {
            line: LineId(3),
            speedup: 0.25,
            duration_ns: 500_000_000,
            delta_points: vec![("loop_iter".to_string(), 1234), ("requests".to_string(), 0)],
            applied_delay_ns: 77_000_000,
        }
    }

    #[test]
    fn experiment_line_format() {
        let buf = SharedBuf::default();
        ProfileWriter::new(Box::new(buf.clone())).experiment(&record()).unwrap();
        assert_eq!(
            buf.contents(),
            "experiment\tline=3\tspeedup=0.25\tduration_ns=500000000\t\
             delta_points=loop_iter:1234,requests:0\tapplied_delay_ns=77000000\n"
        );
    }

    #[test]
    fn progress_point_line_format() {
        let buf = SharedBuf::default();
        ProfileWriter::new(Box::new(buf.clone())).progress_point("loop_iter", 42).unwrap();
        assert_eq!(buf.contents(), "progress-point\tname=loop_iter\tcount=42\n");
    }

    #[test]
    fn experiment_round_trip() {
        let buf = SharedBuf::default();
        ProfileWriter::new(Box::new(buf.clone())).experiment(&record()).unwrap();

        let text = buf.contents();
        let parsed = parse_line(text.trim_end()).unwrap();
        assert_eq!(parsed, ProfileEntry::Experiment(record()));
    }

    #[test]
    fn empty_delta_points_round_trip() {
        let mut rec = record();
        rec.delta_points.clear();
        let buf = SharedBuf::default();
        ProfileWriter::new(Box::new(buf.clone())).experiment(&rec).unwrap();

        let text = buf.contents();
        let parsed = parse_line(text.trim_end()).unwrap();
        assert_eq!(parsed, ProfileEntry::Experiment(rec));
    }

    #[test]
    fn whole_log_round_trip() {
        let buf = SharedBuf::default();
        {
            let mut writer = ProfileWriter::new(Box::new(buf.clone()));
            writer.experiment(&record()).unwrap();
            let mut second = record();
            second.speedup = 0.05;
            second.line = LineId(9);
            writer.experiment(&second).unwrap();
            writer.progress_point("loop_iter", 4321).unwrap();
            writer.flush().unwrap();
        }
        let text = buf.contents();

        let entries = parse_log(&text).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(
            entries[2],
            ProfileEntry::ProgressPoint { ref name, count: 4321 } if name == "loop_iter"
        ));

        // serialize again and compare byte-for-byte
        let buf2 = SharedBuf::default();
        {
            let mut writer = ProfileWriter::new(Box::new(buf2.clone()));
            for entry in &entries {
                match entry {
                    ProfileEntry::Experiment(rec) => writer.experiment(rec).unwrap(),
                    ProfileEntry::ProgressPoint { name, count } => {
                        writer.progress_point(name, *count).unwrap();
                    }
                }
            }
        }
        assert_eq!(text, buf2.contents());
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(parse_line("experiment\tbogus").is_err());
        assert!(parse_line("unknown\tline=1").is_err());
        assert!(parse_line("experiment\tline=x\tspeedup=0.5\tduration_ns=1\tdelta_points=\tapplied_delay_ns=0").is_err());
        assert!(parse_line("").is_err());
    }

    #[test]
    fn writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.whatif");
        let mut writer = ProfileWriter::create(&path).unwrap();
        writer.experiment(&record()).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("experiment\tline=3\t"));
    }
}
