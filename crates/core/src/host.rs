//! Host introspection used for VM sizing and nesting decisions.
//!
//! Both probes read line-oriented, whitespace-delimited sources in the
//! `/proc/meminfo` and `/proc/cpuinfo` formats. Lines that are not valid
//! UTF-8 are matched lossily rather than rejected. They only read, so any
//! number of pods may probe concurrently.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const PROC_MEMINFO: &str = "/proc/meminfo";
pub const PROC_CPUINFO: &str = "/proc/cpuinfo";

const MEM_TOTAL_FIELD: &str = "MemTotal:";
const MEM_TOTAL_UNIT: &str = "kB";
const FLAGS_FIELD: &str = "flags";
const HYPERVISOR_FLAG: &str = "hypervisor";

/// Total host memory in kB, from the first `MemTotal: <n> kB` line.
pub fn total_memory_kb(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let file = File::open(path)?;
    read_total_memory_kb(BufReader::new(file), path)
}

fn read_total_memory_kb<R: BufRead>(reader: R, source: &Path) -> Result<u64> {
    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let fields: Vec<&str> = line.split_whitespace().collect();

        if fields.len() != 3 || fields[0] != MEM_TOTAL_FIELD || fields[2] != MEM_TOTAL_UNIT {
            continue;
        }

        if let Ok(size_kb) = fields[1].parse::<u64>() {
            return Ok(size_kb);
        }
    }

    Err(Error::NotFound(format!(
        "{MEM_TOTAL_FIELD} in {}",
        source.display()
    )))
}

/// Reports whether the host itself is a VM guest.
///
/// Only the first line of at least two fields whose first field starts with
/// `flags` is inspected.
/// If it lacks the `hypervisor` flag the answer is `false`, even when a later
/// CPU block would carry it.
pub fn is_running_nested(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let file = File::open(path)?;
    read_is_running_nested(BufReader::new(file), path)
}

fn read_is_running_nested<R: BufRead>(reader: R, source: &Path) -> Result<bool> {
    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let fields: Vec<&str> = line.split_whitespace().collect();

        if fields.len() < 2 || !fields[0].starts_with(FLAGS_FIELD) {
            continue;
        }
        return Ok(fields[1..].contains(&HYPERVISOR_FLAG));
    }

    Err(Error::NotFound(format!(
        "{FLAGS_FIELD:?} line in {}",
        source.display()
    )))
}

/// Snapshot of both host probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub total_memory_kb: u64,
    pub nested: bool,
}

impl HostInfo {
    /// Runs both probes, failing on the first error.
    pub fn probe(meminfo: impl AsRef<Path>, cpuinfo: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            total_memory_kb: total_memory_kb(meminfo)?,
            nested: is_running_nested(cpuinfo)?,
        })
    }

    pub fn total_memory_mb(&self) -> u64 {
        self.total_memory_kb / 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn source(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    mod total_memory {
        use super::*;

        const MEMINFO: &str = "\
MemFree:         1234567 kB
MemTotal:      16384000 kB
MemAvailable:    9999999 kB
";

        #[test]
        fn finds_mem_total_among_other_lines() {
            let file = source(MEMINFO);
            assert_eq!(total_memory_kb(file.path()).unwrap(), 16384000);
        }

        #[test]
        fn skips_lines_with_wrong_shape() {
            let input = "MemTotal: 1 MB\nMemTotal: 2\nMemTotal: 3 kB extra\nMemTotal: 4 kB\n";
            let size = read_total_memory_kb(Cursor::new(input), Path::new("test")).unwrap();
            assert_eq!(size, 4);
        }

        #[test]
        fn skips_non_numeric_value() {
            let input = "MemTotal: lots kB\nMemTotal: 42 kB\n";
            let size = read_total_memory_kb(Cursor::new(input), Path::new("test")).unwrap();
            assert_eq!(size, 42);
        }

        #[test]
        fn first_match_wins() {
            let input = "MemTotal: 10 kB\nMemTotal: 20 kB\n";
            let size = read_total_memory_kb(Cursor::new(input), Path::new("test")).unwrap();
            assert_eq!(size, 10);
        }

        #[test]
        fn skips_non_utf8_lines() {
            let input: &[u8] = b"Garbage: \xff\xfe kB\nMemTotal: 16384000 kB\n";
            let size = read_total_memory_kb(Cursor::new(input), Path::new("test")).unwrap();
            assert_eq!(size, 16384000);
        }

        #[test]
        fn missing_line_is_not_found() {
            let file = source("MemFree: 10 kB\n");
            let err = total_memory_kb(file.path()).unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }

        #[test]
        fn unreadable_source_is_io_error() {
            let err = total_memory_kb("/nonexistent/vmpod/meminfo").unwrap_err();
            assert!(matches!(err, Error::Io(_)));
        }
    }

    mod nesting {
        use super::*;

        #[test]
        fn hypervisor_flag_reports_nested() {
            let file = source("processor\t: 0\nflags\t\t: fpu vme hypervisor sse\n");
            assert!(is_running_nested(file.path()).unwrap());
        }

        #[test]
        fn missing_flag_reports_bare_metal() {
            let file = source("processor\t: 0\nflags\t\t: fpu vme vmx sse\n");
            assert!(!is_running_nested(file.path()).unwrap());
        }

        #[test]
        fn only_first_flags_line_is_inspected() {
            let input = "flags : fpu vme\nflags : fpu hypervisor\n";
            let nested = read_is_running_nested(Cursor::new(input), Path::new("test")).unwrap();
            assert!(!nested);
        }

        #[test]
        fn accepts_field_with_flags_prefix() {
            let input = "flags: fpu hypervisor\n";
            let nested = read_is_running_nested(Cursor::new(input), Path::new("test")).unwrap();
            assert!(nested);
        }

        #[test]
        fn bare_flags_line_is_skipped() {
            let input = "flags\nflags : fpu hypervisor\n";
            let nested = read_is_running_nested(Cursor::new(input), Path::new("test")).unwrap();
            assert!(nested);
        }

        #[test]
        fn non_utf8_line_before_flags_is_skipped() {
            let input: &[u8] = b"model name : \xff\xfe\nflags : fpu hypervisor\n";
            let nested = read_is_running_nested(Cursor::new(input), Path::new("test")).unwrap();
            assert!(nested);
        }

        #[test]
        fn hypervisor_must_match_whole_field() {
            let input = "flags : fpu hypervisor_lite\n";
            let nested = read_is_running_nested(Cursor::new(input), Path::new("test")).unwrap();
            assert!(!nested);
        }

        #[test]
        fn missing_flags_line_is_not_found() {
            let file = source("processor\t: 0\nvendor_id\t: GenuineIntel\n");
            let err = is_running_nested(file.path()).unwrap_err();
            assert!(matches!(err, Error::NotFound(_)));
        }

        #[test]
        fn unreadable_source_is_io_error() {
            let err = is_running_nested("/nonexistent/vmpod/cpuinfo").unwrap_err();
            assert!(matches!(err, Error::Io(_)));
        }
    }

    mod host_info {
        use super::*;

        #[test]
        fn probe_combines_both_sources() {
            let meminfo = source("MemTotal: 2097152 kB\n");
            let cpuinfo = source("flags : hypervisor\n");
            let info = HostInfo::probe(meminfo.path(), cpuinfo.path()).unwrap();
            assert_eq!(info.total_memory_kb, 2097152);
            assert_eq!(info.total_memory_mb(), 2048);
            assert!(info.nested);
        }

        #[test]
        fn probe_propagates_errors() {
            let meminfo = source("MemTotal: 2097152 kB\n");
            let err = HostInfo::probe(meminfo.path(), "/nonexistent/vmpod/cpuinfo").unwrap_err();
            assert!(matches!(err, Error::Io(_)));
        }
    }
}
