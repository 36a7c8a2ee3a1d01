//! Peak memory of a child process, read from `/proc/<pid>/status`.

/// High-water marks in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    /// Peak resident set size (`VmHWM`).
    pub peak_resident: u64,
    /// Peak virtual size (`VmPeak`).
    pub peak_virtual: u64,
}

impl MemorySample {
    /// Field-wise maximum of two samples.
    pub fn max(self, other: MemorySample) -> MemorySample {
        MemorySample {
            peak_resident: self.peak_resident.max(other.peak_resident),
            peak_virtual: self.peak_virtual.max(other.peak_virtual),
        }
    }
}

/// Sample `pid`. `None` once the process is gone, or where procfs is missing.
pub fn sample(pid: u32) -> Option<MemorySample> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_status(&status)
}

/// Extract `VmHWM` and `VmPeak` from the text of a procfs status file.
/// Kernel threads and zombies have neither and yield `None`.
pub fn parse_status(status: &str) -> Option<MemorySample> {
    let mut resident = None;
    let mut virtual_ = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            resident = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("VmPeak:") {
            virtual_ = parse_kib(rest);
        }
    }
    if resident.is_none() && virtual_.is_none() {
        return None;
    }
    Some(MemorySample {
        peak_resident: resident.unwrap_or(0),
        peak_virtual: virtual_.unwrap_or(0),
    })
}

// "   12345 kB" -> bytes
fn parse_kib(field: &str) -> Option<u64> {
    let kib: u64 = field.split_whitespace().next()?.parse().ok()?;
    kib.checked_mul(1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tsleep\nState:\tS (sleeping)\nVmPeak:\t    8192 kB\nVmSize:\t    8000 kB\nVmHWM:\t     512 kB\nVmRSS:\t     500 kB\n";

    #[test]
    fn parses_high_water_marks() {
        let sample = parse_status(STATUS).unwrap();
        assert_eq!(sample.peak_resident, 512 * 1024);
        assert_eq!(sample.peak_virtual, 8192 * 1024);
    }

    #[test]
    fn zombie_status_has_no_sample() {
        assert!(parse_status("Name:\tdefunct\nState:\tZ (zombie)\n").is_none());
    }

    #[test]
    fn max_is_field_wise() {
        let a = MemorySample { peak_resident: 10, peak_virtual: 1 };
        let b = MemorySample { peak_resident: 5, peak_virtual: 7 };
        assert_eq!(a.max(b), MemorySample { peak_resident: 10, peak_virtual: 7 });
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn samples_own_process() {
        let sample = sample(std::process::id()).unwrap();
        assert!(sample.peak_resident > 0);
    }
}
