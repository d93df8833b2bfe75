//! Resource usage of the current process, as reported in heartbeat replies.

use std::time::Instant;

use jobforge_events::ProcessMetrics;

/// Clock ticks per second assumed for `/proc/self/stat` CPU times.
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Sample memory and CPU usage. Fields a platform cannot report stay `None`.
pub fn sample(started: Instant) -> ProcessMetrics {
    ProcessMetrics {
        memory_rss_bytes: rss_bytes(),
        cpu_time_ms: cpu_time_ms(),
        uptime_ms: Some(started.elapsed().as_millis() as u64),
        latency_ms: None,
    }
}

#[cfg(target_os = "linux")]
fn rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn cpu_time_ms() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_cpu_ticks(&stat).map(|ticks| ticks * 1000 / CLOCK_TICKS_PER_SEC)
}

#[cfg(not(target_os = "linux"))]
fn cpu_time_ms() -> Option<u64> {
    None
}

/// `VmRSS:    1234 kB` → bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// utime + stime from `/proc/<pid>/stat`. The command name may contain
/// spaces, so fields are counted after its closing parenthesis.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    // After ")" field 3 (state) is first; utime and stime are fields 14 and 15.
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tworker\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tworker\n"), None);
    }

    #[test]
    fn parses_cpu_ticks_with_spaces_in_comm() {
        let stat = "42 (job worker) S 1 42 42 0 -1 4194560 100 0 0 0 7 3 0 0 20 0 1 0 1000";
        assert_eq!(parse_cpu_ticks(stat), Some(10));
    }

    #[test]
    fn uptime_is_always_present() {
        let metrics = sample(Instant::now());
        assert!(metrics.uptime_ms.is_some());
        assert!(metrics.latency_ms.is_none());
    }
}
