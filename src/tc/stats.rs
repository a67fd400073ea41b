//! Stats reader: samples byte counters from the qdisc tree on `ifb0`
//! (spec.md §4.1 `get_stats`).

use crate::tc::error::TcError;
use crate::tc::shell;

/// `(root_bytes, stream_bytes, background_bytes)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcStats {
    pub root_bytes: u64,
    pub stream_bytes: u64,
    pub background_bytes: u64,
}

const ROOT_HANDLES: [&str; 2] = ["0:", "1:"];
const STREAM_HANDLE: &str = "4:";
const BACKGROUND_HANDLE: &str = "5:";

/// Parse `tc -s qdisc show dev <ifb>` output.
///
/// Each qdisc entry is a `qdisc <kind> <handle>: ...` header line followed by
/// a `Sent <bytes> bytes ...` line. If tcmmd hasn't installed anything, the
/// default `pfifo_fast` sits on handle `0:` and that's what "root" reports.
pub fn parse(output: &str) -> TcStats {
    let mut stats = TcStats::default();
    let mut current_handle: Option<&str> = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("qdisc ") {
            let mut fields = rest.split_whitespace();
            let _kind = fields.next();
            current_handle = fields.next();
        } else if let Some(rest) = line.strip_prefix("Sent ") {
            let bytes: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            match current_handle {
                Some(h) if ROOT_HANDLES.contains(&h) => stats.root_bytes = bytes,
                Some(h) if h == STREAM_HANDLE => stats.stream_bytes = bytes,
                Some(h) if h == BACKGROUND_HANDLE => stats.background_bytes = bytes,
                _ => {}
            }
        }
    }

    stats
}

pub fn read(ifb: &str) -> Result<TcStats, TcError> {
    let output = shell::tc_output(&["-s", "qdisc", "show", "dev", ifb])?;
    Ok(parse(&output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_installed_topology() {
        let output = "\
qdisc dsmark 1: root refcnt 2 indices 0x0004 default_index 0x0
 Sent 1000 bytes 12 pkt (dropped 0, overlimits 0 requeues 0)
qdisc htb 2: parent 1: r2q 2 default 0 direct_packets_stat 0
 Sent 1000 bytes 12 pkt (dropped 0, overlimits 0 requeues 0)
qdisc sfq 3: parent 2:1 limit 127p quantum 1514b depth 127
 Sent 0 bytes 0 pkt (dropped 0, overlimits 0 requeues 0)
qdisc sfq 4: parent 2:2 limit 127p quantum 1514b depth 127
 Sent 600 bytes 6 pkt (dropped 0, overlimits 0 requeues 0)
qdisc sfq 5: parent 2:3 limit 127p quantum 1514b depth 127
 Sent 400 bytes 6 pkt (dropped 0, overlimits 0 requeues 0)
";
        let stats = parse(output);
        assert_eq!(stats.root_bytes, 1000);
        assert_eq!(stats.stream_bytes, 600);
        assert_eq!(stats.background_bytes, 400);
    }

    #[test]
    fn defaults_to_pfifo_fast_on_handle_zero() {
        let output = "\
qdisc pfifo_fast 0: root refcnt 2 bands 3 priomap ...
 Sent 42 bytes 1 pkt (dropped 0, overlimits 0 requeues 0)
";
        let stats = parse(output);
        assert_eq!(stats.root_bytes, 42);
        assert_eq!(stats.stream_bytes, 0);
        assert_eq!(stats.background_bytes, 0);
    }
}
