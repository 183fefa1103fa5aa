//! Storage pool scan statistics and the progress string shown for them.

use crate::StrataError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Highest progress a scan can report before the pool says it has finished.
const MAX_IN_PROGRESS: f64 = 99.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScrubState {
    None,
    Scanning,
    Finished,
    Canceled,
}

impl FromStr for ScrubState {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(ScrubState::None),
            "SCANNING" => Ok(ScrubState::Scanning),
            "FINISHED" => Ok(ScrubState::Finished),
            "CANCELED" => Ok(ScrubState::Canceled),
            other => Err(StrataError::InvalidInput(format!("Unknown scan state '{}'", other))),
        }
    }
}

impl fmt::Display for ScrubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrubState::None => "none",
            ScrubState::Scanning => "scanning",
            ScrubState::Finished => "finished",
            ScrubState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl<'de> Deserialize<'de> for ScrubState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One snapshot of a pool's scan counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubStats {
    pub state: ScrubState,
    #[serde(deserialize_with = "flexible_u64")]
    pub examined: u64,
    #[serde(deserialize_with = "flexible_u64")]
    pub to_examine: u64,
}

impl ScrubStats {
    pub fn new(state: ScrubState, examined: u64, to_examine: u64) -> Self {
        Self {
            state,
            examined,
            to_examine,
        }
    }
}

/// Human readable progress, e.g. `99.81%`.
///
/// A running scan never reports `100.00%`; only the finished state does.
pub fn compute_scrub_progress(stats: &ScrubStats) -> String {
    if stats.state == ScrubState::Finished {
        return "100.00%".to_string();
    }

    if stats.to_examine == 0 {
        return "0.00%".to_string();
    }

    let percent = stats.examined as f64 / stats.to_examine as f64 * 100.0;
    let rounded = (percent * 100.0).round() / 100.0;
    format!("{:.2}%", rounded.min(MAX_IN_PROGRESS))
}

/// Health summary for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub name: String,
    pub state: String,
    /// `SCRUB` or `RESILVER` when a scan has ever run.
    pub scan_function: Option<String>,
    pub scan: Option<ScrubStats>,
}

impl PoolHealth {
    pub fn scan_progress(&self) -> Option<String> {
        self.scan.as_ref().map(compute_scrub_progress)
    }
}

#[derive(Debug, Deserialize)]
struct PoolStatusDocument {
    #[serde(default)]
    pools: BTreeMap<String, PoolStatusEntry>,
}

#[derive(Debug, Deserialize)]
struct PoolStatusEntry {
    name: String,
    #[serde(default)]
    state: String,
    scan_stats: Option<ScanStatsEntry>,
}

#[derive(Debug, Deserialize)]
struct ScanStatsEntry {
    function: Option<String>,
    #[serde(flatten)]
    stats: ScrubStats,
}

/// Parse the JSON form of the pool status report.
pub fn parse_pool_status(json: &str) -> Result<Vec<PoolHealth>, StrataError> {
    let document: PoolStatusDocument = serde_json::from_str(json)?;

    Ok(document
        .pools
        .into_values()
        .map(|pool| PoolHealth {
            name: pool.name,
            state: pool.state,
            scan_function: pool.scan_stats.as_ref().and_then(|scan| scan.function.clone()),
            scan: pool.scan_stats.map(|scan| scan.stats),
        })
        .collect())
}

/// Counters come out as integers with `--json-int` and as strings otherwise.
fn flexible_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("not an integer counter: '{}'", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_scan_is_complete_regardless_of_counters() {
        let stats = ScrubStats::new(ScrubState::Finished, 4268032, 4276224);
        assert_eq!(compute_scrub_progress(&stats), "100.00%");
    }

    #[test]
    fn test_running_scan_reports_current_progress() {
        let stats = ScrubStats::new(ScrubState::Scanning, 4268032, 4276224);
        assert_eq!(compute_scrub_progress(&stats), "99.81%");
    }

    #[test]
    fn test_running_scan_is_capped_below_complete() {
        let stats = ScrubStats::new(ScrubState::Scanning, 5268081, 4276224);
        assert_eq!(compute_scrub_progress(&stats), "99.99%");

        let almost = ScrubStats::new(ScrubState::Scanning, 999_999, 1_000_000);
        assert_eq!(compute_scrub_progress(&almost), "99.99%");
    }

    #[test]
    fn test_nothing_to_examine_yet() {
        let stats = ScrubStats::new(ScrubState::Scanning, 5268081, 0);
        assert_eq!(compute_scrub_progress(&stats), "0.00%");
    }

    #[test]
    fn test_nothing_examined_yet() {
        let stats = ScrubStats::new(ScrubState::Scanning, 0, 4276224);
        assert_eq!(compute_scrub_progress(&stats), "0.00%");
    }

    #[test]
    fn test_parse_pool_status() {
        let json = r#"{
            "output_version": {"command": "zpool status", "vers_major": 0, "vers_minor": 1},
            "pools": {
                "local": {
                    "name": "local",
                    "state": "ONLINE",
                    "pool_guid": 11417414376373468000,
                    "scan_stats": {
                        "function": "SCRUB",
                        "state": "SCANNING",
                        "start_time": 1718000000,
                        "examined": 4268032,
                        "to_examine": 4276224,
                        "errors": 0
                    }
                },
                "backup": {
                    "name": "backup",
                    "state": "DEGRADED",
                    "scan_stats": {
                        "function": "RESILVER",
                        "state": "FINISHED",
                        "examined": "10",
                        "to_examine": "10"
                    }
                },
                "fresh": {"name": "fresh", "state": "ONLINE"}
            }
        }"#;

        let pools = parse_pool_status(json).unwrap();
        assert_eq!(pools.len(), 3);

        let backup = &pools[0];
        assert_eq!(backup.name, "backup");
        assert_eq!(backup.scan_function.as_deref(), Some("RESILVER"));
        assert_eq!(backup.scan_progress().as_deref(), Some("100.00%"));

        let fresh = &pools[1];
        assert_eq!(fresh.scan, None);
        assert_eq!(fresh.scan_progress(), None);

        let local = &pools[2];
        assert_eq!(local.state, "ONLINE");
        assert_eq!(local.scan, Some(ScrubStats::new(ScrubState::Scanning, 4268032, 4276224)));
        assert_eq!(local.scan_progress().as_deref(), Some("99.81%"));
    }

    #[test]
    fn test_unknown_scan_state_is_rejected() {
        let json = r#"{"pools": {"p": {"name": "p", "state": "ONLINE",
            "scan_stats": {"state": "EXPLODED", "examined": 1, "to_examine": 2}}}}"#;
        assert!(parse_pool_status(json).is_err());
    }
}
