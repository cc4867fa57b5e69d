//! Per-stage plain-text summaries, saved with a timestamp-suffixed name.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cfg::rwgraph::SlotAccess;

#[derive(Debug, Default, Clone)]
pub struct Throughput {
    /// total calls
    pub total: u64,
    /// calls that completed
    pub success: u64,
    /// calls that reverted or failed
    pub fail: u64,
    /// calls that discovered a new path
    pub meaningful: u64,
    pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct Summary {
    pub function_branch_coverage: BTreeMap<String, (usize, usize)>,
    pub function_access_list: BTreeMap<String, Vec<SlotAccess>>,
    pub cfg_coverage: String,
    pub findings: String,
    pub mutator_state: String,
    pub throughput: Throughput,
}

impl Summary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let t = &self.throughput;
        out.push_str("> Throughput:\n");
        if t.total > 0 {
            let secs = t.duration.as_secs_f64().max(f64::EPSILON);
            let _ = writeln!(
                out,
                "|->Total: {}, Success: {}, Fail: {}, Meaningful: {}",
                t.total, t.success, t.fail, t.meaningful
            );
            let _ = writeln!(
                out,
                "|->QPS: {:.2}, SuccessQPS: {:.2}, MeaningfulQPS: {:.2}",
                t.total as f64 / secs,
                t.success as f64 / secs,
                t.meaningful as f64 / secs
            );
        }
        out.push_str("> FunctionBranchCoverage:\n");
        for (name, (covered, total)) in &self.function_branch_coverage {
            let _ = writeln!(out, "|->{name}: {covered}/{total}");
        }
        let _ = writeln!(out, "> CFGCoverage: {}", self.cfg_coverage);
        out.push_str("> FunctionSlotAccessList:\n");
        for (name, accesses) in &self.function_access_list {
            let _ = writeln!(out, "|->{name}:");
            let mut last = String::new();
            for access in accesses {
                let line = access.to_string();
                if line == last {
                    continue;
                }
                let _ = writeln!(out, "|->{line}");
                last = line;
            }
        }
        out.push_str("> Findings:\n");
        out.push_str(&self.findings);
        out.push_str("> Mutator:\n");
        out.push_str(&self.mutator_state);
        out
    }

    /// Write `<title>-summary_<unix-ts>.log` under `dir`.
    pub fn save_to_file(&self, dir: &Path, title: &str) -> io::Result<PathBuf> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let path = dir.join(format!("{title}-summary_{ts}.log"));
        fs::write(&path, self.render())?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_every_section() {
        let mut s = Summary::default();
        s.throughput = Throughput {
            total: 10,
            success: 7,
            fail: 3,
            meaningful: 2,
            duration: Duration::from_secs(1),
        };
        s.function_branch_coverage
            .insert("withdraw".to_string(), (1, 2));
        s.cfg_coverage = "Branch coverage: 1/2\n".to_string();
        let text = s.render();
        assert!(text.contains("|->Total: 10, Success: 7, Fail: 3, Meaningful: 2"));
        assert!(text.contains("|->withdraw: 1/2"));
        assert!(text.contains("CFGCoverage"));
    }

    #[test]
    fn summary_file_is_timestamp_suffixed() {
        let dir = std::env::temp_dir();
        let s = Summary::default();
        let path = s.save_to_file(&dir, "probe-stage1").unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("probe-stage1-summary_"));
        assert!(name.ends_with(".log"));
        let _ = fs::remove_file(path);
    }
}
