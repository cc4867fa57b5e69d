//! Top-level fuzzing entry points: load a contract directory, deploy each
//! target, run both stages, persist summaries.
pub mod contract;
pub mod host;
pub mod scheduler;
pub mod summary;

use std::path::Path;

use tracing::{error, info, warn};

pub use crate::fuzz::contract::{load_contracts_from_dir, select_targets, Contract, LoadError};
pub use crate::fuzz::host::{CallReport, FuzzConfig, FuzzHost, HostError};
pub use crate::fuzz::summary::Summary;

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub attempted: usize,
    pub failed: usize,
    /// (contract name, rendered stage summaries) for the debug session
    pub sessions: Vec<(String, String)>,
}

impl ExecutionReport {
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failed == self.attempted
    }
}

/// Fuzz every contract found in `dir`.
pub fn execute(dir: &Path, config: &FuzzConfig) -> Result<ExecutionReport, LoadError> {
    let (contracts, load_failures) = load_contracts_from_dir(dir)?;
    let mut report = ExecutionReport {
        attempted: load_failures.len(),
        failed: load_failures.len(),
        ..Default::default()
    };

    let targets = select_targets(&contracts);
    info!(
        targets = targets.len(),
        loaded = contracts.len(),
        "fuzzing tasks selected"
    );

    for idx in targets {
        let contract = contracts[idx].clone();
        let name = contract.name.clone();
        report.attempted += 1;
        match fuzz_contract(contract, config, dir) {
            Ok(session) => report.sessions.push((name, session)),
            Err(e) => {
                error!(contract = name.as_str(), error = %e, "fuzzing failed");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

fn fuzz_contract(
    contract: Contract,
    config: &FuzzConfig,
    out_dir: &Path,
) -> Result<String, HostError> {
    let name = contract.name.clone();
    let mut host = FuzzHost::new(contract, config.clone())?;
    let mut session = String::new();

    let stage1 = host.run_stage1();
    if let Err(e) = stage1.save_to_file(out_dir, &format!("{name}-stage1")) {
        warn!(error = %e, "could not persist stage 1 summary");
    }
    session.push_str(&format!("== {name} stage 1 ==\n{}", stage1.render()));

    match host.run_stage2() {
        Ok(stage2) => {
            if let Err(e) = stage2.save_to_file(out_dir, &format!("{name}-stage2")) {
                warn!(error = %e, "could not persist stage 2 summary");
            }
            session.push_str(&format!("== {name} stage 2 ==\n{}", stage2.render()));
        }
        Err(e) => {
            // stage 2 is meaningless without entry nodes; stage 1 results stand
            warn!(contract = name.as_str(), error = %e, "stage 2 aborted");
            session.push_str(&format!("== {name} stage 2 aborted: {e} ==\n"));
        }
    }

    if host.oracle.findings() > 0 {
        info!(
            contract = name.as_str(),
            findings = host.oracle.findings(),
            "oracle report:\n{}",
            host.oracle.human_report()
        );
    }
    Ok(session)
}
