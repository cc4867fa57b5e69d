//! The fuzz loop: schedule an entry, synthesise a call, run the VM, fold the
//! trace into coverage, ask the solver to flip uncovered branches, and feed
//! everything back into the vaults.
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cfg::rwgraph::RwGraphError;
use crate::cfg::Cfg;
use crate::evm::abi::{self, Method};
use crate::evm::opcode::OpCode;
use crate::evm::register::RegPool;
use crate::evm::state::StateDB;
use crate::evm::vm::{BlockContext, Evm, Message, VmError, DEFAULT_GAS};
use crate::fuzz::contract::Contract;
use crate::fuzz::scheduler::{FuncScheduler, PrefixScheduler};
use crate::fuzz::summary::{Summary, Throughput};
use crate::mutator::Mutator;
use crate::oracle::OracleHost;
use crate::smt::{flip_branch_query, solve, SolveOutcome, WishSolver};
use crate::types::{fixed_address, EVMAddress, EVMU256};

const DEPLOY_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct FuzzConfig {
    /// stage-1 iterations per entry
    pub epoch1: usize,
    /// stage-2 prefix depth bound
    pub stage2_depth: usize,
    /// wall-clock budget per stage
    pub stage_deadline: Duration,
    /// symbolic-resolution worker count
    pub workers: usize,
    pub rng_seed: u64,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            epoch1: 128,
            stage2_depth: 4,
            stage_deadline: Duration::from_secs(60),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            rng_seed: 1667840158,
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("deployment failed after {0} attempts")]
    DeployFailed(usize),
    #[error(transparent)]
    Vm(#[from] VmError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CallReport {
    pub success: bool,
    pub new_path: bool,
}

pub struct FuzzHost {
    pub contract: Contract,
    pub config: FuzzConfig,
    pub state: StateDB,
    pub block: BlockContext,
    pub sender: EVMAddress,
    pub address: EVMAddress,
    pub cfg: Cfg,
    pub mutator: Mutator,
    pub oracle: OracleHost,
    pub wish: WishSolver,
    baseline: usize,
    /// JUMPI pcs observed per entry, for the per-entry coverage summary
    method_branches: HashMap<String, HashSet<u64>>,
    /// (jumpi pc, observed truth) pairs already sent to the solver
    solved: HashSet<(u64, bool)>,
}

impl FuzzHost {
    /// Deploy the target and prepare the CFG around its runtime code.
    pub fn new(contract: Contract, config: FuzzConfig) -> Result<Self, HostError> {
        let sender = contract
            .creator
            .unwrap_or_else(|| fixed_address("1111111111111111111111111111111111111111"));
        let mut state = StateDB::new();
        state.add_balance(sender, EVMU256::one() << 200);
        let block = BlockContext::default();
        let mut mutator = Mutator::new(&contract.abi, config.rng_seed);

        let mut deployed: Option<(EVMAddress, Vec<u8>)> = None;
        for attempt in 0..DEPLOY_ATTEMPTS {
            let (code, uses) = match &contract.creation_bin {
                Some(creation) => (creation.clone(), Vec::new()),
                None => {
                    let mut code = contract.static_bin.clone();
                    match contract.abi.constructor.as_ref() {
                        Some(ctor) if !ctor.inputs.is_empty() => {
                            let (args, uses) = mutator.generate_args(ctor);
                            match abi::encode_args(&ctor.inputs, &args) {
                                Ok(packed) => {
                                    code.extend(packed);
                                    (code, uses)
                                }
                                Err(e) => {
                                    warn!(error = %e, "constructor arguments failed to encode");
                                    (code, uses)
                                }
                            }
                        }
                        _ => (code, Vec::new()),
                    }
                }
            };

            let mut evm = Evm::new(&mut state, block.clone());
            let outcome = evm.create(&Message {
                caller: sender,
                to: None,
                value: EVMU256::zero(),
                data: code,
                gas: DEFAULT_GAS,
            });
            match outcome {
                Ok((res, address)) if res.success() => {
                    mutator.good(&uses);
                    // handcrafted targets ship runtime code directly; the
                    // constructor run then returns nothing
                    let runtime = if res.output.is_empty() {
                        contract.static_bin.clone()
                    } else {
                        res.output.to_vec()
                    };
                    state.set_code(address, runtime.clone());
                    deployed = Some((address, runtime));
                    break;
                }
                Ok((res, _)) => {
                    debug!(attempt, status = ?res.status, "deploy attempt failed");
                    mutator.bad(&uses);
                    if contract.creation_bin.is_some() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(attempt, error = %e, "deploy attempt errored");
                    mutator.bad(&uses);
                }
            }
        }
        let Some((address, runtime)) = deployed else {
            return Err(HostError::DeployFailed(DEPLOY_ATTEMPTS));
        };
        info!(contract = contract.name.as_str(), address = %address, "deployed");

        let mut cfg = Cfg::new(&runtime);
        cfg.symbolic_resolve(config.workers);

        let baseline = state.snapshot();
        Ok(Self {
            contract,
            config,
            state,
            block,
            sender,
            address,
            cfg,
            mutator,
            oracle: OracleHost::new(),
            wish: WishSolver::new(),
            baseline,
            method_branches: HashMap::new(),
            solved: HashSet::new(),
        })
    }

    /// Rewind the world to the post-deploy snapshot.
    pub fn reset_state(&mut self) {
        self.state.revert_to(self.baseline);
        self.baseline = self.state.snapshot();
    }

    /// One fuzz call against `method_name`. With `fresh_state` the state
    /// database is rewound first; stage-2 prefixes keep it warm instead.
    pub fn run_call(&mut self, method_name: &str, fresh_state: bool) -> CallReport {
        let Some(method) = self.contract.abi.method(method_name).cloned() else {
            warn!(method = method_name, "unknown entry, skipping call");
            return CallReport::default();
        };

        let (args, mut uses) = self.mutator.generate_args(&method);
        let (value, value_use) = self.mutator.call_value(method.is_payable());
        uses.extend(value_use);

        let data = match abi::encode_call(&method, &args) {
            Ok(d) => d,
            Err(e) => {
                warn!(method = method_name, error = %e, "abi encoding failed, call skipped");
                return CallReport::default();
            }
        };

        if fresh_state {
            self.reset_state();
        }

        let outcome = {
            let mut evm = Evm::new(&mut self.state, self.block.clone());
            evm.call(&Message {
                caller: self.sender,
                to: Some(self.address),
                value,
                data,
                gas: DEFAULT_GAS,
            })
        };
        let res = match outcome {
            Ok(res) => res,
            Err(e) => {
                debug!(method = method_name, error = %e, "call setup failed");
                self.mutator.bad(&uses);
                return CallReport::default();
            }
        };

        let mut pool = res.pool;
        pool.rebuild();
        if let Ok(layout) = abi::bind_layout(&method, &args) {
            pool.bind_args(&layout);
        }

        let keys = pool.keys();
        self.cfg.update(&keys, &method.name);
        let branches = self.method_branches.entry(method.name.clone()).or_default();
        for key in &keys {
            if key.op == OpCode::JUMPI {
                branches.insert(key.index.1);
            }
        }

        let path = self.cfg.extract_path(&keys);
        let new_path = self.cfg.path_dict.is_new_path_discovered(&path);
        if new_path {
            debug!(method = method_name, path = %path, "new path discovered");
        }

        self.solve_branches(&pool, &method);
        self.oracle.reentrancy_check(&pool, &method.name);

        let success = res.success();
        if success {
            self.mutator.good(&uses);
        } else {
            self.mutator.bad(&uses);
        }
        CallReport { success, new_path }
    }

    /// Walk the trace for conditional jumps whose condition depends on the
    /// call's own inputs, and ask the solver for the other side. Conditions
    /// blocked by a storage read go to the wish list instead.
    fn solve_branches(&mut self, pool: &RegPool, method: &Method) {
        for (jumpi, cond) in pool.jumpi_conds() {
            let observed = pool.get(jumpi).cond;
            if !self.solved.insert((pool.get(jumpi).pc(), !observed.is_zero())) {
                continue;
            }

            let mut deps = pool.relies(cond);
            deps.push(cond);
            let mut has_input = false;
            let mut sload_slot = None;
            let mut blocked = false;
            for d in &deps {
                if pool.is_bind(*d) || pool.is_magic(*d) {
                    has_input = true;
                }
                if pool.is_barrier(*d) {
                    blocked = true;
                    let reg = pool.get(*d);
                    if reg.op == OpCode::SLOAD {
                        sload_slot = Some(reg.slot_key);
                    }
                }
            }

            if let Some(slot) = sload_slot {
                self.wish.push(pool.get(jumpi).pc(), slot, &method.name);
                continue;
            }
            if blocked || !has_input {
                continue;
            }

            match flip_branch_query(pool, cond, observed, self.mutator.exclusions()) {
                Ok(query) => match solve(&query) {
                    SolveOutcome::Sat(model) => {
                        self.oracle.divide_zero_check(&model);
                        self.mutator.add_solution(&model);
                    }
                    SolveOutcome::Unsat | SolveOutcome::Unknown => {}
                },
                // unsupported opcode in the walk: fail quietly
                Err(e) => debug!(pc = pool.get(jumpi).pc(), error = %e, "branch not translated"),
            }
        }
    }

    /// Stage 1: enumerate every non-view entry with randomised arguments.
    pub fn run_stage1(&mut self) -> Summary {
        let start = Instant::now();
        let mut tp = Throughput::default();
        let methods: Vec<Method> = FuncScheduler::new(&self.contract.abi)
            .single_funcs()
            .to_vec();

        'stage: for method in &methods {
            for _ in 0..self.config.epoch1 {
                if start.elapsed() > self.config.stage_deadline {
                    warn!("stage 1 deadline reached, draining");
                    break 'stage;
                }
                let report = self.run_call(&method.name, true);
                tp.total += 1;
                if report.success {
                    tp.success += 1;
                } else {
                    tp.fail += 1;
                }
                if report.new_path {
                    tp.meaningful += 1;
                }
            }
        }
        tp.duration = start.elapsed();
        self.summarize(tp)
    }

    /// Stage 2: prefix-extension walk over the R/W graph, seeded with the
    /// wish list's writer/reader pairs.
    pub fn run_stage2(&mut self) -> Result<Summary, RwGraphError> {
        let start = Instant::now();
        let mut tp = Throughput::default();
        let graph = self.cfg.rwgraph();
        // a graph without entries is meaningless; surface that
        let entries = graph.entries()?;
        debug!(?entries, "stage 2 entry nodes");

        let mut scheduler = PrefixScheduler::new(graph.node_names(), self.config.stage2_depth);
        for prefix in self.wish.candidate_prefixes(&graph) {
            info!(?prefix, "wish list proposes prefix");
            scheduler.prefer(prefix);
        }

        while let Some(prefix) = scheduler.next() {
            if start.elapsed() > self.config.stage_deadline {
                warn!("stage 2 deadline reached, draining");
                break;
            }
            self.reset_state();
            let mut all_ok = true;
            for name in &prefix {
                let report = self.run_call(name, false);
                tp.total += 1;
                if report.success {
                    tp.success += 1;
                } else {
                    tp.fail += 1;
                }
                if report.new_path {
                    tp.meaningful += 1;
                }
                if !report.success {
                    all_ok = false;
                    break;
                }
            }
            if all_ok {
                scheduler.good_funcs(prefix);
            } else {
                scheduler.bad_funcs(prefix);
            }
        }
        tp.duration = start.elapsed();
        Ok(self.summarize(tp))
    }

    fn summarize(&self, throughput: Throughput) -> Summary {
        let mut summary = Summary {
            cfg_coverage: self.cfg.coverage_string(),
            findings: self.oracle.human_report(),
            mutator_state: self.mutator.format_state(),
            throughput,
            ..Default::default()
        };
        for (name, pcs) in &self.method_branches {
            let mut covered = 0;
            let mut total = 0;
            for pc in pcs {
                let (c, t) = self.cfg.branch_coverage_line(*pc);
                covered += c;
                total += t;
            }
            summary
                .function_branch_coverage
                .insert(name.clone(), (covered, total));
        }
        for (name, accesses) in self.cfg.access_list() {
            summary
                .function_access_list
                .insert(name.clone(), accesses.clone());
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evm::abi::Abi;
    use hex_literal::hex;

    fn contract(abi: &str, runtime: Vec<u8>) -> Contract {
        Contract {
            name: "probe".to_string(),
            abi: Abi::parse_str(abi).unwrap(),
            static_bin: runtime,
            creation_bin: None,
            creator: None,
        }
    }

    fn quick_config() -> FuzzConfig {
        FuzzConfig {
            epoch1: 4,
            stage2_depth: 2,
            stage_deadline: Duration::from_secs(30),
            workers: 2,
            rng_seed: 11,
        }
    }

    #[test]
    fn stage1_covers_a_straight_line_program() {
        // PUSH1 1, PUSH1 2, ADD, STOP: runs whatever the calldata
        let c = contract(
            r#"[{"type":"function","name":"ping","stateMutability":"nonpayable","inputs":[]}]"#,
            hex!("600160020100").to_vec(),
        );
        let mut host = FuzzHost::new(c, quick_config()).unwrap();
        let summary = host.run_stage1();
        assert_eq!(summary.throughput.total, 4);
        assert_eq!(summary.throughput.success, 4);
        // statement coverage of the single-block CFG reaches 100%
        assert_eq!(host.cfg.statement_coverage(), (4, 4));
        assert_eq!(summary.throughput.meaningful, 1, "one new path, then replays");
    }

    #[test]
    fn solver_feeds_the_call_value_vault() {
        // CALLVALUE, ISZERO, PUSH1 6, JUMPI, STOP, JUMPDEST, STOP
        // free side jumps, paid side falls through
        let c = contract(
            r#"[{"type":"function","name":"pay","stateMutability":"payable","inputs":[]}]"#,
            hex!("3415600657005b00").to_vec(),
        );
        let mut host = FuzzHost::new(c, quick_config()).unwrap();
        host.mutator.add_solution("CallValue -> 0");
        host.run_call("pay", true);
        let vault = host.mutator.vault(crate::mutator::MAGIC_CALL_VALUE).unwrap();
        assert!(
            vault.len() >= 2,
            "the solver should have admitted a paying call value"
        );
    }

    #[test]
    fn storage_guarded_branch_lands_on_the_wish_list() {
        // PUSH1 0, SLOAD, PUSH1 7, JUMPI, STOP, JUMPDEST, STOP
        let c = contract(
            r#"[{"type":"function","name":"gate","stateMutability":"nonpayable","inputs":[]}]"#,
            hex!("600054600757005b00").to_vec(),
        );
        let mut host = FuzzHost::new(c, quick_config()).unwrap();
        host.run_call("gate", true);
        assert_eq!(host.wish.len(), 1, "the SLOAD barrier becomes a wish");
    }

    #[test]
    fn reverting_entry_counts_as_failure_and_drops_seeds() {
        // PUSH1 0, PUSH1 0, REVERT
        let mut c = contract(
            r#"[{"type":"function","name":"bad","stateMutability":"nonpayable",
                "inputs":[{"name":"x","type":"uint256"}]}]"#,
            hex!("60006000fd").to_vec(),
        );
        // the runtime always reverts, so deploy through a creation wrapper
        // that CODECOPYs it out
        c.creation_bin = Some(hex!("6005600c60003960056000f360006000fd").to_vec());
        let mut host = FuzzHost::new(c, quick_config()).unwrap();
        let report = host.run_call("bad", true);
        assert!(!report.success);
        assert_eq!(host.mutator.exclusions().len(), 1);
    }

    #[test]
    fn stage2_runs_prefixes_over_a_writing_entry() {
        // PUSH1 1, PUSH1 0, SSTORE, STOP
        let c = contract(
            r#"[{"type":"function","name":"write","stateMutability":"nonpayable","inputs":[]}]"#,
            hex!("600160005500").to_vec(),
        );
        let mut host = FuzzHost::new(c, quick_config()).unwrap();
        host.run_stage1();
        let summary = host.run_stage2().unwrap();
        assert!(summary.throughput.total >= 1);
        assert!(summary.function_access_list.contains_key("write"));
    }
}
