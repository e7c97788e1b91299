//! Control-flow encoding of one function into a [`Formula`].
//!
//! Blocks are visited once in a topological order of the unrolled block
//! graph. Every block copy gets a path condition, the disjunction of its
//! incoming edge guards, and an environment mapping IR names to terms.
//! At joins, values that differ between predecessors are merged with
//! `ite` over the edge guards; phi nodes select on the same guards.
//!
//! Loops are either rejected or unrolled: the body is copied `n` times
//! and the back edge leaving the last copy is redirected to the loop
//! exits with all loop-defined values and memory made unconstrained.

use crate::config::{Config, LoopPolicy};
use crate::error::{Error, Location, Result};
use crate::formula::{AssertionKind, BlockInstance, Formula, Goal};
use crate::graph::{Cfg, Dominators, Loop};
use crate::ir::{Function, InstructionKind, Module, Operand, Terminator, Type};
use crate::smt::{ExprPool, ExprRef, Sort};
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub mod memory;
mod translate;

pub use memory::MAX_EXPANDED_BYTES;
use memory::MemoryModel;

//
// Public Interface
//

/// Upper bound on block copies created by unrolling one function.
pub const MAX_BLOCK_INSTANCES: usize = 100_000;

/// Translates `function` into a formula for `goal`. Fails for this
/// function only, unless the error is fatal.
pub fn encode(
    module: &Module,
    function: &Function,
    config: &Config,
    goal: &Goal,
    pool: &ExprPool,
) -> Result<Formula> {
    time_trace!(format!("encoded @{}", function.name), {
        Encoder::new(module, function, config, goal, pool).run()
    })
}

//
// Private Implementation
//

/// Names in scope at a program point, and the live memory version.
#[derive(Clone, Debug)]
struct Env {
    values: BTreeMap<String, ExprRef>,
    memory: ExprRef,
}

/// One copy of a block, with the iteration count of every loop.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Instance {
    block: usize,
    iteration: Vec<u32>,
}

/// Redirected back edge at the unroll bound.
#[derive(Clone, Copy, Debug)]
struct Cut {
    id: usize,
    loop_index: usize,
    choice: usize,
    choices: usize,
}

#[derive(Clone, Debug)]
struct Edge {
    to: usize,
    /// IR block the edge leaves, used to pick phi operands.
    predecessor: usize,
    cut: Option<Cut>,
}

struct Unrolled {
    instances: Vec<Instance>,
    edges: Vec<Edge>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    order: Vec<usize>,
}

/// Block copy being translated.
struct Point {
    label: String,
    suffix: String,
    pc: ExprRef,
}

struct Encoder<'a> {
    module: &'a Module,
    function: &'a Function,
    config: &'a Config,
    goal: &'a Goal,
    pool: &'a ExprPool,
    formula: Formula,
    memory: MemoryModel,
    globals: BTreeMap<String, ExprRef>,
    /// Terms that are true when an assertion fails.
    failures: Vec<ExprRef>,
    /// Terms that are true when an access leaves its allocation.
    violations: Vec<ExprRef>,
    returns: Vec<(ExprRef, ExprRef)>,
    fresh: usize,
    memory_versions: usize,
}

impl<'a> Encoder<'a> {
    fn new(
        module: &'a Module,
        function: &'a Function,
        config: &'a Config,
        goal: &'a Goal,
        pool: &'a ExprPool,
    ) -> Self {
        Self {
            module,
            function,
            config,
            goal,
            pool,
            formula: Formula::new(&function.name, goal.clone(), pool),
            memory: MemoryModel::default(),
            globals: BTreeMap::new(),
            failures: Vec::new(),
            violations: Vec::new(),
            returns: Vec::new(),
            fresh: 0,
            memory_versions: 0,
        }
    }

    fn run(mut self) -> Result<Formula> {
        if *self.goal == Goal::MemorySafety && !self.config.bounds_checking {
            return Err(Error::Config(
                "the memory safety goal requires bounds checking".to_string(),
            ));
        }
        self.check_supported()?;

        let cfg = Cfg::new(self.function)?;
        let dominators = cfg.dominators();
        self.validate_ssa(&cfg, &dominators)?;

        let back_edges = cfg.back_edges(&dominators);
        if let (LoopPolicy::Reject, Some(&(latch, header))) =
            (self.config.loop_policy(), back_edges.first())
        {
            return Err(Error::LoopNotSupported {
                function: self.function.name.clone(),
                header: cfg.label(header).to_string(),
                latch: cfg.label(latch).to_string(),
            });
        }
        if !cfg.is_reducible(&dominators) {
            return Err(Error::unsupported(
                "irreducible control flow",
                Location::function(&self.function.name),
            ));
        }

        let loops = cfg.loops(&dominators);
        let unrolled = self.unroll(&cfg, &loops)?;
        debug!(
            "@{}: {} blocks, {} loops, {} block instances",
            self.function.name,
            cfg.len(),
            loops.len(),
            unrolled.instances.len()
        );

        let initial = self.initial_env()?;
        self.encode_instances(&cfg, &loops, &unrolled, initial)?;
        self.finish()
    }

    /// Rejects constructs the parser kept as placeholders.
    fn check_supported(&self) -> Result<()> {
        let name = &self.function.name;
        if let Some(construct) = &self.function.unsupported {
            return Err(Error::unsupported(
                construct.clone(),
                Location {
                    function: Some(name.clone()),
                    line: Some(self.function.line),
                    ..Default::default()
                },
            ));
        }
        for block in &self.function.blocks {
            for (index, instruction) in block.instructions.iter().enumerate() {
                if let InstructionKind::Unsupported { construct } = &instruction.kind {
                    return Err(Error::unsupported(
                        construct.clone(),
                        Location::instruction(name, &block.label, index, instruction.line),
                    ));
                }
            }
            if let Terminator::Unsupported { construct } = &block.terminator {
                return Err(Error::unsupported(
                    construct.clone(),
                    Location::instruction(
                        name,
                        &block.label,
                        block.instructions.len(),
                        block.terminator_line,
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Checks that every use is dominated by its definition and that phi
    /// nodes name exactly the predecessors of their block.
    fn validate_ssa(&self, cfg: &Cfg, dominators: &Dominators) -> Result<()> {
        let name = &self.function.name;
        let mut definitions: FxHashMap<&str, Option<(usize, usize)>> = FxHashMap::default();
        for param in &self.function.params {
            definitions.insert(&param.name, None);
        }
        for (b, block) in self.function.blocks.iter().enumerate() {
            for (i, instruction) in block.instructions.iter().enumerate() {
                if let Some(result) = &instruction.result {
                    if definitions.insert(result, Some((b, i))).is_some() {
                        return Err(Error::ssa(
                            format!("%{} is defined more than once", result),
                            Location::instruction(name, &block.label, i, instruction.line),
                        ));
                    }
                }
            }
        }

        let visible = |operand: &Operand, block: usize, index: usize| -> std::result::Result<(), String> {
            let local = match operand.as_local() {
                Some(local) => local,
                None => return Ok(()),
            };
            match definitions.get(local) {
                None => Err(format!("use of undefined value %{}", local)),
                Some(None) => Ok(()),
                Some(Some((b, i))) if *b == block => {
                    if *i < index {
                        Ok(())
                    } else {
                        Err(format!("%{} is used before its definition", local))
                    }
                }
                Some(Some((b, _))) if dominators.dominates(*b, block) => Ok(()),
                Some(Some(_)) => Err(format!("%{} does not dominate its use", local)),
            }
        };

        for (b, block) in self.function.blocks.iter().enumerate() {
            if !dominators.is_reachable(b) {
                continue;
            }
            let predecessors: Vec<&str> = cfg
                .predecessors(b)
                .iter()
                .filter(|p| dominators.is_reachable(**p))
                .map(|p| cfg.label(*p))
                .collect();

            for (i, instruction) in block.instructions.iter().enumerate() {
                let at = || Location::instruction(name, &block.label, i, instruction.line);
                if let InstructionKind::Phi { incoming, .. } = &instruction.kind {
                    let mut seen: BTreeMap<&str, &Operand> = BTreeMap::new();
                    for (value, label) in incoming {
                        let p = cfg
                            .predecessors(b)
                            .iter()
                            .copied()
                            .find(|p| cfg.label(*p) == label.as_str());
                        let p = p.ok_or_else(|| {
                            Error::ssa(format!("phi names %{} which is not a predecessor", label), at())
                        })?;
                        if let Some(previous) = seen.insert(label.as_str(), value) {
                            if previous != value {
                                return Err(Error::invariant(
                                    format!("phi has conflicting values for predecessor %{}", label),
                                    at(),
                                ));
                            }
                        }
                        if dominators.is_reachable(p) {
                            let exit = self.function.blocks[p].instructions.len() + 1;
                            visible(value, p, exit).map_err(|m| Error::ssa(m, at()))?;
                        }
                    }
                    if let Some(missing) = predecessors.iter().find(|p| !seen.contains_key(*p)) {
                        return Err(Error::ssa(
                            format!("phi lacks a value for predecessor %{}", missing),
                            at(),
                        ));
                    }
                } else {
                    for operand in instruction.kind.operands() {
                        visible(operand, b, i).map_err(|m| Error::ssa(m, at()))?;
                    }
                }
            }
            if let Some(operand) = block.terminator.operand() {
                let index = block.instructions.len();
                visible(operand, b, index).map_err(|m| {
                    Error::ssa(
                        m,
                        Location::instruction(name, &block.label, index, block.terminator_line),
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Builds the acyclic graph of block copies reachable from the entry.
    fn unroll(&mut self, cfg: &Cfg, loops: &[Loop]) -> Result<Unrolled> {
        let bound = match self.config.loop_policy() {
            LoopPolicy::Reject => 1,
            LoopPolicy::Unroll(bound) => bound,
        };
        let back_edges: FxHashMap<(usize, usize), usize> = loops
            .iter()
            .enumerate()
            .flat_map(|(l, lp)| lp.latches().iter().map(move |&latch| ((latch, lp.header()), l)))
            .collect();

        let mut unrolled = Unrolled {
            instances: Vec::new(),
            edges: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            order: Vec::new(),
        };
        let mut index: FxHashMap<Instance, usize> = FxHashMap::default();
        let mut queue: VecDeque<usize> = VecDeque::new();
        let mut cuts = 0;

        let mut intern = |unrolled: &mut Unrolled, queue: &mut VecDeque<usize>, instance: Instance| {
            *index.entry(instance.clone()).or_insert_with(|| {
                unrolled.instances.push(instance);
                unrolled.incoming.push(Vec::new());
                unrolled.outgoing.push(Vec::new());
                queue.push_back(unrolled.instances.len() - 1);
                unrolled.instances.len() - 1
            })
        };
        let add_edge = |unrolled: &mut Unrolled, from: usize, to: usize, predecessor: usize, cut: Option<Cut>| {
            let id = unrolled.edges.len();
            unrolled.edges.push(Edge {
                to,
                predecessor,
                cut,
            });
            unrolled.outgoing[from].push(id);
            unrolled.incoming[to].push(id);
        };
        // counters of loops left on the way from `from` to `to` restart
        let leave = |iteration: &[u32], from: usize, to: usize| -> Vec<u32> {
            iteration
                .iter()
                .zip(loops)
                .map(|(&count, lp)| {
                    if lp.contains(from) && !lp.contains(to) {
                        0
                    } else {
                        count
                    }
                })
                .collect()
        };

        if cfg.is_empty() {
            return Ok(unrolled);
        }
        intern(
            &mut unrolled,
            &mut queue,
            Instance {
                block: 0,
                iteration: vec![0; loops.len()],
            },
        );

        while let Some(current) = queue.pop_front() {
            if unrolled.instances.len() > MAX_BLOCK_INSTANCES {
                return Err(Error::unsupported(
                    format!("unrolling beyond {} block instances", MAX_BLOCK_INSTANCES),
                    Location::function(&self.function.name),
                ));
            }
            let Instance { block, iteration } = unrolled.instances[current].clone();

            for &successor in cfg.successors(block) {
                match back_edges.get(&(block, successor)) {
                    Some(&l) if iteration[l] + 1 < bound => {
                        let mut next = iteration.clone();
                        next[l] += 1;
                        let to = intern(
                            &mut unrolled,
                            &mut queue,
                            Instance {
                                block: successor,
                                iteration: next,
                            },
                        );
                        add_edge(&mut unrolled, current, to, block, None);
                    }
                    Some(&l) => {
                        let exits = loops[l].exits(cfg);
                        let latch = cfg.label(block).to_string();
                        let header = cfg.label(successor).to_string();
                        if !self.formula.cut_edges.contains(&(latch.clone(), header.clone())) {
                            self.formula.cut_edges.push((latch, header));
                        }
                        if exits.is_empty() {
                            warn!(
                                "@{}: loop at %{} has no exit, executions past the unroll bound are dropped",
                                self.function.name,
                                cfg.label(successor)
                            );
                        }
                        let id = cuts;
                        cuts += 1;
                        for (choice, &(inside, target)) in exits.iter().enumerate() {
                            let to = intern(
                                &mut unrolled,
                                &mut queue,
                                Instance {
                                    block: target,
                                    iteration: leave(&iteration, block, target),
                                },
                            );
                            let cut = Cut {
                                id,
                                loop_index: l,
                                choice,
                                choices: exits.len(),
                            };
                            add_edge(&mut unrolled, current, to, inside, Some(cut));
                        }
                    }
                    None => {
                        let to = intern(
                            &mut unrolled,
                            &mut queue,
                            Instance {
                                block: successor,
                                iteration: leave(&iteration, block, successor),
                            },
                        );
                        add_edge(&mut unrolled, current, to, block, None);
                    }
                }
            }
        }

        // Kahn's algorithm, ties broken by discovery order
        let mut pending: Vec<usize> = unrolled.incoming.iter().map(|i| i.len()).collect();
        let mut ready: BTreeSet<usize> = (0..pending.len()).filter(|&i| pending[i] == 0).collect();
        while let Some(next) = ready.pop_first() {
            unrolled.order.push(next);
            for &edge in &unrolled.outgoing[next] {
                let to = unrolled.edges[edge].to;
                pending[to] -= 1;
                if pending[to] == 0 {
                    ready.insert(to);
                }
            }
        }
        if unrolled.order.len() != unrolled.instances.len() {
            return Err(Error::invariant(
                "unrolled block graph is cyclic",
                Location::function(&self.function.name),
            ));
        }
        Ok(unrolled)
    }

    fn initial_env(&mut self) -> Result<Env> {
        let function = self.function;
        let mut values = BTreeMap::new();
        for param in &function.params {
            let location = Location {
                function: Some(self.function.name.clone()),
                line: Some(self.function.line),
                ..Default::default()
            };
            let sort = self.sort_of(&param.ty, &location)?;
            let name = format!("{}.%{}", self.function.name, param.name);
            let var = self.input(&name, sort);
            self.formula.values.push((name, var.clone()));
            values.insert(param.name.clone(), var);
        }

        let init_name = format!("{}.mem.init", self.function.name);
        let memory = self.input(&init_name, Sort::Memory);
        let memory = self.allocate_globals(memory)?;
        Ok(Env { values, memory })
    }

    fn encode_instances(
        &mut self,
        cfg: &Cfg,
        loops: &[Loop],
        unrolled: &Unrolled,
        initial: Env,
    ) -> Result<()> {
        let function = self.function;
        let mut edge_guards: Vec<Option<ExprRef>> = vec![None; unrolled.edges.len()];
        let mut edge_envs: Vec<Option<Env>> = vec![None; unrolled.edges.len()];
        let mut initial = Some(initial);
        let loop_sorts: Vec<Vec<(String, Sort)>> = loops
            .iter()
            .map(|lp| self.defined_in(lp))
            .collect::<Result<_>>()?;

        for &current in &unrolled.order {
            let instance = &unrolled.instances[current];
            let block = &function.blocks[instance.block];
            let suffix = suffix(&instance.iteration);

            let incoming: Vec<(usize, ExprRef, Env)> = unrolled.incoming[current]
                .iter()
                .filter_map(|&e| {
                    let guard = edge_guards[e].take()?;
                    let env = edge_envs[e].take()?;
                    Some((e, guard, env))
                })
                .collect();

            let pc = if current == 0 {
                self.pool.tt()
            } else {
                let guards: Vec<ExprRef> = incoming.iter().map(|(_, g, _)| g.clone()).collect();
                self.pool.or(&guards)
            };
            let pc = self.define(
                format!("{}.pc.%{}{}", self.function.name, block.label, suffix),
                pc,
                format!("path condition of %{}{}", block.label, suffix),
            );
            self.formula.blocks.push(BlockInstance {
                label: block.label.clone(),
                iteration: instance.iteration.clone(),
                path_condition: pc.clone(),
            });

            let point = Point {
                label: block.label.clone(),
                suffix: suffix.clone(),
                pc: pc.clone(),
            };
            let mut env = match initial.take() {
                Some(env) if current == 0 => env,
                other => {
                    initial = other;
                    self.merge(&point, &incoming)
                }
            };
            if pc.is_false() {
                trace!("@{}: %{}{} is unreachable", self.function.name, block.label, suffix);
            }

            self.phis(&point, block, unrolled, &incoming, &mut env)?;
            for (index, instruction) in block.instructions.iter().enumerate() {
                if matches!(instruction.kind, InstructionKind::Phi { .. }) {
                    continue;
                }
                self.translate(&mut env, &point, index, instruction)?;
            }

            let guards = self.successor_guards(&env, &point, block)?;
            let mut havoc: FxHashMap<usize, Env> = FxHashMap::default();
            for &e in &unrolled.outgoing[current] {
                let edge = &unrolled.edges[e];
                let target = cfg.label(unrolled.instances[edge.to].block);
                let (guard, edge_env) = match edge.cut {
                    None => (self.lookup(&guards, target), env.clone()),
                    Some(cut) => {
                        let header = cfg.label(loops[cut.loop_index].header());
                        let guard = self.lookup(&guards, header);
                        let guard = self.pool.and2(&guard, &self.choose(cut));
                        if !havoc.contains_key(&cut.id) {
                            let fresh = self.havoc(&env, cut, &loop_sorts[cut.loop_index]);
                            havoc.insert(cut.id, fresh);
                        }
                        (guard, havoc[&cut.id].clone())
                    }
                };
                edge_guards[e] = Some(guard);
                edge_envs[e] = Some(edge_env);
            }
        }
        Ok(())
    }

    /// Joins predecessor environments, keeping names visible on every edge.
    fn merge(&mut self, point: &Point, incoming: &[(usize, ExprRef, Env)]) -> Env {
        if incoming.len() == 1 {
            return incoming[0].2.clone();
        }
        let first = match incoming.first() {
            Some((_, _, env)) => env,
            None => {
                // only reachable through edges that were never taken
                return Env {
                    values: BTreeMap::new(),
                    memory: self.pool.var(&format!("{}.mem.init", self.function.name), Sort::Memory),
                };
            }
        };

        let mut values = BTreeMap::new();
        for (name, _) in first.values.iter() {
            let arms: Option<Vec<(ExprRef, ExprRef)>> = incoming
                .iter()
                .map(|(_, guard, env)| env.values.get(name).map(|v| (guard.clone(), v.clone())))
                .collect();
            let arms = match arms {
                Some(arms) => arms,
                None => continue,
            };
            let merged = self.select_by_guard(&arms);
            let merged = if arms.iter().all(|(_, v)| *v == merged) {
                merged
            } else {
                self.define(
                    format!("{}.%{}@{}{}", self.function.name, name, point.label, point.suffix),
                    merged,
                    format!("%{} at %{}{}", name, point.label, point.suffix),
                )
            };
            values.insert(name.clone(), merged);
        }

        let arms: Vec<(ExprRef, ExprRef)> = incoming
            .iter()
            .map(|(_, guard, env)| (guard.clone(), env.memory.clone()))
            .collect();
        let memory = self.select_by_guard(&arms);
        let memory = if arms.iter().all(|(_, m)| *m == memory) {
            memory
        } else {
            let comment = format!("memory at %{}{}", point.label, point.suffix);
            self.memory_version(memory, comment)
        };
        Env { values, memory }
    }

    fn phis(
        &mut self,
        point: &Point,
        block: &crate::ir::Block,
        unrolled: &Unrolled,
        incoming: &[(usize, ExprRef, Env)],
        env: &mut Env,
    ) -> Result<()> {
        let function = self.function;
        let mut results = Vec::new();
        for (index, instruction) in block.instructions.iter().enumerate() {
            let (ty, values) = match &instruction.kind {
                InstructionKind::Phi { ty, incoming } => (ty, incoming),
                _ => continue,
            };
            let at = self.location(point, index, instruction.line);
            let sort = self.sort_of(ty, &at)?;
            let mut arms = Vec::with_capacity(incoming.len());
            for (e, guard, edge_env) in incoming {
                let predecessor = &function.blocks[unrolled.edges[*e].predecessor].label;
                let operand = values
                    .iter()
                    .find(|(_, label)| label == predecessor)
                    .map(|(operand, _)| operand)
                    .ok_or_else(|| {
                        Error::ssa(format!("phi lacks a value for predecessor %{}", predecessor), at.clone())
                    })?;
                let term = self.value(edge_env, operand, ty, &at)?;
                arms.push((guard.clone(), term));
            }
            let term = if arms.is_empty() {
                self.fresh_var("unreachable", sort)
            } else {
                self.select_by_guard(&arms)
            };
            if let Some(result) = &instruction.result {
                results.push((result.clone(), term, instruction.line));
            }
        }
        // phis read their operands before any of them is assigned
        for (result, term, line) in results {
            self.assign(env, point, &result, term, "phi", line);
        }
        Ok(())
    }

    /// Guard of every successor label of the block's terminator.
    fn successor_guards(
        &mut self,
        env: &Env,
        point: &Point,
        block: &crate::ir::Block,
    ) -> Result<Vec<(String, ExprRef)>> {
        let pool = self.pool;
        let pc = &point.pc;
        let index = block.instructions.len();
        let at = self.location(point, index, block.terminator_line);
        let mut guards: Vec<(String, ExprRef)> = Vec::new();
        let mut add = |label: &str, guard: ExprRef| match guards.iter_mut().find(|(l, _)| l == label) {
            Some((_, existing)) => *existing = pool.or2(existing, &guard),
            None => guards.push((label.to_string(), guard)),
        };

        match &block.terminator {
            Terminator::Br(target) => add(target, pc.clone()),
            Terminator::CondBr {
                cond,
                then,
                otherwise,
            } => {
                let c = self.value(env, cond, &Type::Int(1), &at)?;
                add(then, pool.and2(pc, &c));
                add(otherwise, pool.and2(pc, &pool.not(&c)));
            }
            Terminator::Switch {
                ty,
                value,
                default,
                cases,
            } => {
                let v = self.value(env, value, ty, &at)?;
                let mut matched = Vec::with_capacity(cases.len());
                for (case, label) in cases {
                    let constant = self.value(env, &Operand::Int(*case), ty, &at)?;
                    let hit = pool.eq(&v, &constant);
                    add(label, pool.and2(pc, &hit));
                    matched.push(hit);
                }
                add(default, pool.and2(pc, &pool.not(&pool.or(&matched))));
            }
            Terminator::Ret(value) => {
                if let Some(value) = value {
                    let term = self.value(env, &value.operand, &value.ty, &at)?;
                    self.returns.push((pc.clone(), term));
                }
            }
            Terminator::Unreachable => {}
            Terminator::Unsupported { construct } => {
                return Err(Error::unsupported(construct.clone(), at));
            }
        }
        Ok(guards)
    }

    /// Result sorts of the values defined inside a loop.
    fn defined_in(&self, lp: &Loop) -> Result<Vec<(String, Sort)>> {
        let mut defined = Vec::new();
        for &b in lp.nodes() {
            let block = &self.function.blocks[b];
            for (index, instruction) in block.instructions.iter().enumerate() {
                let (result, ty) = match (&instruction.result, result_type(&instruction.kind)) {
                    (Some(result), Some(ty)) => (result, ty),
                    _ => continue,
                };
                let at = Location::instruction(&self.function.name, &block.label, index, instruction.line);
                defined.push((result.clone(), self.sort_of(&ty, &at)?));
            }
        }
        Ok(defined)
    }

    /// Environment after an unknown number of further iterations.
    fn havoc(&mut self, env: &Env, cut: Cut, defined: &[(String, Sort)]) -> Env {
        let mut env = env.clone();
        for (name, sort) in defined {
            let var = self.input(
                &format!("{}.%{}!havoc{}", self.function.name, name, cut.id),
                *sort,
            );
            env.values.insert(name.clone(), var);
        }
        env.memory = self.input(&format!("{}.mem.havoc.loop{}", self.function.name, cut.id), Sort::Memory);
        env
    }

    /// Selector among the exits of a cut loop.
    fn choose(&mut self, cut: Cut) -> ExprRef {
        if cut.choices <= 1 {
            return self.pool.tt();
        }
        let selector = self.pool.var(
            &format!("{}.loop{}.exit", self.function.name, cut.id),
            Sort::BitVec(32),
        );
        if !self.formula.inputs.contains(&selector) {
            self.formula.inputs.push(selector.clone());
        }
        if cut.choice + 1 == cut.choices {
            let earlier: Vec<ExprRef> = (0..cut.choice)
                .map(|k| self.pool.eq(&selector, &self.pool.bv(k as u128, 32)))
                .collect();
            self.pool.not(&self.pool.or(&earlier))
        } else {
            self.pool.eq(&selector, &self.pool.bv(cut.choice as u128, 32))
        }
    }

    fn finish(mut self) -> Result<Formula> {
        let goal = match self.goal {
            Goal::AssertionFailure => self.pool.or(&self.failures),
            Goal::MemorySafety => self.pool.or(&self.violations),
            Goal::Reachable(labels) => {
                let mut reached = Vec::with_capacity(labels.len());
                for label in labels {
                    if self.function.block(label).is_none() {
                        return Err(Error::Config(format!(
                            "@{} has no block %{}",
                            self.function.name, label
                        )));
                    }
                    let instances: Vec<ExprRef> = self
                        .formula
                        .blocks
                        .iter()
                        .filter(|b| &b.label == label)
                        .map(|b| b.path_condition.clone())
                        .collect();
                    reached.push(self.pool.or(&instances));
                }
                self.pool.and(&reached)
            }
        };
        self.formula.goal_term = goal;

        if !self.returns.is_empty() {
            let returns = std::mem::take(&mut self.returns);
            let value = self.select_by_guard(&returns);
            let name = format!("{}.ret", self.function.name);
            let value = self.define(name.clone(), value, "return value".to_string());
            self.formula.values.push((name, value));
        }

        debug!(
            "@{}: {} assertions, {} inputs, {} allocations",
            self.function.name,
            self.formula.assertions.len(),
            self.formula.inputs.len(),
            self.memory.allocations().len()
        );
        Ok(self.formula)
    }

    //
    // Helpers shared with the translator
    //

    fn lookup(&self, guards: &[(String, ExprRef)], label: &str) -> ExprRef {
        guards
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, g)| g.clone())
            .unwrap_or_else(|| self.pool.ff())
    }

    fn location(&self, point: &Point, index: usize, line: usize) -> Location {
        Location::instruction(&self.function.name, &point.label, index, line)
    }

    /// `ite` chain over mutually exclusive guards, the last arm is the
    /// default.
    fn select_by_guard(&self, arms: &[(ExprRef, ExprRef)]) -> ExprRef {
        let mut iter = arms.iter().rev();
        let mut result = match iter.next() {
            Some((_, value)) => value.clone(),
            None => return self.pool.ff(),
        };
        for (guard, value) in iter {
            result = self.pool.ite(guard, value, &result);
        }
        result
    }

    /// Registers a named equation for a non-trivial term.
    fn define(&mut self, name: String, term: ExprRef, comment: String) -> ExprRef {
        if !term.is_atom() {
            self.formula
                .push(name, AssertionKind::Definition, term.clone(), comment);
        }
        term
    }

    fn assume(&mut self, term: ExprRef, comment: String) {
        if term.is_true() {
            return;
        }
        let name = format!("{}.assume.{}", self.function.name, self.formula.assertions.len());
        self.formula.push(name, AssertionKind::Assumption, term, comment);
    }

    fn input(&mut self, name: &str, sort: Sort) -> ExprRef {
        let var = self.pool.var(name, sort);
        self.formula.inputs.push(var.clone());
        var
    }

    fn fresh_var(&mut self, hint: &str, sort: Sort) -> ExprRef {
        self.fresh += 1;
        let name = format!("{}.{}.{}", self.function.name, hint, self.fresh);
        self.input(&name, sort)
    }

    fn memory_version(&mut self, memory: ExprRef, comment: String) -> ExprRef {
        if memory.is_atom() {
            return memory;
        }
        self.memory_versions += 1;
        let name = format!("{}.mem!{}", self.function.name, self.memory_versions);
        self.define(name, memory, comment)
    }

    /// Binds an instruction result in `env` and records its definition.
    fn assign(&mut self, env: &mut Env, point: &Point, result: &str, term: ExprRef, opcode: &str, line: usize) {
        let name = format!("{}.%{}{}", self.function.name, result, point.suffix);
        let term = self.define(
            name.clone(),
            term,
            format!("%{}{} = {} (line {})", result, point.suffix, opcode, line),
        );
        self.formula.values.push((name, term.clone()));
        env.values.insert(result.to_string(), term);
    }

    /// Sort of a first-class scalar type.
    fn sort_of(&self, ty: &Type, at: &Location) -> Result<Sort> {
        match self.module.resolve(ty) {
            Type::Int(1) => Ok(Sort::Bool),
            Type::Int(bits) if *bits <= 128 => Ok(Sort::BitVec(*bits)),
            Type::Ptr => Ok(Sort::BitVec(crate::ir::POINTER_BITS)),
            other => Err(Error::unsupported(format!("value of type {}", other), at.clone())),
        }
    }
}

fn suffix(iteration: &[u32]) -> String {
    if iteration.iter().all(|&i| i == 0) {
        String::new()
    } else {
        let counts: Vec<String> = iteration.iter().map(|i| i.to_string()).collect();
        format!("!{}", counts.join("."))
    }
}

fn result_type(kind: &InstructionKind) -> Option<Type> {
    match kind {
        InstructionKind::Binary { ty, .. }
        | InstructionKind::Select { ty, .. }
        | InstructionKind::Load { ty, .. }
        | InstructionKind::Phi { ty, .. } => Some(ty.clone()),
        InstructionKind::ICmp { .. } => Some(Type::Int(1)),
        InstructionKind::Cast { to, .. } => Some(to.clone()),
        InstructionKind::Freeze { value } => Some(value.ty.clone()),
        InstructionKind::Alloca { .. } | InstructionKind::Gep { .. } => Some(Type::Ptr),
        InstructionKind::Call { ret, .. } if !ret.is_void() => Some(ret.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use crate::smt::solver::{EnumerationSolver, Solver};

    fn encode_text(text: &str, name: &str, config: &Config, goal: Goal) -> Result<Formula> {
        let module = parse_module(text).expect("parses");
        let pool = ExprPool::new();
        let function = module.function(name).expect("function exists");
        encode(&module, function, config, &goal, &pool)
    }

    const DIAMOND: &str = r#"
define i8 @d(i8 %x) {
entry:
  %c = icmp ult i8 %x, 10
  br i1 %c, label %small, label %large
small:
  %a = add i8 %x, 1
  br label %join
large:
  %b = sub i8 %x, 1
  br label %join
join:
  %r = phi i8 [ %a, %small ], [ %b, %large ]
  %big = icmp ugt i8 %r, 200
  br i1 %big, label %never, label %exit
never:
  br label %exit
exit:
  ret i8 %r
}
"#;

    #[test]
    fn entry_is_true_and_join_merges_both_arms() {
        let formula = encode_text(DIAMOND, "d", &Config::default(), Goal::AssertionFailure).unwrap();
        assert!(formula.blocks[0].path_condition.is_true());
        let labels: Vec<&str> = formula.blocks.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["entry", "small", "large", "join", "never", "exit"]);
        assert!(formula.term_of("r").is_some());
        assert!(formula.goal_term.is_false());
    }

    #[test]
    fn reachability_of_blocks_matches_concrete_inputs() {
        let pool = ExprPool::new();
        let module = parse_module(DIAMOND).unwrap();
        let function = module.function("d").unwrap();
        let mut solver = EnumerationSolver::default();

        let reach = |label: &str| Goal::Reachable(vec![label.to_string()]);
        for label in ["small", "large", "join", "never", "exit"] {
            let formula = encode(&module, function, &Config::default(), &reach(label), &pool).unwrap();
            let verdict = formula.solve(&pool, &mut solver, 5_000).unwrap();
            assert!(verdict.is_sat(), "%{} should be reachable", label);
        }

        // %never needs r > 200, only possible through %large with x > 201
        let formula = encode(&module, function, &Config::default(), &reach("never"), &pool).unwrap();
        let verdict = formula.solve(&pool, &mut solver, 5_000).unwrap();
        let x = verdict.model().and_then(|m| m.get("d.%x")).unwrap().as_u128();
        assert!(x > 201);

        let both = Goal::Reachable(vec!["small".to_string(), "large".to_string()]);
        let formula = encode(&module, function, &Config::default(), &both, &pool).unwrap();
        assert!(formula.solve(&pool, &mut solver, 5_000).unwrap().is_unsat());
    }

    #[test]
    fn unknown_goal_label_is_a_configuration_error() {
        let goal = Goal::Reachable(vec!["nowhere".to_string()]);
        let result = encode_text(DIAMOND, "d", &Config::default(), goal);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn use_before_definition_violates_ssa() {
        let text = r#"
define i32 @f(i32 %x) {
entry:
  br i1 true, label %a, label %b
a:
  %y = add i32 %x, 1
  br label %b
b:
  %z = add i32 %y, 1
  ret i32 %z
}
"#;
        let result = encode_text(text, "f", &Config::default(), Goal::AssertionFailure);
        assert!(matches!(result, Err(Error::SsaViolation { .. })));
    }

    #[test]
    fn conflicting_phi_values_are_an_invariant_violation() {
        let text = r#"
define i32 @f(i1 %c) {
entry:
  br i1 %c, label %join, label %join
join:
  %r = phi i32 [ 1, %entry ], [ 2, %entry ]
  ret i32 %r
}
"#;
        let result = encode_text(text, "f", &Config::default(), Goal::AssertionFailure);
        assert!(matches!(result, Err(Error::InvariantViolation { .. })));
    }

    const COUNTER: &str = r#"
define i32 @count(i32 %n) {
entry:
  br label %header
header:
  %i = phi i32 [ 0, %entry ], [ %next, %body ]
  %more = icmp slt i32 %i, %n
  br i1 %more, label %body, label %exit
body:
  %next = add i32 %i, 1
  br label %header
exit:
  ret i32 %i
}
"#;

    #[test]
    fn loops_are_rejected_without_unroll_bound() {
        let result = encode_text(COUNTER, "count", &Config::default(), Goal::AssertionFailure);
        match result {
            Err(Error::LoopNotSupported { header, latch, .. }) => {
                assert_eq!(header, "header");
                assert_eq!(latch, "body");
            }
            other => panic!("expected loop rejection, got {:?}", other.map(|f| f.function)),
        }
    }

    #[test]
    fn unrolling_copies_the_body_bound_times() {
        let config = Config::default().with_unroll_bound(3);
        let formula = encode_text(COUNTER, "count", &config, Goal::AssertionFailure).unwrap();
        let bodies = formula.blocks.iter().filter(|b| b.label == "body").count();
        assert_eq!(bodies, 3);
        assert_eq!(
            formula.cut_edges,
            vec![("body".to_string(), "header".to_string())]
        );
        assert!(formula
            .inputs
            .iter()
            .any(|i| i.to_string().contains("havoc")));
    }

    #[test]
    fn unrolled_exit_is_reachable_after_the_bound() {
        let pool = ExprPool::new();
        let module = parse_module(COUNTER).unwrap();
        let function = module.function("count").unwrap();
        let config = Config::default().with_unroll_bound(2);
        let goal = Goal::Reachable(vec!["exit".to_string()]);
        let formula = encode(&module, function, &config, &goal, &pool).unwrap();
        let mut solver = EnumerationSolver::default();
        assert!(formula.solve(&pool, &mut solver, 5_000).unwrap().is_sat());
    }
}
