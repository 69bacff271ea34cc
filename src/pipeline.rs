//! Software pipelining for counted loops.
//!
//! Given a `for` loop whose body ops carry a stage assignment from an
//! external scheduler, rewrites it into a prologue (one peeled section per
//! stage beyond the first), a shorter steady-state kernel loop in which all
//! stages overlap, and either a peeled epilogue or a predicated tail.
//!
//! Values that are defined in one stage and used in a later one are
//! *versioned*: each such value occupies a run of consecutive kernel iter
//! args forming a shift register, the kernel reads the slot matching the
//! consumer's stage distance and yields a fresh value into the youngest
//! slot, and every other slot forwards from its younger neighbour.

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use thiserror::Error;
use tracing::debug;

use crate::ir::{BlockId, Func, OpId, OpKind, Value};
use crate::rewrite::{Rewriter, ValueMap};

// ─── Options and errors ─────────────────────────────────────────────────────

/// Which part of the pipelined loop an emitted op belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePart {
    Prologue,
    Kernel,
    Epilogue,
}

/// Returns the stage assignment for a loop: `(op, stage)` pairs in the
/// order ops should be emitted within one kernel iteration. An empty
/// schedule declines the loop.
pub type ScheduleFn = Box<dyn Fn(&Func, OpId) -> Vec<(OpId, u32)>>;

/// Wraps a cloned op so its execution is gated by the given predicate.
/// Returns the (possibly new) gated op, or `None` to refuse — which aborts
/// the transformation after partial mutation.
pub type PredicateFn = Box<dyn Fn(&mut Rewriter<'_>, OpId, Value) -> Option<OpId>>;

/// Called after each emitted clone with the part it belongs to and the
/// 0-based section index within that part (always 0 for the kernel).
pub type AnnotateFn = Box<dyn Fn(&mut Rewriter<'_>, OpId, PipelinePart, u32)>;

/// Options controlling [`pipeline_for_loop`].
pub struct PipelineOptions {
    pub get_schedule: ScheduleFn,
    /// Peel `max_stage` trailing iterations into an epilogue. When false,
    /// a `predicate` callback is required and the kernel keeps the full
    /// trip count, masking young stages near the end.
    pub peel_epilogue: bool,
    pub predicate: Option<PredicateFn>,
    pub annotate: Option<AnnotateFn>,
}

impl PipelineOptions {
    pub fn new(get_schedule: impl Fn(&Func, OpId) -> Vec<(OpId, u32)> + 'static) -> Self {
        PipelineOptions {
            get_schedule: Box::new(get_schedule),
            peel_epilogue: false,
            predicate: None,
            annotate: None,
        }
    }
}

/// Convenience annotator that records `Part:index` tags on emitted ops.
pub fn tag_annotator() -> AnnotateFn {
    Box::new(|rw, op, part, index| {
        rw.func_mut().ops[op].tags.push(format!("{part:?}:{index}"));
    })
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The loop does not meet the preconditions; nothing was changed.
    #[error("loop is not eligible for pipelining")]
    NotApplicable,
    /// The schedule is inconsistent with the loop; nothing was changed.
    #[error("invalid schedule: {message}")]
    InvalidSchedule { op: OpId, message: String },
    /// The predicate callback declined an op. The IR has been partially
    /// rewritten (but is structurally well formed); callers should treat
    /// this as a compilation failure.
    #[error("predication declined an op")]
    PredicationFailed { op: OpId },
}

// ─── Value versions ─────────────────────────────────────────────────────────

/// Map from an original value to its per-section replacements. Slot `j`
/// holds the value for the `j`-th peeled section in the prologue, and the
/// value `max_stage - j` iterations ahead of the current one inside the
/// kernel and epilogue.
struct ValueVersions {
    map: FxHashMap<Value, SmallVec<[Option<Value>; 4]>>,
    slots: usize,
}

impl ValueVersions {
    fn new(slots: usize) -> Self {
        ValueVersions {
            map: FxHashMap::default(),
            slots,
        }
    }

    fn set(&mut self, key: Value, index: u32, value: Value) {
        let slots = self.slots;
        let versions = self.map.entry(key).or_insert_with(|| smallvec![None; slots]);
        assert!((index as usize) < slots, "version index out of range");
        versions[index as usize] = Some(value);
    }

    /// The replacement for `key` at `index`. `None` when the key was never
    /// versioned (a loop-invariant value); a present key with an empty
    /// slot is a bug in the caller's index arithmetic.
    fn lookup(&self, key: Value, index: u32) -> Option<Value> {
        let versions = self.map.get(&key)?;
        assert!((index as usize) < versions.len(), "version index out of range");
        let slot = versions[index as usize];
        assert!(slot.is_some(), "read of unset version {index} of {key:?}");
        slot
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

// ─── Cross-stage liveranges ─────────────────────────────────────────────────

/// Coarse liverange for a value used in a later stage than its definition.
#[derive(Debug, Clone, Copy)]
struct Liverange {
    def_stage: u32,
    last_use_stage: u32,
}

/// Cross-stage values in first-seen order. Order matters: it fixes the
/// layout of the kernel loop's extra iter args.
#[derive(Default)]
struct CrossStageValues {
    entries: Vec<(Value, Liverange)>,
}

impl CrossStageValues {
    fn record(&mut self, value: Value, def_stage: u32, use_stage: u32) {
        if let Some((_, lr)) = self.entries.iter_mut().find(|(v, _)| *v == value) {
            lr.def_stage = def_stage;
            lr.last_use_stage = lr.last_use_stage.max(use_stage);
        } else {
            self.entries.push((
                value,
                Liverange {
                    def_stage,
                    last_use_stage: use_stage,
                },
            ));
        }
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if a % b != 0 && (a ^ b) >= 0 {
        quotient + 1
    } else {
        quotient
    }
}

// ─── The pipeliner ──────────────────────────────────────────────────────────

struct Pipeliner<'a> {
    for_op: OpId,
    body: BlockId,
    yield_op: OpId,
    lb: i64,
    ub: i64,
    step: i64,
    max_stage: u32,
    stages: FxHashMap<OpId, u32>,
    op_order: Vec<OpId>,
    peel_epilogue: bool,
    versions: ValueVersions,
    options: &'a PipelineOptions,
}

impl<'a> Pipeliner<'a> {
    /// Check preconditions and record the schedule. Fails without touching
    /// the IR.
    fn initialize(
        func: &Func,
        for_op: OpId,
        options: &'a PipelineOptions,
    ) -> Result<Self, PipelineError> {
        debug_assert_eq!(func.ops[for_op].kind, OpKind::For);
        let [lb_value, ub_value, step_value] = func.for_bounds(for_op);
        let (Some(lb), Some(ub), Some(step)) = (
            func.const_value(lb_value),
            func.const_value(ub_value),
            func.const_value(step_value),
        ) else {
            debug!("loop bounds are not constants; skipping");
            return Err(PipelineError::NotApplicable);
        };
        if step <= 0 {
            debug!("non-positive loop step; skipping");
            return Err(PipelineError::NotApplicable);
        }
        if !options.peel_epilogue && options.predicate.is_none() {
            debug!("no epilogue peeling and no predicate callback; skipping");
            return Err(PipelineError::NotApplicable);
        }

        let schedule = (options.get_schedule)(func, for_op);
        if schedule.is_empty() {
            debug!("scheduler declined the loop; skipping");
            return Err(PipelineError::NotApplicable);
        }
        let mut stages = FxHashMap::default();
        let mut op_order = Vec::with_capacity(schedule.len());
        let mut max_stage = 0;
        for (op, stage) in schedule {
            max_stage = max_stage.max(stage);
            stages.insert(op, stage);
            op_order.push(op);
        }

        let num_iterations = ceil_div(ub - lb, step);
        if num_iterations <= max_stage as i64 {
            debug!(num_iterations, max_stage, "fewer iterations than stages; skipping");
            return Err(PipelineError::NotApplicable);
        }

        let body = func.for_body(for_op);
        let yield_op = func.terminator(body);
        for &op in &func.blocks[body].ops {
            if op != yield_op && !stages.contains_key(&op) {
                return Err(PipelineError::InvalidSchedule {
                    op,
                    message: "op not assigned a pipeline stage".into(),
                });
            }
        }
        for &op in stages.keys() {
            if op == yield_op {
                return Err(PipelineError::InvalidSchedule {
                    op,
                    message: "the loop terminator must not be assigned a stage".into(),
                });
            }
            if func.ops[op].block != body {
                return Err(PipelineError::InvalidSchedule {
                    op,
                    message: "staged ops must live directly in the loop body block".into(),
                });
            }
        }
        // Loop carries are supported at distance 1 only: every yielded
        // value must come straight out of a staged body op.
        for &operand in func.yield_operands(for_op) {
            let staged = operand
                .defining_op()
                .is_some_and(|def| stages.contains_key(&def));
            if !staged {
                debug!("loop-carried dependency beyond distance 1; skipping");
                return Err(PipelineError::NotApplicable);
            }
        }

        Ok(Pipeliner {
            for_op,
            body,
            yield_op,
            lb,
            ub,
            step,
            max_stage,
            stages,
            op_order,
            peel_epilogue: options.peel_epilogue,
            versions: ValueVersions::new(max_stage as usize + 1),
            options,
        })
    }

    /// Resolve `value` to its defining op and carry distance: following a
    /// body iter arg to the matching yield operand adds distance 1. The
    /// induction variable and values from outside the loop resolve to
    /// `None`.
    fn defining_op_and_distance(&self, func: &Func, value: Value) -> Option<(OpId, i64)> {
        let mut distance = 0;
        let mut value = value;
        if let Value::Arg { block, index } = value {
            if block != self.body {
                return None;
            }
            if index == 0 {
                return None;
            }
            distance = 1;
            value = func.ops[self.yield_op].operands[index as usize - 1];
        }
        value.defining_op().map(|op| (op, distance))
    }

    /// Emit `max_stage` peeled sections before the loop; section `i` runs
    /// every op of stage `<= i`, priming one pipeline stage per section.
    fn emit_prologue(&mut self, rw: &mut Rewriter<'_>) {
        let inits: Vec<Value> = rw.func().for_inits(self.for_op).to_vec();
        for (j, &init) in inits.iter().enumerate() {
            let arg = rw.func().iter_arg(self.for_op, j);
            self.versions.set(arg, 0, init);
        }

        let iv = rw.func().induction_var(self.for_op);
        let yield_operands: Vec<Value> = rw.func().yield_operands(self.for_op).to_vec();
        for i in 0..self.max_stage {
            // The increment is implicit in the original loop; materialize
            // this section's induction value.
            let iv_const = rw.const_int(self.lb + i as i64 * self.step);
            self.versions.set(iv, i, iv_const);
            for idx in 0..self.op_order.len() {
                let op = self.op_order[idx];
                let stage = self.stages[&op];
                if stage > i {
                    continue;
                }
                let versions = &self.versions;
                let new_op = rw.clone_op_with(op, |value| versions.lookup(value, i - stage));
                if let Some(annotate) = &self.options.annotate {
                    annotate(rw, new_op, PipelinePart::Prologue, i);
                }
                let results = rw.func().ops[op].results;
                for dest in 0..results {
                    let original = Value::result(op, dest);
                    let replacement = Value::result(new_op, dest);
                    self.versions.set(original, i - stage, replacement);
                    // A yielded result also becomes the next section's
                    // version of the matching iter arg.
                    for (p, &yielded) in yield_operands.iter().enumerate() {
                        if yielded == original {
                            let arg = rw.func().iter_arg(self.for_op, p);
                            self.versions.set(arg, i - stage + 1, replacement);
                        }
                    }
                }
            }
        }
    }

    /// Collect values used in a strictly later stage than their
    /// definition; these must be threaded through kernel iter args.
    fn analyze_cross_stage_values(&self, func: &Func) -> CrossStageValues {
        let mut cross = CrossStageValues::default();
        for &op in &self.op_order {
            let stage = self.stages[&op];
            for operand in func.external_operands(op) {
                let Some((def, distance)) = self.defining_op_and_distance(func, operand) else {
                    continue;
                };
                let Some(&def_stage) = self.stages.get(&def) else {
                    continue;
                };
                // Same stage, or a loop carry whose distance exactly
                // compensates the stage gap, needs no extra threading.
                if def_stage == stage || def_stage as i64 + distance == stage as i64 {
                    continue;
                }
                assert!(stage > def_stage, "schedule violates def-before-use ordering");
                cross.record(operand, def_stage, stage);
            }
        }
        cross
    }

    /// Build the kernel loop: the original iter args seeded with their
    /// freshest prologue versions, plus one arg per version of each
    /// cross-stage value. `loop_arg_map` receives `(value, age) ->
    /// iter-arg position` for the kernel body to consult.
    fn create_kernel_loop(
        &mut self,
        rw: &mut Rewriter<'_>,
        cross: &CrossStageValues,
        loop_arg_map: &mut FxHashMap<(Value, u32), usize>,
    ) -> (OpId, BlockId) {
        let mut new_loop_args = Vec::new();
        let yield_operands: Vec<Value> = rw.func().yield_operands(self.for_op).to_vec();
        for (p, &yielded) in yield_operands.iter().enumerate() {
            let def = yielded.defining_op().expect("loop carries have distance 1");
            let def_stage = self.stages[&def];
            let arg = rw.func().iter_arg(self.for_op, p);
            let version = self
                .versions
                .lookup(arg, self.max_stage - def_stage)
                .expect("prologue produced no version for an iter arg");
            new_loop_args.push(version);
        }
        for &(value, lr) in &cross.entries {
            let span = lr.last_use_stage - lr.def_stage;
            for stage_idx in 0..span {
                let version = self
                    .versions
                    .lookup(value, self.max_stage - lr.last_use_stage + stage_idx)
                    .expect("prologue produced no version for a cross-stage value");
                new_loop_args.push(version);
                loop_arg_map.insert((value, span - stage_idx), new_loop_args.len() - 1);
            }
        }

        let [lb_value, ub_value, step_value] = rw.func().for_bounds(self.for_op);
        let new_ub = if self.peel_epilogue {
            rw.const_int(self.ub - self.max_stage as i64 * self.step)
        } else {
            ub_value
        };
        rw.create_for(lb_value, new_ub, step_value, &new_loop_args)
    }

    /// Clone the body into the kernel in user order, remapping operands
    /// that cross stages, shifting induction-variable uses, and predicating
    /// young stages in trailing-tail mode.
    fn create_kernel(
        &mut self,
        rw: &mut Rewriter<'_>,
        new_for: OpId,
        new_body: BlockId,
        cross: &CrossStageValues,
        loop_arg_map: &FxHashMap<(Value, u32), usize>,
    ) -> Result<(), PipelineError> {
        self.versions.clear();

        let iv = rw.func().induction_var(self.for_op);
        let new_iv = Value::arg(new_body, 0);
        let yield_operands: Vec<Value> = rw.func().yield_operands(self.for_op).to_vec();
        let num_iter_args = rw.func().num_iter_args(self.for_op);

        rw.set_insertion_point_to_start(new_body);
        let mut mapping = ValueMap::default();
        mapping.map(iv, new_iv);
        for j in 0..num_iter_args {
            let old_arg = rw.func().iter_arg(self.for_op, j);
            mapping.map(old_arg, Value::arg(new_body, (j + 1) as u16));
        }

        // One predicate per stage except the last, which always runs.
        let mut predicates: SmallVec<[Option<Value>; 4]> =
            smallvec![None; self.max_stage as usize + 1];
        if !self.peel_epilogue {
            for i in 0..self.max_stage {
                let bound = rw.const_int(self.ub - (self.max_stage - i) as i64 * self.step);
                predicates[i as usize] = Some(rw.lt(new_iv, bound));
            }
        }

        for idx in 0..self.op_order.len() {
            let op = self.op_order[idx];
            let use_stage = self.stages[&op];
            let (mut new_op, escapes) = rw.clone_op_mapped(op, &mut mapping);

            for escape in escapes {
                if escape.original == iv {
                    // Stage `s` logically runs `max_stage - s` iterations
                    // ahead of the kernel's induction value.
                    rw.set_insertion_point_before(new_op);
                    let offset =
                        rw.const_int((self.max_stage - use_stage) as i64 * self.step);
                    let shifted = rw.add(new_iv, offset);
                    rw.func_mut().ops[escape.owner].operands[escape.index] = shifted;
                    rw.set_insertion_point_after(new_op);
                    continue;
                }
                let mut source = escape.original;
                if let Value::Arg { block, index } = escape.original {
                    if block == self.body && index > 0 {
                        let ret = yield_operands[index as usize - 1];
                        let Some(dep) = ret.defining_op() else {
                            continue;
                        };
                        let Some(&dep_stage) = self.stages.get(&dep) else {
                            continue;
                        };
                        if dep_stage == use_stage {
                            continue;
                        }
                        // A carry from the next stage up is computed
                        // earlier in this same kernel iteration.
                        if dep_stage == use_stage + 1 {
                            rw.func_mut().ops[escape.owner].operands[escape.index] =
                                mapping.lookup_or_default(ret);
                            continue;
                        }
                        source = ret;
                    }
                }
                let Some(def) = source.defining_op() else {
                    continue;
                };
                let Some(&def_stage) = self.stages.get(&def) else {
                    continue;
                };
                if def_stage == use_stage {
                    continue;
                }
                let position = loop_arg_map
                    .get(&(escape.original, use_stage - def_stage))
                    .expect("cross-stage value missing from the kernel iter args");
                rw.func_mut().ops[escape.owner].operands[escape.index] =
                    Value::arg(new_body, (1 + position) as u16);
            }

            if let Some(pred) = predicates[use_stage as usize] {
                let predicate = self
                    .options
                    .predicate
                    .as_ref()
                    .expect("trailing-tail mode requires a predicate callback");
                let Some(predicated) = predicate(rw, new_op, pred) else {
                    return Err(PipelineError::PredicationFailed { op: new_op });
                };
                for index in 0..rw.func().ops[op].results {
                    mapping.map(Value::result(op, index), Value::result(predicated, index));
                }
                new_op = predicated;
            }
            rw.set_insertion_point_after(new_op);
            if let Some(annotate) = &self.options.annotate {
                annotate(rw, new_op, PipelinePart::Kernel, 0);
            }
        }

        // The kernel yield: original carries first, then the shift
        // registers for cross-stage values (each slot forwards from the
        // next younger one, the youngest receives this iteration's value).
        let mut yield_values: Vec<Value> = Vec::new();
        for (p, &yielded) in yield_operands.iter().enumerate() {
            let mut source = mapping.lookup_or_default(yielded);
            if !self.peel_epilogue && rw.func().has_uses(Value::result(self.for_op, p as u16)) {
                // The result escapes the loop and its stage can be masked
                // off near the end of the trip: keep the previous
                // iteration's value when the predicate is off.
                if let Some((def, _)) = self.defining_op_and_distance(rw.func(), yielded) {
                    if let Some(&def_stage) = self.stages.get(&def) {
                        if def_stage < self.max_stage {
                            let pred = predicates[def_stage as usize]
                                .expect("every stage below the last has a predicate");
                            source =
                                rw.select(pred, source, Value::arg(new_body, (p + 1) as u16));
                        }
                    }
                }
            }
            yield_values.push(source);
        }
        for &(value, lr) in &cross.entries {
            let mut version = self.max_stage - lr.last_use_stage + 1;
            let span = lr.last_use_stage - lr.def_stage;
            for _ in 1..span {
                self.versions.set(
                    value,
                    version,
                    Value::result(new_for, yield_values.len() as u16),
                );
                version += 1;
                // Skip the induction variable and step to the next
                // younger slot of this value's shift register.
                let arg_index = yield_values.len() + 2;
                yield_values.push(Value::arg(new_body, arg_index as u16));
            }
            self.versions.set(
                value,
                version,
                Value::result(new_for, yield_values.len() as u16),
            );
            yield_values.push(mapping.lookup_or_default(value));
        }
        // Iter args carried by late stages pick their epilogue versions
        // off the kernel results.
        for (p, &yielded) in yield_operands.iter().enumerate() {
            let def = yielded.defining_op().expect("loop carries have distance 1");
            let def_stage = self.stages[&def];
            if def_stage > 0 {
                let arg = rw.func().iter_arg(self.for_op, p);
                self.versions.set(
                    arg,
                    self.max_stage - def_stage + 1,
                    Value::result(new_for, p as u16),
                );
            }
        }
        rw.create_yield(yield_values);
        Ok(())
    }

    /// Emit `max_stage` peeled sections after the kernel; section `i`
    /// (1-based) runs every op of stage `>= i`, draining one stage per
    /// section. Returns the final value of each loop result, where one
    /// exists.
    fn emit_epilogue(&mut self, rw: &mut Rewriter<'_>) -> Vec<Option<Value>> {
        let num_results = rw.func().num_iter_args(self.for_op);
        let mut return_values: Vec<Option<Value>> = vec![None; num_results];
        let iv = rw.func().induction_var(self.for_op);
        let yield_operands: Vec<Value> = rw.func().yield_operands(self.for_op).to_vec();

        // Induction values of the last `max_stage` real iterations. Unused
        // ones are dead code.
        for i in 0..self.max_stage {
            let last_iter =
                self.lb + self.step * ((self.ub - 1 - self.lb) / self.step - i as i64);
            let constant = rw.const_int(last_iter);
            self.versions.set(iv, self.max_stage - i, constant);
        }

        for i in 1..=self.max_stage {
            for idx in 0..self.op_order.len() {
                let op = self.op_order[idx];
                let stage = self.stages[&op];
                if stage < i {
                    continue;
                }
                let version_index = self.max_stage - stage + i;
                let versions = &self.versions;
                let new_op = rw.clone_op_with(op, |value| versions.lookup(value, version_index));
                if let Some(annotate) = &self.options.annotate {
                    annotate(rw, new_op, PipelinePart::Epilogue, i - 1);
                }
                let results = rw.func().ops[op].results;
                for dest in 0..results {
                    let original = Value::result(op, dest);
                    let replacement = Value::result(new_op, dest);
                    self.versions.set(original, version_index, replacement);
                    for (p, &yielded) in yield_operands.iter().enumerate() {
                        if yielded != original {
                            continue;
                        }
                        let version = version_index + 1;
                        // Past the last section the value is the loop's
                        // final result; otherwise it feeds the next one.
                        if version > self.max_stage {
                            return_values[p] = Some(replacement);
                        } else {
                            let arg = rw.func().iter_arg(self.for_op, p);
                            self.versions.set(arg, version, replacement);
                        }
                    }
                }
            }
        }
        return_values
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

/// Pipeline one counted loop. On success the original loop is erased, its
/// result uses are redirected, and the new kernel loop's id is returned.
///
/// [`PipelineError::NotApplicable`] and [`PipelineError::InvalidSchedule`]
/// leave the function untouched; [`PipelineError::PredicationFailed`]
/// aborts after partial rewriting.
pub fn pipeline_for_loop(
    func: &mut Func,
    for_op: OpId,
    options: &PipelineOptions,
) -> Result<OpId, PipelineError> {
    let mut pipeliner = Pipeliner::initialize(func, for_op, options)?;
    debug!(stages = pipeliner.max_stage + 1, "pipelining loop");

    let mut rw = Rewriter::before(func, for_op);
    pipeliner.emit_prologue(&mut rw);

    let cross = pipeliner.analyze_cross_stage_values(rw.func());
    let mut loop_arg_map = FxHashMap::default();
    let (new_for, new_body) = pipeliner.create_kernel_loop(&mut rw, &cross, &mut loop_arg_map);
    pipeliner.create_kernel(&mut rw, new_for, new_body, &cross, &loop_arg_map)?;

    let num_results = rw.func().num_iter_args(for_op);
    let return_values: Vec<Option<Value>> = if options.peel_epilogue {
        rw.set_insertion_point_after(new_for);
        pipeliner.emit_epilogue(&mut rw)
    } else {
        (0..num_results)
            .map(|p| Some(Value::result(new_for, p as u16)))
            .collect()
    };

    for (p, replacement) in return_values.iter().enumerate() {
        let old = Value::result(for_op, p as u16);
        match replacement {
            Some(new) => rw.replace_uses_of(old, *new),
            None => debug_assert!(
                !rw.func().has_uses(old),
                "loop result {p} has uses but the epilogue produced no final value"
            ),
        }
    }
    rw.erase_op(for_op);
    Ok(new_for)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Machine;
    use crate::ir::{Block, FuncBuilder, Mem};

    fn fixed_schedule(pairs: Vec<(OpId, u32)>) -> ScheduleFn {
        Box::new(move |_: &Func, _: OpId| pairs.clone())
    }

    fn assert_same_semantics(original: &Func, transformed: &Func, mems: Vec<Vec<i64>>) {
        let mut before = Machine::new(mems.clone());
        let results_before = before.run(original).unwrap();
        let mut after = Machine::new(mems);
        let results_after = after.run(transformed).unwrap();
        assert_eq!(results_before, results_after, "loop results diverged");
        assert_eq!(before.mems, after.mems, "memory effects diverged");
    }

    /// Ops in the function carrying a `Part:index` tag, with their kinds.
    fn tagged_ops(func: &Func, tag: &str) -> Vec<OpKind> {
        func.reachable_ops()
            .into_iter()
            .filter(|&op| func.ops[op].tags.iter().any(|t| t == tag))
            .map(|op| func.ops[op].kind.clone())
            .collect()
    }

    fn has_part_tags(func: &Func, part: &str) -> bool {
        func.reachable_ops()
            .into_iter()
            .any(|op| func.ops[op].tags.iter().any(|t| t.starts_with(part)))
    }

    /// Gates a cloned op behind `pred` by moving it into a fresh `if`;
    /// masked-off results read as zero.
    fn predicate_with_if(rw: &mut Rewriter<'_>, op: OpId, pred: Value) -> Option<OpId> {
        let results = rw.func().ops[op].results;
        rw.set_insertion_point_before(op);

        let then_block = rw.func_mut().blocks.push(Block {
            arg_count: 0,
            ops: Vec::new(),
        });
        let mut regions = vec![then_block];
        let else_block = (results > 0).then(|| {
            let block = rw.func_mut().blocks.push(Block {
                arg_count: 0,
                ops: Vec::new(),
            });
            regions.push(block);
            block
        });
        let if_op = rw.create(OpKind::If, vec![pred], results, regions);

        rw.move_op_to_block_end(op, then_block);
        rw.set_insertion_point_to_end(then_block);
        let yielded = (0..results).map(|i| Value::result(op, i)).collect();
        rw.create_yield(yielded);
        if let Some(else_block) = else_block {
            rw.set_insertion_point_to_end(else_block);
            let zeros: Vec<Value> = (0..results).map(|_| rw.const_int(0)).collect();
            rw.create_yield(zeros);
        }
        rw.set_insertion_point_after(if_op);
        Some(if_op)
    }

    /// `r[i] = a[i] * 2`, staged load=0 / mul=1 / store=1.
    fn two_stage_loop(ub: i64) -> (Func, OpId, Vec<(OpId, u32)>) {
        let mut fb = FuncBuilder::new();
        let lb = fb.const_int(0);
        let ub = fb.const_int(ub);
        let step = fb.const_int(1);
        let two = fb.const_int(2);
        let mut schedule = Vec::new();
        let (for_op, _) = fb.for_loop(lb, ub, step, &[], |fb, iv, _| {
            let x = fb.load(Mem(0), iv);
            let y = fb.mul(x, two);
            let store = fb.store(Mem(1), iv, y);
            schedule.push((x.defining_op().unwrap(), 0));
            schedule.push((y.defining_op().unwrap(), 1));
            schedule.push((store, 1));
            vec![]
        });
        fb.ret(&[]);
        (fb.finish(), for_op, schedule)
    }

    fn added_iter_args(func: &Func, kernel: OpId, original_iter_args: usize) -> usize {
        func.num_iter_args(kernel) - original_iter_args
    }

    fn kernel_ub(func: &Func, kernel: OpId) -> i64 {
        func.const_value(func.for_bounds(kernel)[1]).unwrap()
    }

    #[test]
    fn single_stage_schedule_is_a_trivial_rewrite() {
        let mut fb = FuncBuilder::new();
        let lb = fb.const_int(0);
        let ub = fb.const_int(10);
        let step = fb.const_int(1);
        let mut schedule = Vec::new();
        let (for_op, _) = fb.for_loop(lb, ub, step, &[], |fb, iv, _| {
            let x = fb.load(Mem(0), iv);
            let store = fb.store(Mem(1), iv, x);
            schedule.push((x.defining_op().unwrap(), 0));
            schedule.push((store, 0));
            vec![]
        });
        fb.ret(&[]);
        let original = fb.finish();
        let mut func = original.clone();

        let mut options = PipelineOptions::new(move |_: &Func, _: OpId| schedule.clone());
        options.peel_epilogue = true;
        options.annotate = Some(tag_annotator());
        let kernel = pipeline_for_loop(&mut func, for_op, &options).unwrap();

        // With a single stage nothing is peeled and no values cross stages.
        assert_eq!(kernel_ub(&func, kernel), 10);
        assert_eq!(added_iter_args(&func, kernel, 0), 0);
        assert!(!has_part_tags(&func, "Prologue"));
        assert!(!has_part_tags(&func, "Epilogue"));

        let a: Vec<i64> = (0..10).map(|i| i * i).collect();
        assert_same_semantics(&original, &func, vec![a, vec![0; 10]]);
    }

    #[test]
    fn two_stage_peeled_pipelines_the_load() {
        let (original, for_op, schedule) = two_stage_loop(8);
        let mut func = original.clone();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.peel_epilogue = true;
        options.annotate = Some(tag_annotator());
        let kernel = pipeline_for_loop(&mut func, for_op, &options).unwrap();

        // One peeled iteration on each side; one cross-stage value.
        assert_eq!(kernel_ub(&func, kernel), 7);
        assert_eq!(added_iter_args(&func, kernel, 0), 1);
        assert_eq!(
            tagged_ops(&func, "Prologue:0"),
            vec![OpKind::Load { mem: Mem(0) }]
        );
        assert_eq!(
            tagged_ops(&func, "Epilogue:0"),
            vec![OpKind::Mul, OpKind::Store { mem: Mem(1) }]
        );

        let a = vec![3, 1, 4, 1, 5, 9, 2, 6];
        assert_same_semantics(&original, &func, vec![a, vec![0; 8]]);
    }

    #[test]
    fn kernel_shifts_induction_uses_per_stage() {
        let (original, for_op, schedule) = two_stage_loop(8);
        let mut func = original.clone();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.peel_epilogue = true;
        let kernel = pipeline_for_loop(&mut func, for_op, &options).unwrap();
        let body = func.for_body(kernel);
        let new_iv = Value::arg(body, 0);

        let offset_of = |func: &Func, op: OpId, operand: usize| -> i64 {
            let shifted = func.ops[op].operands[operand];
            let add = shifted.defining_op().unwrap();
            assert_eq!(func.ops[add].kind, OpKind::Add);
            assert_eq!(func.ops[add].operands[0], new_iv);
            func.const_value(func.ops[add].operands[1]).unwrap()
        };

        // Stage 0 runs one iteration ahead of stage 1.
        for &op in &func.blocks[body].ops {
            match func.ops[op].kind {
                OpKind::Load { .. } => assert_eq!(offset_of(&func, op, 0), 1),
                OpKind::Store { .. } => assert_eq!(offset_of(&func, op, 0), 0),
                _ => {}
            }
        }
    }

    #[test]
    fn two_stage_trailing_tail_predicates_the_load() {
        let (original, for_op, schedule) = two_stage_loop(8);
        let mut func = original.clone();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.predicate = Some(Box::new(predicate_with_if));
        options.annotate = Some(tag_annotator());
        let kernel = pipeline_for_loop(&mut func, for_op, &options).unwrap();

        // Full trip count: the warm-up is still peeled, the drain is not.
        assert_eq!(kernel_ub(&func, kernel), 8);
        assert!(has_part_tags(&func, "Prologue"));
        assert!(!has_part_tags(&func, "Epilogue"));

        // The load sits behind an `if` guarded by `iv < 7`; the last-stage
        // ops stay bare.
        let body = func.for_body(kernel);
        let mut saw_guarded_load = false;
        for &op in &func.blocks[body].ops {
            match &func.ops[op].kind {
                OpKind::If => {
                    let cond = func.ops[op].operands[0];
                    let lt = cond.defining_op().unwrap();
                    assert_eq!(func.ops[lt].kind, OpKind::Lt);
                    assert_eq!(func.const_value(func.ops[lt].operands[1]), Some(7));
                    let then_ops = &func.blocks[func.ops[op].regions[0]].ops;
                    saw_guarded_load |= then_ops
                        .iter()
                        .any(|&o| matches!(func.ops[o].kind, OpKind::Load { .. }));
                }
                OpKind::Load { .. } => panic!("stage-0 load left unpredicated"),
                _ => {}
            }
        }
        assert!(saw_guarded_load);

        let a = vec![2, 7, 1, 8, 2, 8, 1, 8];
        assert_same_semantics(&original, &func, vec![a, vec![0; 8]]);
    }

    #[test]
    fn three_stage_threads_two_shift_registers() {
        let mut fb = FuncBuilder::new();
        let lb = fb.const_int(0);
        let ub = fb.const_int(20);
        let step = fb.const_int(1);
        let three = fb.const_int(3);
        let five = fb.const_int(5);
        let mut schedule = Vec::new();
        let (for_op, _) = fb.for_loop(lb, ub, step, &[], |fb, iv, _| {
            let x = fb.load(Mem(0), iv);
            let y = fb.mul(x, three);
            let z = fb.add(y, five);
            let store = fb.store(Mem(1), iv, z);
            schedule.push((x.defining_op().unwrap(), 0));
            schedule.push((y.defining_op().unwrap(), 1));
            schedule.push((z.defining_op().unwrap(), 2));
            schedule.push((store, 2));
            vec![]
        });
        fb.ret(&[]);
        let original = fb.finish();
        let mut func = original.clone();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.peel_epilogue = true;
        options.annotate = Some(tag_annotator());
        let kernel = pipeline_for_loop(&mut func, for_op, &options).unwrap();

        // Two cross-stage values, one version each.
        assert_eq!(kernel_ub(&func, kernel), 18);
        assert_eq!(added_iter_args(&func, kernel, 0), 2);

        // Section populations: the prologue fills stages top-down, the
        // epilogue drains them bottom-up.
        assert_eq!(tagged_ops(&func, "Prologue:0").len(), 1);
        assert_eq!(tagged_ops(&func, "Prologue:1").len(), 2);
        assert_eq!(tagged_ops(&func, "Epilogue:0").len(), 3);
        assert_eq!(tagged_ops(&func, "Epilogue:1").len(), 2);

        let a: Vec<i64> = (0..20).map(|i| 7 * i % 13).collect();
        assert_same_semantics(&original, &func, vec![a, vec![0; 20]]);
    }

    #[test]
    fn accumulator_carry_survives_peeling() {
        let mut fb = FuncBuilder::new();
        let lb = fb.const_int(0);
        let ub = fb.const_int(6);
        let step = fb.const_int(1);
        let init = fb.const_int(0);
        let mut schedule = Vec::new();
        let (for_op, results) = fb.for_loop(lb, ub, step, &[init], |fb, iv, args| {
            let x = fb.load(Mem(0), iv);
            let acc = fb.add(args[0], x);
            schedule.push((x.defining_op().unwrap(), 0));
            schedule.push((acc.defining_op().unwrap(), 1));
            vec![acc]
        });
        fb.ret(&results);
        let original = fb.finish();
        let mut func = original.clone();

        let body_ops: Vec<OpId> = func.blocks[func.for_body(for_op)].ops.clone();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.peel_epilogue = true;
        let kernel = pipeline_for_loop(&mut func, for_op, &options).unwrap();

        // The accumulator arg plus one version of the loaded value.
        assert_eq!(added_iter_args(&func, kernel, 1), 1);

        // Nothing reachable refers into the erased loop.
        for op in func.reachable_ops() {
            for operand in &func.ops[op].operands {
                if let Some(def) = operand.defining_op() {
                    assert!(def != for_op, "use of an erased loop result");
                    assert!(!body_ops.contains(&def), "use of an erased body op");
                }
            }
        }

        assert_same_semantics(&original, &func, vec![vec![4, 8, 15, 16, 23, 42]]);
    }

    #[test]
    fn trailing_tail_selects_masked_escaping_results() {
        // The loop's result is its stage-0 load; in trailing-tail mode the
        // kernel must keep the previous iteration's value once the load is
        // masked off.
        let mut fb = FuncBuilder::new();
        let lb = fb.const_int(0);
        let ub = fb.const_int(6);
        let step = fb.const_int(1);
        let two = fb.const_int(2);
        let init = fb.const_int(0);
        let mut schedule = Vec::new();
        let (for_op, results) = fb.for_loop(lb, ub, step, &[init], |fb, iv, _| {
            let x = fb.load(Mem(0), iv);
            let y = fb.mul(x, two);
            let store = fb.store(Mem(1), iv, y);
            schedule.push((x.defining_op().unwrap(), 0));
            schedule.push((y.defining_op().unwrap(), 1));
            schedule.push((store, 1));
            vec![x]
        });
        fb.ret(&results);
        let original = fb.finish();
        let mut func = original.clone();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.predicate = Some(Box::new(predicate_with_if));
        let kernel = pipeline_for_loop(&mut func, for_op, &options).unwrap();

        // The kernel yields the carried value through a select on the
        // stage-0 predicate.
        let body = func.for_body(kernel);
        let yield_op = func.terminator(body);
        let first = func.ops[yield_op].operands[0];
        assert_eq!(
            func.ops[first.defining_op().unwrap()].kind,
            OpKind::Select
        );

        let a = vec![6, 2, 8, 3, 1, 9];
        assert_same_semantics(&original, &func, vec![a, vec![0; 6]]);
    }

    #[test]
    fn refuses_trips_shorter_than_the_pipeline() {
        let mut fb = FuncBuilder::new();
        let lb = fb.const_int(0);
        let ub = fb.const_int(3);
        let step = fb.const_int(1);
        let three = fb.const_int(3);
        let mut schedule = Vec::new();
        let (for_op, _) = fb.for_loop(lb, ub, step, &[], |fb, iv, _| {
            let x = fb.load(Mem(0), iv);
            let y = fb.mul(x, three);
            let z = fb.add(y, three);
            let store = fb.store(Mem(1), iv, z);
            schedule.push((x.defining_op().unwrap(), 0));
            schedule.push((y.defining_op().unwrap(), 1));
            schedule.push((z.defining_op().unwrap(), 2));
            schedule.push((store, 3));
            vec![]
        });
        fb.ret(&[]);
        let mut func = fb.finish();
        let text = func.to_string();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.peel_epilogue = true;

        // Refusal twice over leaves the function bit-identical.
        for _ in 0..2 {
            let error = pipeline_for_loop(&mut func, for_op, &options).unwrap_err();
            assert!(matches!(error, PipelineError::NotApplicable));
            assert_eq!(func.to_string(), text);
        }
    }

    #[test]
    fn diagnoses_an_op_without_a_stage() {
        let (original, for_op, mut schedule) = two_stage_loop(8);
        let mut func = original.clone();
        let missing = schedule.pop().unwrap().0;

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.peel_epilogue = true;

        let error = pipeline_for_loop(&mut func, for_op, &options).unwrap_err();
        match error {
            PipelineError::InvalidSchedule { op, .. } => assert_eq!(op, missing),
            other => panic!("expected a schedule diagnostic, got {other:?}"),
        }
        assert_eq!(func.to_string(), original.to_string());
    }

    #[test]
    fn refuses_non_constant_bounds() {
        let mut fb = FuncBuilder::new();
        let lb = fb.const_int(0);
        let four = fb.const_int(4);
        let ub = fb.add(four, four);
        let step = fb.const_int(1);
        let mut schedule = Vec::new();
        let (for_op, _) = fb.for_loop(lb, ub, step, &[], |fb, iv, _| {
            let x = fb.load(Mem(0), iv);
            let store = fb.store(Mem(1), iv, x);
            schedule.push((x.defining_op().unwrap(), 0));
            schedule.push((store, 1));
            vec![]
        });
        fb.ret(&[]);
        let mut func = fb.finish();
        let text = func.to_string();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.peel_epilogue = true;
        let error = pipeline_for_loop(&mut func, for_op, &options).unwrap_err();
        assert!(matches!(error, PipelineError::NotApplicable));
        assert_eq!(func.to_string(), text);
    }

    #[test]
    fn refuses_without_epilogue_or_predicate() {
        let (original, for_op, schedule) = two_stage_loop(8);
        let mut func = original.clone();

        let options = PipelineOptions::new(fixed_schedule(schedule));
        let error = pipeline_for_loop(&mut func, for_op, &options).unwrap_err();
        assert!(matches!(error, PipelineError::NotApplicable));
        assert_eq!(func.to_string(), original.to_string());
    }

    #[test]
    fn predication_refusal_is_a_hard_failure() {
        let (original, for_op, schedule) = two_stage_loop(8);
        let mut func = original.clone();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.predicate = Some(Box::new(|_: &mut Rewriter<'_>, _: OpId, _: Value| None));
        let error = pipeline_for_loop(&mut func, for_op, &options).unwrap_err();
        assert!(matches!(error, PipelineError::PredicationFailed { .. }));
    }

    #[test]
    fn pipelined_output_round_trips_through_text() {
        let (original, for_op, schedule) = two_stage_loop(8);
        let mut func = original.clone();

        let mut options = PipelineOptions::new(fixed_schedule(schedule));
        options.peel_epilogue = true;
        pipeline_for_loop(&mut func, for_op, &options).unwrap();

        let reparsed = crate::ir_parse::parse_func(&func.to_string()).unwrap();
        let a = vec![5, 0, 3, 9, 4, 4, 2, 1];
        assert_same_semantics(&func, &reparsed, vec![a, vec![0; 8]]);
    }

    #[test]
    fn ceil_div_rounds_toward_positive_infinity() {
        assert_eq!(ceil_div(8, 2), 4);
        assert_eq!(ceil_div(7, 2), 4);
        assert_eq!(ceil_div(1, 3), 1);
        assert_eq!(ceil_div(0, 3), 0);
        assert_eq!(ceil_div(-3, 2), -1);
    }
}
