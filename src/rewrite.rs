//! In-place rewriting over [`Func`]: an insertion cursor, op cloning with
//! operand substitution, use replacement, and op erasure.
//!
//! The rewriter borrows the function mutably and carries a single insertion
//! point. Anything that emits ancillary ops around a clone (offset
//! arithmetic, predicates) saves and restores the cursor so the main clone
//! position is preserved.

use rustc_hash::FxHashMap;

use crate::ir::{Block, BlockId, Func, Op, OpId, OpKind, Value};

// ─── Value mapping ──────────────────────────────────────────────────────────

/// Mapping from original values to their replacements, with
/// lookup-or-default semantics: unmapped values pass through unchanged.
#[derive(Default)]
pub struct ValueMap {
    map: FxHashMap<Value, Value>,
}

impl ValueMap {
    pub fn map(&mut self, from: Value, to: Value) {
        self.map.insert(from, to);
    }

    pub fn lookup(&self, value: Value) -> Option<Value> {
        self.map.get(&value).copied()
    }

    pub fn lookup_or_default(&self, value: Value) -> Value {
        self.lookup(value).unwrap_or(value)
    }
}

// ─── Insertion point ────────────────────────────────────────────────────────

/// A position between two ops of a block (or at either end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertPoint {
    pub block: BlockId,
    pub index: usize,
}

// ─── Escaped operands ───────────────────────────────────────────────────────

/// One operand slot of a freshly cloned op (or of an op nested under it)
/// whose original value was defined outside the cloned op. Callers use
/// these to re-target cross-stage references after cloning.
#[derive(Debug, Clone, Copy)]
pub struct EscapedOperand {
    /// The op in the clone that owns the operand.
    pub owner: OpId,
    /// Operand slot on `owner`.
    pub index: usize,
    /// The value the original op referenced at this slot.
    pub original: Value,
}

// ─── Rewriter ───────────────────────────────────────────────────────────────

/// Mutable borrow of a [`Func`] plus an insertion cursor.
pub struct Rewriter<'f> {
    func: &'f mut Func,
    point: InsertPoint,
}

impl<'f> Rewriter<'f> {
    /// A rewriter whose cursor sits immediately before `op`.
    pub fn before(func: &'f mut Func, op: OpId) -> Self {
        let block = func.ops[op].block;
        let index = func.blocks[block]
            .ops
            .iter()
            .position(|&o| o == op)
            .expect("op is not linked into its block");
        Rewriter {
            func,
            point: InsertPoint { block, index },
        }
    }

    pub fn func(&self) -> &Func {
        self.func
    }

    pub fn func_mut(&mut self) -> &mut Func {
        self.func
    }

    // ── Cursor management ───────────────────────────────────────────

    pub fn insertion_point(&self) -> InsertPoint {
        self.point
    }

    pub fn restore_insertion_point(&mut self, point: InsertPoint) {
        self.point = point;
    }

    pub fn set_insertion_point_before(&mut self, op: OpId) {
        let block = self.func.ops[op].block;
        let index = self.position_in_block(op);
        self.point = InsertPoint { block, index };
    }

    pub fn set_insertion_point_after(&mut self, op: OpId) {
        let block = self.func.ops[op].block;
        let index = self.position_in_block(op) + 1;
        self.point = InsertPoint { block, index };
    }

    pub fn set_insertion_point_to_start(&mut self, block: BlockId) {
        self.point = InsertPoint { block, index: 0 };
    }

    pub fn set_insertion_point_to_end(&mut self, block: BlockId) {
        let index = self.func.blocks[block].ops.len();
        self.point = InsertPoint { block, index };
    }

    fn position_in_block(&self, op: OpId) -> usize {
        let block = self.func.ops[op].block;
        self.func.blocks[block]
            .ops
            .iter()
            .position(|&o| o == op)
            .expect("op is not linked into its block")
    }

    // ── Op creation ─────────────────────────────────────────────────

    /// Create an op at the cursor and advance past it.
    pub fn create(
        &mut self,
        kind: OpKind,
        operands: Vec<Value>,
        results: u16,
        regions: Vec<BlockId>,
    ) -> OpId {
        let op = self.func.ops.push(Op {
            block: self.point.block,
            kind,
            operands,
            results,
            regions,
            tags: Vec::new(),
        });
        self.link_at_cursor(op);
        op
    }

    fn link_at_cursor(&mut self, op: OpId) {
        self.func.ops[op].block = self.point.block;
        self.func.blocks[self.point.block]
            .ops
            .insert(self.point.index, op);
        self.point.index += 1;
    }

    pub fn const_int(&mut self, value: i64) -> Value {
        let op = self.create(OpKind::ConstInt { value }, vec![], 1, vec![]);
        Value::result(op, 0)
    }

    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        let op = self.create(OpKind::Add, vec![lhs, rhs], 1, vec![]);
        Value::result(op, 0)
    }

    pub fn lt(&mut self, lhs: Value, rhs: Value) -> Value {
        let op = self.create(OpKind::Lt, vec![lhs, rhs], 1, vec![]);
        Value::result(op, 0)
    }

    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let op = self.create(OpKind::Select, vec![cond, if_true, if_false], 1, vec![]);
        Value::result(op, 0)
    }

    pub fn create_yield(&mut self, operands: Vec<Value>) -> OpId {
        self.create(OpKind::Yield, operands, 0, vec![])
    }

    /// Create a `for` op at the cursor with an empty body block (no
    /// terminator). Returns the op and its body.
    pub fn create_for(
        &mut self,
        lb: Value,
        ub: Value,
        step: Value,
        inits: &[Value],
    ) -> (OpId, BlockId) {
        let body = self.func.blocks.push(Block {
            arg_count: (1 + inits.len()) as u16,
            ops: Vec::new(),
        });
        let mut operands = vec![lb, ub, step];
        operands.extend_from_slice(inits);
        let op = self.create(OpKind::For, operands, inits.len() as u16, vec![body]);
        (op, body)
    }

    // ── Cloning ─────────────────────────────────────────────────────

    /// Clone `op` (with nested regions) at the cursor, remapping operands
    /// through `map` with lookup-or-default semantics. Result values of
    /// `op` are mapped to the clone's results. Returns the clone and the
    /// operand slots whose original value escapes the clone.
    pub fn clone_op_mapped(
        &mut self,
        op: OpId,
        map: &mut ValueMap,
    ) -> (OpId, Vec<EscapedOperand>) {
        let mut local = FxHashMap::default();
        let mut escapes = Vec::new();
        let new_op = self.clone_op_rec(op, None, &mut local, &mut |v| map.lookup_or_default(v), &mut escapes);
        for index in 0..self.func.ops[op].results {
            map.map(Value::result(op, index), Value::result(new_op, index));
        }
        (new_op, escapes)
    }

    /// Clone `op` at the cursor, substituting each escaping operand via
    /// `subst`; `None` leaves the operand referencing the original value.
    pub fn clone_op_with(
        &mut self,
        op: OpId,
        mut subst: impl FnMut(Value) -> Option<Value>,
    ) -> OpId {
        let mut local = FxHashMap::default();
        let mut escapes = Vec::new();
        self.clone_op_rec(
            op,
            None,
            &mut local,
            &mut |v| subst(v).unwrap_or(v),
            &mut escapes,
        )
    }

    /// Recursive clone core. `dest`: `Some(block)` appends the clone to
    /// that block (nested ops); `None` links it at the cursor (the root of
    /// the clone). `local` maps values defined under the root clone to
    /// their copies; everything else goes through `resolve` and is
    /// reported in `escapes`.
    fn clone_op_rec(
        &mut self,
        op: OpId,
        dest: Option<BlockId>,
        local: &mut FxHashMap<Value, Value>,
        resolve: &mut dyn FnMut(Value) -> Value,
        escapes: &mut Vec<EscapedOperand>,
    ) -> OpId {
        let (kind, operands, results, regions) = {
            let o = &self.func.ops[op];
            (o.kind.clone(), o.operands.clone(), o.results, o.regions.clone())
        };

        // Fresh nested blocks first so inner block args resolve locally.
        let mut new_regions = Vec::with_capacity(regions.len());
        for &block in &regions {
            let arg_count = self.func.blocks[block].arg_count;
            let new_block = self.func.blocks.push(Block {
                arg_count,
                ops: Vec::new(),
            });
            for i in 0..arg_count {
                local.insert(Value::arg(block, i), Value::arg(new_block, i));
            }
            new_regions.push(new_block);
        }
        for (ri, &block) in regions.iter().enumerate() {
            for inner in self.func.blocks[block].ops.clone() {
                self.clone_op_rec(inner, Some(new_regions[ri]), local, resolve, escapes);
            }
        }

        let mut new_operands = Vec::with_capacity(operands.len());
        let mut escaping_slots = Vec::new();
        for (slot, &value) in operands.iter().enumerate() {
            if let Some(&mapped) = local.get(&value) {
                new_operands.push(mapped);
            } else {
                new_operands.push(resolve(value));
                escaping_slots.push((slot, value));
            }
        }

        let new_op = self.func.ops.push(Op {
            block: dest.unwrap_or(self.point.block),
            kind,
            operands: new_operands,
            results,
            regions: new_regions,
            tags: Vec::new(),
        });
        match dest {
            Some(block) => self.func.blocks[block].ops.push(new_op),
            None => self.link_at_cursor(new_op),
        }

        for index in 0..results {
            local.insert(Value::result(op, index), Value::result(new_op, index));
        }
        for (index, original) in escaping_slots {
            escapes.push(EscapedOperand {
                owner: new_op,
                index,
                original,
            });
        }
        new_op
    }

    // ── Structural edits ────────────────────────────────────────────

    /// Replace every use of `old` with `new`, across the whole function.
    pub fn replace_uses_of(&mut self, old: Value, new: Value) {
        for op in self.func.ops.ids().collect::<Vec<_>>() {
            for operand in &mut self.func.ops[op].operands {
                if *operand == old {
                    *operand = new;
                }
            }
        }
    }

    /// Unlink `op` from its block. Arena storage is retained; the id must
    /// not be used afterwards.
    pub fn erase_op(&mut self, op: OpId) {
        let block = self.func.ops[op].block;
        let position = self.position_in_block(op);
        self.func.blocks[block].ops.remove(position);
        if self.point.block == block && self.point.index > position {
            self.point.index -= 1;
        }
    }

    /// Unlink `op` from its current block and append it to `block`.
    pub fn move_op_to_block_end(&mut self, op: OpId, block: BlockId) {
        let from = self.func.ops[op].block;
        let position = self.position_in_block(op);
        self.func.blocks[from].ops.remove(position);
        if self.point.block == from && self.point.index > position {
            self.point.index -= 1;
        }
        self.func.ops[op].block = block;
        self.func.blocks[block].ops.push(op);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
