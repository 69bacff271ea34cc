//! Reference interpreter for the arithmetic IR.
//!
//! Executes a [`Func`] over `i64` values and a set of linear memories, one
//! per [`Mem`] name. Tests run the same function before and after
//! pipelining and compare results and final memories.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ir::{BlockId, Func, Mem, OpId, OpKind, Value};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("memory m{mem} index {index} out of bounds")]
    OutOfBounds { mem: u32, index: i64 },
    #[error("unknown memory m{0}")]
    UnknownMem(u32),
    #[error("use of unbound value {0:?}")]
    Unbound(Value),
    #[error("malformed function: {0}")]
    Malformed(&'static str),
}

/// How a block finished executing.
enum Control {
    Yield(Vec<i64>),
    Return(Vec<i64>),
}

/// An execution environment: the memories addressed by `load`/`store`.
pub struct Machine {
    pub mems: Vec<Vec<i64>>,
}

impl Machine {
    pub fn new(mems: Vec<Vec<i64>>) -> Self {
        Machine { mems }
    }

    /// Execute the entry block; returns the operands of its `return`.
    pub fn run(&mut self, func: &Func) -> Result<Vec<i64>, EvalError> {
        if func.blocks[func.entry].arg_count != 0 {
            return Err(EvalError::Malformed("entry block must not take arguments"));
        }
        let mut env = FxHashMap::default();
        match self.exec_block(func, func.entry, &mut env)? {
            Control::Return(values) => Ok(values),
            Control::Yield(_) => Err(EvalError::Malformed("entry block must end in `return`")),
        }
    }

    fn exec_block(
        &mut self,
        func: &Func,
        block: BlockId,
        env: &mut FxHashMap<Value, i64>,
    ) -> Result<Control, EvalError> {
        for i in 0..func.blocks[block].ops.len() {
            let op = func.blocks[block].ops[i];
            if let Some(control) = self.exec_op(func, op, env)? {
                return Ok(control);
            }
        }
        Err(EvalError::Malformed("block is missing a terminator"))
    }

    fn exec_op(
        &mut self,
        func: &Func,
        op: OpId,
        env: &mut FxHashMap<Value, i64>,
    ) -> Result<Option<Control>, EvalError> {
        let eval = |env: &FxHashMap<Value, i64>, value: Value| -> Result<i64, EvalError> {
            env.get(&value).copied().ok_or(EvalError::Unbound(value))
        };
        let operands = &func.ops[op].operands;

        match func.ops[op].kind {
            OpKind::ConstInt { value } => {
                env.insert(Value::result(op, 0), value);
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Lt => {
                let lhs = eval(env, operands[0])?;
                let rhs = eval(env, operands[1])?;
                let result = match func.ops[op].kind {
                    OpKind::Add => lhs.wrapping_add(rhs),
                    OpKind::Sub => lhs.wrapping_sub(rhs),
                    OpKind::Mul => lhs.wrapping_mul(rhs),
                    OpKind::Lt => i64::from(lhs < rhs),
                    _ => unreachable!(),
                };
                env.insert(Value::result(op, 0), result);
            }
            OpKind::Select => {
                let cond = eval(env, operands[0])?;
                let value = if cond != 0 {
                    eval(env, operands[1])?
                } else {
                    eval(env, operands[2])?
                };
                env.insert(Value::result(op, 0), value);
            }
            OpKind::Load { mem } => {
                let index = eval(env, operands[0])?;
                let value = self.read(mem, index)?;
                env.insert(Value::result(op, 0), value);
            }
            OpKind::Store { mem } => {
                let index = eval(env, operands[0])?;
                let value = eval(env, operands[1])?;
                self.write(mem, index, value)?;
            }
            OpKind::For => {
                let lb = eval(env, operands[0])?;
                let ub = eval(env, operands[1])?;
                let step = eval(env, operands[2])?;
                if step <= 0 {
                    return Err(EvalError::Malformed("`for` step must be positive"));
                }
                let mut carried: Vec<i64> = operands[3..]
                    .iter()
                    .map(|&v| eval(env, v))
                    .collect::<Result<_, _>>()?;

                let body = func.ops[op].regions[0];
                let mut iv = lb;
                while iv < ub {
                    env.insert(Value::arg(body, 0), iv);
                    for (j, &value) in carried.iter().enumerate() {
                        env.insert(Value::arg(body, (j + 1) as u16), value);
                    }
                    match self.exec_block(func, body, env)? {
                        Control::Yield(values) => carried = values,
                        Control::Return(_) => {
                            return Err(EvalError::Malformed("`return` inside a loop body"))
                        }
                    }
                    iv += step;
                }
                for (j, &value) in carried.iter().enumerate() {
                    env.insert(Value::result(op, j as u16), value);
                }
            }
            OpKind::If => {
                let cond = eval(env, operands[0])?;
                let regions = &func.ops[op].regions;
                let branch = if cond != 0 {
                    Some(regions[0])
                } else {
                    regions.get(1).copied()
                };
                match branch {
                    Some(block) => match self.exec_block(func, block, env)? {
                        Control::Yield(values) => {
                            for (j, &value) in values.iter().enumerate() {
                                env.insert(Value::result(op, j as u16), value);
                            }
                        }
                        Control::Return(_) => {
                            return Err(EvalError::Malformed("`return` inside an `if` branch"))
                        }
                    },
                    None => {
                        if func.ops[op].results != 0 {
                            return Err(EvalError::Malformed(
                                "`if` with results is missing an else branch",
                            ));
                        }
                    }
                }
            }
            OpKind::Yield => {
                let values = operands
                    .iter()
                    .map(|&v| eval(env, v))
                    .collect::<Result<_, _>>()?;
                return Ok(Some(Control::Yield(values)));
            }
            OpKind::Return => {
                let values = operands
                    .iter()
                    .map(|&v| eval(env, v))
                    .collect::<Result<_, _>>()?;
                return Ok(Some(Control::Return(values)));
            }
        }
        Ok(None)
    }

    fn read(&self, mem: Mem, index: i64) -> Result<i64, EvalError> {
        let buffer = self
            .mems
            .get(mem.0 as usize)
            .ok_or(EvalError::UnknownMem(mem.0))?;
        usize::try_from(index)
            .ok()
            .and_then(|i| buffer.get(i).copied())
            .ok_or(EvalError::OutOfBounds { mem: mem.0, index })
    }

    fn write(&mut self, mem: Mem, index: i64, value: i64) -> Result<(), EvalError> {
        let buffer = self
            .mems
            .get_mut(mem.0 as usize)
            .ok_or(EvalError::UnknownMem(mem.0))?;
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| buffer.get_mut(i))
            .ok_or(EvalError::OutOfBounds { mem: mem.0, index })?;
        *slot = value;
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
