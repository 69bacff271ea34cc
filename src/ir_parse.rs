//! Textual parser for rotor IR.
//!
//! Parses the format produced by `Func`'s `Display` back into a [`Func`].
//! Two passes: parse text → AST, then resolve references → `Func`. Tests
//! and fixtures use this to write loops as text.

use chumsky::prelude::*;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ir::{Block, BlockId, Func, Mem, Op, OpId, OpKind, Value};

// ─── AST types (first pass) ─────────────────────────────────────────────────

/// A parsed value reference (unresolved).
#[derive(Debug, Clone)]
enum AstValue {
    /// `n3.0` — result 0 of the op printed as `n3`.
    Result { op: u32, index: u16 },
    /// `arg0`, `^arg1` — argument of the enclosing block, one `^` per
    /// level up.
    Arg { levels: usize, index: u16 },
}

#[derive(Debug, Clone)]
enum AstOpKind {
    Const(i64),
    Add,
    Sub,
    Mul,
    Lt,
    Select,
    Load(u32),
    Store(u32),
    For,
    If,
    Yield,
    Return,
}

/// A parsed op (unresolved).
#[derive(Debug, Clone)]
struct AstOp {
    id: u32,
    kind: AstOpKind,
    operands: Vec<AstValue>,
    results: u16,
    blocks: Vec<AstBlock>,
}

/// A parsed block (unresolved).
#[derive(Debug, Clone)]
struct AstBlock {
    args: u16,
    ops: Vec<AstOp>,
}

// ─── Parsers ────────────────────────────────────────────────────────────────

type Extra<'src> = extra::Err<Rich<'src, char>>;

fn ws<'src>() -> impl Parser<'src, &'src str, (), Extra<'src>> + Clone {
    any()
        .filter(|c: &char| c.is_whitespace())
        .repeated()
        .ignored()
}

/// Parse a u32 decimal number.
fn uint32<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u32>().unwrap())
}

/// Parse a u16 decimal number.
fn uint16<'src>() -> impl Parser<'src, &'src str, u16, Extra<'src>> + Clone {
    text::int::<_, Extra<'_>>(10).map(|s: &str| s.parse::<u16>().unwrap())
}

/// Parse an i64 decimal number with optional sign.
fn int64<'src>() -> impl Parser<'src, &'src str, i64, Extra<'src>> + Clone {
    just("-")
        .or_not()
        .then(text::int::<_, Extra<'_>>(10))
        .map(|(sign, s): (Option<&str>, &str)| {
            let magnitude = s.parse::<i64>().unwrap();
            if sign.is_some() {
                -magnitude
            } else {
                magnitude
            }
        })
}

/// Parse a value reference.
fn value<'src>() -> impl Parser<'src, &'src str, AstValue, Extra<'src>> + Clone {
    let result = just("n")
        .ignore_then(uint32())
        .then_ignore(just("."))
        .then(uint16())
        .map(|(op, index)| AstValue::Result { op, index });
    let arg = just('^')
        .repeated()
        .collect::<Vec<char>>()
        .then(just("arg").ignore_then(uint16()))
        .map(|(carets, index)| AstValue::Arg {
            levels: carets.len(),
            index,
        });
    choice((result, arg))
}

/// Parse a comma/semicolon-separated operand list inside brackets.
fn operand_list<'src>() -> impl Parser<'src, &'src str, Vec<AstValue>, Extra<'src>> + Clone {
    value()
        .separated_by(one_of(",;").padded_by(ws()))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just("[").then(ws()), ws().then(just("]")))
}

/// Parse a memory name: `m0`, `m1`, ...
fn mem_name<'src>() -> impl Parser<'src, &'src str, u32, Extra<'src>> + Clone {
    just("m").ignore_then(uint32())
}

/// Parse an op mnemonic plus its inline payload.
fn op_kind<'src>() -> impl Parser<'src, &'src str, AstOpKind, Extra<'src>> + Clone {
    choice((
        just("const")
            .ignore_then(ws())
            .ignore_then(int64())
            .map(AstOpKind::Const),
        just("add").to(AstOpKind::Add),
        just("sub").to(AstOpKind::Sub),
        just("mul").to(AstOpKind::Mul),
        just("load")
            .ignore_then(ws())
            .ignore_then(mem_name())
            .map(AstOpKind::Load),
        just("store")
            .ignore_then(ws())
            .ignore_then(mem_name())
            .map(AstOpKind::Store),
        just("lt").to(AstOpKind::Lt),
        just("select").to(AstOpKind::Select),
        just("for").to(AstOpKind::For),
        just("if").to(AstOpKind::If),
        just("yield").to(AstOpKind::Yield),
        just("return").to(AstOpKind::Return),
    ))
}

/// Parse a block: `block(args: N) { ops... }`.
fn block_text<'src>() -> impl Parser<'src, &'src str, AstBlock, Extra<'src>> {
    recursive(|block| {
        // Tail of an op: either `-> N`, or nested blocks then `-> N`.
        let arrow = just("->").ignore_then(ws()).ignore_then(uint16());
        let with_blocks = block
            .padded_by(ws())
            .repeated()
            .at_least(1)
            .collect::<Vec<AstBlock>>()
            .delimited_by(just("{"), just("}"))
            .then_ignore(ws())
            .then(arrow.clone());
        let without_blocks = empty().to(Vec::new()).then(arrow);
        let tail = with_blocks.or(without_blocks);

        let op = just("n")
            .ignore_then(uint32())
            .then_ignore(just("=").padded_by(ws()))
            .then(op_kind())
            .then_ignore(ws())
            .then(operand_list())
            .then_ignore(ws())
            .then(tail)
            .map(|(((id, kind), operands), (blocks, results))| AstOp {
                id,
                kind,
                operands,
                results,
                blocks,
            });

        just("block")
            .ignore_then(just("(").padded_by(ws()))
            .ignore_then(just("args:"))
            .ignore_then(ws())
            .ignore_then(uint16())
            .then_ignore(just(")").padded_by(ws()))
            .then_ignore(just("{"))
            .then(op.padded_by(ws()).repeated().collect::<Vec<_>>())
            .then_ignore(just("}"))
            .map(|(args, ops)| AstBlock { args, ops })
    })
}

/// Parse a whole function: `func { block }`.
fn func_text<'src>() -> impl Parser<'src, &'src str, AstBlock, Extra<'src>> {
    block_text()
        .padded_by(ws())
        .delimited_by(just("func").then(ws()).then(just("{")), just("}"))
        .padded_by(ws())
        .then_ignore(end())
}

// ─── Resolution (second pass) ───────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
}

fn resolve_value(
    value: &AstValue,
    op_ids: &FxHashMap<u32, OpId>,
    stack: &[BlockId],
) -> Result<Value, ParseError> {
    match *value {
        AstValue::Result { op, index } => op_ids
            .get(&op)
            .map(|&id| Value::result(id, index))
            .ok_or_else(|| ParseError {
                message: format!("reference to undefined op n{op}"),
            }),
        AstValue::Arg { levels, index } => {
            let position = stack.len().checked_sub(1 + levels).ok_or_else(|| ParseError {
                message: format!("argument reference escapes the block nest ({levels} levels up)"),
            })?;
            Ok(Value::arg(stack[position], index))
        }
    }
}

fn resolve_ops(
    func: &mut Func,
    block: BlockId,
    ops: &[AstOp],
    op_ids: &mut FxHashMap<u32, OpId>,
    stack: &mut Vec<BlockId>,
) -> Result<(), ParseError> {
    for ast_op in ops {
        let mut regions = Vec::with_capacity(ast_op.blocks.len());
        for ast_block in &ast_op.blocks {
            regions.push(func.blocks.push(Block {
                arg_count: ast_block.args,
                ops: Vec::new(),
            }));
        }

        let operands = ast_op
            .operands
            .iter()
            .map(|v| resolve_value(v, op_ids, stack))
            .collect::<Result<Vec<_>, _>>()?;

        for (&region, ast_block) in regions.iter().zip(&ast_op.blocks) {
            stack.push(region);
            resolve_ops(func, region, &ast_block.ops, op_ids, stack)?;
            stack.pop();
        }

        let kind = match ast_op.kind {
            AstOpKind::Const(value) => OpKind::ConstInt { value },
            AstOpKind::Add => OpKind::Add,
            AstOpKind::Sub => OpKind::Sub,
            AstOpKind::Mul => OpKind::Mul,
            AstOpKind::Lt => OpKind::Lt,
            AstOpKind::Select => OpKind::Select,
            AstOpKind::Load(mem) => OpKind::Load { mem: Mem(mem) },
            AstOpKind::Store(mem) => OpKind::Store { mem: Mem(mem) },
            AstOpKind::For => OpKind::For,
            AstOpKind::If => OpKind::If,
            AstOpKind::Yield => OpKind::Yield,
            AstOpKind::Return => OpKind::Return,
        };
        let op = func.ops.push(Op {
            block,
            kind,
            operands,
            results: ast_op.results,
            regions,
            tags: Vec::new(),
        });
        func.blocks[block].ops.push(op);
        if op_ids.insert(ast_op.id, op).is_some() {
            return Err(ParseError {
                message: format!("duplicate op id n{}", ast_op.id),
            });
        }
    }
    Ok(())
}

/// Parse the textual format into a [`Func`]. Op ids are renumbered in
/// definition order; structure and references are preserved.
pub fn parse_func(input: &str) -> Result<Func, ParseError> {
    let result = func_text().parse(input);
    let root = result.into_result().map_err(|errs| {
        let msgs: Vec<String> = errs.into_iter().map(|e| format!("{e}")).collect();
        ParseError {
            message: msgs.join("\n"),
        }
    })?;

    let mut func = Func::new();
    func.blocks[func.entry].arg_count = root.args;
    let mut op_ids = FxHashMap::default();
    let mut stack = vec![func.entry];
    let entry = func.entry;
    resolve_ops(&mut func, entry, &root.ops, &mut op_ids, &mut stack)?;
    Ok(func)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
