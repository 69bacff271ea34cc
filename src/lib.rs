//! rotor — software pipelining for counted loops over a structured IR.
//!
//! The crate carries a small arena-based region IR ([`ir`]), in-place
//! rewriting primitives ([`rewrite`]), the pipelining transformation itself
//! ([`pipeline`]), a rewrite-pattern driver ([`pattern`]), a reference
//! interpreter used to check that rewrites preserve semantics ([`interp`]),
//! and a textual round-trip for fixtures ([`ir_parse`]).
//!
//! The transformation takes a counted `for` loop whose body ops have been
//! assigned pipeline stages by an external scheduler and rewrites it into a
//! prologue, a steady-state kernel in which the stages of several
//! iterations overlap, and either a peeled epilogue or a predicated tail:
//!
//! ```
//! use rotor::ir::{FuncBuilder, Mem, OpKind};
//! use rotor::pipeline::{pipeline_for_loop, PipelineOptions};
//!
//! let mut fb = FuncBuilder::new();
//! let lb = fb.const_int(0);
//! let ub = fb.const_int(8);
//! let step = fb.const_int(1);
//! let two = fb.const_int(2);
//! let (for_op, _) = fb.for_loop(lb, ub, step, &[], |fb, iv, _| {
//!     let x = fb.load(Mem(0), iv);
//!     let y = fb.mul(x, two);
//!     fb.store(Mem(1), iv, y);
//!     vec![]
//! });
//! fb.ret(&[]);
//! let mut func = fb.finish();
//!
//! // Overlap the load with the previous iteration's multiply and store.
//! let mut options = PipelineOptions::new(|func: &rotor::ir::Func, op: rotor::ir::OpId| {
//!     let body = func.for_body(op);
//!     let ops = &func.blocks[body].ops;
//!     ops[..ops.len() - 1]
//!         .iter()
//!         .map(|&op| {
//!             let stage = match func.ops[op].kind {
//!                 OpKind::Load { .. } => 0,
//!                 _ => 1,
//!             };
//!             (op, stage)
//!         })
//!         .collect()
//! });
//! options.peel_epilogue = true;
//! let kernel = pipeline_for_loop(&mut func, for_op, &options).unwrap();
//! assert_eq!(func.const_value(func.for_bounds(kernel)[1]), Some(7));
//! ```

pub mod interp;
pub mod ir;
pub mod ir_parse;
pub mod pattern;
pub mod pipeline;
pub mod rewrite;

pub use ir::{Func, FuncBuilder, Mem, OpId, OpKind, Value};
pub use pattern::{
    apply_patterns, populate_pipelining_patterns, ForPipeliningPattern, PatternSet,
    RewritePattern,
};
pub use pipeline::{pipeline_for_loop, PipelineError, PipelineOptions, PipelinePart};
pub use rewrite::Rewriter;
