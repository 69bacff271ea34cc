//! Rewrite-pattern plumbing around the pipeliner.
//!
//! A pattern inspects one op and may rewrite the function; the driver
//! sweeps every reachable op until no pattern fires. Freshly created kernel
//! loops are visited on the next sweep, so the schedule callback is
//! expected to decline loops it has already handled.

use tracing::debug;

use crate::ir::{Func, OpId, OpKind};
use crate::pipeline::{pipeline_for_loop, PipelineError, PipelineOptions};

/// One rewrite rule. Returns `Ok(true)` if the function was changed,
/// `Ok(false)` if the op did not match or the rewrite declined.
pub trait RewritePattern {
    fn match_and_rewrite(&self, func: &mut Func, op: OpId) -> Result<bool, PipelineError>;
}

/// An ordered collection of patterns.
#[derive(Default)]
pub struct PatternSet {
    patterns: Vec<Box<dyn RewritePattern>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: impl RewritePattern + 'static) {
        self.patterns.push(Box::new(pattern));
    }
}

/// Pipelines `for` loops accepted by the schedule callback.
pub struct ForPipeliningPattern {
    options: PipelineOptions,
}

impl ForPipeliningPattern {
    pub fn new(options: PipelineOptions) -> Self {
        ForPipeliningPattern { options }
    }
}

impl RewritePattern for ForPipeliningPattern {
    fn match_and_rewrite(&self, func: &mut Func, op: OpId) -> Result<bool, PipelineError> {
        if func.ops[op].kind != OpKind::For {
            return Ok(false);
        }
        match pipeline_for_loop(func, op, &self.options) {
            Ok(_) => Ok(true),
            Err(PipelineError::NotApplicable) => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// Register the loop-pipelining pattern with a pattern set.
pub fn populate_pipelining_patterns(patterns: &mut PatternSet, options: PipelineOptions) {
    patterns.add(ForPipeliningPattern::new(options));
}

/// Runaway guard; rewrites are expected to reach a fixed point long before
/// this.
const MAX_SWEEPS: usize = 100;

/// Apply `patterns` to every reachable op until a sweep changes nothing.
/// Returns whether the function was changed at all.
pub fn apply_patterns(func: &mut Func, patterns: &PatternSet) -> Result<bool, PipelineError> {
    let mut changed_any = false;
    for _ in 0..MAX_SWEEPS {
        let ops = func.reachable_ops();
        let mut changed = false;
        'sweep: for op in ops {
            for pattern in &patterns.patterns {
                if pattern.match_and_rewrite(func, op)? {
                    // The op snapshot is stale after a rewrite; rescan.
                    changed = true;
                    break 'sweep;
                }
            }
        }
        if !changed {
            return Ok(changed_any);
        }
        changed_any = true;
    }
    debug!("pattern application did not converge within {MAX_SWEEPS} sweeps");
    Ok(changed_any)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
