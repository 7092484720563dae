use std::collections::BTreeSet;

use nova_jdwp::{
    MethodId, STEP_DEPTH_INTO, STEP_DEPTH_OUT, STEP_DEPTH_OVER, STEP_SIZE_LINE, STEP_SIZE_MIN,
};

use crate::error::{AgentError, AgentResult};
use crate::runtime::{ClassModel, Frame, MethodInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSize {
    Min,
    Line,
}

impl StepSize {
    pub fn from_jdwp(raw: u32) -> AgentResult<Self> {
        match raw {
            STEP_SIZE_MIN => Ok(StepSize::Min),
            STEP_SIZE_LINE => Ok(StepSize::Line),
            other => Err(AgentError::IllegalArgument(format!("step size {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDepth {
    Into,
    Over,
    Out,
}

impl StepDepth {
    pub fn from_jdwp(raw: u32) -> AgentResult<Self> {
        match raw {
            STEP_DEPTH_INTO => Ok(StepDepth::Into),
            STEP_DEPTH_OVER => Ok(StepDepth::Over),
            STEP_DEPTH_OUT => Ok(StepDepth::Out),
            other => Err(AgentError::IllegalArgument(format!("step depth {other}"))),
        }
    }
}

/// Active single-step state of one thread, anchored where the step began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleStepControl {
    size: StepSize,
    depth: StepDepth,
    method: MethodId,
    stack_depth: usize,
    /// Every pc belonging to the anchor line (empty for instruction steps or
    /// methods without line information).
    line_pcs: BTreeSet<u64>,
}

impl SingleStepControl {
    /// Capture the anchor from the thread's current stack, innermost frame
    /// first.
    pub fn configure(
        size: StepSize,
        depth: StepDepth,
        frames: &[Frame],
        classes: &dyn ClassModel,
    ) -> AgentResult<Self> {
        let top = frames.first().ok_or(AgentError::NoMoreFrames)?;
        let line_pcs = match size {
            StepSize::Min => BTreeSet::new(),
            StepSize::Line => {
                let method = classes
                    .method(top.method)
                    .ok_or(AgentError::InvalidMethodId(top.method))?;
                line_pcs(&method, top.pc)
            }
        };
        tracing::debug!(
            target = "nova.jdwp",
            ?size,
            ?depth,
            method = top.method,
            pc = top.pc,
            stack_depth = frames.len(),
            line_pcs = line_pcs.len(),
            "single step configured"
        );
        Ok(Self {
            size,
            depth,
            method: top.method,
            stack_depth: frames.len(),
            line_pcs,
        })
    }

    pub fn size(&self) -> StepSize {
        self.size
    }

    pub fn depth(&self) -> StepDepth {
        self.depth
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn stack_depth(&self) -> usize {
        self.stack_depth
    }

    pub fn contains_pc(&self, pc: u64) -> bool {
        self.line_pcs.contains(&pc)
    }

    /// True when a location away from the anchor line was reached.
    fn left_anchor_line(&self, method: MethodId, pc: u64) -> bool {
        self.size == StepSize::Min || method != self.method || !self.contains_pc(pc)
    }

    /// Whether reaching `(method, pc)` at `stack_depth` ends the step.
    pub fn should_fire(&self, stack_depth: usize, method: MethodId, pc: u64) -> bool {
        match self.depth {
            StepDepth::Into => self.left_anchor_line(method, pc),
            StepDepth::Over => {
                if stack_depth < self.stack_depth {
                    true
                } else if stack_depth == self.stack_depth {
                    self.left_anchor_line(method, pc)
                } else {
                    false
                }
            }
            StepDepth::Out => stack_depth < self.stack_depth,
        }
    }
}

/// All pcs of the line containing `pc`. A line may own several ranges in the
/// table; each runs up to the next entry with a different line, or the end of
/// the method.
fn line_pcs(method: &MethodInfo, pc: u64) -> BTreeSet<u64> {
    let mut pcs = BTreeSet::new();
    let Some(line) = method.line_for_pc(pc) else {
        return pcs;
    };

    let table = &method.line_table;
    for (i, entry) in table.iter().enumerate() {
        if entry.line != line {
            continue;
        }
        let end = table[i + 1..]
            .iter()
            .find(|next| next.line != line)
            .map(|next| next.pc)
            .unwrap_or(method.code_length);
        pcs.extend(entry.pc..end);
    }
    pcs
}
