// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The value and control stacks tracked while a function body is translated to Cranelift IR.

use alloc::string::String;

use cranelift_codegen::ir;
use smallvec::SmallVec;

use crate::errors::Error;
use crate::translate::BlockType;

/// Translation state of the function currently being compiled.
pub(super) struct State {
    /// The Cranelift values standing in for the WebAssembly operand stack.
    pub(super) stack: SmallVec<[ir::Value; 64]>,
    pub(super) control_stack: SmallVec<[ControlFrame; 32]>,
    /// Whether the code currently being translated can be reached.
    pub(super) reachable: bool,
}

impl State {
    pub(super) fn new() -> Self {
        Self {
            stack: SmallVec::new(),
            control_stack: SmallVec::new(),
            reachable: true,
        }
    }

    /// Resets the state and pushes the frame representing the whole function.
    pub(super) fn initialize(&mut self, exit_block: ir::Block, num_returns: usize) {
        self.stack.clear();
        self.control_stack.clear();
        self.reachable = true;
        self.push_block(exit_block, 0, num_returns);
    }

    pub(super) fn pop1(&mut self) -> crate::Result<ir::Value> {
        self.stack.pop().ok_or_else(|| underflow(1, 0))
    }

    pub(super) fn pop2(&mut self) -> crate::Result<(ir::Value, ir::Value)> {
        let y = self.pop1()?;
        let x = self.pop1()?;
        Ok((x, y))
    }

    pub(super) fn pop3(&mut self) -> crate::Result<(ir::Value, ir::Value, ir::Value)> {
        let z = self.pop1()?;
        let y = self.pop1()?;
        let x = self.pop1()?;
        Ok((x, y, z))
    }

    pub(super) fn popn(&mut self, n: usize) -> crate::Result<()> {
        let len = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| underflow(n, self.stack.len()))?;
        self.stack.truncate(len);
        Ok(())
    }

    pub(super) fn peek1(&self) -> crate::Result<ir::Value> {
        self.stack.last().copied().ok_or_else(|| underflow(1, 0))
    }

    pub(super) fn peekn(&self, n: usize) -> crate::Result<&[ir::Value]> {
        let start = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or_else(|| underflow(n, self.stack.len()))?;
        Ok(&self.stack[start..])
    }

    pub(super) fn push1(&mut self, value: ir::Value) {
        self.stack.push(value);
    }

    pub(super) fn pushn(&mut self, values: &[ir::Value]) {
        self.stack.extend_from_slice(values);
    }

    pub(super) fn push_block(&mut self, next_block: ir::Block, num_params: usize, num_returns: usize) {
        debug_assert!(self.stack.len() >= num_params);
        self.control_stack.push(ControlFrame::Block {
            next_block,
            num_params,
            num_returns,
            original_stack_size: self.stack.len().saturating_sub(num_params),
            exit_is_branched_to: false,
        });
    }

    pub(super) fn push_loop(
        &mut self,
        body: ir::Block,
        next_block: ir::Block,
        num_params: usize,
        num_returns: usize,
    ) {
        debug_assert!(self.stack.len() >= num_params);
        self.control_stack.push(ControlFrame::Loop {
            next_block,
            body,
            num_params,
            num_returns,
            original_stack_size: self.stack.len().saturating_sub(num_params),
        });
    }

    /// Pushes an `if` frame, duplicating its parameters so the `else` arm finds them too.
    pub(super) fn push_if(
        &mut self,
        next_block: ir::Block,
        else_data: ElseData,
        block_type: BlockType,
        num_params: usize,
        num_returns: usize,
    ) {
        debug_assert!(self.stack.len() >= num_params);

        let start = self.stack.len().saturating_sub(num_params);
        self.stack.reserve(num_params);
        for i in start..self.stack.len() {
            let val = self.stack[i];
            self.stack.push(val);
        }

        self.control_stack.push(ControlFrame::If {
            next_block,
            num_params,
            num_returns,
            original_stack_size: self.stack.len().saturating_sub(num_params),
            head_is_reachable: self.reachable,
            consequent_ends_reachable: None,
            exit_is_branched_to: false,
            else_data,
            block_type,
        });
    }

    /// The position in the control stack of the frame `relative_depth` levels up.
    pub(super) fn frame_index(&self, relative_depth: u32) -> crate::Result<usize> {
        usize::try_from(relative_depth)
            .ok()
            .and_then(|depth| self.control_stack.len().checked_sub(depth + 1))
            .ok_or_else(|| malformed("branch to a nonexistent label"))
    }

    /// Drops every value the frame pushed, including the duplicated `if` parameters.
    pub(super) fn truncate_value_stack_to_original_size(&mut self, frame: &ControlFrame) {
        let num_duplicated_params = match frame {
            ControlFrame::If { num_params, .. } => *num_params,
            _ => 0,
        };
        self.stack.truncate(
            frame
                .original_stack_size()
                .saturating_sub(num_duplicated_params),
        );
    }

    /// Drops the values of the innermost frame's consequent, leaving the parameters for the
    /// `else` arm.
    pub(super) fn truncate_value_stack_to_else_params(&mut self) {
        if let Some(frame) = self.control_stack.last() {
            debug_assert!(matches!(frame, ControlFrame::If { .. }));
            self.stack.truncate(frame.original_stack_size());
        }
    }
}

/// What is known about the `else` arm of an `if` when its frame is pushed.
#[derive(Debug, Clone, Copy)]
pub(super) enum ElseData {
    /// No `else` block was allocated yet, the false edge of `branch_inst` goes to
    /// `placeholder` until one is found.
    NoElse {
        branch_inst: ir::Inst,
        placeholder: ir::Block,
    },
    /// The block type requires an `else` arm, so its block was allocated up front.
    WithElse { else_block: ir::Block },
}

#[derive(Debug)]
pub(super) enum ControlFrame {
    Block {
        next_block: ir::Block,
        num_params: usize,
        num_returns: usize,
        original_stack_size: usize,
        exit_is_branched_to: bool,
    },
    Loop {
        next_block: ir::Block,
        body: ir::Block,
        num_params: usize,
        num_returns: usize,
        original_stack_size: usize,
    },
    If {
        next_block: ir::Block,
        num_params: usize,
        num_returns: usize,
        original_stack_size: usize,
        head_is_reachable: bool,
        /// Set once the `else` is reached.
        consequent_ends_reachable: Option<bool>,
        exit_is_branched_to: bool,
        else_data: ElseData,
        block_type: BlockType,
    },
}

impl ControlFrame {
    pub(super) fn num_params(&self) -> usize {
        match self {
            Self::Block { num_params, .. }
            | Self::Loop { num_params, .. }
            | Self::If { num_params, .. } => *num_params,
        }
    }

    pub(super) fn num_returns(&self) -> usize {
        match self {
            Self::Block { num_returns, .. }
            | Self::Loop { num_returns, .. }
            | Self::If { num_returns, .. } => *num_returns,
        }
    }

    pub(super) fn is_loop(&self) -> bool {
        matches!(self, Self::Loop { .. })
    }

    /// The block following the construct.
    pub(super) fn next_block(&self) -> ir::Block {
        match self {
            Self::Block { next_block, .. }
            | Self::Loop { next_block, .. }
            | Self::If { next_block, .. } => *next_block,
        }
    }

    /// Where a branch to this frame's label goes: the loop header for loops, the following
    /// block otherwise.
    pub(super) fn br_destination(&self) -> ir::Block {
        match *self {
            Self::If { next_block, .. } | Self::Block { next_block, .. } => next_block,
            Self::Loop { body, .. } => body,
        }
    }

    /// The number of values a branch to this frame's label carries.
    pub(super) fn br_arity(&self) -> usize {
        if self.is_loop() {
            self.num_params()
        } else {
            self.num_returns()
        }
    }

    pub(super) fn original_stack_size(&self) -> usize {
        match self {
            Self::Block {
                original_stack_size,
                ..
            }
            | Self::Loop {
                original_stack_size,
                ..
            }
            | Self::If {
                original_stack_size,
                ..
            } => *original_stack_size,
        }
    }

    pub(super) fn exit_is_branched_to(&self) -> bool {
        match *self {
            Self::If {
                exit_is_branched_to,
                ..
            }
            | Self::Block {
                exit_is_branched_to,
                ..
            } => exit_is_branched_to,
            Self::Loop { .. } => false,
        }
    }

    pub(super) fn set_branched_to_exit(&mut self) {
        match self {
            Self::If {
                exit_is_branched_to,
                ..
            }
            | Self::Block {
                exit_is_branched_to,
                ..
            } => *exit_is_branched_to = true,
            Self::Loop { .. } => {}
        }
    }
}

fn underflow(expected: usize, found: usize) -> Error {
    malformed(&alloc::format!(
        "operand stack underflow, expected {expected} values but found {found}"
    ))
}

/// An inconsistency in a body the validator accepted. The function name is filled in by the
/// translator.
pub(super) fn malformed(message: &str) -> Error {
    Error::Cranelift {
        func_name: String::new(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use cranelift_codegen::ir::{Function, InstBuilder, types};
    use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};

    use super::*;

    #[test]
    fn if_frames_keep_a_copy_of_their_params() {
        let mut func = Function::new();
        let mut ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut func, &mut ctx);
        let block = builder.create_block();
        builder.switch_to_block(block);
        let a = builder.ins().iconst(types::I32, 1);
        let b = builder.ins().iconst(types::I32, 2);

        let mut state = State::new();
        state.initialize(block, 0);
        state.pushn(&[a, b]);
        state.push_if(
            block,
            ElseData::WithElse { else_block: block },
            BlockType::Empty,
            1,
            1,
        );
        assert_eq!(&state.stack[..], &[a, b, b]);

        state.push1(a);
        state.truncate_value_stack_to_else_params();
        assert_eq!(&state.stack[..], &[a, b]);
        let frame = state.control_stack.pop().unwrap();
        state.truncate_value_stack_to_original_size(&frame);
        assert_eq!(&state.stack[..], &[a]);
    }

    #[test]
    fn underflow_is_an_error() {
        let mut state = State::new();
        assert!(state.pop1().is_err());
        assert!(state.peekn(2).is_err());
        assert!(state.frame_index(0).is_err());
    }
}
