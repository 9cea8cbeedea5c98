// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `Script` program builder.
//!
//! Most user programs are a straight line: make a syscall, look at the
//! result, make the next one. `Script` chains one closure per step; each
//! closure receives the previous syscall's result and produces the next
//! [`Action`]. When the steps run out the script returns, which -- like
//! any process entry function returning -- lands in the stop syscall.

use std::collections::VecDeque;

use crate::{Action, Program, UserCtx};

type Step = Box<dyn FnOnce(&mut UserCtx<'_>, i32) -> Action>;

enum Piece {
    Op(Step),
    /// Burn this many instructions of pure computation.
    Spin(u32),
}

/// A user program as a list of steps. Build with [`Script::op`],
/// [`Script::call`], and [`Script::spin`]; register with
/// [`crate::Machine::register`].
#[derive(Default)]
pub struct Script {
    pieces: VecDeque<Piece>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step: given the previous result, produce the next action.
    pub fn op(
        mut self,
        f: impl FnOnce(&mut UserCtx<'_>, i32) -> Action + 'static,
    ) -> Self {
        self.pieces.push_back(Piece::Op(Box::new(f)));
        self
    }

    /// Appends a fixed action, ignoring the previous result.
    pub fn call(self, action: Action) -> Self {
        self.op(move |_, _| action)
    }

    /// Appends `n` instructions of busy work. Useful for letting the timer
    /// preempt something.
    pub fn spin(mut self, n: u32) -> Self {
        self.pieces.push_back(Piece::Spin(n));
        self
    }
}

impl Program for Script {
    fn resume(&mut self, ctx: &mut UserCtx<'_>, result: i32) -> Action {
        loop {
            match self.pieces.front_mut() {
                None => return Action::Return,
                Some(Piece::Spin(0)) => {
                    self.pieces.pop_front();
                }
                Some(Piece::Spin(n)) => {
                    *n -= 1;
                    return Action::Compute;
                }
                Some(Piece::Op(_)) => {
                    let Some(Piece::Op(f)) = self.pieces.pop_front() else {
                        unreachable!()
                    };
                    return f(ctx, result);
                }
            }
        }
    }
}
