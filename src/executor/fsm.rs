//! Finite-state-machine future
//!
//! A data-driven sequencer for multi-step asynchronous operations: a jump
//! table of state handlers over a shared context, with optional per-state
//! unwind handlers. When a handler fails, unwind runs in reverse order:
//! first the failing state's own handler, then the handlers of every
//! completed state, before the future resolves to the error. Dropping the future mid-sequence runs the same
//! unwind path, so cancellation cannot leak partially acquired resources.
//!
//! Handlers receive the poll context and may drive sub-futures they store
//! in the shared context, reporting [`Step::Yield`] until the sub-future
//! is ready. A handler that yields must have arranged a wakeup (normally
//! by polling a sub-future); the current state runs again on the next
//! poll. Because a state's unwind handler may run after partial progress,
//! handlers record their progress in the context and unwind handlers must
//! tolerate absent work.

use crate::error::ModuleResult;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Outcome of one state handler invocation
pub enum Step {
    /// Advance to the next state in declaration order
    Next,
    /// Suspend; re-run this state on the next poll
    Yield,
    /// Jump to the state at the given index
    Transition(usize),
    /// Complete the machine successfully
    Finish,
}

/// Handler executed when the machine enters its state
pub type StateFn<C> = fn(&mut C, &mut Context<'_>) -> ModuleResult<Step>;

/// Handler executed in unwind mode, reverse order of completion
pub type UnwindFn<C> = fn(&mut C);

/// One entry of the jump table
pub struct State<C> {
    /// The state handler
    pub run: StateFn<C>,
    /// Undo handler for work this state completed
    pub unwind: Option<UnwindFn<C>>,
}

impl<C> State<C> {
    /// State without an unwind handler
    pub fn new(run: StateFn<C>) -> Self {
        Self { run, unwind: None }
    }

    /// State with an unwind handler
    pub fn with_unwind(run: StateFn<C>, unwind: UnwindFn<C>) -> Self {
        Self {
            run,
            unwind: Some(unwind),
        }
    }
}

/// The machine: current index, completion trail, and shared context
pub struct StateMachine<C> {
    states: Vec<State<C>>,
    context: Option<C>,
    index: usize,
    completed: Vec<usize>,
    polled: bool,
    finished: bool,
}

impl<C> StateMachine<C> {
    /// Build a machine over `states`, starting at index 0
    pub fn new(context: C, states: Vec<State<C>>) -> Self {
        Self {
            states,
            context: Some(context),
            index: 0,
            completed: Vec::new(),
            polled: false,
            finished: false,
        }
    }

    /// Unwind the current state (if any) and then the completed trail
    fn run_unwind(&mut self, current: Option<usize>) {
        if let Some(context) = self.context.as_mut() {
            if let Some(index) = current {
                if let Some(unwind) = self.states.get(index).and_then(|s| s.unwind) {
                    unwind(context);
                }
            }
            for &index in self.completed.iter().rev() {
                if let Some(unwind) = self.states[index].unwind {
                    unwind(context);
                }
            }
        }
    }
}

impl<C: Unpin> Future for StateMachine<C> {
    type Output = ModuleResult<C>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.finished, "StateMachine polled after completion");
        this.polled = true;
        loop {
            if this.index >= this.states.len() {
                this.finished = true;
                return match this.context.take() {
                    Some(context) => Poll::Ready(Ok(context)),
                    None => Poll::Pending,
                };
            }
            let run = this.states[this.index].run;
            let context = match this.context.as_mut() {
                Some(context) => context,
                None => {
                    this.finished = true;
                    return Poll::Pending;
                }
            };
            match run(context, cx) {
                Ok(Step::Yield) => return Poll::Pending,
                Ok(Step::Next) => {
                    this.completed.push(this.index);
                    this.index += 1;
                }
                Ok(Step::Transition(target)) => {
                    this.completed.push(this.index);
                    this.index = target;
                }
                Ok(Step::Finish) => {
                    this.completed.push(this.index);
                    this.index = this.states.len();
                }
                Err(error) => {
                    let failing = this.index;
                    this.run_unwind(Some(failing));
                    this.finished = true;
                    return Poll::Ready(Err(error));
                }
            }
        }
    }
}

impl<C> Drop for StateMachine<C> {
    fn drop(&mut self) {
        // Abort path: a machine dropped mid-sequence releases what the
        // in-progress and completed states acquired. A machine that was
        // never polled acquired nothing.
        if !self.finished && self.polled {
            let current = self.index;
            self.run_unwind(Some(current));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use crate::executor::block_on;

    #[derive(Debug)]
    struct Trace {
        log: Vec<&'static str>,
        fail_at: Option<usize>,
        step: usize,
    }

    fn record(trace: &mut Trace, label: &'static str) -> ModuleResult<Step> {
        trace.log.push(label);
        if trace.fail_at == Some(trace.step) {
            return Err(ModuleError::Aborted);
        }
        trace.step += 1;
        Ok(Step::Next)
    }

    fn machine(fail_at: Option<usize>) -> StateMachine<Trace> {
        StateMachine::new(
            Trace {
                log: Vec::new(),
                fail_at,
                step: 0,
            },
            vec![
                State::with_unwind(|c, _| record(c, "a"), |c| c.log.push("undo-a")),
                State::with_unwind(|c, _| record(c, "b"), |c| c.log.push("undo-b")),
                State::new(|c, _| record(c, "c")),
            ],
        )
    }

    #[test]
    fn states_run_in_declaration_order() {
        let trace = block_on(machine(None)).unwrap();
        assert_eq!(trace.log, vec!["a", "b", "c"]);
    }

    #[test]
    fn error_unwinds_completed_states_in_reverse() {
        let err = block_on(machine(Some(2))).unwrap_err();
        assert_eq!(err, ModuleError::Aborted);
    }

    #[test]
    fn unwind_order_is_reverse_of_completion() {
        // Inspect the unwind trail through a shared log.
        use std::sync::{Arc, Mutex};
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        struct Ctx(Arc<Mutex<Vec<&'static str>>>);
        let machine = StateMachine::new(
            Ctx(log.clone()),
            vec![
                State::with_unwind(
                    |c: &mut Ctx, _| {
                        c.0.lock().unwrap().push("a");
                        Ok(Step::Next)
                    },
                    |c| c.0.lock().unwrap().push("undo-a"),
                ),
                State::with_unwind(
                    |c: &mut Ctx, _| {
                        c.0.lock().unwrap().push("b");
                        Ok(Step::Next)
                    },
                    |c| c.0.lock().unwrap().push("undo-b"),
                ),
                State::new(|_, _| Err(ModuleError::Aborted)),
            ],
        );
        let _ = block_on(machine);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "undo-b", "undo-a"]);
    }

    #[test]
    fn transition_jumps_over_states() {
        struct Ctx(Vec<usize>);
        let machine = StateMachine::new(
            Ctx(Vec::new()),
            vec![
                State::new(|c: &mut Ctx, _| {
                    c.0.push(0);
                    Ok(Step::Transition(2))
                }),
                State::new(|c: &mut Ctx, _| {
                    c.0.push(1);
                    Ok(Step::Next)
                }),
                State::new(|c: &mut Ctx, _| {
                    c.0.push(2);
                    Ok(Step::Finish)
                }),
            ],
        );
        let ctx = block_on(machine).unwrap();
        assert_eq!(ctx.0, vec![0, 2]);
    }

    #[test]
    fn drop_mid_sequence_runs_unwind() {
        use std::sync::{Arc, Mutex};
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        struct Ctx(Arc<Mutex<Vec<&'static str>>>);
        let mut machine = StateMachine::new(
            Ctx(log.clone()),
            vec![
                State::with_unwind(
                    |c: &mut Ctx, _| {
                        c.0.lock().unwrap().push("a");
                        Ok(Step::Next)
                    },
                    |c| c.0.lock().unwrap().push("undo-a"),
                ),
                State::new(|_, _| Ok(Step::Yield)),
            ],
        );

        // Drive one poll so state "a" completes and state 1 suspends.
        let blocking = crate::executor::BlockingContext::new();
        let waker = blocking.waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut machine).poll(&mut cx).is_pending());

        drop(machine);
        assert_eq!(*log.lock().unwrap(), vec!["a", "undo-a"]);
    }

    #[test]
    fn yield_reruns_the_same_state() {
        struct Ctx {
            polls: usize,
        }
        let machine = StateMachine::new(
            Ctx { polls: 0 },
            vec![State::new(|c: &mut Ctx, cx| {
                c.polls += 1;
                if c.polls < 3 {
                    cx.waker().wake_by_ref();
                    Ok(Step::Yield)
                } else {
                    Ok(Step::Finish)
                }
            })],
        );
        let ctx = block_on(machine).unwrap();
        assert_eq!(ctx.polls, 3);
    }
}
