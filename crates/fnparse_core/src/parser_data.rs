//! Per-thread evaluation state.
//!
//! A compiled function is shared read-only between threads, but evaluating it
//! needs mutable scratch space: the current variable values and the evaluator
//! handles (each with its own VM stack). [`ParserData`] bundles all of that so
//! a call only has to look up the thread's state once, and [`ThreadStates`]
//! keeps one `ParserData` per thread.

use crate::equation_engine::{compile_with_constants, ParseError};
use crate::traits::Evaluator;
use std::cell::{RefCell, RefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use thread_local::ThreadLocal;
use tracing::debug;

/// Mutable state owned by exactly one thread.
///
/// `ParserData` is default-constructible (empty) and deliberately not
/// `Clone`: evaluator handles cannot be duplicated.
#[derive(Default)]
pub struct ParserData {
    /// Scratch array holding the variable values (e.g. x, y and t) for the
    /// next evaluation, in declaration order.
    pub vars: Vec<f64>,
    /// One evaluator per function component, in component order.
    pub evaluators: Vec<Box<dyn Evaluator>>,
}

impl ParserData {
    /// Compiles every component expression.
    pub fn compile<S, C>(
        expressions: &[String],
        var_names: &[S],
        constants: &[(C, f64)],
    ) -> Result<Self, ParseError>
    where
        S: AsRef<str>,
        C: AsRef<str>,
    {
        let evaluators = expressions
            .iter()
            .map(|text| compile_with_constants(text, var_names, constants))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            vars: vec![0.0; var_names.len()],
            evaluators,
        })
    }

    pub fn is_compiled(&self) -> bool {
        !self.evaluators.is_empty()
    }

    /// Evaluates one component against the current contents of `vars`.
    pub fn evaluate(&mut self, component: usize) -> f64 {
        let Self { vars, evaluators } = self;
        evaluators[component].evaluate(vars)
    }

    /// Evaluates every component against the current contents of `vars`.
    pub fn evaluate_all(&mut self, out: &mut [f64]) {
        let Self { vars, evaluators } = self;
        for (slot, evaluator) in out.iter_mut().zip(evaluators.iter_mut()) {
            *slot = evaluator.evaluate(vars);
        }
    }
}

impl std::fmt::Debug for ParserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserData")
            .field("vars", &self.vars)
            .field("evaluators", &self.evaluators.len())
            .finish()
    }
}

/// One [`ParserData`] per thread, created lazily on first use.
///
/// Each thread reaches its slot without taking a lock, and only that thread
/// ever borrows it, so an evaluation in progress never holds up another
/// thread. Slots of threads that have exited are handed to new threads.
#[derive(Debug, Default)]
pub struct ThreadStates {
    states: ThreadLocal<RefCell<Option<ParserData>>>,
    compiled: AtomicUsize,
}

impl ThreadStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores already built state for the calling thread.
    pub fn insert_current(&self, data: ParserData) {
        if self.states.get_or_default().borrow_mut().replace(data).is_none() {
            self.compiled.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the calling thread's state, building it with `init` first if
    /// this thread has not used it yet.
    pub fn get_or_try_init<E>(
        &self,
        init: impl FnOnce() -> Result<ParserData, E>,
    ) -> Result<RefMut<'_, ParserData>, E> {
        let mut slot = self.states.get_or_default().borrow_mut();
        let data = match slot.take() {
            Some(data) => data,
            None => {
                debug!(thread = ?thread::current().id(), "building per-thread evaluation state");
                let data = init()?;
                self.compiled.fetch_add(1, Ordering::Relaxed);
                data
            }
        };
        Ok(RefMut::map(slot, |slot| slot.insert(data)))
    }

    /// Drops the calling thread's state, if any.
    pub fn release_current(&self) -> Option<ParserData> {
        let released = self.states.get()?.borrow_mut().take();
        if released.is_some() {
            self.compiled.fetch_sub(1, Ordering::Relaxed);
        }
        released
    }

    /// Number of per-thread states currently held.
    pub fn len(&self) -> usize {
        self.compiled.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    fn expressions(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|text| text.to_string()).collect()
    }

    fn compile_x() -> Result<ParserData, ParseError> {
        ParserData::compile::<_, &str>(&expressions(&["x"]), &["x"], &[])
    }

    #[test]
    fn default_state_is_empty() {
        let data = ParserData::default();
        assert!(data.vars.is_empty());
        assert!(!data.is_compiled());
    }

    #[test]
    fn compile_sizes_buffers_to_declarations() {
        let texts = expressions(&["x", "y", "x*y"]);
        let data =
            ParserData::compile::<_, &str>(&texts, &["x", "y"], &[]).expect("should compile");
        assert_eq!(data.vars.len(), 2);
        assert_eq!(data.evaluators.len(), 3);
    }

    #[test]
    fn evaluates_components_against_shared_buffer() {
        let mut data =
            ParserData::compile(&expressions(&["x + c", "x * y"]), &["x", "y"], &[("c", 10.0)])
                .expect("should compile");
        data.vars.copy_from_slice(&[2.0, 3.0]);
        assert_eq!(data.evaluate(0), 12.0);
        let mut out = [0.0; 2];
        data.evaluate_all(&mut out);
        assert_eq!(out, [12.0, 6.0]);
    }

    #[test]
    fn compile_failure_builds_nothing() {
        let result = ParserData::compile::<_, &str>(&expressions(&["x", "x +"]), &["x"], &[]);
        assert_eq!(result.err(), Some(ParseError::UnexpectedEnd));
    }

    #[test]
    fn each_thread_gets_its_own_entry() {
        const WORKERS: usize = 4;
        let states = Arc::new(ThreadStates::new());

        {
            let mut data = states.get_or_try_init(compile_x).expect("init");
            data.vars[0] = 1.0;
        }
        {
            let data = states.get_or_try_init(compile_x).expect("reuse");
            assert_eq!(data.vars[0], 1.0, "state should be reused on the same thread");
        }

        // Every worker stays alive until all of them hold state.
        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let states = Arc::clone(&states);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let seen = states.get_or_try_init(compile_x).expect("init").vars[0];
                    barrier.wait();
                    seen
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("thread"), 0.0);
        }
        assert_eq!(states.len(), WORKERS + 1);

        assert!(states.release_current().is_some());
        assert!(states.release_current().is_none());
        assert_eq!(states.len(), WORKERS);
    }

    #[test]
    fn held_state_does_not_block_other_threads() {
        const WORKERS: usize = 64;
        let states = Arc::new(ThreadStates::new());
        let mut held = states.get_or_try_init(compile_x).expect("init");
        held.vars[0] = 5.0;

        let (tx, rx) = mpsc::channel();
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let states = Arc::clone(&states);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    let mut data = states.get_or_try_init(compile_x).expect("init");
                    data.vars[0] = worker as f64;
                    tx.send((worker, data.evaluate(0))).expect("send");
                })
            })
            .collect();

        for _ in 0..WORKERS {
            let (worker, value) = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("a worker waited on another thread's state");
            assert_eq!(value, worker as f64);
        }
        assert_eq!(held.evaluate(0), 5.0);
        drop(held);

        for handle in handles {
            handle.join().expect("thread");
        }
    }

    #[test]
    fn failed_init_leaves_no_entry() {
        let states = ThreadStates::new();
        let texts = expressions(&["?"]);
        let result = states.get_or_try_init(|| ParserData::compile::<_, &str>(&texts, &["x"], &[]));
        assert!(result.is_err());
        assert!(states.is_empty());

        // The slot stays usable after a failed build.
        assert!(states.get_or_try_init(compile_x).is_ok());
        assert_eq!(states.len(), 1);
    }
}
