//! Random numbers for `rand()` and `rand_seed(seed)`.
//!
//! Every thread owns one [`RandomStream`] in thread-local storage. Expressions
//! evaluated on a thread draw from that thread's stream only, so concurrent
//! evaluations never contend on, or perturb, each other's generator.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use tracing::trace;

/// A uniform generator on [0, 1].
#[derive(Debug)]
pub struct RandomStream {
    rng: StdRng,
}

impl RandomStream {
    /// A stream seeded from operating-system entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// A reproducible stream.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Restarts the stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Returns the next draw, uniform in [0, 1].
    pub fn draw(&mut self) -> f64 {
        self.rng.gen_range(0.0..=1.0)
    }
}

impl Default for RandomStream {
    fn default() -> Self {
        Self::from_entropy()
    }
}

thread_local! {
    static THREAD_STREAM: RefCell<RandomStream> = RefCell::default();
}

/// Converts an expression value into a discrete seed.
///
/// The value is truncated toward zero; non-finite values map to 0.
pub fn discrete_seed(seed: f64) -> u64 {
    if seed.is_finite() {
        seed as i64 as u64
    } else {
        0
    }
}

/// Runs `f` with exclusive access to the calling thread's stream.
pub fn with_thread_stream<R>(f: impl FnOnce(&mut RandomStream) -> R) -> R {
    THREAD_STREAM.with(|stream| f(&mut *stream.borrow_mut()))
}

/// Reseeds the calling thread's stream and returns its first draw.
pub fn reseed_thread_stream(seed: f64) -> f64 {
    let seed = discrete_seed(seed);
    trace!(seed, "reseeding thread random stream");
    with_thread_stream(|stream| {
        stream.reseed(seed);
        stream.draw()
    })
}

/// Draws from the calling thread's stream without reseeding it.
pub fn draw_thread_stream() -> f64 {
    with_thread_stream(RandomStream::draw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sequence_after_seed(seed: f64, len: usize) -> Vec<f64> {
        let mut values = vec![reseed_thread_stream(seed)];
        values.extend((0..len).map(|_| draw_thread_stream()));
        values
    }

    #[test]
    fn seeded_streams_are_reproducible() {
        let mut a = RandomStream::seeded(7);
        let mut b = RandomStream::seeded(7);
        for _ in 0..32 {
            assert_eq!(a.draw(), b.draw());
        }
    }

    #[test]
    fn reseed_restarts_the_sequence() {
        let mut stream = RandomStream::seeded(11);
        let first: Vec<f64> = (0..8).map(|_| stream.draw()).collect();
        stream.reseed(11);
        let second: Vec<f64> = (0..8).map(|_| stream.draw()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn draws_stay_in_unit_interval() {
        let mut stream = RandomStream::default();
        for _ in 0..1000 {
            let value = stream.draw();
            assert!((0.0..=1.0).contains(&value), "draw out of range: {value}");
        }
    }

    #[test]
    fn same_seed_on_independent_threads_gives_same_sequence() {
        let handles: Vec<_> = (0..2)
            .map(|_| thread::spawn(|| sequence_after_seed(42.0, 16)))
            .collect();
        let sequences: Vec<Vec<f64>> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread should finish"))
            .collect();
        assert_eq!(sequences[0], sequences[1]);
    }

    #[test]
    fn unseeded_draws_do_not_repeat() {
        let first = draw_thread_stream();
        let second = draw_thread_stream();
        assert_ne!(first, second);
    }

    #[test]
    fn discrete_seed_truncates() {
        assert_eq!(discrete_seed(42.9), 42);
        assert_eq!(discrete_seed(f64::NAN), 0);
        assert_eq!(discrete_seed(f64::INFINITY), 0);
        assert_ne!(discrete_seed(-1.0), discrete_seed(1.0));
    }
}
