//! Order-preserving child keys.
//!
//! 8 characters of millisecond timestamp followed by 12 random characters,
//! both over an alphabet whose ASCII order matches its numeric order. Keys
//! minted in the same millisecond reuse the random tail incremented by one, so
//! keys from one generator sort in creation order.

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;

const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushIdError {
    /// Too many keys in a single millisecond.
    #[error("child key space exhausted for this millisecond")]
    Exhausted,
}

#[derive(Default)]
struct State {
    last_millis: i64,
    last_random: [u8; RANDOM_CHARS],
}

#[derive(Default)]
pub struct PushIdGenerator {
    state: Mutex<State>,
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> Result<String, PushIdError> {
        self.next_id_at(Utc::now().timestamp_millis())
    }

    pub(crate) fn next_id_at(&self, now_millis: i64) -> Result<String, PushIdError> {
        let mut state = self.state.lock();

        if now_millis == state.last_millis {
            let mut next = state.last_random;
            increment(&mut next)?;
            state.last_random = next;
        } else {
            let mut rng = rand::thread_rng();
            for slot in state.last_random.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
            state.last_millis = now_millis;
        }

        let mut id = Vec::with_capacity(TIME_CHARS + RANDOM_CHARS);
        let mut ts = now_millis;
        let mut time_part = [0u8; TIME_CHARS];
        for slot in time_part.iter_mut().rev() {
            *slot = ALPHABET[(ts % 64) as usize];
            ts /= 64;
        }
        id.extend_from_slice(&time_part);
        id.extend(state.last_random.iter().map(|&d| ALPHABET[d as usize]));

        Ok(id.into_iter().map(char::from).collect())
    }
}

fn increment(digits: &mut [u8; RANDOM_CHARS]) -> Result<(), PushIdError> {
    for digit in digits.iter_mut().rev() {
        if *digit < 63 {
            *digit += 1;
            return Ok(());
        }
        *digit = 0;
    }
    Err(PushIdError::Exhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_twenty_chars_and_sorted() {
        let generator = PushIdGenerator::new();
        let mut ids = Vec::new();
        for i in 0..50 {
            ids.push(generator.next_id_at(1_700_000_000_000 + (i / 10)).unwrap());
        }
        assert!(ids.iter().all(|id| id.len() == 20));
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        sorted.dedup();
        assert_eq!(sorted.len(), 50);
    }

    #[test]
    fn later_millis_sort_after() {
        let generator = PushIdGenerator::new();
        let a = generator.next_id_at(1_000).unwrap();
        let b = generator.next_id_at(64_000).unwrap();
        assert!(a < b);
    }

    #[test]
    fn exhausted_tail_fails() {
        let generator = PushIdGenerator::new();
        generator.next_id_at(5).unwrap();
        generator.state.lock().last_random = [63; RANDOM_CHARS];
        let err = generator.next_id_at(5).unwrap_err();
        assert_eq!(err, PushIdError::Exhausted);
        assert_eq!(err.to_string(), "child key space exhausted for this millisecond");
    }
}
