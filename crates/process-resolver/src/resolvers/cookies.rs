use rand::{Rng, SeedableRng, rngs::StdRng};

use super::CookieGenerator;

/// Non-zero cookies counting up from a random start.
///
/// No value repeats before 2^32 - 1 cookies have been issued, without
/// remembering the issued ones.
pub struct RandomCookieGenerator {
    next: u32,
}

impl Default for RandomCookieGenerator {
    fn default() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }
}

impl RandomCookieGenerator {
    pub fn from_rng(mut rng: StdRng) -> Self {
        Self::starting_at(rng.gen_range(1..=u32::MAX))
    }

    fn starting_at(next: u32) -> Self {
        Self { next }
    }
}

impl CookieGenerator for RandomCookieGenerator {
    fn new_cookie(&mut self) -> u32 {
        let cookie = self.next;
        self.next = match cookie.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        cookie
    }
}
