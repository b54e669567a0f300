//! Context token minting.
//!
//! Tokens are drawn from a PRNG seeded from the wall clock and the process
//! id, reseeded every `RESEED_INTERVAL` mints. This gives best-effort
//! uniqueness, not unpredictability: a token is an arbitration handle, not a
//! credential. Uniqueness among live sessions is enforced by reminting on
//! collision with the live set.

use crate::error::ContextError;
use keystone_state::ContextToken;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Mints between two reseeds.
pub const RESEED_INTERVAL: u32 = 1024;

/// Draws per mint before giving up.
pub const MINT_ATTEMPTS: usize = 32;

pub struct TokenMinter {
    rng: StdRng,
    since_reseed: u32,
    reseed_every: u32,
    live: HashSet<ContextToken>,
}

impl TokenMinter {
    /// # Errors
    /// `SeedUnavailable` if the wall clock reads before the epoch.
    pub fn new() -> Result<Self, ContextError> {
        Self::with_reseed_interval(RESEED_INTERVAL)
    }

    pub fn with_reseed_interval(reseed_every: u32) -> Result<Self, ContextError> {
        let mut minter = Self::with_seed(time_seed()?);
        minter.reseed_every = reseed_every.max(1);
        Ok(minter)
    }

    /// Fixed-seed minter; reseeding still mixes in the clock.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed ^ pid_entropy()),
            since_reseed: 0,
            reseed_every: RESEED_INTERVAL,
            live: HashSet::new(),
        }
    }

    /// Returns a nonzero token that is not currently live and marks it live.
    ///
    /// # Errors
    /// - `SeedUnavailable` if a due reseed cannot read the clock
    /// - `TokenSpaceExhausted` if every draw collided
    pub fn mint(&mut self) -> Result<ContextToken, ContextError> {
        if self.since_reseed >= self.reseed_every {
            self.reseed()?;
        }
        self.since_reseed += 1;

        for attempt in 0..MINT_ATTEMPTS {
            let token = ContextToken(self.rng.random());
            if token.0 == 0 || self.live.contains(&token) {
                debug!(attempt, "context token collision, reminting");
                continue;
            }
            self.live.insert(token);
            trace!(%token, live = self.live.len(), "context token minted");
            return Ok(token);
        }

        Err(ContextError::TokenSpaceExhausted {
            attempts: MINT_ATTEMPTS,
            live: self.live.len(),
        })
    }

    /// Ends a session's token. Returns whether it was live.
    pub fn retire(&mut self, token: ContextToken) -> bool {
        self.live.remove(&token)
    }

    pub fn is_live(&self, token: ContextToken) -> bool {
        self.live.contains(&token)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn reseed(&mut self) -> Result<(), ContextError> {
        // Chain the old stream into the new seed so two reseeds within one
        // clock tick still diverge.
        let seed = time_seed()? ^ self.rng.next_u64();
        self.rng = StdRng::seed_from_u64(seed ^ pid_entropy());
        self.since_reseed = 0;
        trace!("token minter reseeded");
        Ok(())
    }
}

/// Wall-clock microseconds since the epoch.
fn time_seed() -> Result<u64, ContextError> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(now.as_micros() as u64)
}

fn pid_entropy() -> u64 {
    (std::process::id() as u64).rotate_left(32)
}
