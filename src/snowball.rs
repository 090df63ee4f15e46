//! Metastable decision procedure.
//!
//! One generic box, instantiated twice: over block candidates for
//! finalization, and over a boolean for out-of-sync detection. Each round the
//! caller feeds in stake-weighted tallies; a candidate whose tally clears
//! `alpha` earns a confirmation, and `beta` *consecutive* confirmations of
//! the same candidate lock the decision in. A single-round majority is
//! fragile under network lag; consecutive confirmations are what make the
//! decision metastable — once the honest majority drifts past the confidence
//! threshold, it stays there.

use std::collections::HashMap;

/// A value Snowball can sample over: anything with a stable 256-bit identity.
pub trait Identity: Clone {
    fn identity(&self) -> [u8; 32];
}

impl Identity for bool {
    fn identity(&self) -> [u8; 32] {
        let mut id = [0u8; 32];
        id[31] = *self as u8;
        id
    }
}

/// A Snowball sampler.
pub struct Snowball<T: Identity> {
    alpha: f64,
    beta: u32,

    preferred: Option<T>,
    last: Option<[u8; 32]>,
    counts: HashMap<[u8; 32], u32>,
    count: u32,
    decided: bool,
}

impl<T: Identity> Snowball<T> {
    pub fn new(alpha: f64, beta: u32) -> Self {
        Snowball {
            alpha,
            beta,
            preferred: None,
            last: None,
            counts: HashMap::new(),
            count: 0,
            decided: false,
        }
    }

    /// Feed one round of tallies. No-op once decided.
    pub fn tick(&mut self, tallies: &[(T, f64)]) {
        if self.decided {
            return;
        }

        let Some((winner, weight)) = tallies
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        else {
            return;
        };

        // Until a preferred value exists, only adopt one that already clears
        // the confidence threshold.
        let preferred_id = match &self.preferred {
            Some(preferred) => preferred.identity(),
            None => {
                if *weight >= self.alpha {
                    self.preferred = Some(winner.clone());
                }
                return;
            }
        };

        if *weight < self.alpha {
            self.count = 0;
            return;
        }

        let id = winner.identity();
        let tally = {
            let entry = self.counts.entry(id).or_insert(0);
            *entry += 1;
            *entry
        };
        if tally > self.counts.get(&preferred_id).copied().unwrap_or(0) {
            self.preferred = Some(winner.clone());
        }

        if self.last == Some(id) {
            self.count += 1;
        } else {
            self.count = 1;
            self.last = Some(id);
        }

        if self.count >= self.beta {
            self.decided = true;
        }
    }

    /// Set the preferred candidate directly (our own proposal).
    pub fn prefer(&mut self, value: T) {
        self.preferred = Some(value);
    }

    pub fn preferred(&self) -> Option<&T> {
        self.preferred.as_ref()
    }

    pub fn decided(&self) -> bool {
        self.decided
    }

    /// Clear all state; nothing survives across rounds.
    pub fn reset(&mut self) {
        self.preferred = None;
        self.last = None;
        self.counts.clear();
        self.count = 0;
        self.decided = false;
    }
}
