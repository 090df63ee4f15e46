//! Vote containers and stake-weighted tally calculation.
//!
//! Each query round yields at most one vote per sampled peer. Tallies blend
//! three components — the raw vote count, the voters' stake, and (for block
//! candidates) the number of transactions the candidate carries — each
//! normalized against the whole sample, then scaled back into `[0, 1]` so
//! they compare directly against the Snowball `alpha` thresholds.
//! Abstentions stay in the denominators: an empty vote dilutes every
//! candidate, which is what keeps a single stray response from deciding a
//! round.

use std::collections::HashMap;

use crate::accounts::read_stake;
use crate::avl::Tree;
use crate::block::Block;
use crate::config::Config;
use crate::constants::MINIMUM_STAKE;
use crate::{AccountId, BlockId};

/// One peer's answer to a finalization query; `None` is an abstention.
#[derive(Clone, Debug)]
pub struct FinalizationVote {
    pub voter: AccountId,
    pub block: Option<Block>,
}

/// One peer's answer to an out-of-sync probe.
#[derive(Clone, Debug)]
pub struct SyncVote {
    pub voter: AccountId,
    pub out_of_sync: bool,
}

fn voter_stake(snapshot: &Tree, voter: &AccountId) -> f64 {
    read_stake(snapshot, voter).max(MINIMUM_STAKE) as f64
}

/// Weigh one round of block votes. Returns a tally in `[0, 1]` per distinct
/// candidate.
pub fn finalization_tallies(
    config: &Config,
    snapshot: &Tree,
    votes: &[FinalizationVote],
) -> Vec<(Block, f64)> {
    if votes.is_empty() {
        return Vec::new();
    }

    struct Candidate {
        block: Block,
        count: f64,
        stake: f64,
    }

    let total_votes = votes.len() as f64;
    let mut total_stake = 0.0;
    let mut candidates: HashMap<BlockId, Candidate> = HashMap::new();

    for vote in votes {
        let stake = voter_stake(snapshot, &vote.voter);
        total_stake += stake;
        let Some(block) = &vote.block else { continue };
        let candidate = candidates.entry(block.id).or_insert_with(|| Candidate {
            block: block.clone(),
            count: 0.0,
            stake: 0.0,
        });
        candidate.count += 1.0;
        candidate.stake += stake;
    }

    let total_transactions: usize = candidates
        .values()
        .map(|c| c.block.transactions.len())
        .sum();
    let total_transactions = total_transactions.max(1) as f64;

    let stake_weight = config.stake_majority_weight;
    let tx_weight = config.transactions_num_weight();
    let scale = 1.0 + stake_weight + tx_weight;

    candidates
        .into_values()
        .map(|candidate| {
            let count_component = candidate.count / total_votes;
            let stake_component = candidate.stake / total_stake;
            let tx_component = candidate.block.transactions.len() as f64 / total_transactions;
            let tally =
                (count_component + stake_component * stake_weight + tx_component * tx_weight)
                    / scale;
            (candidate.block, tally)
        })
        .collect()
}

/// Weigh one round of out-of-sync votes.
pub fn sync_tallies(config: &Config, snapshot: &Tree, votes: &[SyncVote]) -> Vec<(bool, f64)> {
    if votes.is_empty() {
        return Vec::new();
    }

    let total_votes = votes.len() as f64;
    let mut total_stake = 0.0;
    let mut counts = [0.0f64; 2];
    let mut stakes = [0.0f64; 2];

    for vote in votes {
        let stake = voter_stake(snapshot, &vote.voter);
        total_stake += stake;
        let slot = vote.out_of_sync as usize;
        counts[slot] += 1.0;
        stakes[slot] += stake;
    }

    let stake_weight = config.stake_majority_weight;
    let scale = 1.0 + stake_weight;

    [false, true]
        .into_iter()
        .map(|value| {
            let slot = value as usize;
            let tally =
                (counts[slot] / total_votes + stakes[slot] / total_stake * stake_weight) / scale;
            (value, tally)
        })
        .collect()
}
