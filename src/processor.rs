//! Tag-indexed transaction processors.
//!
//! Each transaction tag maps to a handler applied against the snapshot being
//! collapsed. Registration happens once at construction; a tag with no
//! handler is fatal for the whole proposal (the block cannot be simulated),
//! while a handler returning an error rejects only that transaction.
//!
//! Payload layouts (big-endian):
//! - `Transfer`: `recipient (32B) ‖ amount (u64)`
//! - `Stake`: `op (u8: 0 withdraw, 1 place) ‖ amount (u64)`
//! - `Nop`: empty

use crate::accounts::{read_balance, read_stake, write_balance, write_stake};
use crate::avl::Tree;
use crate::constants::TRANSACTION_FEE;
use crate::transaction::{Tag, Transaction};

/// Why a single transaction was rejected during collapse.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("payload is malformed")]
    MalformedPayload,
    #[error("balance {balance} cannot cover {required}")]
    InsufficientBalance { balance: u64, required: u64 },
    #[error("stake {stake} cannot cover {required}")]
    InsufficientStake { stake: u64, required: u64 },
}

/// Context a processor mutates.
pub struct ProcessorContext<'a> {
    pub snapshot: &'a mut Tree,
    pub tx: &'a Transaction,
    pub block_index: u64,
}

/// A registered transaction handler.
pub type Processor = fn(&mut ProcessorContext) -> Result<(), ProcessorError>;

/// The tag-indexed handler table.
pub struct ProcessorRegistry {
    handlers: [Option<Processor>; Tag::COUNT],
}

impl Default for ProcessorRegistry {
    /// The built-in handlers. `Contract` is intentionally unregistered: the
    /// contract VM is an external collaborator and plugs in via `register`.
    fn default() -> Self {
        let mut registry = ProcessorRegistry {
            handlers: [None; Tag::COUNT],
        };
        registry.register(Tag::Nop, apply_nop);
        registry.register(Tag::Transfer, apply_transfer);
        registry.register(Tag::Stake, apply_stake);
        registry
    }
}

impl ProcessorRegistry {
    pub fn register(&mut self, tag: Tag, processor: Processor) {
        self.handlers[tag as usize] = Some(processor);
    }

    pub fn get(&self, tag: Tag) -> Option<Processor> {
        self.handlers[tag as usize]
    }
}

fn apply_nop(ctx: &mut ProcessorContext) -> Result<(), ProcessorError> {
    charge_fee(ctx, 0)
}

fn apply_transfer(ctx: &mut ProcessorContext) -> Result<(), ProcessorError> {
    let payload = ctx.tx.payload.as_slice();
    if payload.len() != 40 {
        return Err(ProcessorError::MalformedPayload);
    }
    let recipient: [u8; 32] = payload[..32].try_into().expect("32 bytes");
    let amount = u64::from_be_bytes(payload[32..].try_into().expect("8 bytes"));

    charge_fee(ctx, amount)?;

    let sender_balance = read_balance(ctx.snapshot, &ctx.tx.sender);
    write_balance(ctx.snapshot, &ctx.tx.sender, sender_balance - amount);
    let recipient_balance = read_balance(ctx.snapshot, &recipient);
    write_balance(
        ctx.snapshot,
        &recipient,
        recipient_balance.saturating_add(amount),
    );
    Ok(())
}

fn apply_stake(ctx: &mut ProcessorContext) -> Result<(), ProcessorError> {
    let payload = ctx.tx.payload.as_slice();
    if payload.len() != 9 || payload[0] > 1 {
        return Err(ProcessorError::MalformedPayload);
    }
    let place = payload[0] == 1;
    let amount = u64::from_be_bytes(payload[1..].try_into().expect("8 bytes"));

    let sender = ctx.tx.sender;
    if place {
        charge_fee(ctx, amount)?;
        let balance = read_balance(ctx.snapshot, &sender);
        let stake = read_stake(ctx.snapshot, &sender);
        write_balance(ctx.snapshot, &sender, balance - amount);
        write_stake(ctx.snapshot, &sender, stake.saturating_add(amount));
    } else {
        let stake = read_stake(ctx.snapshot, &sender);
        if stake < amount {
            return Err(ProcessorError::InsufficientStake {
                stake,
                required: amount,
            });
        }
        charge_fee(ctx, 0)?;
        let balance = read_balance(ctx.snapshot, &sender);
        write_stake(ctx.snapshot, &sender, stake - amount);
        write_balance(ctx.snapshot, &sender, balance.saturating_add(amount));
    }
    Ok(())
}

/// Deduct the flat protocol fee, first checking the sender can also cover
/// `upcoming` (the amount the handler is about to move).
fn charge_fee(ctx: &mut ProcessorContext, upcoming: u64) -> Result<(), ProcessorError> {
    let balance = read_balance(ctx.snapshot, &ctx.tx.sender);
    let required = upcoming.saturating_add(TRANSACTION_FEE);
    if balance < required {
        return Err(ProcessorError::InsufficientBalance { balance, required });
    }
    write_balance(ctx.snapshot, &ctx.tx.sender, balance - TRANSACTION_FEE);
    Ok(())
}
