//! The paid minigame commands we send ourselves, and what each one costs.

use thiserror::Error;

pub const MIN_HEIST: i64 = 1;
pub const MAX_HEIST: i64 = 10_000;
pub const DEFAULT_HEIST: i64 = 1_000;
pub const DEFAULT_SLOTS_COST: i64 = 2_000;
pub const DEFAULT_ARENA_COST: i64 = 1_000;

pub const SLOTS_COMMAND: &str = "!slots";
pub const HEIST_COMMAND: &str = "!heist";
pub const ARENA_COMMAND: &str = "!ffa";
pub const BALANCE_COMMAND: &str = "!bombs";

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("heist amount must be positive, got {0}")]
pub struct InvalidHeistAmount(pub i64);

/// Rejects non-positive amounts and clamps anything above [`MAX_HEIST`].
pub fn validate_heist_amount(amount: i64) -> Result<i64, InvalidHeistAmount> {
    if amount < MIN_HEIST {
        return Err(InvalidHeistAmount(amount));
    }
    Ok(amount.min(MAX_HEIST))
}

/// Picks the heist stake from an optional chat argument. Anything that is not
/// an integer falls back to `default`; the result is validated either way.
pub fn normalize_heist_arg(
    arg: Option<&str>,
    default: i64,
) -> Result<i64, InvalidHeistAmount> {
    let amount = arg
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .unwrap_or(default);
    validate_heist_amount(amount)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Costs {
    pub slots: i64,
    pub arena: i64,
}

impl Default for Costs {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS_COST,
            arena: DEFAULT_ARENA_COST,
        }
    }
}

/// An outgoing message the wallet has to pay for before it is sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PaidCommand {
    Slots,
    Arena,
    Heist { amount: i64 },
}

impl PaidCommand {
    /// Recognises a paid command by its first token (case-insensitive).
    /// Returns `None` for messages that cost nothing.
    pub fn detect(
        message: &str,
        default_heist: i64,
    ) -> Option<Result<Self, InvalidHeistAmount>> {
        let mut tokens = message.split_whitespace();
        let base = tokens.next()?.to_lowercase();
        match base.as_str() {
            SLOTS_COMMAND => Some(Ok(PaidCommand::Slots)),
            ARENA_COMMAND => Some(Ok(PaidCommand::Arena)),
            HEIST_COMMAND => Some(
                normalize_heist_arg(tokens.next(), default_heist)
                    .map(|amount| PaidCommand::Heist { amount }),
            ),
            _ => None,
        }
    }

    pub fn cost(&self, costs: &Costs) -> i64 {
        match self {
            PaidCommand::Slots => costs.slots,
            PaidCommand::Arena => costs.arena,
            PaidCommand::Heist { amount } => *amount,
        }
    }

    /// The exact text put on the wire for this command.
    pub fn message(&self) -> String {
        match self {
            PaidCommand::Slots => SLOTS_COMMAND.to_string(),
            PaidCommand::Arena => ARENA_COMMAND.to_string(),
            PaidCommand::Heist { amount } => format!("{HEIST_COMMAND} {amount}"),
        }
    }
}
