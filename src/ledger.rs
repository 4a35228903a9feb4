//! Balance arithmetic shared by the repository and its tests.
//!
//! A wallet only ever changes through a [`LedgerOp`]. Each op touches the
//! balance buckets in a fixed way and is recorded as exactly one wallet
//! history row, so replaying the history rebuilds the balances.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, LedgerResult};
use crate::models::{HistoryStatus, HistoryType, WalletHistory};

/// Which wallet balance a mutation is booked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BalanceBucket {
    Total,
    Pending,
    Available,
}

impl std::fmt::Display for BalanceBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceBucket::Total => write!(f, "total"),
            BalanceBucket::Pending => write!(f, "pending"),
            BalanceBucket::Available => write!(f, "available"),
        }
    }
}

/// The three balances a creator wallet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Balances {
    pub total: Decimal,
    pub pending: Decimal,
    pub available: Decimal,
}

fn ensure_positive(amount: Decimal) -> LedgerResult<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(
            "Amount must be positive".to_string(),
        ));
    }
    Ok(())
}

impl Balances {
    fn slot(&mut self, bucket: BalanceBucket) -> &mut Decimal {
        match bucket {
            BalanceBucket::Total => &mut self.total,
            BalanceBucket::Pending => &mut self.pending,
            BalanceBucket::Available => &mut self.available,
        }
    }

    pub fn get(&self, bucket: BalanceBucket) -> Decimal {
        match bucket {
            BalanceBucket::Total => self.total,
            BalanceBucket::Pending => self.pending,
            BalanceBucket::Available => self.available,
        }
    }

    pub fn add(&mut self, bucket: BalanceBucket, amount: Decimal) -> LedgerResult<()> {
        ensure_positive(amount)?;
        let slot = self.slot(bucket);
        *slot = slot
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount("Balance overflow".to_string()))?;
        Ok(())
    }

    /// Fails without touching the bucket if it would go negative.
    pub fn subtract(&mut self, bucket: BalanceBucket, amount: Decimal) -> LedgerResult<()> {
        ensure_positive(amount)?;
        let available = self.get(bucket);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                bucket,
                required: amount,
                available,
            });
        }
        *self.slot(bucket) = available - amount;
        Ok(())
    }

    pub fn add_to_total_balance(&mut self, amount: Decimal) -> LedgerResult<()> {
        self.add(BalanceBucket::Total, amount)
    }

    pub fn subtract_from_total_balance(&mut self, amount: Decimal) -> LedgerResult<()> {
        self.subtract(BalanceBucket::Total, amount)
    }

    pub fn add_to_pending_balance(&mut self, amount: Decimal) -> LedgerResult<()> {
        self.add(BalanceBucket::Pending, amount)
    }

    pub fn subtract_from_pending_balance(&mut self, amount: Decimal) -> LedgerResult<()> {
        self.subtract(BalanceBucket::Pending, amount)
    }

    pub fn add_to_available_for_payout(&mut self, amount: Decimal) -> LedgerResult<()> {
        self.add(BalanceBucket::Available, amount)
    }

    pub fn subtract_from_available_for_payout(&mut self, amount: Decimal) -> LedgerResult<()> {
        self.subtract(BalanceBucket::Available, amount)
    }

    pub fn move_pending_to_available(&mut self, amount: Decimal) -> LedgerResult<()> {
        let mut next = *self;
        next.subtract_from_pending_balance(amount)?;
        next.add_to_available_for_payout(amount)?;
        *self = next;
        Ok(())
    }
}

/// A single wallet mutation and the history row it is booked as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    /// Net earnings from an approved payment land in pending.
    Earn(Decimal),
    /// A refunded payment takes its net earnings back out of pending.
    Reverse(Decimal),
    /// Pending earnings become withdrawable.
    Release(Decimal),
    /// A payout request reserves withdrawable funds.
    Hold(Decimal),
    /// A processed payout leaves the wallet for good.
    Settle(Decimal),
    /// A failed or cancelled payout gives its reservation back.
    Return(Decimal),
}

impl LedgerOp {
    pub fn amount(&self) -> Decimal {
        match *self {
            LedgerOp::Earn(a)
            | LedgerOp::Reverse(a)
            | LedgerOp::Release(a)
            | LedgerOp::Hold(a)
            | LedgerOp::Settle(a)
            | LedgerOp::Return(a) => a,
        }
    }

    /// How the op is recorded in wallet history.
    pub fn booking(&self) -> (BalanceBucket, HistoryType) {
        match self {
            LedgerOp::Earn(_) => (BalanceBucket::Pending, HistoryType::Credit),
            LedgerOp::Reverse(_) => (BalanceBucket::Pending, HistoryType::Debit),
            LedgerOp::Release(_) => (BalanceBucket::Available, HistoryType::Transfer),
            LedgerOp::Hold(_) => (BalanceBucket::Available, HistoryType::Debit),
            LedgerOp::Settle(_) => (BalanceBucket::Total, HistoryType::Debit),
            LedgerOp::Return(_) => (BalanceBucket::Available, HistoryType::Credit),
        }
    }

    /// Inverse of [`LedgerOp::booking`].
    pub fn from_booking(
        bucket: BalanceBucket,
        kind: HistoryType,
        amount: Decimal,
    ) -> Option<LedgerOp> {
        match (bucket, kind) {
            (BalanceBucket::Pending, HistoryType::Credit) => Some(LedgerOp::Earn(amount)),
            (BalanceBucket::Pending, HistoryType::Debit) => Some(LedgerOp::Reverse(amount)),
            (BalanceBucket::Available, HistoryType::Transfer) => Some(LedgerOp::Release(amount)),
            (BalanceBucket::Available, HistoryType::Debit) => Some(LedgerOp::Hold(amount)),
            (BalanceBucket::Total, HistoryType::Debit) => Some(LedgerOp::Settle(amount)),
            (BalanceBucket::Available, HistoryType::Credit) => Some(LedgerOp::Return(amount)),
            _ => None,
        }
    }

    /// Applies the op to `balances` all-or-nothing.
    pub fn apply(&self, balances: &mut Balances) -> LedgerResult<()> {
        let mut next = *balances;
        match *self {
            LedgerOp::Earn(a) => {
                next.add_to_pending_balance(a)?;
                next.add_to_total_balance(a)?;
            }
            LedgerOp::Reverse(a) => {
                next.subtract_from_pending_balance(a)?;
                next.subtract_from_total_balance(a)?;
            }
            LedgerOp::Release(a) => next.move_pending_to_available(a)?,
            LedgerOp::Hold(a) => next.subtract_from_available_for_payout(a)?,
            LedgerOp::Settle(a) => next.subtract_from_total_balance(a)?,
            LedgerOp::Return(a) => next.add_to_available_for_payout(a)?,
        }
        *balances = next;
        Ok(())
    }
}

/// Rebuilds balances from completed history rows, oldest first.
pub fn replay<'a, I>(history: I) -> LedgerResult<Balances>
where
    I: IntoIterator<Item = &'a WalletHistory>,
{
    let mut balances = Balances::default();
    for entry in history {
        if entry.status != HistoryStatus::Completed {
            continue;
        }
        let op = LedgerOp::from_booking(entry.balance_type, entry.transaction_type, entry.amount)
            .ok_or_else(|| {
                LedgerError::InternalError(format!(
                    "History entry {} has no matching ledger op",
                    entry.id
                ))
            })?;
        op.apply(&mut balances)?;
    }
    Ok(balances)
}

/// 100% in basis points.
pub const MAX_FEE_BPS: u32 = 10_000;

/// Platform fee taken from every approved payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub platform_fee_bps: u32,
}

/// How a gross payment divides between platform and creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeSplit {
    pub gross: Decimal,
    pub platform_fee: Decimal,
    pub net: Decimal,
}

impl FeeSchedule {
    pub fn new(platform_fee_bps: u32) -> Self {
        Self {
            platform_fee_bps: platform_fee_bps.min(MAX_FEE_BPS),
        }
    }

    /// Fee rounds to cents; `platform_fee + net == gross`.
    pub fn split(&self, gross: Decimal) -> FeeSplit {
        let rate = Decimal::from(self.platform_fee_bps) / Decimal::from(10_000);
        let platform_fee = (gross * rate)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
            .min(gross);
        FeeSplit {
            gross,
            platform_fee,
            net: gross - platform_fee,
        }
    }
}
