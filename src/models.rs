use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::errors::LedgerResult;
use crate::ledger::{BalanceBucket, Balances};

/// `transactionable_type` / `purchasable_type` values for rows owned here.
pub const TRANSACTION_REF: &str = "transaction";
pub const PAYOUT_REQUEST_REF: &str = "payout_request";

/// Creator wallet. `version` bumps on every mutation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub user_id: String,
    pub total_balance: Decimal,
    pub pending_balance: Decimal,
    pub available_for_payout: Decimal,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn balances(&self) -> Balances {
        Balances {
            total: self.total_balance,
            pending: self.pending_balance,
            available: self.available_for_payout,
        }
    }
}

/// Append-only record of one wallet mutation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WalletHistory {
    pub id: String,
    pub user_id: String,
    pub wallet_id: String,
    /// Wallet version this row produced; orders replay.
    pub wallet_version: i64,
    pub amount: Decimal,
    pub balance_type: BalanceBucket,
    pub transaction_type: HistoryType,
    pub status: HistoryStatus,
    pub transactionable_type: Option<String>,
    pub transactionable_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HistoryType {
    Credit,
    Debit,
    Transfer,
}

impl std::fmt::Display for HistoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryType::Credit => write!(f, "credit"),
            HistoryType::Debit => write!(f, "debit"),
            HistoryType::Transfer => write!(f, "transfer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryStatus::Pending => write!(f, "pending"),
            HistoryStatus::Completed => write!(f, "completed"),
            HistoryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// The operator's fee account. There is exactly one row, id 1.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlatformWallet {
    pub id: i16,
    pub balance: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlatformWalletHistory {
    pub id: String,
    pub amount: Decimal,
    pub transaction_type: HistoryType,
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub transactionable_type: Option<String>,
    pub transactionable_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Creator subscription plan. Discounts are whole percentages.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tier {
    pub id: String,
    pub creator_id: String,
    pub title: String,
    pub monthly_price: Decimal,
    pub three_month_discount: i32,
    pub six_month_discount: i32,
    pub twelve_month_discount: i32,
    pub created_at: DateTime<Utc>,
}

impl Tier {
    pub fn discount_for(&self, duration: SubscriptionDuration) -> i32 {
        match duration {
            SubscriptionDuration::OneMonth => 0,
            SubscriptionDuration::ThreeMonths => self.three_month_discount,
            SubscriptionDuration::SixMonths => self.six_month_discount,
            SubscriptionDuration::TwelveMonths => self.twelve_month_discount,
        }
    }

    /// Full price for `duration`, less its discount, in cents.
    pub fn price_for(&self, duration: SubscriptionDuration) -> Decimal {
        discounted_price(self.monthly_price, duration, self.discount_for(duration))
    }
}

pub fn discounted_price(
    monthly_price: Decimal,
    duration: SubscriptionDuration,
    discount: i32,
) -> Decimal {
    let base = monthly_price * Decimal::from(duration.months());
    let discount = Decimal::from(discount.clamp(0, 100));
    (base * (Decimal::ONE_HUNDRED - discount) / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Subscription length in months, sent on the wire as 1, 3, 6 or 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SubscriptionDuration {
    OneMonth,
    ThreeMonths,
    SixMonths,
    TwelveMonths,
}

impl SubscriptionDuration {
    pub fn months(self) -> u32 {
        match self {
            SubscriptionDuration::OneMonth => 1,
            SubscriptionDuration::ThreeMonths => 3,
            SubscriptionDuration::SixMonths => 6,
            SubscriptionDuration::TwelveMonths => 12,
        }
    }

    pub fn transaction_type(self) -> TransactionType {
        match self {
            SubscriptionDuration::OneMonth => TransactionType::OneMonthSubscription,
            SubscriptionDuration::ThreeMonths => TransactionType::ThreeMonthsSubscription,
            SubscriptionDuration::SixMonths => TransactionType::SixMonthsSubscription,
            SubscriptionDuration::TwelveMonths => TransactionType::YearlySubscription,
        }
    }
}

impl TryFrom<u32> for SubscriptionDuration {
    type Error = String;

    fn try_from(months: u32) -> Result<Self, Self::Error> {
        match months {
            1 => Ok(SubscriptionDuration::OneMonth),
            3 => Ok(SubscriptionDuration::ThreeMonths),
            6 => Ok(SubscriptionDuration::SixMonths),
            12 => Ok(SubscriptionDuration::TwelveMonths),
            other => Err(format!("unsupported subscription duration: {} months", other)),
        }
    }
}

impl From<SubscriptionDuration> for u32 {
    fn from(duration: SubscriptionDuration) -> Self {
        duration.months()
    }
}

/// Canonical payment record; subscriptions, tips and purchases all land here.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub tier_id: Option<String>,
    pub amount: Decimal,
    pub platform_fee: Option<Decimal>,
    pub net_amount: Option<Decimal>,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub purchasable_type: Option<String>,
    pub purchasable_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    OneMonthSubscription,
    ThreeMonthsSubscription,
    SixMonthsSubscription,
    YearlySubscription,
    Tip,
    MediaPurchase,
    MessagePurchase,
}

impl TransactionType {
    pub fn is_subscription(self) -> bool {
        matches!(
            self,
            TransactionType::OneMonthSubscription
                | TransactionType::ThreeMonthsSubscription
                | TransactionType::SixMonthsSubscription
                | TransactionType::YearlySubscription
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionType::OneMonthSubscription => "one_month_subscription",
            TransactionType::ThreeMonthsSubscription => "three_months_subscription",
            TransactionType::SixMonthsSubscription => "six_months_subscription",
            TransactionType::YearlySubscription => "yearly_subscription",
            TransactionType::Tip => "tip",
            TransactionType::MediaPurchase => "media_purchase",
            TransactionType::MessagePurchase => "message_purchase",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Declined,
    Refunded,
}

impl TransactionStatus {
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Pending, TransactionStatus::Approved)
                | (TransactionStatus::Pending, TransactionStatus::Declined)
                | (TransactionStatus::Approved, TransactionStatus::Refunded)
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "pending"),
            TransactionStatus::Approved => write!(f, "approved"),
            TransactionStatus::Declined => write!(f, "declined"),
            TransactionStatus::Refunded => write!(f, "refunded"),
        }
    }
}

/// Where a creator's withdrawals are sent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PayoutMethod {
    pub id: String,
    pub user_id: String,
    pub method_type: PayoutMethodType,
    pub provider: String,
    pub account_number: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutMethodType {
    BankTransfer,
    Paypal,
    Crypto,
}

impl std::fmt::Display for PayoutMethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayoutMethodType::BankTransfer => write!(f, "bank_transfer"),
            PayoutMethodType::Paypal => write!(f, "paypal"),
            PayoutMethodType::Crypto => write!(f, "crypto"),
        }
    }
}

/// A creator's withdrawal against `available_for_payout`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: String,
    pub user_id: String,
    pub payout_method_id: String,
    pub amount: Decimal,
    pub status: PayoutStatus,
    pub reference_id: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PayoutRequest {
    /// Human-readable numeric reference: unix seconds then seven random digits.
    pub fn generate_reference_id() -> String {
        let suffix: u32 = rand::thread_rng().gen_range(1_000_000..=9_999_999);
        format!("{}{}", Utc::now().timestamp(), suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Cancelled,
}

impl PayoutStatus {
    pub const ALL: [PayoutStatus; 5] = [
        PayoutStatus::Pending,
        PayoutStatus::Processing,
        PayoutStatus::Processed,
        PayoutStatus::Failed,
        PayoutStatus::Cancelled,
    ];

    pub fn can_transition_to(self, next: PayoutStatus) -> bool {
        matches!(
            (self, next),
            (PayoutStatus::Pending, PayoutStatus::Processing)
                | (PayoutStatus::Pending, PayoutStatus::Failed)
                | (PayoutStatus::Pending, PayoutStatus::Cancelled)
                | (PayoutStatus::Processing, PayoutStatus::Processed)
                | (PayoutStatus::Processing, PayoutStatus::Failed)
        )
    }

    /// Funds of an open request are still held out of the wallet.
    pub fn is_open(self) -> bool {
        matches!(self, PayoutStatus::Pending | PayoutStatus::Processing)
    }
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayoutStatus::Pending => write!(f, "pending"),
            PayoutStatus::Processing => write!(f, "processing"),
            PayoutStatus::Processed => write!(f, "processed"),
            PayoutStatus::Failed => write!(f, "failed"),
            PayoutStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

// === API Request/Response Models ===

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTierRequest {
    pub creator_id: String,
    pub title: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub monthly_price: Decimal,
    #[serde(default)]
    pub three_month_discount: i32,
    #[serde(default)]
    pub six_month_discount: i32,
    #[serde(default)]
    pub twelve_month_discount: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub subscriber_id: String,
    pub tier_id: String,
    pub duration: SubscriptionDuration,
}

/// Tips and purchases; subscriptions go through [`CreateSubscriptionRequest`].
#[derive(Debug, Deserialize)]
pub struct CreateTransactionRequest {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub purchasable_type: Option<String>,
    pub purchasable_id: Option<String>,
}

/// Everything needed to insert a pending transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub sender_id: String,
    pub receiver_id: String,
    pub tier_id: Option<String>,
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    pub purchasable_type: Option<String>,
    pub purchasable_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePayoutMethodRequest {
    pub method_type: PayoutMethodType,
    pub provider: String,
    pub account_number: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePayoutRequest {
    pub payout_method_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct FailPayoutRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

/// Generic API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub user_id: String,
    pub total_balance: Decimal,
    pub pending_balance: Decimal,
    pub available_for_payout: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl From<Wallet> for WalletResponse {
    fn from(wallet: Wallet) -> Self {
        Self {
            user_id: wallet.user_id,
            total_balance: wallet.total_balance,
            pending_balance: wallet.pending_balance,
            available_for_payout: wallet.available_for_payout,
            updated_at: wallet.updated_at,
        }
    }
}

/// Stored wallet balances checked against replayed history.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub user_id: String,
    pub stored: Balances,
    /// `None` when the history could not be replayed.
    pub replayed: Option<Balances>,
    pub replay_error: Option<String>,
    pub held_by_open_payouts: Decimal,
    pub consistent: bool,
}

impl ReconciliationReport {
    pub fn new(
        user_id: String,
        stored: Balances,
        replay: LedgerResult<Balances>,
        held: Decimal,
    ) -> Self {
        let (replayed, replay_error) = match replay {
            Ok(balances) => (Some(balances), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let consistent = replayed == Some(stored)
            && stored.total == stored.pending + stored.available + held;
        Self {
            user_id,
            stored,
            replayed,
            replay_error,
            held_by_open_payouts: held,
            consistent,
        }
    }
}
