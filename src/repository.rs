use crate::errors::{DbErrorKind, LedgerError, LedgerResult};
use crate::ledger::{replay, FeeSchedule, LedgerOp};
use crate::models::*;
use crate::retry::RetryPolicy;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction as DbTransaction};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Produces payout reference ids.
pub type ReferenceGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Fresh reference ids tried before a payout insert gives up.
const MAX_REFERENCE_ATTEMPTS: usize = 5;

const PAYOUT_REFERENCE_CONSTRAINT: &str = "payout_requests_reference_id_key";

/// Polymorphic link from a history row to the record that caused it.
#[derive(Debug, Clone, Copy)]
struct Source<'a> {
    kind: &'static str,
    id: &'a str,
}

fn validate_amount(amount: Decimal) -> LedgerResult<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(
            "Amount must be positive".to_string(),
        ));
    }
    if amount.normalize().scale() > 2 {
        return Err(LedgerError::InvalidAmount(
            "Amount must have at most two decimal places".to_string(),
        ));
    }
    Ok(())
}

const MAX_DISCOUNT_PERCENT: i32 = 99;

fn validate_tier(req: &CreateTierRequest) -> LedgerResult<()> {
    validate_amount(req.monthly_price)?;
    if req.title.trim().is_empty() {
        return Err(LedgerError::Validation("Tier title is required".to_string()));
    }
    for (duration, discount) in [
        (SubscriptionDuration::ThreeMonths, req.three_month_discount),
        (SubscriptionDuration::SixMonths, req.six_month_discount),
        (SubscriptionDuration::TwelveMonths, req.twelve_month_discount),
    ] {
        if !(0..=MAX_DISCOUNT_PERCENT).contains(&discount) {
            return Err(LedgerError::Validation(format!(
                "Discounts must be between 0 and {} percent",
                MAX_DISCOUNT_PERCENT
            )));
        }
        if discounted_price(req.monthly_price, duration, discount) <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "A {} month subscription would cost nothing",
                duration.months()
            )));
        }
    }
    Ok(())
}

fn ensure_transition<S>(entity: &'static str, from: S, to: S, allowed: bool) -> LedgerResult<()>
where
    S: std::fmt::Display,
{
    if allowed {
        Ok(())
    } else {
        Err(LedgerError::InvalidStateTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Database access for wallets, the platform wallet, transactions and payouts.
///
/// Every balance change is written together with its history row inside
/// one database transaction, after locking the rows it touches. Rows are
/// always locked in the same order (payment or payout row, then wallet,
/// then platform wallet) so concurrent requests cannot deadlock each other.
/// Public writes that fail with contention are retried with backoff.
#[derive(Clone)]
pub struct LedgerRepository {
    pool: PgPool,
    retry: RetryPolicy,
    reference_ids: ReferenceGenerator,
}

impl LedgerRepository {
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self {
            pool,
            retry,
            reference_ids: Arc::new(PayoutRequest::generate_reference_id),
        }
    }

    /// Replace the payout reference id source.
    pub fn with_reference_generator(mut self, reference_ids: ReferenceGenerator) -> Self {
        self.reference_ids = reference_ids;
        self
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> LedgerResult<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        self.retry
            .retry_async_if(op, LedgerError::is_retryable)
            .await
    }

    // === Wallets ===

    /// Fetch the user's wallet, creating an empty one on first use.
    pub async fn get_or_create_wallet(&self, user_id: &str) -> LedgerResult<Wallet> {
        sqlx::query(
            r#"
            INSERT INTO wallets (id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        self.find_wallet_by_user(user_id).await
    }

    pub async fn find_wallet_by_user(&self, user_id: &str) -> LedgerResult<Wallet> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, total_balance, pending_balance, available_for_payout,
                   version, created_at, updated_at
            FROM wallets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::WalletNotFound(user_id.to_string()))?;

        Ok(wallet)
    }

    /// Most recent history rows first.
    pub async fn wallet_history(&self, user_id: &str, limit: i64) -> LedgerResult<Vec<WalletHistory>> {
        let history = sqlx::query_as::<_, WalletHistory>(
            r#"
            SELECT id, user_id, wallet_id, wallet_version, amount, balance_type, transaction_type, status,
                   transactionable_type, transactionable_id, description, created_at
            FROM wallet_histories
            WHERE user_id = $1
            ORDER BY wallet_version DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(history)
    }

    /// Make `amount` of pending earnings available for payout.
    pub async fn release_pending(
        &self,
        user_id: &str,
        amount: Decimal,
    ) -> LedgerResult<(Wallet, WalletHistory)> {
        validate_amount(amount)?;
        self.with_retry(move |_| self.release_pending_once(user_id, amount))
            .await
    }

    async fn release_pending_once(
        &self,
        user_id: &str,
        amount: Decimal,
    ) -> LedgerResult<(Wallet, WalletHistory)> {
        let mut tx = self.pool.begin().await?;
        let wallet = self.lock_wallet_in_tx(&mut tx, user_id).await?;
        let result = self
            .apply_op_in_tx(
                &mut tx,
                &wallet,
                LedgerOp::Release(amount),
                None,
                Some("Pending earnings released"),
            )
            .await?;
        tx.commit().await?;

        tracing::info!(user_id = %user_id, amount = %amount, "Pending balance released");
        Ok(result)
    }

    /// Compare stored balances with the balances replayed from history.
    pub async fn reconcile_wallet(&self, user_id: &str) -> LedgerResult<ReconciliationReport> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, total_balance, pending_balance, available_for_payout,
                   version, created_at, updated_at
            FROM wallets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::WalletNotFound(user_id.to_string()))?;

        let history = sqlx::query_as::<_, WalletHistory>(
            r#"
            SELECT id, user_id, wallet_id, wallet_version, amount, balance_type, transaction_type, status,
                   transactionable_type, transactionable_id, description, created_at
            FROM wallet_histories
            WHERE wallet_id = $1
            ORDER BY wallet_version ASC
            "#,
        )
        .bind(&wallet.id)
        .fetch_all(&mut *tx)
        .await?;

        let open_statuses: Vec<String> = PayoutStatus::ALL
            .into_iter()
            .filter(|status| status.is_open())
            .map(|status| status.to_string())
            .collect();
        let held = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM payout_requests
            WHERE user_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(user_id)
        .bind(open_statuses)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let report =
            ReconciliationReport::new(user_id.to_string(), wallet.balances(), replay(&history), held);
        if !report.consistent {
            tracing::warn!(
                user_id = %user_id,
                stored = ?report.stored,
                replayed = ?report.replayed,
                replay_error = ?report.replay_error,
                held = %held,
                "Wallet does not reconcile with its history"
            );
        }
        Ok(report)
    }

    // === Platform wallet ===

    pub async fn platform_wallet(&self) -> LedgerResult<PlatformWallet> {
        let wallet = sqlx::query_as::<_, PlatformWallet>(
            "SELECT id, balance, updated_at FROM platform_wallet WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::InternalError("Platform wallet row is missing".to_string()))?;

        Ok(wallet)
    }

    pub async fn platform_history(&self, limit: i64) -> LedgerResult<Vec<PlatformWalletHistory>> {
        let history = sqlx::query_as::<_, PlatformWalletHistory>(
            r#"
            SELECT id, amount, transaction_type, balance_after, description,
                   transactionable_type, transactionable_id, created_at
            FROM platform_wallet_histories
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(history)
    }

    /// Platform history rows linked to one record, oldest first.
    pub async fn platform_history_for(
        &self,
        transactionable_type: &str,
        transactionable_id: &str,
    ) -> LedgerResult<Vec<PlatformWalletHistory>> {
        let history = sqlx::query_as::<_, PlatformWalletHistory>(
            r#"
            SELECT id, amount, transaction_type, balance_after, description,
                   transactionable_type, transactionable_id, created_at
            FROM platform_wallet_histories
            WHERE transactionable_type = $1 AND transactionable_id = $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(transactionable_type)
        .bind(transactionable_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(history)
    }

    pub async fn add_platform_funds(
        &self,
        amount: Decimal,
        description: Option<&str>,
    ) -> LedgerResult<(PlatformWallet, PlatformWalletHistory)> {
        validate_amount(amount)?;
        self.with_retry(move |_| {
            self.platform_adjustment_once(HistoryType::Credit, amount, description)
        })
        .await
    }

    /// Fails with `InsufficientPlatformFunds` rather than going negative.
    pub async fn subtract_platform_funds(
        &self,
        amount: Decimal,
        description: Option<&str>,
    ) -> LedgerResult<(PlatformWallet, PlatformWalletHistory)> {
        validate_amount(amount)?;
        self.with_retry(move |_| {
            self.platform_adjustment_once(HistoryType::Debit, amount, description)
        })
        .await
    }

    async fn platform_adjustment_once(
        &self,
        kind: HistoryType,
        amount: Decimal,
        description: Option<&str>,
    ) -> LedgerResult<(PlatformWallet, PlatformWalletHistory)> {
        let mut tx = self.pool.begin().await?;
        let result = self
            .platform_entry_in_tx(&mut tx, kind, amount, description, None)
            .await?;
        tx.commit().await?;

        tracing::info!(
            kind = %kind,
            amount = %amount,
            balance = %result.0.balance,
            "Platform wallet adjusted"
        );
        Ok(result)
    }

    // === Tiers ===

    pub async fn create_tier(&self, req: &CreateTierRequest) -> LedgerResult<Tier> {
        validate_tier(req)?;

        let tier = sqlx::query_as::<_, Tier>(
            r#"
            INSERT INTO tiers (id, creator_id, title, monthly_price,
                               three_month_discount, six_month_discount, twelve_month_discount,
                               created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, creator_id, title, monthly_price,
                      three_month_discount, six_month_discount, twelve_month_discount, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&req.creator_id)
        .bind(req.title.trim())
        .bind(req.monthly_price)
        .bind(req.three_month_discount)
        .bind(req.six_month_discount)
        .bind(req.twelve_month_discount)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(tier)
    }

    pub async fn find_tier(&self, tier_id: &str) -> LedgerResult<Tier> {
        let tier = sqlx::query_as::<_, Tier>(
            r#"
            SELECT id, creator_id, title, monthly_price,
                   three_month_discount, six_month_discount, twelve_month_discount, created_at
            FROM tiers
            WHERE id = $1
            "#,
        )
        .bind(tier_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::TierNotFound(tier_id.to_string()))?;

        Ok(tier)
    }

    // === Transactions ===

    /// Record a payment intent. It stays pending until the gateway answers.
    pub async fn create_transaction(&self, new: NewTransaction) -> LedgerResult<Transaction> {
        validate_amount(new.amount)?;
        if new.sender_id == new.receiver_id {
            return Err(LedgerError::Validation(
                "Sender and receiver must differ".to_string(),
            ));
        }

        let now = Utc::now();
        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            INSERT INTO transactions (id, sender_id, receiver_id, tier_id, amount,
                                      transaction_type, status, purchasable_type, purchasable_id,
                                      created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING id, sender_id, receiver_id, tier_id, amount, platform_fee, net_amount,
                      transaction_type, status, purchasable_type, purchasable_id,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&new.sender_id)
        .bind(&new.receiver_id)
        .bind(new.tier_id.as_deref())
        .bind(new.amount)
        .bind(new.transaction_type.to_string())
        .bind(TransactionStatus::Pending.to_string())
        .bind(new.purchasable_type.as_deref())
        .bind(new.purchasable_id.as_deref())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            transaction_id = %transaction.id,
            transaction_type = %transaction.transaction_type,
            amount = %transaction.amount,
            "Transaction created"
        );
        Ok(transaction)
    }

    /// Pending subscription payment priced from the creator's tier.
    pub async fn create_subscription_transaction(
        &self,
        subscriber_id: &str,
        tier_id: &str,
        duration: SubscriptionDuration,
    ) -> LedgerResult<Transaction> {
        let tier = self.find_tier(tier_id).await?;
        self.create_transaction(NewTransaction {
            sender_id: subscriber_id.to_string(),
            receiver_id: tier.creator_id.clone(),
            tier_id: Some(tier.id.clone()),
            amount: tier.price_for(duration),
            transaction_type: duration.transaction_type(),
            purchasable_type: Some("tier".to_string()),
            purchasable_id: Some(tier.id),
        })
        .await
    }

    pub async fn find_transaction(&self, transaction_id: &str) -> LedgerResult<Transaction> {
        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, sender_id, receiver_id, tier_id, amount, platform_fee, net_amount,
                   transaction_type, status, purchasable_type, purchasable_id,
                   created_at, updated_at
            FROM transactions
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::TransactionNotFound(transaction_id.to_string()))?;

        Ok(transaction)
    }

    /// Transactions the user sent or received, newest first.
    pub async fn transactions_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> LedgerResult<Vec<Transaction>> {
        let transactions = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, sender_id, receiver_id, tier_id, amount, platform_fee, net_amount,
                   transaction_type, status, purchasable_type, purchasable_id,
                   created_at, updated_at
            FROM transactions
            WHERE sender_id = $1 OR receiver_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(transactions)
    }

    /// Gateway approval: split the payment, credit the creator's pending
    /// balance with the net and the platform wallet with the fee.
    pub async fn approve_transaction(
        &self,
        transaction_id: &str,
        fees: FeeSchedule,
    ) -> LedgerResult<Transaction> {
        self.with_retry(move |_| self.approve_transaction_once(transaction_id, fees))
            .await
    }

    async fn approve_transaction_once(
        &self,
        transaction_id: &str,
        fees: FeeSchedule,
    ) -> LedgerResult<Transaction> {
        let mut tx = self.pool.begin().await?;
        let current = self.lock_transaction_in_tx(&mut tx, transaction_id).await?;
        ensure_transition(
            "transaction",
            current.status,
            TransactionStatus::Approved,
            current.status.can_transition_to(TransactionStatus::Approved),
        )?;

        let split = fees.split(current.amount);
        let source = Source {
            kind: TRANSACTION_REF,
            id: transaction_id,
        };

        if split.net > Decimal::ZERO {
            let wallet = self.ensure_wallet_in_tx(&mut tx, &current.receiver_id).await?;
            let description = format!("Earnings from {}", current.transaction_type);
            self.apply_op_in_tx(
                &mut tx,
                &wallet,
                LedgerOp::Earn(split.net),
                Some(source),
                Some(&description),
            )
            .await?;
        }

        if split.platform_fee > Decimal::ZERO {
            let description = format!("Platform fee on {}", current.transaction_type);
            self.platform_entry_in_tx(
                &mut tx,
                HistoryType::Credit,
                split.platform_fee,
                Some(&description),
                Some(source),
            )
            .await?;
        }

        let approved = self
            .set_transaction_status_in_tx(
                &mut tx,
                transaction_id,
                TransactionStatus::Approved,
                Some((split.platform_fee, split.net)),
            )
            .await?;
        tx.commit().await?;

        tracing::info!(
            transaction_id = %transaction_id,
            receiver_id = %approved.receiver_id,
            gross = %split.gross,
            platform_fee = %split.platform_fee,
            net = %split.net,
            "Transaction approved"
        );
        Ok(approved)
    }

    /// Gateway decline. No money has moved, so only the status changes.
    pub async fn decline_transaction(&self, transaction_id: &str) -> LedgerResult<Transaction> {
        self.with_retry(move |_| self.decline_transaction_once(transaction_id))
            .await
    }

    async fn decline_transaction_once(&self, transaction_id: &str) -> LedgerResult<Transaction> {
        let mut tx = self.pool.begin().await?;
        let current = self.lock_transaction_in_tx(&mut tx, transaction_id).await?;
        ensure_transition(
            "transaction",
            current.status,
            TransactionStatus::Declined,
            current.status.can_transition_to(TransactionStatus::Declined),
        )?;

        let declined = self
            .set_transaction_status_in_tx(&mut tx, transaction_id, TransactionStatus::Declined, None)
            .await?;
        tx.commit().await?;

        tracing::info!(transaction_id = %transaction_id, "Transaction declined");
        Ok(declined)
    }

    /// Undo an approval: take the net back out of pending earnings and the
    /// fee back out of the platform wallet.
    pub async fn refund_transaction(&self, transaction_id: &str) -> LedgerResult<Transaction> {
        self.with_retry(move |_| self.refund_transaction_once(transaction_id))
            .await
    }

    async fn refund_transaction_once(&self, transaction_id: &str) -> LedgerResult<Transaction> {
        let mut tx = self.pool.begin().await?;
        let current = self.lock_transaction_in_tx(&mut tx, transaction_id).await?;
        ensure_transition(
            "transaction",
            current.status,
            TransactionStatus::Refunded,
            current.status.can_transition_to(TransactionStatus::Refunded),
        )?;

        let net = current.net_amount.unwrap_or(Decimal::ZERO);
        let fee = current.platform_fee.unwrap_or(Decimal::ZERO);
        let source = Source {
            kind: TRANSACTION_REF,
            id: transaction_id,
        };

        if net > Decimal::ZERO {
            let wallet = self.lock_wallet_in_tx(&mut tx, &current.receiver_id).await?;
            self.apply_op_in_tx(
                &mut tx,
                &wallet,
                LedgerOp::Reverse(net),
                Some(source),
                Some("Refund"),
            )
            .await?;
        }

        if fee > Decimal::ZERO {
            self.platform_entry_in_tx(
                &mut tx,
                HistoryType::Debit,
                fee,
                Some("Platform fee refunded"),
                Some(source),
            )
            .await?;
        }

        let refunded = self
            .set_transaction_status_in_tx(&mut tx, transaction_id, TransactionStatus::Refunded, None)
            .await?;
        tx.commit().await?;

        tracing::info!(
            transaction_id = %transaction_id,
            net = %net,
            platform_fee = %fee,
            "Transaction refunded"
        );
        Ok(refunded)
    }

    // === Payout methods ===

    /// The user's first method becomes the default.
    pub async fn create_payout_method(
        &self,
        user_id: &str,
        req: &CreatePayoutMethodRequest,
    ) -> LedgerResult<PayoutMethod> {
        if req.provider.trim().is_empty() || req.account_number.trim().is_empty() {
            return Err(LedgerError::Validation(
                "Provider and account number are required".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        self.lock_payout_methods_in_tx(&mut tx, user_id).await?;

        let method = sqlx::query_as::<_, PayoutMethod>(
            r#"
            INSERT INTO payout_methods (id, user_id, method_type, provider, account_number,
                                        is_default, created_at)
            VALUES ($1, $2, $3, $4, $5,
                    NOT EXISTS (SELECT 1 FROM payout_methods WHERE user_id = $2 AND is_default),
                    $6)
            RETURNING id, user_id, method_type, provider, account_number, is_default, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(req.method_type.to_string())
        .bind(req.provider.trim())
        .bind(req.account_number.trim())
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(user_id = %user_id, method_id = %method.id, "Payout method added");
        Ok(method)
    }

    pub async fn payout_methods_for_user(&self, user_id: &str) -> LedgerResult<Vec<PayoutMethod>> {
        let methods = sqlx::query_as::<_, PayoutMethod>(
            r#"
            SELECT id, user_id, method_type, provider, account_number, is_default, created_at
            FROM payout_methods
            WHERE user_id = $1
            ORDER BY is_default DESC, created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(methods)
    }

    pub async fn set_default_payout_method(
        &self,
        user_id: &str,
        method_id: &str,
    ) -> LedgerResult<PayoutMethod> {
        self.with_retry(move |_| self.set_default_payout_method_once(user_id, method_id))
            .await
    }

    async fn set_default_payout_method_once(
        &self,
        user_id: &str,
        method_id: &str,
    ) -> LedgerResult<PayoutMethod> {
        let mut tx = self.pool.begin().await?;
        self.lock_payout_methods_in_tx(&mut tx, user_id).await?;
        let method = self.find_payout_method_in_tx(&mut tx, method_id).await?;
        if method.user_id != user_id {
            return Err(LedgerError::Forbidden(
                "Payout method belongs to another user".to_string(),
            ));
        }

        sqlx::query("UPDATE payout_methods SET is_default = FALSE WHERE user_id = $1 AND is_default")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let method = sqlx::query_as::<_, PayoutMethod>(
            r#"
            UPDATE payout_methods SET is_default = TRUE
            WHERE id = $1
            RETURNING id, user_id, method_type, provider, account_number, is_default, created_at
            "#,
        )
        .bind(method_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(method)
    }

    // === Payout requests ===

    /// Reserve `amount` of the user's withdrawable balance for a payout.
    ///
    /// The wallet row is locked for the whole check-and-hold, so concurrent
    /// requests against the same wallet are admitted one at a time.
    pub async fn create_payout_request(
        &self,
        user_id: &str,
        payout_method_id: &str,
        amount: Decimal,
        minimum: Decimal,
    ) -> LedgerResult<PayoutRequest> {
        validate_amount(amount)?;
        if amount < minimum {
            return Err(LedgerError::Validation(format!(
                "Minimum payout amount is {}",
                minimum
            )));
        }

        self.with_retry(move |_| self.create_payout_request_once(user_id, payout_method_id, amount))
            .await
    }

    async fn create_payout_request_once(
        &self,
        user_id: &str,
        payout_method_id: &str,
        amount: Decimal,
    ) -> LedgerResult<PayoutRequest> {
        let mut tx = self.pool.begin().await?;

        let method = self.find_payout_method_in_tx(&mut tx, payout_method_id).await?;
        if method.user_id != user_id {
            return Err(LedgerError::Forbidden(
                "Payout method belongs to another user".to_string(),
            ));
        }

        let wallet = self.lock_wallet_in_tx(&mut tx, user_id).await?;
        let payout_id = Uuid::new_v4().to_string();
        self.apply_op_in_tx(
            &mut tx,
            &wallet,
            LedgerOp::Hold(amount),
            Some(Source {
                kind: PAYOUT_REQUEST_REF,
                id: &payout_id,
            }),
            Some("Payout requested"),
        )
        .await?;

        let now = Utc::now();
        let mut inserted = None;
        for attempt in 1..=MAX_REFERENCE_ATTEMPTS {
            let reference_id = (self.reference_ids)();
            inserted = sqlx::query_as::<_, PayoutRequest>(
                r#"
                INSERT INTO payout_requests (id, user_id, payout_method_id, amount, status,
                                             reference_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                ON CONFLICT (reference_id) DO NOTHING
                RETURNING id, user_id, payout_method_id, amount, status, reference_id,
                          failure_reason, created_at, updated_at
                "#,
            )
            .bind(&payout_id)
            .bind(user_id)
            .bind(payout_method_id)
            .bind(amount)
            .bind(PayoutStatus::Pending.to_string())
            .bind(&reference_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_some() {
                break;
            }
            tracing::warn!(attempt, reference_id = %reference_id, "Payout reference collision");
        }

        let payout = inserted.ok_or_else(|| LedgerError::UniqueViolation {
            constraint: Some(PAYOUT_REFERENCE_CONSTRAINT.to_string()),
        })?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            payout_id = %payout.id,
            reference_id = %payout.reference_id,
            amount = %amount,
            "Payout requested"
        );
        Ok(payout)
    }

    pub async fn find_payout_request(&self, payout_id: &str) -> LedgerResult<PayoutRequest> {
        let payout = sqlx::query_as::<_, PayoutRequest>(
            r#"
            SELECT id, user_id, payout_method_id, amount, status, reference_id,
                   failure_reason, created_at, updated_at
            FROM payout_requests
            WHERE id = $1
            "#,
        )
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::PayoutRequestNotFound(payout_id.to_string()))?;

        Ok(payout)
    }

    pub async fn payout_requests_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> LedgerResult<Vec<PayoutRequest>> {
        let payouts = sqlx::query_as::<_, PayoutRequest>(
            r#"
            SELECT id, user_id, payout_method_id, amount, status, reference_id,
                   failure_reason, created_at, updated_at
            FROM payout_requests
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    pub async fn mark_payout_processing(&self, payout_id: &str) -> LedgerResult<PayoutRequest> {
        self.transition_payout(payout_id, PayoutStatus::Processing, None)
            .await
    }

    /// Funds leave the platform; the held amount comes off the total.
    pub async fn mark_payout_processed(&self, payout_id: &str) -> LedgerResult<PayoutRequest> {
        self.transition_payout(payout_id, PayoutStatus::Processed, None)
            .await
    }

    /// The held amount goes back to `available_for_payout`.
    pub async fn mark_payout_failed(
        &self,
        payout_id: &str,
        reason: &str,
    ) -> LedgerResult<PayoutRequest> {
        self.transition_payout(payout_id, PayoutStatus::Failed, Some(reason))
            .await
    }

    pub async fn cancel_payout_request(&self, payout_id: &str) -> LedgerResult<PayoutRequest> {
        self.transition_payout(payout_id, PayoutStatus::Cancelled, None)
            .await
    }

    async fn transition_payout(
        &self,
        payout_id: &str,
        next: PayoutStatus,
        reason: Option<&str>,
    ) -> LedgerResult<PayoutRequest> {
        self.with_retry(move |_| self.transition_payout_once(payout_id, next, reason))
            .await
    }

    async fn transition_payout_once(
        &self,
        payout_id: &str,
        next: PayoutStatus,
        reason: Option<&str>,
    ) -> LedgerResult<PayoutRequest> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, PayoutRequest>(
            r#"
            SELECT id, user_id, payout_method_id, amount, status, reference_id,
                   failure_reason, created_at, updated_at
            FROM payout_requests
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(payout_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LedgerError::PayoutRequestNotFound(payout_id.to_string()))?;

        ensure_transition(
            "payout request",
            current.status,
            next,
            current.status.can_transition_to(next),
        )?;

        let op = match next {
            PayoutStatus::Processed => Some(LedgerOp::Settle(current.amount)),
            PayoutStatus::Failed | PayoutStatus::Cancelled => Some(LedgerOp::Return(current.amount)),
            PayoutStatus::Pending | PayoutStatus::Processing => None,
        };

        if let Some(op) = op {
            let wallet = self.lock_wallet_in_tx(&mut tx, &current.user_id).await?;
            let description = format!("Payout {}", next);
            self.apply_op_in_tx(
                &mut tx,
                &wallet,
                op,
                Some(Source {
                    kind: PAYOUT_REQUEST_REF,
                    id: payout_id,
                }),
                Some(&description),
            )
            .await?;
        }

        let updated = sqlx::query_as::<_, PayoutRequest>(
            r#"
            UPDATE payout_requests
            SET status = $1, failure_reason = COALESCE($2, failure_reason), updated_at = $3
            WHERE id = $4
            RETURNING id, user_id, payout_method_id, amount, status, reference_id,
                      failure_reason, created_at, updated_at
            "#,
        )
        .bind(next.to_string())
        .bind(reason)
        .bind(Utc::now())
        .bind(payout_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            payout_id = %payout_id,
            from = %current.status,
            to = %next,
            "Payout request updated"
        );
        Ok(updated)
    }

    // === Helpers for working within transactions ===

    /// Create the wallet if needed, then lock it.
    async fn ensure_wallet_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        user_id: &str,
    ) -> LedgerResult<Wallet> {
        sqlx::query(
            r#"
            INSERT INTO wallets (id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        self.lock_wallet_in_tx(tx, user_id).await
    }

    async fn lock_wallet_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        user_id: &str,
    ) -> LedgerResult<Wallet> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, total_balance, pending_balance, available_for_payout,
                   version, created_at, updated_at
            FROM wallets
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::WalletNotFound(user_id.to_string()))?;

        Ok(wallet)
    }

    /// Apply `op` to a locked wallet and append its history row.
    async fn apply_op_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        wallet: &Wallet,
        op: LedgerOp,
        source: Option<Source<'_>>,
        description: Option<&str>,
    ) -> LedgerResult<(Wallet, WalletHistory)> {
        let mut balances = wallet.balances();
        op.apply(&mut balances)?;
        let now = Utc::now();

        // The row is locked, so a version mismatch means someone bypassed the lock.
        let updated = sqlx::query_as::<_, Wallet>(
            r#"
            UPDATE wallets
            SET total_balance = $1, pending_balance = $2, available_for_payout = $3,
                version = version + 1, updated_at = $4
            WHERE id = $5 AND version = $6
            RETURNING id, user_id, total_balance, pending_balance, available_for_payout,
                      version, created_at, updated_at
            "#,
        )
        .bind(balances.total)
        .bind(balances.pending)
        .bind(balances.available)
        .bind(now)
        .bind(&wallet.id)
        .bind(wallet.version)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(LedgerError::Contention(DbErrorKind::SerializationFailure))?;

        let (balance_type, transaction_type) = op.booking();
        let history = sqlx::query_as::<_, WalletHistory>(
            r#"
            INSERT INTO wallet_histories (id, user_id, wallet_id, wallet_version, amount,
                                          balance_type, transaction_type, status,
                                          transactionable_type, transactionable_id,
                                          description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id, user_id, wallet_id, wallet_version, amount, balance_type, transaction_type, status,
                      transactionable_type, transactionable_id, description, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&wallet.user_id)
        .bind(&wallet.id)
        .bind(updated.version)
        .bind(op.amount())
        .bind(balance_type.to_string())
        .bind(transaction_type.to_string())
        .bind(HistoryStatus::Completed.to_string())
        .bind(source.map(|s| s.kind))
        .bind(source.map(|s| s.id))
        .bind(description)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        tracing::debug!(
            user_id = %wallet.user_id,
            op = ?op,
            version = updated.version,
            "Wallet mutated"
        );
        Ok((updated, history))
    }

    /// Lock the platform wallet, credit or debit it and append history.
    async fn platform_entry_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        kind: HistoryType,
        amount: Decimal,
        description: Option<&str>,
        source: Option<Source<'_>>,
    ) -> LedgerResult<(PlatformWallet, PlatformWalletHistory)> {
        let current = sqlx::query_as::<_, PlatformWallet>(
            "SELECT id, balance, updated_at FROM platform_wallet WHERE id = 1 FOR UPDATE",
        )
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::InternalError("Platform wallet row is missing".to_string()))?;

        let balance = match kind {
            HistoryType::Credit => current.balance + amount,
            HistoryType::Debit => {
                if current.balance < amount {
                    return Err(LedgerError::InsufficientPlatformFunds {
                        required: amount,
                        available: current.balance,
                    });
                }
                current.balance - amount
            }
            HistoryType::Transfer => {
                return Err(LedgerError::InternalError(
                    "Platform wallet only takes credits and debits".to_string(),
                ))
            }
        };
        let now = Utc::now();

        let updated = sqlx::query_as::<_, PlatformWallet>(
            r#"
            UPDATE platform_wallet SET balance = $1, updated_at = $2
            WHERE id = 1
            RETURNING id, balance, updated_at
            "#,
        )
        .bind(balance)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        let history = sqlx::query_as::<_, PlatformWalletHistory>(
            r#"
            INSERT INTO platform_wallet_histories (id, amount, transaction_type, balance_after,
                                                   description, transactionable_type,
                                                   transactionable_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, amount, transaction_type, balance_after, description,
                      transactionable_type, transactionable_id, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(amount)
        .bind(kind.to_string())
        .bind(balance)
        .bind(description)
        .bind(source.map(|s| s.kind))
        .bind(source.map(|s| s.id))
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        Ok((updated, history))
    }

    async fn lock_transaction_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        transaction_id: &str,
    ) -> LedgerResult<Transaction> {
        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, sender_id, receiver_id, tier_id, amount, platform_fee, net_amount,
                   transaction_type, status, purchasable_type, purchasable_id,
                   created_at, updated_at
            FROM transactions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::TransactionNotFound(transaction_id.to_string()))?;

        Ok(transaction)
    }

    async fn set_transaction_status_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        transaction_id: &str,
        status: TransactionStatus,
        split: Option<(Decimal, Decimal)>,
    ) -> LedgerResult<Transaction> {
        let (platform_fee, net_amount) = match split {
            Some((fee, net)) => (Some(fee), Some(net)),
            None => (None, None),
        };

        let transaction = sqlx::query_as::<_, Transaction>(
            r#"
            UPDATE transactions
            SET status = $1,
                platform_fee = COALESCE($2, platform_fee),
                net_amount = COALESCE($3, net_amount),
                updated_at = $4
            WHERE id = $5
            RETURNING id, sender_id, receiver_id, tier_id, amount, platform_fee, net_amount,
                      transaction_type, status, purchasable_type, purchasable_id,
                      created_at, updated_at
            "#,
        )
        .bind(status.to_string())
        .bind(platform_fee)
        .bind(net_amount)
        .bind(Utc::now())
        .bind(transaction_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(transaction)
    }

    /// Serializes changes to one user's payout methods, including the
    /// first insert when there is no row to lock yet.
    async fn lock_payout_methods_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        user_id: &str,
    ) -> LedgerResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('payout_methods:' || $1))")
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn find_payout_method_in_tx(
        &self,
        tx: &mut DbTransaction<'_, Postgres>,
        method_id: &str,
    ) -> LedgerResult<PayoutMethod> {
        let method = sqlx::query_as::<_, PayoutMethod>(
            r#"
            SELECT id, user_id, method_type, provider, account_number, is_default, created_at
            FROM payout_methods
            WHERE id = $1
            "#,
        )
        .bind(method_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| LedgerError::PayoutMethodNotFound(method_id.to_string()))?;

        Ok(method)
    }
}
