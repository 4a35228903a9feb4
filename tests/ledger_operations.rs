/// Integration tests for ledger operations against PostgreSQL.
///
/// Set TEST_DATABASE_URL to run them; without it every test returns early.
/// Each test works on fresh user ids, so they can share one database.
use creator_ledger::{
    errors::LedgerError,
    ledger::{BalanceBucket, FeeSchedule},
    models::*,
    repository::LedgerRepository,
    retry::RetryPolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use uuid::Uuid;

async fn setup_test_db() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;

    let pool = sqlx::PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Some(pool)
}

fn user(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn fees() -> FeeSchedule {
    FeeSchedule::new(2000)
}

/// Creator with `amount` already released to `available_for_payout`.
///
/// A tier priced at amount / 0.8 nets exactly `amount` after the 20% fee.
async fn funded_creator(repo: &LedgerRepository, amount: Decimal) -> String {
    let creator = user("creator");
    let tier = repo
        .create_tier(&CreateTierRequest {
            creator_id: creator.clone(),
            title: "Gold".to_string(),
            monthly_price: amount * dec!(1.25),
            three_month_discount: 0,
            six_month_discount: 0,
            twelve_month_discount: 0,
        })
        .await
        .expect("create tier");

    let txn = repo
        .create_subscription_transaction(&user("fan"), &tier.id, SubscriptionDuration::OneMonth)
        .await
        .expect("create subscription");
    repo.approve_transaction(&txn.id, fees())
        .await
        .expect("approve");
    repo.release_pending(&creator, amount)
        .await
        .expect("release");

    creator
}

async fn payout_method(repo: &LedgerRepository, user_id: &str) -> PayoutMethod {
    repo.create_payout_method(
        user_id,
        &CreatePayoutMethodRequest {
            method_type: PayoutMethodType::BankTransfer,
            provider: "First Bank".to_string(),
            account_number: "0001112223".to_string(),
        },
    )
    .await
    .expect("create payout method")
}

#[tokio::test]
async fn test_wallet_is_created_lazily_and_empty() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = user("creator");

    let wallet = repo.get_or_create_wallet(&creator).await.unwrap();
    assert_eq!(wallet.total_balance, dec!(0));
    assert_eq!(wallet.pending_balance, dec!(0));
    assert_eq!(wallet.available_for_payout, dec!(0));

    let again = repo.get_or_create_wallet(&creator).await.unwrap();
    assert_eq!(again.id, wallet.id);
}

#[tokio::test]
async fn test_subscription_approval_credits_creator_and_platform() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = user("creator");

    let tier = repo
        .create_tier(&CreateTierRequest {
            creator_id: creator.clone(),
            title: "Supporter".to_string(),
            monthly_price: dec!(10.00),
            three_month_discount: 10,
            six_month_discount: 15,
            twelve_month_discount: 20,
        })
        .await
        .unwrap();

    let txn = repo
        .create_subscription_transaction(&user("fan"), &tier.id, SubscriptionDuration::OneMonth)
        .await
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Pending);
    assert_eq!(txn.transaction_type, TransactionType::OneMonthSubscription);
    assert_eq!(txn.amount, dec!(10.00));
    assert_eq!(txn.receiver_id, creator);

    let approved = repo.approve_transaction(&txn.id, fees()).await.unwrap();
    assert_eq!(approved.status, TransactionStatus::Approved);
    assert_eq!(approved.platform_fee, Some(dec!(2.00)));
    assert_eq!(approved.net_amount, Some(dec!(8.00)));

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.pending_balance, dec!(8.00));
    assert_eq!(wallet.total_balance, dec!(8.00));
    assert_eq!(wallet.available_for_payout, dec!(0));

    let history = repo.wallet_history(&creator, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].balance_type, BalanceBucket::Pending);
    assert_eq!(history[0].transaction_type, HistoryType::Credit);
    assert_eq!(history[0].transactionable_id.as_deref(), Some(txn.id.as_str()));

    let platform = repo
        .platform_history_for(TRANSACTION_REF, &txn.id)
        .await
        .unwrap();
    assert_eq!(platform.len(), 1);
    assert_eq!(platform[0].transaction_type, HistoryType::Credit);
    assert_eq!(platform[0].amount, dec!(2.00));
}

#[tokio::test]
async fn test_discounted_durations_are_priced_from_the_tier() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());

    let tier = repo
        .create_tier(&CreateTierRequest {
            creator_id: user("creator"),
            title: "Annual".to_string(),
            monthly_price: dec!(10.00),
            three_month_discount: 0,
            six_month_discount: 0,
            twelve_month_discount: 25,
        })
        .await
        .unwrap();

    let txn = repo
        .create_subscription_transaction(&user("fan"), &tier.id, SubscriptionDuration::TwelveMonths)
        .await
        .unwrap();
    assert_eq!(txn.amount, dec!(90.00));
    assert_eq!(txn.transaction_type, TransactionType::YearlySubscription);
}

#[tokio::test]
async fn test_approval_is_not_repeatable() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = user("creator");

    let txn = repo
        .create_transaction(NewTransaction {
            sender_id: user("fan"),
            receiver_id: creator.clone(),
            tier_id: None,
            amount: dec!(5.00),
            transaction_type: TransactionType::Tip,
            purchasable_type: None,
            purchasable_id: None,
        })
        .await
        .unwrap();

    repo.approve_transaction(&txn.id, fees()).await.unwrap();
    let result = repo.approve_transaction(&txn.id, fees()).await;
    assert!(matches!(
        result,
        Err(LedgerError::InvalidStateTransition { .. })
    ));

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.pending_balance, dec!(4.00));
}

#[tokio::test]
async fn test_declined_transaction_moves_no_money() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = user("creator");

    let txn = repo
        .create_transaction(NewTransaction {
            sender_id: user("fan"),
            receiver_id: creator.clone(),
            tier_id: None,
            amount: dec!(15.00),
            transaction_type: TransactionType::MediaPurchase,
            purchasable_type: Some("media".to_string()),
            purchasable_id: Some(Uuid::new_v4().to_string()),
        })
        .await
        .unwrap();

    let declined = repo.decline_transaction(&txn.id).await.unwrap();
    assert_eq!(declined.status, TransactionStatus::Declined);
    assert_eq!(declined.net_amount, None);

    assert!(matches!(
        repo.find_wallet_by_user(&creator).await,
        Err(LedgerError::WalletNotFound(_))
    ));
    assert!(matches!(
        repo.approve_transaction(&txn.id, fees()).await,
        Err(LedgerError::InvalidStateTransition { .. })
    ));
    assert!(repo
        .platform_history_for(TRANSACTION_REF, &txn.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_refund_reverses_creator_and_platform_entries() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = user("creator");

    let txn = repo
        .create_transaction(NewTransaction {
            sender_id: user("fan"),
            receiver_id: creator.clone(),
            tier_id: None,
            amount: dec!(20.00),
            transaction_type: TransactionType::MessagePurchase,
            purchasable_type: None,
            purchasable_id: None,
        })
        .await
        .unwrap();
    repo.approve_transaction(&txn.id, fees()).await.unwrap();

    let refunded = repo.refund_transaction(&txn.id).await.unwrap();
    assert_eq!(refunded.status, TransactionStatus::Refunded);

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.total_balance, dec!(0));
    assert_eq!(wallet.pending_balance, dec!(0));

    let platform = repo
        .platform_history_for(TRANSACTION_REF, &txn.id)
        .await
        .unwrap();
    let kinds: Vec<_> = platform.iter().map(|h| h.transaction_type).collect();
    assert_eq!(kinds, vec![HistoryType::Credit, HistoryType::Debit]);
    assert!(platform.iter().all(|h| h.amount == dec!(4.00)));

    let report = repo.reconcile_wallet(&creator).await.unwrap();
    assert!(report.consistent);
}

#[tokio::test]
async fn test_refund_after_release_is_rejected() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = user("creator");

    let txn = repo
        .create_transaction(NewTransaction {
            sender_id: user("fan"),
            receiver_id: creator.clone(),
            tier_id: None,
            amount: dec!(10.00),
            transaction_type: TransactionType::Tip,
            purchasable_type: None,
            purchasable_id: None,
        })
        .await
        .unwrap();
    repo.approve_transaction(&txn.id, fees()).await.unwrap();
    repo.release_pending(&creator, dec!(8.00)).await.unwrap();

    let result = repo.refund_transaction(&txn.id).await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientBalance {
            bucket: BalanceBucket::Pending,
            ..
        })
    ));

    // Nothing committed: the transaction is still approved.
    let txn = repo.find_transaction(&txn.id).await.unwrap();
    assert_eq!(txn.status, TransactionStatus::Approved);
}

#[tokio::test]
async fn test_platform_wallet_never_goes_negative() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());

    let (after_credit, credit) = repo
        .add_platform_funds(dec!(5.00), Some("Test top-up"))
        .await
        .unwrap();
    assert_eq!(credit.transaction_type, HistoryType::Credit);
    assert_eq!(credit.balance_after, after_credit.balance);

    let (_, debit) = repo
        .subtract_platform_funds(dec!(5.00), Some("Test withdrawal"))
        .await
        .unwrap();
    assert_eq!(debit.transaction_type, HistoryType::Debit);
    assert_eq!(debit.amount, dec!(5.00));

    let result = repo
        .subtract_platform_funds(dec!(9999999999999.00), None)
        .await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientPlatformFunds { .. })
    ));

    let platform = repo.platform_wallet().await.unwrap();
    assert!(platform.balance >= dec!(0));
}

#[tokio::test]
async fn test_release_more_than_pending_fails() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = user("creator");
    repo.get_or_create_wallet(&creator).await.unwrap();

    let result = repo.release_pending(&creator, dec!(1.00)).await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientBalance {
            bucket: BalanceBucket::Pending,
            ..
        })
    ));
    assert!(repo.wallet_history(&creator, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_first_payout_method_is_default() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = user("creator");

    let first = payout_method(&repo, &creator).await;
    let second = payout_method(&repo, &creator).await;
    assert!(first.is_default);
    assert!(!second.is_default);

    let updated = repo
        .set_default_payout_method(&creator, &second.id)
        .await
        .unwrap();
    assert!(updated.is_default);

    let methods = repo.payout_methods_for_user(&creator).await.unwrap();
    assert_eq!(methods.iter().filter(|m| m.is_default).count(), 1);
    assert_eq!(methods[0].id, second.id);

    let result = repo.set_default_payout_method(&user("other"), &first.id).await;
    assert!(matches!(result, Err(LedgerError::Forbidden(_))));
}

#[tokio::test]
async fn test_payout_request_holds_funds() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(100.00)).await;
    let method = payout_method(&repo, &creator).await;

    let payout = repo
        .create_payout_request(&creator, &method.id, dec!(40.00), dec!(20.00))
        .await
        .unwrap();
    assert_eq!(payout.status, PayoutStatus::Pending);
    assert!(!payout.reference_id.is_empty());
    assert!(payout.reference_id.chars().all(|c| c.is_ascii_digit()));

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.available_for_payout, dec!(60.00));
    assert_eq!(wallet.total_balance, dec!(100.00));

    let report = repo.reconcile_wallet(&creator).await.unwrap();
    assert_eq!(report.held_by_open_payouts, dec!(40.00));
    assert!(report.consistent);
}

#[tokio::test]
async fn test_payout_request_validation() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(100.00)).await;
    let method = payout_method(&repo, &creator).await;

    let below_minimum = repo
        .create_payout_request(&creator, &method.id, dec!(10.00), dec!(20.00))
        .await;
    assert!(matches!(below_minimum, Err(LedgerError::Validation(_))));

    let too_much = repo
        .create_payout_request(&creator, &method.id, dec!(150.00), dec!(20.00))
        .await;
    assert!(matches!(
        too_much,
        Err(LedgerError::InsufficientBalance {
            bucket: BalanceBucket::Available,
            ..
        })
    ));

    let other = user("other");
    let foreign = repo
        .create_payout_request(&other, &method.id, dec!(30.00), dec!(20.00))
        .await;
    assert!(matches!(foreign, Err(LedgerError::Forbidden(_))));
}

#[tokio::test]
async fn test_concurrent_payout_requests_admit_exactly_one() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(100.00)).await;
    let method = payout_method(&repo, &creator).await;

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let repo = repo.clone();
            let creator = creator.clone();
            let method_id = method.id.clone();
            tokio::spawn(async move {
                repo.create_payout_request(&creator, &method_id, dec!(60.00), dec!(20.00))
                    .await
            })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task panicked"))
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(LedgerError::InsufficientBalance {
                    bucket: BalanceBucket::Available,
                    ..
                })
            )
        })
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(rejected, 1);

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.available_for_payout, dec!(40.00));
    assert!(repo.reconcile_wallet(&creator).await.unwrap().consistent);
}

#[tokio::test]
async fn test_processed_payout_leaves_the_wallet() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(100.00)).await;
    let method = payout_method(&repo, &creator).await;

    let payout = repo
        .create_payout_request(&creator, &method.id, dec!(30.00), dec!(20.00))
        .await
        .unwrap();

    // Must be picked up before it can complete.
    assert!(matches!(
        repo.mark_payout_processed(&payout.id).await,
        Err(LedgerError::InvalidStateTransition { .. })
    ));

    repo.mark_payout_processing(&payout.id).await.unwrap();
    let done = repo.mark_payout_processed(&payout.id).await.unwrap();
    assert_eq!(done.status, PayoutStatus::Processed);

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.total_balance, dec!(70.00));
    assert_eq!(wallet.available_for_payout, dec!(70.00));

    let report = repo.reconcile_wallet(&creator).await.unwrap();
    assert_eq!(report.held_by_open_payouts, dec!(0));
    assert!(report.consistent);
}

#[tokio::test]
async fn test_failed_payout_returns_funds() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(100.00)).await;
    let method = payout_method(&repo, &creator).await;

    let payout = repo
        .create_payout_request(&creator, &method.id, dec!(50.00), dec!(20.00))
        .await
        .unwrap();
    repo.mark_payout_processing(&payout.id).await.unwrap();

    let failed = repo
        .mark_payout_failed(&payout.id, "Account closed")
        .await
        .unwrap();
    assert_eq!(failed.status, PayoutStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("Account closed"));

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.available_for_payout, dec!(100.00));
    assert_eq!(wallet.total_balance, dec!(100.00));

    assert!(matches!(
        repo.cancel_payout_request(&payout.id).await,
        Err(LedgerError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn test_cancelled_payout_returns_funds() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(100.00)).await;
    let method = payout_method(&repo, &creator).await;

    let payout = repo
        .create_payout_request(&creator, &method.id, dec!(25.00), dec!(20.00))
        .await
        .unwrap();
    let cancelled = repo.cancel_payout_request(&payout.id).await.unwrap();
    assert_eq!(cancelled.status, PayoutStatus::Cancelled);

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.available_for_payout, dec!(100.00));

    let payouts = repo.payout_requests_for_user(&creator, 10).await.unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].status, PayoutStatus::Cancelled);
    assert!(repo.reconcile_wallet(&creator).await.unwrap().consistent);
}

#[tokio::test]
async fn test_reconcile_ignores_history_timestamps() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool.clone(), RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(8.00)).await;
    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();

    // The release row ends up stamped before the earnings it moved.
    sqlx::query(
        "UPDATE wallet_histories SET created_at = created_at - INTERVAL '1 hour'
         WHERE wallet_id = $1
           AND wallet_version = (SELECT MAX(wallet_version) FROM wallet_histories WHERE wallet_id = $1)",
    )
    .bind(&wallet.id)
    .execute(&pool)
    .await
    .unwrap();

    let report = repo.reconcile_wallet(&creator).await.unwrap();
    assert!(report.consistent);
    assert!(report.replay_error.is_none());
    assert_eq!(report.replayed, Some(wallet.balances()));

    let history = repo.wallet_history(&creator, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].wallet_version > history[1].wallet_version);
}

#[tokio::test]
async fn test_reconcile_reports_unreplayable_history() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool.clone(), RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(8.00)).await;
    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();

    // Drop the earnings row so the release has nothing to move.
    sqlx::query(
        "DELETE FROM wallet_histories
         WHERE wallet_id = $1
           AND wallet_version = (SELECT MIN(wallet_version) FROM wallet_histories WHERE wallet_id = $1)",
    )
    .bind(&wallet.id)
    .execute(&pool)
    .await
    .unwrap();

    let report = repo.reconcile_wallet(&creator).await.unwrap();
    assert!(!report.consistent);
    assert!(report.replayed.is_none());
    assert!(report.replay_error.is_some());
}

#[tokio::test]
async fn test_concurrent_first_payout_methods_keep_one_default() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());

    for _ in 0..10 {
        let creator = user("creator");
        let first_req = CreatePayoutMethodRequest {
            method_type: PayoutMethodType::BankTransfer,
            provider: "First Bank".to_string(),
            account_number: "0001112223".to_string(),
        };
        let second_req = CreatePayoutMethodRequest {
            method_type: PayoutMethodType::BankTransfer,
            provider: "Second Bank".to_string(),
            account_number: "0004445556".to_string(),
        };
        let (a, b) = tokio::join!(
            repo.create_payout_method(&creator, &first_req),
            repo.create_payout_method(&creator, &second_req),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.is_default != b.is_default);

        let methods = repo.payout_methods_for_user(&creator).await.unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods.iter().filter(|m| m.is_default).count(), 1);
    }
}

#[tokio::test]
async fn test_reference_collision_draws_a_fresh_id() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(100.00)).await;
    let method = payout_method(&repo, &creator).await;

    let first = repo
        .create_payout_request(&creator, &method.id, dec!(30.00), dec!(20.00))
        .await
        .unwrap();

    let taken = first.reference_id.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let colliding = repo.clone().with_reference_generator(Arc::new(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            taken.clone()
        } else {
            PayoutRequest::generate_reference_id()
        }
    }));

    let second = colliding
        .create_payout_request(&creator, &method.id, dec!(25.00), dec!(20.00))
        .await
        .unwrap();
    assert_ne!(second.reference_id, first.reference_id);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.available_for_payout, dec!(45.00));

    let holds = repo
        .wallet_history(&creator, 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|h| h.transactionable_id.as_deref() == Some(second.id.as_str()))
        .count();
    assert_eq!(holds, 1);
    assert!(repo.reconcile_wallet(&creator).await.unwrap().consistent);
}

#[tokio::test]
async fn test_reference_collisions_exhaust_into_unique_violation() {
    let Some(pool) = setup_test_db().await else { return };
    let repo = LedgerRepository::new(pool, RetryPolicy::default());
    let creator = funded_creator(&repo, dec!(100.00)).await;
    let method = payout_method(&repo, &creator).await;

    let first = repo
        .create_payout_request(&creator, &method.id, dec!(30.00), dec!(20.00))
        .await
        .unwrap();

    let taken = first.reference_id.clone();
    let stuck = repo
        .clone()
        .with_reference_generator(Arc::new(move || taken.clone()));

    let result = stuck
        .create_payout_request(&creator, &method.id, dec!(25.00), dec!(20.00))
        .await;
    match result {
        Err(LedgerError::UniqueViolation { constraint }) => {
            assert_eq!(constraint.as_deref(), Some("payout_requests_reference_id_key"));
        }
        other => panic!("expected unique violation, got {:?}", other),
    }

    let wallet = repo.find_wallet_by_user(&creator).await.unwrap();
    assert_eq!(wallet.available_for_payout, dec!(70.00));
    assert_eq!(repo.payout_requests_for_user(&creator, 10).await.unwrap().len(), 1);
}
