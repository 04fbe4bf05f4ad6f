//! Merchant-scoped entry points: resolve the merchant's pool, run one business action in
//! one transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::admin::{AdminActions, AdminGrant};
use crate::catalog::{PgProductCatalog, Product, ProductCatalog};
use crate::error::AppResult;
use crate::ledger::{
    CreditGrant, DebitRequest, EntryContext, EntryReason, HistoryOptions, HistoryPage,
    LedgerEntry, LedgerRepository, Lot, LotConsumptionEngine, LotRef, PartitionMonth, UserSummary,
};
use crate::operations::{
    ClosedOperation, Operation, OperationLifecycle, OperationRepository, OperationType,
};
use crate::router::MerchantDatabaseRouter;
use crate::settlement::{
    MerchantConfig, Receipt, ReceiptRepository, SettlementCoordinator, SettlementOutcome,
    SettlementRequest,
};

/// Run `f` inside a transaction on `pool`, committing on `Ok` and rolling back on `Err`
pub async fn with_transaction<T, F>(pool: &PgPool, f: F) -> AppResult<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut Transaction<'static, Postgres>) -> BoxFuture<'c, AppResult<T>> + Send,
{
    let mut tx = pool.begin().await?;

    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = tx.rollback().await {
                warn!("Rollback failed after {}: {}", e, rollback_error);
            }
            Err(e)
        }
    }
}

/// The credit ledger for every merchant this process routes to
#[derive(Clone)]
pub struct CreditLedger {
    router: Arc<MerchantDatabaseRouter>,
    lots: LotConsumptionEngine,
    lifecycle: OperationLifecycle,
    settlement: SettlementCoordinator,
    admin: AdminActions,
    catalog: PgProductCatalog,
}

impl CreditLedger {
    pub fn new(router: Arc<MerchantDatabaseRouter>) -> Self {
        let catalog = PgProductCatalog::new();
        let catalog_seam: Arc<dyn ProductCatalog> = Arc::new(catalog);
        Self::with_catalog(router, catalog_seam)
    }

    /// Ledger whose settlements consult a custom catalog
    pub fn with_catalog(router: Arc<MerchantDatabaseRouter>, catalog: Arc<dyn ProductCatalog>) -> Self {
        let lots = LotConsumptionEngine::new(LedgerRepository::new());
        Self {
            router,
            lots,
            lifecycle: OperationLifecycle::new(OperationRepository::new(), lots),
            settlement: SettlementCoordinator::new(catalog, lots, ReceiptRepository::new()),
            admin: AdminActions::new(lots),
            catalog: PgProductCatalog::new(),
        }
    }

    pub fn router(&self) -> &Arc<MerchantDatabaseRouter> {
        &self.router
    }

    pub fn lots(&self) -> &LotConsumptionEngine {
        &self.lots
    }

    pub fn lifecycle(&self) -> &OperationLifecycle {
        &self.lifecycle
    }

    fn pool(&self, merchant_id: &str) -> AppResult<PgPool> {
        self.router.pool_for(merchant_id)
    }

    // ========== LOTS ==========

    pub async fn create_credit_lot(
        &self,
        merchant_id: &str,
        user_id: &str,
        grant: CreditGrant,
        reason: EntryReason,
        context: EntryContext,
    ) -> AppResult<Lot> {
        let lots = self.lots;
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move {
                lots.create_credit_lot(tx, &user_id, &grant, reason, context, Utc::now())
                    .await
            })
        })
        .await
    }

    pub async fn record_debit(
        &self,
        merchant_id: &str,
        user_id: &str,
        debit: DebitRequest,
        target: LotRef,
    ) -> AppResult<LedgerEntry> {
        let lots = self.lots;
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move {
                lots.store().lock_user(tx, &user_id).await?;
                lots.record_debit(tx, &user_id, &debit, target, Utc::now()).await
            })
        })
        .await
    }

    pub async fn select_fifo_lots(
        &self,
        merchant_id: &str,
        user_id: &str,
        required_credits: i64,
    ) -> AppResult<Vec<Lot>> {
        let lots = self.lots;
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move {
                lots.select_fifo_lots(tx, &user_id, required_credits, Utc::now())
                    .await
            })
        })
        .await
    }

    /// Debit credits oldest-lot-first outside any metered operation
    pub async fn debit_credits(
        &self,
        merchant_id: &str,
        user_id: &str,
        debit: DebitRequest,
    ) -> AppResult<Vec<LedgerEntry>> {
        let lots = self.lots;
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { lots.consume_fifo(tx, &user_id, &debit, Utc::now()).await })
        })
        .await
    }

    // ========== READS ==========

    pub async fn balance(&self, merchant_id: &str, user_id: &str) -> AppResult<i64> {
        let store = *self.lots.store();
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { store.balance(tx, &user_id).await })
        })
        .await
    }

    pub async fn lot_balance(&self, merchant_id: &str, target: LotRef) -> AppResult<i64> {
        let store = *self.lots.store();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { store.lot_balance(tx, target).await })
        })
        .await
    }

    pub async fn active_lots(&self, merchant_id: &str, user_id: &str) -> AppResult<Vec<Lot>> {
        let store = *self.lots.store();
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { store.active_lots(tx, &user_id, Utc::now()).await })
        })
        .await
    }

    pub async fn expired_lots(&self, merchant_id: &str, user_id: &str) -> AppResult<Vec<Lot>> {
        let store = *self.lots.store();
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { store.expired_lots(tx, &user_id, Utc::now()).await })
        })
        .await
    }

    pub async fn oldest_active_lot(&self, merchant_id: &str, user_id: &str) -> AppResult<Option<Lot>> {
        let store = *self.lots.store();
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { store.oldest_active_lot(tx, &user_id, Utc::now()).await })
        })
        .await
    }

    pub async fn ledger_history(
        &self,
        merchant_id: &str,
        user_id: &str,
        options: HistoryOptions,
    ) -> AppResult<HistoryPage> {
        let store = *self.lots.store();
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { store.ledger_history(tx, &user_id, &options).await })
        })
        .await
    }

    pub async fn user_summary(
        &self,
        merchant_id: &str,
        user_id: &str,
        month: Option<&str>,
    ) -> AppResult<UserSummary> {
        let month = month.map(PartitionMonth::parse).transpose()?;
        let store = *self.lots.store();
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { store.user_summary(tx, &user_id, month, Utc::now()).await })
        })
        .await
    }

    // ========== OPERATIONS ==========

    pub async fn open_operation(
        &self,
        merchant_id: &str,
        user_id: &str,
        operation_type: &str,
        workflow_id: Option<String>,
    ) -> AppResult<Operation> {
        let lifecycle = self.lifecycle;
        let user_id = user_id.to_string();
        let operation_type = operation_type.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move {
                lifecycle
                    .open(tx, &user_id, &operation_type, workflow_id, Utc::now())
                    .await
            })
        })
        .await
    }

    pub async fn close_operation(
        &self,
        merchant_id: &str,
        operation_id: Uuid,
        resource_amount: Decimal,
    ) -> AppResult<ClosedOperation> {
        let lifecycle = self.lifecycle;
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move {
                lifecycle
                    .close(tx, operation_id, resource_amount, Utc::now())
                    .await
            })
        })
        .await
    }

    pub async fn cancel_operation(&self, merchant_id: &str, operation_id: Uuid) -> AppResult<Operation> {
        let lifecycle = self.lifecycle;
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { lifecycle.cancel(tx, operation_id, Utc::now()).await })
        })
        .await
    }

    pub async fn get_open_operation(
        &self,
        merchant_id: &str,
        user_id: &str,
    ) -> AppResult<Option<Operation>> {
        let lifecycle = self.lifecycle;
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { lifecycle.get_open_operation(tx, &user_id).await })
        })
        .await
    }

    pub async fn has_open_operation(&self, merchant_id: &str, user_id: &str) -> AppResult<bool> {
        let lifecycle = self.lifecycle;
        let user_id = user_id.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { lifecycle.has_open_operation(tx, &user_id).await })
        })
        .await
    }

    pub async fn sweep_expired(&self, merchant_id: &str, before: DateTime<Utc>) -> AppResult<u64> {
        let lifecycle = self.lifecycle;
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { lifecycle.sweep_expired(tx, before).await })
        })
        .await
    }

    // ========== SETTLEMENT & ADMIN ==========

    pub async fn settle(
        &self,
        merchant_id: &str,
        request: SettlementRequest,
    ) -> AppResult<SettlementOutcome> {
        let settlement = self.settlement.clone();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { settlement.settle(tx, &request, Utc::now()).await })
        })
        .await
    }

    /// The receipt written when a purchase lot was settled
    pub async fn receipt_for_lot(&self, merchant_id: &str, target: LotRef) -> AppResult<Option<Receipt>> {
        let receipts = *self.settlement.receipts();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { receipts.find_by_lot(tx, target).await })
        })
        .await
    }

    pub async fn grant_credits(
        &self,
        merchant_id: &str,
        user_id: &str,
        grant: AdminGrant,
        external_ref: &str,
    ) -> AppResult<Lot> {
        let admin = self.admin;
        let user_id = user_id.to_string();
        let external_ref = external_ref.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move {
                admin
                    .grant_credits(tx, &user_id, &grant, &external_ref, Utc::now())
                    .await
            })
        })
        .await
    }

    pub async fn refund_lot(
        &self,
        merchant_id: &str,
        user_id: &str,
        target: LotRef,
        reason: EntryReason,
        external_ref: &str,
    ) -> AppResult<LedgerEntry> {
        let admin = self.admin;
        let user_id = user_id.to_string();
        let external_ref = external_ref.to_string();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move {
                admin
                    .refund_lot(tx, &user_id, target, reason, &external_ref, Utc::now())
                    .await
            })
        })
        .await
    }

    // ========== MERCHANT SETUP ==========

    pub async fn upsert_operation_type(
        &self,
        merchant_id: &str,
        operation_type: OperationType,
    ) -> AppResult<OperationType> {
        let operations = *self.lifecycle.repository();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { operations.upsert_operation_type(tx, &operation_type).await })
        })
        .await
    }

    pub async fn upsert_product(&self, merchant_id: &str, product: Product) -> AppResult<()> {
        let catalog = self.catalog;
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { catalog.upsert_product(&mut **tx, &product).await })
        })
        .await
    }

    pub async fn configure_merchant(&self, merchant_id: &str, config: MerchantConfig) -> AppResult<()> {
        let receipts = *self.settlement.receipts();
        with_transaction(&self.pool(merchant_id)?, move |tx| {
            Box::pin(async move { receipts.upsert_merchant_config(tx, &config).await })
        })
        .await
    }
}
