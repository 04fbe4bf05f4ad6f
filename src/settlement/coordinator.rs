use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::{info, warn};

use super::models::*;
use super::receipts::ReceiptRepository;
use crate::catalog::ProductCatalog;
use crate::error::{AppError, AppResult, InvalidReason, ProductUnavailableReason};
use crate::ledger::repository::advisory_xact_lock;
use crate::ledger::{EntryContext, EntryReason, LotConsumptionEngine, PartitionMonth};

/// Turns a paid order into exactly one lot and one receipt
#[derive(Clone)]
pub struct SettlementCoordinator {
    catalog: Arc<dyn ProductCatalog>,
    lots: LotConsumptionEngine,
    receipts: ReceiptRepository,
}

impl SettlementCoordinator {
    pub fn new(
        catalog: Arc<dyn ProductCatalog>,
        lots: LotConsumptionEngine,
        receipts: ReceiptRepository,
    ) -> Self {
        Self {
            catalog,
            lots,
            receipts,
        }
    }

    pub fn receipts(&self) -> &ReceiptRepository {
        &self.receipts
    }

    /// Settle a purchase, or return the earlier settlement for the same `external_ref`
    pub async fn settle(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &SettlementRequest,
        at: DateTime<Utc>,
    ) -> AppResult<SettlementOutcome> {
        let request = request.normalized()?;

        advisory_xact_lock(tx, &format!("settle:{}", request.external_ref)).await?;

        if let Some(outcome) = self.replay(tx, &request, at).await? {
            return Ok(outcome);
        }

        let product = self
            .catalog
            .get_product_by_code(&mut **tx, &request.product_code)
            .await?
            .ok_or_else(|| product_unavailable(&request, ProductUnavailableReason::NotFound))?;

        if !self
            .catalog
            .is_active(&mut **tx, &request.product_code, request.order_placed_at)
            .await?
        {
            return Err(product_unavailable(&request, ProductUnavailableReason::Archived));
        }

        let price = self
            .catalog
            .resolved_price(&mut **tx, &request.product_code, &request.country)
            .await?
            .ok_or_else(|| {
                product_unavailable(&request, ProductUnavailableReason::NotAvailableInCountry)
            })?;

        let tax_rate_changed = request
            .tax_breakdown
            .as_ref()
            .map_or(false, |tax| tax.tax_rate != price.tax_rate);
        if price.currency != request.pricing.currency
            || price.amount != request.pricing.amount
            || tax_rate_changed
        {
            warn!(
                "Pricing changed for {} in {}: quoted {} {}, current {} {}",
                request.product_code,
                request.country,
                request.pricing.amount,
                request.pricing.currency,
                price.amount,
                price.currency
            );
            return Err(product_unavailable(&request, ProductUnavailableReason::PricingChanged));
        }

        let merchant = self.receipts.require_merchant_config(tx).await?;

        let lot = self
            .lots
            .create_credit_lot(
                tx,
                &request.user_id,
                &product.grant(),
                EntryReason::Purchase,
                EntryContext {
                    operation_type: "purchase".to_string(),
                    workflow_id: Some(request.external_ref.clone()),
                    ..Default::default()
                },
                at,
            )
            .await?;

        let purchase = PurchaseSnapshot::capture(&request, &product);
        let receipt = self
            .receipts
            .issue(tx, &lot, &request.external_ref, purchase, merchant, at)
            .await?;

        info!(
            "🧾 Settled {} for {}: {} credits, receipt {}",
            request.external_ref, request.user_id, lot.initial_amount, receipt.receipt_number
        );

        Ok(SettlementOutcome {
            lot,
            receipt,
            replayed: false,
        })
    }

    async fn replay(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &SettlementRequest,
        at: DateTime<Utc>,
    ) -> AppResult<Option<SettlementOutcome>> {
        let Some(receipt) = self
            .receipts
            .find_by_external_ref(tx, &request.external_ref)
            .await?
        else {
            return Ok(None);
        };

        let mismatched = receipt.purchase_snapshot.0.mismatches(request);
        if !mismatched.is_empty() {
            warn!(
                "Settlement replay for {} disagrees on {:?}",
                request.external_ref, mismatched
            );
            return Err(AppError::invalid_with(
                "external_ref",
                InvalidReason::WorkflowIdMismatch,
                serde_json::json!({ "mismatched_fields": mismatched }),
            ));
        }

        let target = crate::ledger::LotRef {
            lot_id: receipt.lot_id,
            lot_month: PartitionMonth::from_stored(receipt.lot_created_month)?,
        };
        let lot = self
            .lots
            .store()
            .get_lot(tx, &receipt.user_id, target, at)
            .await?
            .ok_or_else(|| AppError::corruption("settlement"))?;

        info!(
            "↩️ Settlement {} replayed: lot {}, receipt {}",
            request.external_ref, lot.lot_id, receipt.receipt_number
        );

        Ok(Some(SettlementOutcome {
            lot,
            receipt,
            replayed: true,
        }))
    }
}

fn product_unavailable(request: &SettlementRequest, reason: ProductUnavailableReason) -> AppError {
    AppError::ProductUnavailable {
        product_code: request.product_code.clone(),
        country: Some(request.country.clone()),
        reason,
    }
}
