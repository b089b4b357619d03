//! Payment status lookup and reconciliation against Mercado Pago

use std::sync::Arc;

use medibook_shared::{Payment, PaymentStatus, PaymentStore, PaymentTransition, ProcessorPaymentUpdate};
use serde::Serialize;
use uuid::Uuid;

use crate::client::{PaymentProcessor, ProcessorPayment};
use crate::error::{BillingError, BillingResult};

const DEFAULT_CURRENCY: &str = "ARS";

/// Result of one polling pass over pending payments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct PaymentService {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn PaymentStore>,
}

impl PaymentService {
    pub fn new(processor: Arc<dyn PaymentProcessor>, store: Arc<dyn PaymentStore>) -> Self {
        Self { processor, store }
    }

    pub fn store(&self) -> &Arc<dyn PaymentStore> {
        &self.store
    }

    /// Look a payment up by local id or by processor id
    pub async fn get_status(&self, reference: &str) -> BillingResult<Payment> {
        if let Ok(id) = Uuid::parse_str(reference) {
            if let Some(payment) = self.store.find_payment(id).await? {
                return Ok(payment);
            }
        }

        self.store
            .find_payment_by_external_id(reference)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {} not found", reference)))
    }

    /// Fetch a payment from the processor and apply it to the local row of
    /// the appointment named by its `external_reference`
    pub async fn sync_from_processor(&self, payment_id: &str) -> BillingResult<PaymentTransition> {
        let remote = self.processor.get_payment(payment_id).await?;
        let update = processor_update(&remote)?;

        let transition = self.store.apply_processor_update(&update).await?;

        match &transition {
            PaymentTransition::Applied { payment, previous } => {
                tracing::info!(
                    payment_id = %payment.id,
                    external_id = %payment_id,
                    appointment_id = %payment.appointment_id,
                    from = ?previous,
                    to = %payment.status,
                    "Payment status synced from Mercado Pago"
                );
            }
            PaymentTransition::Unchanged { payment } => {
                tracing::debug!(
                    payment_id = %payment.id,
                    status = %payment.status,
                    "Payment status unchanged"
                );
            }
            PaymentTransition::Blocked { payment, attempted } => {
                tracing::warn!(
                    payment_id = %payment.id,
                    external_id = %payment_id,
                    current = %payment.status,
                    attempted = %attempted,
                    "Ignoring status change on a settled payment"
                );
            }
            PaymentTransition::AppointmentMissing => {
                return Err(BillingError::NotFound(format!(
                    "Appointment {} for payment {} not found",
                    update.appointment_id, payment_id
                )));
            }
        }

        Ok(transition)
    }

    /// Re-check pending payments that already carry a processor id
    pub async fn poll_pending(&self, limit: i64) -> BillingResult<PollSummary> {
        let pending = self.store.list_pending_with_external_id(limit).await?;
        let mut summary = PollSummary::default();

        for payment in pending {
            let Some(external_id) = payment.external_id.as_deref() else {
                continue;
            };
            summary.checked += 1;

            match self.sync_from_processor(external_id).await {
                Ok(PaymentTransition::Applied { .. }) => summary.updated += 1,
                Ok(_) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        payment_id = %payment.id,
                        external_id = %external_id,
                        error = %e,
                        "Failed to poll payment status"
                    );
                }
            }
        }

        Ok(summary)
    }
}

fn processor_update(remote: &ProcessorPayment) -> BillingResult<ProcessorPaymentUpdate> {
    let reference = remote.external_reference.as_deref().ok_or_else(|| {
        BillingError::InvalidPayload(format!("Payment {} has no external_reference", remote.id))
    })?;

    let appointment_id = Uuid::parse_str(reference).map_err(|_| {
        BillingError::InvalidPayload(format!(
            "Payment {} references unknown appointment '{}'",
            remote.id, reference
        ))
    })?;

    Ok(ProcessorPaymentUpdate {
        appointment_id,
        external_id: remote.id.clone(),
        status: PaymentStatus::from_processor(&remote.status),
        payer_email: remote.payer_email().map(String::from),
        amount: remote.transaction_amount,
        currency: remote
            .currency_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        description: remote.description.clone(),
    })
}
