//! Test doubles for the processor and notifier seams

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use medibook_shared::AppointmentContact;

use crate::client::{PaymentProcessor, Preapproval, ProcessorPayment};
use crate::error::{BillingError, BillingResult};
use crate::notifications::AppointmentNotifier;

#[derive(Default)]
pub struct FakeProcessor {
    preapprovals: Mutex<HashMap<String, Preapproval>>,
    payments: Mutex<HashMap<String, ProcessorPayment>>,
    fail_with: Mutex<Option<u16>>,
    cancel_calls: Mutex<Vec<String>>,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_preapproval(&self, id: &str, status: &str) {
        self.preapprovals.lock().unwrap().insert(
            id.to_string(),
            Preapproval {
                id: id.to_string(),
                status: status.to_string(),
                payer_email: None,
                external_reference: None,
            },
        );
    }

    pub fn put_payment(&self, id: &str, status: &str, appointment_ref: Option<&str>, amount: f64) {
        self.payments.lock().unwrap().insert(
            id.to_string(),
            ProcessorPayment {
                id: id.to_string(),
                status: status.to_string(),
                status_detail: None,
                external_reference: appointment_ref.map(String::from),
                transaction_amount: amount,
                currency_id: Some("ARS".to_string()),
                description: Some("Consulta".to_string()),
                payer: None,
            },
        );
    }

    /// Every subsequent call answers with this HTTP status
    pub fn fail_with(&self, status: u16) {
        *self.fail_with.lock().unwrap() = Some(status);
    }

    pub fn cancel_calls(&self) -> Vec<String> {
        self.cancel_calls.lock().unwrap().clone()
    }

    fn check_failure(&self) -> BillingResult<()> {
        match *self.fail_with.lock().unwrap() {
            Some(status) => Err(BillingError::Processor {
                status,
                message: "injected".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn get_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval> {
        self.check_failure()?;
        self.preapprovals
            .lock()
            .unwrap()
            .get(preapproval_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("preapproval {}", preapproval_id)))
    }

    async fn cancel_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval> {
        self.cancel_calls
            .lock()
            .unwrap()
            .push(preapproval_id.to_string());
        self.check_failure()?;
        let mut preapprovals = self.preapprovals.lock().unwrap();
        let preapproval = preapprovals
            .get_mut(preapproval_id)
            .ok_or_else(|| BillingError::NotFound(format!("preapproval {}", preapproval_id)))?;
        preapproval.status = "cancelled".to_string();
        Ok(preapproval.clone())
    }

    async fn get_payment(&self, payment_id: &str) -> BillingResult<ProcessorPayment> {
        self.check_failure()?;
        self.payments
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))
    }
}

/// Records every confirmation instead of sending it
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<AppointmentContact>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<AppointmentContact> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl AppointmentNotifier for RecordingNotifier {
    async fn payment_confirmed(&self, contact: &AppointmentContact) -> BillingResult<()> {
        self.sent.lock().unwrap().push(contact.clone());
        Ok(())
    }
}
