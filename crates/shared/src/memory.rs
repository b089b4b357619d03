//! In-memory implementation of every store trait
//!
//! Used as the substitutable fake in unit tests and for running the API
//! without a database. A single mutex guards all tables, so each trait method
//! is atomic in the same way a Postgres transaction is.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::events::{
    CreatedEvent, DuplicatePolicy, NewWebhookEvent, WebhookEventRecord, WebhookEventStore,
};
use crate::models::{
    Appointment, AppointmentContact, AppointmentHistory, AppointmentStatus, Payment, PaymentStatus,
    StatusChange, Subscription, SubscriptionStatus,
};
use crate::payments::{
    appointment_status_for, PaymentStore, PaymentTransition, ProcessorPaymentUpdate,
};
use crate::reaper::AppointmentArchive;
use crate::subscriptions::SubscriptionStore;

#[derive(Debug, Clone)]
struct UserEntry {
    name: String,
    phone: Option<String>,
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, UserEntry>,
    doctors: HashMap<Uuid, String>,
    appointments: Vec<Appointment>,
    payments: Vec<Payment>,
    history: Vec<AppointmentHistory>,
    subscriptions: Vec<Subscription>,
    events: Vec<WebhookEventRecord>,
    fail_next_archive: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, name: &str, phone: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        self.tables.lock().await.users.insert(
            id,
            UserEntry {
                name: name.to_string(),
                phone: phone.map(String::from),
            },
        );
        id
    }

    pub async fn add_doctor(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.tables.lock().await.doctors.insert(id, name.to_string());
        id
    }

    pub async fn add_appointment(
        &self,
        user_id: Uuid,
        doctor_id: Uuid,
        status: AppointmentStatus,
        created_at: OffsetDateTime,
    ) -> Appointment {
        let appointment = Appointment {
            id: Uuid::new_v4(),
            user_id,
            doctor_id,
            date: created_at + time::Duration::days(2),
            status,
            created_at,
        };
        self.tables
            .lock()
            .await
            .appointments
            .push(appointment.clone());
        appointment
    }

    pub async fn add_payment(
        &self,
        appointment_id: Uuid,
        status: PaymentStatus,
        amount: f64,
    ) -> Payment {
        let now = OffsetDateTime::now_utc();
        let payment = Payment {
            id: Uuid::new_v4(),
            appointment_id,
            external_id: None,
            status,
            payer_email: None,
            amount,
            currency: "ARS".to_string(),
            description: None,
            created_at: now,
            updated_at: now,
        };
        self.tables.lock().await.payments.push(payment.clone());
        payment
    }

    /// Attach a processor id to an existing payment
    pub async fn set_payment_external_id(&self, payment_id: Uuid, external_id: &str) {
        let mut tables = self.tables.lock().await;
        if let Some(payment) = tables.payments.iter_mut().find(|p| p.id == payment_id) {
            payment.external_id = Some(external_id.to_string());
        }
    }

    pub async fn add_subscription(
        &self,
        user_id: Uuid,
        preapproval_id: Option<&str>,
        status: SubscriptionStatus,
    ) -> Subscription {
        let now = OffsetDateTime::now_utc();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id,
            preapproval_id: preapproval_id.map(String::from),
            status,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .lock()
            .await
            .subscriptions
            .push(subscription.clone());
        subscription
    }

    pub async fn appointment(&self, id: Uuid) -> Option<Appointment> {
        self.tables
            .lock()
            .await
            .appointments
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub async fn appointments(&self) -> Vec<Appointment> {
        self.tables.lock().await.appointments.clone()
    }

    pub async fn payment_for(&self, appointment_id: Uuid) -> Option<Payment> {
        self.tables
            .lock()
            .await
            .payments
            .iter()
            .find(|p| p.appointment_id == appointment_id)
            .cloned()
    }

    pub async fn history(&self) -> Vec<AppointmentHistory> {
        self.tables.lock().await.history.clone()
    }

    pub async fn subscription(&self, id: Uuid) -> Option<Subscription> {
        self.tables
            .lock()
            .await
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn events(&self) -> Vec<WebhookEventRecord> {
        self.tables.lock().await.events.clone()
    }

    /// Make the next archive run fail after its history rows were staged
    pub async fn fail_next_archive(&self) {
        self.tables.lock().await.fail_next_archive = true;
    }
}

fn event_mut(tables: &mut Tables, id: Uuid) -> Option<&mut WebhookEventRecord> {
    tables.events.iter_mut().find(|e| e.id == id)
}

/// The event, if `attempt` still holds a live claim on it
fn held_claim(tables: &mut Tables, id: Uuid, attempt: i32) -> Option<&mut WebhookEventRecord> {
    event_mut(tables, id).filter(|e| {
        e.attempts == attempt && e.claimed_at.is_some() && !e.processed && e.failed_at.is_none()
    })
}

#[async_trait]
impl WebhookEventStore for MemoryStore {
    async fn create_event(
        &self,
        input: NewWebhookEvent,
        policy: DuplicatePolicy,
    ) -> StoreResult<CreatedEvent> {
        let mut tables = self.tables.lock().await;

        if policy == DuplicatePolicy::Dedupe && input.data_id.is_some() {
            let existing = tables
                .events
                .iter()
                .find(|e| e.event_type == input.event_type && e.data_id == input.data_id);
            if let Some(record) = existing {
                return Ok(CreatedEvent::Duplicate(record.clone()));
            }
        }

        let record = WebhookEventRecord {
            id: Uuid::new_v4(),
            action: input.action,
            api_version: input.api_version,
            data_id: input.data_id,
            date_created: input.date_created,
            event_type: input.event_type,
            raw_data: input.raw_data,
            processed: false,
            claimed_at: None,
            attempts: 0,
            last_error: None,
            failed_at: None,
            processed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.events.push(record.clone());
        Ok(CreatedEvent::Stored(record))
    }

    async fn get_unprocessed_events(&self, limit: i64) -> StoreResult<Vec<WebhookEventRecord>> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<WebhookEventRecord> = tables
            .events
            .iter()
            .filter(|e| !e.processed && e.failed_at.is_none())
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<WebhookEventRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.events.iter().find(|e| e.id == id).cloned())
    }

    async fn claim_event(
        &self,
        id: Uuid,
        stale_after: Duration,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();

        let Some(event) = event_mut(&mut tables, id) else {
            return Ok(None);
        };
        if event.processed || event.failed_at.is_some() {
            return Ok(None);
        }
        if let Some(claimed_at) = event.claimed_at {
            if now - claimed_at < stale_after {
                return Ok(None);
            }
        }

        event.claimed_at = Some(now);
        event.attempts += 1;
        Ok(Some(event.clone()))
    }

    async fn mark_processed(&self, id: Uuid, attempt: i32) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let Some(event) = held_claim(&mut tables, id, attempt) else {
            return Ok(false);
        };
        event.processed = true;
        event.processed_at = Some(OffsetDateTime::now_utc());
        event.claimed_at = None;
        event.last_error = None;
        Ok(true)
    }

    async fn release_event(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let Some(event) = held_claim(&mut tables, id, attempt) else {
            return Ok(false);
        };
        event.claimed_at = None;
        event.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn mark_failed(&self, id: Uuid, attempt: i32, error: &str) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let Some(event) = held_claim(&mut tables, id, attempt) else {
            return Ok(false);
        };
        event.claimed_at = None;
        event.failed_at = Some(OffsetDateTime::now_utc());
        event.last_error = Some(error.to_string());
        Ok(true)
    }
}

#[async_trait]
impl AppointmentArchive for MemoryStore {
    async fn archive_stale_pending(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
        status: &str,
        reason: &str,
    ) -> StoreResult<Vec<AppointmentHistory>> {
        let mut tables = self.tables.lock().await;

        let mut stale: Vec<(Appointment, f64)> = tables
            .appointments
            .iter()
            .filter(|a| a.status == AppointmentStatus::Pending && a.created_at < cutoff)
            .filter_map(|a| {
                let payment = tables.payments.iter().find(|p| p.appointment_id == a.id);
                match payment {
                    None => Some((a.clone(), 0.0)),
                    Some(p) if p.status == PaymentStatus::Pending => Some((a.clone(), p.amount)),
                    Some(_) => None,
                }
            })
            .collect();
        stale.sort_by_key(|(a, _)| a.created_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        // Stage everything before touching the tables so a failure leaves no trace
        let archived_at = OffsetDateTime::now_utc();
        let staged: Vec<AppointmentHistory> = stale
            .iter()
            .map(|(a, amount)| AppointmentHistory {
                id: Uuid::new_v4(),
                original_id: a.id,
                user_id: a.user_id,
                doctor_id: a.doctor_id,
                date: a.date,
                status: status.to_string(),
                reason: reason.to_string(),
                amount: *amount,
                archived_at,
            })
            .collect();

        if std::mem::take(&mut tables.fail_next_archive) {
            return Err(StoreError::Conflict(
                "injected archive failure".to_string(),
            ));
        }

        let ids: Vec<Uuid> = staged.iter().map(|h| h.original_id).collect();
        tables.appointments.retain(|a| !ids.contains(&a.id));
        tables.payments.retain(|p| !ids.contains(&p.appointment_id));
        tables.history.extend(staged.iter().cloned());

        Ok(staged)
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        let tables = self.tables.lock().await;
        Ok(tables.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payment_by_external_id(&self, external_id: &str) -> StoreResult<Option<Payment>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payments
            .iter()
            .find(|p| p.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn list_pending_with_external_id(&self, limit: i64) -> StoreResult<Vec<Payment>> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<Payment> = tables
            .payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Pending && p.external_id.is_some())
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn apply_processor_update(
        &self,
        update: &ProcessorPaymentUpdate,
    ) -> StoreResult<PaymentTransition> {
        let mut tables = self.tables.lock().await;
        let now = OffsetDateTime::now_utc();

        if !tables
            .appointments
            .iter()
            .any(|a| a.id == update.appointment_id)
        {
            return Ok(PaymentTransition::AppointmentMissing);
        }

        let position = tables
            .payments
            .iter()
            .position(|p| p.appointment_id == update.appointment_id);

        let transition = match position {
            None => {
                let payment = Payment {
                    id: Uuid::new_v4(),
                    appointment_id: update.appointment_id,
                    external_id: Some(update.external_id.clone()),
                    status: update.status,
                    payer_email: update.payer_email.clone(),
                    amount: update.amount,
                    currency: update.currency.clone(),
                    description: update.description.clone(),
                    created_at: now,
                    updated_at: now,
                };
                tables.payments.push(payment.clone());
                PaymentTransition::Applied {
                    payment,
                    previous: None,
                }
            }
            Some(index) => {
                let payment = &mut tables.payments[index];
                let previous = payment.status;
                let change = previous.change_to(update.status);
                if change == StatusChange::Blocked {
                    return Ok(PaymentTransition::Blocked {
                        payment: payment.clone(),
                        attempted: update.status,
                    });
                }

                payment.status = update.status;
                payment.external_id = Some(update.external_id.clone());
                if update.payer_email.is_some() {
                    payment.payer_email = update.payer_email.clone();
                }
                payment.amount = update.amount;
                payment.currency = update.currency.clone();
                if update.description.is_some() {
                    payment.description = update.description.clone();
                }
                payment.updated_at = now;

                if change == StatusChange::Advance {
                    PaymentTransition::Applied {
                        payment: payment.clone(),
                        previous: Some(previous),
                    }
                } else {
                    PaymentTransition::Unchanged {
                        payment: payment.clone(),
                    }
                }
            }
        };

        if matches!(transition, PaymentTransition::Applied { .. }) {
            if let Some(next) = appointment_status_for(update.status) {
                if let Some(appointment) = tables.appointments.iter_mut().find(|a| {
                    a.id == update.appointment_id && a.status == AppointmentStatus::Pending
                }) {
                    appointment.status = next;
                }
            }
        }

        Ok(transition)
    }

    async fn appointment_contact(
        &self,
        appointment_id: Uuid,
    ) -> StoreResult<Option<AppointmentContact>> {
        let tables = self.tables.lock().await;
        let Some(appointment) = tables.appointments.iter().find(|a| a.id == appointment_id) else {
            return Ok(None);
        };
        let (Some(user), Some(doctor)) = (
            tables.users.get(&appointment.user_id),
            tables.doctors.get(&appointment.doctor_id),
        ) else {
            return Ok(None);
        };

        Ok(Some(AppointmentContact {
            appointment_id,
            patient_name: user.name.clone(),
            phone: user.phone.clone(),
            doctor_name: doctor.clone(),
            date: appointment.date,
        }))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_latest_for_user(&self, user_id: Uuid) -> StoreResult<Option<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_by_preapproval(&self, preapproval_id: &str) -> StoreResult<Option<Subscription>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .iter()
            .find(|s| s.preapproval_id.as_deref() == Some(preapproval_id))
            .cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> StoreResult<Option<Subscription>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .map(|s| {
                s.status = status;
                s.updated_at = OffsetDateTime::now_utc();
                s.clone()
            }))
    }
}
