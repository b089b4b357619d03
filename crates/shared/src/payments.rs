//! Payment persistence
//!
//! Local payment rows are a projection of the processor's payment state.
//! [`PaymentStore::apply_processor_update`] is the only way the status moves
//! and it enforces [`PaymentStatus::change_to`]: terminal states never change.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{AppointmentContact, AppointmentStatus, Payment, PaymentStatus, StatusChange};

/// Payment state as reported by the processor, keyed by appointment
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorPaymentUpdate {
    pub appointment_id: Uuid,
    pub external_id: String,
    pub status: PaymentStatus,
    pub payer_email: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub description: Option<String>,
}

/// What applying a processor update did to the local row
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentTransition {
    /// Status advanced (or a row was created). `previous` is `None` for a new row.
    Applied {
        payment: Payment,
        previous: Option<PaymentStatus>,
    },
    /// Same status as stored; details refreshed
    Unchanged { payment: Payment },
    /// Stored status is terminal and differs from the update; nothing written
    Blocked {
        payment: Payment,
        attempted: PaymentStatus,
    },
    /// The appointment named by the processor no longer exists
    AppointmentMissing,
}

/// Appointment status implied by a payment reaching `status`
pub fn appointment_status_for(status: PaymentStatus) -> Option<AppointmentStatus> {
    match status {
        PaymentStatus::Approved => Some(AppointmentStatus::Confirmed),
        PaymentStatus::Rejected => Some(AppointmentStatus::Cancelled),
        PaymentStatus::Pending => None,
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>>;

    async fn find_payment_by_external_id(&self, external_id: &str) -> StoreResult<Option<Payment>>;

    /// Pending payments that already carry a processor id, oldest first
    async fn list_pending_with_external_id(&self, limit: i64) -> StoreResult<Vec<Payment>>;

    /// Apply processor state to the appointment's payment. A terminal status
    /// also moves a still-pending appointment (approved confirms it, rejected
    /// cancels it) in the same transaction.
    async fn apply_processor_update(
        &self,
        update: &ProcessorPaymentUpdate,
    ) -> StoreResult<PaymentTransition>;

    async fn appointment_contact(
        &self,
        appointment_id: Uuid,
    ) -> StoreResult<Option<AppointmentContact>>;
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    appointment_id: Uuid,
    external_id: Option<String>,
    status: String,
    payer_email: Option<String>,
    amount: f64,
    currency: String,
    description: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: crate::models::UnknownStatus| StoreError::corrupt("payments", e.to_string()))?;

        Ok(Payment {
            id: row.id,
            appointment_id: row.appointment_id,
            external_id: row.external_id,
            status,
            payer_email: row.payer_email,
            amount: row.amount,
            currency: row.currency,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ContactRow {
    appointment_id: Uuid,
    patient_name: String,
    phone: Option<String>,
    doctor_name: String,
    date: OffsetDateTime,
}

const PAYMENT_COLUMNS: &str = r#"
    id, appointment_id, external_id, status, payer_email, amount, currency,
    description, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn find_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn find_payment_by_external_id(&self, external_id: &str) -> StoreResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn list_pending_with_external_id(&self, limit: i64) -> StoreResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE status = 'PENDING' AND external_id IS NOT NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Payment::try_from).collect()
    }

    async fn apply_processor_update(
        &self,
        update: &ProcessorPaymentUpdate,
    ) -> StoreResult<PaymentTransition> {
        let mut tx = self.pool.begin().await?;

        let appointment: Option<(String,)> =
            sqlx::query_as("SELECT status FROM appointments WHERE id = $1 FOR UPDATE")
                .bind(update.appointment_id)
                .fetch_optional(&mut *tx)
                .await?;

        if appointment.is_none() {
            tx.rollback().await?;
            return Ok(PaymentTransition::AppointmentMissing);
        }

        let current: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE appointment_id = $1 FOR UPDATE"
        ))
        .bind(update.appointment_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (transition, advanced) = match current {
            None => {
                let row: PaymentRow = sqlx::query_as(&format!(
                    r#"
                    INSERT INTO payments
                        (appointment_id, external_id, status, payer_email, amount, currency, description)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING {PAYMENT_COLUMNS}
                    "#
                ))
                .bind(update.appointment_id)
                .bind(&update.external_id)
                .bind(update.status.as_str())
                .bind(&update.payer_email)
                .bind(update.amount)
                .bind(&update.currency)
                .bind(&update.description)
                .fetch_one(&mut *tx)
                .await?;

                let payment = Payment::try_from(row)?;
                (
                    PaymentTransition::Applied {
                        payment,
                        previous: None,
                    },
                    true,
                )
            }
            Some(row) => {
                let existing = Payment::try_from(row)?;
                match existing.status.change_to(update.status) {
                    StatusChange::Blocked => {
                        tx.rollback().await?;
                        return Ok(PaymentTransition::Blocked {
                            payment: existing,
                            attempted: update.status,
                        });
                    }
                    change => {
                        let row: PaymentRow = sqlx::query_as(&format!(
                            r#"
                            UPDATE payments
                            SET status = $2,
                                external_id = $3,
                                payer_email = COALESCE($4, payer_email),
                                amount = $5,
                                currency = $6,
                                description = COALESCE($7, description),
                                updated_at = NOW()
                            WHERE id = $1
                            RETURNING {PAYMENT_COLUMNS}
                            "#
                        ))
                        .bind(existing.id)
                        .bind(update.status.as_str())
                        .bind(&update.external_id)
                        .bind(&update.payer_email)
                        .bind(update.amount)
                        .bind(&update.currency)
                        .bind(&update.description)
                        .fetch_one(&mut *tx)
                        .await?;

                        let payment = Payment::try_from(row)?;
                        if change == StatusChange::Advance {
                            (
                                PaymentTransition::Applied {
                                    payment,
                                    previous: Some(existing.status),
                                },
                                true,
                            )
                        } else {
                            (PaymentTransition::Unchanged { payment }, false)
                        }
                    }
                }
            }
        };

        if advanced {
            if let Some(next) = appointment_status_for(update.status) {
                sqlx::query(
                    "UPDATE appointments SET status = $2 WHERE id = $1 AND status = 'PENDING'",
                )
                .bind(update.appointment_id)
                .bind(next.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(transition)
    }

    async fn appointment_contact(
        &self,
        appointment_id: Uuid,
    ) -> StoreResult<Option<AppointmentContact>> {
        let row: Option<ContactRow> = sqlx::query_as(
            r#"
            SELECT a.id AS appointment_id, u.name AS patient_name, u.phone,
                   d.name AS doctor_name, a.date
            FROM appointments a
            JOIN users u ON u.id = a.user_id
            JOIN doctors d ON d.id = a.doctor_id
            WHERE a.id = $1
            "#,
        )
        .bind(appointment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| AppointmentContact {
            appointment_id: row.appointment_id,
            patient_name: row.patient_name,
            phone: row.phone,
            doctor_name: row.doctor_name,
            date: row.date,
        }))
    }
}
