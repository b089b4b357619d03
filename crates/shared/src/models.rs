//! Domain models for appointments, payments and subscriptions
//!
//! Statuses are persisted as upper-case TEXT columns and converted through
//! `as_str` / `FromStr`, so the same values round-trip through Postgres and
//! the in-memory store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Error returned when a persisted status string is unknown
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} status: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_status {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

text_status!(AppointmentStatus, "appointment", {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Cancelled => "CANCELLED",
    Completed => "COMPLETED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

text_status!(PaymentStatus, "payment", {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

/// Outcome of asking whether a payment may move to a new status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The status actually changes
    Advance,
    /// Same status as before; nothing to write
    NoChange,
    /// The current status is terminal and the new one differs
    Blocked,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Approved | PaymentStatus::Rejected)
    }

    /// Terminal statuses are final: once approved or rejected, a payment
    /// never returns to pending or flips to the other terminal state.
    pub fn change_to(&self, next: PaymentStatus) -> StatusChange {
        if *self == next {
            StatusChange::NoChange
        } else if self.is_terminal() {
            StatusChange::Blocked
        } else {
            StatusChange::Advance
        }
    }

    /// Map a Mercado Pago payment status onto the local status set
    pub fn from_processor(status: &str) -> Self {
        match status {
            "approved" => PaymentStatus::Approved,
            "rejected" | "cancelled" | "refunded" | "charged_back" => PaymentStatus::Rejected,
            _ => PaymentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Paused,
    Cancelled,
}

text_status!(SubscriptionStatus, "subscription", {
    Pending => "PENDING",
    Active => "ACTIVE",
    Paused => "PAUSED",
    Cancelled => "CANCELLED",
});

impl SubscriptionStatus {
    /// Map a Mercado Pago preapproval status onto the local status set
    pub fn from_processor(status: &str) -> Self {
        match status {
            "authorized" => SubscriptionStatus::Active,
            "paused" => SubscriptionStatus::Paused,
            "cancelled" => SubscriptionStatus::Cancelled,
            _ => SubscriptionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Appointment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub doctor_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub status: AppointmentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub external_id: Option<String>,
    pub status: PaymentStatus,
    pub payer_email: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Archive row written when an appointment is terminally resolved
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct AppointmentHistory {
    pub id: Uuid,
    pub original_id: Uuid,
    pub user_id: Uuid,
    pub doctor_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub status: String,
    pub reason: String,
    pub amount: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub archived_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub preapproval_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Who to notify about an appointment, and what to tell them
#[derive(Debug, Clone, PartialEq)]
pub struct AppointmentContact {
    pub appointment_id: Uuid,
    pub patient_name: String,
    pub phone: Option<String>,
    pub doctor_name: String,
    pub date: OffsetDateTime,
}
