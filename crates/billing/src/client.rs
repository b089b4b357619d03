//! Mercado Pago API client

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_API_URL: &str = "https://api.mercadopago.com";

/// Outbound processor calls are abandoned after this long
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Mercado Pago configuration
#[derive(Debug, Clone)]
pub struct MercadoPagoConfig {
    pub access_token: String,
    /// Secret for `x-signature` verification. Verification is skipped when unset.
    pub webhook_secret: Option<String>,
    pub api_url: String,
}

impl MercadoPagoConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let access_token = std::env::var("MERCADOPAGO_ACCESS_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BillingError::Config("MERCADOPAGO_ACCESS_TOKEN not set".to_string()))?;

        let webhook_secret = std::env::var("MERCADOPAGO_WEBHOOK_SECRET")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let api_url = std::env::var("MERCADOPAGO_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            access_token,
            webhook_secret,
            api_url,
        })
    }
}

/// Mercado Pago ids arrive as JSON numbers or strings depending on the resource
#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteId {
    Number(i64),
    Text(String),
}

pub(crate) fn deserialize_remote_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match RemoteId::deserialize(deserializer)? {
        RemoteId::Number(n) => n.to_string(),
        RemoteId::Text(s) => s,
    })
}

/// A recurring-payment authorization
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Preapproval {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub payer_email: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
}

impl Preapproval {
    pub fn is_authorized(&self) -> bool {
        self.status == "authorized"
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Payer {
    #[serde(default)]
    pub email: Option<String>,
}

/// A one-off payment as reported by `/v1/payments/{id}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessorPayment {
    #[serde(deserialize_with = "deserialize_remote_id")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub status_detail: Option<String>,
    /// Local appointment id the checkout was created for
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub transaction_amount: f64,
    #[serde(default)]
    pub currency_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payer: Option<Payer>,
}

impl ProcessorPayment {
    pub fn payer_email(&self) -> Option<&str> {
        self.payer.as_ref().and_then(|p| p.email.as_deref())
    }
}

#[derive(Serialize)]
struct PreapprovalStatusUpdate<'a> {
    status: &'a str,
}

/// Remote payment processor operations used by the reconcilers
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn get_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval>;

    async fn cancel_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval>;

    async fn get_payment(&self, payment_id: &str) -> BillingResult<ProcessorPayment>;
}

/// Mercado Pago REST client
#[derive(Clone)]
pub struct MercadoPagoClient {
    http: reqwest::Client,
    config: MercadoPagoConfig,
}

impl MercadoPagoClient {
    pub fn new(config: MercadoPagoConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(MercadoPagoConfig::from_env()?)
    }

    pub fn config(&self) -> &MercadoPagoConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url, path)
    }

    async fn read<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        resource: &str,
    ) -> BillingResult<T> {
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::NotFound(resource.to_string()));
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                resource = %resource,
                "Mercado Pago request failed"
            );
            return Err(BillingError::Processor {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentProcessor for MercadoPagoClient {
    async fn get_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval> {
        let response = self
            .http
            .get(self.url(&format!("/preapproval/{}", preapproval_id)))
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;

        Self::read(response, &format!("preapproval {}", preapproval_id)).await
    }

    async fn cancel_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval> {
        let response = self
            .http
            .put(self.url(&format!("/preapproval/{}", preapproval_id)))
            .bearer_auth(&self.config.access_token)
            .json(&PreapprovalStatusUpdate {
                status: "cancelled",
            })
            .send()
            .await?;

        let preapproval: Preapproval =
            Self::read(response, &format!("preapproval {}", preapproval_id)).await?;

        tracing::info!(
            preapproval_id = %preapproval_id,
            status = %preapproval.status,
            "Cancelled preapproval at Mercado Pago"
        );

        Ok(preapproval)
    }

    async fn get_payment(&self, payment_id: &str) -> BillingResult<ProcessorPayment> {
        let response = self
            .http
            .get(self.url(&format!("/v1/payments/{}", payment_id)))
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;

        Self::read(response, &format!("payment {}", payment_id)).await
    }
}
