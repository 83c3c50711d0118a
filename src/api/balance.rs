//! Best-effort account balance lookups for vendors that expose one.
//!
//! A failed or unrecognized lookup is never an error for the caller; it is
//! logged at debug level and reported as `None`.

use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::api::models::get_json;
use crate::core::providers::ProviderIdentity;
use crate::core::retry::{with_retry, RetryPolicy};
use crate::utils::url::{construct_api_url, host_of};

#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub amount: f64,
    pub currency: String,
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.amount, self.currency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vendor {
    DeepSeek,
    OpenRouter,
    SiliconFlow,
    Moonshot { domestic: bool },
}

impl Vendor {
    fn detect(base_url: &str) -> Option<Self> {
        let host = host_of(base_url)?;
        if host.ends_with("deepseek.com") {
            Some(Vendor::DeepSeek)
        } else if host.ends_with("openrouter.ai") {
            Some(Vendor::OpenRouter)
        } else if host.contains("siliconflow") {
            Some(Vendor::SiliconFlow)
        } else if host.contains("moonshot") {
            Some(Vendor::Moonshot {
                domestic: host.ends_with(".cn"),
            })
        } else {
            None
        }
    }

    fn endpoint(self) -> &'static str {
        match self {
            Vendor::DeepSeek => "user/balance",
            Vendor::OpenRouter => "credits",
            Vendor::SiliconFlow => "user/info",
            Vendor::Moonshot { .. } => "users/me/balance",
        }
    }

    fn parse(self, body: &Value) -> Option<Balance> {
        match self {
            Vendor::DeepSeek => {
                let infos = body.get("balance_infos")?.as_array()?;
                let info = infos
                    .iter()
                    .find(|info| info.get("currency").and_then(Value::as_str) == Some("USD"))
                    .or_else(|| infos.first())?;
                Some(Balance {
                    amount: number(info.get("total_balance")?)?,
                    currency: info.get("currency")?.as_str()?.to_string(),
                })
            }
            Vendor::OpenRouter => {
                let data = body.get("data")?;
                let credits = number(data.get("total_credits")?)?;
                let usage = data.get("total_usage").and_then(number).unwrap_or(0.0);
                Some(Balance {
                    amount: credits - usage,
                    currency: "USD".to_string(),
                })
            }
            Vendor::SiliconFlow => {
                let data = body.get("data")?;
                let amount = data
                    .get("totalBalance")
                    .or_else(|| data.get("balance"))
                    .and_then(number)?;
                Some(Balance {
                    amount,
                    currency: "CNY".to_string(),
                })
            }
            Vendor::Moonshot { domestic } => Some(Balance {
                amount: number(body.pointer("/data/available_balance")?)?,
                currency: if domestic { "CNY" } else { "USD" }.to_string(),
            }),
        }
    }
}

/// Vendors report amounts as numbers or as decimal strings.
fn number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

pub async fn probe_balance(
    client: &reqwest::Client,
    identity: &ProviderIdentity,
    policy: &RetryPolicy,
) -> Option<Balance> {
    let vendor = Vendor::detect(&identity.base_url)?;
    probe_vendor(client, identity, policy, vendor).await
}

async fn probe_vendor(
    client: &reqwest::Client,
    identity: &ProviderIdentity,
    policy: &RetryPolicy,
    vendor: Vendor,
) -> Option<Balance> {
    let url = construct_api_url(&identity.base_url, vendor.endpoint());

    let body: Value = match with_retry(policy, || get_json(client, identity, &url)).await {
        Ok(body) => body,
        Err(err) => {
            debug!(provider = %identity.provider_id, "balance lookup failed: {err}");
            return None;
        }
    };

    let balance = vendor.parse(&body);
    if balance.is_none() {
        debug!(provider = %identity.provider_id, "balance response had an unexpected shape");
    }
    balance
}
