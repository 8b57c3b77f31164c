use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header::RETRY_AFTER, Response, StatusCode};
use serde::Deserialize;

use crate::{
    config::Settings,
    model::{Quote, Quotes, COINS},
};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("http status {0}")]
    Status(StatusCode),
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("decode failed: {0}")]
    Decode(#[source] reqwest::Error),
}

/// How a single attempt ended. Only `RateLimited` is worth another try.
#[derive(Debug)]
enum Attempt {
    Ok(Response),
    RateLimited(Duration),
    Hard(FetchError),
}

/// Upstream payload entry. Every field may be absent or null.
#[derive(Debug, Default, Deserialize)]
struct RawQuote {
    #[serde(default)]
    usd: Option<f64>,
    #[serde(default)]
    usd_market_cap: Option<f64>,
    #[serde(default)]
    usd_24h_change: Option<f64>,
}

impl RawQuote {
    fn is_empty(&self) -> bool {
        self.usd.is_none() && self.usd_market_cap.is_none() && self.usd_24h_change.is_none()
    }
}

type RawPayload = HashMap<String, RawQuote>;

pub struct PriceFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl PriceFetcher {
    pub fn new(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.fetch_timeout())
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: settings.price_api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn price_url(&self) -> String {
        format!("{}/simple/price", self.base_url)
    }

    /// Fetch one quote per tracked coin. Rate limiting is retried within
    /// `max_attempts`; any other failure gives up at once.
    pub async fn fetch(&self, max_attempts: u32) -> Option<Quotes> {
        for attempt in 1..=max_attempts {
            let resp = match self.classify(self.request().await) {
                Attempt::Ok(resp) => resp,
                Attempt::RateLimited(delay) => {
                    log::warn!(
                        "fetcher.rate_limited attempt={}/{} retry_in_ms={}",
                        attempt,
                        max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Attempt::Hard(e) => {
                    log::error!("fetcher.failed attempt={}/{} err={}", attempt, max_attempts, e);
                    return None;
                }
            };

            return match resp.json::<RawPayload>().await {
                Ok(payload) => {
                    log::debug!("fetcher.payload {:?}", payload);
                    Some(normalize(&payload))
                }
                Err(e) => {
                    log::error!("fetcher.failed attempt={}/{} err={}", attempt, max_attempts, FetchError::Decode(e));
                    None
                }
            };
        }

        log::error!("fetcher.exhausted attempts={}", max_attempts);
        None
    }

    async fn request(&self) -> Result<Response, reqwest::Error> {
        let ids = COINS.iter().map(|(_, id)| *id).collect::<Vec<_>>().join(",");
        self.http
            .get(self.price_url())
            .query(&[
                ("ids", ids.as_str()),
                ("vs_currencies", "usd"),
                ("include_market_cap", "true"),
                ("include_24hr_change", "true"),
            ])
            .send()
            .await
    }

    fn classify(&self, sent: Result<Response, reqwest::Error>) -> Attempt {
        let resp = match sent {
            Ok(r) => r,
            Err(e) => return Attempt::Hard(FetchError::Network(e)),
        };
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header = resp.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok());
            return Attempt::RateLimited(retry_after(header));
        }
        if !status.is_success() {
            return Attempt::Hard(FetchError::Status(status));
        }
        Attempt::Ok(resp)
    }
}

/// `Retry-After` in (possibly fractional) seconds, capped at `MAX_RETRY_AFTER`.
/// Anything unparseable or not representable falls back to one second.
fn retry_after(header: Option<&str>) -> Duration {
    header
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .map(|d| d.min(MAX_RETRY_AFTER))
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Missing coins and missing fields become zero so every coin gets a full quote.
fn normalize(payload: &RawPayload) -> Quotes {
    COINS
        .iter()
        .map(|(coin, id)| {
            let raw = payload.get(*id);
            match raw {
                None => log::warn!("fetcher.missing coin={}", id),
                Some(r) if r.is_empty() => log::warn!("fetcher.empty coin={}", id),
                Some(_) => {}
            }
            (*coin, to_quote(raw))
        })
        .collect()
}

fn to_quote(raw: Option<&RawQuote>) -> Quote {
    let Some(raw) = raw else {
        return Quote::default();
    };
    Quote {
        price_usd: raw.usd.unwrap_or(0.0),
        market_cap_usd: raw.usd_market_cap.unwrap_or(0.0),
        change_24h: raw.usd_24h_change.unwrap_or(0.0),
    }
}
