//! Provider page clients for the gasflow pipeline.
//!
//! The Huayuan WAP portal exposes two pages per account:
//! - a balance-detail page (GET) listing readings as `<li><span>label</span>
//!   ... <b>value</b></li>` rows
//! - a recharge-log page (POST with a `begin_date`/`end_date` form) listing
//!   transactions as `<li>... <h1><b>amount</b></h1> ... <p>date time</p></li>`
//!   rows inside a `history` section
//!
//! Both are modeled behind the [`DataSource`] trait so the refresh
//! coordinators and the accrual engine never see HTTP or markup. Fetch
//! failures are transient by design: the caller keeps its previous snapshot
//! and retries on the next timer tick.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Days, Local, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::models::{BalanceSnapshot, RechargeTotal};

// ---

/// Transient failure of a single provider fetch. Never fatal: the owning
/// coordinator logs it and keeps serving the last good snapshot.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("page contained no parseable readings")]
    EmptyPage,
}

/// One remotely hosted data series for a metered account.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    async fn fetch(&self, sn: &str) -> Result<Self::Output, FetchError>;
}

// ---

// Row shapes of the provider markup. The pages are server-rendered and
// stable; attribute noise inside the tags is tolerated.
static BALANCE_ROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<li[^>]*>.*?<span[^>]*>(.*?)</span>.*?<b[^>]*>(.*?)</b>").unwrap()
});
static RECHARGE_ROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<li[^>]*>.*?<h1[^>]*>.*?<b[^>]*>(.*?)</b>.*?<p[^>]*>(.*?)</p>").unwrap()
});
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

fn strip_tags(fragment: &str) -> String {
    // ---
    TAG_RE.replace_all(fragment, "").trim().to_string()
}

/// First decimal-number substring of a cell, ignoring unit/text noise
/// ("123.45元" → 123.45). Cells without one yield nothing.
fn extract_number(cell: &str) -> Option<f64> {
    // ---
    NUMBER_RE.find(cell).and_then(|m| m.as_str().parse().ok())
}

// ---

/// Client for the balance-detail page.
pub struct BalanceSource {
    // ---
    client: reqwest::Client,
    base_url: String,
}

impl BalanceSource {
    pub fn new(base_url: String) -> Self {
        // ---
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl DataSource for BalanceSource {
    type Output = BalanceSnapshot;

    async fn fetch(&self, sn: &str) -> Result<BalanceSnapshot, FetchError> {
        // ---
        let url = format!("{}{}", self.base_url, sn);
        tracing::debug!("Fetching balance page: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let html = response.text().await?;
        let readings = parse_balance_page(&html);
        if readings.is_empty() {
            // An error page or a layout change; keep the previous snapshot
            return Err(FetchError::EmptyPage);
        }

        tracing::debug!("Balance page yielded {} readings", readings.len());
        Ok(BalanceSnapshot {
            readings,
            captured_at: Utc::now(),
        })
    }
}

/// Extract the label→value map from the balance-detail page.
///
/// Rows whose value cell holds no number (the valve glyph, for one) are
/// left out of the map rather than mapped to a sentinel.
fn parse_balance_page(html: &str) -> HashMap<String, f64> {
    // ---
    let mut readings = HashMap::new();
    for row in BALANCE_ROW_RE.captures_iter(html) {
        let label = strip_tags(&row[1]);
        if label.is_empty() {
            continue;
        }
        if let Some(value) = extract_number(&strip_tags(&row[2])) {
            readings.insert(label, value);
        }
    }
    readings
}

// ---

/// Client for the recharge-log page. Always queries the day before the
/// fetch (host-local): the portal only lists settled prior-day
/// transactions, so a same-day recharge becomes visible the next day.
pub struct RechargeSource {
    // ---
    client: reqwest::Client,
    base_url: String,
}

impl RechargeSource {
    pub fn new(base_url: String) -> Self {
        // ---
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl DataSource for RechargeSource {
    type Output = RechargeTotal;

    async fn fetch(&self, sn: &str) -> Result<RechargeTotal, FetchError> {
        // ---
        let target = Local::now().date_naive() - Days::new(1);
        let date_param = target.format("%Y-%m-%d").to_string();
        let url = format!("{}{}", self.base_url, sn);
        tracing::debug!("Fetching recharge log for {}: {}", date_param, url);

        let response = self
            .client
            .post(&url)
            .form(&[("begin_date", &date_param), ("end_date", &date_param)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let html = response.text().await?;
        let total = parse_recharge_page(&html, target);

        tracing::debug!("Recharge total for {}: {:.2}", date_param, total);
        Ok(RechargeTotal {
            total,
            date: target,
            captured_at: Utc::now(),
        })
    }
}

/// Sum the recharge line items posted on `target`.
///
/// Items on other dates are discarded, not summed. An item whose amount
/// cell does not parse is skipped with a warning; the rest of the batch
/// still counts. An empty log is a legitimate zero, not a failure.
fn parse_recharge_page(html: &str, target: NaiveDate) -> f64 {
    // ---
    let target = target.format("%Y-%m-%d").to_string();
    let mut total = 0.0;
    for row in RECHARGE_ROW_RE.captures_iter(html) {
        let amount_cell = strip_tags(&row[1]);
        let date_cell = strip_tags(&row[2]);

        // Leading token of the date cell is the posted date, the rest is
        // the time of day
        let posted = date_cell.split_whitespace().next().unwrap_or("");
        if posted != target {
            continue;
        }

        match amount_cell.trim().parse::<f64>() {
            Ok(amount) => total += amount,
            Err(_) => {
                tracing::warn!("Skipping unparseable recharge row: {:?}", amount_cell);
            }
        }
    }
    total
}

// ---

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{
        KEY_ACCOUNT_BALANCE, KEY_ARREARS, KEY_CUMULATIVE_USAGE, KEY_METER_BALANCE,
        KEY_VALVE_STATUS,
    };

    const BALANCE_PAGE: &str = r#"
        <html><body><ul>
          <li><span>表端余额</span><b>123.45元</b></li>
          <li><span>账户余额</span><b> 0.00 </b></li>
          <li><span>欠费金额</span><b>12元</b></li>
          <li><span>累计用气量</span><b>210.3m³</b></li>
          <li><span>阀门状态</span><b>开</b></li>
        </ul></body></html>
    "#;

    #[test]
    fn balance_page_extracts_numeric_cells() {
        // ---
        let readings = parse_balance_page(BALANCE_PAGE);

        assert_eq!(readings.get(KEY_METER_BALANCE), Some(&123.45));
        assert_eq!(readings.get(KEY_ACCOUNT_BALANCE), Some(&0.0));
        assert_eq!(readings.get(KEY_ARREARS), Some(&12.0));
        assert_eq!(readings.get(KEY_CUMULATIVE_USAGE), Some(&210.3));

        // The valve cell is a glyph, not a number; it must not appear
        assert!(!readings.contains_key(KEY_VALVE_STATUS));
        assert_eq!(readings.len(), 4);
    }

    #[test]
    fn balance_page_tolerates_tag_attributes_and_nesting() {
        // ---
        let html = r#"<li class="row"><span class="k">表端余额</span>
                      <em>:</em><b class="v"><i>88.8</i>元</b></li>"#;
        let readings = parse_balance_page(html);
        assert_eq!(readings.get(KEY_METER_BALANCE), Some(&88.8));
    }

    #[test]
    fn balance_page_without_rows_is_empty() {
        // ---
        assert!(parse_balance_page("<html><body>稍后再试</body></html>").is_empty());
    }

    #[test]
    fn recharge_page_sums_only_the_target_date() {
        // ---
        let html = r#"
            <div class="history"><ul>
              <li><h1><b>50.00</b></h1><p>2024-03-01 09:15:00</p></li>
              <li><h1><b>30.00</b></h1><p>2024-03-01 21:40:12</p></li>
              <li><h1><b>200.00</b></h1><p>2024-02-28 10:00:00</p></li>
            </ul></div>
        "#;
        let target = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_recharge_page(html, target), 80.0);
    }

    #[test]
    fn recharge_page_skips_malformed_amounts() {
        // ---
        let html = r#"
            <div class="history"><ul>
              <li><h1><b>abc</b></h1><p>2024-03-01 09:15:00</p></li>
              <li><h1><b>25.50</b></h1><p>2024-03-01 11:00:00</p></li>
            </ul></div>
        "#;
        let target = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_recharge_page(html, target), 25.5);
    }

    #[test]
    fn recharge_page_with_no_matching_rows_is_zero() {
        // ---
        let html = r#"<div class="history"><ul>
            <li><h1><b>10.00</b></h1><p>2024-02-27 08:00:00</p></li>
        </ul></div>"#;
        let target = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_recharge_page(html, target), 0.0);
        assert_eq!(parse_recharge_page("", target), 0.0);
    }

    #[test]
    fn number_extraction_takes_the_first_decimal_substring() {
        // ---
        assert_eq!(extract_number("余额 123.45 元"), Some(123.45));
        assert_eq!(extract_number("12元 (截至 2024-03-01)"), Some(12.0));
        assert_eq!(extract_number("开"), None);
        assert_eq!(extract_number(""), None);
    }
}
