//! Headless-browser acquisition for data no endpoint returns directly: the
//! full per-supplier offer list rendered on the search page, and detail-page
//! fields such as the approval number.
//!
//! Each harvest owns one single-use browser; a semaphore bounds how many run
//! at once. Harvest failures are recoverable: the orchestrator
//! decides whether endpoint-only data is acceptable.

use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EnableParams, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use scraper::{Html, Selector};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::classifier::{category_from_approval, find_approval_number, APPROVAL_PATTERNS};
use crate::domain::entities::{Offer, OfferProvenance, ProductCategory};
use crate::domain::normalizer::parse_price_cents;
use crate::errors::{CrawlError, CrawlResult};

/// JSON field names the upstream has been seen carrying approval numbers in.
const APPROVAL_FIELDS: &[&str] = &[
    "approvalNumber",
    "approval_number",
    "approvalNo",
    "approvalNum",
    "licenseNumber",
    "license_number",
    "licenseNo",
    "licenseNum",
    "registrationNumber",
    "registration_number",
    "registrationNum",
    "certificateNumber",
    "certificate_number",
    "pzwh",
];

#[derive(Debug, Clone)]
pub struct BrowserHarvesterConfig {
    pub base_url: String,
    /// Concurrent browser sessions.
    pub max_contexts: usize,
    /// Whole-page budget per harvest.
    pub page_timeout: Duration,
    /// Budget for a single wait (navigation, settle, body fetch).
    pub action_timeout: Duration,
    /// How long the card region must stay unchanged to count as settled.
    pub settle: Duration,
}

impl Default for BrowserHarvesterConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dian.ysbang.cn".to_string(),
            max_contexts: 2,
            page_timeout: Duration::from_secs(60),
            action_timeout: Duration::from_secs(15),
            settle: Duration::from_millis(500),
        }
    }
}

/// Detail-page extraction result; both fields are best-effort.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailSignals {
    pub approval_number: Option<String>,
    pub category_hint: Option<ProductCategory>,
}

pub struct BrowserHarvester {
    config: BrowserHarvesterConfig,
    slots: Arc<Semaphore>,
    token: tokio::sync::RwLock<Option<String>>,
}

impl BrowserHarvester {
    pub fn new(config: BrowserHarvesterConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_contexts.max(1)));
        Self {
            config,
            slots,
            token: tokio::sync::RwLock::new(None),
        }
    }

    /// Sessions inherit the operator token so rendered pages show the same
    /// catalogue the endpoints do.
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    /// Harvest the rendered per-supplier offers for a keyword.
    pub async fn harvest_offers(
        &self,
        keyword: &str,
        cancel: &CancellationToken,
    ) -> CrawlResult<Vec<Offer>> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| CrawlError::browser("browser pool closed"))?;

        let url = format!(
            "{}/#/indexContent?searchkey={}",
            self.config.base_url, keyword
        );
        let mut session = BrowserSession::launch(self.token.read().await.clone(), &self.config).await?;

        let work = self.harvest_on_page(&session.page, &url, keyword);
        let result = tokio::select! {
            r = tokio::time::timeout(self.config.page_timeout, work) => match r {
                Ok(inner) => inner,
                Err(_) => Err(CrawlError::browser("page timeout")),
            },
            _ = cancel.cancelled() => Err(CrawlError::Cancelled),
        };

        session.close().await;
        result
    }

    /// Load a product detail route and pull approval-number signals, first
    /// from intercepted JSON responses, then from the rendered HTML.
    pub async fn extract_detail(
        &self,
        upstream_drug_id: i64,
        cancel: &CancellationToken,
    ) -> CrawlResult<DetailSignals> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| CrawlError::browser("browser pool closed"))?;

        let url = format!("{}/#/drug/{}", self.config.base_url, upstream_drug_id);
        let mut session = BrowserSession::launch(self.token.read().await.clone(), &self.config).await?;

        let work = self.detail_on_page(&session.page, &url);
        let result = tokio::select! {
            r = tokio::time::timeout(self.config.page_timeout, work) => match r {
                Ok(inner) => inner,
                Err(_) => Err(CrawlError::browser("detail page timeout")),
            },
            _ = cancel.cancelled() => Err(CrawlError::Cancelled),
        };

        session.close().await;
        result
    }

    async fn harvest_on_page(
        &self,
        page: &Page,
        url: &str,
        keyword: &str,
    ) -> CrawlResult<Vec<Offer>> {
        page.goto(url)
            .await
            .map_err(|e| CrawlError::browser(format!("navigation failed: {e}")))?;

        let html = self.wait_for_settled_cards(page).await?;
        let offers = parse_offer_cards(&html, url);
        info!("[{keyword}] browser pass extracted {} offers", offers.len());
        Ok(offers)
    }

    /// Poll the rendered card region until it has been stable for the settle
    /// window. SPA search results stream in; a fixed sleep either wastes
    /// time or cuts the list short.
    async fn wait_for_settled_cards(&self, page: &Page) -> CrawlResult<String> {
        let poll_every = Duration::from_millis(250);
        let stable_polls_needed =
            (self.config.settle.as_millis() / poll_every.as_millis()).max(1) as u32;
        let deadline = tokio::time::Instant::now() + self.config.action_timeout;

        let mut last_count = usize::MAX;
        let mut stable_polls = 0u32;
        let mut last_html = String::new();

        loop {
            let html = page
                .content()
                .await
                .map_err(|e| CrawlError::browser(format!("content read failed: {e}")))?;
            let count = count_offer_cards(&html);

            if count == last_count {
                stable_polls += 1;
                if stable_polls >= stable_polls_needed && count > 0 {
                    return Ok(html);
                }
            } else {
                stable_polls = 0;
                last_count = count;
            }
            last_html = html;

            if tokio::time::Instant::now() >= deadline {
                // Layout change or an empty result page; give back whatever
                // rendered so the caller can decide.
                debug!("card region never settled, returning last snapshot");
                return Ok(last_html);
            }
            tokio::time::sleep(poll_every).await;
        }
    }

    async fn detail_on_page(&self, page: &Page, url: &str) -> CrawlResult<DetailSignals> {
        page.execute(EnableParams::default())
            .await
            .map_err(|e| CrawlError::browser(format!("network enable failed: {e}")))?;

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| CrawlError::browser(format!("event listener failed: {e}")))?;

        page.goto(url)
            .await
            .map_err(|e| CrawlError::browser(format!("navigation failed: {e}")))?;

        // Strategy (a): watch JSON responses for an approval-number field.
        let listen_window = tokio::time::Instant::now() + self.config.action_timeout;
        while tokio::time::Instant::now() < listen_window {
            let next = tokio::time::timeout_at(listen_window, responses.next()).await;
            let event = match next {
                Ok(Some(event)) => event,
                _ => break,
            };
            if !event.response.mime_type.contains("json") {
                continue;
            }
            let body = match page
                .execute(GetResponseBodyParams::new(event.request_id.clone()))
                .await
            {
                Ok(body) => body.result.body.clone(),
                Err(_) => continue,
            };
            let Ok(json) = serde_json::from_str::<Value>(&body) else {
                continue;
            };
            if let Some(approval) = find_approval_in_json(&json) {
                debug!("approval number from intercepted response: {approval}");
                return Ok(signals_from_approval(approval));
            }
        }

        // Strategy (b): regex over the rendered page.
        let html = page
            .content()
            .await
            .map_err(|e| CrawlError::browser(format!("content read failed: {e}")))?;
        Ok(match find_approval_number(&html) {
            Some(approval) => signals_from_approval(approval),
            None => DetailSignals::default(),
        })
    }
}

fn signals_from_approval(approval: String) -> DetailSignals {
    DetailSignals {
        category_hint: category_from_approval(&approval),
        approval_number: Some(approval),
    }
}

/// One launched browser plus its event-handler task. Closing is explicit so
/// every exit path of a harvest releases the process.
struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
}

impl BrowserSession {
    async fn launch(token: Option<String>, config: &BrowserHarvesterConfig) -> CrawlResult<Self> {
        let browser_config = BrowserConfig::builder()
            .no_sandbox()
            .build()
            .map_err(CrawlError::browser)?;

        let (browser, mut handler_stream) = Browser::launch(browser_config)
            .await
            .map_err(|e| CrawlError::browser(format!("browser launch failed: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler_stream.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CrawlError::browser(format!("page open failed: {e}")))?;

        if let Some(token) = token {
            let cookie = CookieParam::builder()
                .name("Token")
                .value(token)
                .url(config.base_url.clone())
                .build()
                .map_err(CrawlError::browser)?;
            if let Err(e) = page.set_cookie(cookie).await {
                warn!("failed to set session cookie: {e}");
            }
        }

        Ok(Self {
            browser,
            handler,
            page,
        })
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

fn card_selector() -> Selector {
    Selector::parse(".all-goods-wrapper").expect("static selector")
}

fn count_offer_cards(html: &str) -> usize {
    Html::parse_document(html).select(&card_selector()).count()
}

/// Parse rendered supplier cards into offers. Pure so layout fixtures can
/// exercise it without a browser.
pub fn parse_offer_cards(html: &str, source_url: &str) -> Vec<Offer> {
    let doc = Html::parse_document(html);
    let name_sel = Selector::parse(".goods-name").expect("static selector");
    let price_sel = Selector::parse(".goods-price-all .font-semibold").expect("static selector");
    let supplier_sel = Selector::parse(".goods-footer-info").expect("static selector");
    let manufacturer_sel = Selector::parse(".goods-manufacturer").expect("static selector");
    let spec_sel = Selector::parse(".goods-spec, .specification").expect("static selector");

    let mut offers = Vec::new();
    for card in doc.select(&card_selector()) {
        let text_of = |sel: &Selector| {
            card.select(sel)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .unwrap_or_default()
        };

        let name = text_of(&name_sel);
        if name.is_empty() {
            continue;
        }
        let price_text: String = card
            .select(&price_sel)
            .map(|el| el.text().collect::<String>())
            .collect();
        let Some(price_cents) = parse_price_cents(price_text.trim()) else {
            continue;
        };

        offers.push(Offer {
            name,
            specification: text_of(&spec_sel),
            manufacturer: text_of(&manufacturer_sel),
            price_cents,
            supplier_name: text_of(&supplier_sel),
            supplier_id: None,
            upstream_drug_id: None,
            wholesale_id: None,
            source_url: source_url.to_string(),
            provenance: OfferProvenance::Browser,
        });
    }
    offers
}

/// Recursive search for an approval-number field in intercepted JSON. Only
/// values matching a known approval shape count; field names alone are too
/// noisy.
pub fn find_approval_in_json(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for field in APPROVAL_FIELDS {
                if let Some(Value::String(s)) = map.get(*field) {
                    if s.len() > 5 && APPROVAL_PATTERNS.iter().any(|re| re.is_match(s)) {
                        return Some(s.clone());
                    }
                }
            }
            map.values().find_map(find_approval_in_json)
        }
        Value::Array(items) => items.iter().find_map(find_approval_in_json),
        _ => None,
    }
}
