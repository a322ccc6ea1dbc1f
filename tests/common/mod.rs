// Shared fixtures: a scripted ERP fake and service builders.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::json;

use customer_erp_sync::config::SyncOptions;
use customer_erp_sync::models::{CustomerRecord, ErpCustomer, ErpPayload, SyncRuleRecord};
use customer_erp_sync::repositories::{InMemorySyncStore, SyncStore};
use customer_erp_sync::services::erp::erp_client::Result as ErpResult;
use customer_erp_sync::services::erp::{
    ChangeDetector, ErpClient, ErpClientError, SyncRuleEngine, UnifiedSyncService,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ErpCall {
    GetCustomers {
        updated_after: Option<DateTime<Utc>>,
        page_size: u32,
        page_index: u32,
    },
    Create(ErpPayload),
    Update(i64, ErpPayload),
}

/// In-process ERP whose pages, ids and failures are scripted by the test.
#[derive(Default)]
pub struct FakeErp {
    pages: Mutex<Vec<Vec<ErpCustomer>>>,
    failing_pages: Mutex<HashSet<u32>>,
    failing_create_mobiles: Mutex<HashSet<String>>,
    refuse_creates: AtomicBool,
    reject_updates: AtomicBool,
    panic_on_fetch: AtomicBool,
    delay: Mutex<Option<Duration>>,
    next_id: AtomicI64,
    calls: Mutex<Vec<ErpCall>>,
}

impl FakeErp {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            ..Default::default()
        }
    }

    pub fn with_pages(pages: Vec<Vec<ErpCustomer>>) -> Self {
        let erp = Self::new();
        erp.set_pages(pages);
        erp
    }

    pub fn set_pages(&self, pages: Vec<Vec<ErpCustomer>>) {
        *self.pages.lock().unwrap() = pages;
    }

    pub fn fail_page(&self, page_index: u32) {
        self.failing_pages.lock().unwrap().insert(page_index);
    }

    pub fn fail_create_for_mobile(&self, mobile: &str) {
        self.failing_create_mobiles.lock().unwrap().insert(mobile.to_string());
    }

    pub fn clear_create_failures(&self) {
        self.failing_create_mobiles.lock().unwrap().clear();
    }

    pub fn refuse_creates(&self, refuse: bool) {
        self.refuse_creates.store(refuse, Ordering::SeqCst);
    }

    pub fn reject_updates(&self, reject: bool) {
        self.reject_updates.store(reject, Ordering::SeqCst);
    }

    pub fn panic_on_fetch(&self, panic: bool) {
        self.panic_on_fetch.store(panic, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<ErpCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn create_calls(&self) -> Vec<ErpPayload> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ErpCall::Create(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn update_calls(&self) -> Vec<(i64, ErpPayload)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ErpCall::Update(id, fields) => Some((id, fields)),
                _ => None,
            })
            .collect()
    }

    pub fn fetch_calls(&self) -> Vec<ErpCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, ErpCall::GetCustomers { .. }))
            .collect()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ErpClient for FakeErp {
    async fn get_customers(
        &self,
        updated_after: Option<DateTime<Utc>>,
        page_size: u32,
        page_index: u32,
    ) -> ErpResult<Vec<ErpCustomer>> {
        self.calls.lock().unwrap().push(ErpCall::GetCustomers {
            updated_after,
            page_size,
            page_index,
        });
        self.pause().await;

        if self.panic_on_fetch.load(Ordering::SeqCst) {
            panic!("scripted ERP panic");
        }
        if self.failing_pages.lock().unwrap().contains(&page_index) {
            return Err(ErpClientError::Http(StatusCode::BAD_GATEWAY, "upstream down".to_string()));
        }

        let pages = self.pages.lock().unwrap();
        Ok(pages
            .get(page_index.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_customer(&self, payload: &ErpPayload) -> ErpResult<Option<i64>> {
        self.calls.lock().unwrap().push(ErpCall::Create(payload.clone()));
        self.pause().await;

        if let Some(mobile) = payload.get("mobile") {
            if self.failing_create_mobiles.lock().unwrap().contains(mobile) {
                return Err(ErpClientError::Api {
                    status: 2,
                    message: "duplicate mobile".to_string(),
                });
            }
        }
        if self.refuse_creates.load(Ordering::SeqCst) {
            return Ok(None);
        }

        Ok(Some(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn update_customer(&self, erp_id: i64, fields: &ErpPayload) -> ErpResult<bool> {
        self.calls.lock().unwrap().push(ErpCall::Update(erp_id, fields.clone()));
        self.pause().await;
        Ok(!self.reject_updates.load(Ordering::SeqCst))
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn erp_customer(ord: &str, name: &str, mobile: &str) -> ErpCustomer {
    ErpCustomer {
        ord: Some(ord.to_string()),
        name: Some(name.to_string()),
        mobile: Some(mobile.to_string()),
        ..Default::default()
    }
}

pub fn committed_customer(phone: &str, company: &str) -> CustomerRecord {
    CustomerRecord {
        phone: Some(phone.to_string()),
        company_name: Some(company.to_string()),
        has_order: true,
        ..Default::default()
    }
}

/// The rules seeded by the initial migration.
pub fn default_rule_records() -> Vec<SyncRuleRecord> {
    let rule = |id: i64, name: &str, priority: i32, conditions: serde_json::Value, action: Option<&str>| {
        SyncRuleRecord {
            id,
            name: name.to_string(),
            rule_type: name.to_string(),
            priority,
            conditions,
            action: action.map(str::to_string),
            description: None,
            match_count: 0,
            is_active: true,
        }
    };

    vec![
        rule(1, "mandatory", 100, json!({}), None),
        rule(2, "high_quality", 80, json!({"min_quality_score": 80}), None),
        rule(3, "medium_quality", 50, json!({}), None),
        rule(4, "low_quality", 0, json!({"min_intent_score": 30, "min_message_count": 5}), Some("SKIP")),
    ]
}

pub fn sync_options(page_size: u32) -> SyncOptions {
    SyncOptions {
        pull_page_size: page_size,
        ..Default::default()
    }
}

pub struct Harness {
    pub erp: Arc<FakeErp>,
    pub store: Arc<InMemorySyncStore>,
    pub engine: Arc<SyncRuleEngine>,
    pub service: Arc<UnifiedSyncService>,
}

pub fn harness(erp: FakeErp, store: InMemorySyncStore, page_size: u32) -> Harness {
    let erp = Arc::new(erp);
    let store = Arc::new(store);
    let engine = Arc::new(SyncRuleEngine::new(store.clone() as Arc<dyn SyncStore>));
    let service = Arc::new(UnifiedSyncService::new(
        erp.clone() as Arc<dyn ErpClient>,
        store.clone() as Arc<dyn SyncStore>,
        Arc::new(ChangeDetector::new()),
        engine.clone(),
        sync_options(page_size),
    ));

    Harness {
        erp,
        store,
        engine,
        service,
    }
}
