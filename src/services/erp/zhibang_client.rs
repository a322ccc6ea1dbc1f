// Zhibang ERP Client
// Session-based JSON API: every call posts `{session, cmdkey, datas: [{id, val}]}`
// and receives `{header: {status, message, session}, data}`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use url::Url;

use crate::config::ErpConfig;
use crate::models::{ErpCustomer, ErpPayload};
use crate::utils::{redact_sensitive, sanitize_for_log};

use super::erp_client::{ErpClient, ErpClientError, Result};

const LOGIN_PATH: &str = "/webapi/v3/ov1/login";
const LOGOUT_PATH: &str = "/sysa/mobilephone/logout.asp";
const CUSTOMER_LIST_PATH: &str = "/sysa/mobilephone/salesmanage/custom/list.asp";
const CUSTOMER_ADD_PATH: &str = "/sysa/mobilephone/salesmanage/custom/add.asp";
const CUSTOMER_DETAIL_PATH: &str = "/sysa/mobilephone/salesmanage/custom/add.asp?edit=1";

const CMD_REFRESH: &str = "refresh";
const CMD_SAVE: &str = "__sys_dosave";

/// Legacy error code the ERP returns when a session token is no longer valid
const CODE_SESSION_INVALID: i64 = 400;

// ============================================================================
// Wire Format
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataItem {
    pub id: String,
    pub val: Value,
}

impl DataItem {
    pub fn new(id: &str, val: impl Into<Value>) -> Self {
        Self {
            id: id.to_string(),
            val: val.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErpRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmdkey: Option<&'a str>,
    datas: &'a [DataItem],
}

#[derive(Debug, Default, Deserialize)]
struct ResponseHeader {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErpResponse {
    #[serde(default)]
    header: Option<ResponseHeader>,
    #[serde(default)]
    pub data: Value,
    /// Some pages answer with `source` instead of `data`
    #[serde(default)]
    pub source: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "Code", default)]
    code: Option<i64>,
    #[serde(rename = "Msg", default)]
    msg: Option<String>,
}

impl ErpResponse {
    /// Map error statuses to `ErpClientError`.
    fn check(self) -> Result<Self> {
        if self.code == Some(CODE_SESSION_INVALID) {
            return Err(ErpClientError::SessionExpired);
        }
        if let Some(code) = self.code.filter(|c| *c != 0 && *c != 200) {
            return Err(ErpClientError::Api {
                status: code,
                message: self.msg.clone().unwrap_or_default(),
            });
        }
        if let Some(header) = &self.header {
            if header.status != 0 {
                return Err(ErpClientError::Api {
                    status: header.status,
                    message: header.message.clone().unwrap_or_default(),
                });
            }
        }
        Ok(self)
    }

    /// Look a value up under `data`, then `source`, then the top level.
    fn lookup(&self, pointer: &str) -> Option<&Value> {
        self.data
            .pointer(pointer)
            .or_else(|| self.source.pointer(pointer))
            .filter(|v| !v.is_null())
    }
}

/// Integer from a JSON number or numeric string.
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_customer_rows(response: &ErpResponse) -> Result<Vec<ErpCustomer>> {
    match response.lookup("/table/rows") {
        Some(rows @ Value::Array(_)) => Ok(serde_json::from_value(rows.clone())?),
        Some(other) => Err(ErpClientError::UnexpectedResponse(format!(
            "customer rows is not a list: {}",
            sanitize_for_log(&other.to_string())
        ))),
        None => Ok(Vec::new()),
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct ZhibangErpClient {
    config: ErpConfig,
    base_url: String,
    http_client: Client,
    session: RwLock<Option<String>>,
}

impl ZhibangErpClient {
    pub fn new(config: ErpConfig) -> Result<Self> {
        let parsed = Url::parse(&config.base_url)
            .map_err(|e| ErpClientError::Config(format!("invalid ERP base URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ErpClientError::Config(format!(
                "ERP base URL must be http or https, got {}",
                parsed.scheme()
            )));
        }
        if config.username.trim().is_empty() || config.password.is_empty() {
            return Err(ErpClientError::Config("ERP username and password are required".to_string()));
        }

        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs.max(1)))
            .cookie_store(true)
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
            http_client,
            session: RwLock::new(None),
        })
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_some()
    }

    // ========================================================================
    // Session Management
    // ========================================================================

    /// Log in and cache the session, replacing any existing one.
    pub async fn login(&self) -> Result<String> {
        let mut session = self.session.write().await;
        let token = self.request_session().await?;
        *session = Some(token.clone());
        Ok(token)
    }

    /// Drop the session on the ERP side. The cached session is cleared even
    /// if the request fails.
    pub async fn logout(&self) -> Result<()> {
        let Some(token) = self.session.write().await.take() else {
            return Ok(());
        };

        self.post(LOGOUT_PATH, Some(&token), None, &[]).await?;
        tracing::info!("Logged out of Zhibang ERP");
        Ok(())
    }

    async fn ensure_session(&self) -> Result<String> {
        if let Some(token) = self.session.read().await.clone() {
            return Ok(token);
        }

        let mut session = self.session.write().await;
        if let Some(token) = session.clone() {
            return Ok(token);
        }
        let token = self.request_session().await?;
        *session = Some(token.clone());
        Ok(token)
    }

    async fn request_session(&self) -> Result<String> {
        let datas = [
            DataItem::new("user", format!("txt:{}", self.config.username)),
            DataItem::new("password", format!("txt:{}", self.config.password)),
            DataItem::new("serialnum", self.config.serial_number.clone()),
        ];

        let response = match self.post(LOGIN_PATH, None, None, &datas).await {
            Ok(response) => response,
            Err(ErpClientError::Api { message, .. }) => return Err(ErpClientError::Login(message)),
            Err(e) => return Err(e),
        };

        let token = response
            .header
            .and_then(|h| h.session)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ErpClientError::Login("response carried no session".to_string()))?;

        tracing::info!(
            user = %sanitize_for_log(&self.config.username),
            session = %redact_sensitive(&token),
            "Logged in to Zhibang ERP"
        );
        Ok(token)
    }

    // ========================================================================
    // Transport
    // ========================================================================

    async fn post(
        &self,
        path: &str,
        session: Option<&str>,
        cmdkey: Option<&str>,
        datas: &[DataItem],
    ) -> Result<ErpResponse> {
        let url = format!("{}{}", self.base_url, path);
        let body = ErpRequest { session, cmdkey, datas };

        let response = self.http_client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ErpClientError::Http(status, sanitize_for_log(&error_text)));
        }

        let text = response.text().await?;
        let parsed: ErpResponse = serde_json::from_str(&text)?;
        parsed.check()
    }

    /// Authenticated call. An expired session is renewed once.
    async fn call(&self, path: &str, cmdkey: Option<&str>, datas: &[DataItem]) -> Result<ErpResponse> {
        let token = self.ensure_session().await?;
        match self.post(path, Some(&token), cmdkey, datas).await {
            Err(ErpClientError::SessionExpired) => {
                tracing::info!("ERP session expired, logging in again");
                let token = self.login().await?;
                self.post(path, Some(&token), cmdkey, datas).await
            }
            other => other,
        }
    }

    // ========================================================================
    // Customer Operations
    // ========================================================================

    /// Reserve a new customer id (`ord`). `None` if the ERP handed out none.
    pub async fn allocate_customer_id(&self, customer_type: i32) -> Result<Option<i64>> {
        let datas = [DataItem::new("edit", ""), DataItem::new("intsort", customer_type.to_string())];
        let response = self.call(CUSTOMER_ADD_PATH, None, &datas).await?;

        let id = response
            .lookup("/value")
            .or(Some(&response.value))
            .and_then(value_as_i64)
            .filter(|id| *id > 0);
        Ok(id)
    }

    /// Customer type (`intsort`) of an existing customer, 1 when unknown.
    pub async fn get_customer_type(&self, erp_id: i64) -> Result<i32> {
        let datas = [DataItem::new("edit", ""), DataItem::new("ord", erp_id)];
        let response = self.call(CUSTOMER_DETAIL_PATH, None, &datas).await?;

        Ok(response
            .lookup("/intsort")
            .and_then(value_as_i64)
            .and_then(|t| i32::try_from(t).ok())
            .unwrap_or(1))
    }

    async fn save_customer(&self, erp_id: i64, customer_type: i32, fields: &ErpPayload) -> Result<()> {
        let path = format!("{}?intsort={}", CUSTOMER_ADD_PATH, customer_type);

        let mut datas = vec![DataItem::new("ord", erp_id)];
        datas.extend(
            fields
                .iter()
                .filter(|(key, _)| key.as_str() != "intsort" && key.as_str() != "ord")
                .map(|(key, value)| DataItem::new(key, value.clone())),
        );

        self.call(&path, Some(CMD_SAVE), &datas).await?;
        Ok(())
    }
}

#[async_trait]
impl ErpClient for ZhibangErpClient {
    async fn get_customers(
        &self,
        updated_after: Option<DateTime<Utc>>,
        page_size: u32,
        page_index: u32,
    ) -> Result<Vec<ErpCustomer>> {
        let mut datas = vec![
            DataItem::new("pagesize", page_size),
            DataItem::new("pageindex", page_index),
        ];
        if let Some(after) = updated_after {
            datas.push(DataItem::new("date1_0", after.format("%Y-%m-%d").to_string()));
        }

        let response = self.call(CUSTOMER_LIST_PATH, Some(CMD_REFRESH), &datas).await?;
        let customers = parse_customer_rows(&response)?;

        tracing::debug!("Fetched {} ERP customers from page {}", customers.len(), page_index);
        Ok(customers)
    }

    async fn create_customer(&self, payload: &ErpPayload) -> Result<Option<i64>> {
        let customer_type = payload
            .get("intsort")
            .and_then(|t| t.trim().parse::<i32>().ok())
            .unwrap_or(1);

        let Some(erp_id) = self.allocate_customer_id(customer_type).await? else {
            tracing::warn!("ERP did not allocate a customer id");
            return Ok(None);
        };

        self.save_customer(erp_id, customer_type, payload).await?;
        Ok(Some(erp_id))
    }

    async fn update_customer(&self, erp_id: i64, fields: &ErpPayload) -> Result<bool> {
        if fields.is_empty() {
            return Ok(true);
        }

        let customer_type = self.get_customer_type(erp_id).await?;
        self.save_customer(erp_id, customer_type, fields).await?;
        Ok(true)
    }
}
