use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use fitlog_core::remote::{
    AffectedPayload, Collection, Filter, FiltersPayload, Query, RemoteStore, RowsPayload,
    UpdatePayload, UpsertPayload,
};

/// `RemoteStore` over the HTTP API served by `fitlog serve`.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "fitlog-cli/{} (fitness tracker)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn endpoint(&self, collection: Collection, verb: &str) -> String {
        format!("{}/api/collections/{collection}/{verb}", self.base_url)
    }

    async fn post<B, R>(&self, collection: Collection, verb: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = self.endpoint(collection, verb);
        let mut request = self.client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to reach remote store at {}", self.base_url))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| status.to_string());
            bail!("Remote {verb} on {collection} failed ({status}): {message}");
        }
        debug!(%collection, verb, %status, "remote call");

        resp.json()
            .await
            .with_context(|| format!("Failed to parse remote {verb} response"))
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Value>> {
        let payload: RowsPayload = self.post(collection, "select", query).await?;
        Ok(payload.rows)
    }

    async fn insert(&self, collection: Collection, rows: &[Value]) -> Result<()> {
        let body = RowsPayload {
            rows: rows.to_vec(),
        };
        let _: AffectedPayload = self.post(collection, "insert", &body).await?;
        Ok(())
    }

    async fn update(
        &self,
        collection: Collection,
        filters: &[Filter],
        patch: &Value,
    ) -> Result<u64> {
        let body = UpdatePayload {
            filters: filters.to_vec(),
            patch: patch.clone(),
        };
        let payload: AffectedPayload = self.post(collection, "update", &body).await?;
        Ok(payload.affected)
    }

    async fn upsert(
        &self,
        collection: Collection,
        rows: &[Value],
        conflict_keys: &[&str],
    ) -> Result<()> {
        let body = UpsertPayload {
            rows: rows.to_vec(),
            conflict_keys: conflict_keys.iter().map(|k| (*k).to_string()).collect(),
        };
        let _: AffectedPayload = self.post(collection, "upsert", &body).await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, filters: &[Filter]) -> Result<u64> {
        let body = FiltersPayload {
            filters: filters.to_vec(),
        };
        let payload: AffectedPayload = self.post(collection, "delete", &body).await?;
        Ok(payload.affected)
    }
}
