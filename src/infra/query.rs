use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::infra::api::{Api, BackendError};

/// Query capability over the backend's relations. Each call builds one
/// request against `rest/v1/{table}`; filters and ordering are encoded as
/// query parameters the backend evaluates server-side.
#[derive(Clone)]
pub struct QueryClient {
    api: Api,
}

impl QueryClient {
    pub fn new(api: Api) -> Self {
        Self { api }
    }

    pub fn from(&self, table: &str) -> TableQuery {
        TableQuery {
            api: self.api.clone(),
            table: table.to_string(),
            select: "*".to_string(),
            filters: Vec::new(),
            order: None,
        }
    }
}

pub struct TableQuery {
    api: Api,
    table: String,
    select: String,
    filters: Vec<(String, String)>,
    order: Option<String>,
}

impl TableQuery {
    /// Restrict the selected columns (defaults to all).
    pub fn select(mut self, columns: &str) -> Self {
        self.select = columns.to_string();
        self
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters
            .push((column.to_string(), format!("eq.{}", value.to_string())));
        self
    }

    /// Membership filter. An empty id set matches no rows.
    pub fn in_list(mut self, column: &str, values: &[Uuid]) -> Self {
        let joined = values
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.filters
            .push((column.to_string(), format!("in.({})", joined)));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order = Some(format!("{}.desc", column));
        self
    }

    pub async fn fetch<T: DeserializeOwned>(self) -> Result<Vec<T>, BackendError> {
        let url = self.build_url(None)?;
        let response = self.api.request(Method::GET, url).send().await?;
        let response = Api::check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn fetch_one<T: DeserializeOwned>(self) -> Result<Option<T>, BackendError> {
        let url = self.build_url(Some(1))?;
        let response = self.api.request(Method::GET, url).send().await?;
        let response = Api::check(response).await?;
        let mut rows: Vec<T> = response.json().await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// Insert one row and return the stored representation (ids and
    /// timestamps are assigned by the backend).
    pub async fn insert<T, R>(self, row: &T) -> Result<R, BackendError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let url = self.build_url(None)?;
        let response = self
            .api
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;
        let response = Api::check(response).await?;
        let mut rows: Vec<R> = response.json().await?;
        if rows.is_empty() {
            return Err(BackendError::Request(
                "insert returned no representation".to_string(),
            ));
        }
        Ok(rows.remove(0))
    }

    /// Delete every row matching the accumulated filters.
    pub async fn delete(self) -> Result<(), BackendError> {
        if self.filters.is_empty() {
            return Err(BackendError::Request(
                "refusing to delete without a filter".to_string(),
            ));
        }
        let url = self.build_url(None)?;
        let response = self.api.request(Method::DELETE, url).send().await?;
        Api::check(response).await?;
        Ok(())
    }

    fn build_url(&self, limit: Option<u32>) -> Result<url::Url, BackendError> {
        let mut url = self.api.endpoint(&format!("rest/v1/{}", self.table))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", &self.select);
            for (column, predicate) in &self.filters {
                pairs.append_pair(column, predicate);
            }
            if let Some(order) = &self.order {
                pairs.append_pair("order", order);
            }
            if let Some(limit) = limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }
}
