//! REST document store client.
//!
//! Talks to a realtime-database style REST API where every path is addressed
//! as `{base_url}/{path}.json`:
//!
//! | operation | request                          | response            |
//! |-----------|----------------------------------|---------------------|
//! | push      | `POST {collection}.json`         | `{"name": "<id>"}`  |
//! | update    | `PATCH {collection}/{id}.json`   | merged record       |
//! | delete    | `DELETE {collection}/{id}.json`  | `null`              |
//! | read      | `GET {collection}.json`          | `{id: record}` or `null` |
//!
//! Live views are produced by polling: the first read is always delivered,
//! later reads only when the collection changed. A failed read is delivered
//! as an error and ends the view.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{CollectionPath, Record, Snapshot};
use crate::store::{RemoteStore, Subscription};

/// Response body of a create request
#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

/// REST-backed [`RemoteStore`]
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
}

impl RestStore {
    /// Create a client for the store at `base_url`
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>, poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
            poll_interval,
        }
    }

    /// Create a client from the `store_url`, `auth_token` and poll interval of `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let base_url = config
            .store_url
            .as_deref()
            .ok_or_else(|| Error::config("store_url is not set"))?;
        Ok(Self::new(
            base_url,
            config.auth_token.clone(),
            config.poll_interval(),
        ))
    }

    fn url(&self, path: &CollectionPath, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{}/{path}/{id}.json", self.base_url),
            None => format!("{}/{path}.json", self.base_url),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token)]),
            None => builder,
        }
    }

    async fn fetch(&self, path: &CollectionPath) -> Result<Snapshot> {
        let response = self
            .request(Method::GET, &self.url(path, None))
            .send()
            .await
            .map_err(|e| Error::subscription(format!("failed to read {path}: {e}")))?;
        let response = check_status(response, "read").await.map_err(|e| match e {
            Error::Store(msg) => Error::Subscription(msg),
            other => other,
        })?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::subscription(format!("invalid response for {path}: {e}")))?;
        snapshot_from_body(body)
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn push(&self, path: &CollectionPath, value: Value) -> Result<String> {
        let response = self
            .request(Method::POST, &self.url(path, None))
            .json(&value)
            .send()
            .await
            .map_err(|e| Error::store(format!("failed to connect to store: {e}")))?;
        let response = check_status(response, "push").await?;
        let body: PushResponse = response
            .json()
            .await
            .map_err(|e| Error::store(format!("invalid push response: {e}")))?;
        debug!(path = %path, id = %body.name, "Record created");
        Ok(body.name)
    }

    async fn update(&self, path: &CollectionPath, id: &str, fields: Map<String, Value>) -> Result<()> {
        let response = self
            .request(Method::PATCH, &self.url(path, Some(id)))
            .json(&Value::Object(fields))
            .send()
            .await
            .map_err(|e| Error::store(format!("failed to connect to store: {e}")))?;
        check_status(response, "update").await?;
        debug!(path = %path, id, "Record updated");
        Ok(())
    }

    async fn delete(&self, path: &CollectionPath, id: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, &self.url(path, Some(id)))
            .send()
            .await
            .map_err(|e| Error::store(format!("failed to connect to store: {e}")))?;
        check_status(response, "delete").await?;
        debug!(path = %path, id, "Record deleted");
        Ok(())
    }

    async fn subscribe(&self, path: &CollectionPath) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let store = self.clone();
        let path = path.clone();

        tokio::spawn(async move {
            debug!(path = %path, interval = ?store.poll_interval, "Polling view started");
            let mut last: Option<Snapshot> = None;

            loop {
                match store.fetch(&path).await {
                    Ok(snapshot) => {
                        if last.as_ref() != Some(&snapshot) {
                            if tx.send(Ok(snapshot.clone())).is_err() {
                                break;
                            }
                            last = Some(snapshot);
                        }
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "Polling view failed");
                        let _ = tx.send(Err(e));
                        break;
                    }
                }

                tokio::select! {
                    _ = &mut cancel_rx => break,
                    () = tokio::time::sleep(store.poll_interval) => {}
                }
            }

            debug!(path = %path, "Polling view stopped");
        });

        Ok(Subscription::new(
            rx,
            Box::new(move || {
                let _ = cancel_tx.send(());
            }),
        ))
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(Error::store(format!("{what} failed: server returned {status}: {text}")))
}

/// Convert a collection read into records. `null` is an empty collection.
fn snapshot_from_body(body: Value) -> Result<Snapshot> {
    match body {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(id, data)| Record::new(id, data))
            .collect()),
        other => Err(Error::subscription(format!(
            "expected an object keyed by id, got {other}"
        ))),
    }
}
