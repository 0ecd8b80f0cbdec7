//! HTTP transport: script loading and event delivery
//!
//! The relay side stays synchronous. [`HttpTransport`] only pushes commands
//! onto a channel; a [`DeliveryWorker`] running on the tokio runtime turns
//! `event` commands into collect requests and retries transient failures.
//!
//! ```text
//! TransportGate ──call()──► HttpTransport ──mpsc──► DeliveryWorker ──GET──► {transport_url}/g/collect
//! ```

use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::shape::number_to_string;
use crate::types::{OutboundParams, ParamValue};

use super::gate::ScriptRequest;
use super::{TransportCommand, TransportHandle};

/// Collect host used when no `transport_url` was configured.
pub const PUBLIC_COLLECT_BASE: &str = "https://www.google-analytics.com";

/// Routing key attached by the relay; the collect request carries `tid` instead.
const ROUTING_KEY: &str = "send_to";

/// HTTP client for the script host and the collect endpoint
#[derive(Clone)]
pub struct CollectClient {
    http_client: reqwest::Client,
    client_id: String,
    max_retries: usize,
}

impl CollectClient {
    /// Create a new client from configuration
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("dlrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            http_client,
            client_id,
            max_retries: config.max_retries,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Fetch the transport script. Any non-success status is an error.
    pub async fn fetch_script(&self, url: &str) -> Result<()> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::TransportStatus {
                status: status.as_u16(),
                body: response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string()),
            })
        }
    }

    /// Send one event to `{collect_base}/g/collect`
    pub async fn send_event(
        &self,
        collect_base: &str,
        measurement_id: &str,
        name: &str,
        params: &OutboundParams,
    ) -> Result<()> {
        let query = encode_query(&collect_query(measurement_id, &self.client_id, name, params));
        let url = format!("{}/g/collect?{}", collect_base, query);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::TransportStatus {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Send with retry logic
    ///
    /// Retries transient failures (5xx, timeouts) with exponential backoff.
    /// Returns the number of retries it took.
    pub async fn send_event_with_retry(
        &self,
        collect_base: &str,
        measurement_id: &str,
        name: &str,
        params: &OutboundParams,
    ) -> Result<usize> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(500);

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying send_event (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    self.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }

            match self
                .send_event(collect_base, measurement_id, name, params)
                .await
            {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_transient() => {
                    tracing::warn!("Transient error sending event: {}", e);
                    last_error = Some(e);
                }
                // Non-retryable error, fail immediately
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Transport("max retries exceeded".to_string())))
    }
}

/// Query parameters for one collect request.
///
/// Strings and booleans go out as `ep.*`, numbers as `epn.*`; nulls and the
/// routing key are left out.
pub fn collect_query(
    measurement_id: &str,
    client_id: &str,
    name: &str,
    params: &OutboundParams,
) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("v".to_string(), "2".to_string()),
        ("tid".to_string(), measurement_id.to_string()),
        ("cid".to_string(), client_id.to_string()),
        ("en".to_string(), name.to_string()),
    ];

    for (key, value) in params.iter() {
        if key == ROUTING_KEY {
            continue;
        }
        match value {
            ParamValue::Null => {}
            ParamValue::Number(n) => pairs.push((format!("epn.{}", key), number_to_string(n))),
            ParamValue::Bool(b) => pairs.push((format!("ep.{}", key), b.to_string())),
            ParamValue::String(s) => pairs.push((format!("ep.{}", key), s.clone())),
        }
    }

    pairs
}

fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Delivery counters, returned when the worker stops
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Events the endpoint accepted
    pub events_sent: usize,
    /// Events dropped after a permanent failure or exhausted retries
    pub events_failed: usize,
    /// Events dropped because no `config` command had arrived yet
    pub events_skipped: usize,
    /// Extra attempts spent on transient failures
    pub retries: usize,
}

/// Transport handle backed by the delivery worker
pub struct HttpTransport {
    sender: UnboundedSender<TransportCommand>,
    client_id: String,
}

impl HttpTransport {
    /// Create the handle and the worker that serves it.
    ///
    /// The worker does nothing until spawned: `tokio::spawn(worker.run())`.
    pub fn new(client: CollectClient) -> (Self, DeliveryWorker) {
        let (sender, receiver) = unbounded_channel();
        let transport = Self {
            sender,
            client_id: client.client_id().to_string(),
        };
        let worker = DeliveryWorker {
            client,
            receiver,
            measurement_id: None,
            collect_base: PUBLIC_COLLECT_BASE.to_string(),
            stats: DeliveryStats::default(),
        };
        (transport, worker)
    }
}

impl TransportHandle for HttpTransport {
    fn call(&mut self, command: TransportCommand) {
        if let Err(e) = self.sender.send(command) {
            tracing::warn!(command = e.0.command(), "Delivery worker stopped, command dropped");
        }
    }

    fn kind(&self) -> &'static str {
        "http"
    }

    fn describe(&self) -> String {
        format!("http transport (client {})", self.client_id)
    }
}

/// Background task turning commands into collect requests
pub struct DeliveryWorker {
    client: CollectClient,
    receiver: UnboundedReceiver<TransportCommand>,
    measurement_id: Option<String>,
    collect_base: String,
    stats: DeliveryStats,
}

impl DeliveryWorker {
    /// Process commands until every sender is dropped.
    pub async fn run(mut self) -> DeliveryStats {
        while let Some(command) = self.receiver.recv().await {
            self.handle(command).await;
        }
        tracing::debug!(stats = ?self.stats, "Delivery worker finished");
        self.stats
    }

    async fn handle(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Js { at } => {
                tracing::debug!(at = %at, "Transport initialized");
            }
            TransportCommand::Config {
                measurement_id,
                settings,
            } => {
                if let Some(url) = settings.get("transport_url").and_then(ParamValue::as_str) {
                    self.collect_base = url.trim_end_matches('/').to_string();
                }
                tracing::debug!(
                    measurement_id = %measurement_id,
                    collect_base = %self.collect_base,
                    "Transport configured"
                );
                self.measurement_id = Some(measurement_id);
            }
            TransportCommand::Event { name, params } => {
                let Some(measurement_id) = self.measurement_id.as_deref() else {
                    tracing::warn!(event = %name, "Event before config, dropped");
                    self.stats.events_skipped += 1;
                    return;
                };

                match self
                    .client
                    .send_event_with_retry(&self.collect_base, measurement_id, &name, &params)
                    .await
                {
                    Ok(retries) => {
                        self.stats.events_sent += 1;
                        self.stats.retries += retries;
                    }
                    Err(e) => {
                        self.stats.events_failed += 1;
                        tracing::warn!(event = %name, error = %e, "Failed to deliver event");
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }
}

/// Loads the transport script over HTTP
#[derive(Clone)]
pub struct HttpScriptLoader {
    client: CollectClient,
}

impl HttpScriptLoader {
    pub fn new(client: CollectClient) -> Self {
        Self { client }
    }

    /// Fetch the script; on success hand back a transport and its worker.
    pub async fn load(&self, request: &ScriptRequest) -> Result<(HttpTransport, DeliveryWorker)> {
        self.client.fetch_script(&request.url).await?;
        tracing::info!(url = %request.url, "Transport script loaded");
        Ok(HttpTransport::new(self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn client() -> CollectClient {
        CollectClient::new(&TransportConfig {
            client_id: Some("555.1".to_string()),
            timeout_secs: 2,
            max_retries: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_client_id_defaults_to_random() {
        let a = CollectClient::new(&TransportConfig::default()).unwrap();
        let b = CollectClient::new(&TransportConfig::default()).unwrap();
        assert_ne!(a.client_id(), b.client_id());
        assert_eq!(client().client_id(), "555.1");
    }

    #[test]
    fn test_collect_query() {
        let mut params = OutboundParams::new();
        params.insert("value", ParamValue::Number(10.into()));
        params.insert("currency", ParamValue::from("EUR"));
        params.insert("non_interaction", ParamValue::Bool(true));
        params.insert("debug_mode", ParamValue::Null);
        params.insert("send_to", ParamValue::from("G-1"));

        let pairs = collect_query("G-1", "555.1", "purchase", &params);
        let rendered = encode_query(&pairs);
        assert_eq!(
            rendered,
            "v=2&tid=G-1&cid=555.1&en=purchase&epn.value=10&ep.currency=EUR&ep.non_interaction=true"
        );
    }

    #[test]
    fn test_encode_query_escapes() {
        let pairs = vec![("ep.datalayer".to_string(), r#"{"a":"b c"}"#.to_string())];
        assert_eq!(
            encode_query(&pairs),
            "ep.datalayer=%7B%22a%22%3A%22b%20c%22%7D"
        );
    }

    #[tokio::test]
    async fn test_worker_tracks_config_and_skips_early_events() {
        let (mut transport, worker) = HttpTransport::new(client());
        transport.call(TransportCommand::Event {
            name: "early".to_string(),
            params: OutboundParams::new(),
        });
        transport.call(TransportCommand::Js { at: Utc::now() });
        drop(transport);

        let stats = worker.run().await;
        assert_eq!(stats.events_skipped, 1);
        assert_eq!(stats.events_sent, 0);
    }

    #[tokio::test]
    async fn test_config_sets_collect_base() {
        let (_transport, mut worker) = HttpTransport::new(client());
        let mut settings = OutboundParams::new();
        settings.insert("transport_url", ParamValue::from("https://sst.example.com/"));

        worker
            .handle(TransportCommand::Config {
                measurement_id: "G-1".to_string(),
                settings,
            })
            .await;

        assert_eq!(worker.collect_base, "https://sst.example.com");
        assert_eq!(worker.measurement_id.as_deref(), Some("G-1"));
    }

    #[test]
    fn test_call_after_worker_dropped() {
        let (mut transport, worker) = HttpTransport::new(client());
        drop(worker);
        transport.call(TransportCommand::Js { at: Utc::now() });
        assert_eq!(transport.kind(), "http");
    }

    #[tokio::test]
    async fn test_load_failure_is_an_error() {
        let loader = HttpScriptLoader::new(client());
        let request = ScriptRequest {
            url: "http://127.0.0.1:9/gtag/js?id=G-1".to_string(),
        };
        assert!(loader.load(&request).await.is_err());
    }
}
