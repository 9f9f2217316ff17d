//! HTTP publisher.
//!
//! Posts measurement points one at a time to a configured endpoint on a
//! cadence. Each point is retried up to the configured count; when a point
//! still cannot be delivered it is requeued at the head and the cycle
//! breaks, so nothing is lost and ordering is preserved.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use fieldgate_core::{DataQueue, HttpMethod, HttpSettings, MeasurementPoint};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cycle::{drain, HTTP_CYCLE_CAP};
use crate::error::{CloudError, Result};

/// HTTP egress publisher.
pub struct HttpPublisher {
    settings: Arc<RwLock<HttpSettings>>,
    data_queue: Arc<DataQueue>,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

fn build_client(settings: &HttpSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(settings.timeout_ms.max(1)))
        .build()
        .map_err(|e| CloudError::Config(e.to_string()))
}

fn build_headers(settings: &HttpSettings) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in &settings.headers {
        match (HeaderName::from_str(key), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %key, "skipping invalid header"),
        }
    }
    headers
}

/// Send one point, without retry.
async fn send_once(
    client: &reqwest::Client,
    settings: &HttpSettings,
    headers: &HeaderMap,
    point: &MeasurementPoint,
) -> Result<()> {
    let request = match settings.method {
        HttpMethod::Post => client.post(&settings.endpoint_url),
        HttpMethod::Put => client.put(&settings.endpoint_url),
        HttpMethod::Patch => client.patch(&settings.endpoint_url),
    };
    let response = request
        .headers(headers.clone())
        .json(point)
        .send()
        .await
        .map_err(|e| CloudError::HttpNetwork(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(CloudError::HttpStatus(status.as_u16()))
    }
}

/// Send one point with the configured retry budget.
async fn send_with_retry(
    client: &reqwest::Client,
    settings: &HttpSettings,
    headers: &HeaderMap,
    point: &MeasurementPoint,
) -> Result<()> {
    let attempts = settings.retry.max(1);
    let mut last_err = CloudError::HttpNetwork("no attempt made".to_string());
    for attempt in 1..=attempts {
        match send_once(client, settings, headers, point).await {
            Ok(()) => return Ok(()),
            Err(CloudError::HttpStatus(code)) if (400..500).contains(&code) => {
                // Client errors do not heal on retry.
                return Err(CloudError::HttpStatus(code));
            }
            Err(e) => {
                debug!(attempt, "HTTP send failed: {}", e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

impl HttpPublisher {
    pub fn new(settings: HttpSettings, data_queue: Arc<DataQueue>) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            data_queue,
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        }
    }

    /// Replace the settings and restart the cadence task if it was running.
    pub async fn reload(self: &Arc<Self>, settings: HttpSettings) {
        let was_running = *self.running.read().await;
        if was_running {
            self.stop().await;
        }
        *self.settings.write().await = settings;
        if was_running {
            self.start().await;
        }
    }

    /// One publish cycle: drain up to the cap, deliver in order, requeue
    /// the remainder at the head on failure. Public so tests can drive it
    /// without the cadence task.
    pub async fn flush_once(&self) -> Result<usize> {
        let settings = self.settings.read().await.clone();
        if settings.endpoint_url.is_empty() {
            return Err(CloudError::Config("endpoint_url is empty".to_string()));
        }
        let client = build_client(&settings)?;
        let headers = build_headers(&settings);

        let mut points = drain(&self.data_queue, HTTP_CYCLE_CAP).await;
        let mut delivered = 0;
        while !points.is_empty() {
            let point = points.remove(0);
            match send_with_retry(&client, &settings, &headers, &point).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(register_id = %point.register_id, "delivery failed, requeueing: {}", e);
                    // Head-requeue the failed point, then the rest in order.
                    for undelivered in points.into_iter().rev() {
                        self.data_queue.requeue_front(undelivered).await.ok();
                    }
                    self.data_queue.requeue_front(point).await.ok();
                    return Err(e);
                }
            }
        }
        Ok(delivered)
    }

    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }
        let settings = self.settings.read().await.clone();
        if !settings.enabled || settings.endpoint_url.is_empty() {
            info!("HTTP publisher disabled by configuration");
            *self.running.write().await = false;
            return;
        }

        let interval = settings.interval_unit.to_duration(settings.interval.max(1));
        let running = self.running.clone();
        let publisher = self.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if !*running.read().await {
                    break;
                }
                tick.tick().await;

                match publisher.flush_once().await {
                    Ok(delivered) if delivered > 0 => {
                        debug!(delivered, "publish cycle complete")
                    }
                    Ok(_) => {}
                    Err(e) => warn!("publish cycle failed: {}", e),
                }
            }
            debug!("HTTP publisher task exited");
        });

        let mut task = self.task.write().await;
        *task = Some(handle);
        info!(endpoint = %settings.endpoint_url, "HTTP publisher started");
    }

    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        info!("HTTP publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn point(register_id: &str, value: f64) -> MeasurementPoint {
        MeasurementPoint {
            timestamp: 1_700_000_000,
            device_id: "A3F2C1".to_string(),
            device_name: "M1".to_string(),
            register_id: register_id.to_string(),
            register_name: register_id.to_string(),
            value,
            unit: String::new(),
            description: String::new(),
        }
    }

    /// Minimal HTTP endpoint answering every request with the given status.
    async fn spawn_endpoint(status_line: &'static str) -> (String, JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut served = 0usize;
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response =
                    format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
                let _ = socket.write_all(response.as_bytes()).await;
                served += 1;
                if served >= 16 {
                    break;
                }
            }
            served
        });
        (format!("http://{}/ingest", addr), handle)
    }

    fn settings(endpoint: String) -> HttpSettings {
        HttpSettings {
            enabled: true,
            endpoint_url: endpoint,
            retry: 1,
            timeout_ms: 2_000,
            ..HttpSettings::default()
        }
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order() {
        let (endpoint, _server) = spawn_endpoint("HTTP/1.1 200 OK").await;
        let queue = Arc::new(DataQueue::new());
        queue.enqueue(point("r1", 1.0)).await.unwrap();
        queue.enqueue(point("r2", 2.0)).await.unwrap();

        let publisher = HttpPublisher::new(settings(endpoint), queue.clone());
        let delivered = publisher.flush_once().await.unwrap();
        assert_eq!(delivered, 2);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_requeues_at_head() {
        let (endpoint, _server) = spawn_endpoint("HTTP/1.1 503 Service Unavailable").await;
        let queue = Arc::new(DataQueue::new());
        queue.enqueue(point("r1", 1.0)).await.unwrap();
        queue.enqueue(point("r2", 2.0)).await.unwrap();

        let publisher = HttpPublisher::new(settings(endpoint), queue.clone());
        assert!(publisher.flush_once().await.is_err());

        // Both points stay queued, original order preserved.
        assert_eq!(queue.len().await.unwrap(), 2);
        assert_eq!(queue.peek().await.unwrap().unwrap().register_id, "r1");
    }

    #[tokio::test]
    async fn test_4xx_fails_without_retry_loop() {
        let (endpoint, server) = spawn_endpoint("HTTP/1.1 400 Bad Request").await;
        let queue = Arc::new(DataQueue::new());
        queue.enqueue(point("r1", 1.0)).await.unwrap();

        let mut cfg = settings(endpoint);
        cfg.retry = 3;
        let publisher = HttpPublisher::new(cfg, queue.clone());
        assert!(publisher.flush_once().await.is_err());
        // A client error must not burn the whole retry budget.
        drop(publisher);
        server.abort();
    }

    #[tokio::test]
    async fn test_empty_endpoint_rejected() {
        let queue = Arc::new(DataQueue::new());
        let publisher = HttpPublisher::new(HttpSettings::default(), queue);
        assert!(matches!(
            publisher.flush_once().await,
            Err(CloudError::Config(_))
        ));
    }
}
