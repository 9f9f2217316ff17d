//! Streaming worker.
//!
//! While a device is being streamed, the polling drivers copy each of its
//! measurement points into the stream queue. This worker drains that queue
//! and pushes every point to the client as a notification, sharing the
//! transmission mutex with command responses. After `stream_stop` the
//! worker drains whatever is left on its next tick and goes idle.

use std::sync::Arc;
use std::time::Duration;

use fieldgate_core::DataQueue;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::ConfigTransport;

/// Drain cadence.
const STREAM_TICK_MS: u64 = 100;

/// Stream-queue drain worker.
pub struct StreamWorker {
    stream_queue: Arc<DataQueue>,
    transport: Arc<ConfigTransport>,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl StreamWorker {
    pub fn new(stream_queue: Arc<DataQueue>, transport: Arc<ConfigTransport>) -> Self {
        Self {
            stream_queue,
            transport,
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        }
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let stream_queue = self.stream_queue.clone();
        let transport = self.transport.clone();
        let running_flag = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(STREAM_TICK_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if !*running_flag.read().await {
                    break;
                }
                tick.tick().await;

                loop {
                    let point = match stream_queue.dequeue().await {
                        Ok(Some(point)) => point,
                        Ok(None) => break,
                        Err(e) => {
                            debug!("stream queue busy: {}", e);
                            break;
                        }
                    };
                    let notification = json!({"type": "stream_data", "data": point});
                    if let Err(e) = transport.send_json(&notification).await {
                        warn!("stream notification failed: {}", e);
                        break;
                    }
                }
            }
            debug!("stream worker exited");
        });

        let mut task = self.task.write().await;
        *task = Some(handle);
        info!("stream worker started");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);
        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        info!("stream worker stopped");
    }
}
