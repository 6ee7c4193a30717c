// =============================================================================
// Display ownership
// =============================================================================
//
// One display binds a subscription handle, a symbol processor, an editable
// config, and an outbound snapshot slot. Each display runs as its own task:
// feed events arrive through a bounded ingress queue, snapshots leave through
// a `watch` channel whose latest-value semantics give the renderer natural
// coalescing. Teardown is guaranteed on every exit path — the subscription
// guard releases the symbol refcount when the task ends, however it ends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::FeedError;
use crate::feed::ingress::{self, EventReceiver, FeedEvent};
use crate::feed::manager::{FeedHandle, SubscriptionGuard};
use crate::processor::{StateSnapshot, SymbolProcessor};
use crate::runtime_config::DisplayConfig;

/// Latest state for one display, published through the watch channel. Errors
/// that arrive before the processor exists (snapshot timeout, connection
/// loss) surface at the top level; once a processor runs, errors ride inside
/// the snapshot itself.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayUpdate {
    pub display_id: Uuid,
    pub symbol: String,
    pub snapshot: Option<StateSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FeedError>,
}

impl DisplayUpdate {
    fn empty(display_id: Uuid, symbol: &str) -> Self {
        Self {
            display_id,
            symbol: symbol.to_string(),
            snapshot: None,
            error: None,
        }
    }
}

/// Summary row for the display listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayInfo {
    pub id: Uuid,
    pub symbol: String,
    pub ready: bool,
    pub config: DisplayConfig,
}

enum DisplayControl {
    ConfigChanged,
    Stop,
}

struct DisplayEntry {
    symbol: String,
    config: Arc<RwLock<DisplayConfig>>,
    update_tx: Arc<watch::Sender<DisplayUpdate>>,
    ctrl_tx: mpsc::UnboundedSender<DisplayControl>,
    task: JoinHandle<()>,
}

/// Registry of live displays; creates, reconfigures, and destroys them.
pub struct DisplayManager {
    feed: FeedHandle,
    ingress_capacity: usize,
    default_config: DisplayConfig,
    displays: RwLock<HashMap<Uuid, DisplayEntry>>,
}

impl DisplayManager {
    pub fn new(feed: FeedHandle, default_config: DisplayConfig, ingress_capacity: usize) -> Self {
        Self {
            feed,
            ingress_capacity,
            default_config,
            displays: RwLock::new(HashMap::new()),
        }
    }

    /// Create a display pinned to `symbol`. Subscribes to the feed and starts
    /// the processing pipeline; snapshots flow once the instrument snapshot
    /// arrives.
    pub fn create_display(&self, symbol: &str, config: Option<DisplayConfig>) -> Uuid {
        let id = Uuid::new_v4();
        let config = Arc::new(RwLock::new(
            config.unwrap_or_else(|| self.default_config.clone()),
        ));
        let (update_tx, _update_rx) = watch::channel(DisplayUpdate::empty(id, symbol));
        let update_tx = Arc::new(update_tx);

        let (ctrl_tx, task) = self.spawn_pipeline(id, symbol, config.clone(), update_tx.clone());

        self.displays.write().insert(
            id,
            DisplayEntry {
                symbol: symbol.to_string(),
                config,
                update_tx,
                ctrl_tx,
                task,
            },
        );
        info!(display = %id, symbol = %symbol, "display created");
        id
    }

    fn spawn_pipeline(
        &self,
        id: Uuid,
        symbol: &str,
        config: Arc<RwLock<DisplayConfig>>,
        update_tx: Arc<watch::Sender<DisplayUpdate>>,
    ) -> (mpsc::UnboundedSender<DisplayControl>, JoinHandle<()>) {
        let (event_tx, event_rx) =
            ingress::channel(self.ingress_capacity, self.feed.dropped_tick_counter());
        let guard = self.feed.subscribe(symbol, event_tx);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_display(
            id,
            symbol.to_string(),
            config,
            guard,
            event_rx,
            update_tx,
            ctrl_rx,
        ));
        (ctrl_tx, task)
    }

    /// Destroy a display: stop its task, release the subscription, close the
    /// snapshot channel. Idempotent for unknown ids.
    pub async fn destroy_display(&self, id: Uuid) -> bool {
        let Some(entry) = self.displays.write().remove(&id) else {
            return false;
        };
        let _ = entry.ctrl_tx.send(DisplayControl::Stop);
        if entry.task.await.is_err() {
            warn!(display = %id, "display task ended abnormally");
        }
        info!(display = %id, "display destroyed");
        true
    }

    /// Replace the display's config. Processor options apply on the next
    /// tick; geometry changes only affect the derived rendering context.
    pub fn update_config(&self, id: Uuid, config: DisplayConfig) -> bool {
        let displays = self.displays.read();
        let Some(entry) = displays.get(&id) else {
            return false;
        };
        *entry.config.write() = config;
        let _ = entry.ctrl_tx.send(DisplayControl::ConfigChanged);
        true
    }

    /// Re-pin the display to a different instrument: the old pipeline stops
    /// (releasing its subscription), then a fresh processor takes over the
    /// same snapshot channel.
    pub async fn change_symbol(&self, id: Uuid, symbol: &str) -> bool {
        // Stop the old pipeline first so its final publish cannot race the
        // reset below.
        let old_task = {
            let mut displays = self.displays.write();
            let Some(entry) = displays.get_mut(&id) else {
                return false;
            };
            let _ = entry.ctrl_tx.send(DisplayControl::Stop);
            let parked = tokio::spawn(async {});
            std::mem::replace(&mut entry.task, parked)
        };
        if old_task.await.is_err() {
            warn!(display = %id, "previous display task ended abnormally");
        }

        let mut displays = self.displays.write();
        let Some(entry) = displays.get_mut(&id) else {
            return false;
        };
        entry.update_tx.send_replace(DisplayUpdate::empty(id, symbol));
        let (ctrl_tx, task) =
            self.spawn_pipeline(id, symbol, entry.config.clone(), entry.update_tx.clone());
        entry.symbol = symbol.to_string();
        entry.ctrl_tx = ctrl_tx;
        let parked = std::mem::replace(&mut entry.task, task);
        parked.abort();
        info!(display = %id, symbol = %symbol, "display re-pinned");
        true
    }

    pub fn list(&self) -> Vec<DisplayInfo> {
        self.displays
            .read()
            .iter()
            .map(|(id, entry)| DisplayInfo {
                id: *id,
                symbol: entry.symbol.clone(),
                ready: entry
                    .update_tx
                    .borrow()
                    .snapshot
                    .as_ref()
                    .map(|s| s.ready)
                    .unwrap_or(false),
                config: entry.config.read().clone(),
            })
            .collect()
    }

    pub fn config_of(&self, id: Uuid) -> Option<DisplayConfig> {
        self.displays
            .read()
            .get(&id)
            .map(|entry| entry.config.read().clone())
    }

    /// Subscribe to a display's snapshot stream.
    pub fn watch(&self, id: Uuid) -> Option<watch::Receiver<DisplayUpdate>> {
        self.displays
            .read()
            .get(&id)
            .map(|entry| entry.update_tx.subscribe())
    }

    pub fn count(&self) -> usize {
        self.displays.read().len()
    }

    /// Stop every display. Called during engine shutdown.
    pub async fn shutdown_all(&self) {
        let entries: Vec<DisplayEntry> = self.displays.write().drain().map(|(_, e)| e).collect();
        for entry in entries {
            let _ = entry.ctrl_tx.send(DisplayControl::Stop);
            let _ = entry.task.await;
        }
    }
}

/// The per-display pipeline: consume feed events, drive the processor,
/// publish rate-limited snapshots. Holding the subscription guard here ties
/// the symbol refcount to the task lifetime.
async fn run_display(
    id: Uuid,
    symbol: String,
    config: Arc<RwLock<DisplayConfig>>,
    guard: SubscriptionGuard,
    mut events: EventReceiver,
    update_tx: Arc<watch::Sender<DisplayUpdate>>,
    mut ctrl_rx: mpsc::UnboundedReceiver<DisplayControl>,
) {
    let mut processor: Option<SymbolProcessor> = None;
    info!(display = %id, symbol = %symbol, "display pipeline started");

    loop {
        tokio::select! {
            ctrl = ctrl_rx.recv() => match ctrl {
                None | Some(DisplayControl::Stop) => break,
                Some(DisplayControl::ConfigChanged) => {
                    if let Some(proc) = processor.as_mut() {
                        proc.update_settings(config.read().processor_settings());
                        publish(&update_tx, id, &symbol, proc.snapshot());
                    }
                }
            },

            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    FeedEvent::Initialized(frame) => {
                        let settings = config.read().processor_settings();
                        let descriptor = frame.to_descriptor();
                        let initial_price = frame
                            .m1_candles
                            .last()
                            .map(|c| c.c)
                            .unwrap_or(frame.todays_open);
                        match SymbolProcessor::initialize(
                            descriptor,
                            initial_price,
                            &frame.m1_candles,
                            settings,
                        ) {
                            Ok(proc) => {
                                publish(&update_tx, id, &symbol, proc.snapshot());
                                processor = Some(proc);
                            }
                            Err(e) => {
                                error!(display = %id, symbol = %symbol, error = %e, "processor init failed");
                                update_tx.send_modify(|update| {
                                    update.error = Some(FeedError::Internal {
                                        detail: format!("processor init failed: {e}"),
                                    });
                                });
                            }
                        }
                    }

                    FeedEvent::Tick(tick) => {
                        if let Some(proc) = processor.as_mut() {
                            if let Some(snapshot) = proc.on_tick(&tick) {
                                publish(&update_tx, id, &symbol, snapshot);
                            }
                            if proc.is_shut_down() {
                                // Internal invariant failure already published
                                // its final snapshot; stop the pipeline.
                                break;
                            }
                        }
                    }

                    FeedEvent::Error(err) => {
                        let fatal = err.is_fatal();
                        match processor.as_mut() {
                            Some(proc) => {
                                proc.set_error(Some(err));
                                publish(&update_tx, id, &symbol, proc.snapshot());
                                if fatal {
                                    proc.shutdown();
                                    break;
                                }
                            }
                            None => {
                                warn!(display = %id, symbol = %symbol, error = %err, "feed error before init");
                                update_tx.send_modify(|update| update.error = Some(err));
                                if fatal {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    if let Some(proc) = processor.as_mut() {
        proc.shutdown();
    }
    drop(guard);
    info!(display = %id, "display pipeline stopped");
}

fn publish(
    update_tx: &watch::Sender<DisplayUpdate>,
    id: Uuid,
    symbol: &str,
    snapshot: StateSnapshot,
) {
    update_tx.send_replace(DisplayUpdate {
        display_id: id,
        symbol: symbol.to_string(),
        snapshot: Some(snapshot),
        error: None,
    });
}

// =============================================================================
// Tests
// =============================================================================
