//! Marker mediator
//!
//! Sits between source plugins (which publish markers) and sink plugins (which
//! subscribe to them). One mediator exists per broadcast session and is shared
//! by reference with every plugin.
//!
//! **Delivery lanes:**
//! - Instant: fan-out happens inside `publish`, before it returns.
//! - Delayed: fan-out happens on a spawned task after `broadcast_delay`, so
//!   sinks can line up with what listeners actually hear.
//!
//! **Backpressure:** `publish` never waits on a sink. A subscriber whose queue
//! has reached the queue limit is sent the termination sentinel instead of the
//! marker and receives nothing further (it has been disconnected).
//!
//! **Ordering:** per subscriber, instant-lane delivery follows publish order.
//! Each delayed fan-out is an independent task, so delayed-lane order across
//! markers published very close together is not guaranteed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::seconds_to_duration;
use crate::marker::{Marker, MarkerType};
use crate::queue::{self, QueueSender, SubscriberQueue};
use crate::{Error, Result};

/// Default backlog at which a subscriber is disconnected
pub const QUEUE_MAX: usize = 100;

/// Which delivery path a subscription uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Delivered as soon as the marker is published
    Instant,
    /// Delivered after the mediator's broadcast delay
    Delayed,
}

impl Lane {
    /// Lane for a plugin's boolean `delayed` setting
    pub fn select(delayed: bool) -> Self {
        if delayed {
            Lane::Delayed
        } else {
            Lane::Instant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Instant => "instant",
            Lane::Delayed => "delayed",
        }
    }
}

/// Mediator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediatorState {
    /// No marker accepted yet
    Created,
    /// At least one marker accepted; the time origin is fixed
    Running,
    /// `terminate` has been called; there is no way back
    Terminated,
}

/// Per-lane registry: marker type → subscriber queues
struct ChannelRegistry {
    lane: Lane,
    queue_max: usize,
    channels: RwLock<HashMap<MarkerType, Vec<QueueSender>>>,
    /// Set (under the write lock) by `terminate_all`; refuses new queues
    closed: AtomicBool,
}

impl ChannelRegistry {
    fn new(lane: Lane, queue_max: usize) -> Self {
        Self {
            lane,
            queue_max,
            channels: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Add one queue under every listed type
    ///
    /// The per-type list is created under the write lock if it is missing, so
    /// two first-time subscribers cannot race to create duplicate lists.
    fn register(&self, marker_types: &[MarkerType], sender: &QueueSender) -> Result<()> {
        let mut channels = self.channels.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        for marker_type in marker_types {
            channels
                .entry(*marker_type)
                .or_default()
                .push(sender.clone());
        }
        Ok(())
    }

    /// Deliver a marker to every live queue registered for its type
    fn fan_out(&self, marker_type: MarkerType, marker: &Arc<Marker>) {
        if self.closed.load(Ordering::Acquire) {
            debug!(lane = self.lane.as_str(), "Registry closed, dropping marker");
            return;
        }

        // Snapshot so queue writes happen outside the registry lock
        let queues = match self.channels.read().get(&marker_type) {
            Some(queues) => queues.clone(),
            None => return,
        };

        debug!(
            lane = self.lane.as_str(),
            %marker_type,
            subscribers = queues.len(),
            "Pushing marker to queues"
        );

        let mut saw_dead = false;
        for queue in &queues {
            if queue.len() >= self.queue_max {
                if queue.disconnect() {
                    warn!(
                        lane = self.lane.as_str(),
                        %marker_type,
                        backlog = queue.len(),
                        "Subscriber fell too far behind, disconnecting it"
                    );
                }
                saw_dead = true;
                continue;
            }
            if !queue.push_marker(Arc::clone(marker)) {
                saw_dead = true;
            }
        }

        if saw_dead {
            self.prune();
        }
    }

    /// Drop queues whose reader is gone or that were disconnected
    fn prune(&self) {
        let mut channels = self.channels.write();
        for queues in channels.values_mut() {
            queues.retain(|queue| !queue.is_dead());
        }
    }

    /// Push a sentinel into every registered queue and refuse new ones
    fn terminate_all(&self) {
        let channels = self.channels.write();
        self.closed.store(true, Ordering::Release);
        for (marker_type, queues) in channels.iter() {
            info!(
                lane = self.lane.as_str(),
                %marker_type,
                subscribers = queues.len(),
                "Terminating channel"
            );
            for queue in queues {
                queue.push_sentinel();
            }
        }
    }

    fn live_count(&self, marker_type: MarkerType) -> usize {
        self.channels
            .read()
            .get(&marker_type)
            .map(|queues| queues.iter().filter(|q| !q.is_dead()).count())
            .unwrap_or(0)
    }
}

/// Publish/subscribe broadcaster between marker sources and sinks
///
/// # Example
/// ```rust,ignore
/// use markcast_common::{Lane, Marker, MarkerType, Mediator};
///
/// let mediator = Mediator::new(15.0)?;
/// let mut queue = mediator.subscribe(&[MarkerType::Track], "NowPlayingFile", Lane::Instant)?;
/// mediator.publish(MarkerType::Track, Marker::new("Justice — Fire")?)?;
/// let marker = queue.listen().await?;
/// ```
pub struct Mediator {
    broadcast_delay: Duration,
    first_time: OnceLock<Instant>,
    instant: Arc<ChannelRegistry>,
    delayed: Arc<ChannelRegistry>,
    /// Subscriber id → queue, for targeted shutdown
    subscribers: RwLock<HashMap<String, QueueSender>>,
    squelch_next: AtomicBool,
    stopped: AtomicBool,
    terminated: AtomicBool,
    runtime: Handle,
}

impl Mediator {
    /// Create a mediator with the default queue limit
    ///
    /// # Arguments
    /// * `broadcast_delay` - Seconds the delayed lane lags the instant lane
    ///
    /// # Errors
    /// `InvalidArgument` for a negative, non-finite or out-of-range delay; `InvalidState`
    /// when called outside a tokio runtime (the delayed lane needs one).
    pub fn new(broadcast_delay: f64) -> Result<Self> {
        Self::with_queue_max(broadcast_delay, QUEUE_MAX)
    }

    /// Create a mediator with an explicit queue limit
    pub fn with_queue_max(broadcast_delay: f64, queue_max: usize) -> Result<Self> {
        let delay = seconds_to_duration(broadcast_delay).map_err(|problem| {
            Error::InvalidArgument(format!("broadcast delay {problem}, got {broadcast_delay}"))
        })?;
        if queue_max == 0 {
            return Err(Error::InvalidArgument(
                "queue limit must be at least 1".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidState("mediator must be created inside a tokio runtime".to_string())
        })?;

        info!(broadcast_delay, queue_max, "Mediator created");

        Ok(Self {
            broadcast_delay: delay,
            first_time: OnceLock::new(),
            instant: Arc::new(ChannelRegistry::new(Lane::Instant, queue_max)),
            delayed: Arc::new(ChannelRegistry::new(Lane::Delayed, queue_max)),
            subscribers: RwLock::new(HashMap::new()),
            squelch_next: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            runtime,
        })
    }

    /// Publish a marker to every subscriber of its type
    ///
    /// Stamps the marker with seconds since the first accepted marker,
    /// delivers it to instant subscribers, and schedules delivery to delayed
    /// subscribers. Never waits on a subscriber.
    ///
    /// A pending squelch swallows this marker (and clears itself); while
    /// stopped or after termination every marker is swallowed. Swallowed
    /// markers get no timestamp and reach nobody.
    ///
    /// # Errors
    /// `InvalidArgument` for a marker with an empty label.
    pub fn publish(&self, marker_type: MarkerType, mut marker: Marker) -> Result<()> {
        if marker.label().is_empty() {
            return Err(Error::InvalidArgument(
                "cannot publish a marker with an empty label".to_string(),
            ));
        }
        info!(%marker_type, marker = %marker, "Received new marker");

        if self.squelch_next.swap(false, Ordering::AcqRel) {
            info!("Ignoring marker because squelch");
            return Ok(());
        }
        if self.stopped.load(Ordering::Acquire) {
            debug!("Ignoring marker because stopped");
            return Ok(());
        }
        if self.terminated.load(Ordering::Acquire) {
            debug!("Ignoring marker because mediator terminated");
            return Ok(());
        }

        let first_time = *self.first_time.get_or_init(|| {
            debug!("First marker, fixing time origin");
            Instant::now()
        });
        marker.assign_time(first_time.elapsed().as_secs_f64());
        let marker = Arc::new(marker);

        let delayed = Arc::clone(&self.delayed);
        let delayed_marker = Arc::clone(&marker);
        let delay = self.broadcast_delay;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            delayed.fan_out(marker_type, &delayed_marker);
        });
        debug!(delay_secs = delay.as_secs_f64(), "Broadcast delay started");

        self.instant.fan_out(marker_type, &marker);
        Ok(())
    }

    /// Subscribe to every listed marker type on one lane
    ///
    /// The returned queue sees only markers published after this call.
    ///
    /// # Arguments
    /// * `marker_types` - Types to receive (duplicates are ignored)
    /// * `subscriber` - Session-unique id, by convention the plugin name
    /// * `lane` - Instant or delayed delivery, for all listed types
    ///
    /// # Errors
    /// - `InvalidArgument` for an empty type list or empty id
    /// - `DuplicateSubscriber` if the id already owns a live queue
    /// - `Terminated` after `terminate`
    pub fn subscribe(
        &self,
        marker_types: &[MarkerType],
        subscriber: &str,
        lane: Lane,
    ) -> Result<SubscriberQueue> {
        if marker_types.is_empty() {
            return Err(Error::InvalidArgument(
                "subscription needs at least one marker type".to_string(),
            ));
        }
        if subscriber.is_empty() {
            return Err(Error::InvalidArgument(
                "subscriber id must not be empty".to_string(),
            ));
        }
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }

        let mut seen = HashSet::new();
        let marker_types: Vec<MarkerType> = marker_types
            .iter()
            .copied()
            .filter(|t| seen.insert(*t))
            .collect();

        // Lock order: subscriber map, then lane registry
        let mut subscribers = self.subscribers.write();
        if let Some(existing) = subscribers.get(subscriber) {
            if !existing.is_dead() {
                return Err(Error::DuplicateSubscriber(subscriber.to_string()));
            }
        }

        let (sender, queue) = queue::channel();
        self.registry(lane).register(&marker_types, &sender)?;
        subscribers.insert(subscriber.to_string(), sender);

        info!(
            subscriber,
            lane = lane.as_str(),
            marker_types = ?marker_types,
            "New subscriber"
        );
        Ok(queue)
    }

    /// Close every subscriber queue
    ///
    /// Pushes one sentinel into every queue of both lanes; every blocked or
    /// future listen then reports `Unsubscribed` after draining what was
    /// already queued. Does not wait for consumers. Calling again pushes
    /// extra sentinels, which retired queues ignore.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.instant.terminate_all();
        self.delayed.terminate_all();
        info!("Mediator terminated");
    }

    /// Close the queue of one subscriber
    ///
    /// # Errors
    /// `UnknownSubscriber` if no queue was registered under the id.
    pub fn close_subscriber(&self, subscriber: &str) -> Result<()> {
        let subscribers = self.subscribers.read();
        let sender = subscribers
            .get(subscriber)
            .ok_or_else(|| Error::UnknownSubscriber(subscriber.to_string()))?;
        sender.disconnect();
        info!(subscriber, "Closed subscriber queue");
        Ok(())
    }

    /// Swallow the next published marker
    pub fn squelch_next(&self) {
        self.squelch_next.store(true, Ordering::Release);
        info!("Next marker will be squelched");
    }

    /// Swallow every published marker until `start`
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        info!("Marker relay stopped");
    }

    /// Resume relaying markers after `stop`
    pub fn start(&self) {
        self.stopped.store(false, Ordering::Release);
        info!("Marker relay started");
    }

    pub fn is_squelching(&self) -> bool {
        self.squelch_next.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn state(&self) -> MediatorState {
        if self.terminated.load(Ordering::Acquire) {
            MediatorState::Terminated
        } else if self.first_time.get().is_some() {
            MediatorState::Running
        } else {
            MediatorState::Created
        }
    }

    pub fn broadcast_delay(&self) -> Duration {
        self.broadcast_delay
    }

    /// Live subscribers for a type on a lane
    pub fn subscriber_count(&self, marker_type: MarkerType, lane: Lane) -> usize {
        self.registry(lane).live_count(marker_type)
    }

    fn registry(&self, lane: Lane) -> &ChannelRegistry {
        match lane {
            Lane::Instant => &self.instant,
            Lane::Delayed => &self.delayed,
        }
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("broadcast_delay", &self.broadcast_delay)
            .field("state", &self.state())
            .field("stopped", &self.is_stopped())
            .field("squelching", &self.is_squelching())
            .finish()
    }
}
