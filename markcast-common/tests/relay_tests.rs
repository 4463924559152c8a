//! Relay tests: sources and sinks running as plugins around one mediator
//!
//! Exercises the mediator, queues and plugin lifecycle together the way the
//! binary wires them: every plugin on its own task, shutdown through
//! `terminate` followed by `deactivate` and `join`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use markcast_common::{
    Error, Lane, Marker, MarkerType, Mediator, Plugin, PluginControl, PluginHandle, PluginKind,
    PluginState, Result,
};
use parking_lot::Mutex;

/// Publishes a fixed list of labels, then idles until told to stop
struct ScriptedSource {
    mediator: Arc<Mediator>,
    labels: Vec<&'static str>,
}

#[async_trait]
impl Plugin for ScriptedSource {
    fn name(&self) -> &str {
        "ScriptedSource"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Source
    }

    async fn run(&mut self, control: PluginControl) -> Result<()> {
        for label in &self.labels {
            self.mediator
                .publish(MarkerType::Track, Marker::new(*label)?)?;
        }
        control.cancelled().await;
        Ok(())
    }
}

/// Records every marker it sees, the way file sinks consume their queue
struct RecordingSink {
    name: String,
    mediator: Arc<Mediator>,
    lane: Lane,
    seen: Arc<Mutex<Vec<(String, f64)>>>,
}

#[async_trait]
impl Plugin for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Sink
    }

    async fn run(&mut self, control: PluginControl) -> Result<()> {
        let mut queue = self
            .mediator
            .subscribe(&[MarkerType::Track], &self.name, self.lane)?;
        while !control.should_terminate() {
            match queue.listen_timeout(Duration::from_millis(20)).await {
                Ok(Some(marker)) => {
                    if control.is_enabled() {
                        let time = marker.time().unwrap_or(-1.0);
                        self.seen.lock().push((marker.label().to_string(), time));
                    }
                }
                Ok(None) => continue,
                Err(Error::Unsubscribed) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn sink(
    name: &str,
    mediator: &Arc<Mediator>,
    lane: Lane,
) -> (PluginHandle, Arc<Mutex<Vec<(String, f64)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = PluginHandle::new(Box::new(RecordingSink {
        name: name.to_string(),
        mediator: Arc::clone(mediator),
        lane,
        seen: Arc::clone(&seen),
    }));
    (handle, seen)
}

async fn wait_for_subscribers(mediator: &Mediator, lane: Lane, count: usize) {
    for _ in 0..100 {
        if mediator.subscriber_count(MarkerType::Track, lane) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("subscribers never registered");
}

#[tokio::test]
async fn test_source_to_both_lanes_then_shutdown() {
    let mediator = Arc::new(Mediator::new(0.05).unwrap());
    let (instant, instant_seen) = sink("InstantSink", &mediator, Lane::Instant);
    let (delayed, delayed_seen) = sink("DelayedSink", &mediator, Lane::Delayed);
    instant.activate().unwrap();
    delayed.activate().unwrap();
    wait_for_subscribers(&mediator, Lane::Instant, 1).await;
    wait_for_subscribers(&mediator, Lane::Delayed, 1).await;

    let source = PluginHandle::new(Box::new(ScriptedSource {
        mediator: Arc::clone(&mediator),
        labels: vec!["Song A", "Song B", "Song C"],
    }));
    source.activate().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    mediator.terminate();
    for handle in [&source, &instant, &delayed] {
        handle.deactivate();
    }
    for handle in [&source, &instant, &delayed] {
        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .unwrap();
        assert_eq!(handle.state(), PluginState::Stopped);
    }

    let instant_labels: Vec<String> = instant_seen.lock().iter().map(|(l, _)| l.clone()).collect();
    assert_eq!(instant_labels, vec!["Song A", "Song B", "Song C"]);

    let mut delayed_labels: Vec<String> =
        delayed_seen.lock().iter().map(|(l, _)| l.clone()).collect();
    delayed_labels.sort();
    assert_eq!(delayed_labels, vec!["Song A", "Song B", "Song C"]);

    // Times are relative to the first marker and never go backwards
    let times: Vec<f64> = instant_seen.lock().iter().map(|(_, t)| *t).collect();
    assert!(times[0] >= 0.0 && times[0] < 0.05);
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_disabled_sink_drains_without_recording() {
    let mediator = Arc::new(Mediator::new(0.0).unwrap());
    let (handle, seen) = sink("Quiet", &mediator, Lane::Instant);
    handle.disable();
    handle.activate().unwrap();
    wait_for_subscribers(&mediator, Lane::Instant, 1).await;

    mediator
        .publish(MarkerType::Track, Marker::new("ignored").unwrap())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.enable();
    mediator
        .publish(MarkerType::Track, Marker::new("recorded").unwrap())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    mediator.terminate();
    handle.join().await;
    let labels: Vec<String> = seen.lock().iter().map(|(l, _)| l.clone()).collect();
    assert_eq!(labels, vec!["recorded"]);
}

#[tokio::test]
async fn test_close_subscriber_stops_one_sink_only() {
    let mediator = Arc::new(Mediator::new(0.0).unwrap());
    let (first, _) = sink("First", &mediator, Lane::Instant);
    let (second, second_seen) = sink("Second", &mediator, Lane::Instant);
    first.activate().unwrap();
    second.activate().unwrap();
    wait_for_subscribers(&mediator, Lane::Instant, 2).await;

    mediator.close_subscriber("First").unwrap();
    tokio::time::timeout(Duration::from_secs(1), first.join())
        .await
        .unwrap();
    assert_eq!(second.state(), PluginState::Running);

    mediator
        .publish(MarkerType::Track, Marker::new("still flowing").unwrap())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second_seen.lock().len(), 1);

    mediator.terminate();
    second.join().await;
}
