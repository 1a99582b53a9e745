//! Integration tests for the multiplexer against the in-memory transport.
//!
//! Covers key sharing under concurrency, late joiners, connection loss and
//! reopening subscriptions whose transport stream ended.

use bytes::Bytes;
use livedash_core::{BufferItem, DataSource, DeliverPolicy, MessageSink, VariableBindings, WidgetId};
use livedash_feed::{Multiplexer, MultiplexerEvent};
use livedash_transport::MemoryTransport;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingSink {
    items: Mutex<Vec<BufferItem>>,
}

impl RecordingSink {
    fn values_for(&self, widget: &str) -> Vec<Value> {
        self.items
            .lock()
            .iter()
            .filter(|i| i.widget_id.as_str() == widget)
            .map(|i| i.message.value.clone())
            .collect()
    }
}

impl MessageSink for RecordingSink {
    fn deliver(&self, items: Vec<BufferItem>) {
        self.items.lock().extend(items);
    }
}

fn setup() -> (Arc<MemoryTransport>, Arc<RecordingSink>, Arc<Multiplexer>) {
    let transport = Arc::new(MemoryTransport::new());
    let sink = Arc::new(RecordingSink::default());
    let mux = Arc::new(Multiplexer::new(transport.clone(), sink.clone()).with_kv(transport.clone()));
    (transport, sink, mux)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

#[tokio::test]
async fn test_concurrent_subscribers_share_one_transport_subscription() {
    let (transport, _sink, mux) = setup();
    let source = DataSource::subject("plant.*.power");

    let mut handles = Vec::new();
    for i in 0..16 {
        let mux = mux.clone();
        let source = source.clone();
        handles.push(tokio::spawn(async move {
            mux.subscribe(
                &WidgetId::new(format!("w{i}")),
                &source,
                None,
                &VariableBindings::new(),
            )
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(transport.subscribe_calls(), 1);
    assert_eq!(transport.active_subscriptions(), 1);
    let keys = mux.live_keys().await;
    assert_eq!(keys.len(), 1);
    assert_eq!(mux.owners(&keys[0]).await.len(), 16);
}

#[tokio::test]
async fn test_plain_keys_ignore_policy_and_window() {
    let (transport, _sink, mux) = setup();
    let vars = VariableBindings::new();
    let a = mux
        .subscribe(&WidgetId::new("a"), &DataSource::subject("x.y"), None, &vars)
        .await
        .unwrap();

    // Same subject via a stream source is a different key.
    transport.add_stream("XS", &["x.>"]);
    let b = mux
        .subscribe(
            &WidgetId::new("b"),
            &DataSource::stream("x.y", DeliverPolicy::New, None),
            None,
            &vars,
        )
        .await
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(transport.subscribe_calls(), 2);

    // Windows compare in whole seconds and force start-time delivery.
    let c = mux
        .subscribe(
            &WidgetId::new("c"),
            &DataSource::stream("x.y", DeliverPolicy::All, Some("60s")),
            None,
            &vars,
        )
        .await
        .unwrap();
    let d = mux
        .subscribe(
            &WidgetId::new("d"),
            &DataSource::stream("x.y", DeliverPolicy::Last, Some("1m")),
            None,
            &vars,
        )
        .await
        .unwrap();
    assert_eq!(c, d);
    assert_eq!(c.deliver_policy, Some(DeliverPolicy::ByStartTime));
    assert_eq!(transport.subscribe_calls(), 3);
}

#[tokio::test]
async fn test_late_joiner_sees_only_later_messages() {
    let (transport, sink, mux) = setup();
    let source = DataSource::subject("feed.price");
    let vars = VariableBindings::new();

    mux.subscribe(&WidgetId::new("early"), &source, None, &vars)
        .await
        .unwrap();
    transport
        .publish_now("feed.price", Bytes::from_static(b"1"))
        .unwrap();
    settle().await;

    mux.subscribe(&WidgetId::new("late"), &source, None, &vars)
        .await
        .unwrap();
    transport
        .publish_now("feed.price", Bytes::from_static(b"2"))
        .unwrap();
    settle().await;

    assert_eq!(sink.values_for("early"), vec![json!(1), json!(2)]);
    assert_eq!(sink.values_for("late"), vec![json!(2)]);
}

#[tokio::test]
async fn test_per_key_order_preserved() {
    let (transport, sink, mux) = setup();
    mux.subscribe(
        &WidgetId::new("w"),
        &DataSource::subject("seq"),
        Some("n"),
        &VariableBindings::new(),
    )
    .await
    .unwrap();

    for n in 0..200 {
        transport
            .publish_now("seq", Bytes::from(format!(r#"{{"n":{n}}}"#)))
            .unwrap();
    }
    settle().await;

    let expected: Vec<Value> = (0..200).map(|n| json!(n)).collect();
    assert_eq!(sink.values_for("w"), expected);
}

#[tokio::test]
async fn test_connection_loss_invalidates_and_resubscribe_opens_fresh() {
    let (transport, sink, mux) = setup();
    let watcher = mux.watch_connection();
    let mut events = mux.subscribe_events();
    let vars = VariableBindings::new();

    mux.subscribe(&WidgetId::new("a"), &DataSource::subject("s.1"), None, &vars)
        .await
        .unwrap();
    mux.subscribe(&WidgetId::new("b"), &DataSource::subject("s.2"), None, &vars)
        .await
        .unwrap();
    assert_eq!(transport.subscribe_calls(), 2);

    transport.set_connected(false);
    settle().await;
    assert_eq!(mux.subscription_count().await, 0);

    let mut invalidated = None;
    while let Ok(event) = events.try_recv() {
        if let MultiplexerEvent::Invalidated { owners, .. } = event {
            invalidated = Some(owners);
        }
    }
    assert_eq!(
        invalidated,
        Some(vec![WidgetId::new("a"), WidgetId::new("b")])
    );

    transport.set_connected(true);
    mux.subscribe(&WidgetId::new("a"), &DataSource::subject("s.1"), None, &vars)
        .await
        .unwrap();
    assert_eq!(transport.subscribe_calls(), 3);

    transport
        .publish_now("s.1", Bytes::from_static(br#""after""#))
        .unwrap();
    settle().await;
    assert_eq!(sink.values_for("a"), vec![json!("after")]);

    watcher.abort();
}

#[tokio::test]
async fn test_ended_stream_is_reopened_with_existing_owners() {
    let (transport, sink, mux) = setup();
    let source = DataSource::subject("k.v");
    let vars = VariableBindings::new();
    mux.subscribe(&WidgetId::new("first"), &source, None, &vars)
        .await
        .unwrap();

    // Without a connection watcher the key stays registered but its pump ends.
    transport.set_connected(false);
    settle().await;
    transport.set_connected(true);
    assert_eq!(mux.subscription_count().await, 1);

    mux.subscribe(&WidgetId::new("second"), &source, None, &vars)
        .await
        .unwrap();
    assert_eq!(transport.subscribe_calls(), 2);

    transport
        .publish_now("k.v", Bytes::from_static(b"7"))
        .unwrap();
    settle().await;
    assert_eq!(sink.values_for("first"), vec![json!(7)]);
    assert_eq!(sink.values_for("second"), vec![json!(7)]);
}

#[tokio::test]
async fn test_failed_reopen_keeps_earlier_owners() {
    let (transport, sink, mux) = setup();
    let mut events = mux.subscribe_events();
    let source = DataSource::subject("k.v");
    let vars = VariableBindings::new();
    let first = WidgetId::new("first");
    let second = WidgetId::new("second");
    let key = mux.subscribe(&first, &source, None, &vars).await.unwrap();

    transport.set_connected(false);
    settle().await;
    assert!(mux.subscribe(&second, &source, None, &vars).await.is_err());

    // The ended key still tracks the earlier owner, not the failed one.
    assert_eq!(mux.subscription_count().await, 1);
    assert_eq!(mux.owners(&key).await, vec![first.clone()]);
    let mut reported = None;
    while let Ok(event) = events.try_recv() {
        if let MultiplexerEvent::ReopenFailed { owners, .. } = event {
            reported = Some(owners);
        }
    }
    assert_eq!(reported, Some(vec![first.clone()]));

    transport.set_connected(true);
    mux.subscribe(&second, &source, None, &vars).await.unwrap();
    assert_eq!(mux.owners(&key).await, vec![first, second]);

    transport
        .publish_now("k.v", Bytes::from_static(b"3"))
        .unwrap();
    settle().await;
    assert_eq!(sink.values_for("first"), vec![json!(3)]);
    assert_eq!(sink.values_for("second"), vec![json!(3)]);
}

#[tokio::test]
async fn test_text_and_binary_payloads() {
    let (transport, sink, mux) = setup();
    mux.subscribe(
        &WidgetId::new("w"),
        &DataSource::subject("log"),
        None,
        &VariableBindings::new(),
    )
    .await
    .unwrap();

    transport
        .publish_now("log", Bytes::from_static(b"plain text line"))
        .unwrap();
    transport
        .publish_now("log", Bytes::from_static(&[0xff, 0x00, 0xfe]))
        .unwrap();
    transport
        .publish_now("log", Bytes::from_static(b"true"))
        .unwrap();
    settle().await;

    assert_eq!(
        sink.values_for("w"),
        vec![json!("plain text line"), json!(true)]
    );
    assert_eq!(mux.stats().decode_errors(), 1);
}
