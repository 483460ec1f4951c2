//! How the consumer treats whole batches, independent of the store.

mod common;

use std::sync::{atomic::Ordering, Arc};

use common::{test_config, CountingHandler, FloodTransport, PanickingHandler};
use millionboxes::engine::{
    consumer::{Consumer, CycleStatus},
    queue::CheckboxQueue,
};

fn consumer_over(
    flood: &Arc<FloodTransport>,
    handler: Arc<dyn millionboxes::engine::consumer::handler::MessageHandler>,
) -> Consumer {
    Consumer::new(CheckboxQueue::new(flood.clone()), handler, &test_config())
}

#[tokio::test]
async fn batch_above_ceiling_is_refused_whole() {
    let flood = Arc::new(FloodTransport::new(101));
    let handler = Arc::new(CountingHandler::default());
    let consumer = consumer_over(&flood, handler.clone());

    let report = consumer.run_cycle().await;
    assert!(report.is_failure());
    assert_eq!((report.processed, report.failed), (0, 0));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(flood.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(consumer.stats().snapshot().processed, 0);
}

#[tokio::test]
async fn batch_at_ceiling_is_processed() {
    let flood = Arc::new(FloodTransport::new(100));
    let handler = Arc::new(CountingHandler::default());
    let consumer = consumer_over(&flood, handler.clone());

    let report = consumer.run_cycle().await;
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.processed, 100);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 100);
    assert_eq!(consumer.stats().snapshot().succeeded, 100);
}

#[tokio::test]
async fn panicking_handler_fails_messages_not_the_consumer() {
    let flood = Arc::new(FloodTransport::new(3));
    let consumer = consumer_over(&flood, Arc::new(PanickingHandler));

    for _ in 0..2 {
        let report = consumer.run_cycle().await;
        assert!(report.is_failure());
        assert_eq!((report.processed, report.failed), (0, 3));
    }
    let stats = consumer.stats().snapshot();
    assert_eq!((stats.processed, stats.failed), (6, 6));
}
