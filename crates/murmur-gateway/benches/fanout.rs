//! Fan-out benchmarks.
//!
//! Dispatch is a linear scan over every session, so cost grows with the total
//! session count, not with the number of recipients.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use murmur_gateway::dispatcher::FanoutDispatcher;
use murmur_gateway::session::SessionRegistry;
use murmur_protocol::{attr, AttributeValue, MessageAttributes, Notification};
use murmur_transport::channel::channel;
use murmur_transport::Outbound;
use tokio::sync::mpsc::UnboundedReceiver;

fn notification(channel_name: &str) -> Notification {
    let mut attributes = MessageAttributes::new();
    attributes.insert(attr::CHANNEL.into(), AttributeValue::string(channel_name));
    attributes.insert(attr::ACCOUNT.into(), AttributeValue::number(1));
    Notification {
        message_id: "m-1".into(),
        topic_arn: format!("arn:murmur:topic:{channel_name}EndpointTopic"),
        subject: None,
        message: "hello".into(),
        timestamp: 1_700_000_000_000,
        message_attributes: attributes,
    }
}

/// `sessions` sessions spread over `channels` channels.
fn dispatcher(sessions: usize, channels: usize) -> (FanoutDispatcher, Vec<UnboundedReceiver<Outbound>>) {
    let mut dispatcher = FanoutDispatcher::new(SessionRegistry::new(sessions));
    let mut receivers = Vec::with_capacity(sessions);
    for i in 0..sessions {
        let (conn, rx) = channel(None);
        receivers.push(rx);
        let name = format!("ch{}", i % channels);
        dispatcher
            .registry_mut()
            .open(Box::new(conn), 1, vec![name])
            .unwrap();
    }
    (dispatcher, receivers)
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    let target = notification("ch0");

    for sessions in [100, 1_000, 10_000] {
        let (dispatcher, mut receivers) = dispatcher(sessions, 10);
        group.throughput(Throughput::Elements(sessions as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &sessions, |b, _| {
            b.iter(|| {
                let delivered = dispatcher.dispatch(black_box(&target));
                for rx in receivers.iter_mut().step_by(10) {
                    while rx.try_recv().is_ok() {}
                }
                delivered
            })
        });
    }

    group.finish();
}

fn bench_no_recipients(c: &mut Criterion) {
    let (dispatcher, _receivers) = dispatcher(10_000, 10);
    let elsewhere = notification("nobody");
    c.bench_function("dispatch_no_match_10000", |b| {
        b.iter(|| dispatcher.dispatch(black_box(&elsewhere)))
    });
}

criterion_group!(benches, bench_dispatch, bench_no_recipients);
criterion_main!(benches);
