use std::{sync::Arc, time::Duration};

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use nanlink::{
    CancelReason, Command, CommandKind, CommandLifecycle, CommandPayload, EndRequest,
    FirmwareError, InterfaceContext, InterfaceMode, MacAddr, Metrics, NdpInstanceId, Serializer,
    TransactionId, VdevId,
};

struct Discard;

impl CommandLifecycle for Discard {
    fn on_activate(&self, _command: &Command) -> Result<(), FirmwareError> {
        Ok(())
    }

    fn on_cancel(&self, _command: &Command, _reason: CancelReason) {}

    fn on_timeout(&self, _command: &Command) {}

    fn on_release(&self, _command: Command) {}
}

fn end(txn: u16) -> CommandPayload {
    CommandPayload::End(EndRequest {
        txn: TransactionId(txn),
        vdev: VdevId(1),
        ndp_ids: vec![NdpInstanceId(u32::from(txn))],
    })
}

fn bench_submit_complete(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let _guard = rt.enter();
    let metrics = Arc::new(Metrics::new().expect("metrics"));
    let serializer = Serializer::new(Arc::new(Discard), metrics, Duration::from_secs(4), 64);
    let iface = Arc::new(InterfaceContext::new(
        VdevId(1),
        "nan0",
        MacAddr::new([0x02, 0, 0, 0, 0, 1]),
        InterfaceMode::Ndi,
    ));

    c.bench_function("serializer_submit_complete", |b| {
        b.iter(|| {
            serializer.submit(Arc::clone(&iface), end(1)).expect("submit");
            serializer.complete(VdevId(1), CommandKind::End, Some(TransactionId(1)))
        })
    });

    c.bench_function("serializer_drain_queue_of_32", |b| {
        b.iter_batched(
            || {
                for txn in 0..32 {
                    serializer.submit(Arc::clone(&iface), end(txn)).expect("submit");
                }
            },
            |_| {
                while serializer.complete(VdevId(1), CommandKind::End, None).is_some() {}
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_submit_complete);
criterion_main!(benches);
