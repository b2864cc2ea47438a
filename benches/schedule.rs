use criterion::{black_box, criterion_group, criterion_main, Criterion};
use evsched::{Event, QueueParams, Scheduler, SyncMode, ThreadKind, Wait};

struct TaskQueue(usize);

impl TaskQueue {
    pub fn want(&self) -> bool {
        self.0 != 0
    }

    pub fn pop(&mut self) {
        self.0 -= 1;
    }
}

fn bench_parallel(c: &mut Criterion) {
    let sched = Scheduler::new();
    let queue = sched.queue_create(QueueParams::default()).unwrap();
    let mut local = sched.local(ThreadKind::Worker).unwrap();

    c.bench_function("parallel", |b| {
        b.iter(|| {
            let mut tasks = TaskQueue(128);

            for i in 0..128u64 {
                sched.enqueue(queue, black_box(Event::new(i))).unwrap();
            }

            while tasks.want() {
                if let Some((_, event)) = local.schedule(Wait::NoWait) {
                    black_box(event);
                    tasks.pop();
                }
            }
        });
    });
}

fn bench_atomic_batches(c: &mut Criterion) {
    let sched = Scheduler::new();
    let queue = sched
        .queue_create(QueueParams::default().sync(SyncMode::Atomic))
        .unwrap();
    let mut local = sched.local(ThreadKind::Worker).unwrap();

    c.bench_function("atomic", |b| {
        b.iter(|| {
            let mut tasks = TaskQueue(128);
            let mut out = [Event::default(); evsched::MAX_DEQ];

            for i in 0..128u64 {
                sched.enqueue(queue, black_box(Event::new(i))).unwrap();
            }

            while tasks.want() {
                if let Some((_, n)) = local.schedule_multi(Wait::NoWait, &mut out) {
                    for event in &out[..n] {
                        black_box(event);
                        tasks.pop();
                    }
                }
            }
        });
    });
}

fn bench_ordered_release(c: &mut Criterion) {
    let sched = Scheduler::new();
    let queue = sched
        .queue_create(QueueParams::default().sync(SyncMode::Ordered).lock_count(1))
        .unwrap();
    let mut local = sched.local(ThreadKind::Worker).unwrap();

    c.bench_function("ordered", |b| {
        b.iter(|| {
            let mut tasks = TaskQueue(128);

            for i in 0..128u64 {
                sched.enqueue(queue, black_box(Event::new(i))).unwrap();
            }

            while tasks.want() {
                if let Some((_, event)) = local.schedule(Wait::NoWait) {
                    local.order_lock(0);
                    black_box(event);
                    local.order_unlock(0);
                    tasks.pop();
                }
            }
        });
    });
}

criterion_group!(benches, bench_parallel, bench_atomic_batches, bench_ordered_release);
criterion_main!(benches);
