use evsched::{Event, QueueParams, Scheduler, ThreadKind, Wait};

#[test]
fn test_basic() -> anyhow::Result<()> {
    let sched = Scheduler::new();
    let queue = sched.queue_create(QueueParams::default())?;
    let mut local = sched.local(ThreadKind::Worker)?;

    // nothing pending
    assert!(local.schedule(Wait::NoWait).is_none());

    sched.enqueue(queue, Event::new(0x42))?;

    let (from, event) = local.schedule(Wait::NoWait).expect("event pending");
    assert_eq!(from, queue);
    assert_eq!(event.user_data(), 0x42);

    assert!(local.schedule(Wait::NoWait).is_none());

    local.finish().ok().expect("local context is clean");
    Ok(())
}

#[test]
fn test_fifo_order_across_batches() -> anyhow::Result<()> {
    let sched = Scheduler::new();
    let queue = sched.queue_create(QueueParams::default())?;
    let mut local = sched.local(ThreadKind::Worker)?;

    for i in 0..6u64 {
        sched.enqueue(queue, Event::new(i))?;
    }

    let mut seen = Vec::new();
    while let Some((from, event)) = local.schedule(Wait::NoWait) {
        assert_eq!(from, queue);
        seen.push(event.user_data());
    }
    assert_eq!(seen, (0..6).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_batch_and_partial_drain() -> anyhow::Result<()> {
    let sched = Scheduler::new();
    let queue = sched.queue_create(QueueParams::default())?;
    let mut local = sched.local(ThreadKind::Worker)?;

    sched.enqueue_multi(queue, &(0..5).map(Event::new).collect::<Vec<_>>())?;

    // one dispatch caches up to MAX_DEQ events; a short output slice drains
    // the cache over several calls without touching the queue again
    let mut out = [Event::default(); 8];
    let (_, n) = local.schedule_multi(Wait::NoWait, &mut out[..2]).expect("events");
    assert_eq!(n, 2);
    assert_eq!(out[0].user_data(), 0);
    assert_eq!(out[1].user_data(), 1);

    let (_, n) = local.schedule_multi(Wait::NoWait, &mut out).expect("cached remainder");
    assert_eq!(n, 2);
    assert_eq!(out[0].user_data(), 2);
    assert_eq!(out[1].user_data(), 3);

    let (_, n) = local.schedule_multi(Wait::NoWait, &mut out).expect("last event");
    assert_eq!(n, 1);
    assert_eq!(out[0].user_data(), 4);

    assert!(local.schedule_multi(Wait::NoWait, &mut out).is_none());
    Ok(())
}

#[test]
fn test_wait_timeout_expires() -> anyhow::Result<()> {
    let sched = Scheduler::new();
    let _queue = sched.queue_create(QueueParams::default())?;
    let mut local = sched.local(ThreadKind::Worker)?;

    assert!(local.schedule(Wait::nanos(200_000)).is_none());
    Ok(())
}

#[test]
fn test_pause_resume() -> anyhow::Result<()> {
    let sched = Scheduler::new();
    let queue = sched.queue_create(QueueParams::default())?;
    let mut local = sched.local(ThreadKind::Worker)?;

    sched.enqueue(queue, Event::new(1))?;

    // pause is idempotent; a single resume undoes any number of them
    local.pause();
    local.pause();
    assert!(local.schedule(Wait::NoWait).is_none());

    local.resume();
    assert!(local.schedule(Wait::NoWait).is_some());
    Ok(())
}

#[test]
fn test_finish_refuses_busy_context() -> anyhow::Result<()> {
    let sched = Scheduler::new();
    let queue = sched.queue_create(QueueParams::default())?;
    let mut local = sched.local(ThreadKind::Worker)?;

    sched.enqueue_multi(queue, &[Event::new(1), Event::new(2)])?;

    // take one event, leaving one cached
    let mut out = [Event::default(); 1];
    assert!(local.schedule_multi(Wait::NoWait, &mut out).is_some());

    let mut local = local.finish().err().expect("cached events refuse teardown");
    assert!(local.schedule(Wait::NoWait).is_some());
    local.finish().ok().expect("drained context tears down");
    Ok(())
}

#[test]
fn test_num_prio_and_prefetch() -> anyhow::Result<()> {
    let sched = Scheduler::new();
    assert_eq!(sched.num_prio(), evsched::NUM_PRIO);

    let local = sched.local(ThreadKind::Control)?;
    local.prefetch(4);
    Ok(())
}
