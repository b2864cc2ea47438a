use evsched::{Event, QueueParams, SchedError, Scheduler, ThreadKind, Wait};

pub fn test_destroy_in_flight() -> anyhow::Result<()> {
    println!("test destroy in flight");

    let sched = Scheduler::new();
    let queue = sched.queue_create(QueueParams::default())?;
    let mut local = sched.local(ThreadKind::Worker)?;

    // two events pending, command record in the fan-out table
    sched.enqueue_multi(queue, &[Event::new(0), Event::new(1)])?;
    sched.queue_destroy(queue)?;

    // the next dispatch finalizes the marked queue
    assert!(local.schedule(Wait::NoWait).is_none());
    assert_eq!(sched.enqueue(queue, Event::new(2)), Err(SchedError::BadQueue));

    // scheduler state stays usable
    let fresh = sched.queue_create(QueueParams::default())?;
    sched.enqueue(fresh, Event::new(3))?;
    let (from, event) = local.schedule(Wait::NoWait).expect("fresh queue works");
    assert_eq!(from, fresh);
    assert_eq!(event.user_data(), 3);

    Ok(())
}
