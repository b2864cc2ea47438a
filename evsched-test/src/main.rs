mod tests;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    tests::priority::test_priority_preemption()?;
    tests::atomic::test_atomic_hold()?;
    tests::ordered::test_ordered_one_at_a_time()?;
    tests::ordered::test_ordered_lock_serialization()?;
    tests::pktio::test_pktio_stop()?;
    tests::groups::test_group_gating()?;
    tests::destroy::test_destroy_in_flight()?;

    println!("all scenarios passed");
    Ok(())
}
