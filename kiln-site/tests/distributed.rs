//! Distributed scenarios: dependency-gated fan-out, the prepare/finish
//! conclusion, and remote fragment failures.

mod common;

use std::time::Duration;

use common::{build_site, initiate, submit_and_wait, wait_until};
use googletest::prelude::*;
use kiln_core::response::ResponseStatus;
use kiln_core::table::Table;
use rstest::rstest;

#[rstest]
fn mp_transaction_gathers_ordered_results_and_commits_everywhere() {
    let mut site = build_site();

    let response = submit_and_wait(&site, initiate(101, 0, "SumAcross", Vec::new(), vec![0, 1]));
    assert_that!(response.status, eq(ResponseStatus::Success));
    // Declaration order, not arrival order: the local dependency first.
    assert_that!(
        &response.results,
        eq(&vec![Table::single_integer(3), Table::single_integer(4)])
    );

    // The response goes out before the prepare/finish waves conclude.
    let concluded = wait_until(Duration::from_secs(2), || {
        site.last_committed(0) == 101 && site.last_committed(1) == 101
    });
    assert_that!(concluded, eq(true));
    assert_that!(site.coordinator_requests() >= 1, eq(true));

    for partition in [0, 1] {
        let engine = site.memory_engine(partition).expect("partition is hosted");
        let engine = engine.lock().expect("engine mutex must be healthy");
        assert_that!(engine.released_tokens().is_empty(), eq(false));
        assert_that!(engine.undone_tokens().is_empty(), eq(true));
    }

    site.shutdown();
}

#[rstest]
fn remote_states_are_cleaned_after_the_finish_wave() {
    let mut site = build_site();

    let response = submit_and_wait(&site, initiate(101, 0, "SumAcross", Vec::new(), vec![0, 1]));
    assert_that!(response.status, eq(ResponseStatus::Success));

    let drained = wait_until(Duration::from_secs(2), || {
        site.running_transactions()
            .iter()
            .all(|(_, live)| *live == 0)
    });
    assert_that!(drained, eq(true));

    let stats = site.pool_stats();
    let remote_states = stats
        .iter()
        .find(|stats| stats.name == "states.txn.remote")
        .expect("remote state pool is registered");
    assert_that!(remote_states.returned >= 1, eq(true));

    site.shutdown();
}

#[rstest]
fn remote_fragment_failure_aborts_every_participant() {
    let mut site = build_site();

    let response = submit_and_wait(
        &site,
        initiate(103, 0, "SumAcrossBoom", Vec::new(), vec![0, 1]),
    );
    assert_that!(response.status, eq(ResponseStatus::UnexpectedError));
    assert_that!(response.status_message.contains("injected remote fault"), eq(true));

    // Neither partition commits, and both roll their undo tokens back once
    // the abort wave lands.
    let rolled_back = wait_until(Duration::from_secs(2), || {
        [0, 1].into_iter().all(|partition| {
            site.memory_engine(partition).is_some_and(|engine| {
                !engine
                    .lock()
                    .expect("engine mutex must be healthy")
                    .undone_tokens()
                    .is_empty()
            })
        })
    });
    assert_that!(rolled_back, eq(true));
    assert_that!(site.last_committed(0), eq(0_u64));
    assert_that!(site.last_committed(1), eq(0_u64));
    for partition in [0, 1] {
        let engine = site.memory_engine(partition).expect("partition is hosted");
        let engine = engine.lock().expect("engine mutex must be healthy");
        assert_that!(engine.released_tokens().is_empty(), eq(true));
    }

    // The partial write on the failing partition is gone.
    let engine = site.memory_engine(1).expect("partition 1 is hosted");
    {
        let engine = engine.lock().expect("engine mutex must be healthy");
        let rows = engine.table_rows(0).expect("counter table exists");
        assert_that!(rows.is_empty(), eq(true));
    }

    site.shutdown();
}

#[rstest]
fn back_to_back_mp_transactions_keep_commit_ids_monotonic() {
    let mut site = build_site();

    for txn_id in [110_u64, 111, 112] {
        let response = submit_and_wait(
            &site,
            initiate(txn_id, 0, "SumAcross", Vec::new(), vec![0, 1]),
        );
        assert_that!(response.status, eq(ResponseStatus::Success));
        let concluded = wait_until(Duration::from_secs(2), || {
            site.last_committed(0) == txn_id && site.last_committed(1) == txn_id
        });
        assert_that!(concluded, eq(true));
    }

    site.shutdown();
}
