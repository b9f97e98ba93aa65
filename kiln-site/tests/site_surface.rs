//! Site-surface scenarios: system-procedure fragments, bulk table loads,
//! wrong-partition redirects, and the observability snapshot.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use common::{build_site, initiate, submit_and_wait};
use googletest::prelude::*;
use kiln_core::response::ResponseStatus;
use kiln_core::table::{Table, Value};
use rstest::rstest;

#[rstest]
fn sysproc_fragment_reports_the_commit_horizon() {
    let mut site = build_site();

    let first = submit_and_wait(
        &site,
        initiate(100, 0, "Echo", vec![Value::Integer(7)], vec![0]),
    );
    assert_that!(first.status, eq(ResponseStatus::Success));

    let status = submit_and_wait(&site, initiate(120, 0, "Status", Vec::new(), vec![0]));
    assert_that!(status.status, eq(ResponseStatus::Success));
    assert_that!(&status.results, eq(&vec![Table::single_integer(100)]));

    site.shutdown();
}

#[rstest]
fn load_table_rows_survive_the_commit() {
    let mut site = build_site();

    let response = submit_and_wait(
        &site,
        initiate(
            130,
            0,
            "Seed",
            vec![Value::Integer(100), Value::Integer(200)],
            vec![0],
        ),
    );
    assert_that!(response.status, eq(ResponseStatus::Success));
    assert_that!(site.last_committed(0), eq(130_u64));

    let engine = site.memory_engine(0).expect("partition 0 is hosted");
    {
        let engine = engine.lock().expect("engine mutex must be healthy");
        assert_that!(engine.released_tokens().is_empty(), eq(false));
        let rows = engine.table_rows(0).expect("counter table exists").to_vec();
        assert_that!(
            &rows,
            eq(&vec![vec![Value::Integer(100)], vec![Value::Integer(200)]])
        );
    }

    site.shutdown();
}

#[rstest]
fn wrong_ingress_partition_is_redirected_to_the_owner() {
    let mut site = build_site();

    // The request enters through partition 1 but belongs to partition 0.
    let mut task = initiate(140, 0, "Echo", vec![Value::Integer(5)], vec![0]);
    task.source_partition = 1;

    let (response_tx, response_rx) = mpsc::channel();
    site.submit(
        task,
        Box::new(move |response| {
            let _ = response_tx.send(response);
        }),
    )
    .expect("redirected submission must be accepted");
    let response = response_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("redirected response must relay back");

    assert_that!(response.status, eq(ResponseStatus::Success));
    assert_that!(site.last_committed(0), eq(140_u64));
    assert_that!(site.last_committed(1), eq(0_u64));

    // The redirect callback went back to its pool.
    let stats = site.pool_stats();
    let redirects = stats
        .iter()
        .find(|stats| stats.name == "callbacks.redirect")
        .expect("redirect pool is registered");
    assert_that!(redirects.returned >= 1, eq(true));

    site.shutdown();
}

#[rstest]
fn observability_surface_lists_pools_and_counters() {
    let mut site = build_site();

    let names = site
        .pool_stats()
        .into_iter()
        .map(|stats| stats.name)
        .collect::<Vec<_>>();
    assert_that!(
        &names,
        eq(&vec![
            "states.txn.local",
            "states.txn.remote",
            "states.dependency",
            "callbacks.redirect",
        ])
    );

    let response = submit_and_wait(
        &site,
        initiate(150, 0, "Echo", vec![Value::Integer(1)], vec![0]),
    );
    assert_that!(response.status, eq(ResponseStatus::Success));
    assert_that!(
        site.error_counts().iter().all(|(_, count)| *count == 0),
        eq(true)
    );

    site.shutdown();
}
