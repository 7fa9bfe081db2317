// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Ctrl-C handling. These tests deliver real SIGINTs to the test process,
//! so they live in their own binary and run one at a time.

use nix::sys::signal::{raise, Signal};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fanout::auth::ScriptedPrompter;
use fanout::executor::BufferSink;
use fanout::ssh::{MockConnector, Script};
use fanout::{task_fn, Error, ExecutionContext, HostSelection, Orchestrator, Task, TaskArgs};

fn orchestrator(connector: &Arc<MockConnector>, parallel: bool) -> Orchestrator {
    let ctx = ExecutionContext {
        user: "deploy".to_string(),
        always_use_pty: false,
        parallel,
        ..Default::default()
    };
    Orchestrator::new(ctx, connector.clone())
        .with_prompter(Arc::new(ScriptedPrompter::default()))
        .with_sink(Arc::new(BufferSink::new()))
}

async fn press_ctrl_c() {
    raise(Signal::SIGINT).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn assert_interrupted(err: &Error) {
    match err {
        Error::Aborted { source, .. } => assert!(source.is_interrupt(), "{source:?}"),
        other => panic!("expected an interrupted abort, got {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn test_ctrl_c_between_commands_stops_the_task() {
    let connector = Arc::new(MockConnector::new());
    let orch = orchestrator(&connector, false);
    let task: Arc<dyn Task> = Arc::new(task_fn("two_steps", |ctx, _| {
        Box::pin(async move {
            ctx.run("echo one").await?;
            press_ctrl_c().await;
            ctx.run("echo two").await?;
            Ok(().into())
        })
    }));

    let err = orch
        .execute(task, HostSelection::hosts(["web1"]), TaskArgs::default())
        .await
        .unwrap_err();

    assert_interrupted(&err);
    assert_eq!(connector.commands().len(), 1);
}

#[tokio::test]
#[serial]
async fn test_ctrl_c_skips_remaining_serial_hosts() {
    let connector = Arc::new(MockConnector::new());
    let orch = orchestrator(&connector, false);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let task: Arc<dyn Task> = Arc::new(task_fn("once", move |_, _| {
        let counter = counter.clone();
        Box::pin(async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                press_ctrl_c().await;
            }
            Ok(().into())
        })
    }));

    let err = orch
        .execute(task, HostSelection::hosts(["a", "b", "c"]), TaskArgs::default())
        .await
        .unwrap_err();

    assert_interrupted(&err);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(err.host(), Some("b"));
}

#[tokio::test]
#[serial]
async fn test_ctrl_c_stops_parallel_jobs() {
    let connector = Arc::new(MockConnector::new().with_responder(|_| Script::new().hang()));
    let orch = orchestrator(&connector, true);
    let task: Arc<dyn Task> = Arc::new(task_fn("hang", |ctx, _| {
        Box::pin(async move { Ok(ctx.run("tail -f /var/log/syslog").await?.into()) })
    }));

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        raise(Signal::SIGINT).unwrap();
    });
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        orch.execute(task, HostSelection::hosts(["a", "b"]), TaskArgs::default()),
    )
    .await
    .expect("run should stop on Ctrl-C")
    .unwrap_err();

    assert_interrupted(&err);
}

#[tokio::test]
#[serial]
async fn test_ctrl_c_between_runs_blocks_the_next_run() {
    let connector = Arc::new(MockConnector::new());
    let orch = orchestrator(&connector, false);
    let task: Arc<dyn Task> = Arc::new(task_fn("echo", |ctx, _| {
        Box::pin(async move { Ok(ctx.run("echo hi").await?.into()) })
    }));

    orch.execute(task.clone(), HostSelection::hosts(["web1"]), TaskArgs::default())
        .await
        .unwrap();
    press_ctrl_c().await;

    let err = orch
        .execute(task, HostSelection::hosts(["web1"]), TaskArgs::default())
        .await
        .unwrap_err();
    assert!(err.is_interrupt());
    assert_eq!(connector.commands().len(), 1);

    // a fresh orchestrator only reacts to later presses
    let next = orchestrator(&connector, false);
    let task: Arc<dyn Task> = Arc::new(task_fn("echo", |ctx, _| {
        Box::pin(async move { Ok(ctx.run("echo again").await?.into()) })
    }));
    next.execute(task, HostSelection::hosts(["web1"]), TaskArgs::default())
        .await
        .unwrap();
}
