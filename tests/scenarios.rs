//! The literal scenarios A-F (§8). These drive a real `DebugEngine` against
//! a real `dotnet build` and a real ICorDebug session through the shim, so
//! they only run with a live .NET SDK and `libdbgshim.so` on the machine
//! (`NETDBG_SHIM_PATH` or one of the default search locations) — gated
//! behind the `int_test` feature like the teacher gates its own
//! process-spawning suite behind `#[serial]` + a real debuggee binary.

#![cfg(feature = "int_test")]

use netdbg::config::Config;
use netdbg::engine::DebugEngine;
use netdbg::model::{DebugEvent, SessionState};
use serial_test::serial;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name)
}

async fn launched_engine(fixture_name: &str) -> (DebugEngine, PathBuf, CancellationToken) {
    let engine = DebugEngine::new(Config::default()).expect("shim must be reachable for int_test");
    let cancel = CancellationToken::new();
    let project = fixture(fixture_name);
    engine
        .launch(project.clone(), None, false, &cancel)
        .await
        .expect("launch should succeed against a built fixture project");
    (engine, project, cancel)
}

#[tokio::test]
#[serial]
async fn scenario_a_breakpoint_hit_with_variable_inspection() {
    let (engine, project, cancel) = launched_engine("Counter").await;
    let dll = project.join("bin/Debug/net8.0/Counter.dll");

    engine.set_breakpoint(dll, "Program.cs".to_string(), 1, &cancel).await.unwrap();
    let event = engine.continue_(&cancel).await.unwrap();

    let thread_id = match event {
        DebugEvent::BreakpointHit { thread_id, .. } => thread_id,
        other => panic!("expected BreakpointHit, got {other:?}"),
    };

    let vars = engine.variables(thread_id, &cancel).await.unwrap();
    let counter = vars.iter().find(|v| v.name == "counter").expect("counter local present");
    assert_eq!(counter.type_name, "Int32");
    assert_eq!(counter.value, "0");

    engine.disconnect(&cancel).await.unwrap();
}

#[tokio::test]
#[serial]
async fn scenario_b_step_over_twice_advances_to_line_three() {
    let (engine, project, cancel) = launched_engine("Counter").await;
    let dll = project.join("bin/Debug/net8.0/Counter.dll");

    engine.set_breakpoint(dll, "Program.cs".to_string(), 1, &cancel).await.unwrap();
    let event = engine.continue_(&cancel).await.unwrap();
    let thread_id = match event {
        DebugEvent::BreakpointHit { thread_id, .. } => thread_id,
        other => panic!("expected BreakpointHit, got {other:?}"),
    };

    engine.step_over(thread_id, &cancel).await.unwrap();
    engine.step_over(thread_id, &cancel).await.unwrap();

    let frames = engine.stacktrace(thread_id, &cancel).await.unwrap();
    let top = &frames[0];
    assert_eq!(top.source_file.as_deref(), Some("Program.cs"));
    assert_eq!(top.line, Some(3));

    let vars = engine.variables(thread_id, &cancel).await.unwrap();
    let counter = vars.iter().find(|v| v.name == "counter").expect("counter local present");
    assert_eq!(counter.value, "1");

    engine.disconnect(&cancel).await.unwrap();
}

#[tokio::test]
#[serial]
async fn scenario_c_enum_value_renders_as_type_dot_member() {
    let (engine, project, cancel) = launched_engine("EnumDemo").await;
    let dll = project.join("bin/Debug/net8.0/EnumDemo.dll");

    engine.set_breakpoint(dll, "Program.cs".to_string(), 2, &cancel).await.unwrap();
    let event = engine.continue_(&cancel).await.unwrap();
    let thread_id = match event {
        DebugEvent::BreakpointHit { thread_id, .. } => thread_id,
        other => panic!("expected BreakpointHit, got {other:?}"),
    };

    let vars = engine.variables(thread_id, &cancel).await.unwrap();
    let c = vars.iter().find(|v| v.name == "c").expect("c local present");
    assert_eq!(c.type_name, "Color");
    assert_eq!(c.value, "Color.Green");

    engine.disconnect(&cancel).await.unwrap();
}

#[tokio::test]
#[serial]
async fn scenario_d_self_referencing_field_collapses_to_circular_sentinel() {
    let (engine, project, cancel) = launched_engine("CircularRef").await;
    let dll = project.join("bin/Debug/net8.0/CircularRef.dll");

    engine.set_breakpoint(dll, "Program.cs".to_string(), 3, &cancel).await.unwrap();
    let event = engine.continue_(&cancel).await.unwrap();
    let thread_id = match event {
        DebugEvent::BreakpointHit { thread_id, .. } => thread_id,
        other => panic!("expected BreakpointHit, got {other:?}"),
    };

    let vars = engine.variables(thread_id, &cancel).await.unwrap();
    let n = vars.iter().find(|v| v.name == "n").expect("n local present");
    let next = n.children.iter().find(|c| c.name == "Next").expect("Next field present");
    assert_eq!(next.value, "<circular reference>");

    engine.disconnect(&cancel).await.unwrap();
}

#[tokio::test]
#[serial]
async fn scenario_e_unhandled_exception_drains_to_exited() {
    let (engine, _project, cancel) = launched_engine("UnhandledException").await;

    let event = engine.continue_(&cancel).await.unwrap();
    match event {
        DebugEvent::Exception { type_name, message, is_unhandled, .. } => {
            assert!(type_name.ends_with("InvalidOperationException"));
            assert!(message.contains("oops"));
            assert!(is_unhandled);
        }
        other => panic!("expected Exception, got {other:?}"),
    }

    let event = engine.continue_(&cancel).await.unwrap();
    assert!(matches!(event, DebugEvent::Exited { .. }));

    engine.disconnect(&cancel).await.unwrap();
}

#[tokio::test]
#[serial]
async fn scenario_f_sequential_launches_keep_breakpoint_ids_session_local() {
    let (engine, project, cancel) = launched_engine("Counter").await;
    let dll = project.join("bin/Debug/net8.0/Counter.dll");

    let first_id = engine.set_breakpoint(dll.clone(), "Program.cs".to_string(), 1, &cancel).await.unwrap();
    let first_hit = engine.continue_(&cancel).await.unwrap();
    assert!(matches!(first_hit, DebugEvent::BreakpointHit { breakpoint_id, .. } if breakpoint_id == first_id));
    engine.disconnect(&cancel).await.unwrap();

    let status = engine.launch(project, None, false, &cancel).await.unwrap();
    assert_eq!(status.state, SessionState::Running);

    let second_id = engine.set_breakpoint(dll, "Program.cs".to_string(), 1, &cancel).await.unwrap();
    let second_hit = engine.continue_(&cancel).await.unwrap();
    assert!(matches!(second_hit, DebugEvent::BreakpointHit { breakpoint_id, .. } if breakpoint_id == second_id));

    engine.disconnect(&cancel).await.unwrap();
}
