//! End-to-end renders through real Node.js workers. Skipped when `node` is not
//! on PATH.

use std::sync::Arc;
use std::time::Duration;

use renderpool::{
    DispatchError, DispatcherConfig, LaunchError, LauncherConfig, ProcessLauncher,
    RenderDispatcher, RenderError,
};

fn node_available() -> bool {
    std::process::Command::new("node")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn dispatcher(num_workers: usize) -> RenderDispatcher {
    let launcher = LauncherConfig::new("node").with_ready_timeout(Duration::from_secs(20));
    RenderDispatcher::new(
        DispatcherConfig::new()
            .with_num_workers(num_workers)
            .with_launcher(ProcessLauncher::shared(launcher)),
    )
}

#[tokio::test]
async fn returned_function_renders() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = dispatcher(1);

    let html = d.render("return () => 'hi'", "/render", "{}").await.unwrap();
    assert_eq!(html, "hi");

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn module_exports_receives_route_and_payload() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = dispatcher(1);
    let code = r#"
        module.exports = (route, body) => {
          const props = JSON.parse(body);
          return `<h1>${props.name}</h1><p>${route}</p>`;
        };
    "#;

    let html = d
        .render(code, "/users/7?tab=posts", r#"{"name":"ada"}"#)
        .await
        .unwrap();
    assert_eq!(html, "<h1>ada</h1><p>/users/7?tab=posts</p>");

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn state_persists_until_code_changes() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = dispatcher(1);
    let counter = "let n = 0; return () => String(++n);";

    assert_eq!(d.render(counter, "/", "{}").await.unwrap(), "1");
    assert_eq!(d.render(counter, "/", "{}").await.unwrap(), "2");

    // Same behavior, different text: a fresh worker with fresh state.
    let edited = "let n = 0; return () => String(++n); // v2";
    assert_eq!(d.render(edited, "/", "{}").await.unwrap(), "1");
    assert_eq!(d.stats().recycled, 1);

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn thrown_error_is_reported_and_worker_replaced() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = dispatcher(1);
    let code = "let n = 0; return (route) => { n++; if (route === '/boom') throw new Error('kaboom'); return String(n); };";

    assert_eq!(d.render(code, "/", "{}").await.unwrap(), "1");

    let err = d.render(code, "/boom", "{}").await.unwrap_err();
    match &err {
        DispatchError::Render(RenderError::Remote { status, body, .. }) => {
            assert_eq!(*status, 500);
            assert!(body.contains("kaboom"), "{body}");
        }
        other => panic!("expected a remote render error, got {other:?}"),
    }

    // The failed worker was killed, so the counter restarts.
    assert_eq!(d.render(code, "/", "{}").await.unwrap(), "1");

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn code_raising_on_load_reports_error_then_recovers() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = dispatcher(1);

    let err = d
        .render("throw new Error('bad init')", "/render", "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Render(_)), "{err:?}");
    assert!(err.to_string().contains("bad init"), "{err}");

    let html = d.render("return () => 'hi'", "/render", "{}").await.unwrap();
    assert!(html.contains("hi"));

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn console_output_while_loading_does_not_break_readiness() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = dispatcher(1);
    let code = "console.log('loading'); console.info('still loading'); return () => { console.log('rendering'); return 'ok'; };";

    assert_eq!(d.render(code, "/", "{}").await.unwrap(), "ok");
    assert_eq!(d.render(code, "/", "{}").await.unwrap(), "ok");
    assert_eq!(d.stats().launches, 1);

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn async_render_functions_are_awaited() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = dispatcher(1);
    let code = "return async () => { await new Promise(r => setTimeout(r, 10)); return 'later'; };";

    assert_eq!(d.render(code, "/", "{}").await.unwrap(), "later");

    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn syntax_error_fails_launch() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = dispatcher(1);

    let err = d.render("return () => {", "/", "{}").await.unwrap_err();
    assert!(
        matches!(err, DispatchError::Launch(LaunchError::Exited { .. })),
        "{err:?}"
    );

    assert_eq!(d.render("return () => 'ok'", "/", "{}").await.unwrap(), "ok");
    d.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_renders_share_the_pool() {
    if !node_available() {
        eprintln!("node not found, skipping");
        return;
    }
    let d = Arc::new(dispatcher(2));
    let code = "return (route) => route;";

    let mut handles = Vec::new();
    for i in 0..8 {
        let d = Arc::clone(&d);
        handles.push(tokio::spawn(async move {
            d.render(code, &format!("/{i}"), "{}").await
        }));
    }
    for (i, h) in handles.into_iter().enumerate() {
        assert_eq!(h.await.unwrap().unwrap(), format!("/{i}"));
    }
    assert!(d.stats().launches <= 2);

    d.shutdown().await.unwrap();
}
