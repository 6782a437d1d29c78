use portico_core::{
    BoxError, Container, Lifecycle, LifecycleError, LifecycleEvent, LifecycleListener,
    LifecycleState, Realm,
};
use portico_schema::{CharsetMapper, ContextName};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Default)]
struct Journal(Mutex<Vec<(String, String)>>);

impl Journal {
    fn entries(&self) -> Vec<(String, String)> {
        self.0.lock().unwrap().clone()
    }

    fn types_for(&self, source: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(s, _)| s == source)
            .map(|(_, t)| t)
            .collect()
    }
}

impl LifecycleListener for Journal {
    fn lifecycle_event(&self, event: &LifecycleEvent) {
        self.0
            .lock()
            .unwrap()
            .push((event.source().to_owned(), event.event_type().to_owned()));
    }
}

fn context(raw: &str) -> Arc<Container> {
    Container::context(ContextName::new(raw, false), Arc::new(CharsetMapper::new()))
}

fn tree(journal: &Arc<Journal>) -> (Arc<Container>, Arc<Container>, Arc<Container>) {
    let engine = Container::engine("portico", "localhost");
    engine.set_background_processor_delay(0);
    let host = Container::host("localhost");
    let ctx = context("/app");
    engine.add_child(host.clone()).unwrap();
    host.add_child(ctx.clone()).unwrap();
    for c in [&engine, &host, &ctx] {
        c.add_lifecycle_listener(journal.clone());
    }
    (engine, host, ctx)
}

#[test]
fn start_passes_through_every_state_in_order() {
    let journal = Arc::new(Journal::default());
    let (engine, _host, ctx) = tree(&journal);

    engine.start().unwrap();

    let expected = vec![
        "before_init",
        "after_init",
        "before_start",
        "start",
        "after_start",
    ];
    assert_eq!(journal.types_for("Engine[portico]"), expected);
    assert_eq!(journal.types_for("Context[/app]"), expected);
    assert_eq!(ctx.state(), LifecycleState::Started);
}

#[test]
fn children_finish_starting_before_parent_reports_started() {
    let journal = Arc::new(Journal::default());
    let (engine, _, _) = tree(&journal);
    engine.start().unwrap();

    let entries = journal.entries();
    let position = |source: &str, event: &str| {
        entries
            .iter()
            .position(|(s, t)| s == source && t == event)
            .unwrap()
    };
    assert!(position("Context[/app]", "after_start") < position("Host[localhost]", "after_start"));
    assert!(position("Host[localhost]", "after_start") < position("Engine[portico]", "after_start"));
    assert!(position("Engine[portico]", "before_start") < position("Host[localhost]", "before_start"));
}

#[test]
fn full_cycle_ends_destroyed() {
    let journal = Arc::new(Journal::default());
    let (engine, host, ctx) = tree(&journal);

    engine.start().unwrap();
    engine.stop().unwrap();
    assert_eq!(host.state(), LifecycleState::Stopped);

    // Restart is allowed from STOPPED.
    engine.start().unwrap();
    assert!(ctx.state().is_available());

    engine.stop().unwrap();
    engine.destroy().unwrap();
    assert_eq!(engine.state(), LifecycleState::Destroyed);
    assert_eq!(host.state(), LifecycleState::Destroyed);
    assert_eq!(ctx.state(), LifecycleState::Destroyed);
    assert!(engine.find_children().is_empty());
}

#[test]
fn start_after_destroy_is_rejected_without_state_change() {
    let engine = Container::engine("portico", "localhost");
    engine.destroy().unwrap();

    let err = engine.start().unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    assert_eq!(engine.state(), LifecycleState::Destroyed);
}

struct GatedRealm {
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl Realm for GatedRealm {
    fn name(&self) -> &str {
        "gated"
    }

    fn start(&self) -> Result<(), BoxError> {
        self.entered.lock().unwrap().send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        Ok(())
    }
}

/// A realm whose start blocks until released, plus the signal it sends on
/// entry and the sender that releases it.
fn gated() -> (Arc<dyn Realm>, Receiver<()>, Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let realm = Arc::new(GatedRealm {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    (realm, entered_rx, release_tx)
}

#[test]
fn concurrent_start_fails_fast() {
    let (realm, entered_rx, release_tx) = gated();
    let host = Container::host("localhost");
    host.set_realm(Some(realm));

    let starter = {
        let host = host.clone();
        thread::spawn(move || host.start())
    };
    entered_rx.recv().unwrap();

    let err = host.start().unwrap_err();
    assert!(matches!(err, LifecycleError::TransitionInProgress { active: "start", .. }));
    let err = host.stop().unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::TransitionInProgress { active: "start", operation: "stop", .. }
    ));

    release_tx.send(()).unwrap();
    starter.join().unwrap().unwrap();
    assert_eq!(host.state(), LifecycleState::Started);
}

struct FailingRealm;

impl Realm for FailingRealm {
    fn name(&self) -> &str {
        "failing"
    }

    fn start(&self) -> Result<(), BoxError> {
        Err("directory unreachable".into())
    }
}

#[test]
fn failed_child_fails_parent_and_supervisor_can_destroy() {
    let host = Container::host("localhost");
    let good = context("/good");
    let bad = context("/bad");
    bad.set_realm(Some(Arc::new(FailingRealm)));
    host.add_child(good.clone()).unwrap();
    host.add_child(bad.clone()).unwrap();

    let err = host.start().unwrap_err();
    assert!(err.to_string().contains("directory unreachable"));
    assert_eq!(host.state(), LifecycleState::Failed);
    assert_eq!(bad.state(), LifecycleState::Failed);
    assert!(!host.state().is_available());

    host.destroy().unwrap();
    assert_eq!(host.state(), LifecycleState::Destroyed);
    assert_eq!(good.state(), LifecycleState::Destroyed);
    assert_eq!(bad.state(), LifecycleState::Destroyed);
}

#[test]
fn child_added_to_running_parent_reports_start_failure() {
    let host = Container::host("localhost");
    host.start().unwrap();

    let bad = context("/bad");
    bad.set_realm(Some(Arc::new(FailingRealm)));
    let err = host.add_child(bad.clone()).unwrap_err();
    assert!(err.to_string().contains("/bad"));
    assert!(host.find_child("/bad").is_some());
    assert_eq!(bad.state(), LifecycleState::Failed);
}

#[test]
fn child_added_while_parent_is_starting_does_not_fail_the_parent() {
    let (host_realm, host_entered, host_release) = gated();
    let host = Container::host("localhost");
    host.set_realm(Some(host_realm));
    let starter = {
        let host = host.clone();
        thread::spawn(move || host.start())
    };
    host_entered.recv().unwrap();
    assert_eq!(host.state(), LifecycleState::StartingPrep);

    let (ctx_realm, ctx_entered, ctx_release) = gated();
    let late = context("/late");
    late.set_realm(Some(ctx_realm));
    let adder = {
        let host = host.clone();
        let late = late.clone();
        thread::spawn(move || host.add_child(late))
    };
    // add_child is now starting /late, so the host meets it mid-transition.
    ctx_entered.recv().unwrap();

    host_release.send(()).unwrap();
    starter.join().unwrap().unwrap();
    assert_eq!(host.state(), LifecycleState::Started);

    ctx_release.send(()).unwrap();
    adder.join().unwrap().unwrap();
    assert_eq!(late.state(), LifecycleState::Started);
    assert!(host.find_child("/late").is_some());
}

#[test]
fn child_added_while_parent_is_starting_starts_immediately() {
    let (host_realm, host_entered, host_release) = gated();
    let host = Container::host("localhost");
    host.set_realm(Some(host_realm));
    let starter = {
        let host = host.clone();
        thread::spawn(move || host.start())
    };
    host_entered.recv().unwrap();

    let late = context("/late");
    host.add_child(late.clone()).unwrap();
    assert_eq!(late.state(), LifecycleState::Started);

    host_release.send(()).unwrap();
    starter.join().unwrap().unwrap();
    assert_eq!(host.state(), LifecycleState::Started);
    assert_eq!(late.state(), LifecycleState::Started);
}
