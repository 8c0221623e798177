use printlink_communication::LineRouter;
use regex::{Captures, Regex};
use std::sync::{Arc, Mutex};

type Calls = Arc<Mutex<Vec<&'static str>>>;

fn new_calls() -> Calls {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(calls: &Calls, tag: &'static str) -> impl Fn(&str, &Captures<'_>) + Send + Sync + 'static {
    let calls = calls.clone();
    move |_: &str, _: &Captures<'_>| calls.lock().unwrap().push(tag)
}

#[test]
fn test_higher_priority_first() {
    let router = LineRouter::new();
    let calls = new_calls();
    router.register_non_exclusive(&Regex::new("^ok").unwrap(), 1, record(&calls, "low"));
    router.register_non_exclusive(&Regex::new("^o").unwrap(), 5, record(&calls, "high"));

    assert!(router.route("ok"));
    assert_eq!(*calls.lock().unwrap(), vec!["high", "low"]);
}

#[test]
fn test_exclusive_entry_stops_the_walk() {
    let router = LineRouter::new();
    let calls = new_calls();
    router.register(&Regex::new("^ok").unwrap(), 10, record(&calls, "exclusive"));
    router.register(&Regex::new("^o").unwrap(), 1, record(&calls, "shadowed"));

    router.route("ok");
    assert_eq!(*calls.lock().unwrap(), vec!["exclusive"]);
}

#[test]
fn test_newest_first_among_equals() {
    let router = LineRouter::new();
    let calls = new_calls();
    router.register_non_exclusive(&Regex::new("^ok").unwrap(), 0, record(&calls, "older"));
    router.register_non_exclusive(&Regex::new("^o").unwrap(), 0, record(&calls, "newer"));

    router.route("ok");
    assert_eq!(*calls.lock().unwrap(), vec!["newer", "older"]);
}

#[test]
fn test_same_pattern_merges_handlers() {
    let router = LineRouter::new();
    let calls = new_calls();
    let pattern = Regex::new("^echo:busy").unwrap();
    router.register(&pattern, 0, record(&calls, "state"));
    router.register_non_exclusive(&pattern, 0, record(&calls, "timeout"));
    router.register_non_exclusive(&Regex::new("^echo").unwrap(), -1, record(&calls, "fallback"));

    assert_eq!(router.len(), 2);
    router.route("echo:busy: processing");
    // The merged entry stays exclusive
    assert_eq!(*calls.lock().unwrap(), vec!["state", "timeout"]);
}

#[test]
fn test_unregister_removes_empty_entry() {
    let router = LineRouter::new();
    let calls = new_calls();
    let pattern = Regex::new("^start$").unwrap();
    let first = router.register(&pattern, 0, record(&calls, "a"));
    let second = router.register(&pattern, 0, record(&calls, "b"));

    assert!(router.unregister(&pattern, first));
    assert!(!router.unregister(&pattern, first));
    assert_eq!(router.len(), 1);
    assert!(router.unregister(&pattern, second));
    assert!(router.is_empty());
}

#[test]
fn test_unmatched_line() {
    let router = LineRouter::new();
    let calls = new_calls();
    router.register(&Regex::new("^ok").unwrap(), 0, record(&calls, "ok"));
    assert!(!router.route("echo:something"));
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn test_handler_may_register() {
    let router = Arc::new(LineRouter::new());
    let inner = router.clone();
    router.register(&Regex::new("^start$").unwrap(), 0, move |_, _| {
        inner.register(&Regex::new("^ok").unwrap(), 0, |_, _| {});
    });

    router.route("start");
    assert_eq!(router.len(), 2);
}

#[test]
fn test_captures_reach_handler() {
    let router = LineRouter::new();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    router.register(
        &Regex::new(r"^Resend: ?(?P<cmd_number>\d+)$").unwrap(),
        0,
        move |_, captures| {
            *sink.lock().unwrap() = captures
                .name("cmd_number")
                .map(|number| number.as_str().to_string());
        },
    );

    router.route("Resend: 12");
    assert_eq!(seen.lock().unwrap().as_deref(), Some("12"));
}
