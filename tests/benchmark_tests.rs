//! Performance benchmarks for the hot monitor paths

use monitor::classifier::{match_signature, ConsoleClassifier, ViewerCapability};
use monitor::instance::InstanceMonitor;
use monitor::store::LifecycleState;
use monitor::view::select_view;
use shared::{InstanceSnapshot, InstanceStatus, SessionId};
use std::sync::Arc;
use std::time::Instant;

const CONSOLE_SAMPLE: [&str; 6] = [
    "[12:00:01] [Server thread/INFO]: Preparing spawn area: 84%",
    "[12:00:02] [Server thread/WARN]: Can't keep up! Is the server overloaded?",
    "container@panel~ Server marked as starting...",
    "[12:00:03] [Worker-Main-2/INFO]: Loaded 7 recipes",
    "[12:00:04] [Server thread/INFO]: Done (4.213s)! For help, type \"help\"",
    "[12:00:05] [Server thread/INFO]: Saving chunks for level 'world'",
];

/// Benchmarks signature matching on lines that never match
#[test]
fn benchmark_signature_miss() {
    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let line = CONSOLE_SAMPLE[i % CONSOLE_SAMPLE.len()];
        assert!(match_signature(line).is_none());
    }

    let duration = start.elapsed();
    println!(
        "Signature miss: {} lines in {:?} ({:.2} ns/line)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks an armed classifier chewing through a noisy console
#[test]
fn benchmark_armed_classifier_throughput() {
    let mut classifier = ConsoleClassifier::new("srv-1", ViewerCapability::Standard);
    classifier.arm(SessionId(1));

    let iterations = 50_000;
    let start = Instant::now();

    for i in 0..iterations {
        let line = if i == iterations - 1 {
            "[ERROR] pthread_create failed: Resource temporarily unavailable"
        } else {
            CONSOLE_SAMPLE[i % CONSOLE_SAMPLE.len()]
        };
        classifier.observe(SessionId(1), line);
    }

    let duration = start.elapsed();
    println!(
        "Armed classifier: {} lines in {:?} ({:.2} μs/line)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(
        classifier.episode().map(|e| e.signature),
        Some("pthread_create failed")
    );
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks view selection across every status
#[test]
fn benchmark_view_selection() {
    let statuses = [
        InstanceStatus::Installing,
        InstanceStatus::InstallFailed,
        InstanceStatus::ReinstallFailed,
        InstanceStatus::Suspended,
        InstanceStatus::Running,
        InstanceStatus::Starting,
        InstanceStatus::Stopping,
        InstanceStatus::Offline,
        InstanceStatus::Transferring,
        InstanceStatus::RestoringBackup,
    ];
    let states: Vec<LifecycleState> = statuses
        .iter()
        .map(|status| {
            let mut state = LifecycleState::new("srv-1");
            state.snapshot = Some(Arc::new(InstanceSnapshot::new("srv-1", status.clone())));
            state
        })
        .collect();

    let iterations = 100_000;
    let start = Instant::now();
    let mut blocking = 0;

    for i in 0..iterations {
        if select_view(&states[i % states.len()]).is_blocking() {
            blocking += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "View selection: {} selections in {:?} ({:.2} ns/selection)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Running, starting, stopping and offline pass through.
    assert_eq!(blocking, iterations / states.len() * 6);
    assert!(duration.as_millis() < 1000);
}

/// Stress tests the full pipeline with a burst of pushed events
#[test]
fn stress_test_event_burst() {
    let mut monitor = InstanceMonitor::new("srv-1", ViewerCapability::Elevated);
    let ticket = monitor.begin_fetch();
    monitor
        .apply_fetch(
            ticket,
            Ok(InstanceSnapshot::new("srv-1", InstanceStatus::Starting)),
        )
        .unwrap();
    monitor.stream().establish(SessionId(1));
    monitor.pump();

    let events = 10_000;
    let start = Instant::now();

    for i in 0..events {
        if i % 100 == 0 {
            monitor
                .stream()
                .push_status(SessionId(1), InstanceStatus::Starting);
        } else {
            monitor
                .stream()
                .push_console(SessionId(1), CONSOLE_SAMPLE[i % CONSOLE_SAMPLE.len()]);
        }
    }
    let outcome = monitor.pump();

    let duration = start.elapsed();
    println!("Event burst: {} events in {:?}", events, duration);

    assert_eq!(outcome.events, events);
    assert!(monitor.alert().is_none());
    assert!(duration.as_millis() < 2000);
}
