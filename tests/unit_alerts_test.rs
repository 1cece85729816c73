use vigild::config::ConfigStore;
use vigild::core::alerts::{AlertInputs, AlertKind, AlertRuleSet, AlertStateMachine};

fn rules() -> (tempfile::TempDir, AlertRuleSet) {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigStore::new(dir.path()).unwrap();
    let rules = AlertRuleSet::from_config(&config);
    (dir, rules)
}

fn cpu_inputs(cpu: f64) -> AlertInputs {
    AlertInputs {
        cpu_percent: cpu,
        ..Default::default()
    }
}

fn disk_inputs(disk: f64) -> AlertInputs {
    AlertInputs {
        disk_percent: Some(disk),
        ..Default::default()
    }
}

#[test]
fn test_duration_gates_emission() {
    let (_dir, rules) = rules();
    let mut machine = AlertStateMachine::new();

    // cpu_critical: threshold 90, duration 300s, cooldown 1800s.
    let events = machine.evaluate(&cpu_inputs(92.0), 0.0, &rules);
    assert!(events.iter().all(|e| e.kind != AlertKind::CpuCritical));

    // Sustained but under the duration: still nothing.
    for t in (10..300).step_by(10) {
        let events = machine.evaluate(&cpu_inputs(92.0), t as f64, &rules);
        assert!(
            events.iter().all(|e| e.kind != AlertKind::CpuCritical),
            "fired early at t={t}"
        );
    }

    // At the duration boundary the alert fires once.
    let events = machine.evaluate(&cpu_inputs(92.0), 300.0, &rules);
    let fired: Vec<_> = events
        .iter()
        .filter(|e| e.kind == AlertKind::CpuCritical)
        .collect();
    assert_eq!(fired.len(), 1);
    assert!((fired[0].value - 92.0).abs() < f64::EPSILON);
}

#[test]
fn test_cooldown_blocks_reemission() {
    let (_dir, rules) = rules();
    let mut machine = AlertStateMachine::new();

    // Drive to the first emission at t=300.
    machine.evaluate(&cpu_inputs(92.0), 0.0, &rules);
    let events = machine.evaluate(&cpu_inputs(92.0), 300.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::CpuCritical));

    // CPU stays hot for another 1000 seconds: cooldown (1800s) holds.
    for t in (310..1300).step_by(10) {
        let events = machine.evaluate(&cpu_inputs(92.0), t as f64, &rules);
        assert!(
            events.iter().all(|e| e.kind != AlertKind::CpuCritical),
            "re-fired inside cooldown at t={t}"
        );
    }

    // After the cooldown a fresh breach must again sustain the duration.
    let events = machine.evaluate(&cpu_inputs(92.0), 2200.0, &rules);
    assert!(events.iter().all(|e| e.kind != AlertKind::CpuCritical));
    let events = machine.evaluate(&cpu_inputs(92.0), 2500.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::CpuCritical));
}

#[test]
fn test_reset_on_recovery() {
    let (_dir, rules) = rules();
    let mut machine = AlertStateMachine::new();

    machine.evaluate(&cpu_inputs(92.0), 0.0, &rules);
    // Recovery clears the breach timer.
    machine.evaluate(&cpu_inputs(20.0), 100.0, &rules);
    // A new breach must sustain the full duration again.
    machine.evaluate(&cpu_inputs(92.0), 200.0, &rules);
    let events = machine.evaluate(&cpu_inputs(92.0), 450.0, &rules);
    assert!(events.iter().all(|e| e.kind != AlertKind::CpuCritical));
    let events = machine.evaluate(&cpu_inputs(92.0), 500.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::CpuCritical));
}

#[test]
fn test_zero_duration_fires_immediately_and_cooldown_holds() {
    let (_dir, rules) = rules();
    let mut machine = AlertStateMachine::new();

    // disk_critical: threshold 90, duration 0, cooldown 7200s.
    let events = machine.evaluate(&disk_inputs(92.0), 0.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::DiskCritical));

    // Ten minutes later, still 92%: inside the 7200s cooldown.
    let events = machine.evaluate(&disk_inputs(92.0), 600.0, &rules);
    assert!(events.iter().all(|e| e.kind != AlertKind::DiskCritical));
}

#[test]
fn test_critical_and_high_evaluated_independently() {
    let (_dir, rules) = rules();
    let mut machine = AlertStateMachine::new();

    // 95% is over both cpu thresholds; each fires on its own schedule.
    machine.evaluate(&cpu_inputs(95.0), 0.0, &rules);
    let events = machine.evaluate(&cpu_inputs(95.0), 300.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::CpuCritical));
    assert!(events.iter().all(|e| e.kind != AlertKind::CpuHigh));

    let events = machine.evaluate(&cpu_inputs(95.0), 600.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::CpuHigh));
}

#[test]
fn test_process_count_threshold() {
    let (_dir, rules) = rules();
    let mut machine = AlertStateMachine::new();

    let inputs = AlertInputs {
        process_count: 600,
        ..Default::default()
    };
    machine.evaluate(&inputs, 0.0, &rules);
    let events = machine.evaluate(&inputs, 300.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::HighProcessCount));
}

#[test]
fn test_network_spike_needs_baseline() {
    let (_dir, rules) = rules();
    let mut machine = AlertStateMachine::new();

    let spike = AlertInputs {
        net_sent_rate: 1000.0,
        net_recv_rate: 1000.0,
        ..Default::default()
    };
    // Fewer than 20 samples: never a spike, no matter the rate.
    for t in 0..19 {
        let events = machine.evaluate(&spike, t as f64, &rules);
        assert!(events.iter().all(|e| e.kind != AlertKind::NetworkSpike));
    }
}

#[test]
fn test_network_spike_fires_after_duration() {
    let (_dir, rules) = rules();
    let mut machine = AlertStateMachine::new();

    let quiet = AlertInputs {
        net_sent_rate: 1.0,
        net_recv_rate: 1.0,
        ..Default::default()
    };
    for t in 0..20 {
        machine.evaluate(&quiet, t as f64, &rules);
    }

    // A 100x burst against a ~1.0 mean: breach starts.
    let burst = AlertInputs {
        net_sent_rate: 100.0,
        net_recv_rate: 1.0,
        ..Default::default()
    };
    let events = machine.evaluate(&burst, 100.0, &rules);
    assert!(events.iter().all(|e| e.kind != AlertKind::NetworkSpike));

    // Sustained past the 60s duration: fires.
    let events = machine.evaluate(&burst, 160.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::NetworkSpike));
}

#[test]
fn test_threshold_changes_apply_hot() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigStore::new(dir.path()).unwrap();
    let mut machine = AlertStateMachine::new();

    let rules = AlertRuleSet::from_config(&config);
    let events = machine.evaluate(&cpu_inputs(80.0), 0.0, &rules);
    assert!(events.iter().all(|e| e.kind != AlertKind::CpuCritical));

    // Lower the critical threshold and zero the duration; the rule set is
    // rebuilt from config on the next check.
    config.set(
        "alerts.thresholds.cpu_critical.threshold",
        serde_json::json!(70),
    );
    config.set(
        "alerts.thresholds.cpu_critical.duration",
        serde_json::json!(0),
    );
    let rules = AlertRuleSet::from_config(&config);
    let events = machine.evaluate(&cpu_inputs(80.0), 10.0, &rules);
    assert!(events.iter().any(|e| e.kind == AlertKind::CpuCritical));
}

#[test]
fn test_ticket_title_wording() {
    let title = vigild::core::alerts::ticket_title(AlertKind::CpuCritical, 92.4, 310.0, "web-1");
    assert!(title.contains("CRITICAL"));
    assert!(title.contains("92.4%"));
    assert!(title.contains("web-1"));
}
