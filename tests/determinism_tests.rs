//! Pure replay-pass tests driven through `run_turn`, no runtime involved.
use windlass::{run_turn, Action, DurableOutput, Event, OrchestrationContext};

fn started(name: &str, input: &str, at_ms: u64) -> Event {
    Event::OrchestrationStarted {
        name: name.into(),
        input: input.into(),
        started_at_ms: at_ms,
    }
}

#[test]
fn activity_scheduled_once_then_resolved_from_history() {
    let program = |ctx: OrchestrationContext| async move {
        let sum = ctx.schedule_activity("Add", "2,3").into_activity().await?;
        Ok::<String, String>(sum)
    };

    let pass1 = run_turn(vec![started("Demo", "", 0)], program);
    assert!(pass1.output.is_none());
    assert!(pass1.nondeterminism.is_none());
    assert_eq!(
        pass1.actions,
        vec![Action::CallActivity {
            id: 1,
            name: "Add".into(),
            input: "2,3".into()
        }]
    );
    assert!(matches!(
        pass1.history.last(),
        Some(Event::ActivityScheduled { id: 1, .. })
    ));

    // Same prefix, same decisions.
    let again = run_turn(vec![started("Demo", "", 0)], program);
    assert_eq!(again.actions, pass1.actions);
    assert_eq!(again.history, pass1.history);

    // With the completion recorded, the pass runs to the end and schedules
    // nothing new.
    let mut resolved = pass1.history.clone();
    resolved.push(Event::ActivityCompleted {
        id: 1,
        result: "5".into(),
    });
    let pass2 = run_turn(resolved, program);
    assert_eq!(pass2.output, Some(Ok("5".into())));
    assert!(pass2.actions.is_empty());
}

#[test]
fn mismatched_schedule_is_a_nondeterminism_fault() {
    let history = vec![
        started("Demo", "", 0),
        Event::ActivityScheduled {
            id: 1,
            name: "A".into(),
            input: String::new(),
        },
    ];
    let out = run_turn(history, |ctx: OrchestrationContext| async move {
        let r = ctx.schedule_activity("B", "").into_activity().await?;
        Ok::<String, String>(r)
    });
    assert!(out.nondeterminism.is_some());
    assert!(out.output.is_none());
    assert!(out.actions.is_empty());
}

#[test]
fn virtual_clock_follows_resolved_timers_not_wall_clock() {
    let history = vec![
        started("Demo", "", 1_000),
        Event::TimerCreated {
            id: 1,
            fire_at_ms: 1_500,
        },
        Event::TimerFired {
            id: 1,
            fire_at_ms: 1_500,
        },
    ];
    let out = run_turn(history, |ctx: OrchestrationContext| async move {
        let before = ctx.current_time_ms();
        ctx.schedule_timer(500).into_timer().await;
        let after = ctx.current_time_ms();
        Ok::<String, String>(format!("{before}->{after}"))
    });
    assert_eq!(out.output, Some(Ok("1000->1500".into())));
}

#[test]
fn guid_is_captured_once_and_replayed_verbatim() {
    let program = |ctx: OrchestrationContext| async move {
        let g = ctx.new_guid().await;
        Ok::<String, String>(g)
    };
    let pass1 = run_turn(vec![started("Demo", "", 0)], program);
    let first = pass1.output.clone().unwrap().unwrap();
    assert!(!first.is_empty());
    assert!(matches!(
        pass1.history.last(),
        Some(Event::SystemCall { id: 1, .. })
    ));

    let pass2 = run_turn(pass1.history.clone(), program);
    assert_eq!(pass2.output, Some(Ok(first)));
    assert_eq!(pass2.history, pass1.history);
}

#[test]
fn join_returns_outputs_in_call_order() {
    let history = vec![
        started("Demo", "", 0),
        Event::ActivityScheduled {
            id: 1,
            name: "Work".into(),
            input: "0".into(),
        },
        Event::ActivityScheduled {
            id: 2,
            name: "Work".into(),
            input: "1".into(),
        },
        // Completions arrived in reverse order.
        Event::ActivityCompleted {
            id: 2,
            result: "second".into(),
        },
        Event::ActivityCompleted {
            id: 1,
            result: "first".into(),
        },
    ];
    let out = run_turn(history, |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("Work", "0");
        let b = ctx.schedule_activity("Work", "1");
        let results = ctx.join(vec![a, b]).await;
        let joined = results
            .into_iter()
            .map(|r| match r {
                DurableOutput::Activity(Ok(v)) => v,
                other => format!("{other:?}"),
            })
            .collect::<Vec<_>>()
            .join(",");
        Ok::<String, String>(joined)
    });
    assert_eq!(out.output, Some(Ok("first,second".into())));
}

#[test]
fn select_resolves_earliest_completion_and_keeps_the_loser() {
    let history = vec![
        started("Demo", "", 0),
        Event::ActivityScheduled {
            id: 1,
            name: "Never".into(),
            input: String::new(),
        },
        Event::TimerCreated {
            id: 2,
            fire_at_ms: 500,
        },
        Event::TimerFired {
            id: 2,
            fire_at_ms: 500,
        },
    ];
    let before_len = history.len();
    let out = run_turn(history, |ctx: OrchestrationContext| async move {
        let activity = ctx.schedule_activity("Never", "");
        let timer = ctx.schedule_timer(500);
        let (winner, _) = ctx.select2(activity, timer).await;
        Ok::<String, String>(winner.to_string())
    });
    assert_eq!(out.output, Some(Ok("1".into())));
    // No cancellation events for the losing activity; it stays pending.
    assert_eq!(out.history.len(), before_len);
    assert!(out.actions.is_empty());
}

#[test]
fn event_recorded_before_subscription_is_consumed() {
    let history = vec![
        started("Demo", "", 0),
        Event::ExternalEvent {
            name: "Go".into(),
            data: "hi".into(),
        },
    ];
    let out = run_turn(history, |ctx: OrchestrationContext| async move {
        let data = ctx.schedule_wait("Go").into_event().await;
        Ok::<String, String>(data)
    });
    assert_eq!(out.output, Some(Ok("hi".into())));
}

#[test]
fn repeated_waits_consume_events_in_arrival_order() {
    let history = vec![
        started("Demo", "", 0),
        Event::ExternalSubscribed {
            id: 1,
            name: "Msg".into(),
        },
        Event::ExternalEvent {
            name: "Msg".into(),
            data: "one".into(),
        },
        Event::ExternalSubscribed {
            id: 2,
            name: "Msg".into(),
        },
        Event::ExternalEvent {
            name: "Msg".into(),
            data: "two".into(),
        },
    ];
    let out = run_turn(history, |ctx: OrchestrationContext| async move {
        let first = ctx.schedule_wait("Msg").into_event().await;
        let second = ctx.schedule_wait("Msg").into_event().await;
        Ok::<String, String>(format!("{first},{second}"))
    });
    assert_eq!(out.output, Some(Ok("one,two".into())));
}

#[test]
fn joined_waits_on_one_name_take_successive_events() {
    let history = vec![
        started("Demo", "", 0),
        Event::ExternalEvent {
            name: "Msg".into(),
            data: "one".into(),
        },
        Event::ExternalEvent {
            name: "Msg".into(),
            data: "two".into(),
        },
    ];
    let out = run_turn(history, |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_wait("Msg");
        let b = ctx.schedule_wait("Msg");
        let results = ctx.join(vec![a, b]).await;
        let joined = results
            .into_iter()
            .map(|r| match r {
                DurableOutput::External(v) => v,
                other => format!("{other:?}"),
            })
            .collect::<Vec<_>>()
            .join(",");
        Ok::<String, String>(joined)
    });
    // Each wait gets its own arrival; the second event must not be lost.
    assert_eq!(out.output, Some(Ok("one,two".into())));
}

#[test]
fn unencodable_activity_input_faults_the_pass() {
    use std::collections::HashMap;
    let out = run_turn(vec![started("Demo", "", 0)], |ctx: OrchestrationContext| async move {
        // serde_json rejects maps with non-string keys.
        let bad: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        let r = ctx.schedule_activity_typed("Price", &bad).into_activity().await?;
        Ok::<String, String>(r)
    });
    assert!(out.nondeterminism.is_some());
    assert!(out.output.is_none());
    // Nothing gets scheduled with a mangled input.
    assert!(out.actions.is_empty());
}

#[test]
fn custom_status_is_last_write_wins_within_a_pass() {
    let out = run_turn(vec![started("Demo", "", 0)], |ctx: OrchestrationContext| async move {
        ctx.set_custom_status("first");
        ctx.set_custom_status("second");
        Ok::<String, String>(String::new())
    });
    assert_eq!(out.custom_status, Some("second".into()));
}

#[test]
fn continue_as_new_is_recorded_as_an_action() {
    let out = run_turn(vec![started("Demo", "3", 0)], |ctx: OrchestrationContext| async move {
        ctx.continue_as_new("4");
        Ok::<String, String>(String::new())
    });
    assert!(out
        .actions
        .iter()
        .any(|a| matches!(a, Action::ContinueAsNew { input } if input == "4")));
}
