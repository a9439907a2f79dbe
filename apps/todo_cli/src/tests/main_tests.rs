use chrono::TimeZone;

use super::*;

fn todo(id: &str, status: TodoStatus) -> Todo {
    let at = Utc.with_ymd_and_hms(2024, 3, 19, 0, 0, 0).unwrap();
    Todo {
        id: TodoId::new(id),
        title: "Buy milk".into(),
        description: None,
        status,
        priority: Priority::Medium,
        due_date: None,
        created_at: at,
        updated_at: at,
    }
}

#[tokio::test]
async fn watcher_prints_events_queued_before_shutdown() {
    let (events, rx) = broadcast::channel(16);
    events
        .send(ClientEvent::TodosChanged(vec![todo("temp-1-1", TodoStatus::Creating)]))
        .expect("send");
    events
        .send(ClientEvent::TodosChanged(vec![todo("temp-1-1", TodoStatus::Creating)]))
        .expect("send");
    events
        .send(ClientEvent::Error("Failed to add todo".into()))
        .expect("send");
    drop(events);

    let (out, err) = watch(rx, Vec::new(), Vec::new()).await;

    let out = String::from_utf8(out).expect("utf8");
    assert_eq!(out.lines().count(), 1);
    assert!(out.contains("Buy milk (Creating...)"));
    assert_eq!(String::from_utf8(err).expect("utf8"), "error: Failed to add todo\n");
}

#[test]
fn render_marks_unsettled_rows() {
    assert!(render(&todo("temp-1-2", TodoStatus::Deleting)).contains("Buy milk - Deleting"));
    let done = render(&todo("42", TodoStatus::Completed));
    assert!(done.starts_with("[x] 42"));
    assert!(!done.contains("..."));
}

#[test]
fn priority_and_status_arguments_parse() {
    assert_eq!(parse_priority("HIGH").expect("priority"), Priority::High);
    assert!(parse_priority("urgent").is_err());
    assert_eq!(parse_status("completed").expect("status"), TodoStatus::Completed);
    assert!(parse_status("deleting").is_err());
    assert!(parse_due_date("2024-03-20T17:00:00Z").is_ok());
    assert!(parse_due_date("tomorrow").is_err());
}
