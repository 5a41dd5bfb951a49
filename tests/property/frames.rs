//! Property-based tests for realtime frame classification.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never panics `decode`/`classify`.
//! 2. Any frame whose `type` is not one of the four known kinds classifies as
//!    a refresh request.
//! 3. Any well-formed task frame decodes to the matching event.

use proptest::prelude::*;
use taskman_proto::realtime::{self, RealtimeEvent};
use taskman_proto::task::{Task, TaskId, TaskPriority, TaskStatus};

const KNOWN_TYPES: [&str; 4] = [
    realtime::TASK_CREATED,
    realtime::TASK_UPDATED,
    realtime::TASK_DELETED,
    realtime::TASKS_REFRESH,
];

fn arb_status() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(TaskStatus::ALL.to_vec())
}

fn arb_priority() -> impl Strategy<Value = TaskPriority> {
    prop::sample::select(TaskPriority::ALL.to_vec())
}

fn arb_task() -> impl Strategy<Value = Task> {
    (
        1u64..1_000_000,
        "[a-zA-Z0-9 ]{1,64}",
        prop::option::of("[a-zA-Z0-9 ]{0,128}"),
        arb_status(),
        arb_priority(),
    )
        .prop_map(|(id, title, description, status, priority)| Task {
            id: TaskId::from(id),
            title,
            description,
            status,
            priority,
            due_date: None,
        })
}

proptest! {
    #[test]
    fn arbitrary_text_never_panics(text in ".{0,512}") {
        let _ = realtime::decode(&text);
        let (event, err) = realtime::classify(&text);
        if err.is_some() {
            prop_assert_eq!(event, RealtimeEvent::RefreshRequested);
        }
    }

    #[test]
    fn unknown_types_classify_as_refresh(kind in "[a-z.]{1,24}") {
        prop_assume!(!KNOWN_TYPES.contains(&kind.as_str()));
        let text = serde_json::json!({"type": kind, "id": 1}).to_string();
        let (event, err) = realtime::classify(&text);
        prop_assert_eq!(event, RealtimeEvent::RefreshRequested);
        prop_assert!(err.is_some());
    }

    #[test]
    fn task_frames_decode_to_matching_event(task in arb_task(), updated in any::<bool>()) {
        let kind = if updated { realtime::TASK_UPDATED } else { realtime::TASK_CREATED };
        let text = serde_json::json!({"type": kind, "task": task}).to_string();
        let event = realtime::decode(&text).unwrap();
        let expected = if updated {
            RealtimeEvent::TaskUpdated(task)
        } else {
            RealtimeEvent::TaskCreated(task)
        };
        prop_assert_eq!(event, expected);
    }

    #[test]
    fn deleted_frames_carry_the_id(id in 1u64..u64::MAX) {
        let text = serde_json::json!({"type": realtime::TASK_DELETED, "id": id}).to_string();
        prop_assert_eq!(
            realtime::decode(&text).unwrap(),
            RealtimeEvent::TaskDeleted(TaskId::from(id))
        );
    }
}
