use chrono::{DateTime, Duration, Utc};
use mongodb::bson::oid::ObjectId;

use verselearning_api::models::assignment::{Assignment, AssignmentStatus};
use verselearning_api::services::access_service::{
    classify, outcome_label, AccessFlags, ResolveError,
};

fn assignment(deadline: DateTime<Utc>, completed_count: i32, times_required: i32) -> Assignment {
    Assignment {
        id: Some(ObjectId::new()),
        link_token: "a3f9c2e14b8d06715e92cf04a1b63d7e".to_string(),
        teacher_id: ObjectId::new(),
        student_email: "student@example.com".to_string(),
        student_name: "Student".to_string(),
        game_id: ObjectId::new(),
        game_type: "word-sort".to_string(),
        deadline,
        times_required,
        completed_count,
        status: AssignmentStatus::Assigned,
        email_sent: true,
        created_at: Utc::now() - Duration::days(1),
        last_completed_at: None,
    }
}

#[test]
fn test_deadline_exactly_now_is_still_on_time() {
    // strict < comparison: a deadline of exactly "now" must not read past due
    let now = Utc::now();
    let flags = classify(&assignment(now, 0, 1), now);
    assert!(!flags.past_due);
    assert!(!flags.already_completed);
    assert_eq!(outcome_label(&flags), "granted");
}

#[test]
fn test_deadline_just_passed_is_past_due_but_still_classified() {
    let now = Utc::now();
    let flags = classify(&assignment(now - Duration::milliseconds(1), 0, 1), now);
    assert!(flags.past_due);
    // past due is a notice, not a rejection: the flags still classify cleanly
    assert_eq!(outcome_label(&flags), "past_due");
}

#[test]
fn test_completed_assignment_still_classifies_for_replay() {
    let now = Utc::now();
    let flags = classify(&assignment(now + Duration::days(2), 3, 3), now);
    assert!(flags.already_completed);
    assert!(!flags.past_due);
    assert_eq!(outcome_label(&flags), "already_completed");
}

#[test]
fn test_past_due_and_completed_combine_into_one_label() {
    let now = Utc::now();
    let flags = classify(&assignment(now - Duration::hours(6), 2, 1), now);
    assert!(flags.past_due);
    assert!(flags.already_completed);
    assert_eq!(outcome_label(&flags), "past_due_already_completed");
}

#[test]
fn test_classification_never_depends_on_status_field() {
    // the notices derive from deadline and counters only; a stale status
    // field must not change what the student is told
    let now = Utc::now();
    let mut a = assignment(now + Duration::days(1), 0, 2);
    for status in [
        AssignmentStatus::Assigned,
        AssignmentStatus::Started,
        AssignmentStatus::Completed,
    ] {
        a.status = status;
        let flags = classify(&a, now);
        assert!(!flags.past_due);
        assert!(!flags.already_completed);
    }
}

#[test]
fn test_not_found_and_configuration_missing_are_distinct_errors() {
    // a deleted game must produce an actionable message, not the generic
    // invalid-link one
    let not_found = ResolveError::NotFound.to_string();
    let config_missing = ResolveError::ConfigurationMissing.to_string();
    assert_ne!(not_found, config_missing);
    assert!(config_missing.contains("game"));
}

#[test]
fn test_resolution_errors_do_not_leak_storage_details() {
    for message in [
        ResolveError::NotFound.to_string(),
        ResolveError::ConfigurationMissing.to_string(),
    ] {
        let lower = message.to_lowercase();
        assert!(!lower.contains("mongo"));
        assert!(!lower.contains("bson"));
        assert!(!lower.contains("collection"));
    }
}

#[test]
fn test_every_flag_combination_has_a_unique_label() {
    let mut labels = std::collections::HashSet::new();
    for past_due in [false, true] {
        for already_completed in [false, true] {
            let flags = AccessFlags {
                past_due,
                already_completed,
            };
            assert!(labels.insert(outcome_label(&flags)), "duplicate label");
        }
    }
    assert_eq!(labels.len(), 4);
}
