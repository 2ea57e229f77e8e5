use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use mongodb::bson::{oid::ObjectId, to_document};
use url::Url;

use verselearning_api::models::signin_token::SignInToken;
use verselearning_api::services::audit_service::link_resolved_details;
use verselearning_api::services::session_auth_service::{
    build_signin_link, classify_entry, classify_signin_token, hash_token, AccessSignals,
    EntryDecision, SignInError, SignInTokenState,
};

fn signin_token(expires_at: DateTime<Utc>, consumed_at: Option<DateTime<Utc>>) -> SignInToken {
    SignInToken {
        id: Some(ObjectId::new()),
        token_hash: hash_token("123e4567-e89b-12d3-a456-426614174000"),
        email: "student@example.com".to_string(),
        assignment_id: ObjectId::new(),
        created_at: Utc::now(),
        expires_at,
        consumed_at,
    }
}

#[test]
fn test_expired_and_used_codes_give_distinct_guidance() {
    let expired = SignInError::Expired.to_string();
    let used = SignInError::AlreadyUsed.to_string();
    let invalid = SignInError::InvalidCode.to_string();

    assert_ne!(expired, used);
    assert_ne!(expired, invalid);
    assert_ne!(used, invalid);

    // each message tells the student what actually happened and what to do
    assert!(expired.contains("expired"));
    assert!(expired.contains("request a new one"));
    assert!(used.contains("already used"));
    assert!(used.contains("original email"));
}

#[test]
fn test_storage_failures_show_no_internals() {
    let err = SignInError::Storage(anyhow::anyhow!("mongodb: connection pool drained"));
    assert_eq!(err.to_string(), "Internal error");
}

#[test]
fn test_code_once_used_stays_used_forever() {
    let now = Utc::now();
    let mut token = signin_token(now + Duration::minutes(30), None);
    assert_eq!(classify_signin_token(&token, now), SignInTokenState::Valid);

    token.consumed_at = Some(now);
    assert_eq!(
        classify_signin_token(&token, now + Duration::seconds(1)),
        SignInTokenState::AlreadyUsed
    );
    // long past expiry the answer is still "already used", never "expired"
    assert_eq!(
        classify_signin_token(&token, now + Duration::days(30)),
        SignInTokenState::AlreadyUsed
    );
}

#[test]
fn test_unconsumed_code_expires_exactly_at_the_deadline() {
    let now = Utc::now();
    let token = signin_token(now + Duration::minutes(30), None);

    assert_eq!(
        classify_signin_token(&token, now + Duration::minutes(29)),
        SignInTokenState::Valid
    );
    assert_eq!(
        classify_signin_token(&token, now + Duration::minutes(30)),
        SignInTokenState::Expired
    );
}

#[test]
fn test_signin_link_parses_back_with_exact_params() {
    let code = "123e4567-e89b-12d3-a456-426614174000";
    let link = build_signin_link(
        "https://verse.example.com/play",
        "aabbccddeeff00112233445566778899",
        code,
        "student+tag@example.com",
    );

    let url = Url::parse(&link).expect("link should be a valid URL");
    assert_eq!(url.path(), "/play");

    let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(
        pairs.get("token").map(String::as_str),
        Some("aabbccddeeff00112233445566778899")
    );
    assert_eq!(pairs.get("mode").map(String::as_str), Some("signIn"));
    assert_eq!(pairs.get("oobCode").map(String::as_str), Some(code));
    // the address survives encoding, plus sign included
    assert_eq!(
        pairs.get("email").map(String::as_str),
        Some("student+tag@example.com")
    );
}

#[test]
fn test_callback_email_from_the_link_lands_in_the_audit_detail() {
    let link = build_signin_link(
        "https://verse.example.com/play",
        "aabbccddeeff00112233445566778899",
        "123e4567-e89b-12d3-a456-426614174000",
        "student+tag@example.com",
    );
    let url = Url::parse(&link).expect("link should be a valid URL");
    let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();

    // the address the code was mailed to comes back on the callback query
    // and ends up in the resolution audit entry
    let detail = link_resolved_details("granted", pairs.get("email").map(String::as_str));
    assert_eq!(
        detail,
        "Resolution outcome: granted; callback email: student+tag@example.com"
    );
}

#[test]
fn test_plain_resolutions_keep_a_single_field_audit_detail() {
    assert_eq!(
        link_resolved_details("past_due", None),
        "Resolution outcome: past_due"
    );
    // a blank address on the query counts as absent
    assert_eq!(
        link_resolved_details("granted", Some("   ")),
        "Resolution outcome: granted"
    );
}

#[test]
fn test_signin_link_keeps_existing_query_params() {
    let link = build_signin_link(
        "https://verse.example.com/play?lang=en",
        "aabbccddeeff00112233445566778899",
        "some-code",
        "student@example.com",
    );

    let url = Url::parse(&link).expect("link should be a valid URL");
    let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(pairs.get("lang").map(String::as_str), Some("en"));
    assert_eq!(pairs.len(), 5);
}

#[test]
fn test_signin_link_falls_back_for_relative_base() {
    let link = build_signin_link("/play", "tok", "code", "student@example.com");
    assert!(link.starts_with("/play?token=tok&mode=signIn&oobCode=code"));
}

#[test]
fn test_entry_signal_parsing_edges() {
    // truthy flags are "1" or any casing of "true", nothing else
    let trusted = classify_entry(&AccessSignals::from_query(Some("TRUE"), None, None, None));
    assert_eq!(trusted, EntryDecision::TrustedLink);
    let zero = classify_entry(&AccessSignals::from_query(Some("0"), None, None, None));
    assert_eq!(zero, EntryDecision::ChallengeRequired);
    let yes = classify_entry(&AccessSignals::from_query(Some("yes"), None, None, None));
    assert_eq!(yes, EntryDecision::ChallengeRequired);

    // "from" only counts when it names email, any casing
    let from_email = classify_entry(&AccessSignals::from_query(None, Some("EMAIL"), None, None));
    assert_eq!(from_email, EntryDecision::TrustedLink);
    let from_other =
        classify_entry(&AccessSignals::from_query(None, Some("newsletter"), None, None));
    assert_eq!(from_other, EntryDecision::ChallengeRequired);

    // callback mode is matched exactly, and a blank code does not count
    let wrong_case =
        classify_entry(&AccessSignals::from_query(None, None, Some("signin"), Some("abc")));
    assert_eq!(wrong_case, EntryDecision::ChallengeRequired);
    let blank_code =
        classify_entry(&AccessSignals::from_query(None, None, Some("signIn"), Some("   ")));
    assert_eq!(blank_code, EntryDecision::ChallengeRequired);
}

#[test]
fn test_stored_signin_record_never_contains_the_plaintext_code() {
    let code = "123e4567-e89b-12d3-a456-426614174000";
    let record = signin_token(Utc::now() + Duration::minutes(30), None);

    assert_eq!(record.token_hash, hash_token(code));
    assert!(!record.token_hash.contains(code));

    let doc = to_document(&record).expect("record should serialize");
    assert!(!format!("{:?}", doc).contains(code));
}
