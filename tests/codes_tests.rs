use std::time::Duration;

use warden_backend::codes::PendingCodes;

#[tokio::test]
async fn verify_without_issue_fails() {
    let codes = PendingCodes::new();
    assert!(!codes.verify("ghost", "1234").await);
}

#[tokio::test]
async fn code_is_single_use() {
    let codes = PendingCodes::new();
    let code = codes.issue("skill-1").await;
    assert!(codes.verify("skill-1", &code).await);
    assert!(!codes.verify("skill-1", &code).await);
}

#[tokio::test]
async fn wrong_code_keeps_the_stored_one_valid() {
    let codes = PendingCodes::new();
    let code = codes.issue("skill-1").await;
    // A 5-character guess can never equal a 4-digit code.
    assert!(!codes.verify("skill-1", "00000").await);
    assert!(codes.verify("skill-1", &code).await);
}

#[tokio::test]
async fn verify_tolerates_surrounding_whitespace() {
    let codes = PendingCodes::new();
    let code = codes.issue("skill-1").await;
    assert!(codes.verify("skill-1", &format!("  {code}\n")).await);
}

#[tokio::test]
async fn expired_code_fails_and_is_evicted() {
    let codes = PendingCodes::with_ttl(Duration::from_millis(10));
    let code = codes.issue("skill-1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!codes.verify("skill-1", &code).await);
    // Evicted on the failed verify — a later issue starts fresh.
    let fresh = codes.issue("skill-1").await;
    assert!(codes.verify("skill-1", &fresh).await);
}

#[tokio::test]
async fn reissue_replaces_the_previous_code() {
    let codes = PendingCodes::new();
    let first = codes.issue("skill-1").await;
    let second = codes.issue("skill-1").await;
    if first != second {
        assert!(!codes.verify("skill-1", &first).await);
    }
    assert!(codes.verify("skill-1", &second).await);
}

#[tokio::test]
async fn purge_drops_only_expired_entries() {
    let codes = PendingCodes::with_ttl(Duration::from_millis(10));
    codes.issue("stale").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let evicted = codes.purge_expired().await;
    assert_eq!(evicted, 1);

    let fresh_codes = PendingCodes::new();
    fresh_codes.issue("fresh").await;
    assert_eq!(fresh_codes.purge_expired().await, 0);
}
