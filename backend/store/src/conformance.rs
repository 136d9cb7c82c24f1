//! Behaviour every `StorageGateway` backend must share.
//!
//! Each backend's test module calls `run_all` with a constructor for a fresh,
//! empty store.
use chrono::{DateTime, Duration, SubsecRound, Utc};

use queueforge_core::{
    GatewayError, JobRecord, MessageStatus, NewMessage, OwnerToken, StorageGateway, ERROR_HEADER,
    LEASE_EXPIRED_TOO_MANY_TIMES, RETRY_COUNT_HEADER,
};

pub async fn run_all<G: StorageGateway, F: Fn() -> G>(make: F) {
    claims_by_priority_then_insertion(&make()).await;
    claim_returns_payload_and_headers(&make()).await;
    claim_honours_routes(&make()).await;
    claim_honours_visibility_and_expiry(&make()).await;
    heartbeat_checks_owner(&make()).await;
    complete_is_idempotent_for_owner(&make()).await;
    fail_records_reason(&make()).await;
    reset_lease_loses_to_renewal(&make()).await;
    reset_lease_bumps_retry_count(&make()).await;
    mark_error_poisons_message(&make()).await;
    requeue_error_only_once(&make()).await;
    purge_removes_expired_waiting(&make()).await;
    duplicate_job_slot_rejected(&make()).await;
    errored_job_slot_replaced(&make()).await;
    job_records_lifecycle(&make()).await;
    due_job_slots_skip_fired(&make()).await;
}

fn owner(name: &str) -> OwnerToken {
    OwnerToken::new(name)
}

/// Millisecond precision, so relational backends compare exactly.
fn clock_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

async fn claims_by_priority_then_insertion<G: StorageGateway>(gw: &G) {
    let low = gw.insert(NewMessage::new(b"1".to_vec()).with_priority(1)).await.unwrap();
    let high = gw.insert(NewMessage::new(b"5".to_vec()).with_priority(5)).await.unwrap();
    let mid_a = gw.insert(NewMessage::new(b"3a".to_vec()).with_priority(3)).await.unwrap();
    let mid_b = gw.insert(NewMessage::new(b"3b".to_vec()).with_priority(3)).await.unwrap();

    let w = owner("w1");
    let now = clock_now();
    let mut order = Vec::new();
    while let Some(msg) = gw.try_claim_next(&[], &w, now).await.unwrap() {
        order.push(msg.id);
    }
    assert_eq!(order, vec![high, mid_a, mid_b, low], "{}", gw.name());
}

async fn claim_returns_payload_and_headers<G: StorageGateway>(gw: &G) {
    let id = gw
        .insert(NewMessage::new(b"hello".to_vec()).with_header("trace", "abc"))
        .await
        .unwrap();
    let w = owner("w1");
    let now = clock_now();
    let msg = gw.try_claim_next(&[], &w, now).await.unwrap().unwrap();

    assert_eq!(msg.id, id);
    assert_eq!(msg.payload, b"hello");
    assert_eq!(msg.headers.get_str("trace"), Some("abc"));
    assert_eq!(msg.status, MessageStatus::Processing);
    assert!(msg.is_owned_by(&w));
    assert!(gw.try_claim_next(&[], &owner("w2"), now).await.unwrap().is_none());
}

async fn claim_honours_routes<G: StorageGateway>(gw: &G) {
    let billing = gw.insert(NewMessage::new(b"b".to_vec()).with_route("billing")).await.unwrap();
    let w = owner("w1");
    let now = clock_now();

    assert!(gw.try_claim_next(&[], &w, now).await.unwrap().is_none());
    assert!(gw
        .try_claim_next(&["email".to_string()], &w, now)
        .await
        .unwrap()
        .is_none());
    let msg = gw
        .try_claim_next(&["email".to_string(), "billing".to_string()], &w, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.id, billing);
}

async fn claim_honours_visibility_and_expiry<G: StorageGateway>(gw: &G) {
    let now = clock_now();
    gw.insert(NewMessage::new(b"later".to_vec()).visible_after(now + Duration::seconds(30)))
        .await
        .unwrap();
    gw.insert(NewMessage::new(b"stale".to_vec()).expires_at(now - Duration::seconds(1)))
        .await
        .unwrap();
    let w = owner("w1");

    assert!(gw.try_claim_next(&[], &w, now).await.unwrap().is_none());
    let msg = gw
        .try_claim_next(&[], &w, now + Duration::seconds(31))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload, b"later");
}

async fn heartbeat_checks_owner<G: StorageGateway>(gw: &G) {
    let id = gw.insert(NewMessage::new(b"x".to_vec())).await.unwrap();
    let w1 = owner("w1");
    let now = clock_now();

    assert_eq!(gw.heartbeat(id, &w1, now).await, Err(GatewayError::NotFound(id)));

    gw.try_claim_next(&[], &w1, now).await.unwrap().unwrap();
    let later = now + Duration::seconds(5);
    gw.heartbeat(id, &w1, later).await.unwrap();
    assert_eq!(gw.get(id).await.unwrap().unwrap().last_heartbeat, Some(later));

    assert_eq!(
        gw.heartbeat(id, &owner("w2"), later).await,
        Err(GatewayError::NotOwned(id))
    );
}

async fn complete_is_idempotent_for_owner<G: StorageGateway>(gw: &G) {
    let id = gw.insert(NewMessage::new(b"x".to_vec())).await.unwrap();
    let w1 = owner("w1");
    let now = clock_now();

    assert_eq!(gw.complete(id, &w1).await, Err(GatewayError::NotOwned(id)));

    gw.try_claim_next(&[], &w1, now).await.unwrap().unwrap();
    assert_eq!(
        gw.complete(id, &owner("w2")).await,
        Err(GatewayError::NotOwned(id))
    );
    gw.complete(id, &w1).await.unwrap();
    gw.complete(id, &w1).await.unwrap();

    let msg = gw.get(id).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Complete);
    assert!(msg.owner_token.is_none());
}

async fn fail_records_reason<G: StorageGateway>(gw: &G) {
    let id = gw.insert(NewMessage::new(b"x".to_vec())).await.unwrap();
    let w1 = owner("w1");
    gw.try_claim_next(&[], &w1, clock_now()).await.unwrap().unwrap();

    assert_eq!(
        gw.fail(id, &owner("w2"), "nope").await,
        Err(GatewayError::NotOwned(id))
    );
    gw.fail(id, &w1, "handler exploded").await.unwrap();

    let msg = gw.get(id).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Error);
    assert_eq!(msg.headers.get_str(ERROR_HEADER), Some("handler exploded"));
}

async fn reset_lease_loses_to_renewal<G: StorageGateway>(gw: &G) {
    let id = gw.insert(NewMessage::new(b"x".to_vec())).await.unwrap();
    let w1 = owner("w1");
    let now = clock_now();
    gw.try_claim_next(&[], &w1, now).await.unwrap().unwrap();

    let threshold = now + Duration::seconds(60);
    let scanned = gw.scan_expired_leases(threshold).await.unwrap();
    assert_eq!(scanned.len(), 1);

    // The owner renews between the scan and the reset.
    gw.heartbeat(id, &w1, now + Duration::seconds(61)).await.unwrap();
    assert!(!gw.reset_lease(&scanned[0]).await.unwrap());

    let msg = gw.get(id).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Processing);
    assert!(msg.is_owned_by(&w1));
}

async fn reset_lease_bumps_retry_count<G: StorageGateway>(gw: &G) {
    let id = gw.insert(NewMessage::new(b"x".to_vec())).await.unwrap();
    let w1 = owner("w1");
    let now = clock_now();
    gw.try_claim_next(&[], &w1, now).await.unwrap().unwrap();

    let scanned = gw.scan_expired_leases(now + Duration::seconds(60)).await.unwrap();
    assert!(gw.reset_lease(&scanned[0]).await.unwrap());
    assert!(!gw.reset_lease(&scanned[0]).await.unwrap());

    let msg = gw.get(id).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Waiting);
    assert_eq!(msg.retry_count, 1);
    assert_eq!(msg.headers.get_str(RETRY_COUNT_HEADER), Some("1"));
    assert_eq!(gw.heartbeat(id, &w1, now).await, Err(GatewayError::NotFound(id)));

    let again = gw.try_claim_next(&[], &owner("w2"), now).await.unwrap().unwrap();
    assert_eq!(again.id, id);
}

async fn mark_error_poisons_message<G: StorageGateway>(gw: &G) {
    let id = gw.insert(NewMessage::new(b"x".to_vec())).await.unwrap();
    let now = clock_now();
    gw.try_claim_next(&[], &owner("w1"), now).await.unwrap().unwrap();

    let scanned = gw.scan_expired_leases(now + Duration::seconds(60)).await.unwrap();
    assert!(gw
        .mark_error(&scanned[0], LEASE_EXPIRED_TOO_MANY_TIMES)
        .await
        .unwrap());

    let msg = gw.get(id).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Error);
    assert_eq!(msg.error_reason(), Some(LEASE_EXPIRED_TOO_MANY_TIMES));
    assert!(!gw.requeue_error(id).await.unwrap());
}

async fn requeue_error_only_once<G: StorageGateway>(gw: &G) {
    let id = gw.insert(NewMessage::new(b"x".to_vec())).await.unwrap();
    let w1 = owner("w1");
    let now = clock_now();
    assert!(!gw.requeue_error(id).await.unwrap());

    gw.try_claim_next(&[], &w1, now).await.unwrap().unwrap();
    gw.fail(id, &w1, "first").await.unwrap();
    assert!(gw.requeue_error(id).await.unwrap());

    let msg = gw.get(id).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Waiting);
    assert!(msg.error_reason().is_none());

    gw.try_claim_next(&[], &w1, now).await.unwrap().unwrap();
    gw.fail(id, &w1, "second").await.unwrap();
    assert!(!gw.requeue_error(id).await.unwrap());
}

async fn purge_removes_expired_waiting<G: StorageGateway>(gw: &G) {
    let now = clock_now();
    let stale = gw
        .insert(NewMessage::new(b"stale".to_vec()).expires_at(now - Duration::seconds(1)))
        .await
        .unwrap();
    let fresh = gw
        .insert(NewMessage::new(b"fresh".to_vec()).expires_at(now + Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(gw.purge_expired(now).await.unwrap(), 1);
    assert!(gw.get(stale).await.unwrap().is_none());
    assert!(gw.get(fresh).await.unwrap().is_some());
    assert_eq!(gw.purge_expired(now).await.unwrap(), 0);
}

async fn duplicate_job_slot_rejected<G: StorageGateway>(gw: &G) {
    let slot = clock_now();
    let first = gw
        .insert(NewMessage::new(b"a".to_vec()).for_job("job1", slot))
        .await
        .unwrap();
    let dup = gw
        .insert(NewMessage::new(b"b".to_vec()).for_job("job1", slot))
        .await;
    assert!(matches!(dup, Err(GatewayError::DuplicateKey(_))), "{}", gw.name());

    gw.insert(NewMessage::new(b"c".to_vec()).for_job("job2", slot))
        .await
        .unwrap();
    gw.insert(NewMessage::new(b"plain".to_vec())).await.unwrap();
    gw.insert(NewMessage::new(b"plain".to_vec())).await.unwrap();

    // The next slot is refused while the first message is unconsumed.
    let next = slot + Duration::minutes(1);
    let blocked = gw
        .insert(NewMessage::new(b"d".to_vec()).for_job("job1", next))
        .await;
    assert!(matches!(blocked, Err(GatewayError::DuplicateKey(_))), "{}", gw.name());

    let w1 = owner("w1");
    let claimed = gw.try_claim_next(&[], &w1, slot).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    let still_blocked = gw
        .insert(NewMessage::new(b"d".to_vec()).for_job("job1", next))
        .await;
    assert!(matches!(still_blocked, Err(GatewayError::DuplicateKey(_))));

    gw.complete(first, &w1).await.unwrap();
    let replay = gw
        .insert(NewMessage::new(b"e".to_vec()).for_job("job1", slot))
        .await;
    assert!(matches!(replay, Err(GatewayError::DuplicateKey(_))));
    gw.insert(NewMessage::new(b"d".to_vec()).for_job("job1", next))
        .await
        .unwrap();
    assert_eq!(gw.count_for_job("job1").await.unwrap(), 2);
}

async fn errored_job_slot_replaced<G: StorageGateway>(gw: &G) {
    let slot = clock_now();
    let first = gw
        .insert(NewMessage::new(b"a".to_vec()).for_job("job1", slot))
        .await
        .unwrap();
    let w1 = owner("w1");
    gw.try_claim_next(&[], &w1, slot).await.unwrap().unwrap();
    gw.fail(first, &w1, "boom").await.unwrap();

    let second = gw
        .insert(NewMessage::new(b"b".to_vec()).for_job("job1", slot))
        .await
        .unwrap();
    assert_ne!(first, second);

    // The replacement is unconsumed, so the errored one stays in Error.
    assert!(!gw.requeue_error(first).await.unwrap(), "{}", gw.name());
    assert_eq!(gw.get(first).await.unwrap().unwrap().status, MessageStatus::Error);
}

async fn job_records_lifecycle<G: StorageGateway>(gw: &G) {
    let now = clock_now();
    gw.save_job(&JobRecord::new("b-job", "0 * * * * *", None, now))
        .await
        .unwrap();
    gw.save_job(&JobRecord::new("a-job", "*/5 * * * * *", None, now))
        .await
        .unwrap();

    let mut names: Vec<String> = gw.load_jobs().await.unwrap().into_iter().map(|j| j.name).collect();
    names.sort();
    assert_eq!(names, vec!["a-job", "b-job"]);

    let slot = now - Duration::seconds(5);
    gw.record_job_fired("a-job", slot).await.unwrap();
    let a = gw
        .load_jobs()
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.name == "a-job")
        .unwrap();
    assert!(a.last_fired_slot.is_some());

    assert!(gw.remove_job("a-job").await.unwrap());
    assert!(!gw.remove_job("a-job").await.unwrap());
    assert!(!gw.remove_job("missing").await.unwrap());
    let removed = gw
        .load_jobs()
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.name == "a-job")
        .unwrap();
    assert!(!removed.is_active());
}

async fn due_job_slots_skip_fired<G: StorageGateway>(gw: &G) {
    let added = clock_now() - Duration::seconds(10);
    gw.save_job(&JobRecord::new("every-second", "* * * * * *", None, added))
        .await
        .unwrap();
    gw.save_job(&JobRecord::new("gone", "* * * * * *", None, added))
        .await
        .unwrap();
    gw.remove_job("gone").await.unwrap();

    let now = clock_now();
    let due = gw.find_due_job_slots(now).await.unwrap();
    assert_eq!(due.len(), 1);
    let (name, slot) = &due[0];
    assert_eq!(name, "every-second");

    gw.record_job_fired(name, *slot).await.unwrap();
    assert!(gw.find_due_job_slots(now).await.unwrap().is_empty());
}
