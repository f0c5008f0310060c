use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use super::*;
use crate::trigger::TriggerCause;

const M: Ms = 60_000;
const H: Ms = 3_600_000;
/// Fixed base instant inside the valid timestamp range.
const T0: Ms = 1_700_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("placard_test_ledger");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn meta() -> SpaceMeta {
    SpaceMeta {
        id: Ulid::new(),
        name: Some("P-1".into()),
        sensor_dev: Ulid::new(),
        display_dev: Ulid::new(),
        gateway: Ulid::new(),
        enabled: true,
    }
}

fn open_ledger(name: &str) -> (Arc<Ledger>, Arc<TriggerHub>) {
    let hub = Arc::new(TriggerHub::new());
    let ledger = Ledger::open("t".into(), test_wal_path(name), hub.clone()).unwrap();
    (Arc::new(ledger), hub)
}

async fn reservation_count(ledger: &Ledger, space: Ulid) -> usize {
    let ss = ledger.get_space(&space).unwrap();
    let guard = ss.read().await;
    guard.reservations.len()
}

// ── Space registry ───────────────────────────────────────

#[tokio::test]
async fn register_and_list_spaces() {
    let (ledger, _hub) = open_ledger("register_space.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let spaces = ledger.list_spaces();
    assert_eq!(spaces, vec![m]);
}

#[tokio::test]
async fn register_duplicate_space_fails() {
    let (ledger, _hub) = open_ledger("register_dup.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();
    let result = ledger.register_space(m).await;
    assert!(matches!(result, Err(LedgerError::AlreadyExists(_))));
}

#[tokio::test]
async fn update_space_changes_assignments() {
    let (ledger, _hub) = open_ledger("update_space.wal");
    let mut m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    m.enabled = false;
    m.gateway = Ulid::new();
    ledger.update_space(m.clone()).await.unwrap();

    assert_eq!(ledger.get_space_meta(m.id).await, Some(m));
}

#[tokio::test]
async fn remove_space_clears_indexes() {
    let (ledger, _hub) = open_ledger("remove_space.wal");
    let m = meta();
    let sid = m.id;
    ledger.register_space(m).await.unwrap();

    let r = ledger
        .create_reservation(sid, Span::new(T0, T0 + 30 * M), "req-rm", T0)
        .await
        .unwrap();
    ledger.remove_space(sid).await.unwrap();

    assert!(ledger.get_space(&sid).is_none());
    assert!(ledger.space_for_reservation(&r.id).is_none());
    assert!(ledger.get_reservation(r.id).await.is_none());
}

// ── Reservation validation ───────────────────────────────

#[tokio::test]
async fn create_rejects_inverted_span() {
    let (ledger, _hub) = open_ledger("inverted_span.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let result = ledger
        .create_reservation(m.id, Span { start: T0 + H, end: T0 }, "req-1", T0)
        .await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
}

#[tokio::test]
async fn create_rejects_too_short() {
    let (ledger, _hub) = open_ledger("too_short.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let result = ledger
        .create_reservation(m.id, Span::new(T0, T0 + 14 * M), "req-1", T0)
        .await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));

    // Exactly 15 minutes is allowed
    ledger
        .create_reservation(m.id, Span::new(T0, T0 + 15 * M), "req-2", T0)
        .await
        .unwrap();
}

#[tokio::test]
async fn create_rejects_out_of_range_timestamps() {
    let (ledger, _hub) = open_ledger("bad_ts.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let result = ledger
        .create_reservation(m.id, Span::new(0, H), "req-1", T0)
        .await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
}

#[tokio::test]
async fn create_rejects_empty_request_id() {
    let (ledger, _hub) = open_ledger("empty_req.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let result = ledger
        .create_reservation(m.id, Span::new(T0, T0 + H), "", T0)
        .await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
}

#[tokio::test]
async fn create_on_unknown_space_fails() {
    let (ledger, _hub) = open_ledger("unknown_space.wal");
    let result = ledger
        .create_reservation(Ulid::new(), Span::new(T0, T0 + H), "req-1", T0)
        .await;
    assert!(matches!(result, Err(LedgerError::NotFound(_))));
}

// ── Overlap semantics ────────────────────────────────────

#[tokio::test]
async fn overlapping_reservation_conflicts() {
    let (ledger, _hub) = open_ledger("overlap.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let first = ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-1", T0)
        .await
        .unwrap();
    let result = ledger
        .create_reservation(m.id, Span::new(T0 + 15 * M, T0 + 45 * M), "req-2", T0)
        .await;
    assert!(matches!(result, Err(LedgerError::Conflict(id)) if id == first.id));
}

#[tokio::test]
async fn touching_reservations_do_not_conflict() {
    let (ledger, _hub) = open_ledger("touching.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-1", T0)
        .await
        .unwrap();
    // Starts exactly where the first ends
    ledger
        .create_reservation(m.id, Span::new(T0 + 30 * M, T0 + 60 * M), "req-2", T0)
        .await
        .unwrap();
    assert_eq!(reservation_count(&ledger, m.id).await, 2);
}

#[tokio::test]
async fn cancelled_reservation_frees_the_range() {
    let (ledger, _hub) = open_ledger("cancel_frees.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let r = ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-1", T0)
        .await
        .unwrap();
    ledger.cancel_reservation(r.id).await.unwrap();

    // Same range is bookable again under a new request id
    ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-2", T0)
        .await
        .unwrap();
}

// ── Idempotency ──────────────────────────────────────────

#[tokio::test]
async fn same_request_id_returns_original() {
    let (ledger, _hub) = open_ledger("idempotent.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let span = Span::new(T0, T0 + 30 * M);
    let first = ledger
        .create_reservation(m.id, span, "req-1", T0)
        .await
        .unwrap();
    let second = ledger
        .create_reservation(m.id, span, "req-1", T0 + M)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(reservation_count(&ledger, m.id).await, 1);
}

#[tokio::test]
async fn idempotent_return_covers_cancelled_reservations() {
    let (ledger, _hub) = open_ledger("idempotent_cancelled.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let span = Span::new(T0, T0 + 30 * M);
    let first = ledger
        .create_reservation(m.id, span, "req-1", T0)
        .await
        .unwrap();
    ledger.cancel_reservation(first.id).await.unwrap();

    // The retry sees the cancelled record, not a fresh booking
    let retry = ledger
        .create_reservation(m.id, span, "req-1", T0)
        .await
        .unwrap();
    assert_eq!(retry.id, first.id);
    assert_eq!(retry.status, ReservationStatus::Cancelled);
    assert_eq!(reservation_count(&ledger, m.id).await, 1);
}

#[tokio::test]
async fn concurrent_retries_converge_on_one_record() {
    let (ledger, _hub) = open_ledger("concurrent_retries.wal");
    let m = meta();
    let sid = m.id;
    ledger.register_space(m).await.unwrap();

    let span = Span::new(T0, T0 + 30 * M);
    let mut joins = Vec::new();
    for _ in 0..16 {
        let ledger = ledger.clone();
        joins.push(tokio::spawn(async move {
            ledger.create_reservation(sid, span, "req-race", T0).await
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for j in joins {
        ids.insert(j.await.unwrap().unwrap().id);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(reservation_count(&ledger, sid).await, 1);
}

#[tokio::test]
async fn concurrent_overlapping_creates_yield_one_success() {
    let (ledger, _hub) = open_ledger("concurrent_overlap.wal");
    let m = meta();
    let sid = m.id;
    ledger.register_space(m).await.unwrap();

    let a = ledger.clone();
    let b = ledger.clone();
    let ja = tokio::spawn(async move {
        a.create_reservation(sid, Span::new(T0, T0 + 30 * M), "req-a", T0).await
    });
    let jb = tokio::spawn(async move {
        b.create_reservation(sid, Span::new(T0 + 15 * M, T0 + 45 * M), "req-b", T0).await
    });

    let results = [ja.await.unwrap(), jb.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(LedgerError::Conflict(_))))
        .count();
    assert_eq!((successes, conflicts), (1, 1));
    assert_eq!(reservation_count(&ledger, sid).await, 1);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_is_idempotent() {
    let (ledger, _hub) = open_ledger("cancel_idem.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let r = ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-1", T0)
        .await
        .unwrap();

    let once = ledger.cancel_reservation(r.id).await.unwrap();
    assert_eq!(once.status, ReservationStatus::Cancelled);

    let twice = ledger.cancel_reservation(r.id).await.unwrap();
    assert_eq!(twice, once);
}

#[tokio::test]
async fn cancel_unknown_reservation_fails() {
    let (ledger, _hub) = open_ledger("cancel_unknown.wal");
    let result = ledger.cancel_reservation(Ulid::new()).await;
    assert!(matches!(result, Err(LedgerError::NotFound(_))));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_active_is_ordered_and_windowed() {
    let (ledger, _hub) = open_ledger("list_active.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    // Insert out of order
    ledger
        .create_reservation(m.id, Span::new(T0 + 2 * H, T0 + 3 * H), "req-b", T0)
        .await
        .unwrap();
    ledger
        .create_reservation(m.id, Span::new(T0, T0 + H), "req-a", T0)
        .await
        .unwrap();
    let cancelled = ledger
        .create_reservation(m.id, Span::new(T0 + 4 * H, T0 + 5 * H), "req-c", T0)
        .await
        .unwrap();
    ledger.cancel_reservation(cancelled.id).await.unwrap();

    let active = ledger
        .list_active(m.id, Span::new(T0, T0 + 6 * H))
        .await
        .unwrap();
    assert_eq!(active.len(), 2);
    assert!(active[0].span.start < active[1].span.start);

    // Window that only covers the first
    let active = ledger
        .list_active(m.id, Span::new(T0, T0 + 30 * M))
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].request_id, "req-a");
}

#[tokio::test]
async fn list_active_rejects_oversized_window() {
    let (ledger, _hub) = open_ledger("list_window.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let result = ledger
        .list_active(m.id, Span::new(T0, T0 + crate::limits::MAX_LIST_WINDOW_MS + 1))
        .await;
    assert!(matches!(result, Err(LedgerError::LimitExceeded(_))));
}

#[tokio::test]
async fn display_inputs_filters_expired_override() {
    let (ledger, _hub) = open_ledger("inputs_override.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    ledger
        .set_override(m.id, OverrideState::Closed, T0, Some(T0 + H))
        .await
        .unwrap();

    let before = ledger.display_inputs(m.id, T0 + 30 * M).await.unwrap();
    assert!(before.admin_override.is_some());

    let after = ledger.display_inputs(m.id, T0 + 2 * H).await.unwrap();
    assert!(after.admin_override.is_none());
}

#[tokio::test]
async fn display_inputs_pick_covering_reservation() {
    let (ledger, _hub) = open_ledger("inputs_reservation.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let r = ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-1", T0)
        .await
        .unwrap();

    let during = ledger.display_inputs(m.id, T0 + 15 * M).await.unwrap();
    assert_eq!(during.reservation.map(|x| x.id), Some(r.id));

    let after = ledger.display_inputs(m.id, T0 + 45 * M).await.unwrap();
    assert!(after.reservation.is_none());
}

// ── Occupancy intake ─────────────────────────────────────

#[tokio::test]
async fn occupancy_recorded_and_stale_frames_dropped() {
    let (ledger, _hub) = open_ledger("occupancy.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    assert!(ledger
        .record_occupancy(m.id, OccupancyState::Occupied, T0, m.sensor_dev, 10)
        .await
        .unwrap());

    // Same frame again — duplicate
    assert!(!ledger
        .record_occupancy(m.id, OccupancyState::Free, T0 + M, m.sensor_dev, 10)
        .await
        .unwrap());
    // Older frame — out of order
    assert!(!ledger
        .record_occupancy(m.id, OccupancyState::Free, T0 + M, m.sensor_dev, 9)
        .await
        .unwrap());

    let snap = ledger.get_snapshot(m.id).await.unwrap();
    assert_eq!(snap.state, OccupancyState::Occupied);
    assert_eq!(snap.frame_seq, 10);

    // Newer frame wins
    assert!(ledger
        .record_occupancy(m.id, OccupancyState::Free, T0 + 2 * M, m.sensor_dev, 11)
        .await
        .unwrap());
    let snap = ledger.get_snapshot(m.id).await.unwrap();
    assert_eq!(snap.state, OccupancyState::Free);
}

#[tokio::test]
async fn occupancy_from_unassigned_device_rejected() {
    let (ledger, _hub) = open_ledger("occupancy_device.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let result = ledger
        .record_occupancy(m.id, OccupancyState::Occupied, T0, Ulid::new(), 1)
        .await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
}

// ── Triggers ─────────────────────────────────────────────

#[tokio::test]
async fn mutations_publish_recompute_triggers() {
    let (ledger, hub) = open_ledger("triggers.wal");
    let mut rx = hub.subscribe();

    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().cause, TriggerCause::SpaceChanged);

    let r = ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-1", T0)
        .await
        .unwrap();
    let t = rx.recv().await.unwrap();
    assert_eq!((t.space, t.cause), (m.id, TriggerCause::ReservationCreated));

    ledger.cancel_reservation(r.id).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().cause, TriggerCause::ReservationCancelled);

    ledger
        .record_occupancy(m.id, OccupancyState::Free, T0, m.sensor_dev, 1)
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().cause, TriggerCause::Uplink);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("reopen.wal");
    let m = meta();
    let first_id;
    {
        let hub = Arc::new(TriggerHub::new());
        let ledger = Ledger::open("t".into(), path.clone(), hub).unwrap();
        ledger.register_space(m.clone()).await.unwrap();
        first_id = ledger
            .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-1", T0)
            .await
            .unwrap()
            .id;
        ledger
            .record_occupancy(m.id, OccupancyState::Occupied, T0, m.sensor_dev, 3)
            .await
            .unwrap();
        ledger
            .set_override(m.id, OverrideState::Closed, T0, None)
            .await
            .unwrap();
    }

    let hub = Arc::new(TriggerHub::new());
    let ledger = Ledger::open("t".into(), path, hub).unwrap();

    // Idempotent retry across restart returns the original record
    let retry = ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-1", T0)
        .await
        .unwrap();
    assert_eq!(retry.id, first_id);

    // Overlap invariant still enforced
    let conflict = ledger
        .create_reservation(m.id, Span::new(T0 + 15 * M, T0 + 45 * M), "req-2", T0)
        .await;
    assert!(matches!(conflict, Err(LedgerError::Conflict(_))));

    let snap = ledger.get_snapshot(m.id).await.unwrap();
    assert_eq!(snap.frame_seq, 3);
    let inputs = ledger.display_inputs(m.id, T0).await.unwrap();
    assert!(inputs.admin_override.is_some());
}

#[tokio::test]
async fn compaction_prunes_old_cancelled_but_keeps_recent() {
    let path = test_wal_path("compact_prune.wal");
    let hub = Arc::new(TriggerHub::new());
    let ledger = Ledger::open("t".into(), path.clone(), hub).unwrap();

    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    let old = ledger
        .create_reservation(m.id, Span::new(T0, T0 + 30 * M), "req-old", T0)
        .await
        .unwrap();
    ledger.cancel_reservation(old.id).await.unwrap();
    let recent = ledger
        .create_reservation(m.id, Span::new(T0 + 10 * H, T0 + 11 * H), "req-recent", T0)
        .await
        .unwrap();
    ledger.cancel_reservation(recent.id).await.unwrap();

    // Retention window ends between the two reservations
    ledger.compact_wal(T0 + 12 * H, 3 * H).await.unwrap();

    assert!(ledger.get_reservation(old.id).await.is_none());
    assert!(ledger.get_reservation(recent.id).await.is_some());

    // The pruned request id books as new; the retained one stays idempotent
    let reuse_old = ledger
        .create_reservation(m.id, Span::new(T0 + 20 * H, T0 + 21 * H), "req-old", T0)
        .await
        .unwrap();
    assert_ne!(reuse_old.id, old.id);
    let retry_recent = ledger
        .create_reservation(m.id, Span::new(T0 + 10 * H, T0 + 11 * H), "req-recent", T0)
        .await
        .unwrap();
    assert_eq!(retry_recent.id, recent.id);

    // Reopen from the compacted journal
    drop(ledger);
    let hub = Arc::new(TriggerHub::new());
    let reopened = Ledger::open("t".into(), path, hub).unwrap();
    assert!(reopened.get_reservation(recent.id).await.is_some());
    assert!(reopened.get_reservation(old.id).await.is_none());
}

// ── End-to-end booking scenario ──────────────────────────

#[tokio::test]
async fn booking_scenario_conflict_then_idempotent_retry() {
    let (ledger, _hub) = open_ledger("scenario.wal");
    let m = meta();
    ledger.register_space(m.clone()).await.unwrap();

    // 10:00–10:30 books fine
    let ten = T0;
    let r1 = ledger
        .create_reservation(m.id, Span::new(ten, ten + 30 * M), "req-1", ten)
        .await
        .unwrap();

    // 10:15–10:45 conflicts
    let r2 = ledger
        .create_reservation(m.id, Span::new(ten + 15 * M, ten + 45 * M), "req-2", ten)
        .await;
    assert!(matches!(r2, Err(LedgerError::Conflict(id)) if id == r1.id));

    // Retrying req-1 with identical parameters returns the original record
    let retry = ledger
        .create_reservation(m.id, Span::new(ten, ten + 30 * M), "req-1", ten)
        .await
        .unwrap();
    assert_eq!(retry.id, r1.id);
    assert_eq!(reservation_count(&ledger, m.id).await, 1);
}
