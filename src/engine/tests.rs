use std::path::PathBuf;
use std::sync::Arc;

use proptest::prelude::*;
use ulid::Ulid;

use super::*;
use crate::limits::*;
use crate::model::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
/// 2026-01-01T00:00:00Z; tests speak in offsets from here.
const T0: Ms = 1_767_225_600_000;

fn at(hour: Ms, minute: Ms) -> Ms {
    T0 + hour * H + minute * M
}

fn window(from: (Ms, Ms), to: (Ms, Ms)) -> Span {
    Span::new(at(from.0, from.1), at(to.0, to.1))
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("appointd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn add_patient(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .register_patient(Patient {
            id,
            name: "Ada Lovelace".into(),
            email: Some("ada@example.com".into()),
            phone: None,
            birth_date: Some("1815-12-10".into()),
            created_at: 0,
        })
        .await
        .unwrap();
    id
}

async fn add_doctor(engine: &Engine) -> Ulid {
    let id = Ulid::new();
    engine
        .register_doctor(Doctor {
            id,
            name: "Dr. Ortiz".into(),
            specialty: "Cardiology".into(),
            created_at: 0,
        })
        .await
        .unwrap();
    id
}

/// Engine with one patient and one doctor.
async fn setup(name: &str) -> (Engine, Ulid, Ulid) {
    let engine = Engine::new(test_wal_path(name)).unwrap();
    let patient = add_patient(&engine).await;
    let doctor = add_doctor(&engine).await;
    (engine, patient, doctor)
}

async fn assert_no_overlap(engine: &Engine, doctor: Ulid) {
    let active: Vec<Appointment> = engine
        .list_doctor_appointments(doctor)
        .await
        .into_iter()
        .filter(|a| a.status.is_active())
        .collect();
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            assert!(
                !a.span.overlaps(&b.span),
                "active appointments overlap: {} {} and {} {}",
                a.id,
                a.span,
                b.id,
                b.span
            );
        }
    }
}

// ── Create ───────────────────────────────────────────────

#[tokio::test]
async fn create_assigns_id_and_schedules() {
    let (engine, patient, doctor) = setup("create.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (10, 30)), Some("checkup".into()))
        .await
        .unwrap();

    assert_eq!(a.status, Status::Scheduled);
    assert_eq!(a.patient_id, patient);
    assert_eq!(a.doctor_id, doctor);
    assert_eq!(a.notes.as_deref(), Some("checkup"));
    assert_eq!(engine.get_appointment(a.id).await.unwrap(), a);
}

#[tokio::test]
async fn touching_windows_do_not_conflict() {
    let (engine, patient, doctor) = setup("boundary.wal").await;

    engine
        .create_appointment(patient, doctor, window((10, 0), (10, 30)), None)
        .await
        .unwrap();
    engine
        .create_appointment(patient, doctor, window((10, 30), (11, 0)), None)
        .await
        .unwrap();
    // And the slot just before.
    engine
        .create_appointment(patient, doctor, window((9, 30), (10, 0)), None)
        .await
        .unwrap();

    assert_eq!(engine.list_doctor_appointments(doctor).await.len(), 3);
}

#[tokio::test]
async fn overlapping_create_rejected_with_conflict_details() {
    let (engine, patient, doctor) = setup("overlap.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let result = engine
        .create_appointment(patient, doctor, window((10, 45), (11, 15)), None)
        .await;

    assert_eq!(
        result,
        Err(EngineError::Unavailable {
            conflict: a.id,
            span: a.span
        })
    );
    assert_eq!(engine.list_doctor_appointments(doctor).await, vec![a]);
}

#[tokio::test]
async fn contained_and_containing_windows_conflict() {
    let (engine, patient, doctor) = setup("containment.wal").await;

    engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();

    let inner = engine
        .create_appointment(patient, doctor, window((10, 15), (10, 45)), None)
        .await;
    assert!(matches!(inner, Err(EngineError::Unavailable { .. })));

    let outer = engine
        .create_appointment(patient, doctor, window((9, 0), (12, 0)), None)
        .await;
    assert!(matches!(outer, Err(EngineError::Unavailable { .. })));
}

#[tokio::test]
async fn other_doctor_is_independent() {
    let (engine, patient, doctor) = setup("two_doctors.wal").await;
    let other = add_doctor(&engine).await;

    engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    engine
        .create_appointment(patient, other, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn inverted_window_rejected_without_state_change() {
    let (engine, patient, doctor) = setup("inverted.wal").await;
    let before = engine.wal_appends_since_compact().await;

    let inverted = window((11, 0), (10, 0));
    assert_eq!(
        engine.create_appointment(patient, doctor, inverted, None).await,
        Err(EngineError::InvalidWindow(inverted))
    );
    let empty = window((10, 0), (10, 0));
    assert_eq!(
        engine.create_appointment(patient, doctor, empty, None).await,
        Err(EngineError::InvalidWindow(empty))
    );

    assert!(engine.list_appointments().await.is_empty());
    assert_eq!(engine.wal_appends_since_compact().await, before);
}

#[tokio::test]
async fn unknown_patient_and_doctor_rejected() {
    let (engine, patient, doctor) = setup("unknown_refs.wal").await;
    let stranger = Ulid::new();

    assert_eq!(
        engine
            .create_appointment(stranger, doctor, window((10, 0), (11, 0)), None)
            .await,
        Err(EngineError::UnknownPatient(stranger))
    );
    assert_eq!(
        engine
            .create_appointment(patient, stranger, window((10, 0), (11, 0)), None)
            .await,
        Err(EngineError::UnknownDoctor(stranger))
    );
}

#[tokio::test]
async fn limits_enforced() {
    let (engine, patient, doctor) = setup("limits.wal").await;

    let too_long = Span::new(T0, T0 + MAX_SPAN_DURATION_MS + 1);
    assert!(matches!(
        engine.create_appointment(patient, doctor, too_long, None).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let ancient = Span::new(0, H);
    assert!(matches!(
        engine.create_appointment(patient, doctor, ancient, None).await,
        Err(EngineError::LimitExceeded(_))
    ));

    let notes = "x".repeat(MAX_NOTES_LEN + 1);
    assert!(matches!(
        engine
            .create_appointment(patient, doctor, window((10, 0), (11, 0)), Some(notes))
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Cancel / complete ────────────────────────────────────

#[tokio::test]
async fn cancellation_frees_the_slot() {
    let (engine, patient, doctor) = setup("cancel_frees.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let cancelled = engine.cancel_appointment(a.id).await.unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);

    let b = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    assert_ne!(a.id, b.id);
    assert_no_overlap(&engine, doctor).await;
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let (engine, patient, doctor) = setup("cancel_twice.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let first = engine.cancel_appointment(a.id).await.unwrap();
    let appends = engine.wal_appends_since_compact().await;

    let second = engine.cancel_appointment(a.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn cancel_unknown_is_not_found() {
    let (engine, _, _) = setup("cancel_missing.wal").await;
    let id = Ulid::new();
    assert_eq!(engine.cancel_appointment(id).await, Err(EngineError::NotFound(id)));
}

#[tokio::test]
async fn completed_appointment_keeps_its_window() {
    let (engine, patient, doctor) = setup("completed_blocks.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    assert_eq!(
        engine.complete_appointment(a.id).await.unwrap().status,
        Status::Completed
    );

    let result = engine
        .create_appointment(patient, doctor, window((10, 30), (11, 30)), None)
        .await;
    assert!(matches!(result, Err(EngineError::Unavailable { conflict, .. }) if conflict == a.id));
}

#[tokio::test]
async fn terminal_states_do_not_transition() {
    let (engine, patient, doctor) = setup("terminal.wal").await;

    let done = engine
        .create_appointment(patient, doctor, window((9, 0), (10, 0)), None)
        .await
        .unwrap();
    engine.complete_appointment(done.id).await.unwrap();
    assert_eq!(
        engine.cancel_appointment(done.id).await,
        Err(EngineError::InvalidTransition {
            id: done.id,
            from: Status::Completed,
            to: Status::Cancelled
        })
    );

    let dropped = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    engine.cancel_appointment(dropped.id).await.unwrap();
    assert!(matches!(
        engine.complete_appointment(dropped.id).await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine
            .update_appointment(dropped.id, AppointmentPatch::status(Status::Scheduled))
            .await,
        Err(EngineError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine
            .update_appointment(dropped.id, AppointmentPatch::reschedule(window((12, 0), (13, 0))))
            .await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

// ── Update ───────────────────────────────────────────────

#[tokio::test]
async fn reschedule_excludes_itself() {
    let (engine, patient, doctor) = setup("self_exclusion.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let moved = engine
        .update_appointment(a.id, AppointmentPatch::reschedule(window((10, 15), (11, 15))))
        .await
        .unwrap();

    assert_eq!(moved.id, a.id);
    assert_eq!(moved.span, window((10, 15), (11, 15)));
    assert_eq!(engine.get_appointment(a.id).await.unwrap(), moved);
}

#[tokio::test]
async fn reschedule_into_other_appointment_rejected() {
    let (engine, patient, doctor) = setup("reschedule_conflict.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let b = engine
        .create_appointment(patient, doctor, window((11, 0), (12, 0)), None)
        .await
        .unwrap();

    let patch = AppointmentPatch {
        end: Some(at(11, 30)),
        ..AppointmentPatch::default()
    };
    assert_eq!(
        engine.update_appointment(a.id, patch).await,
        Err(EngineError::Unavailable {
            conflict: b.id,
            span: b.span
        })
    );
    assert_eq!(engine.get_appointment(a.id).await.unwrap(), a);
}

#[tokio::test]
async fn reschedule_over_cancelled_allowed() {
    let (engine, patient, doctor) = setup("reschedule_over_cancelled.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let b = engine
        .create_appointment(patient, doctor, window((11, 0), (12, 0)), None)
        .await
        .unwrap();
    engine.cancel_appointment(b.id).await.unwrap();

    engine
        .update_appointment(a.id, AppointmentPatch::reschedule(window((11, 0), (12, 0))))
        .await
        .unwrap();
    assert_no_overlap(&engine, doctor).await;
}

#[tokio::test]
async fn update_inverted_window_rejected() {
    let (engine, patient, doctor) = setup("update_inverted.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let patch = AppointmentPatch {
        start: Some(at(12, 0)),
        ..AppointmentPatch::default()
    };
    assert!(matches!(
        engine.update_appointment(a.id, patch).await,
        Err(EngineError::InvalidWindow(_))
    ));
    assert_eq!(engine.get_appointment(a.id).await.unwrap(), a);
}

#[tokio::test]
async fn update_notes_only_skips_conflict_check() {
    let (engine, patient, doctor) = setup("update_notes.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let patch = AppointmentPatch {
        notes: Some(Some("bring x-rays".into())),
        ..AppointmentPatch::default()
    };
    let updated = engine.update_appointment(a.id, patch).await.unwrap();
    assert_eq!(updated.notes.as_deref(), Some("bring x-rays"));
    assert_eq!(updated.span, a.span);
}

#[tokio::test]
async fn noop_update_is_not_persisted() {
    let (engine, patient, doctor) = setup("noop_update.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let appends = engine.wal_appends_since_compact().await;
    let same = engine
        .update_appointment(a.id, AppointmentPatch::reschedule(a.span))
        .await
        .unwrap();
    assert_eq!(same, a);
    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn update_unknown_is_not_found() {
    let (engine, _, _) = setup("update_missing.wal").await;
    let id = Ulid::new();
    assert_eq!(
        engine
            .update_appointment(id, AppointmentPatch::reschedule(window((10, 0), (11, 0))))
            .await,
        Err(EngineError::NotFound(id))
    );
}

#[tokio::test]
async fn update_missing_reports_not_found_before_unknown_doctor() {
    let (engine, _, _) = setup("update_missing_unknown_doctor.wal").await;
    let (id, nobody) = (Ulid::new(), Ulid::new());
    let patch = AppointmentPatch {
        doctor_id: Some(nobody),
        ..AppointmentPatch::default()
    };
    assert_eq!(
        engine.update_appointment(id, patch).await,
        Err(EngineError::NotFound(id))
    );
    assert!(engine.store.existing_calendar(&nobody).is_none());
}

#[tokio::test]
async fn move_to_other_doctor_checks_target_calendar() {
    let (engine, patient, doctor) = setup("move_doctor.wal").await;
    let other = add_doctor(&engine).await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let blocker = engine
        .create_appointment(patient, other, window((10, 30), (11, 30)), None)
        .await
        .unwrap();

    let to_other = AppointmentPatch {
        doctor_id: Some(other),
        ..AppointmentPatch::default()
    };
    assert_eq!(
        engine.update_appointment(a.id, to_other.clone()).await,
        Err(EngineError::Unavailable {
            conflict: blocker.id,
            span: blocker.span
        })
    );

    engine.cancel_appointment(blocker.id).await.unwrap();
    let moved = engine.update_appointment(a.id, to_other).await.unwrap();
    assert_eq!(moved.doctor_id, other);
    assert!(engine.list_doctor_appointments(doctor).await.is_empty());
    assert_eq!(engine.get_appointment(a.id).await.unwrap().doctor_id, other);

    // The old doctor's slot is free again.
    engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn move_to_unknown_doctor_rejected() {
    let (engine, patient, doctor) = setup("move_unknown.wal").await;
    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let nobody = Ulid::new();
    let patch = AppointmentPatch {
        doctor_id: Some(nobody),
        ..AppointmentPatch::default()
    };
    assert_eq!(
        engine.update_appointment(a.id, patch).await,
        Err(EngineError::UnknownDoctor(nobody))
    );
}

// ── Remove ───────────────────────────────────────────────

#[tokio::test]
async fn remove_deletes_in_any_status() {
    let (engine, patient, doctor) = setup("remove.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let b = engine
        .create_appointment(patient, doctor, window((11, 0), (12, 0)), None)
        .await
        .unwrap();
    engine.complete_appointment(b.id).await.unwrap();

    assert_eq!(engine.remove_appointment(a.id).await.unwrap(), a);
    engine.remove_appointment(b.id).await.unwrap();

    assert!(engine.list_appointments().await.is_empty());
    assert!(engine.list_patient_appointments(patient).await.is_empty());
    assert_eq!(engine.get_appointment(a.id).await, Err(EngineError::NotFound(a.id)));
    assert_eq!(engine.remove_appointment(a.id).await, Err(EngineError::NotFound(a.id)));

    engine
        .create_appointment(patient, doctor, window((10, 0), (12, 0)), None)
        .await
        .unwrap();
}

// ── Reads ────────────────────────────────────────────────

#[tokio::test]
async fn listings_are_ordered() {
    let (engine, patient, doctor) = setup("listings.wal").await;
    let other_doctor = add_doctor(&engine).await;
    let other_patient = add_patient(&engine).await;

    let late = engine
        .create_appointment(patient, doctor, window((14, 0), (15, 0)), None)
        .await
        .unwrap();
    let early = engine
        .create_appointment(patient, other_doctor, window((8, 0), (9, 0)), None)
        .await
        .unwrap();
    let mid = engine
        .create_appointment(other_patient, doctor, window((11, 0), (12, 0)), None)
        .await
        .unwrap();

    let ids = |v: Vec<Appointment>| v.into_iter().map(|a| a.id).collect::<Vec<_>>();
    assert_eq!(ids(engine.list_appointments().await), vec![late.id, mid.id, early.id]);
    assert_eq!(ids(engine.list_doctor_appointments(doctor).await), vec![mid.id, late.id]);
    assert_eq!(ids(engine.list_patient_appointments(patient).await), vec![early.id, late.id]);
    assert!(engine.list_doctor_appointments(Ulid::new()).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listing_sees_each_appointment_once_during_moves() {
    let (engine, patient, doctor) = setup("listing_moves.wal").await;
    let engine = Arc::new(engine);
    let other = add_doctor(&engine).await;

    let mut ids = Vec::new();
    for hour in 8..12 {
        let a = engine
            .create_appointment(patient, doctor, window((hour, 0), (hour, 30)), None)
            .await
            .unwrap();
        ids.push(a.id);
    }
    ids.sort();

    let mover = {
        let engine = engine.clone();
        let ids = ids.clone();
        tokio::spawn(async move {
            for round in 0..50 {
                let to = if round % 2 == 0 { other } else { doctor };
                for id in &ids {
                    let patch = AppointmentPatch {
                        doctor_id: Some(to),
                        ..AppointmentPatch::default()
                    };
                    engine.update_appointment(*id, patch).await.unwrap();
                }
            }
        })
    };
    while !mover.is_finished() {
        let mut seen: Vec<Ulid> = engine.list_appointments().await.into_iter().map(|a| a.id).collect();
        seen.sort();
        assert_eq!(seen, ids);
        tokio::task::yield_now().await;
    }
    mover.await.unwrap();
}

#[tokio::test]
async fn conflicts_snapshot_lists_active_overlaps() {
    let (engine, patient, doctor) = setup("conflicts_query.wal").await;

    let a = engine
        .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
        .await
        .unwrap();
    let b = engine
        .create_appointment(patient, doctor, window((11, 0), (12, 0)), None)
        .await
        .unwrap();
    engine.cancel_appointment(b.id).await.unwrap();

    let hits = engine.conflicts(doctor, window((10, 30), (11, 30))).await;
    assert_eq!(hits, vec![a]);
}

#[tokio::test]
async fn registry_rejects_duplicates() {
    let (engine, patient, doctor) = setup("registry_dupes.wal").await;

    let again = Patient {
        id: patient,
        name: "Someone else".into(),
        email: None,
        phone: None,
        birth_date: None,
        created_at: 0,
    };
    assert_eq!(
        engine.register_patient(again).await,
        Err(EngineError::AlreadyExists(patient))
    );
    let again = Doctor {
        id: doctor,
        name: "Dr. Who".into(),
        specialty: "Time".into(),
        created_at: 0,
    };
    assert_eq!(
        engine.register_doctor(again).await,
        Err(EngineError::AlreadyExists(doctor))
    );

    let stored = engine.get_patient(patient).unwrap();
    assert_eq!(stored.name, "Ada Lovelace");
    assert_eq!(stored.birth_date.as_deref(), Some("1815-12-10"));
    assert!(stored.created_at > 0);
    assert!(engine.get_doctor(doctor).unwrap().created_at > 0);
    assert_eq!(engine.list_doctors().len(), 1);
    assert!(matches!(engine.get_doctor(Ulid::new()), Err(EngineError::NotFound(_))));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_exactly_one() {
    let (engine, patient, doctor) = setup("race_create.wal").await;
    let engine = Arc::new(engine);

    let (a, b) = tokio::join!(
        {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
                    .await
            })
        },
        {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create_appointment(patient, doctor, window((10, 30), (11, 30)), None)
                    .await
            })
        }
    );
    let results = [a.unwrap(), b.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::Unavailable { .. })))
            .count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_creates_never_double_book() {
    let (engine, patient, doctor) = setup("race_many.wal").await;
    let engine = Arc::new(engine);

    // Every window overlaps every other one.
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let span = Span::new(at(10, i), at(11, i));
            engine.create_appointment(patient, doctor, span, None).await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::Unavailable { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_no_overlap(&engine, doctor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reschedules_into_same_slot_admit_one() {
    let (engine, patient, doctor) = setup("race_reschedule.wal").await;
    let other = add_doctor(&engine).await;
    let engine = Arc::new(engine);

    let a = engine
        .create_appointment(patient, doctor, window((8, 0), (9, 0)), None)
        .await
        .unwrap();
    // Arrives from another doctor's calendar, so the two moves lock in
    // different orders.
    let b = engine
        .create_appointment(patient, other, window((9, 0), (10, 0)), None)
        .await
        .unwrap();

    let (a_id, b_id) = (a.id, b.id);
    let target = window((12, 0), (13, 0));
    let move_a = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .update_appointment(a_id, AppointmentPatch::reschedule(target))
                .await
        })
    };
    let move_b = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let patch = AppointmentPatch {
                doctor_id: Some(doctor),
                ..AppointmentPatch::reschedule(target)
            };
            engine.update_appointment(b_id, patch).await
        })
    };
    let (ra, rb) = (move_a.await.unwrap(), move_b.await.unwrap());

    assert!(ra.is_ok() ^ rb.is_ok(), "exactly one move may win: {ra:?} {rb:?}");
    assert_no_overlap(&engine, doctor).await;
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (patient, doctor, other, snapshot) = {
        let engine = Engine::new(path.clone()).unwrap();
        let patient = add_patient(&engine).await;
        let doctor = add_doctor(&engine).await;
        let other = add_doctor(&engine).await;

        let a = engine
            .create_appointment(patient, doctor, window((10, 0), (11, 0)), Some("a".into()))
            .await
            .unwrap();
        let b = engine
            .create_appointment(patient, doctor, window((11, 0), (12, 0)), None)
            .await
            .unwrap();
        let c = engine
            .create_appointment(patient, doctor, window((12, 0), (13, 0)), None)
            .await
            .unwrap();
        engine
            .update_appointment(
                a.id,
                AppointmentPatch {
                    doctor_id: Some(other),
                    ..AppointmentPatch::reschedule(window((9, 0), (10, 0)))
                },
            )
            .await
            .unwrap();
        engine.cancel_appointment(b.id).await.unwrap();
        engine.remove_appointment(c.id).await.unwrap();

        let snapshot = engine.list_appointments().await;
        engine.shutdown().await.unwrap();
        (patient, doctor, other, snapshot)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.list_appointments().await, snapshot);
    assert_eq!(engine.list_patient_appointments(patient).await.len(), 2);
    assert_eq!(engine.list_doctor_appointments(other).await.len(), 1);
    assert!(engine.get_doctor(doctor).is_ok());

    // The cancelled slot is free, the moved one is not.
    engine
        .create_appointment(patient, doctor, window((11, 0), (12, 0)), None)
        .await
        .unwrap();
    assert!(matches!(
        engine
            .create_appointment(patient, other, window((9, 30), (10, 30)), None)
            .await,
        Err(EngineError::Unavailable { .. })
    ));
}

#[tokio::test]
async fn replay_skips_bookings_that_overlap_active_ones() {
    let path = test_wal_path("replay_overlap.wal");
    let doctor = Ulid::new();
    let booking = |span: Span, status: Status| Appointment {
        id: Ulid::new(),
        patient_id: Ulid::new(),
        doctor_id: doctor,
        span,
        status,
        notes: None,
        created_at: 1,
    };
    let first = booking(window((10, 0), (11, 0)), Status::Scheduled);
    let overlapping = booking(window((10, 30), (11, 30)), Status::Scheduled);
    let cancelled = booking(window((10, 15), (10, 45)), Status::Cancelled);
    let adjacent = booking(window((11, 0), (12, 0)), Status::Scheduled);
    let mut moved_onto_first = adjacent.clone();
    moved_onto_first.span = window((10, 30), (11, 30));
    {
        let mut wal = crate::wal::Wal::open(&path).unwrap();
        for appointment in [&first, &overlapping, &cancelled, &adjacent] {
            wal.append(&Event::AppointmentBooked {
                appointment: appointment.clone(),
            })
            .unwrap();
        }
        wal.append(&Event::AppointmentRevised {
            appointment: moved_onto_first,
        })
        .unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let ids: Vec<Ulid> = engine
        .list_doctor_appointments(doctor)
        .await
        .into_iter()
        .map(|a| a.id)
        .collect();
    assert_eq!(ids, vec![first.id, cancelled.id, adjacent.id]);
    assert_eq!(engine.get_appointment(adjacent.id).await.unwrap().span, adjacent.span);
    assert_no_overlap(&engine, doctor).await;
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let snapshot = {
        let engine = Engine::new(path.clone()).unwrap();
        let patient = add_patient(&engine).await;
        let doctor = add_doctor(&engine).await;
        for hour in 8..16 {
            let a = engine
                .create_appointment(patient, doctor, window((hour, 0), (hour, 45)), None)
                .await
                .unwrap();
            if hour % 2 == 0 {
                engine.cancel_appointment(a.id).await.unwrap();
            } else {
                engine.remove_appointment(a.id).await.unwrap();
            }
        }
        engine
            .create_appointment(patient, doctor, window((17, 0), (18, 0)), None)
            .await
            .unwrap();
        assert!(engine.wal_appends_since_compact().await > 10);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        let snapshot = engine.list_appointments().await;
        engine.shutdown().await.unwrap();
        snapshot
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.list_appointments().await, snapshot);
    assert_eq!(engine.list_patients().len(), 1);
    assert_eq!(engine.list_doctors().len(), 1);
}

#[tokio::test]
async fn mutations_fail_after_shutdown() {
    let (engine, patient, doctor) = setup("shutdown.wal").await;
    engine.shutdown().await.unwrap();

    assert!(matches!(
        engine
            .create_appointment(patient, doctor, window((10, 0), (11, 0)), None)
            .await,
        Err(EngineError::WalError(_))
    ));
    // Nothing was applied.
    assert!(engine.list_appointments().await.is_empty());
}

// ── Invariant ────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Create { doctor: usize, slot: Ms, len: Ms },
    Reschedule { pick: usize, doctor: usize, slot: Ms, len: Ms },
    Cancel { pick: usize },
    Complete { pick: usize },
    Remove { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..2usize, 0..32 as Ms, 1..6 as Ms)
            .prop_map(|(doctor, slot, len)| Op::Create { doctor, slot, len }),
        3 => (any::<usize>(), 0..2usize, 0..32 as Ms, 1..6 as Ms)
            .prop_map(|(pick, doctor, slot, len)| Op::Reschedule { pick, doctor, slot, len }),
        1 => any::<usize>().prop_map(|pick| Op::Cancel { pick }),
        1 => any::<usize>().prop_map(|pick| Op::Complete { pick }),
        1 => any::<usize>().prop_map(|pick| Op::Remove { pick }),
    ]
}

/// Quarter-hour slots from T0.
fn slot_span(slot: Ms, len: Ms) -> Span {
    Span::new(T0 + slot * 15 * M, T0 + (slot + len) * 15 * M)
}

async fn run_ops(ops: Vec<Op>) {
    let engine = Engine::new(test_wal_path(&format!("prop_{}.wal", Ulid::new()))).unwrap();
    let patient = add_patient(&engine).await;
    let doctors = [add_doctor(&engine).await, add_doctor(&engine).await];
    let mut ids: Vec<Ulid> = Vec::new();

    for op in ops {
        match op {
            Op::Create { doctor, slot, len } => {
                let span = slot_span(slot, len);
                let busy = !engine.conflicts(doctors[doctor], span).await.is_empty();
                match engine.create_appointment(patient, doctors[doctor], span, None).await {
                    Ok(a) => {
                        assert!(!busy, "admitted into a busy window {span}");
                        ids.push(a.id);
                    }
                    Err(EngineError::Unavailable { .. }) => assert!(busy),
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            Op::Reschedule { pick, doctor, slot, len } if !ids.is_empty() => {
                let patch = AppointmentPatch {
                    doctor_id: Some(doctors[doctor]),
                    ..AppointmentPatch::reschedule(slot_span(slot, len))
                };
                match engine.update_appointment(ids[pick % ids.len()], patch).await {
                    Ok(_)
                    | Err(EngineError::Unavailable { .. })
                    | Err(EngineError::InvalidTransition { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            Op::Cancel { pick } if !ids.is_empty() => {
                let _ = engine.cancel_appointment(ids[pick % ids.len()]).await;
            }
            Op::Complete { pick } if !ids.is_empty() => {
                let _ = engine.complete_appointment(ids[pick % ids.len()]).await;
            }
            Op::Remove { pick } if !ids.is_empty() => {
                let id = ids.remove(pick % ids.len());
                engine.remove_appointment(id).await.unwrap();
            }
            _ => {}
        }
        for doctor in doctors {
            assert_no_overlap(&engine, doctor).await;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn active_appointments_never_overlap(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(run_ops(ops));
    }
}
