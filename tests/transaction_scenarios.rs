// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end rent/return scenarios through the umbrella crate
//!
//! Everything runs against a real SQLite ledger and the real ingestor; time
//! is driven by a manual clock so deadlines are deterministic.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use lockerkey::config::LockerAssignment;
use lockerkey::hal::{
    Clock, HardwareEventIngestor, ManualClock, SensorAddressResolver, SensorEdge, SensorEvent,
};
use lockerkey::services::{
    BeginError, ConsistencyManager, CoordinatorSettings, Member, OutcomePublisher,
    ReconcileOptions, Rejection, RentalStatus, SensorDisposition, SqliteConsistencyManager,
    TransactionCoordinator, TransactionOutcome,
};
use lockerkey::state_manager::{TransactionKind, TransactionRegistry, TransactionStep};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 14, 0, 0).unwrap()
}

fn locker_table() -> Vec<LockerAssignment> {
    [("A05", 5), ("A06", 6), ("A20", 20)]
        .into_iter()
        .map(|(number, sensor)| LockerAssignment {
            locker_number: number.to_string(),
            zone: "MALE".to_string(),
            sensor_number: sensor,
        })
        .collect()
}

struct Site {
    clock: Arc<ManualClock>,
    store: Arc<SqliteConsistencyManager>,
    coordinator: Arc<TransactionCoordinator>,
    ingestor: Arc<HardwareEventIngestor>,
}

impl Site {
    fn with_store(store: SqliteConsistencyManager, settings: CoordinatorSettings) -> Self {
        let table = locker_table();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(store);
        store.seed_lockers(&table, t0()).unwrap();

        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::new(TransactionRegistry::new(64)),
            store.clone(),
            clock.clone(),
            OutcomePublisher::new(64),
            settings,
        ));
        let ingestor = Arc::new(HardwareEventIngestor::new(
            Arc::new(SensorAddressResolver::new(16, &table).unwrap()),
            coordinator.clone(),
            clock.clone(),
            300,
            4096,
        ));
        Self {
            clock,
            store,
            coordinator,
            ingestor,
        }
    }

    fn new() -> Self {
        let site = Self::with_store(
            SqliteConsistencyManager::in_memory().unwrap(),
            CoordinatorSettings::default(),
        );
        site.add_member(Member::new("M1", "Mira"));
        site.add_member(Member::new("M2", "Noor"));
        site
    }

    fn add_member(&self, member: Member) {
        self.store.upsert_member(&member, t0()).unwrap();
    }

    fn event(&self, locker: &str, edge: SensorEdge) -> SensorDisposition {
        self.coordinator.on_sensor_event(&SensorEvent {
            locker_number: locker.to_string(),
            edge,
            observed_at: self.clock.now(),
        })
    }

    fn renting(&self, member_id: &str) -> Option<String> {
        self.store
            .load_member(member_id)
            .unwrap()
            .unwrap()
            .currently_renting
    }

    fn audit(&self) -> lockerkey::services::ReconcileReport {
        self.coordinator
            .reconcile(ReconcileOptions::audit_only())
            .unwrap()
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_rent_confirmed_by_vacant_edge() {
    let site = Site::new();

    let ticket = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();
    assert_eq!(ticket.step, TransactionStep::AwaitingSensor);

    site.clock.advance(Duration::seconds(4));
    assert!(matches!(
        site.event("A05", SensorEdge::Vacant),
        SensorDisposition::Completed { .. }
    ));

    let status = site.coordinator.query_status(&ticket.transaction_id).unwrap();
    assert_eq!(status.step, TransactionStep::Completed);
    assert_eq!(site.renting("M1").as_deref(), Some("A05"));

    let rental = site.store.rental(ticket.rental_id).unwrap().unwrap();
    assert_eq!(rental.status, RentalStatus::Active);
    assert_eq!(rental.locker_number, "A05");

    let locker = site.store.load_locker("A05").unwrap().unwrap();
    assert_eq!(locker.current_member.as_deref(), Some("M1"));
}

#[test]
fn test_rent_times_out_without_sensor_event() {
    let site = Site::new();
    let mut outcomes = site.coordinator.outcomes().subscribe();

    let ticket = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();

    site.clock.advance(Duration::seconds(29));
    assert!(site.coordinator.sweep_timeouts().is_empty());

    site.clock.advance(Duration::seconds(2));
    let expired = site.coordinator.sweep_timeouts();
    assert_eq!(expired.len(), 1);

    let status = site.coordinator.query_status(&ticket.transaction_id).unwrap();
    assert_eq!(status.step, TransactionStep::TimedOut);
    assert_eq!(site.renting("M1"), None);
    assert_eq!(
        site.store.rental(ticket.rental_id).unwrap().unwrap().status,
        RentalStatus::TimedOut
    );

    let event = outcomes.try_recv().unwrap();
    assert_eq!(event.outcome, TransactionOutcome::TimedOut);
    assert_eq!(event.rental_id, Some(ticket.rental_id));

    // A late edge changes nothing
    assert_eq!(site.event("A05", SensorEdge::Vacant), SensorDisposition::Discarded);
    assert_eq!(site.renting("M1"), None);
}

#[test]
fn test_second_rent_on_busy_locker_rejected() {
    let site = Site::new();
    site.coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();

    let second = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M2", "A05");
    assert!(matches!(
        second,
        Err(BeginError::Rejected(Rejection::LockerBusy { ref locker_number })) if locker_number == "A05"
    ));
    assert!(site.store.rentals_for_member("M2").unwrap().is_empty());
}

#[test]
fn test_wire_event_resolves_through_sensor_number() {
    let site = Site::new();
    let ticket = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A20")
        .unwrap();

    // chip 1, pin 3 with 16 pins per chip is sensor 20
    let line = r#"{"event_type":"sensor_triggered","chip_index":1,"pin_index":3,"edge":"vacant"}"#;
    assert_eq!(site.ingestor.ingest_line("bench", line), 1);

    assert_eq!(
        site.coordinator.query_status(&ticket.transaction_id).unwrap().step,
        TransactionStep::Completed
    );
    assert_eq!(site.renting("M1").as_deref(), Some("A20"));
}

#[test]
fn test_daily_limit_rejects_without_transaction() {
    let site = Site::new();
    let mut member = Member::new("M3", "Ola");
    member.daily_rental_count = 3;
    member.last_rental_time = Some(t0() - Duration::hours(2));
    site.add_member(member);

    let result = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M3", "A05");
    assert!(matches!(
        result,
        Err(BeginError::Rejected(Rejection::DailyLimitReached { count: 3, limit: 3, .. }))
    ));
    assert_eq!(site.coordinator.registry().live_count(), 0);
    assert!(site.store.rentals_for_member("M3").unwrap().is_empty());

    // Yesterday's count does not carry over
    site.clock.advance(Duration::days(1));
    assert!(site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M3", "A05")
        .is_ok());
}

#[test]
fn test_full_rent_then_return_cycle() {
    let site = Site::new();

    let rent = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A06")
        .unwrap();
    site.event("A06", SensorEdge::Vacant);

    site.clock.advance(Duration::minutes(45));
    let ret = site
        .coordinator
        .begin_transaction(TransactionKind::Return, "M1", "A06")
        .unwrap();
    assert_eq!(ret.rental_id, rent.rental_id);

    // Vacant does not confirm a return
    assert!(matches!(
        site.event("A06", SensorEdge::Vacant),
        SensorDisposition::EdgeMismatch { .. }
    ));
    site.clock.advance(Duration::seconds(1));
    assert!(matches!(
        site.event("A06", SensorEdge::Engaged),
        SensorDisposition::Completed { .. }
    ));

    assert_eq!(site.renting("M1"), None);
    let rental = site.store.rental(rent.rental_id).unwrap().unwrap();
    assert_eq!(rental.status, RentalStatus::Completed);
    assert!(site.store.load_locker("A06").unwrap().unwrap().current_member.is_none());
    assert!(site.audit().is_clean());
}

// ============================================================================
// PROPERTIES
// ============================================================================

#[test]
fn test_one_transaction_per_locker_and_per_member() {
    let site = Site::new();
    site.coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();

    assert!(matches!(
        site.coordinator.begin_transaction(TransactionKind::Rent, "M1", "A06"),
        Err(BeginError::Rejected(Rejection::MemberBusy { .. }))
    ));
    assert!(matches!(
        site.coordinator.begin_transaction(TransactionKind::Rent, "M1", "A05"),
        Err(BeginError::Rejected(Rejection::LockerBusy { .. }))
    ));

    let registry = site.coordinator.registry();
    assert_eq!(registry.live_count(), 1);
    assert!(registry.for_locker("A06").is_none());
    assert!(registry.for_member("M2").is_none());
}

#[test]
fn test_wrong_edge_never_advances_transaction() {
    let site = Site::new();
    let ticket = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();

    for _ in 0..5 {
        site.clock.advance(Duration::seconds(1));
        assert!(matches!(
            site.event("A05", SensorEdge::Engaged),
            SensorDisposition::EdgeMismatch { .. }
        ));
    }

    assert_eq!(
        site.coordinator.query_status(&ticket.transaction_id).unwrap().step,
        TransactionStep::AwaitingSensor
    );
    assert_eq!(
        site.store.rental(ticket.rental_id).unwrap().unwrap().status,
        RentalStatus::Pending
    );
}

#[test]
fn test_events_after_resolution_leave_state_alone() {
    let site = Site::new();
    let ticket = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();
    site.event("A05", SensorEdge::Vacant);
    let before = site.store.ledger_stats().unwrap();

    for edge in [SensorEdge::Vacant, SensorEdge::Engaged, SensorEdge::Vacant] {
        site.clock.advance(Duration::seconds(5));
        assert_eq!(site.event("A05", edge), SensorDisposition::Discarded);
    }

    assert_eq!(site.store.ledger_stats().unwrap(), before);
    assert_eq!(site.renting("M1").as_deref(), Some("A05"));
    assert_eq!(
        site.store.rental(ticket.rental_id).unwrap().unwrap().status,
        RentalStatus::Active
    );
}

#[test]
fn test_pointer_invariant_holds_across_mixed_outcomes() {
    let site = Site::new();
    site.add_member(Member::new("M3", "Ola"));

    // Completed rent
    site.coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();
    site.event("A05", SensorEdge::Vacant);

    // Timed-out rent
    site.coordinator
        .begin_transaction(TransactionKind::Rent, "M2", "A06")
        .unwrap();
    site.clock.advance(Duration::seconds(31));
    site.coordinator.sweep_timeouts();

    // Cancelled rent
    let cancelled = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M3", "A20")
        .unwrap();
    site.coordinator.cancel(&cancelled.transaction_id).unwrap();

    // Timed-out return keeps the rental active
    site.coordinator
        .begin_transaction(TransactionKind::Return, "M1", "A05")
        .unwrap();
    site.clock.advance(Duration::seconds(31));
    site.coordinator.sweep_timeouts();

    let report = site.audit();
    assert!(report.is_consistent(), "{report:?}");
    assert_eq!(site.renting("M1").as_deref(), Some("A05"));
    assert_eq!(site.renting("M2"), None);
    assert_eq!(site.renting("M3"), None);

    let stats = site.store.ledger_stats().unwrap();
    assert_eq!(stats.rentals_active, 1);
    assert_eq!(stats.rentals_pending, 0);
}

#[test]
fn test_bounce_burst_dispatches_once() {
    let site = Site::new();
    site.coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();

    let line = r#"{"event_type":"sensor_triggered","chip_index":0,"pin_index":4,"edge":"vacant"}"#;
    let dispatched: usize = (0..6)
        .map(|_| {
            site.clock.advance(Duration::milliseconds(20));
            site.ingestor.ingest_line("bench", line)
        })
        .sum();

    assert_eq!(dispatched, 1);
    let stats = site.ingestor.stats();
    assert_eq!(stats.debounced, 5);
    assert_eq!(site.store.rentals_for_member("M1").unwrap().len(), 1);
}

#[test]
fn test_malformed_and_unmapped_lines_are_dropped() {
    let site = Site::new();
    let ticket = site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M1", "A05")
        .unwrap();

    assert_eq!(site.ingestor.ingest_line("bench", "{not json"), 0);
    assert_eq!(
        site.ingestor.ingest_line(
            "bench",
            r#"{"event_type":"sensor_triggered","chip_index":3,"pin_index":15,"edge":"vacant"}"#
        ),
        0
    );
    assert_eq!(
        site.ingestor
            .ingest_line("bench", r#"{"event_type":"barcode_scanned","data":"0001"}"#),
        0
    );

    let stats = site.ingestor.stats();
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.unmapped, 1);
    assert_eq!(stats.ignored, 1);
    assert_eq!(
        site.coordinator.query_status(&ticket.transaction_id).unwrap().step,
        TransactionStep::AwaitingSensor
    );
}

// ============================================================================
// RESTART
// ============================================================================

#[test]
fn test_restart_fails_orphaned_pending_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("ledger").join("lockerkey.db");

    let (committed, orphaned) = {
        let site = Site::with_store(
            SqliteConsistencyManager::open(&db).unwrap(),
            CoordinatorSettings::default(),
        );
        site.add_member(Member::new("M1", "Mira"));
        site.add_member(Member::new("M2", "Noor"));

        let committed = site
            .coordinator
            .begin_transaction(TransactionKind::Rent, "M1", "A05")
            .unwrap();
        site.event("A05", SensorEdge::Vacant);

        let orphaned = site
            .coordinator
            .begin_transaction(TransactionKind::Rent, "M2", "A06")
            .unwrap();
        (committed.rental_id, orphaned.rental_id)
        // Process dies here with M2's rent still awaiting its sensor
    };

    let site = Site::with_store(
        SqliteConsistencyManager::open(&db).unwrap(),
        CoordinatorSettings::default(),
    );
    let report = site
        .coordinator
        .reconcile(ReconcileOptions::startup())
        .unwrap();

    assert_eq!(report.stale_pending_failed, vec![orphaned]);
    assert!(report.is_consistent());
    assert_eq!(
        site.store.rental(orphaned).unwrap().unwrap().status,
        RentalStatus::Failed
    );
    assert_eq!(
        site.store.rental(committed).unwrap().unwrap().status,
        RentalStatus::Active
    );
    assert_eq!(site.renting("M1").as_deref(), Some("A05"));

    // M2 can try again after the restart
    assert!(site
        .coordinator
        .begin_transaction(TransactionKind::Rent, "M2", "A06")
        .is_ok());
}
