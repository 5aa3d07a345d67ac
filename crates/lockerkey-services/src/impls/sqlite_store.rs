// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
SQLite-backed consistency manager.

Owns the member, locker, and rental tables. Every operation that touches
more than one record runs in a single SQLite transaction; each guarded
`UPDATE` must match exactly one row or the whole unit is rolled back.
*/

use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use lockerkey_config::LockerAssignment;
use lockerkey_state_manager::TransactionKind;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, error, info, warn};

use crate::traits::ConsistencyManager;
use crate::types::{
    CommitReceipt, CommitRequest, DoorStatus, LedgerError, LedgerResult, LedgerStats, Locker,
    MaintenanceStatus, Member, MemberStatus, PendingRental, PointerRepair, ReconcileOptions,
    ReconcileReport, Rental, RentalStatus, SensorState,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const MEMBER_COLUMNS: &str = "member_id, name, barcode, qr_code, status, membership_expires, \
     allowed_zones, currently_renting, daily_rental_count, last_rental_time";

const LOCKER_COLUMNS: &str = "locker_number, zone, sensor_number, sensor_state, door_status, \
     current_member, maintenance_status, last_change_time";

const RENTAL_COLUMNS: &str = "rental_id, transaction_id, member_id, locker_number, status, \
     rental_initiated_time, deadline, sensor_confirmed_time, return_confirmed_time";

// ============================================================================
// ROW MAPPING
// ============================================================================

fn invalid(kind: &'static str, value: impl Into<String>) -> LedgerError {
    LedgerError::InvalidStoredValue {
        kind,
        value: value.into(),
    }
}

struct MemberRow {
    member_id: String,
    name: String,
    barcode: Option<String>,
    qr_code: Option<String>,
    status: String,
    membership_expires: Option<NaiveDate>,
    allowed_zones: String,
    currently_renting: Option<String>,
    daily_rental_count: i64,
    last_rental_time: Option<DateTime<Utc>>,
}

impl MemberRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            member_id: row.get(0)?,
            name: row.get(1)?,
            barcode: row.get(2)?,
            qr_code: row.get(3)?,
            status: row.get(4)?,
            membership_expires: row.get(5)?,
            allowed_zones: row.get(6)?,
            currently_renting: row.get(7)?,
            daily_rental_count: row.get(8)?,
            last_rental_time: row.get(9)?,
        })
    }

    fn into_member(self) -> LedgerResult<Member> {
        let status =
            MemberStatus::parse(&self.status).ok_or_else(|| invalid("member status", &self.status))?;
        let allowed_zones: Vec<String> = serde_json::from_str(&self.allowed_zones)
            .map_err(|_| invalid("allowed zone list", &self.allowed_zones))?;
        let daily_rental_count = u32::try_from(self.daily_rental_count)
            .map_err(|_| invalid("daily rental count", self.daily_rental_count.to_string()))?;

        Ok(Member {
            member_id: self.member_id,
            name: self.name,
            barcode: self.barcode,
            qr_code: self.qr_code,
            status,
            membership_expires: self.membership_expires,
            allowed_zones,
            currently_renting: self.currently_renting,
            daily_rental_count,
            last_rental_time: self.last_rental_time,
        })
    }
}

struct LockerRow {
    locker_number: String,
    zone: String,
    sensor_number: Option<u32>,
    sensor_state: String,
    door_status: String,
    current_member: Option<String>,
    maintenance_status: String,
    last_change_time: DateTime<Utc>,
}

impl LockerRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            locker_number: row.get(0)?,
            zone: row.get(1)?,
            sensor_number: row.get(2)?,
            sensor_state: row.get(3)?,
            door_status: row.get(4)?,
            current_member: row.get(5)?,
            maintenance_status: row.get(6)?,
            last_change_time: row.get(7)?,
        })
    }

    fn into_locker(self) -> LedgerResult<Locker> {
        Ok(Locker {
            sensor_state: SensorState::parse(&self.sensor_state)
                .ok_or_else(|| invalid("sensor state", &self.sensor_state))?,
            door_status: DoorStatus::parse(&self.door_status)
                .ok_or_else(|| invalid("door status", &self.door_status))?,
            maintenance_status: MaintenanceStatus::parse(&self.maintenance_status)
                .ok_or_else(|| invalid("maintenance status", &self.maintenance_status))?,
            locker_number: self.locker_number,
            zone: self.zone,
            sensor_number: self.sensor_number,
            current_member: self.current_member,
            last_change_time: self.last_change_time,
        })
    }
}

struct RentalRow {
    rental_id: i64,
    transaction_id: String,
    member_id: String,
    locker_number: String,
    status: String,
    rental_initiated_time: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    sensor_confirmed_time: Option<DateTime<Utc>>,
    return_confirmed_time: Option<DateTime<Utc>>,
}

impl RentalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rental_id: row.get(0)?,
            transaction_id: row.get(1)?,
            member_id: row.get(2)?,
            locker_number: row.get(3)?,
            status: row.get(4)?,
            rental_initiated_time: row.get(5)?,
            deadline: row.get(6)?,
            sensor_confirmed_time: row.get(7)?,
            return_confirmed_time: row.get(8)?,
        })
    }

    fn into_rental(self) -> LedgerResult<Rental> {
        Ok(Rental {
            status: RentalStatus::parse(&self.status)
                .ok_or_else(|| invalid("rental status", &self.status))?,
            rental_id: self.rental_id,
            transaction_id: self.transaction_id,
            member_id: self.member_id,
            locker_number: self.locker_number,
            rental_initiated_time: self.rental_initiated_time,
            deadline: self.deadline,
            sensor_confirmed_time: self.sensor_confirmed_time,
            return_confirmed_time: self.return_confirmed_time,
        })
    }
}

fn query_member(conn: &Connection, member_id: &str) -> LedgerResult<Option<Member>> {
    conn.query_row(
        &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE member_id = ?1"),
        params![member_id],
        MemberRow::from_row,
    )
    .optional()?
    .map(MemberRow::into_member)
    .transpose()
}

fn query_rentals(conn: &Connection, filter: &str, key: &dyn rusqlite::ToSql) -> LedgerResult<Vec<Rental>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RENTAL_COLUMNS} FROM rentals WHERE {filter} ORDER BY rental_id"
    ))?;
    let rows = stmt
        .query_map([key], RentalRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RentalRow::into_rental).collect()
}

/// Guarded writes must touch exactly one row
fn expect_one(
    changed: usize,
    table: &'static str,
    detail: impl FnOnce() -> String,
) -> LedgerResult<()> {
    if changed == 1 {
        Ok(())
    } else {
        Err(LedgerError::CommitConflict {
            table,
            detail: detail(),
        })
    }
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite implementation of [`ConsistencyManager`]
///
/// One connection behind a mutex; SQLite serialises writers anyway and
/// every call here is short.
pub struct SqliteConsistencyManager {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    /// Offset whose calendar day bounds the daily rental cap
    day_offset: FixedOffset,
}

impl SqliteConsistencyManager {
    /// Open (or create) a database file
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// schema cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!(target: "lockerkey-services", path = %path.display(), "Rental ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            day_offset: utc(),
        })
    }

    /// Private in-memory database (tests, dry runs)
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            day_offset: utc(),
        })
    }

    pub fn with_day_offset(mut self, day_offset: FixedOffset) -> Self {
        self.day_offset = day_offset;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn day_offset(&self) -> FixedOffset {
        self.day_offset
    }

    // ------------------------------------------------------------------
    // Directory maintenance
    // ------------------------------------------------------------------

    /// Insert a member, or update the directory fields of an existing one
    ///
    /// Rental pointer and daily counters are only taken from `member` on
    /// insert; an update never touches them.
    pub fn upsert_member(&self, member: &Member, now: DateTime<Utc>) -> LedgerResult<()> {
        let zones = serde_json::to_string(&member.allowed_zones)
            .map_err(|e| LedgerError::Inconsistent(format!("allowed zones: {e}")))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO members (member_id, name, barcode, qr_code, status, membership_expires,
                 allowed_zones, currently_renting, daily_rental_count, last_rental_time,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(member_id) DO UPDATE SET
                 name = excluded.name,
                 barcode = excluded.barcode,
                 qr_code = excluded.qr_code,
                 status = excluded.status,
                 membership_expires = excluded.membership_expires,
                 allowed_zones = excluded.allowed_zones,
                 updated_at = excluded.updated_at",
            params![
                member.member_id,
                member.name,
                member.barcode,
                member.qr_code,
                member.status.as_str(),
                member.membership_expires,
                zones,
                member.currently_renting,
                member.daily_rental_count,
                member.last_rental_time,
                now,
            ],
        )?;
        Ok(())
    }

    /// Insert a locker, or update its zone and sensor of an existing one
    pub fn upsert_locker(&self, locker: &Locker) -> LedgerResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO lockers (locker_number, zone, sensor_number, sensor_state, door_status,
                 current_member, maintenance_status, last_change_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(locker_number) DO UPDATE SET
                 zone = excluded.zone,
                 sensor_number = excluded.sensor_number",
            params![
                locker.locker_number,
                locker.zone,
                locker.sensor_number,
                locker.sensor_state.as_str(),
                locker.door_status.as_str(),
                locker.current_member,
                locker.maintenance_status.as_str(),
                locker.last_change_time,
            ],
        )?;
        Ok(())
    }

    /// Make the locker table match a sensor mapping
    ///
    /// Lockers missing from `table` keep their rows but lose their sensor.
    /// Returns the number of mapped lockers.
    pub fn seed_lockers(&self, table: &[LockerAssignment], now: DateTime<Utc>) -> LedgerResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("UPDATE lockers SET sensor_number = NULL", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO lockers (locker_number, zone, sensor_number, last_change_time)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(locker_number) DO UPDATE SET
                     zone = excluded.zone,
                     sensor_number = excluded.sensor_number",
            )?;
            for entry in table {
                stmt.execute(params![entry.locker_number, entry.zone, entry.sensor_number, now])?;
            }
        }
        tx.commit()?;
        info!(target: "lockerkey-services", lockers = table.len(), "Locker table seeded");
        Ok(table.len())
    }

    pub fn set_maintenance(
        &self,
        locker_number: &str,
        status: MaintenanceStatus,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE lockers SET maintenance_status = ?2, last_change_time = ?3 WHERE locker_number = ?1",
            params![locker_number, status.as_str(), now],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound {
                kind: "Locker",
                id: locker_number.to_string(),
            });
        }
        info!(target: "lockerkey-services", locker_number, status = %status, "Maintenance status changed");
        Ok(())
    }

    /// Zero every member's daily counter; returns how many changed
    pub fn reset_daily_counts(&self, now: DateTime<Utc>) -> LedgerResult<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE members SET daily_rental_count = 0, updated_at = ?1 WHERE daily_rental_count > 0",
            params![now],
        )?;
        info!(target: "lockerkey-services", members = changed, "Daily rental counts reset");
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Ledger queries
    // ------------------------------------------------------------------

    pub fn rental(&self, rental_id: i64) -> LedgerResult<Option<Rental>> {
        let conn = self.conn.lock();
        Ok(query_rentals(&conn, "rental_id = ?1", &rental_id)?.into_iter().next())
    }

    pub fn rental_by_transaction(&self, transaction_id: &str) -> LedgerResult<Option<Rental>> {
        let conn = self.conn.lock();
        Ok(query_rentals(&conn, "transaction_id = ?1", &transaction_id)?
            .into_iter()
            .next())
    }

    /// Full history for a member, oldest first
    pub fn rentals_for_member(&self, member_id: &str) -> LedgerResult<Vec<Rental>> {
        let conn = self.conn.lock();
        query_rentals(&conn, "member_id = ?1", &member_id)
    }

    pub fn ledger_stats(&self) -> LedgerResult<LedgerStats> {
        let conn = self.conn.lock();
        let count = |sql: &str| -> LedgerResult<u64> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        };

        let mut stats = LedgerStats {
            members: count("SELECT COUNT(*) FROM members")?,
            lockers: count("SELECT COUNT(*) FROM lockers")?,
            lockers_available: count(
                "SELECT COUNT(*) FROM lockers
                 WHERE current_member IS NULL AND maintenance_status = 'in_service'",
            )?,
            ..LedgerStats::default()
        };

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM rentals GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, n) in rows {
            let n = n.max(0) as u64;
            match RentalStatus::parse(&status) {
                Some(RentalStatus::Pending) => stats.rentals_pending = n,
                Some(RentalStatus::Active) => stats.rentals_active = n,
                Some(RentalStatus::Completed) => stats.rentals_completed = n,
                Some(RentalStatus::TimedOut) => stats.rentals_timed_out = n,
                Some(RentalStatus::Failed) => stats.rentals_failed = n,
                None => return Err(invalid("rental status", status)),
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Commit units
    // ------------------------------------------------------------------

    fn commit_rent(&self, request: &CommitRequest) -> LedgerResult<CommitReceipt> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let at = request.confirmed_at;

        let changed = tx.execute(
            "UPDATE rentals SET status = 'active', sensor_confirmed_time = ?2, updated_at = ?2
             WHERE rental_id = ?1 AND status = 'pending' AND transaction_id = ?3
               AND member_id = ?4 AND locker_number = ?5",
            params![
                request.rental_id,
                at,
                request.transaction_id,
                request.member_id,
                request.locker_number
            ],
        )?;
        if changed != 1 {
            return Err(LedgerError::RentalNotPending {
                rental_id: request.rental_id,
            });
        }

        let member = query_member(&tx, &request.member_id)?.ok_or_else(|| LedgerError::NotFound {
            kind: "Member",
            id: request.member_id.clone(),
        })?;
        if let Some(current) = &member.currently_renting {
            return Err(LedgerError::CommitConflict {
                table: "members",
                detail: format!("member {} already renting {}", member.member_id, current),
            });
        }
        let daily_rental_count = member.rentals_today(at, self.day_offset) + 1;

        let changed = tx.execute(
            "UPDATE members SET currently_renting = ?2, daily_rental_count = ?3,
                 last_rental_time = ?4, updated_at = ?4
             WHERE member_id = ?1 AND currently_renting IS NULL",
            params![request.member_id, request.locker_number, daily_rental_count, at],
        )?;
        expect_one(changed, "members", || {
            format!("member {} pointer changed during commit", request.member_id)
        })?;

        let changed = tx.execute(
            "UPDATE lockers SET sensor_state = 'vacant', current_member = ?2, last_change_time = ?3
             WHERE locker_number = ?1 AND current_member IS NULL",
            params![request.locker_number, request.member_id, at],
        )?;
        expect_one(changed, "lockers", || {
            format!("locker {} is not free", request.locker_number)
        })?;

        tx.commit()?;
        Ok(CommitReceipt {
            rental_id: request.rental_id,
            daily_rental_count,
        })
    }

    fn commit_return(&self, request: &CommitRequest) -> LedgerResult<CommitReceipt> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let at = request.confirmed_at;

        let changed = tx.execute(
            "UPDATE rentals SET status = 'completed', return_confirmed_time = ?2, updated_at = ?2
             WHERE rental_id = ?1 AND status = 'active' AND member_id = ?3 AND locker_number = ?4",
            params![request.rental_id, at, request.member_id, request.locker_number],
        )?;
        expect_one(changed, "rentals", || {
            format!("rental {} is not active", request.rental_id)
        })?;

        let changed = tx.execute(
            "UPDATE members SET currently_renting = NULL, updated_at = ?3
             WHERE member_id = ?1 AND currently_renting = ?2",
            params![request.member_id, request.locker_number, at],
        )?;
        expect_one(changed, "members", || {
            format!(
                "member {} is not renting {}",
                request.member_id, request.locker_number
            )
        })?;

        let changed = tx.execute(
            "UPDATE lockers SET sensor_state = 'engaged', current_member = NULL, last_change_time = ?3
             WHERE locker_number = ?1 AND current_member = ?2",
            params![request.locker_number, request.member_id, at],
        )?;
        expect_one(changed, "lockers", || {
            format!(
                "locker {} is not held by {}",
                request.locker_number, request.member_id
            )
        })?;

        let daily_rental_count = query_member(&tx, &request.member_id)?
            .map(|m| m.rentals_today(at, self.day_offset))
            .unwrap_or(0);

        tx.commit()?;
        Ok(CommitReceipt {
            rental_id: request.rental_id,
            daily_rental_count,
        })
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

impl ConsistencyManager for SqliteConsistencyManager {
    fn load_member(&self, member_id: &str) -> LedgerResult<Option<Member>> {
        let conn = self.conn.lock();
        query_member(&conn, member_id)
    }

    fn find_member_by_credential(&self, code: &str) -> LedgerResult<Option<Member>> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {MEMBER_COLUMNS} FROM members
                 WHERE member_id = ?1 OR barcode = ?1 OR qr_code = ?1
                 ORDER BY CASE WHEN member_id = ?1 THEN 0 WHEN barcode = ?1 THEN 1 ELSE 2 END
                 LIMIT 1"
            ),
            params![code],
            MemberRow::from_row,
        )
        .optional()?
        .map(MemberRow::into_member)
        .transpose()
    }

    fn load_locker(&self, locker_number: &str) -> LedgerResult<Option<Locker>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {LOCKER_COLUMNS} FROM lockers WHERE locker_number = ?1"),
            params![locker_number],
            LockerRow::from_row,
        )
        .optional()?
        .map(LockerRow::into_locker)
        .transpose()
    }

    fn active_rental_for_member(&self, member_id: &str) -> LedgerResult<Option<Rental>> {
        let conn = self.conn.lock();
        Ok(query_rentals(&conn, "member_id = ?1 AND status = 'active'", &member_id)?.pop())
    }

    fn open_pending_rental(&self, pending: &PendingRental) -> LedgerResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rentals (transaction_id, member_id, locker_number, status,
                 rental_initiated_time, deadline, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?4)",
            params![
                pending.transaction_id,
                pending.member_id,
                pending.locker_number,
                pending.initiated_at,
                pending.deadline,
            ],
        )?;
        let rental_id = conn.last_insert_rowid();
        debug!(target: "lockerkey-services", rental_id, transaction_id = %pending.transaction_id, "Pending rental opened");
        Ok(rental_id)
    }

    fn commit(&self, request: &CommitRequest) -> LedgerResult<CommitReceipt> {
        match request.kind {
            TransactionKind::Rent => self.commit_rent(request),
            TransactionKind::Return => self.commit_return(request),
        }
    }

    fn close_pending_rental(
        &self,
        rental_id: i64,
        status: RentalStatus,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        if !matches!(status, RentalStatus::TimedOut | RentalStatus::Failed) {
            return Err(LedgerError::Inconsistent(format!(
                "a pending rental cannot be closed as {status}"
            )));
        }
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE rentals SET status = ?2, updated_at = ?3 WHERE rental_id = ?1 AND status = 'pending'",
            params![rental_id, status.as_str(), at],
        )?;
        if changed != 1 {
            return Err(LedgerError::RentalNotPending { rental_id });
        }
        Ok(())
    }

    fn reconcile(
        &self,
        live_rental_ids: &[i64],
        options: ReconcileOptions,
        now: DateTime<Utc>,
    ) -> LedgerResult<ReconcileReport> {
        let live: AHashSet<i64> = live_rental_ids.iter().copied().collect();
        let mut report = ReconcileReport {
            dry_run: options.dry_run,
            ..ReconcileReport::default()
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // Pending rows whose transaction no longer exists
        let pending: Vec<(i64, Option<DateTime<Utc>>)> = {
            let mut stmt = tx.prepare(
                "SELECT rental_id, deadline FROM rentals WHERE status = 'pending' ORDER BY rental_id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (rental_id, deadline) in pending {
            if live.contains(&rental_id) {
                continue;
            }
            let stale = options.fail_all_orphaned_pending
                || deadline.map_or(true, |deadline| deadline <= now);
            if !stale {
                continue;
            }
            tx.execute(
                "UPDATE rentals SET status = 'failed', updated_at = ?2 WHERE rental_id = ?1 AND status = 'pending'",
                params![rental_id, now],
            )?;
            warn!(target: "lockerkey-services", rental_id, "Orphaned pending rental marked failed");
            report.stale_pending_failed.push(rental_id);
        }

        // At most one active rental per member and per locker; newest wins
        let active: Vec<(i64, String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT rental_id, member_id, locker_number FROM rentals
                 WHERE status = 'active' ORDER BY rental_id DESC",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let mut member_holds: AHashMap<String, String> = AHashMap::new();
        let mut locker_holders: AHashMap<String, String> = AHashMap::new();
        for (rental_id, member_id, locker_number) in active {
            if member_holds.contains_key(&member_id) || locker_holders.contains_key(&locker_number) {
                tx.execute(
                    "UPDATE rentals SET status = 'failed', updated_at = ?2 WHERE rental_id = ?1 AND status = 'active'",
                    params![rental_id, now],
                )?;
                error!(
                    target: "lockerkey-services",
                    rental_id, member_id = %member_id, locker_number = %locker_number,
                    "Duplicate active rental marked failed"
                );
                report.duplicate_active_failed.push(rental_id);
                continue;
            }
            member_holds.insert(member_id.clone(), locker_number.clone());
            locker_holders.insert(locker_number, member_id);
        }

        // Member pointers follow the surviving active rentals
        let members: Vec<(String, Option<String>)> = {
            let mut stmt =
                tx.prepare("SELECT member_id, currently_renting FROM members ORDER BY member_id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (member_id, before) in members {
            let after = member_holds.get(&member_id).cloned();
            if before == after {
                continue;
            }
            tx.execute(
                "UPDATE members SET currently_renting = ?2, updated_at = ?3 WHERE member_id = ?1",
                params![member_id, after, now],
            )?;
            warn!(
                target: "lockerkey-services",
                member_id = %member_id, before = ?before, after = ?after,
                "Member rental pointer repaired"
            );
            report.member_repairs.push(PointerRepair {
                key: member_id,
                before,
                after,
            });
        }

        // Locker holders likewise; sensor state is left as last observed
        let lockers: Vec<(String, Option<String>)> = {
            let mut stmt = tx
                .prepare("SELECT locker_number, current_member FROM lockers ORDER BY locker_number")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (locker_number, before) in lockers {
            let after = locker_holders.get(&locker_number).cloned();
            if before == after {
                continue;
            }
            tx.execute(
                "UPDATE lockers SET current_member = ?2, last_change_time = ?3 WHERE locker_number = ?1",
                params![locker_number, after, now],
            )?;
            warn!(
                target: "lockerkey-services",
                locker_number = %locker_number, before = ?before, after = ?after,
                "Locker holder repaired"
            );
            report.locker_repairs.push(PointerRepair {
                key: locker_number,
                before,
                after,
            });
        }

        if options.dry_run {
            tx.rollback()?;
        } else {
            tx.commit()?;
        }

        if report.is_clean() {
            debug!(target: "lockerkey-services", "Reconciliation found nothing to repair");
        } else {
            info!(
                target: "lockerkey-services",
                stale_pending = report.stale_pending_failed.len(),
                duplicate_active = report.duplicate_active_failed.len(),
                member_repairs = report.member_repairs.len(),
                locker_repairs = report.locker_repairs.len(),
                dry_run = options.dry_run,
                "Reconciliation complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn store() -> SqliteConsistencyManager {
        let store = SqliteConsistencyManager::in_memory().unwrap();
        let table: Vec<LockerAssignment> = ["M01", "M02", "M03"]
            .iter()
            .enumerate()
            .map(|(i, n)| LockerAssignment {
                locker_number: n.to_string(),
                zone: "MALE".to_string(),
                sensor_number: i as u32 + 1,
            })
            .collect();
        store.seed_lockers(&table, t0()).unwrap();
        store
            .upsert_member(&Member::new("K1", "Kim").with_barcode("B-100"), t0())
            .unwrap();
        store
            .upsert_member(&Member::new("L1", "Lee").with_qr_code("QR-200"), t0())
            .unwrap();
        store
    }

    fn pending(store: &SqliteConsistencyManager, tx: &str, member: &str, locker: &str) -> i64 {
        store
            .open_pending_rental(&PendingRental {
                transaction_id: tx.to_string(),
                member_id: member.to_string(),
                locker_number: locker.to_string(),
                initiated_at: t0(),
                deadline: t0() + Duration::seconds(30),
            })
            .unwrap()
    }

    fn request(kind: TransactionKind, tx: &str, rental_id: i64, member: &str, locker: &str) -> CommitRequest {
        CommitRequest {
            transaction_id: tx.to_string(),
            kind,
            rental_id,
            member_id: member.to_string(),
            locker_number: locker.to_string(),
            confirmed_at: t0() + Duration::seconds(5),
        }
    }

    #[test]
    fn test_rent_commit_applies_all_three_records() {
        let store = store();
        let rental_id = pending(&store, "tx-1", "K1", "M02");

        let receipt = store
            .commit(&request(TransactionKind::Rent, "tx-1", rental_id, "K1", "M02"))
            .unwrap();
        assert_eq!(receipt.daily_rental_count, 1);

        let rental = store.rental(rental_id).unwrap().unwrap();
        assert_eq!(rental.status, RentalStatus::Active);
        assert_eq!(rental.sensor_confirmed_time, Some(t0() + Duration::seconds(5)));

        let member = store.load_member("K1").unwrap().unwrap();
        assert_eq!(member.currently_renting.as_deref(), Some("M02"));
        assert_eq!(member.daily_rental_count, 1);

        let locker = store.load_locker("M02").unwrap().unwrap();
        assert_eq!(locker.current_member.as_deref(), Some("K1"));
        assert_eq!(locker.sensor_state, SensorState::Vacant);
    }

    #[test]
    fn test_rent_commit_conflict_rolls_back() {
        let store = store();
        let first = pending(&store, "tx-1", "K1", "M02");
        store
            .commit(&request(TransactionKind::Rent, "tx-1", first, "K1", "M02"))
            .unwrap();

        // Same locker, different member: the locker guard fails last
        let second = pending(&store, "tx-2", "L1", "M02");
        let err = store
            .commit(&request(TransactionKind::Rent, "tx-2", second, "L1", "M02"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::CommitConflict { table: "lockers", .. }));

        assert_eq!(store.rental(second).unwrap().unwrap().status, RentalStatus::Pending);
        let lee = store.load_member("L1").unwrap().unwrap();
        assert!(lee.currently_renting.is_none());
        assert_eq!(lee.daily_rental_count, 0);
    }

    #[test]
    fn test_commit_requires_pending_row() {
        let store = store();
        let rental_id = pending(&store, "tx-1", "K1", "M02");
        store
            .close_pending_rental(rental_id, RentalStatus::TimedOut, t0())
            .unwrap();
        assert!(matches!(
            store.commit(&request(TransactionKind::Rent, "tx-1", rental_id, "K1", "M02")),
            Err(LedgerError::RentalNotPending { .. })
        ));
        assert!(matches!(
            store.close_pending_rental(rental_id, RentalStatus::Failed, t0()),
            Err(LedgerError::RentalNotPending { .. })
        ));
    }

    #[test]
    fn test_return_commit() {
        let store = store();
        let rental_id = pending(&store, "tx-1", "K1", "M02");
        store
            .commit(&request(TransactionKind::Rent, "tx-1", rental_id, "K1", "M02"))
            .unwrap();
        assert_eq!(store.active_rental_for_member("K1").unwrap().unwrap().rental_id, rental_id);

        store
            .commit(&request(TransactionKind::Return, "tx-2", rental_id, "K1", "M02"))
            .unwrap();

        let rental = store.rental(rental_id).unwrap().unwrap();
        assert_eq!(rental.status, RentalStatus::Completed);
        assert!(rental.return_confirmed_time.is_some());
        assert!(store.load_member("K1").unwrap().unwrap().currently_renting.is_none());
        let locker = store.load_locker("M02").unwrap().unwrap();
        assert!(locker.current_member.is_none());
        assert_eq!(locker.sensor_state, SensorState::Engaged);
        assert!(store.active_rental_for_member("K1").unwrap().is_none());
    }

    #[test]
    fn test_daily_count_restarts_on_new_day() {
        let store = store();
        let mut member = Member::new("P1", "Park");
        member.daily_rental_count = 3;
        member.last_rental_time = Some(t0() - Duration::days(1));
        store.upsert_member(&member, t0()).unwrap();

        let rental_id = pending(&store, "tx-1", "P1", "M01");
        let receipt = store
            .commit(&request(TransactionKind::Rent, "tx-1", rental_id, "P1", "M01"))
            .unwrap();
        assert_eq!(receipt.daily_rental_count, 1);
    }

    #[test]
    fn test_upsert_member_keeps_rental_state() {
        let store = store();
        let rental_id = pending(&store, "tx-1", "K1", "M02");
        store
            .commit(&request(TransactionKind::Rent, "tx-1", rental_id, "K1", "M02"))
            .unwrap();

        store
            .upsert_member(
                &Member::new("K1", "Kim Minji").with_status(MemberStatus::Suspended),
                t0(),
            )
            .unwrap();
        let member = store.load_member("K1").unwrap().unwrap();
        assert_eq!(member.name, "Kim Minji");
        assert_eq!(member.status, MemberStatus::Suspended);
        assert_eq!(member.currently_renting.as_deref(), Some("M02"));
        assert_eq!(member.daily_rental_count, 1);
    }

    #[test]
    fn test_credential_lookup() {
        let store = store();
        assert_eq!(store.find_member_by_credential("K1").unwrap().unwrap().member_id, "K1");
        assert_eq!(store.find_member_by_credential(" B-100 ").unwrap().unwrap().member_id, "K1");
        assert_eq!(store.find_member_by_credential("QR-200").unwrap().unwrap().member_id, "L1");
        assert!(store.find_member_by_credential("nope").unwrap().is_none());
        assert!(store.find_member_by_credential("").unwrap().is_none());
    }

    #[test]
    fn test_seed_lockers_remaps_sensors() {
        let store = store();
        let remap = vec![
            LockerAssignment {
                locker_number: "M01".to_string(),
                zone: "MALE".to_string(),
                sensor_number: 2,
            },
            LockerAssignment {
                locker_number: "M02".to_string(),
                zone: "MALE".to_string(),
                sensor_number: 1,
            },
        ];
        store.seed_lockers(&remap, t0()).unwrap();

        assert_eq!(store.load_locker("M01").unwrap().unwrap().sensor_number, Some(2));
        assert_eq!(store.load_locker("M02").unwrap().unwrap().sensor_number, Some(1));
        assert_eq!(store.load_locker("M03").unwrap().unwrap().sensor_number, None);
    }

    #[test]
    fn test_maintenance() {
        let store = store();
        store
            .set_maintenance("M03", MaintenanceStatus::OutOfService, t0())
            .unwrap();
        assert!(!store.load_locker("M03").unwrap().unwrap().is_in_service());
        assert!(matches!(
            store.set_maintenance("Z99", MaintenanceStatus::InService, t0()),
            Err(LedgerError::NotFound { .. })
        ));
        assert_eq!(store.ledger_stats().unwrap().lockers_available, 2);
    }

    #[test]
    fn test_rentals_are_append_only() {
        let store = store();
        let rental_id = pending(&store, "tx-1", "K1", "M02");
        let conn = store.conn.lock();
        assert!(conn
            .execute("DELETE FROM rentals WHERE rental_id = ?1", params![rental_id])
            .is_err());
    }

    #[test]
    fn test_reconcile_fails_orphaned_pending() {
        let store = store();
        let live = pending(&store, "tx-live", "K1", "M01");
        let orphan = pending(&store, "tx-orphan", "L1", "M02");

        // Periodic: deadline not yet passed
        let report = store
            .reconcile(&[live], ReconcileOptions::periodic(), t0())
            .unwrap();
        assert!(report.is_clean());

        let report = store
            .reconcile(&[live], ReconcileOptions::startup(), t0())
            .unwrap();
        assert_eq!(report.stale_pending_failed, vec![orphan]);
        assert_eq!(store.rental(orphan).unwrap().unwrap().status, RentalStatus::Failed);
        assert_eq!(store.rental(live).unwrap().unwrap().status, RentalStatus::Pending);
    }

    #[test]
    fn test_reconcile_repairs_pointers() {
        let store = store();
        let rental_id = pending(&store, "tx-1", "K1", "M02");
        store
            .commit(&request(TransactionKind::Rent, "tx-1", rental_id, "K1", "M02"))
            .unwrap();

        {
            let conn = store.conn.lock();
            conn.execute("UPDATE members SET currently_renting = NULL WHERE member_id = 'K1'", [])
                .unwrap();
            conn.execute("UPDATE lockers SET current_member = 'L1' WHERE locker_number = 'M03'", [])
                .unwrap();
        }

        let audit = store
            .reconcile(&[], ReconcileOptions::audit_only(), t0())
            .unwrap();
        assert!(!audit.is_consistent());
        assert!(audit.dry_run);
        assert!(store.load_member("K1").unwrap().unwrap().currently_renting.is_none());

        let report = store
            .reconcile(&[], ReconcileOptions::periodic(), t0())
            .unwrap();
        assert_eq!(
            report.member_repairs,
            vec![PointerRepair {
                key: "K1".to_string(),
                before: None,
                after: Some("M02".to_string()),
            }]
        );
        assert_eq!(report.locker_repairs.len(), 1);
        assert_eq!(report.locker_repairs[0].key, "M03");
        assert_eq!(
            store.load_member("K1").unwrap().unwrap().currently_renting.as_deref(),
            Some("M02")
        );
        assert!(store.load_locker("M03").unwrap().unwrap().current_member.is_none());

        let again = store
            .reconcile(&[], ReconcileOptions::periodic(), t0())
            .unwrap();
        assert!(again.is_clean());
    }

    #[test]
    fn test_reconcile_keeps_newest_duplicate_active() {
        let store = store();
        let older = pending(&store, "tx-1", "K1", "M01");
        let newer = pending(&store, "tx-2", "K1", "M02");
        {
            let conn = store.conn.lock();
            conn.execute("UPDATE rentals SET status = 'active'", []).unwrap();
        }

        let report = store
            .reconcile(&[], ReconcileOptions::periodic(), t0())
            .unwrap();
        assert_eq!(report.duplicate_active_failed, vec![older]);
        assert_eq!(store.rental(newer).unwrap().unwrap().status, RentalStatus::Active);
        assert_eq!(
            store.load_member("K1").unwrap().unwrap().currently_renting.as_deref(),
            Some("M02")
        );
        assert_eq!(
            store.load_locker("M02").unwrap().unwrap().current_member.as_deref(),
            Some("K1")
        );
    }

    #[test]
    fn test_ledger_stats_and_history() {
        let store = store();
        let a = pending(&store, "tx-1", "K1", "M01");
        store.close_pending_rental(a, RentalStatus::TimedOut, t0()).unwrap();
        let b = pending(&store, "tx-2", "K1", "M01");
        store
            .commit(&request(TransactionKind::Rent, "tx-2", b, "K1", "M01"))
            .unwrap();

        let stats = store.ledger_stats().unwrap();
        assert_eq!(stats.members, 2);
        assert_eq!(stats.lockers, 3);
        assert_eq!(stats.lockers_available, 2);
        assert_eq!(stats.rentals_timed_out, 1);
        assert_eq!(stats.rentals_active, 1);

        let history = store.rentals_for_member("K1").unwrap();
        assert_eq!(history.iter().map(|r| r.rental_id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(store.rental_by_transaction("tx-2").unwrap().unwrap().rental_id, b);
    }

    #[test]
    fn test_reset_daily_counts() {
        let store = store();
        let rental_id = pending(&store, "tx-1", "K1", "M01");
        store
            .commit(&request(TransactionKind::Rent, "tx-1", rental_id, "K1", "M01"))
            .unwrap();
        assert_eq!(store.reset_daily_counts(t0()).unwrap(), 1);
        assert_eq!(store.load_member("K1").unwrap().unwrap().daily_rental_count, 0);
    }

    #[test]
    fn test_open_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        {
            let store = SqliteConsistencyManager::open(&path).unwrap();
            store
                .upsert_member(&Member::new("K1", "Kim"), t0())
                .unwrap();
        }
        let reopened = SqliteConsistencyManager::open(&path).unwrap();
        assert!(reopened.load_member("K1").unwrap().is_some());
        assert_eq!(reopened.path(), Some(path.as_path()));
    }
}
