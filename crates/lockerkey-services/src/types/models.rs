// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

/*!
Persistent records: members, lockers, and the rental ledger.
*/

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use lockerkey_hal::SensorEdge;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text-backed enum helpers for SQLite storage
macro_rules! stored_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Suspended,
    Expired,
}

stored_enum!(MemberStatus {
    Active => "active",
    Suspended => "suspended",
    Expired => "expired",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorState {
    /// Key present
    Engaged,
    /// Key taken
    Vacant,
}

stored_enum!(SensorState {
    Engaged => "engaged",
    Vacant => "vacant",
});

impl From<SensorEdge> for SensorState {
    fn from(edge: SensorEdge) -> Self {
        match edge {
            SensorEdge::Engaged => SensorState::Engaged,
            SensorEdge::Vacant => SensorState::Vacant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorStatus {
    Closed,
    Open,
    Unknown,
}

stored_enum!(DoorStatus {
    Closed => "closed",
    Open => "open",
    Unknown => "unknown",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceStatus {
    InService,
    OutOfService,
}

stored_enum!(MaintenanceStatus {
    InService => "in_service",
    OutOfService => "out_of_service",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalStatus {
    Pending,
    Active,
    Completed,
    TimedOut,
    Failed,
}

stored_enum!(RentalStatus {
    Pending => "pending",
    Active => "active",
    Completed => "completed",
    TimedOut => "timed_out",
    Failed => "failed",
});

/// Calendar date of `at` in the configured day offset
pub fn local_date(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub name: String,
    pub barcode: Option<String>,
    pub qr_code: Option<String>,
    pub status: MemberStatus,
    pub membership_expires: Option<NaiveDate>,
    /// Zones this member may rent in; empty means any zone
    pub allowed_zones: Vec<String>,
    pub currently_renting: Option<String>,
    pub daily_rental_count: u32,
    pub last_rental_time: Option<DateTime<Utc>>,
}

impl Member {
    pub fn new(member_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            name: name.into(),
            barcode: None,
            qr_code: None,
            status: MemberStatus::Active,
            membership_expires: None,
            allowed_zones: Vec::new(),
            currently_renting: None,
            daily_rental_count: 0,
            last_rental_time: None,
        }
    }

    pub fn with_barcode(mut self, barcode: impl Into<String>) -> Self {
        self.barcode = Some(barcode.into());
        self
    }

    pub fn with_qr_code(mut self, qr_code: impl Into<String>) -> Self {
        self.qr_code = Some(qr_code.into());
        self
    }

    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_expiry(mut self, expires: NaiveDate) -> Self {
        self.membership_expires = Some(expires);
        self
    }

    pub fn with_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_zones = zones.into_iter().map(Into::into).collect();
        self
    }

    /// Rentals counted against today's cap
    ///
    /// A count stamped on an earlier day is stale. A count with no timestamp
    /// is taken as is.
    pub fn rentals_today(&self, now: DateTime<Utc>, offset: FixedOffset) -> u32 {
        match self.last_rental_time {
            Some(last) if local_date(last, offset) < local_date(now, offset) => 0,
            _ => self.daily_rental_count,
        }
    }

    pub fn may_use_zone(&self, zone: &str) -> bool {
        self.allowed_zones.is_empty() || self.allowed_zones.iter().any(|z| z.eq_ignore_ascii_case(zone))
    }

    /// Expiry date if the membership lapsed before `today`
    pub fn expired_on(&self, today: NaiveDate) -> Option<NaiveDate> {
        self.membership_expires.filter(|expires| *expires < today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locker {
    pub locker_number: String,
    pub zone: String,
    pub sensor_number: Option<u32>,
    pub sensor_state: SensorState,
    pub door_status: DoorStatus,
    pub current_member: Option<String>,
    pub maintenance_status: MaintenanceStatus,
    pub last_change_time: DateTime<Utc>,
}

impl Locker {
    pub fn new(
        locker_number: impl Into<String>,
        zone: impl Into<String>,
        sensor_number: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            locker_number: locker_number.into(),
            zone: zone.into(),
            sensor_number,
            sensor_state: SensorState::Engaged,
            door_status: DoorStatus::Closed,
            current_member: None,
            maintenance_status: MaintenanceStatus::InService,
            last_change_time: now,
        }
    }

    pub fn is_in_service(&self) -> bool {
        self.maintenance_status == MaintenanceStatus::InService
    }
}

/// Ledger row; status changes in place, rows are never deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rental {
    pub rental_id: i64,
    pub transaction_id: String,
    pub member_id: String,
    pub locker_number: String,
    pub status: RentalStatus,
    pub rental_initiated_time: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub sensor_confirmed_time: Option<DateTime<Utc>>,
    pub return_confirmed_time: Option<DateTime<Utc>>,
}
