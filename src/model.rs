use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minute-of-day — the only intra-day time type. 0 = midnight, 1440 = end of day.
pub type Minute = u16;

/// Unix milliseconds, used for hold deadlines.
pub type Ms = i64;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open interval `[start, end)` in minutes of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Minute {
        self.end - self.start
    }

    /// The one overlap predicate. Every conflict test in the crate goes
    /// through here: `[a,b)` and `[b,c)` do NOT overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Minute) -> bool {
        self.start <= t && t < self.end
    }
}

/// Opening hours for one weekday. Absence of a record means closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekdayHours {
    pub open: Minute,
    pub close: Minute,
    /// Lunch/cleaning break, if any. No slots are offered across it.
    pub brk: Option<Span>,
}

impl WeekdayHours {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.open >= self.close {
            return Err("open must be before close");
        }
        if self.close > MINUTES_PER_DAY {
            return Err("close past end of day");
        }
        if let Some(brk) = self.brk
            && (brk.start < self.open || brk.start >= brk.end || brk.end > self.close)
        {
            return Err("break must fall inside opening hours");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: Ulid,
    pub name: String,
    pub duration_min: Minute,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Cancelled and no-show bookings release their capacity.
    pub fn occupies_capacity(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::NoShow)
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => BookingStatus::Pending,
            "confirmed" => BookingStatus::Confirmed,
            "in_progress" => BookingStatus::InProgress,
            "completed" => BookingStatus::Completed,
            "cancelled" => BookingStatus::Cancelled,
            "no_show" => BookingStatus::NoShow,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub service_id: Ulid,
    pub status: BookingStatus,
    pub label: Option<String>,
}

/// A short-lived claim on one slot while a customer completes checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub token: Ulid,
    pub date: NaiveDate,
    /// Slot start — the mutual-exclusion key is `(date, slot)`.
    pub slot: Minute,
    /// Occupied interval `[slot, slot + service duration)`.
    pub span: Span,
    pub service_id: Ulid,
    pub holder: String,
    pub expires_at: Ms,
}

impl Hold {
    pub fn is_expired(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceBlock {
    pub id: Ulid,
    pub span: Span,
    pub reason: String,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Held,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotConflict {
    pub kind: ConflictKind,
    pub message: String,
}

/// One bookable candidate, recomputed on every availability query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSlot {
    pub start: Minute,
    pub end: Minute,
    pub max_capacity: u32,
    /// Non-cancelled bookings overlapping `[start, end)`.
    pub booked: u32,
    pub conflicts: Vec<SlotConflict>,
}

impl TimeSlot {
    pub fn available_capacity(&self) -> u32 {
        self.max_capacity.saturating_sub(self.booked)
    }

    pub fn is_available(&self) -> bool {
        self.available_capacity() > 0 && self.conflicts.is_empty()
    }
}

// ── HH:MM / weekday helpers ──────────────────────────────────────

/// Parse `"HH:MM"` into a minute of day.
pub fn parse_hhmm(s: &str) -> Option<Minute> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if h > 24 || m > 59 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_hhmm(t: Minute) -> String {
    format!("{:02}:{:02}", t / 60, t % 60)
}

/// Weekday index for the hours table: 0 = Monday … 6 = Sunday.
pub fn weekday_index(date: NaiveDate) -> usize {
    date.weekday().num_days_from_monday() as usize
}

pub fn parse_weekday(s: &str) -> Option<usize> {
    Some(match s {
        "monday" => 0,
        "tuesday" => 1,
        "wednesday" => 2,
        "thursday" => 3,
        "friday" => 4,
        "saturday" => 5,
        "sunday" => 6,
        _ => return None,
    })
}

// ── WAL record format ────────────────────────────────────────────

/// The event types — flat, no nesting. Everything the engine remembers
/// across restarts goes through here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HoursSet {
        weekday: u8,
        hours: Option<WeekdayHours>,
    },
    HolidayAdded {
        date: NaiveDate,
        label: Option<String>,
    },
    HolidayRemoved {
        date: NaiveDate,
    },
    MaintenanceAdded {
        id: Ulid,
        date: NaiveDate,
        span: Span,
        reason: String,
    },
    MaintenanceRemoved {
        id: Ulid,
    },
    ServiceAdded {
        id: Ulid,
        name: String,
        duration_min: Minute,
    },
    ServiceRetired {
        id: Ulid,
    },
    HoldPlaced {
        token: Ulid,
        date: NaiveDate,
        slot: Minute,
        span: Span,
        service_id: Ulid,
        holder: String,
        expires_at: Ms,
    },
    HoldReleased {
        token: Ulid,
    },
    HoldExpired {
        token: Ulid,
    },
    BookingConfirmed {
        id: Ulid,
        date: NaiveDate,
        span: Span,
        service_id: Ulid,
        label: Option<String>,
    },
    BookingStatusChanged {
        id: Ulid,
        status: BookingStatus,
    },
}

impl Event {
    /// Date the event concerns, for date-scoped notification fan-out.
    /// Configuration events return None and are not broadcast.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Event::HolidayAdded { date, .. }
            | Event::HolidayRemoved { date }
            | Event::MaintenanceAdded { date, .. }
            | Event::HoldPlaced { date, .. }
            | Event::BookingConfirmed { date, .. } => Some(*date),
            _ => None,
        }
    }
}

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as Ms
}
