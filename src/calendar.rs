use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{weekday_index, MaintenanceBlock, Span, WeekdayHours};

/// What a given date resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaySchedule {
    Open(WeekdayHours),
    Closed { reason: ClosedReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosedReason {
    /// No hours configured for this weekday.
    Weekday,
    Holiday { label: Option<String> },
}

/// Opening hours, holidays and maintenance blocks. Configured by an
/// administrator; read-only to the availability path. Resolution is total:
/// an unconfigured weekday is closed, never an error.
#[derive(Debug, Default)]
pub struct BusinessCalendar {
    /// Indexed 0 = Monday … 6 = Sunday. `None` = closed that weekday.
    week: [Option<WeekdayHours>; 7],
    holidays: HashMap<NaiveDate, Option<String>>,
    maintenance: HashMap<NaiveDate, Vec<MaintenanceBlock>>,
    /// Block id → date, for removal by id.
    maintenance_index: HashMap<Ulid, NaiveDate>,
}

impl BusinessCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a date. Holidays win over weekday configuration.
    pub fn hours_for(&self, date: NaiveDate) -> DaySchedule {
        if let Some(label) = self.holidays.get(&date) {
            return DaySchedule::Closed {
                reason: ClosedReason::Holiday { label: label.clone() },
            };
        }
        match self.week[weekday_index(date)] {
            Some(hours) => DaySchedule::Open(hours),
            None => DaySchedule::Closed { reason: ClosedReason::Weekday },
        }
    }

    pub fn maintenance_for(&self, date: NaiveDate) -> &[MaintenanceBlock] {
        self.maintenance.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    // ── Mutations (driven by engine admin ops and WAL replay) ────

    pub fn set_hours(&mut self, weekday: usize, hours: Option<WeekdayHours>) {
        self.week[weekday] = hours;
    }

    pub fn add_holiday(&mut self, date: NaiveDate, label: Option<String>) {
        self.holidays.insert(date, label);
    }

    pub fn remove_holiday(&mut self, date: NaiveDate) -> bool {
        self.holidays.remove(&date).is_some()
    }

    pub fn add_maintenance(&mut self, id: Ulid, date: NaiveDate, span: Span, reason: String) {
        self.maintenance
            .entry(date)
            .or_default()
            .push(MaintenanceBlock { id, span, reason });
        self.maintenance_index.insert(id, date);
    }

    pub fn maintenance_date(&self, id: &Ulid) -> Option<NaiveDate> {
        self.maintenance_index.get(id).copied()
    }

    pub fn remove_maintenance(&mut self, id: Ulid) -> bool {
        let Some(date) = self.maintenance_index.remove(&id) else {
            return false;
        };
        if let Some(blocks) = self.maintenance.get_mut(&date) {
            blocks.retain(|b| b.id != id);
            if blocks.is_empty() {
                self.maintenance.remove(&date);
            }
        }
        true
    }

    // ── Snapshot accessors (WAL compaction) ──────────────────────

    pub fn week(&self) -> &[Option<WeekdayHours>; 7] {
        &self.week
    }

    pub fn holidays(&self) -> impl Iterator<Item = (&NaiveDate, &Option<String>)> {
        self.holidays.iter()
    }

    pub fn maintenance(&self) -> impl Iterator<Item = (&NaiveDate, &Vec<MaintenanceBlock>)> {
        self.maintenance.iter()
    }
}
