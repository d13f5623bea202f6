pub mod availability;
mod coordinator;
mod error;

pub use error::EngineError;

use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::calendar::{BusinessCalendar, DaySchedule};
use crate::holds::{HoldStore, MemoryHoldStore};
use crate::ledger::{BookingLedger, WalLedger};
use crate::limits::{self, MAX_LABEL_LEN, MAX_MAINTENANCE_PER_DAY, MAX_NAME_LEN, MAX_SERVICES};
use crate::model::{
    now_ms, BookingRecord, BookingStatus, Event, Hold, Minute, ServiceDefinition, Span, TimeSlot,
    WeekdayHours,
};
use crate::notify::NotifyHub;
use crate::retry::with_backoff;
use crate::wal::WalHandle;

/// Tunables resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wash bays operating concurrently — the capacity of every slot.
    pub bays: u32,
    /// Hold lifetime.
    pub hold_ttl_ms: i64,
    /// Candidate grid (minutes between slot starts).
    pub slot_grid: Minute,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bays: 2,
            hold_ttl_ms: (limits::DEFAULT_HOLD_TTL_SECS * 1000) as i64,
            slot_grid: limits::SLOT_GRID_MIN,
        }
    }
}

/// The slot availability & reservation engine: business calendar, service
/// catalog, booking ledger and hold store composed behind one API.
pub struct Engine {
    config: EngineConfig,
    calendar: RwLock<BusinessCalendar>,
    services: DashMap<Ulid, ServiceDefinition>,
    ledger: Arc<dyn BookingLedger>,
    holds: Arc<dyn HoldStore>,
    wal: WalHandle,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    /// Open the WAL at `path`, replay it, and spawn the writer task.
    pub fn open(path: &Path, config: EngineConfig, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = WalHandle::spawn(path)?;
        let ledger = Arc::new(WalLedger::new(wal.clone()));
        let holds = Arc::new(MemoryHoldStore::new());

        let engine = Self {
            config,
            calendar: RwLock::new(BusinessCalendar::new()),
            services: DashMap::new(),
            ledger: ledger.clone(),
            holds: holds.clone(),
            wal,
            notify,
        };

        // Replay — we are the sole owner at this point, so try_write on the
        // calendar always succeeds instantly (no contention).
        {
            let mut calendar = engine
                .calendar
                .try_write()
                .expect("replay: uncontended write");
            for event in &events {
                match event {
                    Event::HoursSet { weekday, hours } => {
                        calendar.set_hours(*weekday as usize, *hours);
                    }
                    Event::HolidayAdded { date, label } => {
                        calendar.add_holiday(*date, label.clone());
                    }
                    Event::HolidayRemoved { date } => {
                        calendar.remove_holiday(*date);
                    }
                    Event::MaintenanceAdded { id, date, span, reason } => {
                        calendar.add_maintenance(*id, *date, *span, reason.clone());
                    }
                    Event::MaintenanceRemoved { id } => {
                        calendar.remove_maintenance(*id);
                    }
                    Event::ServiceAdded { id, name, duration_min } => {
                        engine.services.insert(
                            *id,
                            ServiceDefinition {
                                id: *id,
                                name: name.clone(),
                                duration_min: *duration_min,
                                active: true,
                            },
                        );
                    }
                    Event::ServiceRetired { id } => {
                        if let Some(mut svc) = engine.services.get_mut(id) {
                            svc.active = false;
                        }
                    }
                    Event::HoldPlaced {
                        token,
                        date,
                        slot,
                        span,
                        service_id,
                        holder,
                        expires_at,
                    } => {
                        // Expired records are reconciled on read; inserting
                        // them unconditionally keeps replay order-only.
                        holds.apply_placed(Hold {
                            token: *token,
                            date: *date,
                            slot: *slot,
                            span: *span,
                            service_id: *service_id,
                            holder: holder.clone(),
                            expires_at: *expires_at,
                        });
                    }
                    Event::HoldReleased { token } | Event::HoldExpired { token } => {
                        let _ = holds.remove_by_token(*token);
                    }
                    Event::BookingConfirmed { id, date, span, service_id, label } => {
                        ledger.apply_confirmed(BookingRecord {
                            id: *id,
                            date: *date,
                            span: *span,
                            service_id: *service_id,
                            status: BookingStatus::Confirmed,
                            label: label.clone(),
                        });
                    }
                    Event::BookingStatusChanged { id, status } => {
                        ledger.apply_status(*id, *status);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Assemble an engine from explicit parts. Tests use this to inject
    /// unreachable stores; no replay happens.
    pub fn with_parts(
        config: EngineConfig,
        ledger: Arc<dyn BookingLedger>,
        holds: Arc<dyn HoldStore>,
        wal: WalHandle,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            config,
            calendar: RwLock::new(BusinessCalendar::new()),
            services: DashMap::new(),
            ledger,
            holds,
            wal,
            notify,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn service(&self, id: Ulid) -> Result<ServiceDefinition, EngineError> {
        let svc = self
            .services
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::UnknownService(id))?;
        if !svc.active {
            return Err(EngineError::InactiveService(id));
        }
        Ok(svc)
    }

    // ── Availability ─────────────────────────────────────────────

    /// Compute the candidate slots for a (date, service) pair.
    ///
    /// A closed day (unconfigured weekday or holiday) is a valid result —
    /// the empty list — not an error. An unknown or retired service is an
    /// error. `viewer` is the caller's holder identity: their own holds
    /// are not reported as conflicts to them.
    pub async fn compute_slots(
        &self,
        date: NaiveDate,
        service_id: Ulid,
        viewer: Option<&str>,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);

        let (hours, maintenance) = {
            let calendar = self.calendar.read().await;
            match calendar.hours_for(date) {
                DaySchedule::Open(hours) => (hours, calendar.maintenance_for(date).to_vec()),
                DaySchedule::Closed { .. } => return Ok(Vec::new()),
            }
        };

        let service = self.service(service_id)?;

        // Ledger errors fail closed: better "unavailable" than letting a
        // customer book into uncertainty.
        let occupancy =
            with_backoff("occupancy_for", || self.ledger.occupancy_for(date, None)).await?;

        // Hold reads fail open for display only — losing hold visibility
        // just risks a late conflict that the insert-time check catches.
        let now = now_ms();
        let holds = self.holds.live_for_date(date, now).unwrap_or_else(|e| {
            tracing::warn!("hold store read failed, showing no holds: {e}");
            Vec::new()
        });

        Ok(availability::generate_slots(&availability::SlotQuery {
            hours,
            duration: service.duration_min,
            grid: self.config.slot_grid,
            capacity: self.config.bays,
            occupancy: &occupancy,
            holds: &holds,
            maintenance: &maintenance,
            viewer,
        }))
    }

    // ── Catalog & calendar administration ────────────────────────

    pub async fn add_service(
        &self,
        name: String,
        duration_min: Minute,
    ) -> Result<ServiceDefinition, EngineError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name length"));
        }
        if duration_min == 0 || duration_min > crate::model::MINUTES_PER_DAY {
            return Err(EngineError::InvalidInput("service duration out of range"));
        }
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }

        let id = Ulid::new();
        self.wal
            .append(&Event::ServiceAdded { id, name: name.clone(), duration_min })
            .await?;
        let svc = ServiceDefinition { id, name, duration_min, active: true };
        self.services.insert(id, svc.clone());
        Ok(svc)
    }

    pub async fn retire_service(&self, id: Ulid) -> Result<(), EngineError> {
        if !self.services.contains_key(&id) {
            return Err(EngineError::UnknownService(id));
        }
        self.wal.append(&Event::ServiceRetired { id }).await?;
        if let Some(mut svc) = self.services.get_mut(&id) {
            svc.active = false;
        }
        Ok(())
    }

    pub fn list_services(&self) -> Vec<ServiceDefinition> {
        let mut services: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    pub async fn set_hours(
        &self,
        weekday: usize,
        hours: Option<WeekdayHours>,
    ) -> Result<(), EngineError> {
        if weekday > 6 {
            return Err(EngineError::InvalidInput("weekday out of range"));
        }
        if let Some(h) = hours {
            h.validate().map_err(EngineError::InvalidInput)?;
        }
        let mut calendar = self.calendar.write().await;
        self.wal
            .append(&Event::HoursSet { weekday: weekday as u8, hours })
            .await?;
        calendar.set_hours(weekday, hours);
        Ok(())
    }

    pub async fn add_holiday(
        &self,
        date: NaiveDate,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("holiday label length"));
        }
        let mut calendar = self.calendar.write().await;
        let event = Event::HolidayAdded { date, label: label.clone() };
        self.wal.append(&event).await?;
        calendar.add_holiday(date, label);
        self.notify.send_for(&event);
        Ok(())
    }

    pub async fn remove_holiday(&self, date: NaiveDate) -> Result<(), EngineError> {
        let mut calendar = self.calendar.write().await;
        let event = Event::HolidayRemoved { date };
        self.wal.append(&event).await?;
        calendar.remove_holiday(date);
        self.notify.send_for(&event);
        Ok(())
    }

    pub async fn add_maintenance(
        &self,
        date: NaiveDate,
        span: Span,
        reason: String,
    ) -> Result<Ulid, EngineError> {
        if reason.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("maintenance reason length"));
        }
        let mut calendar = self.calendar.write().await;
        if calendar.maintenance_for(date).len() >= MAX_MAINTENANCE_PER_DAY {
            return Err(EngineError::LimitExceeded("too many maintenance blocks"));
        }
        let id = Ulid::new();
        let event = Event::MaintenanceAdded { id, date, span, reason: reason.clone() };
        self.wal.append(&event).await?;
        calendar.add_maintenance(id, date, span, reason);
        self.notify.send_for(&event);
        Ok(id)
    }

    pub async fn remove_maintenance(&self, id: Ulid) -> Result<(), EngineError> {
        let mut calendar = self.calendar.write().await;
        if calendar.maintenance_date(&id).is_none() {
            return Err(EngineError::InvalidInput("unknown maintenance block"));
        }
        self.wal.append(&Event::MaintenanceRemoved { id }).await?;
        calendar.remove_maintenance(id);
        Ok(())
    }

    // ── Booking queries & status ─────────────────────────────────

    pub async fn bookings_for(&self, date: NaiveDate) -> Result<Vec<BookingRecord>, EngineError> {
        self.ledger.bookings_for(date).await
    }

    pub async fn holds_for(&self, date: NaiveDate) -> Result<Vec<Hold>, EngineError> {
        self.holds.live_for_date(date, now_ms())
    }

    /// Expired holds still occupying keys, for the reaper.
    pub fn collect_expired_holds(&self, now: i64) -> Vec<Hold> {
        self.holds.collect_expired(now)
    }

    pub async fn set_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingRecord, EngineError> {
        let record = self.ledger.set_status(id, status).await?;
        self.notify
            .send(record.date, &Event::BookingStatusChanged { id, status });
        Ok(record)
    }

    // ── WAL maintenance ──────────────────────────────────────────

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Rewrite the WAL with only the events needed to recreate current
    /// state. Hold/booking churn and cancelled or no-show bookings are
    /// dropped; live holds are re-emitted so they still survive restarts.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        {
            let calendar = self.calendar.read().await;
            for (weekday, hours) in calendar.week().iter().enumerate() {
                if let Some(hours) = hours {
                    events.push(Event::HoursSet {
                        weekday: weekday as u8,
                        hours: Some(*hours),
                    });
                }
            }
            for (date, label) in calendar.holidays() {
                events.push(Event::HolidayAdded { date: *date, label: label.clone() });
            }
            for (date, blocks) in calendar.maintenance() {
                for block in blocks {
                    events.push(Event::MaintenanceAdded {
                        id: block.id,
                        date: *date,
                        span: block.span,
                        reason: block.reason.clone(),
                    });
                }
            }
        }

        for svc in self.services.iter() {
            events.push(Event::ServiceAdded {
                id: svc.id,
                name: svc.name.clone(),
                duration_min: svc.duration_min,
            });
            if !svc.active {
                events.push(Event::ServiceRetired { id: svc.id });
            }
        }

        for record in self.ledger.snapshot().await? {
            if !record.status.occupies_capacity() {
                continue;
            }
            events.push(Event::BookingConfirmed {
                id: record.id,
                date: record.date,
                span: record.span,
                service_id: record.service_id,
                label: record.label.clone(),
            });
            if record.status != BookingStatus::Confirmed {
                events.push(Event::BookingStatusChanged {
                    id: record.id,
                    status: record.status,
                });
            }
        }

        let now = now_ms();
        for hold in self.holds.all() {
            if hold.is_expired(now) {
                continue;
            }
            events.push(Event::HoldPlaced {
                token: hold.token,
                date: hold.date,
                slot: hold.slot,
                span: hold.span,
                service_id: hold.service_id,
                holder: hold.holder.clone(),
                expires_at: hold.expires_at,
            });
        }

        self.wal.compact(events).await?;
        Ok(())
    }
}
