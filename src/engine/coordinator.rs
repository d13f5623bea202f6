use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::DaySchedule;
use crate::engine::availability::max_overlap;
use crate::engine::{Engine, EngineError};
use crate::holds::PutOutcome;
use crate::ledger::BookingDraft;
use crate::model::{now_ms, BookingRecord, Event, Hold, Minute, Span};
use crate::retry::with_backoff;

/// Reservation coordination: the Free → Held → Booked state machine.
///
/// Holds are a UX optimization (reserve-while-you-type); the ledger's
/// insert-time overlap check in `confirm_hold` is the actual authority
/// against double-booking and runs even when the hold store has been
/// bypassed or lost its state.
impl Engine {
    /// Claim a slot for `holder`. Availability is re-checked here, at
    /// claim time — the client's slot list may be stale by the time they
    /// click "book". Losers of the atomic check-then-set get an immediate
    /// conflict; there is no queueing for the current holder to finish.
    pub async fn attempt_hold(
        &self,
        date: NaiveDate,
        slot: Minute,
        service_id: Ulid,
        holder: &str,
    ) -> Result<Ulid, EngineError> {
        if holder.is_empty() {
            return Err(EngineError::InvalidInput("holder must not be empty"));
        }
        let service = self.service(service_id)?;
        let span = self.validate_slot(date, slot, service.duration_min).await?;

        // Occupancy read fails closed — no hold is granted on uncertainty.
        let occupancy =
            with_backoff("occupancy_for", || self.ledger.occupancy_for(date, None)).await?;
        let overlapping: Vec<Span> = occupancy
            .iter()
            .filter(|s| s.overlaps(&span))
            .copied()
            .collect();
        if max_overlap(&overlapping, span) >= self.config.bays {
            metrics::counter!(crate::observability::HOLD_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::CapacityExhausted(self.config.bays));
        }

        let now = now_ms();

        // A live hold on a *different* key can still shadow this slot when
        // its service runs long; the per-key check-then-set below cannot
        // see those.
        let live = self.holds.live_for_date(date, now)?;
        for other in &live {
            if other.slot != slot && other.span.overlaps(&span) && other.holder != holder {
                metrics::counter!(crate::observability::HOLD_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::SlotHeld { slot });
            }
        }

        let hold = Hold {
            token: Ulid::new(),
            date,
            slot,
            span,
            service_id,
            holder: holder.to_string(),
            expires_at: now + self.config.hold_ttl_ms,
        };

        let outcome = self.holds.put_if_absent(hold.clone(), now)?;
        let token = match outcome {
            PutOutcome::Placed => hold.token,
            PutOutcome::Refreshed(token) => token,
            PutOutcome::Held => {
                metrics::counter!(crate::observability::HOLD_CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::SlotHeld { slot });
            }
        };

        let event = Event::HoldPlaced {
            token,
            date,
            slot,
            span,
            service_id,
            holder: holder.to_string(),
            expires_at: hold.expires_at,
        };
        if let Err(e) = self.wal.append(&event).await {
            // The hold never became durable: take it back so the in-memory
            // and on-disk views stay consistent, and fail closed.
            let _ = self.holds.remove_by_token(token);
            return Err(EngineError::WalError(e.to_string()));
        }

        self.notify.send_for(&event);
        metrics::counter!(crate::observability::HOLDS_PLACED_TOTAL).increment(1);
        metrics::gauge!(crate::observability::HOLDS_ACTIVE).increment(1.0);
        Ok(token)
    }

    /// Convert a live hold into a booking. The ledger re-checks overlap
    /// inside its per-date write section regardless of the hold. If the
    /// persistence write fails transiently the hold is kept so the caller
    /// can retry; once the booking exists, releasing the hold is
    /// best-effort (an expired leftover hold is harmless — occupancy now
    /// comes from the ledger).
    pub async fn confirm_hold(&self, token: Ulid) -> Result<BookingRecord, EngineError> {
        let hold = self
            .holds
            .get_by_token(token)?
            .ok_or(EngineError::HoldNotFound(token))?;

        let now = now_ms();
        if hold.is_expired(now) {
            self.expire_hold(&hold).await;
            return Err(EngineError::HoldExpired(token));
        }

        let draft = BookingDraft {
            id: Ulid::new(),
            date: hold.date,
            span: hold.span,
            service_id: hold.service_id,
            label: None,
        };
        let bays = self.config.bays;
        let record = match with_backoff("insert_if_no_overlap", || {
            self.ledger.insert_if_no_overlap(draft.clone(), bays)
        })
        .await
        {
            Ok(record) => record,
            Err(e @ EngineError::CapacityExhausted(_)) => {
                // The slot filled through another path — the hold is no
                // longer worth keeping.
                self.release_hold_best_effort(&hold).await;
                return Err(e);
            }
            // Transient failure: the caller still owns the hold and may
            // retry confirm_hold.
            Err(e) => return Err(e),
        };

        self.release_hold_best_effort(&hold).await;

        let event = Event::BookingConfirmed {
            id: record.id,
            date: record.date,
            span: record.span,
            service_id: record.service_id,
            label: record.label.clone(),
        };
        self.notify.send_for(&event);
        metrics::counter!(crate::observability::BOOKINGS_CONFIRMED_TOTAL).increment(1);
        Ok(record)
    }

    /// Explicit cancel of a hold (customer backed out of checkout).
    pub async fn release_hold(&self, token: Ulid) -> Result<(), EngineError> {
        let hold = self
            .holds
            .get_by_token(token)?
            .ok_or(EngineError::HoldNotFound(token))?;

        let event = Event::HoldReleased { token };
        self.wal.append(&event).await?;
        let _ = self.holds.remove_by_token(token);

        self.notify.send(hold.date, &event);
        metrics::gauge!(crate::observability::HOLDS_ACTIVE).decrement(1.0);
        Ok(())
    }

    /// Reaper path: drop an expired hold and announce `hold_expired` so
    /// subscribed clients see the slot come back.
    pub async fn expire_hold(&self, hold: &Hold) {
        let event = Event::HoldExpired { token: hold.token };
        if let Err(e) = self.wal.append(&event).await {
            tracing::warn!("could not journal hold expiry {}: {e}", hold.token);
            return; // retry on the next reaper tick
        }
        if self.holds.remove_by_token(hold.token).ok().flatten().is_some() {
            self.notify.send(hold.date, &event);
            metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
            metrics::gauge!(crate::observability::HOLDS_ACTIVE).decrement(1.0);
        }
    }

    async fn release_hold_best_effort(&self, hold: &Hold) {
        let event = Event::HoldReleased { token: hold.token };
        if let Err(e) = self.wal.append(&event).await {
            tracing::warn!("best-effort hold release {} not journaled: {e}", hold.token);
        }
        let _ = self.holds.remove_by_token(hold.token);
        self.notify.send(hold.date, &event);
        metrics::gauge!(crate::observability::HOLDS_ACTIVE).decrement(1.0);
    }

    /// Check that the slot is a legal candidate for this service today:
    /// open day, on the grid, whole duration inside hours, clear of the
    /// break and of maintenance blocks.
    async fn validate_slot(
        &self,
        date: NaiveDate,
        slot: Minute,
        duration: Minute,
    ) -> Result<Span, EngineError> {
        let calendar = self.calendar.read().await;
        let hours = match calendar.hours_for(date) {
            DaySchedule::Open(hours) => hours,
            DaySchedule::Closed { .. } => {
                return Err(EngineError::InvalidInput("business is closed on that date"));
            }
        };

        if slot < hours.open || (slot - hours.open) % self.config.slot_grid != 0 {
            return Err(EngineError::InvalidInput("slot is not on the booking grid"));
        }
        let end = slot as u32 + duration as u32;
        if end > hours.close as u32 {
            return Err(EngineError::InvalidInput("service does not fit before closing"));
        }
        let span = Span::new(slot, end as Minute);
        if let Some(brk) = hours.brk
            && span.overlaps(&brk)
        {
            return Err(EngineError::InvalidInput("slot crosses the daily break"));
        }

        for block in calendar.maintenance_for(date) {
            if block.span.overlaps(&span) {
                return Err(EngineError::MaintenanceBlocked { slot });
            }
        }

        Ok(span)
    }
}
