use crate::model::{
    format_hhmm, ConflictKind, Hold, MaintenanceBlock, Minute, SlotConflict, Span, TimeSlot,
    WeekdayHours,
};

/// Everything the slot generator needs for one (date, service) query.
/// The engine assembles this from the calendar, ledger and hold store;
/// keeping the algorithm itself pure makes the boundary cases testable
/// without any async machinery.
pub struct SlotQuery<'a> {
    pub hours: WeekdayHours,
    /// Service duration — how long each candidate occupies a bay.
    pub duration: Minute,
    /// Candidate starts are generated on this grid, anchored at open.
    pub grid: Minute,
    /// Wash bays available concurrently.
    pub capacity: u32,
    /// Occupied spans of non-cancelled bookings on the date.
    pub occupancy: &'a [Span],
    /// Live holds on the date.
    pub holds: &'a [Hold],
    pub maintenance: &'a [MaintenanceBlock],
    /// Holder identity of the caller, if any: their own holds are not
    /// conflicts for them.
    pub viewer: Option<&'a str>,
}

/// Generate the candidate slots for one day, chronologically ordered.
///
/// Candidates run from open on the grid and are bounded so that
/// `start + duration <= close` — a slot is only offered if the whole
/// service fits before closing. Candidates crossing the break are not
/// offered at all. Booked-out and held slots ARE returned, with their
/// counts and conflicts, so the caller can explain why they are
/// unavailable rather than silently hiding them.
pub fn generate_slots(q: &SlotQuery<'_>) -> Vec<TimeSlot> {
    let mut slots = Vec::new();
    if q.duration == 0 || q.grid == 0 {
        return slots;
    }

    let mut start = q.hours.open;
    while start + q.duration <= q.hours.close {
        let span = Span::new(start, start + q.duration);

        if let Some(brk) = q.hours.brk
            && span.overlaps(&brk)
        {
            start += q.grid;
            continue;
        }

        let booked = q.occupancy.iter().filter(|s| s.overlaps(&span)).count() as u32;

        let mut conflicts = Vec::new();
        for block in q.maintenance {
            if block.span.overlaps(&span) {
                conflicts.push(SlotConflict {
                    kind: ConflictKind::Maintenance,
                    message: format!("maintenance: {}", block.reason),
                });
            }
        }
        for hold in q.holds {
            if hold.span.overlaps(&span) && q.viewer != Some(hold.holder.as_str()) {
                conflicts.push(SlotConflict {
                    kind: ConflictKind::Held,
                    message: format!(
                        "{} is being held by another customer",
                        format_hhmm(hold.slot)
                    ),
                });
            }
        }

        slots.push(TimeSlot {
            start,
            end: span.end,
            max_capacity: q.capacity,
            booked,
            conflicts,
        });
        start += q.grid;
    }

    slots
}

/// Maximum number of spans simultaneously covering any instant inside
/// `window`. Sweep line over clipped start/end events; ends sort before
/// starts at the same instant, so back-to-back spans never double-count.
pub fn max_overlap(spans: &[Span], window: Span) -> u32 {
    let mut events: Vec<(Minute, i32)> = Vec::with_capacity(spans.len() * 2);
    for s in spans {
        if !s.overlaps(&window) {
            continue;
        }
        events.push((s.start.max(window.start), 1));
        events.push((s.end.min(window.end), -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut count: i32 = 0;
    let mut max: i32 = 0;
    for (_, delta) in events {
        count += delta;
        max = max.max(count);
    }
    max as u32
}
