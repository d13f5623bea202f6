use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::{
    format_hhmm, parse_hhmm, parse_weekday, BookingStatus, Event, Minute, Span, TimeSlot,
    WeekdayHours,
};

/// One request per line, newline-delimited JSON. The `op` tag selects the
/// operation; times are `HH:MM`, dates `YYYY-MM-DD`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Slots {
        date: String,
        service: String,
        #[serde(default)]
        holder: Option<String>,
    },
    Hold {
        date: String,
        slot: String,
        service: String,
        holder: String,
    },
    Confirm {
        token: String,
    },
    Release {
        token: String,
    },
    AddService {
        name: String,
        duration_min: Minute,
    },
    RetireService {
        id: String,
    },
    Services,
    SetHours {
        weekday: String,
        #[serde(default)]
        open: Option<String>,
        #[serde(default)]
        close: Option<String>,
        #[serde(default)]
        break_start: Option<String>,
        #[serde(default)]
        break_end: Option<String>,
    },
    AddHoliday {
        date: String,
        #[serde(default)]
        label: Option<String>,
    },
    RemoveHoliday {
        date: String,
    },
    AddMaintenance {
        date: String,
        start: String,
        end: String,
        reason: String,
    },
    RemoveMaintenance {
        id: String,
    },
    Bookings {
        date: String,
    },
    Holds {
        date: String,
    },
    SetBookingStatus {
        id: String,
        status: String,
    },
    Subscribe {
        date: String,
    },
}

fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Slots { .. } => "slots",
        Request::Hold { .. } => "hold",
        Request::Confirm { .. } => "confirm",
        Request::Release { .. } => "release",
        Request::AddService { .. } => "add_service",
        Request::RetireService { .. } => "retire_service",
        Request::Services => "services",
        Request::SetHours { .. } => "set_hours",
        Request::AddHoliday { .. } => "add_holiday",
        Request::RemoveHoliday { .. } => "remove_holiday",
        Request::AddMaintenance { .. } => "add_maintenance",
        Request::RemoveMaintenance { .. } => "remove_maintenance",
        Request::Bookings { .. } => "bookings",
        Request::Holds { .. } => "holds",
        Request::SetBookingStatus { .. } => "set_booking_status",
        Request::Subscribe { .. } => "subscribe",
    }
}

/// Serve one client connection until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    // Pushed notifications from date subscriptions funnel through here so
    // the write half stays single-owner.
    let (push_tx, mut push_rx) = mpsc::channel::<String>(64);

    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(line) = line else { break };
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let response = dispatch(&engine, &line, &push_tx).await;
                framed.send(response.to_string()).await?;
            }
            Some(pushed) = push_rx.recv() => {
                framed.send(pushed).await?;
            }
        }
    }

    Ok(())
}

async fn dispatch(engine: &Arc<Engine>, line: &str, push_tx: &mpsc::Sender<String>) -> Value {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return error_body("invalid", &format!("malformed request: {e}"), None);
        }
    };

    let op = op_label(&req);
    let started = Instant::now();
    let result = handle(engine, req, push_tx).await;
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(body) => {
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => "ok")
                .increment(1);
            body
        }
        Err(e) => {
            // Conflicts and expiries are expected traffic, not errors.
            match e.kind() {
                "conflict" | "expired" => tracing::debug!("{op}: {e}"),
                "unavailable" => tracing::error!("{op}: {e}"),
                _ => tracing::debug!("{op} rejected: {e}"),
            }
            metrics::counter!(crate::observability::REQUESTS_TOTAL, "op" => op, "status" => e.kind())
                .increment(1);
            error_body(e.kind(), &e.to_string(), Some(e.user_message()))
        }
    }
}

fn error_body(kind: &str, detail: &str, user_message: Option<&str>) -> Value {
    json!({
        "ok": false,
        "error": {
            "kind": kind,
            "detail": detail,
            "message": user_message.unwrap_or("the request could not be processed"),
        }
    })
}

async fn handle(
    engine: &Arc<Engine>,
    req: Request,
    push_tx: &mpsc::Sender<String>,
) -> Result<Value, EngineError> {
    match req {
        Request::Slots { date, service, holder } => {
            let date = parse_date(&date)?;
            let service = parse_ulid(&service)?;
            let slots = engine.compute_slots(date, service, holder.as_deref()).await?;
            Ok(json!({ "ok": true, "date": date, "slots": slots_json(&slots) }))
        }
        Request::Hold { date, slot, service, holder } => {
            let date = parse_date(&date)?;
            let slot = parse_time(&slot)?;
            let service = parse_ulid(&service)?;
            let token = engine.attempt_hold(date, slot, service, &holder).await?;
            Ok(json!({ "ok": true, "token": token.to_string() }))
        }
        Request::Confirm { token } => {
            let token = parse_ulid(&token)?;
            let record = engine.confirm_hold(token).await?;
            Ok(json!({
                "ok": true,
                "booking": {
                    "id": record.id.to_string(),
                    "date": record.date,
                    "start": format_hhmm(record.span.start),
                    "end": format_hhmm(record.span.end),
                    "service": record.service_id.to_string(),
                    "status": record.status.as_str(),
                }
            }))
        }
        Request::Release { token } => {
            let token = parse_ulid(&token)?;
            engine.release_hold(token).await?;
            Ok(json!({ "ok": true }))
        }
        Request::AddService { name, duration_min } => {
            let svc = engine.add_service(name, duration_min).await?;
            Ok(json!({ "ok": true, "id": svc.id.to_string() }))
        }
        Request::RetireService { id } => {
            engine.retire_service(parse_ulid(&id)?).await?;
            Ok(json!({ "ok": true }))
        }
        Request::Services => {
            let services: Vec<Value> = engine
                .list_services()
                .iter()
                .map(|s| {
                    json!({
                        "id": s.id.to_string(),
                        "name": s.name,
                        "duration_min": s.duration_min,
                        "active": s.active,
                    })
                })
                .collect();
            Ok(json!({ "ok": true, "services": services }))
        }
        Request::SetHours { weekday, open, close, break_start, break_end } => {
            let weekday = parse_weekday(&weekday)
                .ok_or(EngineError::InvalidInput("unknown weekday name"))?;
            let hours = match (open, close) {
                (None, None) => None, // closed that weekday
                (Some(open), Some(close)) => {
                    let brk = match (break_start, break_end) {
                        (None, None) => None,
                        (Some(s), Some(e)) => {
                            let (s, e) = (parse_time(&s)?, parse_time(&e)?);
                            if s >= e {
                                return Err(EngineError::InvalidInput(
                                    "break start must be before break end",
                                ));
                            }
                            Some(Span::new(s, e))
                        }
                        _ => {
                            return Err(EngineError::InvalidInput(
                                "break needs both start and end",
                            ));
                        }
                    };
                    Some(WeekdayHours {
                        open: parse_time(&open)?,
                        close: parse_time(&close)?,
                        brk,
                    })
                }
                _ => {
                    return Err(EngineError::InvalidInput(
                        "hours need both open and close, or neither",
                    ));
                }
            };
            engine.set_hours(weekday, hours).await?;
            Ok(json!({ "ok": true }))
        }
        Request::AddHoliday { date, label } => {
            engine.add_holiday(parse_date(&date)?, label).await?;
            Ok(json!({ "ok": true }))
        }
        Request::RemoveHoliday { date } => {
            engine.remove_holiday(parse_date(&date)?).await?;
            Ok(json!({ "ok": true }))
        }
        Request::AddMaintenance { date, start, end, reason } => {
            let (start, end) = (parse_time(&start)?, parse_time(&end)?);
            if start >= end {
                return Err(EngineError::InvalidInput("maintenance start must be before end"));
            }
            let id = engine
                .add_maintenance(parse_date(&date)?, Span::new(start, end), reason)
                .await?;
            Ok(json!({ "ok": true, "id": id.to_string() }))
        }
        Request::RemoveMaintenance { id } => {
            engine.remove_maintenance(parse_ulid(&id)?).await?;
            Ok(json!({ "ok": true }))
        }
        Request::Bookings { date } => {
            let bookings: Vec<Value> = engine
                .bookings_for(parse_date(&date)?)
                .await?
                .iter()
                .map(|b| {
                    json!({
                        "id": b.id.to_string(),
                        "start": format_hhmm(b.span.start),
                        "end": format_hhmm(b.span.end),
                        "service": b.service_id.to_string(),
                        "status": b.status.as_str(),
                    })
                })
                .collect();
            Ok(json!({ "ok": true, "bookings": bookings }))
        }
        Request::Holds { date } => {
            let holds: Vec<Value> = engine
                .holds_for(parse_date(&date)?)
                .await?
                .iter()
                .map(|h| {
                    json!({
                        "token": h.token.to_string(),
                        "slot": format_hhmm(h.slot),
                        "service": h.service_id.to_string(),
                        "holder": h.holder,
                        "expires_at": h.expires_at,
                    })
                })
                .collect();
            Ok(json!({ "ok": true, "holds": holds }))
        }
        Request::SetBookingStatus { id, status } => {
            let status = BookingStatus::parse(&status)
                .ok_or(EngineError::InvalidInput("unknown booking status"))?;
            let record = engine.set_booking_status(parse_ulid(&id)?, status).await?;
            Ok(json!({ "ok": true, "id": record.id.to_string(), "status": record.status.as_str() }))
        }
        Request::Subscribe { date } => {
            let date = parse_date(&date)?;
            let mut rx = engine.notify.subscribe(date);
            let tx = push_tx.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let line = event_json(date, &event).to_string();
                            if tx.send(line).await.is_err() {
                                break; // connection gone
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("subscriber lagged {n} events on {date}");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            Ok(json!({ "ok": true, "subscribed": date }))
        }
    }
}

fn slots_json(slots: &[TimeSlot]) -> Vec<Value> {
    slots
        .iter()
        .map(|s| {
            json!({
                "start": format_hhmm(s.start),
                "end": format_hhmm(s.end),
                "max_capacity": s.max_capacity,
                "booked": s.booked,
                "available_capacity": s.available_capacity(),
                "available": s.is_available(),
                "conflicts": s.conflicts,
            })
        })
        .collect()
}

fn event_json(date: NaiveDate, event: &Event) -> Value {
    let kind = match event {
        Event::HoldPlaced { .. } => "hold_placed",
        Event::HoldReleased { .. } => "hold_released",
        Event::HoldExpired { .. } => "hold_expired",
        Event::BookingConfirmed { .. } => "booking_confirmed",
        Event::BookingStatusChanged { .. } => "booking_status_changed",
        Event::HolidayAdded { .. } => "holiday_added",
        Event::HolidayRemoved { .. } => "holiday_removed",
        Event::MaintenanceAdded { .. } => "maintenance_added",
        Event::MaintenanceRemoved { .. } => "maintenance_removed",
        Event::HoursSet { .. } => "hours_set",
        Event::ServiceAdded { .. } => "service_added",
        Event::ServiceRetired { .. } => "service_retired",
    };
    json!({ "event": kind, "date": date, "detail": event })
}

fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidInput("date must be YYYY-MM-DD"))
}

fn parse_time(s: &str) -> Result<Minute, EngineError> {
    parse_hhmm(s).ok_or(EngineError::InvalidInput("time must be HH:MM"))
}

fn parse_ulid(s: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(s).map_err(|_| EngineError::InvalidInput("malformed id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::notify::NotifyHub;

    fn test_engine(name: &str) -> Arc<Engine> {
        let dir = std::env::temp_dir().join("bayline_test_wire");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        Arc::new(Engine::open(&path, EngineConfig::default(), Arc::new(NotifyHub::new())).unwrap())
    }

    async fn call(engine: &Arc<Engine>, line: &str) -> Value {
        let (tx, _rx) = mpsc::channel(8);
        dispatch(engine, line, &tx).await
    }

    #[tokio::test]
    async fn malformed_json_is_invalid() {
        let engine = test_engine("malformed.wal");
        let resp = call(&engine, "{not json").await;
        assert_eq!(resp["ok"], false);
        assert_eq!(resp["error"]["kind"], "invalid");
    }

    #[tokio::test]
    async fn unknown_op_is_invalid() {
        let engine = test_engine("unknown_op.wal");
        let resp = call(&engine, r#"{"op":"frobnicate"}"#).await;
        assert_eq!(resp["error"]["kind"], "invalid");
    }

    #[tokio::test]
    async fn bad_date_and_time_strings() {
        let engine = test_engine("bad_strings.wal");
        let resp = call(
            &engine,
            r#"{"op":"slots","date":"08/03/2026","service":"01ARZ3NDEKTSV4RRFFQ69G5FAV"}"#,
        )
        .await;
        assert_eq!(resp["error"]["kind"], "invalid");

        let resp = call(&engine, r#"{"op":"add_holiday","date":"not-a-date"}"#).await;
        assert_eq!(resp["error"]["kind"], "invalid");
    }

    #[tokio::test]
    async fn end_to_end_hold_conflict_shape() {
        let engine = test_engine("e2e_shape.wal");

        let resp = call(
            &engine,
            r#"{"op":"set_hours","weekday":"monday","open":"08:00","close":"17:00","break_start":"12:00","break_end":"13:00"}"#,
        )
        .await;
        assert_eq!(resp["ok"], true);

        let resp = call(&engine, r#"{"op":"add_service","name":"exterior wash","duration_min":45}"#).await;
        assert_eq!(resp["ok"], true);
        let service = resp["id"].as_str().unwrap().to_string();

        let resp = call(
            &engine,
            &format!(r#"{{"op":"slots","date":"2026-08-03","service":"{service}"}}"#),
        )
        .await;
        assert_eq!(resp["ok"], true);
        let slots = resp["slots"].as_array().unwrap();
        assert_eq!(slots[0]["start"], "08:00");
        assert_eq!(slots[0]["available"], true);

        // Hold 10:00 as alice, then bob collides
        let resp = call(
            &engine,
            &format!(r#"{{"op":"hold","date":"2026-08-03","slot":"10:00","service":"{service}","holder":"alice"}}"#),
        )
        .await;
        assert_eq!(resp["ok"], true);

        let resp = call(
            &engine,
            &format!(r#"{{"op":"hold","date":"2026-08-03","slot":"10:00","service":"{service}","holder":"bob"}}"#),
        )
        .await;
        assert_eq!(resp["error"]["kind"], "conflict");
        assert_eq!(resp["error"]["message"], "this slot was just taken");
    }

    #[tokio::test]
    async fn closed_day_returns_empty_slots() {
        let engine = test_engine("closed_empty.wal");
        let resp = call(&engine, r#"{"op":"add_service","name":"wax","duration_min":30}"#).await;
        let service = resp["id"].as_str().unwrap().to_string();

        // No hours configured at all — every day closed
        let resp = call(
            &engine,
            &format!(r#"{{"op":"slots","date":"2026-08-03","service":"{service}"}}"#),
        )
        .await;
        assert_eq!(resp["ok"], true);
        assert!(resp["slots"].as_array().unwrap().is_empty());
    }
}
