use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Validate a raw `[start, end)` pair and build the span.
pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::Validation("end must be after start"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_booking_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = checked_span(start, end)?;
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Which existing bookings count against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConflictScope {
    /// PENDING and CONFIRMED: used when a request is created.
    Claimed,
    /// CONFIRMED only: used when a request is approved.
    Confirmed,
}

/// Fail with the first booking in scope whose span overlaps `span`.
/// `ignore` skips the booking being decided.
pub(crate) fn check_no_conflict(
    ls: &LabState,
    span: &Span,
    scope: ConflictScope,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    for booking in ls.overlapping_bookings(span) {
        if ignore == Some(booking.id) {
            continue;
        }
        let counts = match scope {
            ConflictScope::Claimed => booking.status.claims_window(),
            ConflictScope::Confirmed => booking.status == BookingStatus::Confirmed,
        };
        if counts {
            return Err(EngineError::Conflict(booking.id));
        }
    }
    Ok(())
}

/// Trim, drop empty, enforce a length cap.
pub(crate) fn clean_optional(
    value: Option<String>,
    max_len: usize,
    what: &'static str,
) -> Result<Option<String>, EngineError> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) if v.len() > max_len => Err(EngineError::LimitExceeded(what)),
        other => Ok(other),
    }
}

/// Trim and require a non-empty value within the length cap.
pub(crate) fn clean_required(
    value: &str,
    max_len: usize,
    missing: &'static str,
    too_long: &'static str,
) -> Result<String, EngineError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EngineError::Validation(missing));
    }
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(value.to_string())
}
