use crate::model::*;

use super::LedgerError;

/// Booking-range validation: well-formed, at least the minimum duration,
/// not absurdly wide, timestamps inside the valid range.
pub(crate) fn validate_reservation_span(span: &Span) -> Result<(), LedgerError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(LedgerError::Validation("start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(LedgerError::Validation("timestamp out of range"));
    }
    if span.duration_ms() < MIN_RESERVATION_MS {
        return Err(LedgerError::Validation("reservation shorter than 15 minutes"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(LedgerError::LimitExceeded("reservation span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_request_id(request_id: &str) -> Result<(), LedgerError> {
    use crate::limits::*;
    if request_id.is_empty() {
        return Err(LedgerError::Validation("empty request id"));
    }
    if request_id.len() > MAX_REQUEST_ID_LEN {
        return Err(LedgerError::LimitExceeded("request id too long"));
    }
    Ok(())
}

/// The no-double-booking check: any Active reservation overlapping the
/// requested span is a conflict. Touching ranges (`a.end == b.start`) pass.
/// Caller holds the space's write lock, making check-and-insert atomic.
pub(crate) fn check_no_overlap(ss: &SpaceState, span: &Span) -> Result<(), LedgerError> {
    if let Some(existing) = ss.active_overlapping(span).next() {
        return Err(LedgerError::Conflict(existing.id));
    }
    Ok(())
}
