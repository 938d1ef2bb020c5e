use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if !span.is_well_formed() {
        return Err(EngineError::InvalidWindow(*span));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

pub(crate) fn validate_text(
    value: Option<&str>,
    max_len: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max_len => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// Whether any active appointment other than `exclude` overlaps `span`.
pub fn has_conflict(cal: &Calendar, span: &Span, exclude: Option<Ulid>) -> bool {
    cal.active_overlapping(span, exclude).next().is_some()
}

/// Like [`has_conflict`], but names the first conflicting appointment.
pub(crate) fn check_no_conflict(
    cal: &Calendar,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match cal.active_overlapping(span, exclude).next() {
        Some(existing) => Err(EngineError::Unavailable {
            conflict: existing.id,
            span: existing.span,
        }),
        None => Ok(()),
    }
}
