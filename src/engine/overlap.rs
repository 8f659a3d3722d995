use ulid::Ulid;

use crate::model::{minutes_ms, CalendarState, Span};

use super::error::{EngineError, Party};

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > minutes_ms(MAX_SESSION_MINUTES) {
        return Err(EngineError::LimitExceeded("session too long"));
    }
    Ok(())
}

/// First occupancy overlapping `span`, skipping `exclude` (the session
/// being edited must not collide with itself).
pub(crate) fn find_conflict(
    cal: &CalendarState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    cal.overlapping(span)
        .find(|o| exclude != Some(o.session_id))
        .map(|o| o.session_id)
}

/// Overlap check for one side of a proposed booking. The calendar holds
/// only occupying sessions, so anything found blocks.
pub(crate) fn check_side_free(
    cal: &CalendarState,
    span: &Span,
    party: Party,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(cal, span, exclude) {
        Some(_) => Err(EngineError::SlotTaken { party }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: crate::model::Ms = 3_600_000;

    fn cal_with(spans: &[(i64, i64)]) -> (CalendarState, Vec<Ulid>) {
        let mut cal = CalendarState::new(Ulid::new());
        let mut ids = Vec::new();
        for &(s, e) in spans {
            let id = Ulid::new();
            cal.occupy(id, Span::new(s, e));
            ids.push(id);
        }
        (cal, ids)
    }

    #[test]
    fn back_to_back_is_free() {
        let (cal, _) = cal_with(&[(9 * H, 10 * H)]);
        assert!(check_side_free(&cal, &Span::new(10 * H, 11 * H), Party::Coach, None).is_ok());
        assert!(check_side_free(&cal, &Span::new(8 * H, 9 * H), Party::Coach, None).is_ok());
    }

    #[test]
    fn conflict_carries_party() {
        let (cal, _) = cal_with(&[(9 * H, 10 * H)]);
        let span = Span::new(9 * H + 30 * 60_000, 10 * H + 30 * 60_000);
        let err = check_side_free(&cal, &span, Party::Client, None).unwrap_err();
        assert!(matches!(err, EngineError::SlotTaken { party: Party::Client }));
    }

    #[test]
    fn exclude_skips_own_occupancy() {
        let (cal, ids) = cal_with(&[(9 * H, 10 * H)]);
        let same = Span::new(9 * H, 10 * H);
        assert!(find_conflict(&cal, &same, Some(ids[0])).is_none());
        assert_eq!(find_conflict(&cal, &same, None), Some(ids[0]));
    }

    #[test]
    fn exclude_still_sees_others() {
        let (cal, ids) = cal_with(&[(9 * H, 10 * H), (11 * H, 12 * H)]);
        let span = Span::new(9 * H, 12 * H);
        assert_eq!(find_conflict(&cal, &span, Some(ids[0])), Some(ids[1]));
    }

    #[test]
    fn span_limits_enforced() {
        assert!(matches!(
            validate_span(&Span::new(1, 2)),
            Err(EngineError::LimitExceeded(_))
        ));
        let start = crate::limits::MIN_VALID_TIMESTAMP_MS;
        assert!(matches!(
            validate_span(&Span::new(start, start + 48 * H)),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(validate_span(&Span::new(start, start + H)).is_ok());
    }
}
