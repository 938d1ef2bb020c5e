use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// An appointment may not hold a doctor for more than one day.
pub const MAX_SPAN_DURATION_MS: Ms = 86_400_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;

pub const MAX_PATIENTS: usize = 1_000_000;
pub const MAX_DOCTORS: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_DOCTOR: usize = 100_000;

/// How many times a lookup is retried when an appointment moves to another
/// doctor between index resolution and lock acquisition.
pub const MAX_LOCK_ATTEMPTS: usize = 8;
