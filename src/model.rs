use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open interval `[start, end)`.
///
/// A `Span` can hold an inverted or empty window so that requests can be
/// represented before validation; see [`Span::is_well_formed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Scheduled,
    Completed,
    Cancelled,
}

impl Status {
    /// Scheduled and completed appointments both hold their window.
    pub fn is_active(self) -> bool {
        !matches!(self, Status::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }

    /// Whether `self → to` is a legal move. Staying put is always allowed.
    pub fn can_become(self, to: Status) -> bool {
        self == to || self == Status::Scheduled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Scheduled => "scheduled",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Ok(Status::Scheduled),
            "completed" => Ok(Status::Completed),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub patient_id: Ulid,
    pub doctor_id: Ulid,
    pub span: Span,
    pub status: Status,
    pub notes: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Calendar date as given by the client, e.g. `1990-04-12`. Stored as-is.
    pub birth_date: Option<String>,
    /// Stamped by the engine at registration.
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Ulid,
    pub name: String,
    pub specialty: String,
    pub created_at: Ms,
}

/// Partial update of an appointment. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub doctor_id: Option<Ulid>,
    /// `Some(None)` clears the notes.
    pub notes: Option<Option<String>>,
    pub status: Option<Status>,
}

impl AppointmentPatch {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn reschedule(span: Span) -> Self {
        Self {
            start: Some(span.start),
            end: Some(span.end),
            ..Self::default()
        }
    }
}

/// One doctor's appointments, sorted by `span.start`. Cancelled appointments
/// stay in the calendar but never count toward conflicts.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub doctor_id: Ulid,
    pub appointments: Vec<Appointment>,
}

impl Calendar {
    pub fn new(doctor_id: Ulid) -> Self {
        Self {
            doctor_id,
            appointments: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.appointments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appointments.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.appointments.iter().any(|a| a.id == *id)
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == *id)?;
        Some(self.appointments.remove(pos))
    }

    /// Appointments of any status whose span overlaps the query.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Active appointments overlapping the query, minus `exclude`.
    pub fn active_overlapping<'a>(
        &'a self,
        query: &'a Span,
        exclude: Option<Ulid>,
    ) -> impl Iterator<Item = &'a Appointment> {
        self.overlapping(query)
            .filter(move |a| a.status.is_active() && Some(a.id) != exclude)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PatientRegistered {
        patient: Patient,
    },
    DoctorRegistered {
        doctor: Doctor,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    /// Full record after the change; `doctor_id` may differ from the one the
    /// appointment was filed under.
    AppointmentRevised {
        appointment: Appointment,
    },
    AppointmentRemoved {
        id: Ulid,
        doctor_id: Ulid,
    },
}
