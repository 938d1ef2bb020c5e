use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedCalendar = Arc<RwLock<Calendar>>;

/// Appointments partitioned into one lockable calendar per doctor.
///
/// Calendar mutations take `&mut Calendar`: the caller holds the calendar's
/// write lock for the whole check-then-write sequence. The indexes here are
/// kept in step with the calendars by the same calls.
pub struct BookingStore {
    calendars: DashMap<Ulid, SharedCalendar>,
    /// appointment id → doctor id
    appointment_to_doctor: DashMap<Ulid, Ulid>,
    /// patient id → appointment ids
    by_patient: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for BookingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingStore {
    pub fn new() -> Self {
        Self {
            calendars: DashMap::new(),
            appointment_to_doctor: DashMap::new(),
            by_patient: DashMap::new(),
        }
    }

    // ── Calendars ────────────────────────────────────────────

    /// The doctor's calendar, created empty on first use.
    pub fn calendar(&self, doctor_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(doctor_id)
            .or_insert_with(|| Arc::new(RwLock::new(Calendar::new(doctor_id))))
            .value()
            .clone()
    }

    pub fn existing_calendar(&self, doctor_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(doctor_id).map(|e| e.value().clone())
    }

    /// Every calendar in doctor id order, the order multi-calendar locks are
    /// taken in.
    pub fn calendars(&self) -> Vec<SharedCalendar> {
        let mut all: Vec<(Ulid, SharedCalendar)> = self
            .calendars
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(doctor_id, _)| *doctor_id);
        all.into_iter().map(|(_, cal)| cal).collect()
    }

    pub fn calendar_count(&self) -> usize {
        self.calendars.len()
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn contains(&self, id: &Ulid) -> bool {
        self.appointment_to_doctor.contains_key(id)
    }

    pub fn doctor_of(&self, id: &Ulid) -> Option<Ulid> {
        self.appointment_to_doctor.get(id).map(|e| *e.value())
    }

    pub fn patient_appointment_ids(&self, patient_id: &Ulid) -> Vec<Ulid> {
        self.by_patient
            .get(patient_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn appointment_count(&self) -> usize {
        self.appointment_to_doctor.len()
    }

    // ── Mutations (caller holds the calendar write lock) ─────

    pub fn insert(&self, cal: &mut Calendar, appointment: Appointment) -> Result<(), EngineError> {
        if self.contains(&appointment.id) {
            return Err(EngineError::DuplicateId(appointment.id));
        }
        self.appointment_to_doctor
            .insert(appointment.id, cal.doctor_id);
        self.by_patient
            .entry(appointment.patient_id)
            .or_default()
            .push(appointment.id);
        cal.insert(appointment);
        Ok(())
    }

    /// Replace an appointment with its revised record. When the doctor
    /// changed, `target` is the new doctor's calendar; otherwise `None`.
    /// Returns the previous record.
    pub fn revise(
        &self,
        source: &mut Calendar,
        target: Option<&mut Calendar>,
        revised: Appointment,
    ) -> Result<Appointment, EngineError> {
        let previous = source
            .remove(&revised.id)
            .ok_or(EngineError::NotFound(revised.id))?;
        let id = revised.id;
        let dest = match target {
            Some(t) => t,
            None => source,
        };
        self.appointment_to_doctor.insert(id, dest.doctor_id);
        dest.insert(revised);
        Ok(previous)
    }

    pub fn remove(&self, cal: &mut Calendar, id: &Ulid) -> Result<Appointment, EngineError> {
        let removed = cal.remove(id).ok_or(EngineError::NotFound(*id))?;
        self.appointment_to_doctor.remove(id);
        if let Some(mut ids) = self.by_patient.get_mut(&removed.patient_id) {
            ids.retain(|a| a != id);
        }
        self.by_patient
            .remove_if(&removed.patient_id, |_, ids| ids.is_empty());
        Ok(removed)
    }

    // ── Reads ────────────────────────────────────────────────

    /// Look up an appointment without holding any lock afterwards. Retries if
    /// the appointment moves to another doctor mid-lookup.
    pub async fn get(&self, id: &Ulid) -> Result<Appointment, EngineError> {
        for _ in 0..crate::limits::MAX_LOCK_ATTEMPTS {
            let doctor_id = self.doctor_of(id).ok_or(EngineError::NotFound(*id))?;
            let Some(cal) = self.existing_calendar(&doctor_id) else {
                return Err(EngineError::NotFound(*id));
            };
            if let Some(found) = cal.read().await.get(id) {
                return Ok(found.clone());
            }
        }
        Err(EngineError::NotFound(*id))
    }

    /// Active appointments on the doctor's calendar overlapping `span`,
    /// minus `exclude`. Read-only snapshot; use
    /// [`Calendar::active_overlapping`] under a write lock when the answer
    /// gates a write.
    pub async fn find_active_overlapping(
        &self,
        doctor_id: &Ulid,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Vec<Appointment> {
        let Some(cal) = self.existing_calendar(doctor_id) else {
            return Vec::new();
        };
        let guard = cal.read().await;
        guard.active_overlapping(span, exclude).cloned().collect()
    }
}
