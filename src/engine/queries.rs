use std::cmp::Reverse;

use ulid::Ulid;

use crate::limits::MAX_LOCK_ATTEMPTS;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.store.get(&id).await
    }

    /// Every appointment, newest start first. All calendars are read-locked
    /// together so a move between doctors is seen either before or after.
    pub async fn list_appointments(&self) -> Vec<Appointment> {
        let mut guards = Vec::new();
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            guards.clear();
            for cal in self.store.calendars() {
                guards.push(cal.read_owned().await);
            }
            // A move can create its destination calendar after we listed them.
            if guards.len() == self.store.calendar_count() || attempt == MAX_LOCK_ATTEMPTS {
                break;
            }
        }

        let mut all = Vec::with_capacity(self.store.appointment_count());
        for guard in &guards {
            all.extend(guard.appointments.iter().cloned());
        }
        all.sort_by_key(|a| (Reverse(a.span.start), a.id));
        all
    }

    /// A doctor's appointments in calendar order. Unknown doctors have none.
    pub async fn list_doctor_appointments(&self, doctor_id: Ulid) -> Vec<Appointment> {
        match self.store.existing_calendar(&doctor_id) {
            Some(cal) => cal.read().await.appointments.clone(),
            None => Vec::new(),
        }
    }

    /// A patient's appointments across all doctors, earliest first.
    pub async fn list_patient_appointments(&self, patient_id: Ulid) -> Vec<Appointment> {
        let mut found = Vec::new();
        for id in self.store.patient_appointment_ids(&patient_id) {
            // Removed between index read and lookup: skip.
            if let Ok(appointment) = self.store.get(&id).await {
                found.push(appointment);
            }
        }
        found.sort_by_key(|a| (a.span.start, a.id));
        found
    }

    /// Active appointments on the doctor that overlap `span`. A snapshot for
    /// callers picking a slot; bookings re-check under lock.
    pub async fn conflicts(&self, doctor_id: Ulid, span: Span) -> Vec<Appointment> {
        self.store
            .find_active_overlapping(&doctor_id, &span, None)
            .await
    }

    pub fn get_patient(&self, id: Ulid) -> Result<Patient, EngineError> {
        self.registry.patient(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn get_doctor(&self, id: Ulid) -> Result<Doctor, EngineError> {
        self.registry.doctor(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn list_patients(&self) -> Vec<Patient> {
        self.registry.patients()
    }

    pub fn list_doctors(&self) -> Vec<Doctor> {
        self.registry.doctors()
    }
}
