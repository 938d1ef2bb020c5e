use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span, validate_text};
use super::{CalendarLocks, Engine, EngineError};

/// Merge a patch into the current record, enforcing the status machine and
/// window well-formedness. Conflict checks happen separately, under lock.
fn merge_patch(current: &Appointment, patch: &AppointmentPatch) -> Result<Appointment, EngineError> {
    let span = Span::new(
        patch.start.unwrap_or(current.span.start),
        patch.end.unwrap_or(current.span.end),
    );
    let doctor_id = patch.doctor_id.unwrap_or(current.doctor_id);
    let status = patch.status.unwrap_or(current.status);

    let moved = span != current.span || doctor_id != current.doctor_id;
    if moved {
        validate_span(&span)?;
        // Only a scheduled appointment can be rescheduled.
        if current.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id: current.id,
                from: current.status,
                to: Status::Scheduled,
            });
        }
    }
    if !current.status.can_become(status) {
        return Err(EngineError::InvalidTransition {
            id: current.id,
            from: current.status,
            to: status,
        });
    }

    Ok(Appointment {
        span,
        doctor_id,
        status,
        notes: patch.notes.clone().unwrap_or_else(|| current.notes.clone()),
        ..current.clone()
    })
}

impl Engine {
    pub async fn register_patient(&self, mut patient: Patient) -> Result<(), EngineError> {
        validate_text(Some(patient.name.as_str()), MAX_NAME_LEN, "patient name too long")?;
        validate_text(patient.email.as_deref(), MAX_CONTACT_LEN, "email too long")?;
        validate_text(patient.phone.as_deref(), MAX_CONTACT_LEN, "phone too long")?;
        validate_text(patient.birth_date.as_deref(), MAX_CONTACT_LEN, "birth date too long")?;

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.registry.patient_count() >= MAX_PATIENTS {
            return Err(EngineError::LimitExceeded("too many patients"));
        }
        if self.registry.has_patient(&patient.id) {
            return Err(EngineError::AlreadyExists(patient.id));
        }
        patient.created_at = now_ms();

        let event = Event::PatientRegistered {
            patient: patient.clone(),
        };
        self.wal_append(&event).await?;
        self.registry.insert_patient(patient);
        Ok(())
    }

    pub async fn register_doctor(&self, mut doctor: Doctor) -> Result<(), EngineError> {
        validate_text(Some(doctor.name.as_str()), MAX_NAME_LEN, "doctor name too long")?;
        validate_text(Some(doctor.specialty.as_str()), MAX_NAME_LEN, "specialty too long")?;

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry_lock.lock().await;
        if self.registry.doctor_count() >= MAX_DOCTORS {
            return Err(EngineError::LimitExceeded("too many doctors"));
        }
        if self.registry.has_doctor(&doctor.id) {
            return Err(EngineError::AlreadyExists(doctor.id));
        }
        doctor.created_at = now_ms();

        let event = Event::DoctorRegistered {
            doctor: doctor.clone(),
        };
        self.wal_append(&event).await?;
        self.registry.insert_doctor(doctor);
        Ok(())
    }

    /// Book `span` on the doctor's calendar for the patient. The returned
    /// appointment carries its freshly allocated id.
    pub async fn create_appointment(
        &self,
        patient_id: Ulid,
        doctor_id: Ulid,
        span: Span,
        notes: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_span(&span)?;
        validate_text(notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        if !self.registry.has_patient(&patient_id) {
            return Err(EngineError::UnknownPatient(patient_id));
        }
        if !self.registry.has_doctor(&doctor_id) {
            return Err(EngineError::UnknownDoctor(doctor_id));
        }

        let _gate = self.commit_gate.read().await;
        let mut locks = CalendarLocks {
            source: self.store.calendar(doctor_id).write_owned().await,
            target: None,
        };
        if locks.source().len() >= MAX_APPOINTMENTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many appointments for doctor"));
        }

        check_no_conflict(locks.source(), &span, None)?;

        let id = Ulid::new();
        if self.store.contains(&id) {
            return Err(EngineError::DuplicateId(id));
        }
        let appointment = Appointment {
            id,
            patient_id,
            doctor_id,
            span,
            status: Status::Scheduled,
            notes,
            created_at: now_ms(),
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.persist_and_apply(&mut locks, &event).await?;
        Ok(appointment)
    }

    /// Apply a patch. Moving the window or the doctor re-checks conflicts on
    /// the destination calendar, ignoring the appointment's own record. A
    /// patch that changes nothing is not persisted.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        // Existence is re-checked under the calendar lock below.
        if !self.store.contains(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(Some(notes)) = &patch.notes {
            validate_text(Some(notes.as_str()), MAX_NOTES_LEN, "notes too long")?;
        }
        if let Some(doctor_id) = patch.doctor_id
            && !self.registry.has_doctor(&doctor_id)
        {
            return Err(EngineError::UnknownDoctor(doctor_id));
        }

        let _gate = self.commit_gate.read().await;
        let mut locks = self.lock_appointment(&id, patch.doctor_id).await?;
        let current = locks
            .source()
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let revised = merge_patch(&current, &patch)?;
        if revised == current {
            return Ok(current);
        }

        let moved = revised.span != current.span || revised.doctor_id != current.doctor_id;
        if moved && revised.status.is_active() {
            if revised.doctor_id != current.doctor_id
                && locks.target().len() >= MAX_APPOINTMENTS_PER_DOCTOR
            {
                return Err(EngineError::LimitExceeded("too many appointments for doctor"));
            }
            check_no_conflict(locks.target(), &revised.span, Some(id))?;
        }

        let event = Event::AppointmentRevised {
            appointment: revised.clone(),
        };
        self.persist_and_apply(&mut locks, &event).await?;
        Ok(revised)
    }

    /// Scheduled → Cancelled. Frees the window; cancelling twice is a no-op.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.update_appointment(id, AppointmentPatch::status(Status::Cancelled))
            .await
    }

    /// Scheduled → Completed. The window stays occupied.
    pub async fn complete_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.update_appointment(id, AppointmentPatch::status(Status::Completed))
            .await
    }

    /// Hard delete in any status. Returns the removed record.
    pub async fn remove_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut locks = self.lock_appointment(&id, None).await?;
        let removed = locks
            .source()
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let event = Event::AppointmentRemoved {
            id,
            doctor_id: locks.source().doctor_id,
        };
        self.persist_and_apply(&mut locks, &event).await?;
        Ok(removed)
    }
}
