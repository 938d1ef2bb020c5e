use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Doctor, Patient};

/// Patients and doctors known to the engine. Appointments only need
/// existence checks from here; the records themselves are opaque.
pub struct Registry {
    patients: DashMap<Ulid, Patient>,
    doctors: DashMap<Ulid, Doctor>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            patients: DashMap::new(),
            doctors: DashMap::new(),
        }
    }

    pub fn has_patient(&self, id: &Ulid) -> bool {
        self.patients.contains_key(id)
    }

    pub fn has_doctor(&self, id: &Ulid) -> bool {
        self.doctors.contains_key(id)
    }

    pub fn patient(&self, id: &Ulid) -> Option<Patient> {
        self.patients.get(id).map(|e| e.value().clone())
    }

    pub fn doctor(&self, id: &Ulid) -> Option<Doctor> {
        self.doctors.get(id).map(|e| e.value().clone())
    }

    pub fn patient_count(&self) -> usize {
        self.patients.len()
    }

    pub fn doctor_count(&self) -> usize {
        self.doctors.len()
    }

    pub fn patients(&self) -> Vec<Patient> {
        let mut all: Vec<Patient> = self.patients.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub fn doctors(&self) -> Vec<Doctor> {
        let mut all: Vec<Doctor> = self.doctors.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|d| d.id);
        all
    }

    pub fn insert_patient(&self, patient: Patient) {
        self.patients.insert(patient.id, patient);
    }

    pub fn insert_doctor(&self, doctor: Doctor) {
        self.doctors.insert(doctor.id, doctor);
    }
}
