mod conflict;
mod error;
mod lifecycle;
mod queries;
mod registry;
mod store;
#[cfg(test)]
mod tests;

use conflict::check_no_conflict;
pub use conflict::has_conflict;
pub use error::EngineError;
pub use registry::Registry;
pub use store::{BookingStore, SharedCalendar};

use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::limits::MAX_LOCK_ATTEMPTS;
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Commit the batch with a single fsync, or roll it back whole.
/// 4. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let pending = match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty: flush batch
                    }
                }
                commit_batch(&mut wal, batch);
                pending
            }
            other => Some(other),
        };
        if let Some(cmd) = pending
            && !handle_non_append(&mut wal, cmd)
        {
            break;
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    // A failed batch is cut back off the log as a whole; every caller in it
    // sees the error and none of them touches memory.
    let (events, senders): (Vec<Event>, Vec<_>) = batch.into_iter().unzip();
    let result = wal.commit(&events);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for tx in senders {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns false when the writer should stop.
fn handle_non_append(wal: &mut Wal, cmd: WalCommand) -> bool {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
            true
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        WalCommand::Shutdown { response } => {
            let _ = response.send(wal.flush_sync());
            false
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, vec![(event, response)]);
            true
        }
    }
}

// ── Engine ───────────────────────────────────────────────

/// Write guards on the calendars an appointment mutation touches: the one it
/// is filed under, plus the destination when it moves to another doctor.
struct CalendarLocks {
    source: OwnedRwLockWriteGuard<Calendar>,
    target: Option<OwnedRwLockWriteGuard<Calendar>>,
}

impl CalendarLocks {
    fn source(&self) -> &Calendar {
        &self.source
    }

    /// The calendar the appointment ends up on.
    fn target(&self) -> &Calendar {
        self.target.as_deref().unwrap_or(&*self.source)
    }

    fn split(&mut self) -> (&mut Calendar, Option<&mut Calendar>) {
        (&mut *self.source, self.target.as_deref_mut())
    }
}

pub struct Engine {
    store: BookingStore,
    registry: Registry,
    wal_tx: mpsc::Sender<WalCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Shared by every mutation, exclusive for compaction.
    commit_gate: RwLock<()>,
    /// Serializes registry check-then-write.
    registry_lock: tokio::sync::Mutex<()>,
}

/// Apply an appointment event to already-locked calendars.
fn apply_to_calendars(
    store: &BookingStore,
    event: &Event,
    source: &mut Calendar,
    target: Option<&mut Calendar>,
) -> Result<(), EngineError> {
    match event {
        Event::AppointmentBooked { appointment } => store.insert(source, appointment.clone()),
        Event::AppointmentRevised { appointment } => {
            store.revise(source, target, appointment.clone()).map(|_| ())
        }
        Event::AppointmentRemoved { id, .. } => store.remove(source, id).map(|_| ()),
        Event::PatientRegistered { .. } | Event::DoctorRegistered { .. } => Ok(()),
    }
}

impl Engine {
    /// Open the store: replay the WAL at `wal_path` and start the WAL writer.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let handle = tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: BookingStore::new(),
            registry: Registry::new(),
            wal_tx,
            writer: Mutex::new(Some(handle)),
            commit_gate: RwLock::new(()),
            registry_lock: tokio::sync::Mutex::new(()),
        };

        for event in &events {
            // A record that no longer applies (a duplicate, or a booking that
            // would overlap an active one) is skipped.
            if let Err(e) = engine.apply_replayed(event) {
                tracing::warn!("skipping WAL record on replay: {e}");
            }
        }

        Ok(engine)
    }

    /// Replay one event. We're the sole owner of every calendar at this point,
    /// so `try_write` never contends; never block here because replay may run
    /// inside an async context.
    fn apply_replayed(&self, event: &Event) -> Result<(), EngineError> {
        let busy = || EngineError::WalError("replay: calendar locked".into());
        match event {
            Event::PatientRegistered { patient } => {
                self.registry.insert_patient(patient.clone());
                Ok(())
            }
            Event::DoctorRegistered { doctor } => {
                self.registry.insert_doctor(doctor.clone());
                Ok(())
            }
            Event::AppointmentBooked { appointment } => {
                let cal = self.store.calendar(appointment.doctor_id);
                let mut guard = cal.try_write().map_err(|_| busy())?;
                if appointment.status.is_active() {
                    check_no_conflict(&guard, &appointment.span, None)?;
                }
                apply_to_calendars(&self.store, event, &mut guard, None)
            }
            Event::AppointmentRevised { appointment } => {
                let source_id = self
                    .store
                    .doctor_of(&appointment.id)
                    .ok_or(EngineError::NotFound(appointment.id))?;
                let source = self.store.calendar(source_id);
                let mut source_guard = source.try_write().map_err(|_| busy())?;
                let active = appointment.status.is_active();
                if source_id == appointment.doctor_id {
                    if active {
                        check_no_conflict(&source_guard, &appointment.span, Some(appointment.id))?;
                    }
                    apply_to_calendars(&self.store, event, &mut source_guard, None)
                } else {
                    let target = self.store.calendar(appointment.doctor_id);
                    let mut target_guard = target.try_write().map_err(|_| busy())?;
                    if active {
                        check_no_conflict(&target_guard, &appointment.span, Some(appointment.id))?;
                    }
                    apply_to_calendars(&self.store, event, &mut source_guard, Some(&mut target_guard))
                }
            }
            Event::AppointmentRemoved { doctor_id, .. } => {
                let cal = self.store.calendar(*doctor_id);
                let mut guard = cal.try_write().map_err(|_| busy())?;
                apply_to_calendars(&self.store, event, &mut guard, None)
            }
        }
    }

    async fn send_wal(&self, cmd: WalCommand) -> Result<(), EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))
    }

    /// Write event to WAL via the background group-commit writer. Returns once
    /// the event is fsynced.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send_wal(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply in one call, under the caller's calendar locks.
    async fn persist_and_apply(
        &self,
        locks: &mut CalendarLocks,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let (source, target) = locks.split();
        apply_to_calendars(&self.store, event, source, target)
    }

    /// Lock the calendar an appointment is filed under and, when `move_to`
    /// names a different doctor, that doctor's calendar too. Two locks are
    /// taken in id order so opposing moves cannot deadlock.
    async fn lock_appointment(
        &self,
        id: &Ulid,
        move_to: Option<Ulid>,
    ) -> Result<CalendarLocks, EngineError> {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let source_id = self.store.doctor_of(id).ok_or(EngineError::NotFound(*id))?;
            let source = self.store.calendar(source_id);
            let locks = match move_to.filter(|t| *t != source_id) {
                None => CalendarLocks {
                    source: source.write_owned().await,
                    target: None,
                },
                Some(target_id) => {
                    let target = self.store.calendar(target_id);
                    if source_id < target_id {
                        let source = source.write_owned().await;
                        let target = target.write_owned().await;
                        CalendarLocks { source, target: Some(target) }
                    } else {
                        let target = target.write_owned().await;
                        let source = source.write_owned().await;
                        CalendarLocks { source, target: Some(target) }
                    }
                }
            };
            if locks.source().contains(id) {
                return Ok(locks);
            }
            // Moved to another doctor while we waited; resolve again.
        }
        Err(EngineError::NotFound(*id))
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events: Vec<Event> = Vec::new();
        events.extend(
            self.registry
                .patients()
                .into_iter()
                .map(|patient| Event::PatientRegistered { patient }),
        );
        events.extend(
            self.registry
                .doctors()
                .into_iter()
                .map(|doctor| Event::DoctorRegistered { doctor }),
        );
        for cal in self.store.calendars() {
            let guard = cal.read().await;
            events.extend(
                guard
                    .appointments
                    .iter()
                    .cloned()
                    .map(|appointment| Event::AppointmentBooked { appointment }),
            );
        }

        let (tx, rx) = oneshot::channel();
        self.send_wal(WalCommand::Compact { events, response: tx })
            .await?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .send_wal(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Flush the WAL and stop its writer. Mutations after this fail with
    /// `WalError`; reads keep working on the in-memory state.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let (tx, rx) = oneshot::channel();
        self.send_wal(WalCommand::Shutdown { response: tx }).await?;
        let flushed = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?;
        let handle = self.writer.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        flushed.map_err(|e| EngineError::WalError(e.to_string()))
    }
}
