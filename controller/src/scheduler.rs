//! Per-device power-off timers and cooldown watchers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{task::AbortHandle, time::Instant};
use tracing::{debug, info};

use tradfri_common::{
    shutdown::{epoch_ceil, next_shutdown_at},
    CooldownThresholds, DeviceSettings, SidebarInfo, StopPlan, Temperatures, TurnOffMode,
};

/// Callbacks used by fired timers and watchers.
#[async_trait]
pub trait ShutdownHandler: Send + Sync {
    async fn shutdown_device(&self, device: &DeviceSettings);

    async fn temperatures(&self) -> Temperatures;

    async fn schedule_changed(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Timer,
    Cooldown,
}

struct Entry {
    generation: u64,
    abort: AbortHandle,
}

/// Wall-clock epoch for display, runtime instant for sleeping.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    epoch: i64,
    instant: Instant,
}

// Far enough out that no print outlives it.
const MAX_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Default)]
struct SchedulerState {
    generation: u64,
    shutdown_at: HashMap<String, Deadline>,
    timers: HashMap<String, Entry>,
    cooldowns: HashMap<String, Entry>,
}

impl SchedulerState {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn slot(&mut self, slot: Slot) -> &mut HashMap<String, Entry> {
        match slot {
            Slot::Timer => &mut self.timers,
            Slot::Cooldown => &mut self.cooldowns,
        }
    }

    fn abort_pending(&mut self, device_id: &str) -> bool {
        let mut cancelled = false;
        for slot in [Slot::Timer, Slot::Cooldown] {
            if let Some(entry) = self.slot(slot).remove(device_id) {
                entry.abort.abort();
                cancelled = true;
            }
        }
        cancelled
    }
}

#[derive(Clone)]
pub struct ShutdownScheduler {
    state: Arc<Mutex<SchedulerState>>,
    poll_interval: Duration,
}

impl ShutdownScheduler {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            poll_interval,
        }
    }

    /// Replaces whatever is pending for the device with a new timer or watcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn plan_stop(
        &self,
        handler: Arc<dyn ShutdownHandler>,
        device: &DeviceSettings,
        force_postpone: bool,
    ) -> StopPlan {
        let plan = StopPlan::for_device(device, force_postpone);
        let mut state = self.lock();
        state.abort_pending(&device.id);
        if matches!(plan, StopPlan::Cooldown(_)) {
            state.shutdown_at.remove(&device.id);
        }

        match plan {
            StopPlan::Timer { delay_secs } => {
                self.start_timer(&mut state, handler, device.clone(), delay_secs)
            }
            StopPlan::Cooldown(thresholds) => {
                self.start_cooldown(&mut state, handler, device.clone(), thresholds)
            }
        }
        plan
    }

    /// Cancels timer and watcher and forgets the pending shutdown time.
    pub fn cancel(&self, device_id: &str) -> bool {
        let mut state = self.lock();
        let had_time = state.shutdown_at.remove(device_id).is_some();
        state.abort_pending(device_id) || had_time
    }

    pub fn cancel_all(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        for (_, entry) in state.timers.drain().chain(state.cooldowns.drain()) {
            entry.abort.abort();
        }
        state.shutdown_at.clear();
    }

    pub fn shutdown_at(&self, device_id: &str) -> Option<i64> {
        self.lock().shutdown_at.get(device_id).map(|deadline| deadline.epoch)
    }

    pub fn has_timer(&self, device_id: &str) -> bool {
        self.lock().timers.contains_key(device_id)
    }

    pub fn has_cooldown(&self, device_id: &str) -> bool {
        self.lock().cooldowns.contains_key(device_id)
    }

    pub fn sidebar_info(&self, devices: &[DeviceSettings]) -> SidebarInfo {
        let state = self.lock();
        let mut info = SidebarInfo::default();
        for device in devices {
            let at = state.shutdown_at.get(&device.id).map(|deadline| deadline.epoch);
            info.shutdown_at.insert(device.id.clone(), at);
            if device.turn_off_mode == TurnOffMode::Cooldown {
                let waiting = state.cooldowns.contains_key(&device.id).then_some(true);
                info.cooldown_wait.insert(device.id.clone(), waiting);
            }
        }
        info
    }

    fn start_timer(
        &self,
        state: &mut SchedulerState,
        handler: Arc<dyn ShutdownHandler>,
        device: DeviceSettings,
        delay_secs: u64,
    ) {
        let now = Instant::now();
        let pending = state
            .shutdown_at
            .get(&device.id)
            .copied()
            .filter(|deadline| deadline.instant > now);
        let delay = Duration::from_secs(delay_secs).min(MAX_DELAY);
        let deadline = Deadline {
            epoch: next_shutdown_at(
                pending.map(|deadline| deadline.epoch),
                epoch_ceil(Utc::now()),
                delay.as_secs(),
            ),
            instant: pending.map_or(now, |deadline| deadline.instant) + delay,
        };
        state.shutdown_at.insert(device.id.clone(), deadline);

        let stop_in = deadline.instant.saturating_duration_since(now);
        info!("schedule turn off of {} in {}s", device.name, stop_in.as_secs());

        let generation = state.next_generation();
        let device_id = device.id.clone();
        let scheduler = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline.instant).await;
            if scheduler.claim(Slot::Timer, &device.id, generation) {
                handler.shutdown_device(&device).await;
            }
        });

        state.timers.insert(
            device_id,
            Entry {
                generation,
                abort: task.abort_handle(),
            },
        );
    }

    fn start_cooldown(
        &self,
        state: &mut SchedulerState,
        handler: Arc<dyn ShutdownHandler>,
        device: DeviceSettings,
        thresholds: CooldownThresholds,
    ) {
        info!(
            "waiting for {} to cool down (bed {}, hotend {})",
            device.name, thresholds.bed, thresholds.hotend
        );

        let generation = state.next_generation();
        let device_id = device.id.clone();
        let scheduler = self.clone();
        let poll_interval = self.poll_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                let temperatures = handler.temperatures().await;
                if thresholds.satisfied_by(&temperatures) {
                    if scheduler.claim(Slot::Cooldown, &device.id, generation) {
                        handler.shutdown_device(&device).await;
                        handler.schedule_changed().await;
                    }
                    return;
                }
                debug!("{} still too hot: {temperatures:?}", device.name);
                handler.schedule_changed().await;
            }
        });

        state.cooldowns.insert(
            device_id,
            Entry {
                generation,
                abort: task.abort_handle(),
            },
        );
    }

    /// Removes the entry if it still belongs to the caller; only then may it fire.
    fn claim(&self, slot: Slot, device_id: &str, generation: u64) -> bool {
        let mut state = self.lock();
        let owned = state
            .slot(slot)
            .get(device_id)
            .is_some_and(|entry| entry.generation == generation);
        if owned {
            state.slot(slot).remove(device_id);
            if slot == Slot::Timer {
                state.shutdown_at.remove(device_id);
            }
        }
        owned
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
