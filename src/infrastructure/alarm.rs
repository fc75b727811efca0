//! Find-my-phone alarm.
//!
//! Plays the alert sound a bounded number of times with vibration pulses
//! while it sounds. The audio session is held for the whole run and released
//! as soon as the alarm stops, finishes or is dropped.

use crate::domain::commands::AlarmController;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

pub const MAX_PLAYS: u32 = 5;
/// Silence after each play on top of the sound's own length.
pub const PLAY_GAP: Duration = Duration::from_millis(200);
pub const VIBRATION_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("audio session unavailable: {0}")]
    Session(String),
    #[error("alert sound failed to play: {0}")]
    Playback(String),
}

/// Active claim on the audio output. Released once, on drop.
pub struct AudioSession {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AudioSession {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Host sound and haptics.
pub trait AlertOutput: Send + Sync + 'static {
    fn activate(&self) -> Result<AudioSession, AlarmError>;
    fn play(&self) -> Result<(), AlarmError>;
    fn vibrate(&self);
    fn sound_duration(&self) -> Duration;
}

pub struct FindPhoneAlarm {
    output: Arc<dyn AlertOutput>,
    running: Mutex<Option<JoinHandle<()>>>,
}

impl FindPhoneAlarm {
    pub fn new(output: Arc<dyn AlertOutput>) -> Self {
        Self {
            output,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot().as_ref().is_some_and(|task| !task.is_finished())
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn sound(output: Arc<dyn AlertOutput>) {
    let _session = match output.activate() {
        Ok(session) => session,
        Err(e) => {
            warn!("Cannot sound the alarm: {}", e);
            return;
        }
    };
    let duration = output.sound_duration();

    for play in 1..=MAX_PLAYS {
        let started = Instant::now();
        if let Err(e) = output.play() {
            warn!("Alarm play {} failed: {}", play, e);
            break;
        }
        debug!("Alarm play {}/{}", play, MAX_PLAYS);

        let sound_end = started + duration;
        while Instant::now() < sound_end {
            output.vibrate();
            sleep(VIBRATION_INTERVAL).await;
        }
        sleep_until(sound_end + PLAY_GAP).await;
    }
    info!("Alarm finished");
}

impl AlarmController for FindPhoneAlarm {
    fn start(&self) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Alarm already sounding");
            return;
        }
        info!("Sounding find-phone alarm");
        *slot = Some(tokio::spawn(sound(self.output.clone())));
    }

    fn stop(&self) {
        if let Some(task) = self.slot().take() {
            if !task.is_finished() {
                info!("Alarm stopped");
            }
            // Dropping the future releases the audio session
            task.abort();
        }
    }
}

impl Drop for FindPhoneAlarm {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Terminal bell standing in for a speaker.
pub struct TerminalBell {
    duration: Duration,
}

impl TerminalBell {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Default for TerminalBell {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl AlertOutput for TerminalBell {
    fn activate(&self) -> Result<AudioSession, AlarmError> {
        debug!("Audio session active");
        Ok(AudioSession::new(|| debug!("Audio session released")))
    }

    fn play(&self) -> Result<(), AlarmError> {
        let mut err = std::io::stderr();
        err.write_all(b"\x07")
            .and_then(|_| err.flush())
            .map_err(|e| AlarmError::Playback(e.to_string()))?;
        info!("Find my phone!");
        Ok(())
    }

    fn vibrate(&self) {
        debug!("Bzzt");
    }

    fn sound_duration(&self) -> Duration {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeOutput {
        sessions: AtomicUsize,
        released: Arc<AtomicUsize>,
        plays: AtomicUsize,
        vibrations: AtomicUsize,
    }

    impl AlertOutput for FakeOutput {
        fn activate(&self) -> Result<AudioSession, AlarmError> {
            self.sessions.fetch_add(1, Ordering::SeqCst);
            let released = self.released.clone();
            Ok(AudioSession::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            }))
        }
        fn play(&self) -> Result<(), AlarmError> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn vibrate(&self) {
            self.vibrations.fetch_add(1, Ordering::SeqCst);
        }
        fn sound_duration(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    fn alarm() -> (FindPhoneAlarm, Arc<FakeOutput>) {
        let output = Arc::new(FakeOutput::default());
        (FindPhoneAlarm::new(output.clone()), output)
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_are_bounded_and_spaced() {
        let (alarm, output) = alarm();
        alarm.start();

        // One play per 1.2 s
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(output.plays.load(Ordering::SeqCst), 1);
        assert_eq!(output.vibrations.load(Ordering::SeqCst), 4);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(output.plays.load(Ordering::SeqCst), 2);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(output.plays.load(Ordering::SeqCst), MAX_PLAYS as usize);
        assert_eq!(output.released.load(Ordering::SeqCst), 1);
        assert!(!alarm.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (alarm, output) = alarm();
        alarm.start();
        alarm.start();
        sleep(Duration::from_millis(10)).await;
        alarm.start();
        assert_eq!(output.sessions.load(Ordering::SeqCst), 1);
        assert_eq!(output.plays.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_session() {
        let (alarm, output) = alarm();
        alarm.start();
        sleep(Duration::from_millis(500)).await;
        alarm.stop();
        alarm.stop();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(output.released.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(output.plays.load(Ordering::SeqCst), 1);

        // Can be sounded again after a stop
        alarm.start();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(output.sessions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_alarm() {
        let (alarm, output) = alarm();
        alarm.start();
        sleep(Duration::from_millis(10)).await;
        drop(alarm);
        sleep(Duration::from_millis(1)).await;
        assert_eq!(output.released.load(Ordering::SeqCst), 1);
    }
}
