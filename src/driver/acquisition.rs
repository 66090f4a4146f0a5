//! Background acquisition thread shared by the bundled drivers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::{Error, Result};

/// Paced loop running on its own thread until stopped.
pub struct Acquisition {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Acquisition {
    /// Run `tick(frame_index)` at most `fps` times per second.
    pub fn spawn<F>(name: String, fps: f64, mut tick: F) -> Result<Self>
    where
        F: FnMut(u64) + Send + 'static,
    {
        let interval = Duration::try_from_secs_f64(1.0 / fps)
            .map_err(|e| Error::driver(&name, format!("frame rate {} has no interval: {}", fps, e)))?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::Builder::new().name(name).spawn(move || {
            let mut frame_index = 0u64;
            while flag.load(Ordering::Acquire) {
                let started = Instant::now();
                tick(frame_index);
                frame_index += 1;
                if let Some(rest) = interval.checked_sub(started.elapsed()) {
                    thread::sleep(rest);
                }
            }
            debug!("Acquisition stopped after {} frames", frame_index);
        })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Signal the loop and wait for it. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Acquisition thread panicked");
            }
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop();
    }
}
