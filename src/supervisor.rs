//! Restart loop around a camera server

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::server::CameraServer;
use crate::Result;

/// Relaunches a crashed server after a fixed delay, with no crash-loop limit.
///
/// A run that returns `Ok` (a `shutdown` command) ends supervision.
#[derive(Clone)]
pub struct Supervisor {
    restart_delay: Duration,
    stop: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(restart_delay: Duration) -> Self {
        Self {
            restart_delay,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the loop not to restart again. Takes effect after the current run.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Call `run` until it succeeds or the supervisor is stopped.
    /// Returns how many restarts happened.
    pub fn run<F>(&self, mut run: F) -> usize
    where
        F: FnMut() -> Result<()>,
    {
        let mut restarts = 0;
        loop {
            match run() {
                Ok(()) => {
                    info!("Camera server stopped.");
                    return restarts;
                }
                Err(e) => {
                    error!("Camera server crashed: {}", e);
                    if self.is_stopped() {
                        warn!("Supervisor stopped, not restarting");
                        return restarts;
                    }
                    info!(
                        "Camera server will restart in {} ms.",
                        self.restart_delay.as_millis()
                    );
                    thread::sleep(self.restart_delay);
                    if self.is_stopped() {
                        return restarts;
                    }
                    restarts += 1;
                }
            }
        }
    }

    /// Build a fresh server for every attempt and launch it.
    pub fn run_server<B>(&self, mut build: B) -> usize
    where
        B: FnMut() -> Result<CameraServer>,
    {
        self.run(|| {
            let mut server = build()?;
            info!("Camera server launching on {}...", server.device_name());
            server.launch()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_restarts_until_success() {
        let supervisor = Supervisor::new(Duration::from_millis(5));
        let mut attempts = 0;
        let restarts = supervisor.run(|| {
            attempts += 1;
            if attempts < 4 {
                Err(Error::DeviceBusy("fake.0".into()))
            } else {
                Ok(())
            }
        });
        assert_eq!(restarts, 3);
        assert_eq!(attempts, 4);
    }

    #[test]
    fn test_stop_ends_crash_loop() {
        let supervisor = Supervisor::new(Duration::from_millis(5));
        let handle = supervisor.clone();
        let mut attempts = 0;
        let restarts = supervisor.run(|| {
            attempts += 1;
            if attempts == 3 {
                handle.stop();
            }
            Err(Error::DeviceUnavailable("fake.0".into()))
        });
        assert_eq!(attempts, 3);
        assert_eq!(restarts, 2);
    }
}
