//! Post-batch system shutdown with an observable, cancellable countdown.

use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use crate::error::AppError;

/// OS-level shutdown primitive.
pub trait ShutdownPlatform: Send + Sync {
    fn schedule(&self, delay_secs: u64) -> Result<(), AppError>;
    fn cancel(&self) -> Result<(), AppError>;
}

/// Calls the platform `shutdown` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShutdown;

/// `shutdown -h +M` takes whole minutes.
pub fn delay_minutes(delay_secs: u64) -> u64 {
    delay_secs.div_ceil(60)
}

fn run_command(program: &str, args: &[String], what: &str) -> Result<(), AppError> {
    log::info!(
        target: "compresso::shutdown",
        "Running {} {}",
        program,
        args.join(" ")
    );
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| AppError::Shutdown(format!("Failed to execute {}: {}", program, e)))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(AppError::Shutdown(format!(
            "Failed to {}: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl ShutdownPlatform for SystemShutdown {
    fn schedule(&self, delay_secs: u64) -> Result<(), AppError> {
        #[cfg(target_os = "windows")]
        {
            run_command(
                "shutdown",
                &["/s".into(), "/t".into(), delay_secs.to_string()],
                "schedule shutdown",
            )
        }

        #[cfg(any(target_os = "macos", target_os = "linux"))]
        {
            run_command(
                "shutdown",
                &["-h".into(), format!("+{}", delay_minutes(delay_secs))],
                "schedule shutdown",
            )
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            let _ = delay_secs;
            Err(AppError::Shutdown(
                "Shutdown not supported on this platform".to_string(),
            ))
        }
    }

    fn cancel(&self) -> Result<(), AppError> {
        #[cfg(target_os = "windows")]
        {
            run_command("shutdown", &["/a".into()], "cancel shutdown")
        }

        #[cfg(target_os = "macos")]
        {
            // `killall` fails when nothing is scheduled; that is fine.
            let _ = run_command("killall", &["shutdown".into()], "cancel shutdown");
            Ok(())
        }

        #[cfg(target_os = "linux")]
        {
            run_command("shutdown", &["-c".into()], "cancel shutdown")
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            Err(AppError::Shutdown(
                "Shutdown not supported on this platform".to_string(),
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ShutdownState {
    Idle,
    #[serde(rename_all = "camelCase")]
    Pending {
        seconds_remaining: u64,
    },
    /// Countdown reached zero; the platform owns the shutdown now.
    Fired,
}

impl ShutdownState {
    pub fn is_pending(self) -> bool {
        matches!(self, ShutdownState::Pending { .. })
    }

    pub fn seconds_remaining(self) -> Option<u64> {
        match self {
            ShutdownState::Pending { seconds_remaining } => Some(seconds_remaining),
            _ => None,
        }
    }
}

struct Countdown {
    tx: watch::Sender<ShutdownState>,
    generation: AtomicU64,
}

pub struct ShutdownScheduler {
    platform: Arc<dyn ShutdownPlatform>,
    countdown: Arc<Countdown>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes arm/disarm while they wait on the platform.
    op_lock: tokio::sync::Mutex<()>,
}

impl ShutdownScheduler {
    pub fn new(platform: Arc<dyn ShutdownPlatform>) -> Self {
        let (tx, _rx) = watch::channel(ShutdownState::Idle);
        Self {
            platform,
            countdown: Arc::new(Countdown {
                tx,
                generation: AtomicU64::new(0),
            }),
            task: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.countdown.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.countdown.tx.subscribe()
    }

    /// Ask the platform to shut down after `delay_secs`, then count down to
    /// zero in 1 s steps. A platform failure leaves the state untouched.
    pub async fn arm(&self, delay_secs: u64) -> Result<(), AppError> {
        if delay_secs == 0 {
            return Err(AppError::invalid_config("Shutdown delay must be positive"));
        }
        let _op = self.op_lock.lock().await;

        let platform = Arc::clone(&self.platform);
        tokio::task::spawn_blocking(move || platform.schedule(delay_secs))
            .await
            .map_err(|e| AppError::Shutdown(e.to_string()))??;

        let generation = self.countdown.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(old) = self.task.lock().take() {
            old.abort();
        }
        self.countdown.tx.send_replace(ShutdownState::Pending {
            seconds_remaining: delay_secs,
        });
        log::info!(
            target: "compresso::shutdown",
            "Shutdown armed in {}s",
            delay_secs
        );

        let countdown = Arc::clone(&self.countdown);
        let handle = tokio::spawn(run_countdown(countdown, generation, delay_secs));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Cancel a pending shutdown. Safe to call when nothing is armed; the
    /// platform is only contacted when something was.
    pub async fn disarm(&self) -> Result<(), AppError> {
        let _op = self.op_lock.lock().await;
        if self.state() == ShutdownState::Idle {
            return Ok(());
        }

        let platform = Arc::clone(&self.platform);
        tokio::task::spawn_blocking(move || platform.cancel())
            .await
            .map_err(|e| AppError::Shutdown(e.to_string()))??;

        self.countdown.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.countdown.tx.send_replace(ShutdownState::Idle);
        log::info!(target: "compresso::shutdown", "Shutdown disarmed");
        Ok(())
    }
}

impl Drop for ShutdownScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run_countdown(countdown: Arc<Countdown>, generation: u64, delay_secs: u64) {
    let step = Duration::from_secs(1);
    let mut ticker = interval_at(Instant::now() + step, step);
    let mut remaining = delay_secs;
    while remaining > 0 {
        ticker.tick().await;
        remaining -= 1;
        let next = if remaining == 0 {
            ShutdownState::Fired
        } else {
            ShutdownState::Pending {
                seconds_remaining: remaining,
            }
        };
        // The generation check runs under the channel's write lock, so a
        // disarm that already published Idle can never be overwritten.
        let current = countdown.tx.send_if_modified(|state| {
            if countdown.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *state = next;
            true
        });
        if !current && countdown.generation.load(Ordering::SeqCst) != generation {
            return;
        }
    }
    log::info!(target: "compresso::shutdown", "Shutdown countdown reached zero");
}
