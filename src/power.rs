//! Sleep inhibition while broadcasts are in flight.
//!
//! systemd-logind's `Inhibit()` hands out a file descriptor; sleep is delayed
//! for as long as it stays open.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use zbus::{Connection, zvariant::OwnedFd};

use crate::error::{A2dpError, Result};

/// A reference-counted system wake lock.
pub trait WakeLock: Send + Sync {
   fn acquire(&self);

   fn release(&self);
}

/// Holds one reference on a [`WakeLock`] until dropped.
pub struct WakeLockGuard {
   lock: Arc<dyn WakeLock>,
}

impl WakeLockGuard {
   pub fn new(lock: Arc<dyn WakeLock>) -> Self {
      lock.acquire();
      Self { lock }
   }
}

impl Drop for WakeLockGuard {
   fn drop(&mut self) {
      self.lock.release();
   }
}

/// For systems without logind.
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
   fn acquire(&self) {}

   fn release(&self) {}
}

#[derive(Default)]
struct Inhibitor {
   holders: usize,
   generation: u64,
   fd: Option<OwnedFd>,
}

/// Wake lock backed by a logind `sleep` inhibitor in delay mode.
pub struct LogindWakeLock {
   connection: Connection,
   runtime: Handle,
   inner: Arc<Mutex<Inhibitor>>,
}

impl LogindWakeLock {
   pub fn new(connection: Connection, runtime: Handle) -> Self {
      Self {
         connection,
         runtime,
         inner: Arc::new(Mutex::new(Inhibitor::default())),
      }
   }

   async fn inhibit(connection: &Connection) -> Result<OwnedFd> {
      let reply = connection
         .call_method(
            Some("org.freedesktop.login1"),
            "/org/freedesktop/login1",
            Some("org.freedesktop.login1.Manager"),
            "Inhibit",
            &("sleep", "a2dpd", "Delivering A2DP connection state", "delay"),
         )
         .await
         .map_err(A2dpError::WakeLock)?;
      reply.body().deserialize().map_err(A2dpError::WakeLock)
   }
}

impl WakeLock for LogindWakeLock {
   fn acquire(&self) {
      let generation = {
         let mut inner = self.inner.lock();
         inner.holders += 1;
         if inner.holders > 1 {
            return;
         }
         inner.generation += 1;
         inner.generation
      };

      let connection = self.connection.clone();
      let inner = self.inner.clone();
      self.runtime.spawn(async move {
         match Self::inhibit(&connection).await {
            Ok(fd) => {
               let mut inner = inner.lock();
               // released again before logind answered
               if inner.holders > 0 && inner.generation == generation {
                  debug!("Sleep inhibitor taken");
                  inner.fd = Some(fd);
               }
            },
            Err(e) => warn!("{e}"),
         }
      });
   }

   fn release(&self) {
      let mut inner = self.inner.lock();
      inner.holders = inner.holders.saturating_sub(1);
      if inner.holders == 0 && inner.fd.take().is_some() {
         debug!("Sleep inhibitor released");
      }
   }
}
