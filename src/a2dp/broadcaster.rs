//! Single-queue delivery of profile broadcasts.
//!
//! Connection state broadcasts hold a wake lock from the moment they are
//! queued until the sink has finished delivering them.

use std::{
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use crossbeam::queue::SegQueue;
use log::warn;
use tokio::{sync::Notify, task::JoinHandle, time};

use crate::{
   event::{Broadcast, BroadcastSink},
   power::{WakeLock, WakeLockGuard},
};

struct Queued {
   broadcast: Broadcast,
   wake: Option<WakeLockGuard>,
}

struct Inner {
   queue: SegQueue<Queued>,
   notifier: Notify,
   wake_lock: Arc<dyn WakeLock>,
   /// Queued plus currently being delivered.
   pending: AtomicUsize,
   idle: Notify,
}

#[derive(Clone)]
pub struct ConnectionStateBroadcaster {
   inner: Arc<Inner>,
}

impl ConnectionStateBroadcaster {
   pub fn new(wake_lock: Arc<dyn WakeLock>) -> Self {
      Self {
         inner: Arc::new(Inner {
            queue: SegQueue::new(),
            notifier: Notify::new(),
            wake_lock,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
         }),
      }
   }

   pub fn send(&self, broadcast: Broadcast) {
      let wake = broadcast
         .needs_wake_lock()
         .then(|| WakeLockGuard::new(self.inner.wake_lock.clone()));
      self.inner.pending.fetch_add(1, Ordering::AcqRel);
      self.inner.queue.push(Queued { broadcast, wake });
      self.inner.notifier.notify_waiters();
   }

   pub fn pending(&self) -> usize {
      self.inner.pending.load(Ordering::Acquire)
   }

   /// Waits until everything sent so far has been delivered.
   pub async fn flush(&self) {
      loop {
         let idle = self.inner.idle.notified();
         if self.pending() == 0 {
            return;
         }
         idle.await;
      }
   }

   /// Starts the consumer. It exits once every broadcaster handle is gone
   /// and the queue is drained.
   pub fn spawn_dispatcher<S: BroadcastSink>(&self, sink: S) -> JoinHandle<()> {
      let inner = self.inner.clone();
      tokio::spawn(async move {
         while let Some(Queued { broadcast, wake }) = inner.recv().await {
            if let Err(e) = sink.deliver(broadcast).await {
               warn!("Error dispatching broadcast: {e}");
            }
            drop(wake);
            if inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
               inner.idle.notify_waiters();
            }
         }
      })
   }
}

impl Inner {
   async fn recv(self: &Arc<Self>) -> Option<Queued> {
      loop {
         if let Some(item) = self.queue.pop() {
            return Some(item);
         }
         let notify = self.notifier.notified();
         if let Some(item) = self.queue.pop() {
            return Some(item);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;
   use crate::{
      a2dp::{ConnectionState, PlayingState},
      bluetooth::address::Address,
      error::{A2dpError, Result},
      power::fake::CountingWakeLock,
   };

   const A: Address = Address::new([0xA; 6]);

   /// Records each broadcast with the number of wake lock holders seen at
   /// delivery time.
   #[derive(Clone)]
   struct RecordingSink {
      seen: Arc<Mutex<Vec<(Broadcast, usize)>>>,
      lock: Arc<CountingWakeLock>,
      fail_first: bool,
   }

   impl BroadcastSink for RecordingSink {
      async fn deliver(&self, broadcast: Broadcast) -> Result<()> {
         let mut seen = self.seen.lock();
         seen.push((broadcast, self.lock.held()));
         if self.fail_first && seen.len() == 1 {
            return Err(A2dpError::ProfileShutdown);
         }
         Ok(())
      }
   }

   fn setup(fail_first: bool) -> (ConnectionStateBroadcaster, RecordingSink, Arc<CountingWakeLock>) {
      let lock = Arc::new(CountingWakeLock::default());
      let broadcaster = ConnectionStateBroadcaster::new(lock.clone());
      let sink = RecordingSink {
         seen: Arc::default(),
         lock: lock.clone(),
         fail_first,
      };
      (broadcaster, sink, lock)
   }

   fn conn(previous: ConnectionState, state: ConnectionState) -> Broadcast {
      Broadcast::ConnectionStateChanged { device: A, previous, state }
   }

   #[tokio::test]
   async fn test_fifo_without_coalescing() {
      let (broadcaster, sink, _lock) = setup(false);
      let sent = [
         conn(ConnectionState::Disconnected, ConnectionState::Connecting),
         conn(ConnectionState::Disconnected, ConnectionState::Connecting),
         conn(ConnectionState::Connecting, ConnectionState::Connected),
      ];
      for b in &sent {
         broadcaster.send(b.clone());
      }
      broadcaster.spawn_dispatcher(sink.clone());
      broadcaster.flush().await;

      let seen: Vec<_> = sink.seen.lock().iter().map(|(b, _)| b.clone()).collect();
      assert_eq!(seen, sent);
   }

   #[tokio::test]
   async fn test_wake_lock_held_until_dispatched() {
      let (broadcaster, sink, lock) = setup(false);
      broadcaster.send(conn(ConnectionState::Disconnected, ConnectionState::Connecting));
      broadcaster.send(conn(ConnectionState::Connecting, ConnectionState::Connected));
      broadcaster.send(Broadcast::PlayingStateChanged {
         device: A,
         previous: PlayingState::Playing,
         state: PlayingState::NotPlaying,
      });
      assert_eq!(lock.held(), 2);
      assert_eq!(broadcaster.pending(), 3);

      broadcaster.spawn_dispatcher(sink.clone());
      broadcaster.flush().await;

      let holders: Vec<_> = sink.seen.lock().iter().map(|(_, held)| *held).collect();
      assert_eq!(holders, vec![2, 1, 0]);
      assert_eq!(lock.held(), 0);
      assert_eq!(lock.acquired(), 2);
   }

   #[tokio::test]
   async fn test_delivery_error_does_not_stop_dispatch() {
      let (broadcaster, sink, lock) = setup(true);
      broadcaster.spawn_dispatcher(sink.clone());
      broadcaster.send(conn(ConnectionState::Disconnected, ConnectionState::Connecting));
      broadcaster.send(conn(ConnectionState::Connecting, ConnectionState::Disconnected));
      broadcaster.flush().await;

      assert_eq!(sink.seen.lock().len(), 2);
      assert_eq!(lock.held(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_dispatcher_exits_with_last_handle() {
      let (broadcaster, sink, _lock) = setup(false);
      let handle = broadcaster.spawn_dispatcher(sink);
      broadcaster.flush().await;
      drop(broadcaster);
      handle.await.unwrap();
   }
}
