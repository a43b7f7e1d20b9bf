// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Input channel resources.
//!
//! A [`ChannelResource`] binds a locator to a transport-specific
//! [`MessageSource`] and runs one receive thread delivering every message
//! to the registered [`TransportReceiver`].
//!
//! # Shutdown order
//!
//! 1. `disable()` - stop delivery; waits for an in-flight callback
//! 2. `release()` - release the source and join the receive thread
//! 3. `clear()`   - drop the receiver
//! 4. drop
//!
//! Each step is idempotent. Steps called from inside the receiver callback
//! (on the receive thread) never wait on that thread.
//!
//! Transports keep their open channels in a [`ChannelRegistry`].

use super::{Result, TransportReceiver};
use crate::config::RECEIVE_POLL_INTERVAL;
use crate::locator::Locator;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Transport-side producer of inbound messages.
pub trait MessageSource: Send + Sync + 'static {
    /// Wait up to `timeout` for one message, written to `buf`.
    ///
    /// Returns the sender's locator, or `None` if nothing arrived.
    ///
    /// # Errors
    ///
    /// Transport failures; the receive loop logs them and keeps polling
    /// while the channel is active.
    fn receive(&self, buf: &mut Vec<u8>, timeout: Duration) -> Result<Option<Locator>>;

    /// Release transport resources and unblock pending `receive` calls.
    fn release(&self);
}

/// Input channel lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Delivering messages
    Active = 0,
    /// No further deliveries
    Disabled = 1,
    /// Source released
    Released = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Disabled,
            _ => Self::Released,
        }
    }
}

struct ChannelShared {
    locator: Locator,
    state: AtomicU8,
    /// Held for reading across each callback
    receiver: RwLock<Option<Arc<dyn TransportReceiver>>>,
}

impl ChannelShared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Open input endpoint bound to a locator.
pub struct ChannelResource {
    shared: Arc<ChannelShared>,
    source: Arc<dyn MessageSource>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    max_message_size: u32,
}

impl std::fmt::Debug for ChannelResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelResource")
            .field("locator", &self.shared.locator)
            .field("state", &self.state())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl ChannelResource {
    /// Start receiving from `source` on `locator`.
    ///
    /// # Errors
    ///
    /// `Io` if the receive thread cannot be spawned (the source is released).
    pub fn new(
        locator: Locator,
        max_message_size: u32,
        source: Arc<dyn MessageSource>,
        receiver: Arc<dyn TransportReceiver>,
    ) -> Result<Self> {
        let shared = Arc::new(ChannelShared {
            locator,
            state: AtomicU8::new(ChannelState::Active as u8),
            receiver: RwLock::new(Some(receiver)),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_source = Arc::clone(&source);
        let spawned = thread::Builder::new()
            .name(format!("hdds-rx-{}", locator.physical_port()))
            .spawn(move || receive_loop(&thread_shared, &*thread_source, max_message_size));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                source.release();
                return Err(e.into());
            }
        };
        let worker_id = handle.thread().id();

        log::debug!("[CHANNEL] opened {} (max {} bytes)", locator, max_message_size);
        Ok(Self {
            shared,
            source,
            worker: Mutex::new(Some(handle)),
            worker_id,
            max_message_size,
        })
    }

    /// Locator this channel listens on.
    #[must_use]
    pub fn locator(&self) -> &Locator {
        &self.shared.locator
    }

    /// Largest message accepted.
    #[must_use]
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// True while delivering.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Stop delivery. When called from another thread, returns only after
    /// an in-flight callback finished.
    pub fn disable(&self) {
        let _ = self.shared.state.compare_exchange(
            ChannelState::Active as u8,
            ChannelState::Disabled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if !self.on_worker_thread() {
            // Barrier: the receive thread holds the read lock while delivering
            drop(self.shared.receiver.write());
        }
    }

    /// Release the source and join the receive thread.
    pub fn release(&self) {
        self.disable();
        let previous = self
            .shared
            .state
            .swap(ChannelState::Released as u8, Ordering::AcqRel);
        if previous == ChannelState::Released as u8 {
            return;
        }
        self.source.release();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if self.on_worker_thread() {
                // Closing from our own callback: the loop exits on return
                return;
            }
            if handle.join().is_err() {
                log::warn!("[CHANNEL] receive thread of {} panicked", self.shared.locator);
            }
        }
    }

    /// Drop the receiver. On the receive thread this happens when the loop
    /// exits.
    pub fn clear(&self) {
        if !self.on_worker_thread() {
            self.shared.receiver.write().take();
        }
    }
}

impl Drop for ChannelResource {
    fn drop(&mut self) {
        self.release();
        self.clear();
        log::debug!("[CHANNEL] closed {}", self.shared.locator);
    }
}

/// Open input channels of one transport.
///
/// The lock is reentrant so a transport can query the registry while
/// opening a channel. Channels are shut down outside the lock, which lets a
/// receiver callback close its own channel.
pub struct ChannelRegistry {
    channels: ReentrantMutex<RefCell<Vec<ChannelResource>>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.len())
            .finish()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: ReentrantMutex::new(RefCell::new(Vec::new())),
        }
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.lock().borrow().len()
    }

    /// True when no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if an active channel listens on `locator`.
    #[must_use]
    pub fn is_open(&self, locator: &Locator) -> bool {
        let guard = self.channels.lock();
        let channels = guard.borrow();
        channels
            .iter()
            .any(|c| c.locator() == locator && c.is_active())
    }

    /// Register the channel built by `create` unless `locator` is already
    /// open. `create` runs under the registry lock.
    ///
    /// # Errors
    ///
    /// Whatever `create` returns; nothing is registered then.
    pub fn open_with(
        &self,
        locator: &Locator,
        create: impl FnOnce() -> Result<ChannelResource>,
    ) -> Result<()> {
        let guard = self.channels.lock();
        if self.is_open(locator) {
            return Ok(());
        }
        let channel = create()?;
        guard.borrow_mut().push(channel);
        Ok(())
    }

    /// Unregister and shut down every channel on `locator`.
    ///
    /// Returns false if none was registered.
    pub fn close(&self, locator: &Locator) -> bool {
        let removed: Vec<ChannelResource> = {
            let guard = self.channels.lock();
            let mut channels = guard.borrow_mut();
            let (removed, kept) = channels.drain(..).partition(|c| c.locator() == locator);
            *channels = kept;
            removed
        };
        if removed.is_empty() {
            return false;
        }
        destroy(removed);
        true
    }

    /// Unregister and shut down every channel.
    pub fn shutdown(&self) {
        let channels: Vec<ChannelResource> = {
            let guard = self.channels.lock();
            let drained = guard.borrow_mut().drain(..).collect();
            drained
        };
        destroy(channels);
    }
}

fn destroy(channels: Vec<ChannelResource>) {
    for channel in channels {
        channel.disable();
        channel.release();
        channel.clear();
    }
}

fn receive_loop(shared: &ChannelShared, source: &dyn MessageSource, max_message_size: u32) {
    let mut buf = Vec::with_capacity(max_message_size as usize);
    while shared.state() == ChannelState::Active {
        match source.receive(&mut buf, RECEIVE_POLL_INTERVAL) {
            Ok(Some(remote)) => {
                let receiver = shared.receiver.read();
                if shared.state() != ChannelState::Active {
                    break;
                }
                if let Some(receiver) = receiver.as_ref() {
                    receiver.on_data_received(&buf, &shared.locator, &remote);
                }
            }
            Ok(None) => {}
            Err(e) => {
                if shared.state() != ChannelState::Active {
                    break;
                }
                log::debug!("[CHANNEL] receive on {} failed: {}", shared.locator, e);
                thread::sleep(RECEIVE_POLL_INTERVAL);
            }
        }
    }
    shared.receiver.write().take();
}
