// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Completion dispatch thread.
//!
//! A [`PollLoop`] owns a thread that blocks until the device reports completed buffers or pending
//! events, dequeues everything that is immediately available, and hands each item to a
//! [`CompletionListener`] inline. The listener is called on the poll thread and must not block.
//!
//! The loop can be paused, in which case it stops dequeuing but keeps its thread alive until it
//! is resumed or stopped.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;

use crate::device::CodecDevice;
use crate::device::DequeuedBuffer;
use crate::device::DeviceEvent;
use crate::error::Error;
use crate::error::Result;
use crate::format::Port;

/// Receiver of the device completions, called from the poll thread.
pub trait CompletionListener: Send + Sync + 'static {
    /// A buffer has been returned by the device. An error marks the session as failed.
    fn on_buffer_done(&self, buffer: DequeuedBuffer) -> Result<()>;
    fn on_event(&self, event: DeviceEvent);
    /// The device or the listener failed in a way the session cannot recover from.
    fn on_error(&self, error: &Error);
}

#[derive(Debug, Default)]
struct PollState {
    running: bool,
    paused: bool,
    stop: bool,
}

#[derive(Default)]
struct PollControl {
    state: Mutex<PollState>,
    cond: Condvar,
}

impl PollControl {
    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block while the loop is paused. Returns `false` once the loop must exit.
    fn wait_while_paused(&self) -> bool {
        let state = self.lock();
        let state = self
            .cond
            .wait_while(state, |s| s.paused && !s.stop)
            .unwrap_or_else(|e| e.into_inner());
        !state.stop
    }
}

/// Handle to a running poll thread. Dropping it stops and joins the thread.
pub struct PollLoop {
    control: Arc<PollControl>,
    handle: Option<JoinHandle<()>>,
}

impl PollLoop {
    /// Spawn the poll thread for `device`, dispatching to `listener`. Each readiness wait lasts at
    /// most `timeout`, which bounds how long `stop` can take.
    pub fn start<D: CodecDevice>(
        device: Arc<D>,
        listener: Arc<dyn CompletionListener>,
        timeout: Duration,
    ) -> Result<Self> {
        let control = Arc::new(PollControl::default());
        let thread_control = Arc::clone(&control);

        let handle = std::thread::Builder::new()
            .name("codec-poll".into())
            .spawn(move || run(&*device, &*listener, &thread_control, timeout))?;

        // Wait for the thread to be up so a session never queues work before it can complete.
        let state = control.lock();
        drop(
            control
                .cond
                .wait_while(state, |s| !s.running && !s.stop)
                .unwrap_or_else(|e| e.into_inner()),
        );

        Ok(Self {
            control,
            handle: Some(handle),
        })
    }

    /// Stop dequeuing completions until [`PollLoop::resume`] is called.
    pub fn pause(&self) {
        self.control.lock().paused = true;
        debug!("poll loop paused");
    }

    pub fn resume(&self) {
        self.control.lock().paused = false;
        self.control.cond.notify_all();
        debug!("poll loop resumed");
    }

    pub fn is_running(&self) -> bool {
        self.control.lock().running
    }

    /// Signal the thread to exit and wait for it.
    pub fn stop(&mut self) {
        {
            let mut state = self.control.lock();
            state.stop = true;
            state.paused = false;
        }
        self.control.cond.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("poll thread panicked");
            }
        }
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    device: &dyn CodecDevice,
    listener: &dyn CompletionListener,
    control: &PollControl,
    timeout: Duration,
) {
    control.lock().running = true;
    control.cond.notify_all();

    while control.wait_while_paused() {
        let readiness = match device.wait(timeout) {
            Ok(readiness) => readiness,
            Err(e) => {
                error!("waiting for the device failed: {}", e);
                listener.on_error(&e);
                break;
            }
        };

        if let Err(e) = dispatch(device, listener, readiness) {
            error!("dequeuing from the device failed: {}", e);
            listener.on_error(&e);
            break;
        }
    }

    let mut state = control.lock();
    state.running = false;
    debug!("poll thread exiting");
}

fn dispatch(
    device: &dyn CodecDevice,
    listener: &dyn CompletionListener,
    readiness: crate::device::Readiness,
) -> Result<()> {
    if readiness.event {
        while let Some(event) = device.dequeue_event()? {
            debug!("event: {:?}", event);
            listener.on_event(event);
        }
    }

    for (ready, port) in [
        (readiness.output, Port::Output),
        (readiness.input, Port::Input),
    ] {
        if !ready {
            continue;
        }
        while let Some(buffer) = device.dequeue(port)? {
            if let Err(e) = listener.on_buffer_done(buffer) {
                warn!(
                    "completion of {} buffer {} failed: {}",
                    port, buffer.index, e
                );
                listener.on_error(&e);
            }
        }
    }

    Ok(())
}
