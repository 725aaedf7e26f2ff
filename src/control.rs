//! The control engine: the ep0 event loop and bulk-thread supervision.
//!
//! One task polls the control endpoint for function-level events. On
//! *enable* it opens the three data endpoints and launches the bulk
//! engine; on *disable* it cancels the engine and tears the endpoints
//! down. Class-specific setup requests are answered here, including the
//! device reset that pauses and resumes the bulk engine through the
//! reset gate.
//!
//! The two tasks share no mutable data: the object store is handed to
//! the bulk thread on enable and travels back when it stops, and the
//! gate is the only cross-thread synchronization object.

use std::fs::File;
use std::io::{self, Read as _, Write as _};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::engine::Engine;
use crate::ffs::{self, Event, EventType, SetupRequest};
use crate::gate::ResetGate;
use crate::proto::resp;
use crate::store::ObjectStore;

// Still-image class-specific requests.
const REQ_CANCEL: u8 = 0x64;
const REQ_GET_EXTENDED_EVENT_DATA: u8 = 0x65;
const REQ_DEVICE_RESET: u8 = 0x66;
const REQ_GET_DEVICE_STATUS: u8 = 0x67;

const USB_DIR_IN: u8 = 0x80;

/// Errors that end the control loop.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control endpoint error: {0}")]
    Io(#[from] io::Error),
}

/// The running bulk engine plus what is needed to stop or reset it.
struct BulkWorker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    tid: Arc<Mutex<Option<libc::pthread_t>>>,
    bulk_in: File,
    bulk_out: File,
    interrupt: File,
}

/// Owns ep0 and supervises the bulk engine.
pub struct ControlLoop {
    ep0: File,
    gate: Arc<ResetGate>,
    store_slot: Arc<Mutex<Option<ObjectStore>>>,
    worker: Option<BulkWorker>,
}

impl ControlLoop {
    pub fn new(ep0: File, store: ObjectStore, gate: Arc<ResetGate>) -> Self {
        Self {
            ep0,
            gate,
            store_slot: Arc::new(Mutex::new(Some(store))),
            worker: None,
        }
    }

    /// Poll ep0 and process events until the endpoint dies.
    ///
    /// # Errors
    ///
    /// Returns the control-endpoint error that ended the loop; the bulk
    /// engine is stopped first.
    pub fn run(&mut self) -> Result<(), ControlError> {
        loop {
            self.wait_readable()?;
            match self.read_events() {
                Ok(events) => {
                    for event in events {
                        self.handle_event(event);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_secs(1));
                }
                Err(err) => {
                    log::error!("control endpoint read failed: {err}");
                    self.stop_io();
                    return Err(err.into());
                }
            }
        }
    }

    fn wait_readable(&self) -> io::Result<()> {
        let mut fds = [libc::pollfd {
            fd: self.ep0.as_raw_fd(),
            events: libc::POLLIN | libc::POLLHUP,
            revents: 0,
        }];
        loop {
            if unsafe { libc::poll(fds.as_mut_ptr(), 1, -1) } < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(());
        }
    }

    fn read_events(&mut self) -> io::Result<Vec<Event>> {
        let mut buf = [0u8; ffs::EVENT_SIZE * ffs::EVENT_BATCH];
        let n = self.ep0.read(&mut buf)?;
        Ok(ffs::parse_events(&buf[..n]))
    }

    fn handle_event(&mut self, event: Event) {
        log::debug!("event {:?}", event.kind);
        match event.kind {
            EventType::Enable => self.start_io(),
            EventType::Disable => self.stop_io(),
            EventType::Setup => self.handle_setup(event.setup),
            EventType::Bind | EventType::Unbind | EventType::Suspend | EventType::Resume => {}
        }
    }

    /// Open the data endpoints and launch the bulk engine.
    fn start_io(&mut self) {
        if self.worker.is_some() {
            return;
        }
        log::info!("enable: starting bulk engine");

        let endpoints = (|| -> io::Result<(File, File, File)> {
            Ok((
                ffs::open_endpoint(ffs::EP_BULK_IN)?,
                ffs::open_endpoint(ffs::EP_BULK_OUT)?,
                ffs::open_endpoint(ffs::EP_INTERRUPT)?,
            ))
        })();
        let (bulk_in, bulk_out, interrupt) = match endpoints {
            Ok(files) => files,
            Err(err) => {
                log::error!("cannot open bulk endpoints: {err}");
                return;
            }
        };
        let (engine_in, engine_out) = match (bulk_in.try_clone(), bulk_out.try_clone()) {
            (Ok(w), Ok(r)) => (w, r),
            (Err(err), _) | (_, Err(err)) => {
                log::error!("cannot clone endpoint handles: {err}");
                return;
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let tid = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&self.store_slot);
        let gate = Arc::clone(&self.gate);
        let thread_stop = Arc::clone(&stop);
        let thread_tid = Arc::clone(&tid);

        let spawned = thread::Builder::new()
            .name("ptp-bulk".into())
            .spawn(move || {
                *lock(&thread_tid) = Some(unsafe { libc::pthread_self() });
                let Some(store) = lock(&slot).take() else {
                    log::error!("object store unavailable, bulk engine not started");
                    return;
                };
                let engine = Engine::new(engine_out, engine_in, store, gate, thread_stop);
                let (store, result) = engine.run();
                match result {
                    Ok(()) => log::info!("bulk engine finished"),
                    Err(err) => log::warn!("bulk engine exited: {err}"),
                }
                *lock(&slot) = Some(store);
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(BulkWorker {
                    handle,
                    stop,
                    tid,
                    bulk_in,
                    bulk_out,
                    interrupt,
                });
            }
            Err(err) => log::error!("cannot spawn bulk thread: {err}"),
        }
    }

    /// Cancel the bulk engine, wait for it, and tear the endpoints
    /// down. Cancellation is cooperative at the granularity of one
    /// endpoint I/O: the wakeup signal interrupts a blocked read or
    /// write and the engine checks the stop flag before retrying.
    fn stop_io(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        log::info!("disable: stopping bulk engine");

        worker.stop.store(true, Ordering::Release);
        // Release a worker that is parked on the gate mid-reset.
        self.gate.post();
        while !worker.handle.is_finished() {
            if let Some(tid) = *lock(&worker.tid) {
                unsafe { libc::pthread_kill(tid, libc::SIGINT) };
            }
            thread::sleep(Duration::from_millis(10));
        }
        if worker.handle.join().is_err() {
            log::error!("bulk thread panicked");
        }

        ffs::cleanup_endpoint(&worker.bulk_out, "bulk-out");
        ffs::cleanup_endpoint(&worker.bulk_in, "bulk-in");
        ffs::cleanup_endpoint(&worker.interrupt, "interrupt");
    }

    /// The device-reset sequence: re-arm the gate, interrupt whatever
    /// endpoint I/O the bulk engine has in flight, clear the bulk
    /// endpoint halts, then post the gate exactly once so the engine
    /// resumes.
    fn reset_interface(&mut self) {
        let Some(worker) = self.worker.as_ref() else {
            // Not configured yet; nothing to pause.
            return;
        };
        log::info!("device reset requested");

        self.gate.rearm();
        if let Some(tid) = *lock(&worker.tid) {
            unsafe { libc::pthread_kill(tid, libc::SIGINT) };
        }
        if let Err(err) = ffs::clear_halt(&worker.bulk_in) {
            log::warn!("clear halt on bulk-in: {err}");
        }
        if let Err(err) = ffs::clear_halt(&worker.bulk_out) {
            log::warn!("clear halt on bulk-out: {err}");
        }
        self.gate.post();
    }

    fn handle_setup(&mut self, setup: SetupRequest) {
        log::debug!(
            "SETUP {:02x}.{:02x} v{:04x} i{:04x} len {}",
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );

        match setup.request {
            // Acknowledged silently.
            REQ_CANCEL => {}
            // Optional; may stall.
            REQ_GET_EXTENDED_EVENT_DATA => self.stall(&setup),
            REQ_DEVICE_RESET => {
                if setup.request_type != 0x21 || setup.value != 0 || setup.index != 0 {
                    self.stall(&setup);
                    return;
                }
                self.reset_interface();
                // Status stage: a zero-length read acks, a write would
                // stall.
                if let Err(err) = self.ep0.read(&mut []) {
                    log::warn!("ack device reset: {err}");
                }
            }
            REQ_GET_DEVICE_STATUS => {
                if setup.request_type != 0xa1 || setup.value != 0 || setup.index != 0 {
                    self.stall(&setup);
                    return;
                }
                let mut status = [0u8; 4];
                status[0..2].copy_from_slice(&4u16.to_le_bytes());
                status[2..4].copy_from_slice(&resp::OK.to_le_bytes());
                if let Err(err) = self.ep0.write_all(&status) {
                    log::warn!("device status reply: {err}");
                }
            }
            other => {
                log::debug!("stalling unhandled request 0x{other:02x}");
                self.stall(&setup);
            }
        }
    }

    /// Halt ep0 by transferring zero bytes in the direction opposite
    /// to the one the setup request asks for.
    fn stall(&mut self, setup: &SetupRequest) {
        let result = if setup.request_type & USB_DIR_IN != 0 {
            self.ep0.read(&mut []).map(|_| ())
        } else {
            self.ep0.write(&[]).map(|_| ())
        };
        if result.is_ok() {
            log::warn!(
                "cannot stall ep0 for {:02x}.{:02x}",
                setup.request_type,
                setup.request
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Install a no-op SIGINT handler, without `SA_RESTART`, so a blocked
/// endpoint read or write returns `EINTR` instead of killing the
/// process. The signal doubles as the bulk-thread wakeup for resets
/// and disable.
///
/// # Errors
///
/// Propagates the `sigaction` failure; that is fatal at startup.
pub fn install_wakeup_handler() -> io::Result<()> {
    extern "C" fn nothing(_sig: libc::c_int) {}

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = nothing;
        sa.sa_sigaction = handler as usize;
        libc::sigfillset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        if libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
