//! The bulk engine: the worker that speaks PTP over the bulk endpoint
//! pair.
//!
//! One iteration of the loop reads a complete command container off
//! bulk-out, dispatches it to the matching operation handler, and
//! writes the handler's data container(s) followed by exactly one
//! response container on bulk-in. Containers are processed strictly in
//! arrival order; a data phase always completes before the next command
//! is accepted.
//!
//! The engine is generic over the endpoint streams so the protocol can
//! be exercised without USB hardware. Endpoint reads and writes that
//! fail with an interrupt park on the reset gate until the control
//! thread finishes the reset, then retry; a completed reset observed
//! between transactions closes the session.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::gate::ResetGate;
use crate::proto::{
    self, container, format, op, resp, ContainerHeader, ObjectInfo, CONTAINER_HEADER_LEN,
    DCIM_HANDLE, MODEL_DIR, MODEL_DIR_HANDLE, PARAM_ANY, PARAM_UNUSED, STORE_ID,
};
use crate::store::{DeleteStatus, ObjectStore, UploadError};

/// Receive/send buffer size; containers longer than this are streamed.
pub const IO_BUF_LEN: usize = 4096;
/// Chunk size for data-phase streaming.
pub const DATA_CHUNK_LEN: usize = 8192;

/// Errors that terminate the bulk engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed container or length mismatch; the endpoint state is
    /// poisoned and the host must re-enable or reset the interface.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Wire encoding failed mid-transaction.
    #[error("wire encoding failed: {0}")]
    Codec(#[from] proto::ProtoError),

    /// An endpoint read or write failed for good.
    #[error("bulk endpoint error: {0}")]
    Io(#[from] io::Error),

    /// The supervisor asked us to stop.
    #[error("bulk engine cancelled")]
    Cancelled,
}

/// A handler's verdict: the response code plus up to three parameters.
struct Reply {
    code: u16,
    params: Vec<u32>,
}

impl Reply {
    fn new(code: u16) -> Self {
        Self {
            code,
            params: Vec::new(),
        }
    }

    fn with_params(code: u16, params: Vec<u32>) -> Self {
        Self { code, params }
    }
}

/// Operations allowed without an open session.
fn requires_session(code: u16) -> bool {
    !matches!(
        code,
        op::GET_DEVICE_INFO | op::OPEN_SESSION | op::CLOSE_SESSION
    )
}

/// The bulk worker: owns the data endpoints and the object store while
/// the function is enabled.
pub struct Engine<R, W> {
    bulk_out: R,
    bulk_in: W,
    store: ObjectStore,
    gate: Arc<ResetGate>,
    stop: Arc<AtomicBool>,
    session: Option<u32>,
    seen_epoch: u64,
}

impl<R: Read, W: Write> Engine<R, W> {
    pub fn new(
        bulk_out: R,
        bulk_in: W,
        store: ObjectStore,
        gate: Arc<ResetGate>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let seen_epoch = gate.epoch();
        Self {
            bulk_out,
            bulk_in,
            store,
            gate,
            stop,
            session: None,
            seen_epoch,
        }
    }

    /// Serve requests until the host stops talking, the supervisor
    /// cancels us, or a protocol violation poisons the endpoint state.
    /// The store travels back to the caller either way.
    pub fn run(mut self) -> (ObjectStore, Result<(), EngineError>) {
        let result = self.serve();
        (self.store, result)
    }

    fn serve(&mut self) -> Result<(), EngineError> {
        loop {
            // A completed device reset abandons whatever was in flight
            // and returns the session to closed.
            let epoch = self.gate.epoch();
            if epoch != self.seen_epoch {
                self.seen_epoch = epoch;
                if self.session.take().is_some() {
                    log::info!("device reset: session closed");
                }
            }

            let Some((header, payload)) = self.read_container()? else {
                log::info!("bulk-out stream ended");
                return Ok(());
            };
            log::debug!(
                "BULK-OUT received {} bytes, type {}, code 0x{:04x}, id {}",
                header.length,
                header.kind,
                header.code,
                header.id
            );

            let reply = self.dispatch(&header, &payload)?;
            self.write_response(&header, &reply)?;
        }
    }

    fn dispatch(&mut self, cmd: &ContainerHeader, payload: &[u8]) -> Result<Reply, EngineError> {
        if cmd.kind != container::COMMAND {
            log::warn!(
                "unexpected container type {} (code 0x{:04x})",
                cmd.kind,
                cmd.code
            );
            return Ok(Reply::new(resp::OPERATION_NOT_SUPPORTED));
        }
        let Some((min, max)) = proto::command_size_range(cmd.code) else {
            log::warn!("unsupported operation 0x{:04x}", cmd.code);
            return Ok(Reply::new(resp::OPERATION_NOT_SUPPORTED));
        };
        if cmd.length % 4 != 0 || cmd.length < min || cmd.length > max {
            return Err(EngineError::Protocol(format!(
                "wrong size {} for operation 0x{:04x}",
                cmd.length, cmd.code
            )));
        }
        if self.session.is_none() && requires_session(cmd.code) {
            return Ok(Reply::new(resp::SESSION_NOT_OPEN));
        }

        let params = proto::params_from_payload(payload);
        match cmd.code {
            op::GET_DEVICE_INFO => self.get_device_info(cmd),
            op::OPEN_SESSION => Ok(self.open_session(&params)),
            op::CLOSE_SESSION => Ok(self.close_session()),
            op::GET_STORAGE_IDS => self.get_storage_ids(cmd),
            op::GET_STORAGE_INFO => self.get_storage_info(cmd, &params),
            op::GET_NUM_OBJECTS => Ok(self.get_num_objects(&params)),
            op::GET_OBJECT_HANDLES => self.get_object_handles(cmd, &params),
            op::GET_OBJECT_INFO => self.get_object_info(cmd, &params),
            op::GET_OBJECT => self.get_object(cmd, &params),
            op::GET_THUMB => self.get_thumb(cmd, &params),
            op::DELETE_OBJECT => Ok(self.delete_object(&params)),
            op::SEND_OBJECT_INFO => self.send_object_info(cmd, &params),
            op::SEND_OBJECT => self.send_object(),
            _ => Ok(Reply::new(resp::OPERATION_NOT_SUPPORTED)),
        }
    }

    // --- Operation handlers -------------------------------------------

    fn get_device_info(&mut self, cmd: &ContainerHeader) -> Result<Reply, EngineError> {
        let payload = proto::encode_device_info()?;
        self.send_data(cmd, &payload)?;
        Ok(Reply::new(resp::OK))
    }

    fn open_session(&mut self, params: &[u32]) -> Reply {
        let id = params.first().copied().unwrap_or(0);
        match self.session {
            Some(current) => {
                log::debug!("OpenSession {id} refused, session {current} already open");
                Reply::with_params(resp::SESSION_ALREADY_OPEN, vec![current])
            }
            None if id == 0 => Reply::new(resp::INVALID_PARAMETER),
            None => {
                log::info!("session {id} opened");
                self.session = Some(id);
                Reply::new(resp::OK)
            }
        }
    }

    fn close_session(&mut self) -> Reply {
        match self.session.take() {
            Some(id) => {
                log::info!("session {id} closed");
                Reply::new(resp::OK)
            }
            None => Reply::new(resp::SESSION_NOT_OPEN),
        }
    }

    fn get_storage_ids(&mut self, cmd: &ContainerHeader) -> Result<Reply, EngineError> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&STORE_ID.to_le_bytes());
        self.send_data(cmd, &payload)?;
        Ok(Reply::new(resp::OK))
    }

    fn get_storage_info(
        &mut self,
        cmd: &ContainerHeader,
        params: &[u32],
    ) -> Result<Reply, EngineError> {
        if params.first().copied() != Some(STORE_ID) {
            return Ok(Reply::new(resp::INVALID_STORAGE_ID));
        }
        if self.store.refresh_free_space().is_err() {
            return Ok(Reply::new(resp::ACCESS_DENIED));
        }
        let payload = proto::encode_storage_info(self.store.capacity(), self.store.free_space())?;
        self.send_data(cmd, &payload)?;
        Ok(Reply::new(resp::OK))
    }

    fn get_num_objects(&mut self, params: &[u32]) -> Reply {
        let store_id = params.first().copied().unwrap_or(PARAM_UNUSED);
        if store_id != STORE_ID && store_id != PARAM_ANY {
            return Reply::new(resp::INVALID_STORAGE_ID);
        }
        if let Some(&fmt) = params.get(1) {
            if fmt != PARAM_UNUSED && fmt != PARAM_ANY {
                return Reply::new(resp::SPECIFICATION_BY_FORMAT_NOT_SUPPORTED);
            }
        }
        let count = match params.get(2).copied() {
            // No parent association specified: the whole store.
            None | Some(PARAM_UNUSED) => self.store.object_count() + 2,
            // Root or /DCIM each hold exactly one association.
            Some(PARAM_ANY) | Some(DCIM_HANDLE) => 1,
            Some(MODEL_DIR_HANDLE) => self.store.object_count(),
            Some(parent) if !self.store.handle_valid(parent) => {
                return Reply::new(resp::INVALID_OBJECT_HANDLE)
            }
            Some(_) => return Reply::new(resp::INVALID_PARENT_OBJECT),
        };
        Reply::with_params(resp::OK, vec![count])
    }

    fn get_object_handles(
        &mut self,
        cmd: &ContainerHeader,
        params: &[u32],
    ) -> Result<Reply, EngineError> {
        let store_id = params.first().copied().unwrap_or(PARAM_UNUSED);
        if store_id != STORE_ID && store_id != PARAM_ANY {
            return Ok(Reply::new(resp::INVALID_STORAGE_ID));
        }
        if let Some(&fmt) = params.get(1) {
            if fmt != PARAM_UNUSED && fmt != PARAM_ANY {
                return Ok(Reply::new(resp::SPECIFICATION_BY_FORMAT_NOT_SUPPORTED));
            }
        }
        let parent = params.get(2).copied().unwrap_or(PARAM_UNUSED);
        if parent != PARAM_UNUSED && parent != PARAM_ANY && !self.store.handle_valid(parent) {
            return Ok(Reply::new(resp::INVALID_OBJECT_HANDLE));
        }
        if self.store.lookup(parent).is_some() {
            // A real object cannot parent anything.
            return Ok(Reply::new(resp::INVALID_PARENT_OBJECT));
        }

        let mut handles = Vec::with_capacity(self.store.object_count() as usize + 2);
        if parent != MODEL_DIR_HANDLE {
            handles.push(DCIM_HANDLE);
            handles.push(MODEL_DIR_HANDLE);
        }
        handles.extend(self.store.real_handles());

        let mut payload = Vec::with_capacity(4 + 4 * handles.len());
        payload.extend_from_slice(&(handles.len() as u32).to_le_bytes());
        for handle in &handles {
            payload.extend_from_slice(&handle.to_le_bytes());
        }
        self.send_data(cmd, &payload)?;
        Ok(Reply::new(resp::OK))
    }

    fn get_object_info(
        &mut self,
        cmd: &ContainerHeader,
        params: &[u32],
    ) -> Result<Reply, EngineError> {
        let handle = params.first().copied().unwrap_or(0);
        let info = match handle {
            DCIM_HANDLE => ObjectInfo::association("DCIM", 0, 4096),
            MODEL_DIR_HANDLE => {
                let size = std::fs::metadata(self.store.root())?.len() as u32;
                ObjectInfo::association(MODEL_DIR, DCIM_HANDLE, size)
            }
            other => match self.store.lookup(other) {
                Some(entry) => entry.info.clone(),
                None => return Ok(Reply::new(resp::INVALID_OBJECT_HANDLE)),
            },
        };
        let payload = info.encode()?;
        self.send_data(cmd, &payload)?;
        Ok(Reply::new(resp::OK))
    }

    fn get_object(&mut self, cmd: &ContainerHeader, params: &[u32]) -> Result<Reply, EngineError> {
        let handle = params.first().copied().unwrap_or(0);
        let (size, path) = match self.store.lookup(handle) {
            Some(entry) => (
                u64::from(entry.info.object_compressed_size),
                self.store.object_path(&entry.name),
            ),
            None => return Ok(Reply::new(resp::INVALID_OBJECT_HANDLE)),
        };
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                log::warn!("cannot open {}: {err}", path.display());
                return Ok(Reply::new(resp::INCOMPLETE_TRANSFER));
            }
        };
        self.stream_file(cmd, file, size)?;
        Ok(Reply::new(resp::OK))
    }

    #[cfg(not(feature = "thumbnails"))]
    fn get_thumb(
        &mut self,
        _cmd: &ContainerHeader,
        _params: &[u32],
    ) -> Result<Reply, EngineError> {
        Ok(Reply::new(resp::NO_THUMBNAIL_PRESENT))
    }

    #[cfg(feature = "thumbnails")]
    fn get_thumb(&mut self, cmd: &ContainerHeader, params: &[u32]) -> Result<Reply, EngineError> {
        let handle = params.first().copied().unwrap_or(0);
        let (size, path) = match self.store.lookup(handle) {
            Some(entry) => match crate::thumbs::cache_path(&entry.name) {
                Some(path) => (u64::from(entry.info.thumb_compressed_size), path),
                None => return Ok(Reply::new(resp::NO_THUMBNAIL_PRESENT)),
            },
            None => return Ok(Reply::new(resp::INVALID_OBJECT_HANDLE)),
        };
        if size == 0 {
            return Ok(Reply::new(resp::NO_THUMBNAIL_PRESENT));
        }
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                log::warn!("cannot open {}: {err}", path.display());
                return Ok(Reply::new(resp::INCOMPLETE_TRANSFER));
            }
        };
        self.stream_file(cmd, file, size)?;
        Ok(Reply::new(resp::OK))
    }

    fn delete_object(&mut self, params: &[u32]) -> Reply {
        let handle = params.first().copied().unwrap_or(0);
        if let Some(&fmt) = params.get(1) {
            if fmt != PARAM_UNUSED {
                return Reply::new(resp::SPECIFICATION_BY_FORMAT_NOT_SUPPORTED);
            }
        }
        if handle == DCIM_HANDLE || handle == MODEL_DIR_HANDLE {
            return Reply::new(resp::OBJECT_WRITE_PROTECTED);
        }

        let mut code = if handle == PARAM_ANY {
            if self.store.delete_all() {
                resp::PARTIAL_DELETION
            } else {
                resp::OK
            }
        } else {
            match self.store.delete_one(handle) {
                Some(DeleteStatus::Deleted) => resp::OK,
                Some(DeleteStatus::WriteProtected) => resp::OBJECT_WRITE_PROTECTED,
                Some(DeleteStatus::Failed) => resp::GENERAL_ERROR,
                None => resp::INVALID_OBJECT_HANDLE,
            }
        };
        if self.store.refresh_free_space().is_err() {
            code = resp::STORE_NOT_AVAILABLE;
        }
        Reply::new(code)
    }

    fn send_object_info(
        &mut self,
        cmd: &ContainerHeader,
        params: &[u32],
    ) -> Result<Reply, EngineError> {
        let store_id = params.first().copied().unwrap_or(PARAM_UNUSED);
        let parent = params.get(1).copied().unwrap_or(PARAM_UNUSED);
        log::debug!("SendObjectInfo store 0x{store_id:08x}, parent {parent}");

        // The data phase arrives no matter how the parameters validate,
        // so take it off the wire first.
        let data = match self.read_container() {
            Ok(Some((_header, payload))) => payload,
            Ok(None) => return Err(EngineError::Io(io::ErrorKind::UnexpectedEof.into())),
            Err(EngineError::Io(err)) => {
                log::warn!("object-info data phase failed: {err}");
                return Ok(Reply::new(resp::INCOMPLETE_TRANSFER));
            }
            Err(other) => return Err(other),
        };

        if store_id != STORE_ID {
            return Ok(Reply::new(resp::INVALID_STORAGE_ID));
        }
        if parent != MODEL_DIR_HANDLE {
            // Uploads land in /DCIM/<model> only.
            return Ok(Reply::new(resp::SPECIFICATION_OF_DESTINATION_UNSUPPORTED));
        }

        let info = match ObjectInfo::decode(&data) {
            Ok(info) => info,
            Err(err) => {
                log::warn!("malformed object info: {err}");
                return Ok(Reply::new(resp::GENERAL_ERROR));
            }
        };
        match info.object_format {
            format::UNDEFINED | format::TEXT | format::EXIF_JPEG | format::TIFF => {}
            other => {
                log::debug!("rejecting object format 0x{other:04x}");
                return Ok(Reply::new(resp::INVALID_OBJECT_FORMAT_CODE));
            }
        }
        if u64::from(info.object_compressed_size) > self.store.free_space() {
            log::info!(
                "no space: free {}, requested {}",
                self.store.free_space(),
                info.object_compressed_size
            );
            return Ok(Reply::new(resp::STORE_FULL));
        }

        match self.store.begin_upload(info) {
            Ok(handle) => Ok(Reply::with_params(
                resp::OK,
                vec![STORE_ID, MODEL_DIR_HANDLE, handle],
            )),
            Err(UploadError::Collision) => Ok(Reply::new(resp::STORE_NOT_AVAILABLE)),
            Err(UploadError::Reserve(err)) => {
                log::warn!("cannot reserve upload space: {err}");
                Ok(Reply::new(resp::STORE_FULL))
            }
            Err(err) => {
                log::warn!("cannot stage upload: {err}");
                Ok(Reply::new(resp::GENERAL_ERROR))
            }
        }
    }

    fn send_object(&mut self) -> Result<Reply, EngineError> {
        let mut buf = [0u8; IO_BUF_LEN];
        let (header, prefix_len) = self.read_data_prefix(&mut buf)?;
        let payload_len = u64::from(header.length) - CONTAINER_HEADER_LEN as u64;
        if prefix_len as u64 > payload_len {
            return Err(EngineError::Protocol(format!(
                "received {} bytes past the container end",
                prefix_len as u64 - payload_len
            )));
        }

        if !self.store.has_pending() {
            // End the data phase before complaining.
            self.drain(payload_len - prefix_len as u64)?;
            return Ok(Reply::new(resp::NO_VALID_OBJECT_INFO));
        }

        let declared = u64::from(self.store.pending_size().unwrap_or(0));
        if payload_len != declared {
            self.drain(payload_len - prefix_len as u64)?;
            let code = if payload_len < declared {
                resp::INCOMPLETE_TRANSFER
            } else {
                resp::STORE_FULL
            };
            return Ok(Reply::new(code));
        }

        // First slice arrived together with the header.
        if prefix_len > 0 {
            if let Err(err) = self
                .store
                .write_upload(&buf[CONTAINER_HEADER_LEN..CONTAINER_HEADER_LEN + prefix_len])
            {
                log::warn!("upload write failed: {err}");
                self.drain(payload_len - prefix_len as u64)?;
                return Ok(Reply::new(resp::INCOMPLETE_TRANSFER));
            }
        }
        let mut remaining = payload_len - prefix_len as u64;
        let mut chunk = vec![0u8; DATA_CHUNK_LEN];
        while remaining > 0 {
            let n = remaining.min(DATA_CHUNK_LEN as u64) as usize;
            self.bulk_read(&mut chunk[..n])?;
            if let Err(err) = self.store.write_upload(&chunk[..n]) {
                log::warn!("upload write failed: {err}");
                self.drain(remaining - n as u64)?;
                return Ok(Reply::new(resp::INCOMPLETE_TRANSFER));
            }
            remaining -= n as u64;
        }

        let mut code = match self.store.commit_upload() {
            Some(_) => resp::OK,
            None => resp::GENERAL_ERROR,
        };
        if self.store.refresh_free_space().is_err() {
            code = resp::STORE_NOT_AVAILABLE;
        }
        Ok(Reply::new(code))
    }

    // --- Endpoint I/O --------------------------------------------------

    /// One endpoint read, parking on the reset gate when interrupted.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, EngineError> {
        loop {
            match self.bulk_out.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.ride_out_reset()?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// An interrupted endpoint I/O means either cancellation or a
    /// device reset in progress. For a reset, park on the gate until
    /// the control thread has cleared the endpoint halts, then drop the
    /// session before the retry.
    fn ride_out_reset(&mut self) -> Result<(), EngineError> {
        if self.stop.load(Ordering::Acquire) {
            return Err(EngineError::Cancelled);
        }
        self.gate.wait();
        self.seen_epoch = self.gate.epoch();
        if self.session.take().is_some() {
            log::info!("device reset: session closed");
        }
        Ok(())
    }

    /// Fill `buf` completely from bulk-out.
    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<(), EngineError> {
        let mut count = 0;
        while count < buf.len() {
            match self.read_some(&mut buf[count..])? {
                0 => return Err(EngineError::Io(io::ErrorKind::UnexpectedEof.into())),
                n => count += n,
            }
        }
        log::trace!("BULK-OUT read {count} bytes");
        Ok(())
    }

    /// Write `buf` completely to bulk-in, parking on the reset gate
    /// when interrupted.
    fn bulk_write(&mut self, buf: &[u8]) -> Result<(), EngineError> {
        let mut count = 0;
        while count < buf.len() {
            match self.bulk_in.write(&buf[count..]) {
                Ok(0) => return Err(EngineError::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => count += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.ride_out_reset()?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        log::trace!("BULK-IN sent {count} bytes");
        Ok(())
    }

    /// Read one complete container (at most one I/O buffer long).
    /// Bytes received past the declared length are a protocol error.
    /// Returns `None` when the stream ends cleanly between containers.
    fn read_container(&mut self) -> Result<Option<(ContainerHeader, Vec<u8>)>, EngineError> {
        let mut buf = [0u8; IO_BUF_LEN];
        let mut count = 0;
        let mut expected: Option<usize> = None;

        loop {
            let n = self.read_some(&mut buf[count..])?;
            if n == 0 {
                if count == 0 {
                    return Ok(None);
                }
                return Err(EngineError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            count += n;

            if expected.is_none() && count >= CONTAINER_HEADER_LEN {
                let header = ContainerHeader::decode(&buf)?;
                let total = header.length as usize;
                if total < CONTAINER_HEADER_LEN || total > IO_BUF_LEN {
                    return Err(EngineError::Protocol(format!(
                        "container length {total} out of range"
                    )));
                }
                expected = Some(total);
            }
            if let Some(total) = expected {
                if count > total {
                    return Err(EngineError::Protocol(format!(
                        "received {count} bytes, container declares {total}"
                    )));
                }
                if count == total {
                    let header = ContainerHeader::decode(&buf)?;
                    return Ok(Some((header, buf[CONTAINER_HEADER_LEN..total].to_vec())));
                }
            }
        }
    }

    /// Read a data-phase container header plus whatever payload bytes
    /// arrive in the same buffer; the caller streams the rest.
    fn read_data_prefix(
        &mut self,
        buf: &mut [u8; IO_BUF_LEN],
    ) -> Result<(ContainerHeader, usize), EngineError> {
        let mut count = 0;
        while count < CONTAINER_HEADER_LEN {
            let n = self.read_some(&mut buf[count..])?;
            if n == 0 {
                return Err(EngineError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
            count += n;
        }
        let header = ContainerHeader::decode(&buf[..])?;
        if (header.length as usize) < CONTAINER_HEADER_LEN {
            return Err(EngineError::Protocol(format!(
                "container length {} too small",
                header.length
            )));
        }
        Ok((header, count - CONTAINER_HEADER_LEN))
    }

    /// Read and discard data-phase bytes the host is still sending.
    fn drain(&mut self, mut remaining: u64) -> Result<(), EngineError> {
        let mut chunk = [0u8; IO_BUF_LEN];
        while remaining > 0 {
            let n = remaining.min(IO_BUF_LEN as u64) as usize;
            self.bulk_read(&mut chunk[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Emit one data container. The first write carries the header plus
    /// up to one I/O buffer of payload; the rest follows in chunks. The
    /// header always declares the full length.
    fn send_data(&mut self, cmd: &ContainerHeader, payload: &[u8]) -> Result<(), EngineError> {
        let total = CONTAINER_HEADER_LEN + payload.len();
        let header = ContainerHeader {
            length: total as u32,
            kind: container::DATA,
            code: cmd.code,
            id: cmd.id,
        };
        let first = payload.len().min(IO_BUF_LEN - CONTAINER_HEADER_LEN);
        let mut buf = Vec::with_capacity(CONTAINER_HEADER_LEN + first);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&payload[..first]);
        self.bulk_write(&buf)?;

        let mut off = first;
        while off < payload.len() {
            let n = (payload.len() - off).min(DATA_CHUNK_LEN);
            self.bulk_write(&payload[off..off + n])?;
            off += n;
        }
        Ok(())
    }

    /// Emit a data container whose payload is the file's bytes, read in
    /// chunks. The header declares the full length up front.
    fn stream_file(
        &mut self,
        cmd: &ContainerHeader,
        mut file: std::fs::File,
        size: u64,
    ) -> Result<(), EngineError> {
        let total = size + CONTAINER_HEADER_LEN as u64;
        let header = ContainerHeader {
            length: total as u32,
            kind: container::DATA,
            code: cmd.code,
            id: cmd.id,
        };
        log::debug!("streaming {total} bytes for handle data phase");

        let first = (total as usize).min(IO_BUF_LEN) - CONTAINER_HEADER_LEN;
        let mut buf = vec![0u8; CONTAINER_HEADER_LEN + first];
        buf[..CONTAINER_HEADER_LEN].copy_from_slice(&header.encode());
        file.read_exact(&mut buf[CONTAINER_HEADER_LEN..])?;
        self.bulk_write(&buf)?;

        let mut remaining = size - first as u64;
        let mut chunk = vec![0u8; DATA_CHUNK_LEN];
        while remaining > 0 {
            let n = remaining.min(DATA_CHUNK_LEN as u64) as usize;
            file.read_exact(&mut chunk[..n])?;
            self.bulk_write(&chunk[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn write_response(&mut self, cmd: &ContainerHeader, reply: &Reply) -> Result<(), EngineError> {
        let total = CONTAINER_HEADER_LEN + 4 * reply.params.len();
        let header = ContainerHeader {
            length: total as u32,
            kind: container::RESPONSE,
            code: reply.code,
            id: cmd.id,
        };
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&header.encode());
        for param in &reply.params {
            buf.extend_from_slice(&param.to_le_bytes());
        }
        log::debug!("response 0x{:04x} id {}", reply.code, cmd.id);
        self.bulk_write(&buf)
    }
}
