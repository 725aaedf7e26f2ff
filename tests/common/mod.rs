//! Shared harness for driving the bulk engine without USB hardware:
//! a scripted bulk-out endpoint and container builders/parsers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ptpd::engine::{Engine, EngineError};
use ptpd::gate::ResetGate;
use ptpd::proto::{container, ContainerHeader, ObjectInfo, CONTAINER_HEADER_LEN};
use ptpd::store::ObjectStore;

/// One scripted host action on the bulk-out endpoint.
pub enum Step {
    /// A single USB transfer worth of bytes.
    Transfer(Vec<u8>),
    /// The read is interrupted by a device reset: the gate goes
    /// through a full rearm/post cycle and the read fails with EINTR,
    /// exactly as the control thread produces it.
    Reset,
}

/// Replays scripted transfers one `read` call at a time, the way the
/// endpoint hands over one USB transfer at a time.
pub struct HostScript {
    steps: VecDeque<Step>,
    pos: usize,
    gate: Arc<ResetGate>,
}

impl HostScript {
    pub fn new(steps: Vec<Step>, gate: Arc<ResetGate>) -> Self {
        Self {
            steps: steps.into(),
            pos: 0,
            gate,
        }
    }
}

impl Read for HostScript {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.steps.front() {
                None => return Ok(0),
                Some(Step::Reset) => {
                    self.steps.pop_front();
                    self.gate.rearm();
                    self.gate.post();
                    return Err(io::ErrorKind::Interrupted.into());
                }
                Some(Step::Transfer(bytes)) => {
                    if self.pos >= bytes.len() {
                        self.steps.pop_front();
                        self.pos = 0;
                        continue;
                    }
                    let n = (bytes.len() - self.pos).min(buf.len());
                    buf[..n].copy_from_slice(&bytes[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
            }
        }
    }
}

/// Everything a finished engine run left behind.
pub struct EngineRun {
    pub store: ObjectStore,
    pub result: Result<(), EngineError>,
    pub containers: Vec<(ContainerHeader, Vec<u8>)>,
}

impl EngineRun {
    /// The nth emitted container, bulk-in order.
    pub fn container(&self, n: usize) -> &(ContainerHeader, Vec<u8>) {
        &self.containers[n]
    }

    /// All response containers, in order.
    pub fn responses(&self) -> Vec<&(ContainerHeader, Vec<u8>)> {
        self.containers
            .iter()
            .filter(|(h, _)| h.kind == container::RESPONSE)
            .collect()
    }
}

/// Run the engine over a scripted session and collect its output.
pub fn run_engine(store: ObjectStore, steps: Vec<Step>) -> EngineRun {
    let gate = Arc::new(ResetGate::new());
    let mut output = Vec::new();
    let engine = Engine::new(
        HostScript::new(steps, Arc::clone(&gate)),
        &mut output,
        store,
        gate,
        Arc::new(AtomicBool::new(false)),
    );
    let (store, result) = engine.run();
    EngineRun {
        store,
        result,
        containers: parse_containers(&output),
    }
}

/// A command container as one transfer.
pub fn cmd(code: u16, id: u32, params: &[u32]) -> Step {
    let header = ContainerHeader {
        length: (CONTAINER_HEADER_LEN + 4 * params.len()) as u32,
        kind: container::COMMAND,
        code,
        id,
    };
    let mut out = header.encode().to_vec();
    for p in params {
        out.extend_from_slice(&p.to_le_bytes());
    }
    Step::Transfer(out)
}

/// A data container as one transfer.
pub fn data(code: u16, id: u32, payload: &[u8]) -> Step {
    let header = ContainerHeader {
        length: (CONTAINER_HEADER_LEN + payload.len()) as u32,
        kind: container::DATA,
        code,
        id,
    };
    let mut out = header.encode().to_vec();
    out.extend_from_slice(payload);
    Step::Transfer(out)
}

/// The object-info payload a host would send ahead of an upload.
pub fn upload_info(name: &str, object_format: u16, size: u32) -> Vec<u8> {
    ObjectInfo::for_file(object_format, 0, size, name.to_owned(), String::new())
        .encode()
        .expect("encodable object info")
}

/// Split a captured bulk-in byte stream into containers using the
/// declared lengths.
pub fn parse_containers(mut bytes: &[u8]) -> Vec<(ContainerHeader, Vec<u8>)> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let header = ContainerHeader::decode(bytes).expect("container header");
        let total = header.length as usize;
        assert!(
            total >= CONTAINER_HEADER_LEN && total <= bytes.len(),
            "container length {total} inconsistent with {} buffered bytes",
            bytes.len()
        );
        out.push((header, bytes[CONTAINER_HEADER_LEN..total].to_vec()));
        bytes = &bytes[total..];
    }
    out
}

/// Decode a little-endian u32 array payload (count-prefixed).
pub fn parse_handle_array(payload: &[u8]) -> Vec<u32> {
    assert!(payload.len() >= 4, "payload too short for an array");
    let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    assert_eq!(payload.len(), 4 + 4 * count, "array length mismatch");
    payload[4..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
