//! Resumable transfer sessions - one per channel per round.
//!
//! Each session is a step machine over a [`ChannelIo`]. `advance()` moves as
//! many bytes as the channel accepts and returns either `Blocked(interest)` or
//! `Done`. A step's value is only interpreted after its full byte count has
//! transferred; the cursor survives across `advance()` calls, so nothing is
//! resent or reread after a would-block.
//!
//! - [`SchedulerSession`]: sends parameters, receives the result
//! - [`WorkerSession`]: receives parameters, sends the result

use bytes::Bytes;

use super::channel::{ChannelIo, Interest, IoOutcome};
use super::protocol::{
    ExtractParams, MAX_FILENAME_LEN, PARAM_HEADER_LEN, PAYLOAD_LEN_LEN, ParamHeader,
    RESULT_CODE_LEN, ResultCode,
};

/// Position in the fixed per-round message sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    ParamHeader,
    Filename,
    ResultCode,
    PayloadLen,
    Payload,
    Finished,
}

impl TransferStep {
    /// Step following `self`. `code` is only consulted after `ResultCode`:
    /// anything but OK ends the round without a length or payload.
    pub fn next(self, code: Option<ResultCode>) -> TransferStep {
        match self {
            Self::ParamHeader => Self::Filename,
            Self::Filename => Self::ResultCode,
            Self::ResultCode => match code {
                Some(ResultCode::Ok) => Self::PayloadLen,
                _ => Self::Finished,
            },
            Self::PayloadLen => Self::Payload,
            Self::Payload | Self::Finished => Self::Finished,
        }
    }

    /// True for steps flowing scheduler → worker.
    pub fn is_request(self) -> bool {
        matches!(self, Self::ParamHeader | Self::Filename)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParamHeader => "param_header",
            Self::Filename => "filename",
            Self::ResultCode => "result_code",
            Self::PayloadLen => "payload_len",
            Self::Payload => "payload",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for TransferStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal session failure. The session must not be advanced again.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("channel closed during {step}")]
    Closed { step: TransferStep },
    #[error("channel I/O failed during {step}: {source}")]
    Io {
        step: TransferStep,
        #[source]
        source: std::io::Error,
    },
    #[error("framing error during {step}: {detail}")]
    Protocol { step: TransferStep, detail: String },
}

impl TransferError {
    fn protocol(step: TransferStep, detail: impl Into<String>) -> Self {
        Self::Protocol {
            step,
            detail: detail.into(),
        }
    }

    pub fn step(&self) -> TransferStep {
        match self {
            Self::Closed { step } | Self::Io { step, .. } | Self::Protocol { step, .. } => *step,
        }
    }
}

/// Step-level transfer status.
#[derive(Debug)]
pub enum StepIo {
    Complete,
    WouldBlock,
    Error(IoOutcome),
}

/// Bytes of the current step plus how many of them have moved.
#[derive(Debug, Default)]
pub struct StepBuffer {
    data: Vec<u8>,
    cursor: usize,
}

impl StepBuffer {
    pub fn outgoing(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            cursor: 0,
        }
    }

    pub fn incoming(len: usize) -> Self {
        Self {
            data: vec![0; len],
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn is_complete(&self) -> bool {
        self.cursor == self.data.len()
    }

    /// Fill the remaining bytes from `io`, stopping at would-block.
    pub fn read_from<C: ChannelIo + ?Sized>(&mut self, io: &mut C) -> StepIo {
        while !self.is_complete() {
            match io.try_read(&mut self.data[self.cursor..]) {
                IoOutcome::Transferred(n) => self.cursor += n,
                IoOutcome::WouldBlock => return StepIo::WouldBlock,
                other => return StepIo::Error(other),
            }
        }
        StepIo::Complete
    }

    /// Flush the remaining bytes to `io`, stopping at would-block.
    pub fn write_to<C: ChannelIo + ?Sized>(&mut self, io: &mut C) -> StepIo {
        while !self.is_complete() {
            match io.try_write(&self.data[self.cursor..]) {
                IoOutcome::Transferred(n) => self.cursor += n,
                IoOutcome::WouldBlock => return StepIo::WouldBlock,
                other => return StepIo::Error(other),
            }
        }
        StepIo::Complete
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn take(&mut self) -> Vec<u8> {
        self.cursor = 0;
        std::mem::take(&mut self.data)
    }
}

/// Outcome of `advance()` that is not a failure.
#[derive(Debug, PartialEq, Eq)]
pub enum Advance<T> {
    /// Waiting for the channel; call `advance()` again once it is ready.
    Blocked(Interest),
    Done(T),
}

/// What the worker reported for the round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    Thumbnail(Bytes),
    FileNotFound,
    TimeNotFound,
    Failed { code: i64 },
}

fn step_error(step: TransferStep, outcome: IoOutcome) -> TransferError {
    match outcome {
        IoOutcome::Failed(source) => TransferError::Io { step, source },
        _ => TransferError::Closed { step },
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; RESULT_CODE_LEN];
    raw.copy_from_slice(bytes);
    i64::from_ne_bytes(raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; PAYLOAD_LEN_LEN];
    raw.copy_from_slice(bytes);
    u64::from_ne_bytes(raw)
}

/// Scheduler half of a round: parameters out, result in.
#[derive(Debug)]
pub struct SchedulerSession {
    step: TransferStep,
    buffer: StepBuffer,
    filename: Option<Vec<u8>>,
    max_payload_len: u64,
    outcome: Option<ExtractOutcome>,
}

impl SchedulerSession {
    pub fn new(params: &ExtractParams, max_payload_len: u64) -> Self {
        Self {
            step: TransferStep::ParamHeader,
            buffer: StepBuffer::outgoing(params.encode_header()),
            filename: Some(params.filename_bytes().to_vec()),
            max_payload_len,
            outcome: None,
        }
    }

    pub fn step(&self) -> TransferStep {
        self.step
    }

    /// Interest needed to make progress on the current step.
    pub fn interest(&self) -> Interest {
        if self.step.is_request() {
            Interest::Write
        } else {
            Interest::Read
        }
    }

    pub fn advance<C: ChannelIo + ?Sized>(
        &mut self,
        io: &mut C,
    ) -> Result<Advance<ExtractOutcome>, TransferError> {
        if let Some(filename) = &self.filename
            && filename.len() > MAX_FILENAME_LEN
        {
            return Err(TransferError::protocol(
                self.step,
                format!("filename of {} bytes exceeds limit", filename.len()),
            ));
        }

        loop {
            if self.step == TransferStep::Finished {
                return match self.outcome.take() {
                    Some(outcome) => Ok(Advance::Done(outcome)),
                    None => Err(TransferError::protocol(self.step, "session already finished")),
                };
            }

            let status = if self.step.is_request() {
                self.buffer.write_to(io)
            } else {
                self.buffer.read_from(io)
            };

            match status {
                StepIo::Complete => self.complete_step()?,
                StepIo::WouldBlock => return Ok(Advance::Blocked(self.interest())),
                StepIo::Error(outcome) => return Err(step_error(self.step, outcome)),
            }
        }
    }

    fn complete_step(&mut self) -> Result<(), TransferError> {
        let bytes = self.buffer.take();
        let mut code = None;

        match self.step {
            TransferStep::ParamHeader => {
                self.buffer = StepBuffer::outgoing(self.filename.take().unwrap_or_default());
            }
            TransferStep::Filename => {
                self.buffer = StepBuffer::incoming(RESULT_CODE_LEN);
            }
            TransferStep::ResultCode => {
                let raw = read_i64(&bytes);
                let decoded = ResultCode::from_wire(raw).ok_or_else(|| {
                    TransferError::protocol(self.step, format!("unknown result code {raw}"))
                })?;
                match decoded {
                    ResultCode::Ok => self.buffer = StepBuffer::incoming(PAYLOAD_LEN_LEN),
                    ResultCode::FileNotFound => self.outcome = Some(ExtractOutcome::FileNotFound),
                    ResultCode::TimeNotFound => self.outcome = Some(ExtractOutcome::TimeNotFound),
                    ResultCode::GenericError(c) => {
                        self.outcome = Some(ExtractOutcome::Failed { code: c })
                    }
                }
                code = Some(decoded);
            }
            TransferStep::PayloadLen => {
                let len = read_u64(&bytes);
                if len > self.max_payload_len {
                    return Err(TransferError::protocol(
                        self.step,
                        format!("payload of {len} bytes exceeds limit {}", self.max_payload_len),
                    ));
                }
                let len = usize::try_from(len).map_err(|_| {
                    TransferError::protocol(self.step, "payload length overflows usize")
                })?;
                self.buffer = StepBuffer::incoming(len);
            }
            TransferStep::Payload => {
                self.outcome = Some(ExtractOutcome::Thumbnail(Bytes::from(bytes)));
            }
            TransferStep::Finished => {}
        }

        self.step = self.step.next(code);
        tracing::trace!(step = %self.step, "Scheduler session advanced");
        Ok(())
    }
}

/// Events the worker side surfaces to its driver.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Parameters fully received; call [`WorkerSession::respond`] next.
    Params(ExtractParams),
    /// Result fully flushed.
    Flushed,
}

/// Worker half of a round: parameters in, result out.
#[derive(Debug)]
pub struct WorkerSession {
    step: TransferStep,
    buffer: StepBuffer,
    header: Option<ParamHeader>,
    code: Option<ResultCode>,
    payload: Option<Bytes>,
    awaiting_result: bool,
}

impl Default for WorkerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSession {
    pub fn new() -> Self {
        Self {
            step: TransferStep::ParamHeader,
            buffer: StepBuffer::incoming(PARAM_HEADER_LEN),
            header: None,
            code: None,
            payload: None,
            awaiting_result: false,
        }
    }

    pub fn step(&self) -> TransferStep {
        self.step
    }

    pub fn interest(&self) -> Interest {
        if self.step.is_request() {
            Interest::Read
        } else {
            Interest::Write
        }
    }

    /// Queue the result for sending. Only valid right after `Params`.
    ///
    /// A payload is only sent when `code` is OK.
    pub fn respond(&mut self, code: ResultCode, payload: Bytes) -> Result<(), TransferError> {
        if !self.awaiting_result {
            return Err(TransferError::protocol(self.step, "result provided out of order"));
        }
        self.awaiting_result = false;
        self.code = Some(code);
        self.payload = code.is_ok().then_some(payload);
        self.buffer = StepBuffer::outgoing(code.to_wire().to_ne_bytes());
        Ok(())
    }

    pub fn advance<C: ChannelIo + ?Sized>(
        &mut self,
        io: &mut C,
    ) -> Result<Advance<WorkerEvent>, TransferError> {
        if self.awaiting_result {
            return Err(TransferError::protocol(self.step, "advanced before a result was set"));
        }

        loop {
            if self.step == TransferStep::Finished {
                return Ok(Advance::Done(WorkerEvent::Flushed));
            }

            let status = if self.step.is_request() {
                self.buffer.read_from(io)
            } else {
                self.buffer.write_to(io)
            };

            match status {
                StepIo::Complete => {
                    if let Some(params) = self.complete_step()? {
                        return Ok(Advance::Done(WorkerEvent::Params(params)));
                    }
                }
                StepIo::WouldBlock => return Ok(Advance::Blocked(self.interest())),
                StepIo::Error(outcome) => return Err(step_error(self.step, outcome)),
            }
        }
    }

    fn complete_step(&mut self) -> Result<Option<ExtractParams>, TransferError> {
        let bytes = self.buffer.take();

        match self.step {
            TransferStep::ParamHeader => {
                let header = ParamHeader::decode(&bytes)
                    .ok_or_else(|| TransferError::protocol(self.step, "short parameter header"))?;
                let len = usize::try_from(header.filename_len)
                    .ok()
                    .filter(|len| *len <= MAX_FILENAME_LEN)
                    .ok_or_else(|| {
                        TransferError::protocol(
                            self.step,
                            format!("filename length {} exceeds limit", header.filename_len),
                        )
                    })?;
                self.buffer = StepBuffer::incoming(len);
                self.header = Some(header);
                self.step = self.step.next(None);
                Ok(None)
            }
            TransferStep::Filename => {
                let header = self
                    .header
                    .take()
                    .ok_or_else(|| TransferError::protocol(self.step, "filename before header"))?;
                self.step = self.step.next(None);
                self.awaiting_result = true;
                Ok(Some(header.with_filename(bytes)))
            }
            TransferStep::ResultCode => {
                let payload = self.payload.take().unwrap_or_default();
                if self.code.is_some_and(ResultCode::is_ok) {
                    self.buffer = StepBuffer::outgoing((payload.len() as u64).to_ne_bytes());
                    self.payload = Some(payload);
                }
                self.step = self.step.next(self.code);
                Ok(None)
            }
            TransferStep::PayloadLen => {
                let payload = self.payload.take().unwrap_or_default();
                self.buffer = StepBuffer::outgoing(Vec::from(payload));
                self.step = self.step.next(None);
                Ok(None)
            }
            TransferStep::Payload | TransferStep::Finished => {
                self.step = TransferStep::Finished;
                Ok(None)
            }
        }
    }
}
