//! Call handle: one inbound invocation from receipt to response.
//!
//! A [`CallHandle`] moves through
//! `Received → InputDecoded → OutputReady → Responded`, or ends in `Failed`.
//! Exactly one response leaves each handle; any `respond*` after a terminal
//! state fails with `InvalidState`.
//!
//! # Example
//!
//! ```ignore
//! fn bla_open(call: &mut CallHandle) -> BoxFuture<'_, HandlerResult> {
//!     Box::pin(async move {
//!         let args: OpenIn = decode_value(call.input()?)?;
//!         call.release_input();
//!
//!         let mut out = OpenOut { event_id: 232, ret: 0 };
//!         call.respond_with(&mut out).await
//!     })
//! }
//! ```

use bytes::Bytes;

use crate::error::{Result, ShipperError};
use crate::proc::{encode_value, ExtraBuffer, OutputBuffer, Proc, ProcField};
use crate::protocol::flags;
use crate::transport::PeerId;
use crate::writer::{OutboundFrame, WriterHandle};

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Input available, nothing produced yet.
    Received,
    /// Handler consumed its input; the input buffer is released.
    InputDecoded,
    /// Output buffer lent to the handler.
    OutputReady,
    /// Response transmitted.
    Responded,
    /// An error response was sent or the call was abandoned.
    Failed,
}

impl CallState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Responded | CallState::Failed)
    }
}

/// Where the response goes.
#[derive(Debug)]
enum Responder {
    Writer(WriterHandle),
    /// Keeps the response frame on the handle instead of sending it.
    Detached(Option<OutboundFrame>),
}

/// One inbound invocation.
#[derive(Debug)]
pub struct CallHandle {
    peer: PeerId,
    request_id: u32,
    procedure: String,
    input: Option<Bytes>,
    inline_capacity: usize,
    max_extra: usize,
    output_lent: bool,
    state: CallState,
    failure: Option<String>,
    responder: Responder,
}

impl CallHandle {
    pub(crate) fn new(
        peer: PeerId,
        request_id: u32,
        procedure: String,
        input: Bytes,
        inline_capacity: usize,
        max_extra: usize,
        writer: WriterHandle,
    ) -> Self {
        Self {
            peer,
            request_id,
            procedure,
            input: Some(input),
            inline_capacity,
            max_extra,
            output_lent: false,
            state: CallState::Received,
            failure: None,
            responder: Responder::Writer(writer),
        }
    }

    /// Create a handle with no connection behind it.
    ///
    /// The response frame is kept on the handle and can be inspected with
    /// [`take_sent`](Self::take_sent). Useful for driving a handler directly.
    pub fn detached(
        peer: PeerId,
        request_id: u32,
        procedure: &str,
        input: Bytes,
        inline_capacity: usize,
    ) -> Self {
        Self {
            peer,
            request_id,
            procedure: procedure.to_string(),
            input: Some(input),
            inline_capacity,
            max_extra: crate::proc::DEFAULT_MAX_EXTRA_SIZE,
            output_lent: false,
            state: CallState::Received,
            failure: None,
            responder: Responder::Detached(None),
        }
    }

    #[inline]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    #[inline]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    #[inline]
    pub fn state(&self) -> CallState {
        self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Message of the error response, if one was sent.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Inline output capacity offered to the handler.
    pub fn inline_capacity(&self) -> usize {
        self.inline_capacity
    }

    /// The received payload (zero-copy).
    ///
    /// # Errors
    ///
    /// `InvalidState` once the input has been released or the call is over.
    pub fn input(&self) -> Result<Bytes> {
        if self.is_terminal() {
            return Err(self.finished());
        }
        self.input
            .clone()
            .ok_or_else(|| ShipperError::InvalidState("input already released".to_string()))
    }

    /// Give the input buffer back to the transport.
    pub fn release_input(&mut self) {
        self.input = None;
        if self.state == CallState::Received {
            self.state = CallState::InputDecoded;
        }
    }

    /// Borrow the inline output buffer.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the buffer is already lent or the call is over.
    pub fn output(&mut self) -> Result<OutputBuffer> {
        if self.is_terminal() {
            return Err(self.finished());
        }
        if self.output_lent {
            return Err(ShipperError::InvalidState(
                "output buffer already lent".to_string(),
            ));
        }
        self.output_lent = true;
        self.state = CallState::OutputReady;
        Ok(OutputBuffer::with_capacity(self.inline_capacity))
    }

    /// Open an encoding Proc over the output buffer, with this call's
    /// extra-buffer limit.
    pub fn encoder(&mut self) -> Result<Proc> {
        let output = self.output()?;
        Ok(Proc::encode(output).with_max_extra(self.max_extra))
    }

    /// Send the response.
    ///
    /// When `extra` is present it holds the full encoding and is sent in
    /// place of `output`, flagged `HAS_EXTRA`. Returns once the frame has
    /// been written; both buffers are released by then.
    pub async fn respond(
        &mut self,
        output: OutputBuffer,
        extra: Option<ExtraBuffer>,
    ) -> Result<()> {
        if self.is_terminal() {
            return Err(self.finished());
        }

        let (response_flags, payload) = match extra {
            Some(extra) => (flags::EXTRA_RESPONSE, extra.into_bytes()),
            None => (flags::RESPONSE, output.freeze()),
        };
        let frame = OutboundFrame::response(response_flags, self.request_id, payload)?;

        self.input = None;
        let sent = self.send(frame).await;
        self.state = if sent.is_ok() {
            CallState::Responded
        } else {
            CallState::Failed
        };
        sent
    }

    /// Encode `value` into the output buffer and respond with it.
    pub async fn respond_with<T: ProcField>(&mut self, value: &mut T) -> Result<()> {
        let proc = self.encoder()?;
        let encoded = crate::proc::encode_with(value, proc)?;
        self.respond(encoded.output, encoded.extra).await
    }

    /// Send an error response carrying `message`; the call ends `Failed`.
    pub async fn respond_error(&mut self, message: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(self.finished());
        }

        let frame = OutboundFrame::response(
            flags::ERROR_RESPONSE,
            self.request_id,
            encode_error_message(message)?,
        )?;

        self.input = None;
        self.state = CallState::Failed;
        self.failure = Some(message.to_string());
        self.send(frame).await
    }

    /// Take the frame a detached handle would have sent.
    pub fn take_sent(&mut self) -> Option<OutboundFrame> {
        match &mut self.responder {
            Responder::Detached(slot) => slot.take(),
            Responder::Writer(_) => None,
        }
    }

    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        match &mut self.responder {
            Responder::Writer(writer) => writer.send_flushed(frame).await,
            Responder::Detached(slot) => {
                *slot = Some(frame);
                Ok(())
            }
        }
    }

    fn finished(&self) -> ShipperError {
        ShipperError::InvalidState(format!(
            "call {} to {} already {:?}",
            self.request_id, self.procedure, self.state
        ))
    }
}

/// Encode an error message the way error frames carry it.
fn encode_error_message(message: &str) -> Result<Bytes> {
    let mut message = message.to_string();
    let capacity = message.len() + 4;
    let (payload, _) =
        encode_value(&mut message, OutputBuffer::with_capacity(capacity))?.into_payload();
    Ok(payload)
}
