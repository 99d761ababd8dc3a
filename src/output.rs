//! Frame sinks.
//!
//! An [`Output`] receives a chain's fully composed lamp buffer once per
//! tick. The buffer is only borrowed for the duration of [`Output::send`];
//! the chain reuses it for the next frame.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use open_dmx::{DMX_CHANNELS, DMXSerial};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lamp_types::{ChannelMapping, Lamp, LampLayout, OutputSpec, SinkSpec};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DMX interface error: {0}")]
    Dmx(String),
    #[error("Send did not complete within {0:?}")]
    Timeout(Duration),
    #[error("Previous frame is still being sent")]
    Busy,
    #[error("Output is closed")]
    Closed,
}

pub trait Output: Send {
    /// Transmits one frame. `lamps` must not be retained past the call.
    fn send(&mut self, lamps: &[Lamp]) -> Result<(), OutputError>;
    /// Releases the underlying connection. Called once when the chain stops.
    fn close(&mut self);
}

/// Opens the sink described by `spec`, wrapped in a [`TimedOutput`] when a
/// send timeout is configured.
pub fn open_output(spec: &OutputSpec) -> Result<Box<dyn Output>, OutputError> {
    let output: Box<dyn Output> = match &spec.sink {
        SinkSpec::Null => Box::new(NullOutput),
        SinkSpec::DmxSerial {
            port,
            start_channel,
        } => Box::new(DmxSerialOutput::open(port, *start_channel, spec.layout())?),
    };
    match spec.send_timeout_ms {
        Some(ms) => Ok(Box::new(TimedOutput::new(
            output,
            Duration::from_millis(ms),
        )?)),
        None => Ok(output),
    }
}

/// Computes frames and throws them away.
pub struct NullOutput;

impl Output for NullOutput {
    fn send(&mut self, _lamps: &[Lamp]) -> Result<(), OutputError> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Writes `lamps` into a DMX universe starting at the 1-based
/// `start_channel`. Each lamp takes `channels_per_lamp` slots; lamps that
/// would run past the last channel are dropped.
pub fn pack_lamps(
    universe: &mut [u8; DMX_CHANNELS],
    lamps: &[Lamp],
    start_channel: usize,
    layout: LampLayout,
) {
    let width = layout.channels_per_lamp as usize;
    if width == 0 {
        return;
    }
    let first = start_channel.saturating_sub(1);
    for (i, lamp) in lamps.iter().enumerate() {
        let base = first + i * width;
        let Some(slot) = universe.get_mut(base..base + width) else {
            break;
        };
        let channels = [lamp.r, lamp.g, lamp.b, lamp.w];
        let used = match layout.mapping {
            ChannelMapping::Rgb => 3,
            ChannelMapping::Rgbw => 4,
        };
        for (dst, src) in slot.iter_mut().zip(&channels[..used]) {
            *dst = *src;
        }
    }
}

/// USB DMX interface driven through `open_dmx`.
pub struct DmxSerialOutput {
    port: String,
    serial: Option<DMXSerial>,
    start_channel: usize,
    layout: LampLayout,
    universe: [u8; DMX_CHANNELS],
}

impl DmxSerialOutput {
    pub fn open(port: &str, start_channel: usize, layout: LampLayout) -> Result<Self, OutputError> {
        let serial = DMXSerial::open(port).map_err(|e| OutputError::Dmx(format!("{port}: {e}")))?;
        info!(port, start_channel, "DMX interface opened");
        Ok(Self {
            port: port.to_string(),
            serial: Some(serial),
            start_channel,
            layout,
            universe: [0; DMX_CHANNELS],
        })
    }
}

impl Output for DmxSerialOutput {
    fn send(&mut self, lamps: &[Lamp]) -> Result<(), OutputError> {
        let Some(serial) = &mut self.serial else {
            return Err(OutputError::Closed);
        };
        pack_lamps(&mut self.universe, lamps, self.start_channel, self.layout);
        serial.set_channels(self.universe);
        serial
            .check_agent()
            .map_err(|e| OutputError::Dmx(e.to_string()))
    }

    fn close(&mut self) {
        if self.serial.take().is_some() {
            info!(port = %self.port, "DMX interface closed");
        }
    }
}

/// Runs another output on its own thread and bounds every send.
///
/// A send that does not finish within the timeout returns
/// [`OutputError::Timeout`] and keeps running in the background; frames
/// offered before it completes are rejected with [`OutputError::Busy`].
pub struct TimedOutput {
    frames: Option<Sender<Vec<Lamp>>>,
    results: Receiver<Result<(), OutputError>>,
    worker: Option<JoinHandle<()>>,
    timeout: Duration,
    pending: bool,
}

impl TimedOutput {
    pub fn new(mut inner: Box<dyn Output>, timeout: Duration) -> Result<Self, OutputError> {
        let (frame_tx, frame_rx) = bounded::<Vec<Lamp>>(1);
        let (result_tx, result_rx) = bounded(1);
        let worker = thread::Builder::new()
            .name("timed-output".into())
            .spawn(move || {
                for frame in frame_rx {
                    if result_tx.send(inner.send(&frame)).is_err() {
                        break;
                    }
                }
                inner.close();
            })?;
        Ok(Self {
            frames: Some(frame_tx),
            results: result_rx,
            worker: Some(worker),
            timeout,
            pending: false,
        })
    }

    fn settle_pending(&mut self) -> Result<(), OutputError> {
        if !self.pending {
            return Ok(());
        }
        match self.results.try_recv() {
            Ok(late) => {
                if let Err(e) = late {
                    debug!("late send finished with error: {e}");
                }
                self.pending = false;
                Ok(())
            }
            Err(TryRecvError::Empty) => Err(OutputError::Busy),
            Err(TryRecvError::Disconnected) => Err(OutputError::Closed),
        }
    }
}

impl Output for TimedOutput {
    fn send(&mut self, lamps: &[Lamp]) -> Result<(), OutputError> {
        self.settle_pending()?;
        let Some(frames) = &self.frames else {
            return Err(OutputError::Closed);
        };
        match frames.try_send(lamps.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(OutputError::Busy),
            Err(TrySendError::Disconnected(_)) => return Err(OutputError::Closed),
        }
        match self.results.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.pending = true;
                Err(OutputError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(OutputError::Closed),
        }
    }

    fn close(&mut self) {
        // Dropping the sender ends the worker loop, which closes the inner output.
        if self.frames.take().is_none() {
            return;
        }
        if self.pending && self.results.recv_timeout(self.timeout).is_err() {
            warn!("output worker still blocked in send, detaching it");
            self.worker.take();
            return;
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("output worker panicked");
            }
        }
    }
}

impl Drop for TimedOutput {
    fn drop(&mut self) {
        self.close();
    }
}
