//! The command channel between controller and worker.
//!
//! Both directions are `crossbeam_channel::bounded(1)` queues of encoded
//! frames, so at most one message is in flight each way. In thread mode the
//! worker thread owns the [`WorkerEnd`]; in process mode each side bridges
//! its far end to the child's stdin/stdout with [`spawn_line_reader`] and
//! [`spawn_line_writer`].

use std::io::{BufRead, BufReader, Read, Write};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::ipc_types::{decode_response, encode_command, Command, Frame, Response};
use crate::error::ModelError;

/// Create a connected pair of channel ends.
pub fn pair(reply_timeout: Option<Duration>) -> (ControllerEnd, WorkerEnd) {
    let (command_tx, command_rx) = crossbeam_channel::bounded(1);
    let (response_tx, response_rx) = crossbeam_channel::bounded(1);
    (
        ControllerEnd {
            commands: command_tx,
            responses: response_rx,
            reply_timeout,
            broken: None,
        },
        WorkerEnd {
            commands: command_rx,
            responses: response_tx,
        },
    )
}

/// Controller side: strict request/response.
#[derive(Debug)]
pub struct ControllerEnd {
    pub(crate) commands: Sender<Frame>,
    pub(crate) responses: Receiver<Frame>,
    reply_timeout: Option<Duration>,
    /// Set on the first channel fault; every later call fails fast.
    broken: Option<String>,
}

/// Worker side.
#[derive(Debug)]
pub struct WorkerEnd {
    pub commands: Receiver<Frame>,
    pub responses: Sender<Frame>,
}

impl ControllerEnd {
    /// Send one command and block until its response arrives.
    pub fn send(&mut self, command: &Command) -> Result<Response, ModelError> {
        self.send_frame(encode_command(command))
    }

    pub(crate) fn send_frame(&mut self, frame: Frame) -> Result<Response, ModelError> {
        self.post_frame(frame)?;
        let reply = match self.reply_timeout {
            Some(timeout) => self.responses.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => format!("no reply within {timeout:?}"),
                RecvTimeoutError::Disconnected => "worker closed the channel".to_string(),
            }),
            None => self
                .responses
                .recv()
                .map_err(|_| "worker closed the channel".to_string()),
        };
        let frame = reply.map_err(|reason| self.fault(reason))?;
        decode_response(&frame).map_err(|e| self.fault(format!("undecodable reply: {e}")))
    }

    /// Send a command that has no reply (`Terminate`).
    pub fn post(&mut self, command: &Command) -> Result<(), ModelError> {
        self.post_frame(encode_command(command))
    }

    fn post_frame(&mut self, frame: Frame) -> Result<(), ModelError> {
        if let Some(reason) = &self.broken {
            return Err(ModelError::WorkerUnavailable(reason.clone()));
        }
        self.commands
            .send(frame)
            .map_err(|_| self.fault("worker closed the channel".to_string()))
    }

    /// Post `Terminate` even over a broken channel, then drop the command
    /// sender. A worker still busy with a timed-out command picks up the
    /// `Terminate` (or the disconnect) at its next idle poll.
    pub fn hang_up(&mut self) {
        if let Err(e) = self.commands.try_send(encode_command(&Command::Terminate)) {
            log::debug!("[MODEL] Terminate not queued: {e}");
        }
        let (closed, _) = crossbeam_channel::bounded(0);
        drop(std::mem::replace(&mut self.commands, closed));
        self.broken.get_or_insert_with(|| "channel closed".to_string());
    }

    fn fault(&mut self, reason: String) -> ModelError {
        log::error!("[MODEL] Channel fault: {reason}");
        self.broken = Some(reason.clone());
        ModelError::WorkerUnavailable(reason)
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Extra sender for the process-exit fallback hook.
    pub(crate) fn command_sender(&self) -> Sender<Frame> {
        self.commands.clone()
    }
}

/// Forward lines read from `reader` into `tx` until EOF or the receiver is
/// dropped.
pub fn spawn_line_reader<R>(name: &str, reader: R, tx: Sender<Frame>) -> std::io::Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let tag = name.to_string();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if tx.send(l).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::debug!("[{tag}] Read error: {e}");
                    break;
                }
            }
        }
        log::debug!("[{tag}] Reader exiting");
    })
}

/// Write every frame from `rx` to `writer` as one flushed line.
pub fn spawn_line_writer<W>(name: &str, rx: Receiver<Frame>, mut writer: W) -> std::io::Result<thread::JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    let tag = name.to_string();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        while let Ok(frame) = rx.recv() {
            if writeln!(writer, "{frame}").is_err() || writer.flush().is_err() {
                log::debug!("[{tag}] Write failed, pipe closed");
                break;
            }
        }
        log::debug!("[{tag}] Writer exiting");
    })
}
