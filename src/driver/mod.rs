//! Async Driver
//!
//! Hosts one [`StateMachineAccessPoint`] on a tokio task. Inbound datagrams,
//! application commands and timer deadlines are all handled by that task, so
//! the state machines keep their run-to-completion model. The access point's
//! [`TimerQueue`] clock is tied to tokio time when the driver starts.
//!
//! Outgoing traffic and application events leave through the channel-backed
//! [`ChannelTransport`] and [`ChannelApplication`].

use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::app::{Apdu, Application};
use crate::device::DeviceDirectory;
use crate::network::Address;
use crate::timer::TimerQueue;
use crate::transaction::{Result, StateMachineAccessPoint};
use crate::transport::Transport;

/// A datagram with its peer address
pub type Datagram = (Vec<u8>, Address);

/// Work the application hands to the driver
#[derive(Debug)]
pub enum Command {
    /// Send a request; the reply carries the allocated invoke ID (`None` for
    /// unconfirmed requests)
    Request {
        apdu: Apdu,
        destination: Address,
        reply: oneshot::Sender<Result<Option<u8>>>,
    },
    /// Answer an indicated confirmed request
    Response { apdu: Apdu, destination: Address },
    /// Abandon an outstanding confirmed request
    Cancel(u8),
}

/// What the access point reports to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Indication(Apdu, Address),
    Confirmation(Apdu, Address),
}

/// Transport that encodes APDUs onto a channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<Datagram>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::UnboundedSender<Datagram>) -> Self {
        Self { sender }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, apdu: &Apdu, destination: &Address) {
        let data = apdu.encode();
        trace!("-> {} {}", destination, hex::encode(&data));
        if self.sender.send((data, destination.clone())).is_err() {
            warn!("outbound channel closed, dropping APDU to {}", destination);
        }
    }
}

/// Application adapter that forwards every event onto a channel
#[derive(Debug, Clone)]
pub struct ChannelApplication {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelApplication {
    pub fn new(sender: mpsc::UnboundedSender<Event>) -> Self {
        Self { sender }
    }

    fn forward(&self, event: Event) {
        if self.sender.send(event).is_err() {
            warn!("application channel closed, dropping event");
        }
    }
}

impl Application for ChannelApplication {
    fn indication(&mut self, apdu: Apdu, source: &Address) {
        self.forward(Event::Indication(apdu, source.clone()));
    }

    fn confirmation(&mut self, apdu: Apdu, source: &Address) {
        self.forward(Event::Confirmation(apdu, source.clone()));
    }
}

/// Event loop around an access point
#[derive(Debug)]
pub struct Driver<T, A, D> {
    sap: StateMachineAccessPoint<T, A, TimerQueue, D>,
    inbound: mpsc::Receiver<Datagram>,
    commands: mpsc::Receiver<Command>,
}

impl<T, A, D> Driver<T, A, D>
where
    T: Transport,
    A: Application,
    D: DeviceDirectory,
{
    pub fn new(
        sap: StateMachineAccessPoint<T, A, TimerQueue, D>,
        inbound: mpsc::Receiver<Datagram>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            sap,
            inbound,
            commands,
        }
    }

    /// Run until either channel is closed, then hand the access point back
    pub async fn run(self) -> StateMachineAccessPoint<T, A, TimerQueue, D> {
        let Driver {
            mut sap,
            mut inbound,
            mut commands,
        } = self;
        let started = Instant::now();
        let offset = sap.scheduler().now();

        loop {
            sync_clock(&mut sap, offset + started.elapsed());
            let next_timer = sap.time_to_next_timer();

            tokio::select! {
                datagram = inbound.recv() => {
                    let Some((data, source)) = datagram else {
                        debug!("inbound channel closed, stopping driver");
                        break;
                    };
                    trace!("<- {} {}", source, hex::encode(&data));
                    sync_clock(&mut sap, offset + started.elapsed());
                    if let Err(e) = sap.on_transport_pdu(&data, source) {
                        warn!("failed to handle inbound APDU: {}", e);
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("command channel closed, stopping driver");
                        break;
                    };
                    sync_clock(&mut sap, offset + started.elapsed());
                    execute(&mut sap, command);
                }
                _ = sleep_until_due(next_timer) => {}
            }
        }

        sap
    }
}

fn execute<T, A, D>(sap: &mut StateMachineAccessPoint<T, A, TimerQueue, D>, command: Command)
where
    T: Transport,
    A: Application,
    D: DeviceDirectory,
{
    match command {
        Command::Request {
            apdu,
            destination,
            reply,
        } => {
            let result = sap.submit_request(apdu, destination);
            if let Err(e) = &result {
                warn!("request refused: {}", e);
            }
            // the caller may have stopped waiting
            let _ = reply.send(result);
        }
        Command::Response { apdu, destination } => {
            if let Err(e) = sap.submit_response(apdu, destination) {
                warn!("response refused: {}", e);
            }
        }
        Command::Cancel(invoke_id) => match sap.cancel_request(invoke_id) {
            Ok(true) => debug!("cancelled request {}", invoke_id),
            Ok(false) => debug!("no request {} to cancel", invoke_id),
            Err(e) => warn!("cancel of {} failed: {}", invoke_id, e),
        },
    }
}

/// Catch the timer queue up with wall-clock time, firing what fell due
fn sync_clock<T, A, D>(sap: &mut StateMachineAccessPoint<T, A, TimerQueue, D>, now: Duration)
where
    T: Transport,
    A: Application,
    D: DeviceDirectory,
{
    let elapsed = now.saturating_sub(sap.scheduler().now());
    if let Err(e) = sap.advance(elapsed) {
        warn!("timer handling failed: {}", e);
    }
}

async fn sleep_until_due(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
