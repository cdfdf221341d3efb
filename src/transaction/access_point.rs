use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, trace, warn};

use super::{
    ClientSsm, Context, Result, ServerSsm, TransactionError, TransactionKey, TransactionState,
};
use crate::app::{Apdu, Application, ApplicationConfig};
use crate::device::DeviceDirectory;
use crate::network::Address;
use crate::timer::{Scheduler, TimerHandle, TimerQueue};
use crate::transport::Transport;

/// Everything the state machines reach outside themselves
#[derive(Debug)]
struct Collaborators<T, A, S, D> {
    config: ApplicationConfig,
    transport: T,
    application: A,
    scheduler: S,
    directory: D,
}

impl<T, A, S, D> Collaborators<T, A, S, D>
where
    T: Transport,
    A: Application,
    S: Scheduler,
    D: DeviceDirectory,
{
    fn context(&mut self) -> Context<'_> {
        Context {
            transport: &mut self.transport,
            application: &mut self.application,
            scheduler: &mut self.scheduler,
            directory: &self.directory,
            config: &self.config,
        }
    }
}

/// Entry point of the transaction layer
///
/// Owns the client and server transaction registries, allocates invoke IDs
/// and routes PDUs, application calls and timer expiries to the right state
/// machine. Finished transactions are removed before a call returns.
///
/// # Example
///
/// ```
/// use bacnet_tsm::app::{Apdu, ApplicationConfig, MaxApduSize, MaxSegments};
/// use bacnet_tsm::device::DeviceInfoCache;
/// use bacnet_tsm::network::Address;
/// use bacnet_tsm::timer::TimerQueue;
/// use bacnet_tsm::transaction::{StateMachineAccessPoint, TransactionState};
/// use bacnet_tsm::transport::BufferedTransport;
/// # use bacnet_tsm::app::Application;
/// # #[derive(Default)]
/// # struct Ignore;
/// # impl Application for Ignore {
/// #     fn indication(&mut self, _: Apdu, _: &Address) {}
/// #     fn confirmation(&mut self, _: Apdu, _: &Address) {}
/// # }
///
/// let mut sap = StateMachineAccessPoint::new(
///     ApplicationConfig::default(),
///     BufferedTransport::new(),
///     Ignore,
///     TimerQueue::new(),
///     DeviceInfoCache::new(),
/// )
/// .unwrap();
///
/// let read_property = Apdu::ConfirmedRequest {
///     segmented: false,
///     more_follows: false,
///     segmented_response_accepted: true,
///     max_segments: MaxSegments::Unspecified,
///     max_response_size: MaxApduSize::Up1476,
///     invoke_id: 0,
///     sequence_number: None,
///     proposed_window_size: None,
///     service_choice: 12,
///     service_data: vec![0x0C, 0x02, 0x00, 0x00, 0x01, 0x19, 0x55],
/// };
/// let peer = Address::LocalStation(vec![10, 0, 0, 2, 0xBA, 0xC0]);
/// let invoke_id = sap.submit_request(read_property, peer).unwrap().unwrap();
///
/// assert_eq!(sap.client_state(invoke_id), Some(TransactionState::AwaitConfirmation));
/// assert_eq!(sap.transport_mut().drain().len(), 1);
/// ```
#[derive(Debug)]
pub struct StateMachineAccessPoint<T, A, S, D> {
    collaborators: Collaborators<T, A, S, D>,
    clients: BTreeMap<u8, ClientSsm>,
    servers: BTreeMap<(Address, u8), ServerSsm>,
    next_invoke_id: u8,
}

impl<T, A, S, D> StateMachineAccessPoint<T, A, S, D>
where
    T: Transport,
    A: Application,
    S: Scheduler,
    D: DeviceDirectory,
{
    pub fn new(
        config: ApplicationConfig,
        transport: T,
        application: A,
        scheduler: S,
        directory: D,
    ) -> Result<Self> {
        config.validate()?;
        let next_invoke_id = config.invoke_id_start;
        Ok(Self {
            collaborators: Collaborators {
                config,
                transport,
                application,
                scheduler,
                directory,
            },
            clients: BTreeMap::new(),
            servers: BTreeMap::new(),
            next_invoke_id,
        })
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.collaborators.config
    }

    pub fn transport(&self) -> &T {
        &self.collaborators.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.collaborators.transport
    }

    pub fn application(&self) -> &A {
        &self.collaborators.application
    }

    pub fn application_mut(&mut self) -> &mut A {
        &mut self.collaborators.application
    }

    pub fn scheduler(&self) -> &S {
        &self.collaborators.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut S {
        &mut self.collaborators.scheduler
    }

    pub fn directory(&self) -> &D {
        &self.collaborators.directory
    }

    pub fn directory_mut(&mut self) -> &mut D {
        &mut self.collaborators.directory
    }

    /// Allocate the next invoke ID not used by an active client transaction
    pub fn next_invoke_id(&mut self) -> Result<u8> {
        let start = self.next_invoke_id;
        loop {
            let candidate = self.next_invoke_id;
            self.next_invoke_id = candidate.wrapping_add(1);
            if !self.clients.contains_key(&candidate) {
                return Ok(candidate);
            }
            if self.next_invoke_id == start {
                return Err(TransactionError::NoAvailableInvokeId);
            }
        }
    }

    /// Send a request from the local application
    ///
    /// Unconfirmed requests go straight to the transport and return `None`.
    /// Confirmed requests get a fresh invoke ID and a client transaction; the
    /// ID is returned so the caller can match the confirmation.
    pub fn submit_request(&mut self, mut apdu: Apdu, destination: Address) -> Result<Option<u8>> {
        match apdu {
            Apdu::UnconfirmedRequest { .. } => {
                trace!("unconfirmed request to {}", destination);
                self.collaborators.transport.send(&apdu, &destination);
                Ok(None)
            }
            Apdu::ConfirmedRequest { .. } => {
                let invoke_id = self.next_invoke_id()?;
                apdu.set_invoke_id(invoke_id);
                self.start_client(apdu, destination, invoke_id)?;
                Ok(Some(invoke_id))
            }
            other => Err(TransactionError::NotAConfirmedRequest(other.apdu_type())),
        }
    }

    /// Send a confirmed request under the invoke ID it already carries
    pub fn submit_request_with_id(&mut self, apdu: Apdu, destination: Address) -> Result<()> {
        let invoke_id = match &apdu {
            Apdu::ConfirmedRequest { invoke_id, .. } => *invoke_id,
            other => return Err(TransactionError::NotAConfirmedRequest(other.apdu_type())),
        };
        if self.clients.contains_key(&invoke_id) {
            return Err(TransactionError::InvokeIdInUse(invoke_id));
        }
        self.start_client(apdu, destination, invoke_id)
    }

    /// Answer a confirmed request previously indicated to the application
    pub fn submit_response(&mut self, apdu: Apdu, destination: Address) -> Result<()> {
        let invoke_id = match apdu.invoke_id() {
            Some(invoke_id) if !matches!(apdu, Apdu::ConfirmedRequest { .. }) => invoke_id,
            _ => {
                return Err(TransactionError::UnexpectedApdu {
                    kind: apdu.apdu_type(),
                    state: TransactionState::AwaitResponse,
                })
            }
        };

        let key = (destination, invoke_id);
        if !self.servers.contains_key(&key) {
            warn!(
                "no transaction for response {} to {}, dropped",
                invoke_id, key.0
            );
            return Ok(());
        }
        self.with_server(key, |server, ctx| server.on_response(ctx, apdu))
    }

    /// Abandon a pending confirmed request, telling the peer with an Abort
    ///
    /// Returns false when no transaction with `invoke_id` is active.
    pub fn cancel_request(&mut self, invoke_id: u8) -> Result<bool> {
        if !self.clients.contains_key(&invoke_id) {
            return Ok(false);
        }
        self.with_client(invoke_id, |client, ctx| client.cancel(ctx))?;
        Ok(true)
    }

    /// Decode and handle a datagram from the network layer
    ///
    /// Undecodable datagrams are logged and dropped.
    pub fn on_transport_pdu(&mut self, data: &[u8], source: Address) -> Result<()> {
        match Apdu::decode(data) {
            Ok(apdu) => self.on_apdu(apdu, source),
            Err(e) => {
                warn!("dropping undecodable APDU from {}: {}", source, e);
                trace!("undecodable APDU: {}", hex::encode(data));
                Ok(())
            }
        }
    }

    /// Route an APDU received from `source`
    pub fn on_apdu(&mut self, apdu: Apdu, source: Address) -> Result<()> {
        trace!("{:?} from {}", apdu.apdu_type(), source);
        match apdu {
            Apdu::ConfirmedRequest { invoke_id, .. } => {
                let key = (source, invoke_id);
                if !self.servers.contains_key(&key) {
                    debug!("new server transaction {} from {}", invoke_id, key.0);
                    self.servers
                        .insert(key.clone(), ServerSsm::new(key.0.clone(), invoke_id));
                }
                self.with_server(key, |server, ctx| server.on_network_pdu(ctx, apdu))
            }
            Apdu::UnconfirmedRequest { .. } => {
                self.collaborators.application.indication(apdu, &source);
                Ok(())
            }
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. } => self.route_to_client(invoke_id, apdu, source),
            Apdu::SegmentAck {
                server, invoke_id, ..
            }
            | Apdu::Abort {
                server, invoke_id, ..
            } => {
                if server {
                    self.route_to_client(invoke_id, apdu, source)
                } else {
                    self.route_to_server((source, invoke_id), apdu)
                }
            }
        }
    }

    /// Handle a timer expiry reported by the scheduler
    ///
    /// Handles that no longer belong to a live transaction are ignored.
    pub fn on_timeout(&mut self, handle: TimerHandle, key: TransactionKey) -> Result<()> {
        match key {
            TransactionKey::Client(invoke_id) => {
                self.with_client(invoke_id, |client, ctx| {
                    if client.take_expired_timer(handle) {
                        client.on_timeout(ctx)
                    } else {
                        debug!("stale timer {} for client {}", handle.id(), invoke_id);
                        Ok(())
                    }
                })
            }
            TransactionKey::Server(address, invoke_id) => {
                self.with_server((address, invoke_id), |server, ctx| {
                    if server.take_expired_timer(handle) {
                        server.on_timeout(ctx)
                    } else {
                        debug!("stale timer {} for server {}", handle.id(), invoke_id);
                        Ok(())
                    }
                })
            }
        }
    }

    pub fn client_state(&self, invoke_id: u8) -> Option<TransactionState> {
        self.clients.get(&invoke_id).map(ClientSsm::state)
    }

    pub fn server_state(&self, address: &Address, invoke_id: u8) -> Option<TransactionState> {
        self.servers
            .get(&(address.clone(), invoke_id))
            .map(ServerSsm::state)
    }

    pub fn client(&self, invoke_id: u8) -> Option<&ClientSsm> {
        self.clients.get(&invoke_id)
    }

    pub fn server(&self, address: &Address, invoke_id: u8) -> Option<&ServerSsm> {
        self.servers.get(&(address.clone(), invoke_id))
    }

    pub fn active_client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn active_server_count(&self) -> usize {
        self.servers.len()
    }

    fn start_client(&mut self, apdu: Apdu, destination: Address, invoke_id: u8) -> Result<()> {
        if !destination.is_station() {
            warn!(
                "confirmed request {} addressed to broadcast {}",
                invoke_id, destination
            );
        }
        debug!("new client transaction {} to {}", invoke_id, destination);
        self.clients
            .insert(invoke_id, ClientSsm::new(destination, invoke_id));
        self.with_client(invoke_id, |client, ctx| client.begin(ctx, apdu))
    }

    fn route_to_client(&mut self, invoke_id: u8, apdu: Apdu, source: Address) -> Result<()> {
        let Some(client) = self.clients.get(&invoke_id) else {
            debug!(
                "{:?} from {} for unknown invoke ID {}, dropped",
                apdu.apdu_type(),
                source,
                invoke_id
            );
            return Ok(());
        };
        if client.address() != &source {
            warn!(
                "{:?} for invoke ID {} came from {} but the request went to {}, dropped",
                apdu.apdu_type(),
                invoke_id,
                source,
                client.address()
            );
            return Ok(());
        }
        self.with_client(invoke_id, |client, ctx| client.on_network_pdu(ctx, apdu))
    }

    fn route_to_server(&mut self, key: (Address, u8), apdu: Apdu) -> Result<()> {
        if !self.servers.contains_key(&key) {
            debug!(
                "{:?} from {} for unknown invoke ID {}, dropped",
                apdu.apdu_type(),
                key.0,
                key.1
            );
            return Ok(());
        }
        self.with_server(key, |server, ctx| server.on_network_pdu(ctx, apdu))
    }

    /// Run `f` against a client machine, retiring it when it finishes
    fn with_client<F>(&mut self, invoke_id: u8, f: F) -> Result<()>
    where
        F: FnOnce(&mut ClientSsm, &mut Context<'_>) -> Result<()>,
    {
        let Some(client) = self.clients.get_mut(&invoke_id) else {
            return Ok(());
        };
        let mut ctx = self.collaborators.context();
        let result = f(client, &mut ctx);
        let state = client.state();
        if state.is_terminal() {
            debug!("client transaction {} finished {:?}", invoke_id, state);
            self.clients.remove(&invoke_id);
        } else if result.is_err() && state == TransactionState::Idle {
            client.discard(&mut ctx);
            self.clients.remove(&invoke_id);
        }
        result
    }

    /// Run `f` against a server machine, retiring it when it finishes
    fn with_server<F>(&mut self, key: (Address, u8), f: F) -> Result<()>
    where
        F: FnOnce(&mut ServerSsm, &mut Context<'_>) -> Result<()>,
    {
        let Some(server) = self.servers.get_mut(&key) else {
            return Ok(());
        };
        let mut ctx = self.collaborators.context();
        let result = f(server, &mut ctx);
        let state = server.state();
        if state.is_terminal() {
            debug!("server transaction {} from {} finished {:?}", key.1, key.0, state);
            self.servers.remove(&key);
        } else if result.is_err() && state == TransactionState::Idle {
            server.discard(&mut ctx);
            self.servers.remove(&key);
        }
        result
    }
}

impl<T, A, D> StateMachineAccessPoint<T, A, TimerQueue, D>
where
    T: Transport,
    A: Application,
    D: DeviceDirectory,
{
    /// Move the timer clock forward by `elapsed`, firing every timer that
    /// falls due in deadline order
    pub fn advance(&mut self, elapsed: Duration) -> Result<()> {
        let until = self.collaborators.scheduler.now() + elapsed;
        while let Some((handle, key)) = self.collaborators.scheduler.pop_expired(until) {
            self.on_timeout(handle, key)?;
        }
        self.collaborators.scheduler.set_now(until);
        Ok(())
    }

    /// Time until the earliest pending timer, `None` when nothing is pending
    pub fn time_to_next_timer(&self) -> Option<Duration> {
        let scheduler = &self.collaborators.scheduler;
        scheduler
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(scheduler.now()))
    }
}
