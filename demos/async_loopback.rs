//! Async Driver Example
//!
//! Runs a client and a server access point on their own driver tasks and
//! connects their channels, so segmented traffic flows with real timers.
//! Requires the `async` feature.

use bacnet_tsm::{
    app::{Apdu, ApplicationConfig, MaxApduSize, MaxSegments},
    device::{DeviceInfo, DeviceInfoCache, Segmentation},
    driver::{ChannelApplication, ChannelTransport, Command, Datagram, Driver, Event},
    network::Address,
    timer::TimerQueue,
    transaction::StateMachineAccessPoint,
};
use tokio::sync::{mpsc, oneshot};

struct Endpoint {
    commands: mpsc::Sender<Command>,
    inbound: mpsc::Sender<Datagram>,
    outbound: mpsc::UnboundedReceiver<Datagram>,
    events: mpsc::UnboundedReceiver<Event>,
}

fn start(peer: Address) -> Result<Endpoint, Box<dyn std::error::Error>> {
    let (out_tx, outbound) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let (inbound, in_rx) = mpsc::channel(64);
    let (commands, cmd_rx) = mpsc::channel(8);

    let mut directory = DeviceInfoCache::new();
    directory.update(
        DeviceInfo::new(peer)
            .with_segmentation(Segmentation::Both)
            .with_max_apdu_length(480),
    );
    let sap = StateMachineAccessPoint::new(
        ApplicationConfig::default(),
        ChannelTransport::new(out_tx),
        ChannelApplication::new(event_tx),
        TimerQueue::new(),
        directory,
    )?;
    tokio::spawn(Driver::new(sap, in_rx, cmd_rx).run());

    Ok(Endpoint {
        commands,
        inbound,
        outbound,
        events,
    })
}

/// Forward everything `from` sends to `to`, presenting it as coming from `source`
fn wire(
    mut outbound: mpsc::UnboundedReceiver<Datagram>,
    to: mpsc::Sender<Datagram>,
    source: Address,
) {
    tokio::spawn(async move {
        while let Some((data, _)) = outbound.recv().await {
            if to.send((data, source.clone())).await.is_err() {
                break;
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("BACnet Async Driver Example");
    println!("===========================\n");

    let client_addr = Address::LocalStation(vec![10, 0, 0, 1, 0xBA, 0xC0]);
    let server_addr = Address::LocalStation(vec![10, 0, 0, 2, 0xBA, 0xC0]);

    let client = start(server_addr.clone())?;
    let mut server = start(client_addr.clone())?;
    wire(client.outbound, server.inbound.clone(), client_addr.clone());
    wire(server.outbound, client.inbound.clone(), server_addr.clone());
    let mut client_events = client.events;

    let (reply, invoke_id) = oneshot::channel();
    client
        .commands
        .send(Command::Request {
            apdu: Apdu::ConfirmedRequest {
                segmented: false,
                more_follows: false,
                segmented_response_accepted: true,
                max_segments: MaxSegments::Unspecified,
                max_response_size: MaxApduSize::Up1476,
                invoke_id: 0,
                sequence_number: None,
                proposed_window_size: None,
                service_choice: 15,
                service_data: vec![0x11; 2000],
            },
            destination: server_addr.clone(),
            reply,
        })
        .await?;
    let invoke_id = invoke_id.await??.ok_or("no invoke ID assigned")?;
    println!("Sent request {}", invoke_id);

    if let Some(Event::Indication(request, source)) = server.events.recv().await {
        println!(
            "Server got {} octets from {}, acknowledging",
            request.service_data().len(),
            source
        );
        server
            .commands
            .send(Command::Response {
                apdu: Apdu::SimpleAck {
                    invoke_id,
                    service_choice: 15,
                },
                destination: source,
            })
            .await?;
    }

    if let Some(Event::Confirmation(apdu, source)) = client_events.recv().await {
        println!("Client got {:?} from {}", apdu.apdu_type(), source);
    }

    Ok(())
}
