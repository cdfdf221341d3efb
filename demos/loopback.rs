//! Segmented Loopback Example
//!
//! Two access points wired back to back in memory. The client sends a large
//! confirmed request that has to be segmented; the server answers with an
//! equally large ComplexACK. Run with `RUST_LOG=debug` to watch the windows.

use bacnet_tsm::{
    app::{Apdu, Application, ApplicationConfig, MaxApduSize, MaxSegments},
    device::{DeviceInfo, DeviceInfoCache, Segmentation},
    network::Address,
    timer::TimerQueue,
    transaction::StateMachineAccessPoint,
    transport::BufferedTransport,
};

#[derive(Default)]
struct Inbox {
    indications: Vec<(Apdu, Address)>,
    confirmations: Vec<(Apdu, Address)>,
}

impl Application for Inbox {
    fn indication(&mut self, apdu: Apdu, source: &Address) {
        self.indications.push((apdu, source.clone()));
    }

    fn confirmation(&mut self, apdu: Apdu, source: &Address) {
        self.confirmations.push((apdu, source.clone()));
    }
}

type Sap = StateMachineAccessPoint<BufferedTransport, Inbox, TimerQueue, DeviceInfoCache>;

fn access_point(peer: Address) -> Result<Sap, Box<dyn std::error::Error>> {
    let mut directory = DeviceInfoCache::new();
    directory.update(
        DeviceInfo::new(peer)
            .with_segmentation(Segmentation::Both)
            .with_max_apdu_length(480)
            .with_max_segments(Some(64)),
    );
    Ok(StateMachineAccessPoint::new(
        ApplicationConfig::default(),
        BufferedTransport::new(),
        Inbox::default(),
        TimerQueue::new(),
        directory,
    )?)
}

/// Deliver queued datagrams in both directions until the wire is quiet
fn pump(
    client: &mut Sap,
    client_addr: &Address,
    server: &mut Sap,
    server_addr: &Address,
) -> Result<usize, Box<dyn std::error::Error>> {
    let mut delivered = 0;
    loop {
        let to_server = client.transport_mut().drain();
        let to_client = server.transport_mut().drain();
        if to_server.is_empty() && to_client.is_empty() {
            return Ok(delivered);
        }
        for (data, _) in to_server {
            delivered += 1;
            server.on_transport_pdu(&data, client_addr.clone())?;
        }
        for (data, _) in to_client {
            delivered += 1;
            client.on_transport_pdu(&data, server_addr.clone())?;
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("BACnet Segmented Loopback Example");
    println!("=================================\n");

    let client_addr = Address::from("192.168.1.10:47808".parse::<std::net::SocketAddr>()?);
    let server_addr = Address::from("192.168.1.20:47808".parse::<std::net::SocketAddr>()?);
    let mut client = access_point(server_addr.clone())?;
    let mut server = access_point(client_addr.clone())?;

    let request = Apdu::ConfirmedRequest {
        segmented: false,
        more_follows: false,
        segmented_response_accepted: true,
        max_segments: MaxSegments::Unspecified,
        max_response_size: MaxApduSize::Up1476,
        invoke_id: 0,
        sequence_number: None,
        proposed_window_size: None,
        service_choice: 14,
        service_data: vec![0xA5; 3000],
    };

    let invoke_id = client
        .submit_request(request, server_addr.clone())?
        .ok_or("confirmed request was not assigned an invoke ID")?;
    if let Some(transaction) = client.client(invoke_id) {
        println!(
            "Request {}: {} segments of {} octets",
            invoke_id,
            transaction.ssm().segment_count(),
            transaction.ssm().segment_size()
        );
    }

    let delivered = pump(&mut client, &client_addr, &mut server, &server_addr)?;
    println!("Request delivered in {} datagrams", delivered);

    let (indication, source) = server
        .application_mut()
        .indications
        .pop()
        .ok_or("server saw no request")?;
    println!(
        "Server received {} octets from {}",
        indication.service_data().len(),
        source
    );

    server.submit_response(
        Apdu::ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: 14,
            service_data: vec![0x5A; 5000],
        },
        source,
    )?;
    let delivered = pump(&mut client, &client_addr, &mut server, &server_addr)?;
    println!("Response delivered in {} datagrams", delivered);

    for (confirmation, source) in &client.application().confirmations {
        println!(
            "Client got {:?} with {} octets from {}",
            confirmation.apdu_type(),
            confirmation.service_data().len(),
            source
        );
    }
    println!(
        "Open transactions: {} client, {} server",
        client.active_client_count(),
        server.active_server_count()
    );

    Ok(())
}
