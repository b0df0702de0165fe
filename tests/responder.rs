//! End-to-end tests: frames are pushed through a mock UART into the
//! interrupt service, a responder task blocks on the driver, and the
//! emitted responses are captured off the mock transmit path.

mod mock;

use dmx_bus::consts::{PREAMBLE_BYTE, SEPARATOR_BYTE};
use dmx_bus::pids;
use dmx_bus::rdm_data::{
    deserialize_discovery_response, RdmData, RdmRequestData, RdmResponseData,
};
use dmx_bus::responder::{RdmAnswer, ResponderEngine, RdmResponderConfig};
use dmx_bus::types::{DataPack, DmxError, ResponseType};
use dmx_bus::unique_identifier::{PacketAddress, UniqueIdentifier};
use dmx_bus::command_class::RequestCommandClass;

use mock::install_driver;

fn device_uid() -> UniqueIdentifier {
    // Derived from MockPlatform::mac_address with the default 0x7FF0
    // manufacturer id.
    UniqueIdentifier::new(0x7FF0, 0x3344_5566).unwrap()
}

fn get_request(pid: u16, parameter_data: &[u8]) -> RdmRequestData {
    RdmRequestData {
        destination_uid: PacketAddress::Device(device_uid()),
        source_uid: UniqueIdentifier::new(0x0102, 0x0304_0506).unwrap(),
        transaction_number: 1,
        port_id: 1,
        message_count: 0,
        sub_device: 0,
        command_class: RequestCommandClass::GetCommand,
        parameter_id: pid,
        parameter_data: DataPack::from_slice(parameter_data).unwrap(),
    }
}

/// Runs a responder task against injected request frames and returns the
/// responses taken from the wire.
fn run_request_response(requests: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let (driver, bus, timer) = install_driver();
    let mut engine: ResponderEngine<mock::MemNvs, 16, 8> = ResponderEngine::new(
        mock::MemNvs::default(),
        &RdmResponderConfig {
            device_model_id: 0x1234,
            product_category: 0x0508,
            software_version_id: 0x0001_0002,
            dmx_footprint: 4,
            dmx_start_address: 101,
            ..Default::default()
        },
    );
    engine.register_device_label("factory label");
    let uid = driver.uid();

    let mut responses = Vec::new();

    std::thread::scope(|scope| {
        let driver = &driver;
        let request_count = requests.len();
        let worker_bus = bus.clone();

        let worker = scope.spawn(move || {
            let mut collected = Vec::new();

            for _ in 0..request_count {
                let mut frame = [0u8; 513];
                let received = driver.receive(&mut frame, 2_000).unwrap();

                let event = RdmData::deserialize(&frame[..received.size]).unwrap();
                assert!(event.checksum_is_valid);
                let request = match event.data {
                    RdmData::Request(request) => request,
                    RdmData::Response(_) => panic!("expected a request"),
                };

                match engine.handle_rdm_request(&request, uid) {
                    RdmAnswer::Response(response) => {
                        let packet = RdmData::Response(response).serialize();
                        driver.send(&packet).unwrap();
                        driver.wait_sent(1_000).unwrap();
                    },
                    RdmAnswer::DiscoveryResponse(uid) => {
                        let packet = dmx_bus::rdm_data::serialize_discovery_response(uid);
                        driver.send_without_break(&packet).unwrap();
                        driver.wait_sent(1_000).unwrap();
                    },
                    _ => {},
                }

                collected.push(worker_bus.take_tx());
            }

            collected
        });

        for request in requests {
            mock::wait_for_waiter(&bus);
            mock::inject_break(driver, &bus);
            mock::inject_bytes(driver, &bus, request);
            mock::pump_transmit(driver, &bus, &timer);
        }

        responses = worker.join().unwrap();
    });

    responses
}

#[test]
fn test_get_device_info_over_the_wire() {
    let request = RdmData::Request(get_request(pids::DEVICE_INFO, &[])).serialize();
    let responses = run_request_response(&[request.to_vec()]);

    let event = RdmData::deserialize(&responses[0]).unwrap();
    assert!(event.checksum_is_valid);
    let response = match event.data {
        RdmData::Response(response) => response,
        _ => panic!("expected a response"),
    };

    assert_eq!(response.response_type, ResponseType::Ack);
    assert_eq!(response.parameter_id, pids::DEVICE_INFO);
    assert_eq!(response.destination_uid, PacketAddress::Device(get_request(0, &[]).source_uid));
    assert_eq!(response.source_uid, device_uid());

    // 19-byte PDL: protocol version, model, category, software version,
    // footprint, personalities, start address, sub devices, sensors.
    assert_eq!(response.parameter_data.len(), 19);
    assert_eq!(&response.parameter_data[..2], &[0x01, 0x00]);
    assert_eq!(&response.parameter_data[2..4], &[0x12, 0x34]);
    assert_eq!(&response.parameter_data[4..6], &[0x05, 0x08]);
    assert_eq!(&response.parameter_data[6..10], &[0x00, 0x01, 0x00, 0x02]);
    assert_eq!(&response.parameter_data[10..12], &[0x00, 0x04]);
    assert_eq!(&response.parameter_data[12..14], &[0x01, 0x01]);
    assert_eq!(&response.parameter_data[14..16], &[0x00, 0x65]);
    assert_eq!(&response.parameter_data[16..], &[0x00, 0x00, 0x00]);
}

#[test]
fn test_set_then_get_device_label_over_the_wire() {
    let mut set = get_request(pids::DEVICE_LABEL, b"Hello");
    set.command_class = RequestCommandClass::SetCommand;
    let get = get_request(pids::DEVICE_LABEL, &[]);

    let responses = run_request_response(&[
            RdmData::Request(set).serialize().to_vec(),
            RdmData::Request(get).serialize().to_vec(),
        ],
    );

    let set_response = parse_response(&responses[0]);
    assert_eq!(set_response.response_type, ResponseType::Ack);
    assert!(set_response.parameter_data.is_empty());
    // The SET queued a change notification.
    assert_eq!(set_response.message_count, 1);

    let get_response = parse_response(&responses[1]);
    assert_eq!(get_response.response_type, ResponseType::Ack);
    assert_eq!(get_response.parameter_data.as_slice(), b"Hello");
}

#[test]
fn test_discovery_response_over_the_wire() {
    let mut bounds = [0u8; 12];
    bounds[..6].copy_from_slice(&UniqueIdentifier::new(0, 1).unwrap().to_bytes());
    bounds[6..].copy_from_slice(
        &UniqueIdentifier::try_from(dmx_bus::consts::RDM_MAX_UID)
            .unwrap()
            .to_bytes(),
    );

    let mut disc = get_request(pids::DISC_UNIQUE_BRANCH, &bounds);
    disc.destination_uid = PacketAddress::Broadcast;
    disc.command_class = RequestCommandClass::DiscoveryCommand;

    let responses = run_request_response(&[RdmData::Request(disc).serialize().to_vec()]);

    let wire = &responses[0];
    assert_eq!(wire.len(), 24);
    assert_eq!(&wire[..7], &[PREAMBLE_BYTE; 7]);
    assert_eq!(wire[7], SEPARATOR_BYTE);

    let decoded = deserialize_discovery_response(wire).unwrap();
    assert!(decoded.checksum_is_valid);
    assert_eq!(decoded.uid, device_uid());
}

#[test]
fn test_corrupt_checksum_yields_no_response() {
    let (driver, bus, _timer) = install_driver();

    let mut packet = RdmData::Request(get_request(pids::DEVICE_INFO, &[]))
        .serialize()
        .to_vec();
    let last = packet.len() - 1;
    packet[last] = packet[last].wrapping_add(1);

    std::thread::scope(|scope| {
        let driver = &driver;
        let worker = scope.spawn(move || {
            let mut frame = [0u8; 513];
            let received = driver.receive(&mut frame, 2_000).unwrap();

            let event = RdmData::deserialize(&frame[..received.size]).unwrap();
            // The packet parses but fails its checksum; it is dropped
            // before dispatch and nothing is transmitted.
            assert!(!event.checksum_is_valid);
        });

        mock::wait_for_waiter(&bus);
        mock::inject_break(driver, &bus);
        mock::inject_bytes(driver, &bus, &packet);
        worker.join().unwrap();
    });

    assert!(bus.take_tx().is_empty());
}

#[test]
fn test_receive_times_out_without_traffic() {
    let (driver, _bus, _timer) = install_driver();

    let mut buffer = [0u8; 513];
    match driver.receive(&mut buffer, 25) {
        Err(DmxError::Timeout) => {},
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[test]
fn test_poll_dispatches_and_answers_on_the_wire() {
    use dmx_bus::responder::{PollEvent, RdmHandled, RdmResponder};

    let (driver, bus, timer) = install_driver();

    let mut responder: RdmResponder<'_, mock::MockPlatform, 16, 8> = RdmResponder::new(
        &driver,
        mock::MemNvs::default(),
        &RdmResponderConfig {
            device_model_id: 0x1234,
            ..Default::default()
        },
    );
    assert!(responder.register_device_label("fixture"));

    let request = RdmData::Request(get_request(pids::DEVICE_INFO, &[])).serialize();
    let mut dmx_frame = vec![0x00u8; 32];
    dmx_frame[1] = 0xAB;

    std::thread::scope(|scope| {
        let driver = &driver;
        let worker = scope.spawn(move || {
            // First an RDM request, answered on the wire, then a plain DMX
            // frame handed back to the caller.
            match responder.poll(2_000).unwrap() {
                PollEvent::Rdm(RdmHandled::Responded(pid)) => {
                    assert_eq!(pid, pids::DEVICE_INFO)
                },
                _ => panic!("expected a handled rdm request"),
            }

            match responder.poll(2_000).unwrap() {
                PollEvent::Dmx(frame) => {
                    assert_eq!(frame.len(), 32);
                    assert_eq!(frame[1], 0xAB);
                },
                _ => panic!("expected a dmx frame"),
            }
        });

        mock::wait_for_waiter(&bus);
        mock::inject_break(driver, &bus);
        mock::inject_bytes(driver, &bus, &request);
        mock::pump_transmit(driver, &bus, &timer);

        mock::wait_for_waiter(&bus);
        mock::inject_break(driver, &bus);
        mock::inject_bytes(driver, &bus, &dmx_frame);
        // The frame ends on the following break.
        mock::inject_break(driver, &bus);

        worker.join().unwrap();
    });

    let response = parse_response(&bus.take_tx());
    assert_eq!(response.response_type, ResponseType::Ack);
    assert_eq!(response.parameter_id, pids::DEVICE_INFO);
    assert_eq!(response.parameter_data.len(), 19);
}

fn parse_response(wire: &[u8]) -> RdmResponseData {
    match RdmData::deserialize(wire).unwrap().data {
        RdmData::Response(response) => response,
        _ => panic!("expected a response"),
    }
}
