use std::thread;

use integration_tests::{sdo_server::SimSdoServer, sim_bus::SimBus};
use sdolink_client::{
    ConfigError, SdoClient, SdoClientConfig, SdoClientError, SharedPort, TransferMode,
};

mod utils;
use utils::{abort_bytes, fast_config, requests, setup, test_data};

#[test]
fn test_cancel() {
    let data = test_data(50);
    let server = SimSdoServer::new(6).with_object(0x4000, 0, &data);
    let (mut client, bus, server) = setup(server, fast_config());

    // Cancel once the first segment has been requested, as another thread would
    let cancel = client.cancel_handle();
    let mut fired = false;
    bus.add_responder(Box::new(move |msg| {
        if !fired && msg.data[0] == 0x60 {
            fired = true;
            cancel.cancel();
        }
        Vec::new()
    }));

    assert_eq!(Err(SdoClientError::Cancelled), client.upload(6, 0x4000, 0));
    assert!(client.cancel_handle().is_cancelled());
    assert_eq!(
        abort_bytes(0x4000, 0, 0x0800_0000),
        requests(&bus, 6).last().unwrap().data
    );
    assert_eq!(
        Some((0x4000, 0, 0x0800_0000)),
        server.lock().unwrap().last_abort()
    );

    // The next transfer starts with the flag cleared
    assert_eq!(data, client.upload(6, 0x4000, 0).unwrap());
    assert!(!client.cancel_handle().is_cancelled());
}

#[test]
fn test_mode_selection() {
    let config = SdoClientConfig {
        prefer_block: true,
        block_threshold: 64,
        ..fast_config()
    };
    let server = SimSdoServer::new(6).with_object(0x4000, 0, &test_data(100));
    let (mut client, bus, _server) = setup(server, config);

    assert_eq!(TransferMode::Block, client.upload_mode());
    assert_eq!(TransferMode::Segmented, client.download_mode(0));
    assert_eq!(TransferMode::Expedited, client.download_mode(4));
    assert_eq!(TransferMode::Segmented, client.download_mode(63));
    assert_eq!(TransferMode::Block, client.download_mode(64));

    let last_request = |bus: &SimBus| requests(bus, 6).last().map(|msg| msg.data);

    client.download(6, 0x4001, 0, &test_data(100)).unwrap();
    let reqs = requests(&bus, 6);
    assert_eq!(0xC6, reqs[0].data[0]);

    let before = requests(&bus, 6).len();
    client.download(6, 0x4001, 0, &test_data(10)).unwrap();
    assert_eq!(0x21, requests(&bus, 6)[before].data[0]);

    let before = requests(&bus, 6).len();
    client.download(6, 0x4001, 0, &[1, 2, 3]).unwrap();
    assert_eq!(0x27, requests(&bus, 6)[before].data[0]);
    assert_eq!(Some([0x27, 0x01, 0x40, 0x00, 1, 2, 3, 0]), last_request(&bus));

    let before = requests(&bus, 6).len();
    client.upload(6, 0x4000, 0).unwrap();
    assert_eq!(0xA4, requests(&bus, 6)[before].data[0]);
}

#[test]
fn test_default_mode_selection() {
    let server = SimSdoServer::new(6).with_object(0x4000, 0, &test_data(100));
    let (mut client, bus, _server) = setup(server, fast_config());
    assert_eq!(TransferMode::Segmented, client.upload_mode());
    assert_eq!(TransferMode::Segmented, client.download_mode(100));

    client.download(6, 0x4001, 0, &test_data(100)).unwrap();
    assert_eq!(0x21, requests(&bus, 6)[0].data[0]);

    let before = requests(&bus, 6).len();
    client.upload(6, 0x4000, 0).unwrap();
    assert_eq!(0x40, requests(&bus, 6)[before].data[0]);
}

#[test]
fn test_config_from_toml() {
    let config = SdoClientConfig::load_from_str(
        r#"
        timeout_ms = 20
        retries = 1
        poll_interval_us = 100
        block_size = 8
        prefer_block = true
        block_threshold = 16
        "#,
    )
    .unwrap();
    let data = test_data(200);
    let server = SimSdoServer::new(6).with_object(0x4000, 0, &data);
    let (mut client, bus, _server) = setup(server, config);
    assert_eq!(8, client.config().block_size);

    assert_eq!(data, client.upload(6, 0x4000, 0).unwrap());
    let reqs = requests(&bus, 6);
    // Requested block size and protocol switch threshold
    assert_eq!([0xA4, 0x00, 0x40, 0x00, 8, 16, 0, 0], reqs[0].data);
}

#[test]
fn test_invalid_config_is_rejected() {
    let bus = SimBus::new();
    let port = bus.new_port();
    let config = SdoClientConfig {
        block_size: 0,
        ..fast_config()
    };
    let result = SdoClient::new(port.clone(), port).with_config(config);
    assert!(matches!(
        result,
        Err(ConfigError::InvalidValue {
            field: "block_size",
            ..
        })
    ));
}

#[test]
fn test_explicit_modes() {
    let data = test_data(40);
    let server = SimSdoServer::new(6).with_object(0x4000, 0, &data);
    let (mut client, _bus, server) = setup(server, fast_config());

    assert_eq!(data, client.upload_segmented(6, 0x4000, 0).unwrap());
    assert_eq!(data, client.upload_block(6, 0x4000, 0).unwrap());

    client.download_expedited(6, 0x4001, 0, &[9]).unwrap();
    client.download_segmented(6, 0x4002, 0, &data).unwrap();
    client.download_block(6, 0x4003, 0, &data).unwrap();
    // Small objects may still be written with a segmented download
    client.download_segmented(6, 0x4004, 0, &[1, 2]).unwrap();

    let server = server.lock().unwrap();
    assert_eq!(Some(&[9][..]), server.object(0x4001, 0));
    assert_eq!(Some(&data[..]), server.object(0x4002, 0));
    assert_eq!(Some(&data[..]), server.object(0x4003, 0));
    assert_eq!(Some(&[1, 2][..]), server.object(0x4004, 0));
}

#[test]
fn test_shared_port_with_threads() {
    let bus = SimBus::new();
    let server_a = SimSdoServer::new(10).attach(&bus);
    let server_b = SimSdoServer::new(11).attach(&bus);
    let port = bus.new_port();
    let shared = SharedPort::new(port.clone(), port);

    let config = SdoClientConfig {
        timeout_ms: 1000,
        ..Default::default()
    };
    let mut handles = Vec::new();
    for node_id in [10u8, 11] {
        let mut client = SdoClient::new(shared.sender(), shared.channel())
            .with_config(config.clone())
            .unwrap();
        handles.push(thread::spawn(move || {
            for i in 0..20u16 {
                let data = test_data(i as usize * 3 + node_id as usize);
                client.download(node_id, 0x5000 + i, 0, &data).unwrap();
                assert_eq!(data, client.upload(node_id, 0x5000 + i, 0).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(Some(&test_data(10)[..]), server_a.lock().unwrap().object(0x5000, 0));
    assert_eq!(Some(&test_data(11)[..]), server_b.lock().unwrap().object(0x5000, 0));
}
