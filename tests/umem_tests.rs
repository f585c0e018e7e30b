#[allow(dead_code)]
mod setup;

use serial_test::serial;
use setup::SocketConfigBuilder;

use std::sync::Arc;

use xsk_core::{
    config::{FrameSize, SockAddrXdp, UmemConfig},
    Caps, Error, Socket, UmemRegion,
};

#[test]
fn a_socket_registers_at_most_one_umem() {
    let socket = Socket::new(Caps::NET_RAW).unwrap();

    let mem = UmemRegion::new(8 * 2048, false).unwrap();
    socket.umem_reg(mem, &UmemConfig::default()).unwrap();

    let mem = UmemRegion::new(8 * 2048, false).unwrap();
    assert_eq!(
        socket.umem_reg(mem, &UmemConfig::default()).unwrap_err(),
        Error::AlreadyRegistered
    );
}

#[test]
fn umem_rings_require_a_registered_umem() {
    let socket = Socket::new(Caps::NET_RAW).unwrap();

    assert_eq!(socket.umem_fill_ring(4).unwrap_err(), Error::InvalidState);
    assert_eq!(
        socket.umem_completion_ring(4).unwrap_err(),
        Error::InvalidState
    );

    let mem = UmemRegion::new(8 * 2048, false).unwrap();
    socket.umem_reg(mem, &UmemConfig::default()).unwrap();

    socket.umem_fill_ring(4).unwrap();
    socket.umem_completion_ring(4).unwrap();

    // Attach exactly once each.
    assert_eq!(socket.umem_fill_ring(8).unwrap_err(), Error::InvalidArgument);
    assert_eq!(
        socket.umem_completion_ring(8).unwrap_err(),
        Error::InvalidArgument
    );
}

#[test]
fn ring_sizes_must_be_powers_of_two() {
    let socket = Socket::new(Caps::NET_RAW).unwrap();

    let mem = UmemRegion::new(8 * 2048, false).unwrap();
    socket.umem_reg(mem, &UmemConfig::default()).unwrap();

    assert_eq!(socket.rx_ring(0).unwrap_err(), Error::InvalidCapacity);
    assert_eq!(socket.tx_ring(3).unwrap_err(), Error::InvalidCapacity);
    assert_eq!(socket.umem_fill_ring(5).unwrap_err(), Error::InvalidCapacity);
    assert_eq!(
        socket.umem_completion_ring(6).unwrap_err(),
        Error::InvalidCapacity
    );
}

#[test]
fn mixed_ring_sizes_are_accepted() {
    let (_dev, _capture) = setup::capturing_device(260, setup::MTU, 1);

    // Any power of two is fine per ring, independent of the others.
    let socket = SocketConfigBuilder {
        fill_queue_size: 1,
        comp_queue_size: 64,
        rx_queue_size: 2,
        tx_queue_size: 16,
        ..SocketConfigBuilder::default()
    }
    .build();

    socket.bind(&SockAddrXdp::new(260, 0)).unwrap();
}

#[test]
fn headroom_must_fit_in_a_frame() {
    let frame_size = FrameSize::new(2048).unwrap();

    assert_eq!(
        UmemConfig::new(frame_size, 2048).unwrap_err(),
        Error::InvalidGeometry
    );
    assert!(UmemConfig::new(frame_size, 2047).is_ok());
}

#[test]
#[serial]
fn umem_refcount_tracks_its_holders() {
    let (_dev, _capture) = setup::capturing_device(261, setup::MTU, 2);

    let owner = setup::build_socket();
    owner.bind(&SockAddrXdp::new(261, 1)).unwrap();

    let umem = owner.umem().unwrap();
    let weak = Arc::downgrade(&umem);
    let base = Arc::strong_count(&umem);

    {
        let sharer = Socket::new(Caps::NET_RAW).unwrap();
        sharer.tx_ring(4).unwrap();
        sharer
            .bind(&SockAddrXdp::shared(261, 1, owner.id()))
            .unwrap();

        // One more socket, two more handles (config and data path).
        assert_eq!(Arc::strong_count(&umem), base + 2);
    }

    // The sharer's handles went away with it.
    assert_eq!(Arc::strong_count(&umem), base);

    drop(owner);
    drop(umem);

    // The last holder released the frame region exactly once.
    assert!(weak.upgrade().is_none());
}
