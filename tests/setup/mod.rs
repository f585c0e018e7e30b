use std::sync::{Arc, Mutex};

use xsk_core::{
    config::{FrameSize, UmemConfig},
    dev::{self, Driver, NetDevice, TxFrame, TxVerdict},
    Caps, Socket, UmemRegion,
};

pub const FRAME_SIZE: u32 = 2048;
pub const MTU: u32 = 1500;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn generate_random_bytes(len: u32) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

/// A driver that records every payload it accepts and answers with a
/// configurable verdict.
#[derive(Clone)]
pub struct Capture {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    verdict: Arc<Mutex<TxVerdict>>,
}

impl Capture {
    pub fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(Vec::new())),
            verdict: Arc::new(Mutex::new(TxVerdict::Sent)),
        }
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn set_verdict(&self, verdict: TxVerdict) {
        *self.verdict.lock().unwrap() = verdict;
    }
}

impl Driver for Capture {
    fn direct_xmit(&self, frame: TxFrame, _queue_id: u32) -> TxVerdict {
        let verdict = *self.verdict.lock().unwrap();

        match verdict {
            TxVerdict::Sent | TxVerdict::Congested => {
                self.frames.lock().unwrap().push(frame.data().to_vec());
            }
            TxVerdict::Dropped | TxVerdict::Busy => {}
        }

        verdict
    }
}

/// A driver that keeps hold of every frame object it is given, so
/// completions stay pending until the frames are let go.
#[derive(Clone)]
pub struct Holder {
    held: Arc<Mutex<Vec<TxFrame>>>,
}

impl Holder {
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Destroy every held frame, publishing their completions.
    pub fn release_all(&self) {
        self.held.lock().unwrap().clear();
    }
}

impl Driver for Holder {
    fn direct_xmit(&self, frame: TxFrame, _queue_id: u32) -> TxVerdict {
        self.held.lock().unwrap().push(frame);
        TxVerdict::Sent
    }
}

pub fn capturing_device(ifindex: u32, mtu: u32, num_rx_queues: u32) -> (Arc<NetDevice>, Capture) {
    let capture = Capture::new();

    let dev = dev::register(NetDevice::new(
        ifindex,
        format!("veth{}", ifindex),
        mtu,
        num_rx_queues,
        Box::new(capture.clone()),
    ))
    .expect("device registration failed");

    (dev, capture)
}

pub fn holding_device(ifindex: u32, mtu: u32, num_rx_queues: u32) -> (Arc<NetDevice>, Holder) {
    let holder = Holder::new();

    let dev = dev::register(NetDevice::new(
        ifindex,
        format!("veth{}", ifindex),
        mtu,
        num_rx_queues,
        Box::new(holder.clone()),
    ))
    .expect("device registration failed");

    (dev, holder)
}

pub struct SocketConfigBuilder {
    pub frame_count: u32,
    pub frame_size: u32,
    pub frame_headroom: u32,
    pub fill_queue_size: u32,
    pub comp_queue_size: u32,
    pub rx_queue_size: u32,
    pub tx_queue_size: u32,
}

impl SocketConfigBuilder {
    pub fn default() -> Self {
        Self {
            frame_count: 8,
            frame_size: FRAME_SIZE,
            frame_headroom: 0,
            fill_queue_size: 8,
            comp_queue_size: 8,
            rx_queue_size: 8,
            tx_queue_size: 8,
        }
    }

    /// Create a socket with a registered UMEM and all four rings, ready
    /// to bind.
    pub fn build(self) -> Arc<Socket> {
        init_logger();

        let socket = Socket::new(Caps::NET_RAW).expect("failed to create socket");

        let mem = UmemRegion::new(
            self.frame_count as usize * self.frame_size as usize,
            false,
        )
        .expect("failed to create UMEM region");

        let config = UmemConfig::new(
            FrameSize::new(self.frame_size).unwrap(),
            self.frame_headroom,
        )
        .unwrap();

        socket.umem_reg(mem, &config).expect("failed to register UMEM");

        socket
            .umem_fill_ring(self.fill_queue_size)
            .expect("failed to create fill ring");
        socket
            .umem_completion_ring(self.comp_queue_size)
            .expect("failed to create completion ring");
        socket
            .rx_ring(self.rx_queue_size)
            .expect("failed to create rx ring");
        socket
            .tx_ring(self.tx_queue_size)
            .expect("failed to create tx ring");

        socket
    }
}

pub fn build_socket() -> Arc<Socket> {
    SocketConfigBuilder::default().build()
}
