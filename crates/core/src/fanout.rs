use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::SystemTime;

use crate::bridge::{Delivery, FrameBridge, FrameBuffer, FrameConsumer};
use crate::media::Packetizer;
use crate::session::SessionManager;
use crate::transport::UdpTransport;

/// RTP clock rate used to turn presentation-time deltas into timestamp ticks.
const VIDEO_CLOCK_RATE: u128 = 90_000;

/// Consumer side of one camera's [`FrameBridge`], replicating each frame to
/// every playing client.
///
/// Pulls from the bridge only while at least one subscribed session is in
/// the Playing state. Each delivered frame is packetized once and the same
/// RTP packets are sent to every playing subscriber, so all viewers of a
/// camera share sequence numbers and timestamps.
///
/// At most one frame is handled per wakeup; remaining backlog re-fires the
/// bridge's token and is picked up on later loop iterations.
pub struct StreamFanout {
    camera: String,
    bridge: Option<Rc<RefCell<FrameBridge>>>,
    buffer: FrameBuffer,
    packetizer: Box<dyn Packetizer>,
    sessions: SessionManager,
    udp: UdpTransport,
    subscribers: Vec<String>,
    pulling: bool,
    nominal_increment: u32,
    last_presentation: Option<SystemTime>,
    frames_sent: u64,
    packets_sent: u64,
}

impl StreamFanout {
    /// Wrap `bridge` and register the new fan-out as its consumer.
    ///
    /// `buffer_capacity` is the largest frame that will be forwarded intact.
    pub fn new(
        bridge: Rc<RefCell<FrameBridge>>,
        packetizer: Box<dyn Packetizer>,
        sessions: SessionManager,
        udp: UdpTransport,
        buffer_capacity: usize,
    ) -> Rc<RefCell<Self>> {
        let (camera, nominal_increment) = {
            let b = bridge.borrow();
            (b.camera().name.clone(), b.camera().frame_duration_ticks())
        };

        let fanout = Rc::new(RefCell::new(Self {
            camera,
            bridge: Some(bridge.clone()),
            buffer: FrameBuffer::with_capacity(buffer_capacity),
            packetizer,
            sessions,
            udp,
            subscribers: Vec::new(),
            pulling: false,
            nominal_increment,
            last_presentation: None,
            frames_sent: 0,
            packets_sent: 0,
        }));

        let consumer = Rc::downgrade(&fanout);
        let consumer: Weak<RefCell<dyn FrameConsumer>> = consumer;
        bridge.borrow_mut().attach_consumer(consumer);
        fanout
    }

    pub fn packetizer(&self) -> &dyn Packetizer {
        self.packetizer.as_ref()
    }

    pub fn subscribe(&mut self, session_id: &str) {
        if !self.subscribers.iter().any(|id| id == session_id) {
            self.subscribers.push(session_id.to_string());
            tracing::debug!(camera = %self.camera, session_id, "session subscribed");
        }
    }

    pub fn unsubscribe(&mut self, session_id: &str) {
        if let Some(pos) = self.subscribers.iter().position(|id| id == session_id) {
            self.subscribers.swap_remove(pos);
            tracing::debug!(camera = %self.camera, session_id, "session unsubscribed");
        }
        self.refresh();
    }

    pub fn subscribed_session_ids(&self) -> Vec<String> {
        self.subscribers.clone()
    }

    pub fn is_pulling(&self) -> bool {
        self.pulling
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    /// Start or stop pulling depending on whether anyone is playing.
    ///
    /// Called after every PLAY, PAUSE and TEARDOWN touching this stream.
    pub fn refresh(&mut self) {
        let playing = self.subscribers.iter().any(|id| {
            self.sessions
                .get_session(id)
                .is_some_and(|session| session.is_playing())
        });

        match (playing, self.pulling) {
            (true, false) => {
                self.pulling = true;
                self.last_presentation = None;
                tracing::info!(camera = %self.camera, "delivery started");
                self.pull_one();
            }
            (false, true) => {
                self.pulling = false;
                if let Some(bridge) = &self.bridge {
                    bridge.borrow_mut().stop_getting_frames();
                }
                tracing::info!(
                    camera = %self.camera,
                    frames = self.frames_sent,
                    "delivery paused, no playing sessions"
                );
            }
            _ => {}
        }
    }

    /// Detach from the bridge for good. Subsequent wakeups are ignored.
    pub fn close(&mut self) {
        self.pulling = false;
        self.subscribers.clear();
        if let Some(bridge) = self.bridge.take() {
            bridge.borrow_mut().detach_consumer();
            tracing::debug!(
                camera = %self.camera,
                frames = self.frames_sent,
                packets = self.packets_sent,
                "fan-out detached"
            );
        }
    }

    fn pull_one(&mut self) {
        let Some(bridge) = self.bridge.clone() else {
            return;
        };

        let delivery = bridge.borrow_mut().request_next_frame(&mut self.buffer);
        if let Some(delivery) = delivery {
            self.forward(delivery);
            let bridge = bridge.borrow();
            if bridge.pending_len() > 0 {
                bridge.wake();
            }
        }
    }

    fn timestamp_increment(&mut self, presentation: SystemTime) -> u32 {
        let increment = self
            .last_presentation
            .and_then(|last| presentation.duration_since(last).ok())
            .map(|delta| (delta.as_micros() * VIDEO_CLOCK_RATE / 1_000_000) as u32)
            .filter(|ticks| *ticks > 0)
            .unwrap_or(self.nominal_increment);
        self.last_presentation = Some(presentation);
        increment
    }

    fn forward(&mut self, delivery: Delivery) {
        let increment = self.timestamp_increment(delivery.presentation_time);
        let packets = self.packetizer.packetize(self.buffer.frame(), increment);

        let mut receivers = 0;
        let mut gone = Vec::new();
        for id in &self.subscribers {
            let Some(session) = self.sessions.get_session(id) else {
                gone.push(id.clone());
                continue;
            };
            if !session.is_playing() {
                continue;
            }
            let Some(transport) = session.get_transport() else {
                continue;
            };

            receivers += 1;
            for packet in &packets {
                match self.udp.send_to(packet, transport.client_addr) {
                    Ok(_) => self.packets_sent += 1,
                    Err(e) => {
                        tracing::debug!(
                            camera = %self.camera,
                            session_id = %id,
                            error = %e,
                            "RTP send failed"
                        );
                        break;
                    }
                }
            }
        }

        for id in gone {
            self.subscribers.retain(|s| *s != id);
        }

        self.frames_sent += 1;
        tracing::trace!(
            camera = %self.camera,
            frame_size = delivery.frame_size,
            truncated = delivery.truncated,
            rtp_packets = packets.len(),
            receivers,
            "frame forwarded"
        );
    }
}

impl FrameConsumer for StreamFanout {
    fn on_frame_available(&mut self) {
        if self.pulling {
            self.pull_one();
        }
    }
}
