use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::rtp::packet::Packet;

/// A remote track delivered to the viewer.
#[derive(Debug)]
pub struct InboundStream {
    pub stream_id: String,
    pub track_id: String,
    pub mime_type: String,
    pub packets: mpsc::Receiver<Packet>,
}

/// Where the viewer sends the remote stream.
pub trait StreamSink: Send + Sync {
    fn attach(&self, stream: InboundStream);
    fn detach(&self);
}

const REPORT_EVERY: u64 = 300;

/// Logs throughput of whatever stream is attached.
#[derive(Debug, Default)]
pub struct PacketCounter {
    task: Mutex<Option<JoinHandle<u64>>>,
}

impl PacketCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamSink for PacketCounter {
    fn attach(&self, mut stream: InboundStream) {
        let stream_id = stream.stream_id.clone();
        let task = tokio::spawn(async move {
            let mut packets = 0u64;
            let mut bytes = 0usize;
            while let Some(packet) = stream.packets.recv().await {
                packets += 1;
                bytes += packet.payload.len();
                if packets % REPORT_EVERY == 0 {
                    info!(
                        target = "drink_cam::sink",
                        stream = %stream_id,
                        packets,
                        bytes,
                        "receiving stream"
                    );
                }
            }
            debug!(target = "drink_cam::sink", stream = %stream_id, packets, "stream ended");
            packets
        });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    fn detach(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
