use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;
use wearable_link::domain::models::{ConnectionState, DeviceEvent, DeviceId};
use wearable_link::domain::settings::SettingsService;
use wearable_link::infrastructure::bluetooth::context::ProtocolContext;
use wearable_link::infrastructure::bluetooth::gatt::{
    parse_uuid, Characteristic, CharacteristicProperties,
};
use wearable_link::infrastructure::bluetooth::protocol::DeviceProtocol;
use wearable_link::infrastructure::bluetooth::reassembly::{Fragment, MessageRouter};
use wearable_link::infrastructure::bluetooth::transaction::TransactionBuilder;
use wearable_link::infrastructure::bluetooth::transfer::TransferProgress;
use wearable_link::infrastructure::bluetooth::transport::LoopbackTransport;
use wearable_link::infrastructure::bluetooth::BluetoothService;
use wearable_link::infrastructure::logging;

const DEMO_BAND: &str = "demo-band";

const CONTROL_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
const EVENTS_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
const BATTERY_LEVEL: &str = "2a19";

const MSG_ACTIVITY: u16 = 0x01;

// Transfer requests pushed on the events characteristic.
const OP_CHUNK_REQUEST: u8 = 0xa0;
const OP_CHUNK_ACK: u8 = 0xa1;

/// A fitness band with a Nordic UART style pair of characteristics.
/// Every notification carries a 4 byte header:
/// `[message id, message type, flags (bit 0 = last), sequence]`.
struct DemoBand {
    control: Characteristic,
    events: Characteristic,
    battery: Characteristic,
}

impl DemoBand {
    fn new() -> Result<Self> {
        Ok(Self {
            control: Characteristic::new(
                parse_uuid(CONTROL_UUID)?,
                CharacteristicProperties::WRITE,
            ),
            events: Characteristic::new(
                parse_uuid(EVENTS_UUID)?,
                CharacteristicProperties::NOTIFY,
            ),
            battery: Characteristic::new(
                parse_uuid(BATTERY_LEVEL)?,
                CharacteristicProperties::READ,
            ),
        })
    }

    fn handle_transfer_op(&self, ctx: &mut ProtocolContext<'_>, value: &[u8]) -> bool {
        match value {
            [OP_CHUNK_REQUEST, id, offset, len] => {
                let chunk = match ctx
                    .transfers()
                    .chunk(u32::from(*id), usize::from(*offset), usize::from(*len))
                {
                    Ok(chunk) => chunk.to_vec(),
                    Err(e) => {
                        warn!("Rejected chunk request: {}", e);
                        return true;
                    }
                };
                let reply = ctx
                    .transaction("chunk reply")
                    .write(self.control, chunk)
                    .build();
                if let Err(e) = ctx.submit(reply) {
                    warn!("Could not queue chunk reply: {}", e);
                }
                true
            }
            [OP_CHUNK_ACK, id, delivered] => {
                match ctx
                    .transfers()
                    .acknowledge(u32::from(*id), usize::from(*delivered))
                {
                    Ok(TransferProgress::Complete { id, data }) => {
                        info!("Transfer {} delivered ({} bytes)", id, data.len())
                    }
                    Ok(TransferProgress::InProgress { remaining }) => {
                        info!("Transfer {}: {} bytes to go", id, remaining)
                    }
                    Err(e) => warn!("Ignoring acknowledgement: {}", e),
                }
                true
            }
            _ => false,
        }
    }
}

impl DeviceProtocol for DemoBand {
    fn name(&self) -> &str {
        "demo band"
    }

    fn initialize(&self, builder: TransactionBuilder) -> TransactionBuilder {
        builder
            .notify(self.events, true)
            .request_mtu(185)
            .write(self.control, vec![0x01, 0x00])
            .wait(Duration::from_millis(20))
    }

    fn register_message_handlers(&self, router: &mut MessageRouter) {
        router.register(MSG_ACTIVITY, |message| {
            let text = String::from_utf8(message.payload)?;
            info!("Activity summary: {}", text);
            Ok(())
        });
    }

    fn on_notification(
        &self,
        ctx: &mut ProtocolContext<'_>,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        if characteristic != self.events.uuid {
            return false;
        }
        if self.handle_transfer_op(ctx, value) {
            return true;
        }
        let [id, message_type, flags, sequence, payload @ ..] = value else {
            warn!("Short notification ({} bytes)", value.len());
            return true;
        };
        let mut fragment = Fragment::new(u32::from(*id), u16::from(*message_type), payload)
            .with_sequence(u32::from(*sequence));
        if flags & 0x01 != 0 {
            fragment = fragment.last();
        }
        if let Err(e) = ctx.reassemble(fragment) {
            warn!("Dropped message {}: {}", id, e);
        }
        true
    }
}

/// Split `text` into demo band notifications of at most `payload` bytes.
fn fragments(id: u8, message_type: u8, text: &[u8], payload: usize) -> Vec<Vec<u8>> {
    let chunks: Vec<_> = text.chunks(payload).collect();
    chunks
        .iter()
        .enumerate()
        .map(|(sequence, chunk)| {
            let last = u8::from(sequence + 1 == chunks.len());
            let mut packet = vec![id, message_type, last, sequence as u8];
            packet.extend_from_slice(chunk);
            packet
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _logging_guard = logging::init_logger(&settings.log_settings)?;
    info!(
        "Starting wearable link simulator (settings: {})",
        settings_service.path().display()
    );

    let device = DeviceId::new(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "C0:FF:EE:00:00:01".to_string()),
    );

    let band = Arc::new(DemoBand::new()?);
    let transport = Arc::new(LoopbackTransport::new());
    transport.set_value(&device, band.battery.uuid, vec![87]);
    transport.set_mtu_limit(&device, 128);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                DeviceEvent::StateChanged(change) => info!(
                    "[{}] {} -> {}",
                    change.device, change.previous, change.current
                ),
                DeviceEvent::MtuChanged { device, mtu } => info!("[{}] MTU {}", device, mtu),
            }
        }
    });

    let mut service = BluetoothService::new(transport.clone(), settings, event_tx);
    service.register_protocol(DEMO_BAND, band.clone());

    let queue = service.connect(&device, DEMO_BAND)?;
    queue
        .wait_for_state(ConnectionState::is_initialized)
        .await?;

    // Firmware-style upload split at the negotiated MTU.
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let firmware: Vec<u8> = (0..=255u8).cycle().take(600).collect();
    service
        .perform_initialized(&device, "upload")?
        .write_chunked(band.control, firmware, queue.max_chunk_size())?
        .read(band.battery)
        .set_callback(move |result| {
            let _ = done_tx.send(result);
        })
        .queue(&queue)?;

    match done_rx.await? {
        Ok(report) => info!(
            "Upload finished: {} actions, battery {:?}%",
            report.actions_run,
            report.read(band.battery.uuid)
        ),
        Err(e) => error!("Upload failed: {}", e),
    }
    info!(
        "{} writes reached the peripheral",
        transport.writes(&device, band.control.uuid).len()
    );

    // Peripheral pulls a registered payload in two chunks.
    queue.register_transfer(1, vec![0x42; 200]);
    for op in [
        [OP_CHUNK_REQUEST, 1, 0, 100],
        [OP_CHUNK_REQUEST, 1, 100, 100],
    ] {
        transport.notify(&device, band.events.uuid, op.to_vec());
    }
    transport.notify(&device, band.events.uuid, vec![OP_CHUNK_ACK, 1, 100]);
    transport.notify(&device, band.events.uuid, vec![OP_CHUNK_ACK, 1, 100]);

    // Peripheral pushes a fragmented activity summary.
    let summary = b"steps=10432 distance=7.8km kcal=512 active_minutes=64";
    for packet in fragments(7, MSG_ACTIVITY as u8, summary, 16) {
        transport.notify(&device, band.events.uuid, packet);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    service.disconnect(&device)?;
    queue
        .wait_for_state(|state| state == ConnectionState::NotConnected)
        .await?;
    service.shutdown();
    info!("Simulator finished");
    Ok(())
}
