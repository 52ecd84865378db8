//! Legacy DFU state machine (spec §4.5) — the heart of the driver.
//!
//! Drives one firmware image through the bootloader's Legacy DFU
//! conversation: START, INIT, TRANSFER_PREP, TRANSFER, VALIDATE, ACTIVATE.
//! Each phase is a short, explicit sequence of control-point writes,
//! packet-characteristic writes, and awaited notifications — there is no
//! hidden retry here (spec §7: "none are retried internally"); a failure
//! at any point returns immediately with a [`DfuError`] naming the phase.

use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::bundle::{BundleImage, ImageType};
use crate::config::DfuConfig;
use crate::error::{DfuError, DfuResult};
use crate::transport::DfuTransport;

/// Host -> target opcodes (spec §4.5.1).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
enum OpCode {
    StartDfu = 0x01,
    InitDfuParams = 0x02,
    ReceiveFirmwareImage = 0x03,
    ValidateFirmware = 0x04,
    ActivateAndReset = 0x05,
    SetPacketsPerReceipt = 0x08,
}

/// Target -> host notification headers (spec §4.5.1).
const RESPONSE: u8 = 0x10;
const PACKET_RECEIPT_NOTIFICATION: u8 = 0x11;

/// Legacy DFU data packets are framed at 20 bytes regardless of the
/// underlying BLE link MTU (spec §4.5.1).
const PACKET_SIZE: usize = 20;

/// Target response status codes (spec §4.5.1).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
enum StatusCode {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl StatusCode {
    fn name(self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::InvalidState => "INVALID_STATE",
            StatusCode::NotSupported => "NOT_SUPPORTED",
            StatusCode::DataSizeExceedsLimit => "DATA_SIZE_EXCEEDS_LIMIT",
            StatusCode::CrcError => "CRC_ERROR",
            StatusCode::OperationFailed => "OPERATION_FAILED",
        }
    }
}

/// Build the image-size header sent to the packet characteristic right
/// after START_DFU: three LE uint32 values `(softdevice, bootloader,
/// application)`. Exactly one is nonzero, matching the image-type
/// bitmask. For a combined softdevice+bootloader group (one concatenated
/// `.bin`) the whole length is attributed to the bootloader-size field —
/// this mirrors how `nrfutil`'s legacy BLE DFU transport sizes a
/// combined softdevice+bootloader object (see DESIGN.md).
fn size_header(image_type: ImageType, firmware_len: u32) -> [u8; 12] {
    let (sd, bl, app) = if image_type.has_application() {
        (0, 0, firmware_len)
    } else if image_type.has_bootloader() {
        (0, firmware_len, 0)
    } else if image_type.has_softdevice() {
        (firmware_len, 0, 0)
    } else {
        (0, 0, 0)
    };
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&sd.to_le_bytes());
    header[4..8].copy_from_slice(&bl.to_le_bytes());
    header[8..12].copy_from_slice(&app.to_le_bytes());
    header
}

async fn await_response(
    transport: &impl DfuTransport,
    phase: &'static str,
    expected_opcode: u8,
    timeout: Duration,
) -> DfuResult<()> {
    let bytes = transport
        .next_notification(timeout)
        .await?
        .ok_or(DfuError::Timeout {
            phase,
            what: "control-point response",
        })?;

    if bytes.len() < 3 || bytes[0] != RESPONSE {
        return Err(DfuError::Protocol {
            phase,
            opcode: expected_opcode,
            status: bytes.get(2).copied().unwrap_or(0),
            status_name: "MALFORMED_RESPONSE",
        });
    }
    if bytes[1] != expected_opcode {
        return Err(DfuError::Protocol {
            phase,
            opcode: bytes[1],
            status: bytes[2],
            status_name: "UNEXPECTED_RESPONSE_OPCODE",
        });
    }

    match StatusCode::try_from(bytes[2]) {
        Ok(StatusCode::Success) => Ok(()),
        Ok(status) => Err(DfuError::Protocol {
            phase,
            opcode: expected_opcode,
            status: bytes[2],
            status_name: status.name(),
        }),
        Err(_) => Err(DfuError::Protocol {
            phase,
            opcode: expected_opcode,
            status: bytes[2],
            status_name: "UNKNOWN_STATUS",
        }),
    }
}

async fn await_receipt(transport: &impl DfuTransport, phase: &'static str, timeout: Duration) -> DfuResult<u32> {
    let bytes = transport
        .next_notification(timeout)
        .await?
        .ok_or(DfuError::Timeout {
            phase,
            what: "packet receipt notification",
        })?;

    if bytes.len() < 5 || bytes[0] != PACKET_RECEIPT_NOTIFICATION {
        return Err(DfuError::Protocol {
            phase,
            opcode: PACKET_RECEIPT_NOTIFICATION,
            status: 0,
            status_name: "MALFORMED_RECEIPT",
        });
    }
    Ok(u32::from_le_bytes(bytes[1..5].try_into().unwrap()))
}

async fn wait_for_activation_disconnect(
    transport: &impl DfuTransport,
    timeout: Duration,
) -> DfuResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !transport.is_connected().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DfuError::ActivationTimeout {
                timeout_secs: timeout.as_secs(),
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Drive one bundle image through the full Legacy DFU lifecycle, to and
/// including activation (spec §4.5.2).
pub async fn run_image(
    transport: &impl DfuTransport,
    image: &BundleImage,
    config: &DfuConfig,
    on_progress: &mut dyn FnMut(f32),
    on_log: &mut dyn FnMut(&str),
) -> DfuResult<()> {
    transport.subscribe_control().await?;

    // START
    on_log("sending START_DFU");
    let image_type_byte = image.image_type.bits() as u8;
    transport
        .write_control(&[OpCode::StartDfu.into(), image_type_byte], false)
        .await?;
    transport
        .write_packet(&size_header(image.image_type, image.firmware.len() as u32))
        .await?;
    await_response(transport, "START", OpCode::StartDfu.into(), config.response_timeout).await?;

    // INIT
    on_log("sending init packet");
    transport
        .write_control(&[OpCode::InitDfuParams.into(), 0x00], false)
        .await?;
    for chunk in image.init_packet.chunks(PACKET_SIZE) {
        transport.write_packet(chunk).await?;
    }
    transport
        .write_control(&[OpCode::InitDfuParams.into(), 0x01], false)
        .await?;
    await_response(transport, "INIT", OpCode::InitDfuParams.into(), config.response_timeout).await?;

    // TRANSFER_PREP
    let n = config.resolved_packets_per_notification();
    transport
        .write_control(
            &[OpCode::SetPacketsPerReceipt.into(), (n & 0xFF) as u8, (n >> 8) as u8],
            false,
        )
        .await?;
    transport
        .write_control(&[OpCode::ReceiveFirmwareImage.into()], false)
        .await?;

    // TRANSFER
    on_log("transferring firmware image");
    let total = image.firmware.len() as u32;
    let mut bytes_sent: u32 = 0;
    let mut packets_since_receipt: u16 = 0;

    for chunk in image.firmware.chunks(PACKET_SIZE) {
        transport.write_packet(chunk).await?;
        bytes_sent += chunk.len() as u32;
        packets_since_receipt += 1;

        let window_complete = packets_since_receipt == n;
        let transfer_complete = bytes_sent == total;

        if window_complete {
            // The completing packet of the whole transfer can also close a
            // receipt window (when firmware_len is a multiple of 20*N); the
            // target emits both the receipt and, separately, the final
            // RESPONSE(0x03) below, so this receipt must be drained first.
            let received = await_receipt(transport, "TRANSFER", config.receipt_timeout).await?;
            if received != bytes_sent {
                return Err(DfuError::ByteCountMismatch {
                    phase: "TRANSFER",
                    reported: received,
                    sent: bytes_sent,
                });
            }
            packets_since_receipt = 0;
            on_progress(100.0 * bytes_sent as f32 / total as f32);
        }

        if transfer_complete {
            break;
        }
    }

    await_response(
        transport,
        "TRANSFER",
        OpCode::ReceiveFirmwareImage.into(),
        config.response_timeout,
    )
    .await?;
    on_progress(100.0);

    // VALIDATE
    on_log("validating firmware");
    transport
        .write_control(&[OpCode::ValidateFirmware.into()], false)
        .await?;
    await_response(transport, "VALIDATE", OpCode::ValidateFirmware.into(), config.response_timeout).await?;

    // ACTIVATE
    on_log("activating: target will reset");
    transport
        .write_control(&[OpCode::ActivateAndReset.into()], false)
        .await?;
    wait_for_activation_disconnect(transport, config.activation_timeout).await?;
    on_log("target disconnected after activation");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ImageType;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum MockPhase {
        AwaitingStart,
        AwaitingSizeHeader,
        AwaitingInitBegin,
        AwaitingInitChunks,
        AwaitingPrn,
        InTransfer,
        AwaitingValidate,
        AwaitingActivate,
        Done,
    }

    struct MockInner {
        phase: MockPhase,
        firmware_total: u32,
        bytes_received: u32,
        receipt_interval: u32,
        packets_since_receipt: u32,
        pending: VecDeque<Vec<u8>>,
        control_writes: Vec<Vec<u8>>,
        packet_writes: usize,
        connected: bool,
        notification_fetches: usize,
        corrupt_next_receipt: bool,
        respond_to_init: bool,
        disconnect_after_activate: Option<Duration>,
    }

    /// A scripted fake Legacy DFU bootloader. Control/packet writes are
    /// interpreted the way the real target would react; responses and
    /// receipt notifications are queued for `next_notification` to drain.
    #[derive(Clone)]
    struct MockTarget {
        inner: Arc<Mutex<MockInner>>,
    }

    impl MockTarget {
        fn new(firmware_total: u32) -> Self {
            Self {
                inner: Arc::new(Mutex::new(MockInner {
                    phase: MockPhase::AwaitingStart,
                    firmware_total,
                    bytes_received: 0,
                    receipt_interval: 10,
                    packets_since_receipt: 0,
                    pending: VecDeque::new(),
                    control_writes: Vec::new(),
                    packet_writes: 0,
                    connected: true,
                    notification_fetches: 0,
                    corrupt_next_receipt: false,
                    respond_to_init: true,
                    disconnect_after_activate: None,
                }),
            }
        }

        async fn never_respond_to_init(self) -> Self {
            self.inner.lock().await.respond_to_init = false;
            self
        }

        async fn corrupt_first_receipt(self) -> Self {
            self.inner.lock().await.corrupt_next_receipt = true;
            self
        }

        async fn disconnect_after_activate(self, delay: Duration) -> Self {
            self.inner.lock().await.disconnect_after_activate = Some(delay);
            self
        }

        async fn control_writes(&self) -> Vec<Vec<u8>> {
            self.inner.lock().await.control_writes.clone()
        }

        async fn packet_write_count(&self) -> usize {
            self.inner.lock().await.packet_writes
        }

        async fn notification_fetch_count(&self) -> usize {
            self.inner.lock().await.notification_fetches
        }

        fn response(opcode: u8, status: u8) -> Vec<u8> {
            vec![RESPONSE, opcode, status]
        }

        fn receipt(bytes_received: u32) -> Vec<u8> {
            let mut v = vec![PACKET_RECEIPT_NOTIFICATION];
            v.extend_from_slice(&bytes_received.to_le_bytes());
            v
        }
    }

    impl DfuTransport for MockTarget {
        async fn has_control_point(&self) -> bool {
            true
        }

        async fn write_control(&self, bytes: &[u8], _with_response: bool) -> DfuResult<()> {
            let mut inner = self.inner.lock().await;
            inner.control_writes.push(bytes.to_vec());

            match inner.phase {
                MockPhase::AwaitingStart if bytes.first() == Some(&OpCode::StartDfu.into()) => {
                    inner.pending.push_back(Self::response(OpCode::StartDfu.into(), StatusCode::Success.into()));
                    inner.phase = MockPhase::AwaitingSizeHeader;
                }
                MockPhase::AwaitingInitBegin
                    if bytes == [OpCode::InitDfuParams.into(), 0x00] =>
                {
                    inner.phase = MockPhase::AwaitingInitChunks;
                }
                MockPhase::AwaitingInitChunks
                    if bytes == [OpCode::InitDfuParams.into(), 0x01] =>
                {
                    if inner.respond_to_init {
                        inner.pending.push_back(Self::response(OpCode::InitDfuParams.into(), StatusCode::Success.into()));
                        inner.phase = MockPhase::AwaitingPrn;
                    }
                    // else: never respond, driving the INIT-timeout scenario.
                }
                MockPhase::AwaitingPrn if bytes.first() == Some(&OpCode::SetPacketsPerReceipt.into()) => {
                    inner.receipt_interval = u16::from_le_bytes([bytes[1], bytes[2]]) as u32;
                }
                MockPhase::AwaitingPrn if bytes == [OpCode::ReceiveFirmwareImage.into()] => {
                    inner.phase = MockPhase::InTransfer;
                }
                MockPhase::AwaitingValidate if bytes == [OpCode::ValidateFirmware.into()] => {
                    inner.pending.push_back(Self::response(OpCode::ValidateFirmware.into(), StatusCode::Success.into()));
                    inner.phase = MockPhase::AwaitingActivate;
                }
                MockPhase::AwaitingActivate if bytes == [OpCode::ActivateAndReset.into()] => {
                    inner.phase = MockPhase::Done;
                    if let Some(delay) = inner.disconnect_after_activate {
                        let inner_arc = self.inner.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            inner_arc.lock().await.connected = false;
                        });
                    }
                }
                _ => {}
            }
            Ok(())
        }

        async fn write_packet(&self, bytes: &[u8]) -> DfuResult<()> {
            let mut inner = self.inner.lock().await;
            inner.packet_writes += 1;

            match inner.phase {
                MockPhase::AwaitingSizeHeader => {
                    inner.phase = MockPhase::AwaitingInitBegin;
                }
                MockPhase::AwaitingInitChunks => {
                    // init packet chunk; no bookkeeping needed.
                }
                MockPhase::InTransfer => {
                    inner.bytes_received += bytes.len() as u32;
                    inner.packets_since_receipt += 1;

                    // A real target emits both: the periodic receipt when a
                    // window closes, and (independently) the RESPONSE(0x03)
                    // once the whole image has arrived. The two coincide
                    // exactly when firmware_total is a multiple of 20*N.
                    if inner.packets_since_receipt == inner.receipt_interval {
                        let reported = if inner.corrupt_next_receipt {
                            inner.corrupt_next_receipt = false;
                            inner.bytes_received + 1
                        } else {
                            inner.bytes_received
                        };
                        inner.pending.push_back(Self::receipt(reported));
                        inner.packets_since_receipt = 0;
                    }
                    if inner.bytes_received == inner.firmware_total {
                        inner.phase = MockPhase::AwaitingValidate;
                        inner.pending.push_back(Self::response(
                            OpCode::ReceiveFirmwareImage.into(),
                            StatusCode::Success.into(),
                        ));
                    }
                }
                _ => {}
            }
            Ok(())
        }

        async fn subscribe_control(&self) -> DfuResult<()> {
            Ok(())
        }

        async fn next_notification(&self, timeout: Duration) -> DfuResult<Option<Vec<u8>>> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(bytes) = inner.pending.pop_front() {
                        inner.notification_fetches += 1;
                        return Ok(Some(bytes));
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        async fn is_connected(&self) -> bool {
            self.inner.lock().await.connected
        }

        async fn disconnect(&self) -> DfuResult<()> {
            self.inner.lock().await.connected = false;
            Ok(())
        }
    }

    fn app_image(firmware: Vec<u8>) -> BundleImage {
        BundleImage {
            image_type: ImageType::APPLICATION,
            init_packet: vec![0u8; 32],
            firmware,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_application_only() {
        let firmware = vec![0xABu8; 4096];
        let target = MockTarget::new(firmware.len() as u32);
        let image = app_image(firmware);
        let config = DfuConfig::default();

        let mut progress_values = Vec::new();
        let mut on_progress = |p: f32| progress_values.push(p);
        let mut on_log = |_msg: &str| {};

        run_image(&target, &image, &config, &mut on_progress, &mut on_log)
            .await
            .unwrap();

        let control_writes = target.control_writes().await;
        let start_writes: Vec<_> = control_writes
            .iter()
            .filter(|w| w.first() == Some(&OpCode::StartDfu.into()))
            .collect();
        assert_eq!(start_writes.len(), 1);
        assert_eq!(start_writes[0].as_slice(), &[0x01, 0x04]);

        // 1 size-header write + 2 init-packet chunks (32 bytes / 20) +
        // 205 firmware packets (4096 / 20 = 204.8, last one 16 bytes).
        assert_eq!(target.packet_write_count().await, 1 + 2 + 205);

        for pair in progress_values.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(*progress_values.last().unwrap(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_window_never_exceeds_configured_n() {
        let firmware = vec![0x11u8; 1000]; // 50 packets of 20 bytes
        let target = MockTarget::new(firmware.len() as u32);
        let image = app_image(firmware);
        let mut config = DfuConfig::default();
        config.packets_per_notification = Some(8);

        let mut on_progress = |_p: f32| {};
        let mut on_log = |_msg: &str| {};

        run_image(&target, &image, &config, &mut on_progress, &mut on_log)
            .await
            .unwrap();

        // 6 periodic receipts (at packets 8,16,...,48) + 1 final RESPONSE(0x03)
        // delivered over the same notification channel = 7 notification fetches.
        assert!(target.notification_fetch_count().await >= 7);
    }

    #[tokio::test(start_paused = true)]
    async fn final_packet_that_also_closes_a_receipt_window_still_completes() {
        // 200 bytes / 20 = exactly 10 packets, and N=10, so the completing
        // packet closes a receipt window *and* finishes the transfer in the
        // same write. The host must drain that receipt before awaiting the
        // final RESPONSE(0x03), or it abort with a spurious malformed-response
        // error.
        let firmware = vec![0x66u8; 200];
        let target = MockTarget::new(firmware.len() as u32);
        let image = app_image(firmware);
        let mut config = DfuConfig::default();
        config.packets_per_notification = Some(10);

        let mut progress_values = Vec::new();
        let mut on_progress = |p: f32| progress_values.push(p);
        let mut on_log = |_msg: &str| {};

        run_image(&target, &image, &config, &mut on_progress, &mut on_log)
            .await
            .unwrap();

        // 1 periodic receipt (closing the only, exactly-full window) + 1
        // final RESPONSE(0x03) = 2 notification fetches.
        assert_eq!(target.notification_fetch_count().await, 2);
        assert_eq!(*progress_values.last().unwrap(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn byte_count_mismatch_aborts_transfer() {
        let firmware = vec![0x22u8; 1000];
        let target = MockTarget::new(firmware.len() as u32)
            .corrupt_first_receipt()
            .await;
        let image = app_image(firmware);
        let mut config = DfuConfig::default();
        config.packets_per_notification = Some(8);

        let mut on_progress = |_p: f32| {};
        let mut on_log = |_msg: &str| {};

        let err = run_image(&target, &image, &config, &mut on_progress, &mut on_log)
            .await
            .unwrap_err();

        assert!(matches!(err, DfuError::ByteCountMismatch { .. }));
        let writes_before_abort = target.packet_write_count().await;
        // Exactly the header write + init chunk(s) + the first 8-packet window.
        assert!(writes_before_abort <= 1 + 2 + 8);
    }

    #[tokio::test(start_paused = true)]
    async fn activation_disconnect_within_window_is_success() {
        let firmware = vec![0x33u8; 40];
        let target = MockTarget::new(firmware.len() as u32)
            .disconnect_after_activate(Duration::from_millis(800))
            .await;
        let image = app_image(firmware);
        let config = DfuConfig::default();

        let mut on_progress = |_p: f32| {};
        let mut on_log = |_msg: &str| {};

        run_image(&target, &image, &config, &mut on_progress, &mut on_log)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn init_timeout_reports_init_phase() {
        let firmware = vec![0x44u8; 40];
        let target = MockTarget::new(firmware.len() as u32)
            .never_respond_to_init()
            .await;
        let image = app_image(firmware);
        let mut config = DfuConfig::default();
        config.response_timeout = Duration::from_secs(30);

        let mut on_progress = |_p: f32| {};
        let mut on_log = |_msg: &str| {};

        let err = run_image(&target, &image, &config, &mut on_progress, &mut on_log)
            .await
            .unwrap_err();

        match err {
            DfuError::Timeout { phase, .. } => assert_eq!(phase, "INIT"),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
