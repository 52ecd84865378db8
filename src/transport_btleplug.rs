//! `btleplug`-backed implementation of [`DfuTransport`]/[`DfuTransportManager`]
//! (spec §4.3).

use crate::error::{DfuError, DfuResult};
use crate::transport::{DfuTransport, DfuTransportManager, DiscoveredDevice};

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

/// Legacy DFU service & characteristic UUIDs (spec §4.3).
#[allow(dead_code)]
pub mod dfu_uuids {
    use uuid::Uuid;
    /// DFU Service
    pub const SERVICE: Uuid = Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);
    /// Control point (notify + write), also used as the buttonless
    /// trigger characteristic when the target is in application mode.
    pub const CONTROL_POINT: Uuid = Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCD123);
    /// Packet characteristic (write-without-response).
    pub const PACKET: Uuid = Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCD123);
}

/// BLE write MTU used for chunking variable-length control/packet writes
/// (init packet, image-size header). The 20-byte packet framing in spec
/// §4.5.1 is a protocol-level constant independent of this and is
/// enforced by the state machine.
const MTU: usize = 244;

async fn first_adapter() -> DfuResult<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| DfuError::GattTransport("no BLE adapter available".to_string()))
}

async fn scan_until<P>(central: &Adapter, timeout: Duration, mut predicate: P) -> Option<Peripheral>
where
    P: FnMut(&PeripheralProperties) -> bool,
{
    if central.start_scan(ScanFilter::default()).await.is_err() {
        return None;
    }
    let deadline = Instant::now() + timeout;
    let mut events = match central.events().await {
        Ok(events) => events,
        Err(_) => return None,
    };

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let event = match tokio::time::timeout(remaining, events.next()).await {
            Ok(Some(event)) => event,
            _ => break,
        };
        if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
            if let Ok(peripheral) = central.peripheral(&id).await {
                if let Ok(Some(properties)) = peripheral.properties().await {
                    if predicate(&properties) {
                        let _ = central.stop_scan().await;
                        return Some(peripheral);
                    }
                }
            }
        }
    }
    let _ = central.stop_scan().await;
    None
}

/// A connected Legacy DFU BLE session.
pub struct DfuTransportBtleplug {
    peripheral: Peripheral,
    notifications: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    pump: tokio::task::JoinHandle<()>,
}

impl Drop for DfuTransportBtleplug {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl DfuTransportBtleplug {
    async fn connected(peripheral: Peripheral) -> DfuResult<Self> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let mut notification_stream = peripheral.notifications().await?;
        let (tx, rx) = mpsc::channel(32);
        let pump = tokio::spawn(async move {
            while let Some(notification) = notification_stream.next().await {
                if notification.uuid == dfu_uuids::CONTROL_POINT {
                    if tx.send(notification.value).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            peripheral,
            notifications: AsyncMutex::new(rx),
            pump,
        })
    }

    fn characteristic(&self, uuid: uuid::Uuid) -> DfuResult<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| DfuError::GattTransport(format!("characteristic {uuid} not found")))
    }

    async fn write_chunked(&self, char: &Characteristic, bytes: &[u8], write_type: WriteType) -> DfuResult<()> {
        for chunk in bytes.chunks(MTU) {
            self.peripheral.write(char, chunk, write_type).await?;
        }
        Ok(())
    }
}

impl DfuTransport for DfuTransportBtleplug {
    async fn has_control_point(&self) -> bool {
        self.characteristic(dfu_uuids::CONTROL_POINT).is_ok()
    }

    async fn write_control(&self, bytes: &[u8], with_response: bool) -> DfuResult<()> {
        let char = self.characteristic(dfu_uuids::CONTROL_POINT)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.write_chunked(&char, bytes, write_type).await
    }

    async fn write_packet(&self, bytes: &[u8]) -> DfuResult<()> {
        let char = self.characteristic(dfu_uuids::PACKET)?;
        self.write_chunked(&char, bytes, WriteType::WithoutResponse).await
    }

    async fn subscribe_control(&self) -> DfuResult<()> {
        let char = self.characteristic(dfu_uuids::CONTROL_POINT)?;
        self.peripheral.subscribe(&char).await?;
        Ok(())
    }

    async fn next_notification(&self, timeout: Duration) -> DfuResult<Option<Vec<u8>>> {
        let mut notifications = self.notifications.lock().await;
        match tokio::time::timeout(timeout, notifications.recv()).await {
            Ok(Some(bytes)) => Ok(Some(bytes)),
            Ok(None) => Err(DfuError::GattTransport("notification channel closed".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> DfuResult<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

/// Connects to and scans for Legacy DFU targets via the system's first
/// BLE adapter.
pub struct BtleplugTransportManager;

impl BtleplugTransportManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BtleplugTransportManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransportManager for BtleplugTransportManager {
    type Transport = DfuTransportBtleplug;

    async fn connect(&self, target: &str, timeout: Duration) -> DfuResult<Self::Transport> {
        let central = first_adapter().await?;

        let peripheral = if let Ok(addr) = BDAddr::from_str(target) {
            scan_until(&central, timeout, |props| props.address == addr).await
        } else {
            scan_until(&central, timeout, |props| {
                props.local_name.as_deref() == Some(target)
            })
            .await
        };

        let peripheral = peripheral.ok_or(DfuError::DeviceNotFound {
            timeout_secs: timeout.as_secs(),
        })?;

        DfuTransportBtleplug::connected(peripheral).await
    }

    async fn scan(&self, timeout: Duration) -> DfuResult<Vec<DiscoveredDevice>> {
        let central = first_adapter().await?;
        let mut seen: HashMap<String, DiscoveredDevice> = HashMap::new();

        let _ = central.start_scan(ScanFilter::default()).await;
        let deadline = Instant::now() + timeout;
        if let Ok(mut events) = central.events().await {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let event = match tokio::time::timeout(remaining, events.next()).await {
                    Ok(Some(event)) => event,
                    _ => break,
                };
                if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
                    if let Ok(peripheral) = central.peripheral(&id).await {
                        if let Ok(Some(properties)) = peripheral.properties().await {
                            if let Some(name) = properties.local_name {
                                seen.insert(
                                    properties.address.to_string(),
                                    DiscoveredDevice {
                                        name,
                                        address: properties.address.to_string(),
                                        rssi: properties.rssi,
                                    },
                                );
                            }
                        }
                    }
                }
            }
        }
        let _ = central.stop_scan().await;

        Ok(seen.into_values().collect())
    }
}
