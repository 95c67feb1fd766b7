use devio_protocol::{SharedOp, SharedRequest, SharedResponse, SharedResponseCode};
use devio_storage::Result;
use tracing::debug;
use uuid::Uuid;

use crate::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub key: u64,
    pub scope: u64,
    pub kind: u64,
}

/// Persistent-reservation state for one shared disk.
///
/// Keys are kept in registration order. A key of 0 means "no key" and is never registered.
#[derive(Debug, Clone)]
pub struct SharedKeyRegistry {
    unique_id: [u8; 16],
    keys: Vec<u64>,
    reservation: Option<Reservation>,
}

impl Default for SharedKeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedKeyRegistry {
    pub fn new() -> Self {
        Self::with_unique_id(*Uuid::new_v4().as_bytes())
    }

    pub fn with_unique_id(unique_id: [u8; 16]) -> Self {
        Self {
            unique_id,
            keys: Vec::new(),
            reservation: None,
        }
    }

    pub fn unique_id(&self) -> [u8; 16] {
        self.unique_id
    }

    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    pub fn reservation(&self) -> Option<Reservation> {
        self.reservation
    }

    fn is_registered(&self, key: u64) -> bool {
        key != 0 && self.keys.contains(&key)
    }

    fn unregister(&mut self, key: u64) {
        self.keys.retain(|k| *k != key);
        if self.reservation.is_some_and(|r| r.key == key) {
            self.reservation = None;
        }
    }

    pub fn handle(&mut self, req: &SharedRequest) -> SharedResponse {
        let Some(op) = req.op() else {
            debug!(operation = req.operation, "unknown shared-key operation");
            return SharedResponse::empty(SharedResponseCode::InvalidParameter);
        };
        let current = req.current_channel_key;
        let code = match op {
            SharedOp::GetUniqueId => {
                let (lo, hi) = self.unique_id.split_at(8);
                return SharedResponse {
                    code: SharedResponseCode::NoError,
                    keys: vec![le_u64(lo), le_u64(hi)],
                };
            }
            SharedOp::ReadKeys => {
                return SharedResponse {
                    code: SharedResponseCode::NoError,
                    keys: self.keys.clone(),
                };
            }
            SharedOp::Register => {
                if current != 0 && !self.is_registered(current) {
                    SharedResponseCode::ReservationCollision
                } else {
                    if current != 0 {
                        self.unregister(current);
                    }
                    let new_key = req.operation_channel_key;
                    if new_key != 0 && !self.keys.contains(&new_key) {
                        self.keys.push(new_key);
                    }
                    SharedResponseCode::NoError
                }
            }
            _ if !self.is_registered(current) => SharedResponseCode::ReservationCollision,
            SharedOp::ClearKeys => {
                self.keys.clear();
                self.reservation = None;
                SharedResponseCode::NoError
            }
            SharedOp::Reserve => match self.reservation {
                Some(r) if r.key != current => SharedResponseCode::ReservationCollision,
                _ => {
                    self.reservation = Some(Reservation {
                        key: current,
                        scope: req.reserve_scope,
                        kind: req.reserve_type,
                    });
                    SharedResponseCode::NoError
                }
            },
            SharedOp::Release => match self.reservation {
                Some(r) if r.key != current => SharedResponseCode::ReservationCollision,
                _ => {
                    self.reservation = None;
                    SharedResponseCode::NoError
                }
            },
            SharedOp::Preempt => {
                let victim = req.operation_channel_key;
                if !self.is_registered(victim) {
                    SharedResponseCode::ReservationCollision
                } else {
                    let held_by_victim = self.reservation.map_or(true, |r| r.key == victim);
                    if victim != current {
                        self.keys.retain(|k| *k != victim);
                    }
                    if held_by_victim {
                        self.reservation = Some(Reservation {
                            key: current,
                            scope: req.reserve_scope,
                            kind: req.reserve_type,
                        });
                    }
                    SharedResponseCode::NoError
                }
            }
        };
        debug!(?op, current, ?code, "shared-key operation");
        SharedResponse::empty(code)
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Adds persistent-reservation semantics to any provider.
pub struct SharedKeysProvider<P> {
    inner: P,
    registry: SharedKeyRegistry,
}

impl<P: Provider> SharedKeysProvider<P> {
    pub fn new(inner: P) -> Self {
        Self::with_registry(inner, SharedKeyRegistry::new())
    }

    pub fn with_registry(inner: P, registry: SharedKeyRegistry) -> Self {
        Self { inner, registry }
    }

    pub fn registry(&self) -> &SharedKeyRegistry {
        &self.registry
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: Provider> Provider for SharedKeysProvider<P> {
    fn length(&self) -> Result<u64> {
        self.inner.length()
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn alignment(&self) -> u32 {
        self.inner.alignment()
    }

    fn supports_shared_keys(&self) -> bool {
        true
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner.read_at(buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.inner.write_at(buf, offset)
    }

    fn shared_keys(&mut self, request: &SharedRequest) -> Result<SharedResponse> {
        Ok(self.registry.handle(request))
    }
}
