//! Central daemon state.
//!
//! The kernel owns the session map, the lazily opened device handles,
//! the per-device executors, and the installed configuration with its
//! schema store. Everything sits behind one plain mutex; each public
//! method takes the lock, inspects or mutates the maps, and releases it
//! before any device I/O happens (I/O runs inside executor tasks).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use k256::ecdsa::VerifyingKey;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use tokend_core::codec::{self, CodecError};
use tokend_core::config::{builtin_keys, ConfigError, SignedConfig};
use tokend_core::device::{DeviceInfo, DevicePath, HidBackend, TransportError};
use tokend_core::schema::{SchemaError, SchemaStore};
use tokend_core::transport::DeviceTransport;
use tokend_core::wire::{self, WireError};

use crate::executor::{Executor, ExecutorGone};

/// Server-issued handle binding calls to one token path.
pub type SessionId = String;

/// Kernel-level failures. The HTTP layer maps these onto status codes.
#[derive(Debug, Error)]
pub enum KernelError {
    /// No configuration has been installed yet.
    #[error("not configured")]
    NotConfigured,

    /// The session id has no mapping.
    #[error("session not found")]
    UnknownSession,

    /// A required configuration field is missing.
    #[error("configuration is incomplete")]
    IncompleteConfig,

    /// The configuration's expiry has passed.
    #[error("configuration is expired")]
    ExpiredConfig,

    /// The request origin is rejected by the configuration.
    #[error("origin not allowed")]
    OriginNotAllowed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Executor(#[from] ExecutorGone),
}

/// A device handle bound to one token path, opened on first use.
///
/// Access is serialized by the path's executor; the inner mutex only
/// protects against the open/close bookkeeping itself.
pub struct DeviceKernel {
    path: DevicePath,
    device: Mutex<Option<DeviceTransport>>,
}

impl DeviceKernel {
    fn new(path: DevicePath) -> Self {
        Self {
            path,
            device: Mutex::new(None),
        }
    }

    /// The token path this handle is bound to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open the underlying device if it is not open yet.
    pub fn open(&self, backend: &dyn HidBackend) -> Result<(), TransportError> {
        let mut guard = self.lock();
        if guard.is_none() {
            let handle = backend.open(&self.path)?;
            *guard = Some(DeviceTransport::new(handle));
        }
        Ok(())
    }

    /// Drop the underlying device handle, if any.
    pub fn close(&self) {
        *self.lock() = None;
    }

    /// Send one message and read the reply.
    ///
    /// Opens the device if needed. Any failure closes the handle so the
    /// next call re-opens.
    pub fn call(
        &self,
        backend: &dyn HidBackend,
        msg_in: &wire::Message,
    ) -> Result<wire::Message, KernelError> {
        let mut guard = self.lock();
        if guard.is_none() {
            let handle = backend.open(&self.path)?;
            *guard = Some(DeviceTransport::new(handle));
        }
        let transport = guard.as_mut().expect("device was just opened");

        let result = msg_in
            .write_to(transport)
            .and_then(|()| wire::Message::read_from(transport));
        match result {
            Ok(reply) => Ok(reply),
            Err(err) => {
                *guard = None;
                Err(err.into())
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<DeviceTransport>> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct ActiveConfig {
    config: SignedConfig,
    schema: SchemaStore,
}

#[derive(Default)]
struct State {
    sessions: HashMap<DevicePath, SessionId>,
    device_kernels: HashMap<DevicePath, Arc<DeviceKernel>>,
    device_executors: HashMap<DevicePath, Arc<Executor>>,
    active: Option<Arc<ActiveConfig>>,
}

/// Session/device resolution result; produced under a single lock so a
/// concurrent release cannot slip a stale executor past us.
pub struct SessionHandles {
    pub path: DevicePath,
    pub device: Arc<DeviceKernel>,
    pub executor: Arc<Executor>,
}

/// The daemon kernel.
pub struct Kernel {
    backend: Arc<dyn HidBackend>,
    keys: Vec<VerifyingKey>,
    enumeration_executor: Executor,
    state: Mutex<State>,
}

impl Kernel {
    /// Kernel trusting the built-in pinned configuration keys.
    pub fn new(backend: Arc<dyn HidBackend>) -> Self {
        Self::with_keys(backend, builtin_keys())
    }

    /// Kernel trusting an explicit key list.
    pub fn with_keys(backend: Arc<dyn HidBackend>, keys: Vec<VerifyingKey>) -> Self {
        Self {
            backend,
            keys,
            enumeration_executor: Executor::new("enumeration"),
            state: Mutex::new(State::default()),
        }
    }

    /// Daemon version reported by the index route.
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// The HID subsystem this kernel drives.
    pub fn backend(&self) -> Arc<dyn HidBackend> {
        Arc::clone(&self.backend)
    }

    /// The executor all hardware-touching enumeration work runs on.
    pub fn enumeration_executor(&self) -> &Executor {
        &self.enumeration_executor
    }

    // -- configuration ------------------------------------------------

    /// Validate a raw `sig || msg` blob and install it atomically.
    ///
    /// When `origin` is given, the *new* configuration must allow it.
    /// Nothing is replaced unless every step succeeds.
    pub fn set_config(&self, raw: &[u8], origin: Option<&str>) -> Result<(), KernelError> {
        let config = SignedConfig::from_signed_blob(raw, &self.keys)?;
        if !config.is_initialized() {
            return Err(KernelError::IncompleteConfig);
        }
        if !config.is_unexpired() {
            return Err(KernelError::ExpiredConfig);
        }
        if let Some(origin) = origin {
            if !config.is_url_allowed(origin) {
                return Err(KernelError::OriginNotAllowed);
            }
        }
        let schema = SchemaStore::load(&config.configuration().wire_protocol)?;

        let active = Arc::new(ActiveConfig { config, schema });
        self.lock_state().active = Some(active);
        info!("configuration installed");
        Ok(())
    }

    /// Whether a configuration is installed.
    pub fn has_config(&self) -> bool {
        self.lock_state().active.is_some()
    }

    /// The installed configuration's expiry, if any.
    pub fn valid_until(&self) -> Option<u64> {
        self.lock_state()
            .active
            .as_ref()
            .and_then(|a| a.config.configuration().valid_until)
    }

    /// Origin gate used by the CORS layer: everything is allowed until
    /// a configuration is installed; afterwards the configuration must
    /// be unexpired and its URL rules must admit the origin.
    pub fn is_allowed(&self, url: &str) -> bool {
        match self.lock_state().active.clone() {
            None => true,
            Some(active) => active.config.is_unexpired() && active.config.is_url_allowed(url),
        }
    }

    // -- enumeration --------------------------------------------------

    /// List supported devices joined with their sessions.
    ///
    /// The kernel lock is not held across the HID enumeration itself.
    pub fn enumerate(&self) -> Result<Vec<(DeviceInfo, Option<SessionId>)>, KernelError> {
        let active = self.active()?;
        let devices = self.backend.enumerate()?;

        let state = self.lock_state();
        Ok(devices
            .into_iter()
            .filter(|d| {
                active
                    .config
                    .is_device_supported(d.vendor_id, d.product_id)
            })
            .map(|d| {
                let session = state.sessions.get(&d.path).cloned();
                (d, session)
            })
            .collect())
    }

    /// Whether `path` currently enumerates as a supported device.
    pub fn is_path_supported(&self, path: &str) -> Result<bool, KernelError> {
        Ok(self.enumerate()?.iter().any(|(d, _)| d.path == path))
    }

    // -- sessions -----------------------------------------------------

    /// Bind a fresh session id to `path`, replacing any prior session.
    pub fn acquire(&self, path: &DevicePath) -> Result<SessionId, KernelError> {
        self.require_config()?;
        let session_id = Uuid::new_v4().to_string();
        let mut state = self.lock_state();
        state.sessions.insert(path.clone(), session_id.clone());
        debug!(session = %session_id, "session acquired");
        Ok(session_id)
    }

    /// Remove the session if it exists; succeeds either way.
    pub fn release(&self, session_id: &str) -> Result<(), KernelError> {
        self.require_config()?;
        let mut state = self.lock_state();
        let path = state
            .sessions
            .iter()
            .find(|(_, id)| id.as_str() == session_id)
            .map(|(path, _)| path.clone());
        if let Some(path) = path {
            state.sessions.remove(&path);
            debug!(session = %session_id, "session released");
        }
        Ok(())
    }

    /// Resolve a session to its path, device handle, and executor under
    /// one lock acquisition.
    pub fn resolve_session(&self, session_id: &str) -> Result<SessionHandles, KernelError> {
        self.require_config()?;
        let mut state = self.lock_state();
        let path = state
            .sessions
            .iter()
            .find(|(_, id)| id.as_str() == session_id)
            .map(|(path, _)| path.clone())
            .ok_or(KernelError::UnknownSession)?;

        let device = Self::device_kernel_entry(&mut state, &path);
        let executor = Self::device_executor_entry(&mut state, &path);
        Ok(SessionHandles {
            path,
            device,
            executor,
        })
    }

    /// Device handle and executor for a path, created on first demand.
    pub fn device_handles(
        &self,
        path: &DevicePath,
    ) -> Result<(Arc<DeviceKernel>, Arc<Executor>), KernelError> {
        self.require_config()?;
        let mut state = self.lock_state();
        let device = Self::device_kernel_entry(&mut state, path);
        let executor = Self::device_executor_entry(&mut state, path);
        Ok((device, executor))
    }

    // -- codecs -------------------------------------------------------

    /// Encode a typed JSON document into a wire frame.
    pub fn json_to_wire(&self, json: &serde_json::Value) -> Result<wire::Message, KernelError> {
        let active = self.active()?;
        let record = codec::from_typed_json(&active.schema, json)?;
        Ok(codec::encode_message(&active.schema, &record)?)
    }

    /// Decode a wire frame into its typed JSON document.
    pub fn wire_to_json(&self, msg: &wire::Message) -> Result<serde_json::Value, KernelError> {
        let active = self.active()?;
        let record = codec::decode_message(&active.schema, msg)?;
        Ok(codec::to_typed_json(&record)?)
    }

    // -- internals ----------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn active(&self) -> Result<Arc<ActiveConfig>, KernelError> {
        self.lock_state()
            .active
            .clone()
            .ok_or(KernelError::NotConfigured)
    }

    fn require_config(&self) -> Result<(), KernelError> {
        if self.has_config() {
            Ok(())
        } else {
            Err(KernelError::NotConfigured)
        }
    }

    fn device_kernel_entry(state: &mut State, path: &DevicePath) -> Arc<DeviceKernel> {
        state
            .device_kernels
            .entry(path.clone())
            .or_insert_with(|| Arc::new(DeviceKernel::new(path.clone())))
            .clone()
    }

    fn device_executor_entry(state: &mut State, path: &DevicePath) -> Arc<Executor> {
        let next = state.device_executors.len();
        state
            .device_executors
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Executor::new(&format!("device-{next}"))))
            .clone()
    }
}
