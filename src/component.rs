// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handle to an IL-style codec component.
//!
//! The component itself is provided by a [`ComponentBackend`], which exposes the raw
//! request/confirm interface: commands are sent with `send_command` and confirmed later through an
//! event delivered on an arbitrary thread of the component. [`Component`] tracks the confirmed
//! state, the last error and the ownership of every buffer, and lets callers block until the
//! component reaches a given state.
//!
//! Lock order: the event callback may run while a backend call is in progress, so the backend
//! lock may be held while the state lock is taken, but the backend must never be called with the
//! state lock held.

pub mod buffer;
pub mod params;
pub mod port;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use enumn::N;
use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::component::buffer::BufferFlags;
use crate::component::buffer::BufferHeader;
use crate::component::buffer::BufferId;
use crate::component::params::Param;
use crate::component::params::ParamIndex;
use crate::component::params::PortDefinition;
use crate::component::port::Port;
use crate::component::port::PortInner;

/// Timeout of each state change performed while shutting a component down.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Port index addressing every port of the component.
pub const ALL_PORTS: u32 = u32::MAX;

/// Lifecycle state of a component. States are ordered, `Pause` being the highest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum ComponentState {
    Invalid = 0,
    Loaded = 1,
    Idle = 2,
    Executing = 3,
    Pause = 4,
}

impl ComponentState {
    /// Whether a component in state `self` accepts a request to go to `target`.
    pub fn can_transition_to(self, target: ComponentState) -> bool {
        use ComponentState::*;

        matches!(
            (self, target),
            (_, Invalid)
                | (Invalid, Loaded)
                | (Loaded, Idle)
                | (Idle, Loaded)
                | (Idle, Executing)
                | (Idle, Pause)
                | (Executing, Idle)
                | (Executing, Pause)
                | (Pause, Idle)
                | (Pause, Executing)
        )
    }
}

/// Error codes reported by components.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    InsufficientResources = 0x8000_1000,
    Undefined = 0x8000_1001,
    InvalidComponentName = 0x8000_1002,
    ComponentNotFound = 0x8000_1003,
    BadParameter = 0x8000_1005,
    NotImplemented = 0x8000_1006,
    Underflow = 0x8000_1007,
    Overflow = 0x8000_1008,
    Hardware = 0x8000_1009,
    InvalidState = 0x8000_100a,
    StreamCorrupt = 0x8000_100b,
    PortsNotCompatible = 0x8000_100c,
    ResourcesLost = 0x8000_100d,
    NoMore = 0x8000_100e,
    VersionMismatch = 0x8000_100f,
    NotReady = 0x8000_1010,
    Timeout = 0x8000_1011,
    SameState = 0x8000_1012,
    ResourcesPreempted = 0x8000_1013,
    IncorrectStateTransition = 0x8000_1017,
    IncorrectStateOperation = 0x8000_1018,
    UnsupportedSetting = 0x8000_1019,
    UnsupportedIndex = 0x8000_101a,
    BadPortIndex = 0x8000_101b,
    PortUnpopulated = 0x8000_101c,
}

impl ErrorCode {
    /// Converts a raw code, mapping values we don't know about to `Undefined`.
    pub fn from_raw(raw: u32) -> Self {
        Self::n(raw).unwrap_or(ErrorCode::Undefined)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:08x})", self, *self as u32)
    }
}

impl std::error::Error for ErrorCode {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    StateSet(ComponentState),
    /// Return all the buffers of a port. `ALL_PORTS` flushes every port.
    Flush(u32),
    PortDisable(u32),
    PortEnable(u32),
}

/// Notifications sent by the component through its `EventSink`.
#[derive(Debug)]
pub enum ComponentEvent {
    CommandComplete(Command),
    /// Raw error code, as reported by the component.
    Error(u32),
    /// The format of the port changed and its buffers must be reallocated.
    PortSettingsChanged(u32),
    BufferFlag { port: u32, flags: BufferFlags },
    /// An input buffer has been consumed and is given back.
    EmptyBufferDone(BufferHeader),
    /// An output buffer has been filled and is given back.
    FillBufferDone(BufferHeader),
}

/// Callback through which a component delivers its events. It may be invoked from any thread,
/// including from within a backend call.
pub type EventSink = Arc<dyn Fn(ComponentEvent) + Send + Sync>;

/// The raw interface of a component.
///
/// All calls are non-blocking: commands complete asynchronously through the event sink given at
/// load time, and buffers passed to `empty_this_buffer` or `fill_this_buffer` come back through
/// buffer-done events.
pub trait ComponentBackend: Send {
    fn get_parameter(&mut self, index: ParamIndex, port: u32) -> Result<Param, ErrorCode>;
    fn set_parameter(&mut self, param: &Param) -> Result<(), ErrorCode>;
    fn send_command(&mut self, command: Command) -> Result<(), ErrorCode>;
    fn allocate_buffer(&mut self, port: u32, size: usize) -> Result<BufferHeader, ErrorCode>;
    fn free_buffer(&mut self, port: u32, id: BufferId) -> Result<(), ErrorCode>;
    fn empty_this_buffer(&mut self, buffer: BufferHeader) -> Result<(), ErrorCode>;
    fn fill_this_buffer(&mut self, buffer: BufferHeader) -> Result<(), ErrorCode>;
}

/// Source of component instances, typically a vendor core library.
pub trait ComponentLoader: Send + Sync {
    /// Instantiates the component described by `config`, in the `Loaded` state. Unknown component
    /// names and unsupported roles are errors.
    fn load(
        &self,
        config: &ComponentConfig,
        events: EventSink,
    ) -> Result<Box<dyn ComponentBackend>, ComponentError>;
}

/// Known component quirks to work around.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Hack {
    /// The component does not accept an empty buffer flagged as end of stream.
    NoEmptyEosBuffer,
    /// The component may never return the end of stream flag after a drain.
    DrainMayNotReturn,
    /// The component cannot be reconfigured and must be reopened on format changes.
    NoComponentReconfigure,
    /// The component reports a meaningless pixel aspect ratio.
    DefaultPixelAspectRatio,
}

impl FromStr for Hack {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-empty-eos-buffer" => Ok(Hack::NoEmptyEosBuffer),
            "drain-may-not-return" => Ok(Hack::DrainMayNotReturn),
            "no-component-reconfigure" => Ok(Hack::NoComponentReconfigure),
            "default-pixel-aspect-ratio" => Ok(Hack::DefaultPixelAspectRatio),
            _ => Err(format!("unknown hack {s:?}")),
        }
    }
}

/// Set of enabled hacks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Hacks {
    pub no_empty_eos_buffer: bool,
    pub drain_may_not_return: bool,
    pub no_component_reconfigure: bool,
    pub default_pixel_aspect_ratio: bool,
}

impl Hacks {
    pub fn contains(&self, hack: Hack) -> bool {
        match hack {
            Hack::NoEmptyEosBuffer => self.no_empty_eos_buffer,
            Hack::DrainMayNotReturn => self.drain_may_not_return,
            Hack::NoComponentReconfigure => self.no_component_reconfigure,
            Hack::DefaultPixelAspectRatio => self.default_pixel_aspect_ratio,
        }
    }

    pub fn insert(&mut self, hack: Hack) {
        match hack {
            Hack::NoEmptyEosBuffer => self.no_empty_eos_buffer = true,
            Hack::DrainMayNotReturn => self.drain_may_not_return = true,
            Hack::NoComponentReconfigure => self.no_component_reconfigure = true,
            Hack::DefaultPixelAspectRatio => self.default_pixel_aspect_ratio = true,
        }
    }
}

impl FromStr for Hacks {
    type Err = String;

    /// Parses a comma-separated list of hack names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut hacks = Hacks::default();
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            hacks.insert(name.parse()?);
        }
        Ok(hacks)
    }
}

/// Identity of a component and how to drive it.
#[derive(Clone, Debug, Default)]
pub struct ComponentConfig {
    /// Library providing the component.
    pub core_name: String,
    pub component_name: String,
    pub role: String,
    /// Index of the input port, discovered from the component when unset.
    pub in_port_index: Option<u32>,
    /// Index of the output port, discovered from the component when unset.
    pub out_port_index: Option<u32>,
    pub hacks: Hacks,
}

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("component {0} not found")]
    NotFound(String),
    #[error("component does not support role {0}")]
    UnsupportedRole(String),
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: ComponentState, to: ComponentState },
    #[error("timed out waiting for state {target:?}, component is in {current:?}")]
    StateTimeout { target: ComponentState, current: ComponentState },
    #[error("component in error state: {0}")]
    InError(ErrorCode),
    #[error("component call failed: {0}")]
    Call(#[from] ErrorCode),
    #[error("unexpected parameter block returned for {0:?}")]
    UnexpectedParam(ParamIndex),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// State tracked from the component's events.
pub(crate) struct ComponentInner {
    pub(crate) state: ComponentState,
    /// Target of the state transition in progress, if any.
    pub(crate) pending_state: Option<ComponentState>,
    /// Last error reported by the component. Cleared by the next confirmed state change.
    pub(crate) last_error: Option<ErrorCode>,
    pub(crate) ports: Vec<PortInner>,
}

impl ComponentInner {
    pub(crate) fn port(&self, index: u32) -> Option<&PortInner> {
        self.ports.iter().find(|port| port.index() == index)
    }

    pub(crate) fn port_mut(&mut self, index: u32) -> Option<&mut PortInner> {
        self.ports.iter_mut().find(|port| port.index() == index)
    }
}

/// The part of a component reachable from its event callback.
pub(crate) struct Core {
    inner: Mutex<ComponentInner>,
    cond: Condvar,
}

impl Core {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ComponentInner {
                state: ComponentState::Loaded,
                pending_state: None,
                last_error: None,
                ports: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ComponentInner> {
        self.inner.lock().unwrap()
    }

    pub(crate) fn notify(&self) {
        self.cond.notify_all();
    }

    /// Blocks until the next notification.
    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, ComponentInner>,
    ) -> MutexGuard<'a, ComponentInner> {
        self.cond.wait(guard).unwrap()
    }

    /// Blocks while `condition` holds, for at most `timeout` if one is given. Returns the guard
    /// and whether the wait timed out.
    pub(crate) fn wait_while<'a, F>(
        &self,
        guard: MutexGuard<'a, ComponentInner>,
        timeout: Option<Duration>,
        mut condition: F,
    ) -> (MutexGuard<'a, ComponentInner>, bool)
    where
        F: FnMut(&mut ComponentInner) -> bool,
    {
        match timeout {
            None => (self.cond.wait_while(guard, |inner| condition(inner)).unwrap(), false),
            Some(timeout) => {
                let (guard, res) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |inner| condition(inner))
                    .unwrap();
                (guard, res.timed_out())
            }
        }
    }

    fn handle_event(&self, event: ComponentEvent) {
        let mut inner = self.lock();

        match event {
            ComponentEvent::CommandComplete(Command::StateSet(state)) => {
                debug!("State change to {:?} finished", state);
                inner.state = state;
                inner.pending_state = None;
                inner.last_error = None;
            }
            ComponentEvent::CommandComplete(command) => {
                let index = match command {
                    Command::Flush(index)
                    | Command::PortDisable(index)
                    | Command::PortEnable(index) => index,
                    Command::StateSet(_) => unreachable!(),
                };
                debug!("Command {:?} finished", command);
                for port in inner.ports.iter_mut() {
                    if index == ALL_PORTS || port.index() == index {
                        port.command_complete(command);
                    }
                }
            }
            ComponentEvent::Error(raw) => {
                let code = ErrorCode::from_raw(raw);
                error!("Component reported error {}", code);
                inner.last_error = Some(code);
                inner.pending_state = None;
                if code == ErrorCode::InvalidState {
                    inner.state = ComponentState::Invalid;
                }
            }
            ComponentEvent::PortSettingsChanged(index) => match inner.port_mut(index) {
                Some(port) => {
                    debug!("Settings of port {} changed", index);
                    port.settings_changed();
                }
                None => warn!("Settings changed on unknown port {}", index),
            },
            ComponentEvent::BufferFlag { port, flags } => {
                if let Some(port) = inner.port_mut(port) {
                    port.buffer_flag(flags);
                }
            }
            ComponentEvent::EmptyBufferDone(header) | ComponentEvent::FillBufferDone(header) => {
                match inner.port_mut(header.port) {
                    Some(port) => port.buffer_done(header),
                    None => warn!("Buffer {} returned on unknown port {}", header.id, header.port),
                }
            }
        }

        drop(inner);
        self.notify();
    }
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) core: Arc<Core>,
    backend: Mutex<Box<dyn ComponentBackend>>,
}

impl Shared {
    pub(crate) fn backend(&self) -> MutexGuard<'_, Box<dyn ComponentBackend>> {
        self.backend.lock().unwrap()
    }

    pub(crate) fn query_port_definition(&self, index: u32) -> Result<PortDefinition, ErrorCode> {
        match self.backend().get_parameter(ParamIndex::PortDefinition, index)? {
            Param::PortDefinition(definition) => Ok(definition),
            _ => Err(ErrorCode::BadParameter),
        }
    }
}

/// A loaded component. Clones refer to the same component instance, which is released when the
/// last handle and port are dropped.
#[derive(Clone)]
pub struct Component {
    shared: Arc<Shared>,
    hacks: Hacks,
}

impl Component {
    /// Loads the component described by `config` through `loader`.
    pub fn open(
        loader: &dyn ComponentLoader,
        config: &ComponentConfig,
    ) -> Result<Self, ComponentError> {
        let core = Arc::new(Core::new());
        let weak_core = Arc::downgrade(&core);
        let events: EventSink = Arc::new(move |event| {
            if let Some(core) = weak_core.upgrade() {
                core.handle_event(event);
            }
        });

        let backend = loader.load(config, events)?;
        debug!("Opened component {} with role {}", config.component_name, config.role);

        Ok(Self {
            shared: Arc::new(Shared {
                name: config.component_name.clone(),
                core,
                backend: Mutex::new(backend),
            }),
            hacks: config.hacks,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn hacks(&self) -> Hacks {
        self.hacks
    }

    /// Starts tracking the port at `index` and returns a handle to it.
    pub fn add_port(&self, index: u32) -> Result<Port, ComponentError> {
        if self.shared.core.lock().port(index).is_some() {
            return Ok(Port::new(index, self.shared.clone()));
        }

        let definition = self.shared.query_port_definition(index)?;
        debug!("Adding port {} ({:?})", index, definition.direction);
        self.shared.core.lock().ports.push(PortInner::new(definition));

        Ok(Port::new(index, self.shared.clone()))
    }

    /// Returns a handle to a port previously added with `add_port`.
    pub fn port(&self, index: u32) -> Option<Port> {
        self.shared
            .core
            .lock()
            .port(index)
            .map(|_| Port::new(index, self.shared.clone()))
    }

    pub fn get_parameter(&self, index: ParamIndex, port: u32) -> Result<Param, ComponentError> {
        Ok(self.shared.backend().get_parameter(index, port)?)
    }

    pub fn set_parameter(&self, param: &Param) -> Result<(), ComponentError> {
        Ok(self.shared.backend().set_parameter(param)?)
    }

    /// Requests a transition to `target`. Completion is signalled asynchronously and can be
    /// awaited with `await_state`.
    ///
    /// Requesting the current state is a no-op. Requests that are invalid from the current state,
    /// or that go up while the component is in error, fail immediately.
    pub fn request_state(&self, target: ComponentState) -> Result<(), ComponentError> {
        let mut inner = self.shared.core.lock();
        let current = inner.pending_state.unwrap_or(inner.state);

        if current == target {
            debug!("Component {} already in state {:?}", self.shared.name, target);
            return Ok(());
        }
        if let Some(err) = inner.last_error {
            if target > current {
                return Err(ComponentError::InError(err));
            }
        }
        if !current.can_transition_to(target) {
            return Err(ComponentError::InvalidTransition { from: current, to: target });
        }

        debug!("Setting component {} from {:?} to {:?}", self.shared.name, current, target);
        inner.pending_state = Some(target);
        drop(inner);

        let res = self.shared.backend().send_command(Command::StateSet(target));
        if let Err(err) = res {
            let mut inner = self.shared.core.lock();
            if inner.pending_state == Some(target) {
                inner.pending_state = None;
            }
            return Err(err.into());
        }

        Ok(())
    }

    /// Returns the state of the component once the transition in progress, if any, completed.
    ///
    /// Waits for at most `timeout` if one is given, in which case the last confirmed state is
    /// returned. A component in error reports `Invalid`.
    pub fn get_state(&self, timeout: Option<Duration>) -> ComponentState {
        let inner = self.shared.core.lock();
        let (inner, timed_out) = self.shared.core.wait_while(inner, timeout, |inner| {
            inner.pending_state.is_some() && inner.last_error.is_none()
        });

        if inner.last_error.is_some() {
            return ComponentState::Invalid;
        }
        if timed_out {
            warn!(
                "Timed out waiting for state change of {}, still {:?}",
                self.shared.name, inner.state
            );
        }
        inner.state
    }

    /// Blocks until the component confirmed `target`, an error occurs or `timeout` elapses.
    pub fn await_state(
        &self,
        target: ComponentState,
        timeout: Duration,
    ) -> Result<(), ComponentError> {
        let inner = self.shared.core.lock();
        let (inner, _) = self.shared.core.wait_while(inner, Some(timeout), |inner| {
            inner.state != target && inner.last_error.is_none()
        });

        if inner.state == target {
            Ok(())
        } else if let Some(err) = inner.last_error {
            Err(ComponentError::InError(err))
        } else {
            Err(ComponentError::StateTimeout { target, current: inner.state })
        }
    }

    /// Last error reported by the component, if it did not recover from it.
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.shared.core.lock().last_error
    }

    /// Brings the component down to `Loaded` and frees the buffers of all its ports.
    ///
    /// Failures are logged and do not stop the shutdown, so this can be used on a component in
    /// error.
    pub fn shutdown(&self) {
        let (state, ports) = {
            let inner = self.shared.core.lock();
            let ports: Vec<u32> = inner.ports.iter().map(|port| port.index()).collect();
            (inner.pending_state.unwrap_or(inner.state), ports)
        };
        debug!("Shutting down component {} from {:?}", self.shared.name, state);

        if state <= ComponentState::Loaded && state != ComponentState::Invalid {
            return;
        }

        if state > ComponentState::Idle {
            if let Err(e) = self.request_state(ComponentState::Idle) {
                warn!("Failed to request idle state: {}", e);
            }
            if let Err(e) = self.await_state(ComponentState::Idle, SHUTDOWN_TIMEOUT) {
                warn!("Component did not go to idle: {}", e);
            }
        }

        if let Err(e) = self.request_state(ComponentState::Loaded) {
            warn!("Failed to request loaded state: {}", e);
        }

        for index in ports {
            if let Err(e) = Port::new(index, self.shared.clone()).deallocate_buffers() {
                warn!("Failed to deallocate buffers of port {}: {}", index, e);
            }
        }

        if state > ComponentState::Loaded {
            if let Err(e) = self.await_state(ComponentState::Loaded, SHUTDOWN_TIMEOUT) {
                warn!("Component did not go to loaded: {}", e);
            }
        }
    }

    /// Shuts the component down and releases this handle.
    pub fn close(self) {
        self.shutdown();
        debug!("Closed component {}", self.shared.name);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::backend::dummy::DummyLoader;
    use crate::backend::dummy::DummyOptions;

    fn open(options: DummyOptions) -> (Component, DummyLoader) {
        let loader = DummyLoader::new(options);
        let config = ComponentConfig {
            component_name: "dummy".into(),
            role: "video_decoder.avc".into(),
            ..Default::default()
        };
        (Component::open(&loader, &config).unwrap(), loader)
    }

    #[test]
    fn unknown_component_and_role() {
        let loader = DummyLoader::new(Default::default());
        let mut config = ComponentConfig {
            component_name: "nonexistent".into(),
            role: "video_decoder.avc".into(),
            ..Default::default()
        };
        assert!(matches!(
            Component::open(&loader, &config),
            Err(ComponentError::NotFound(_))
        ));

        config.component_name = "dummy".into();
        config.role = "video_encoder.avc".into();
        assert!(matches!(
            Component::open(&loader, &config),
            Err(ComponentError::UnsupportedRole(_))
        ));
    }

    #[test]
    fn state_transitions() {
        let (component, _loader) = open(Default::default());
        let in_port = component.add_port(0).unwrap();
        let out_port = component.add_port(1).unwrap();

        assert_eq!(component.get_state(None), ComponentState::Loaded);
        assert!(matches!(
            component.request_state(ComponentState::Executing),
            Err(ComponentError::InvalidTransition { .. })
        ));

        component.request_state(ComponentState::Idle).unwrap();
        in_port.allocate_buffers().unwrap();
        out_port.allocate_buffers().unwrap();
        component.await_state(ComponentState::Idle, SHUTDOWN_TIMEOUT).unwrap();

        // Same state is a no-op.
        component.request_state(ComponentState::Idle).unwrap();

        component.request_state(ComponentState::Executing).unwrap();
        assert_eq!(component.get_state(Some(SHUTDOWN_TIMEOUT)), ComponentState::Executing);

        component.shutdown();
        assert_eq!(component.get_state(None), ComponentState::Loaded);
        assert_eq!(in_port.num_buffers(), 0);
        assert_eq!(out_port.num_buffers(), 0);
    }

    #[test]
    fn await_state_times_out() {
        let (component, _loader) = open(Default::default());
        component.add_port(0).unwrap();
        component.add_port(1).unwrap();

        // Idle cannot be reached without buffers.
        component.request_state(ComponentState::Idle).unwrap();
        let start = Instant::now();
        let res = component.await_state(ComponentState::Idle, Duration::from_millis(100));

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(matches!(
            res,
            Err(ComponentError::StateTimeout {
                target: ComponentState::Idle,
                current: ComponentState::Loaded
            })
        ));
        assert_eq!(
            component.get_state(Some(Duration::from_millis(10))),
            ComponentState::Loaded
        );
    }

    #[test]
    fn error_blocks_upward_transitions() {
        let (component, loader) = open(Default::default());
        component.add_port(0).unwrap();
        component.add_port(1).unwrap();

        loader.inject_error(ErrorCode::Hardware);
        let start = Instant::now();
        while component.last_error().is_none() {
            assert!(start.elapsed() < SHUTDOWN_TIMEOUT);
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(component.get_state(None), ComponentState::Invalid);
        assert!(matches!(
            component.request_state(ComponentState::Idle),
            Err(ComponentError::InError(ErrorCode::Hardware))
        ));
    }

    #[test]
    fn hacks_from_str() {
        let hacks: Hacks = "no-empty-eos-buffer, drain-may-not-return".parse().unwrap();
        assert!(hacks.contains(Hack::NoEmptyEosBuffer));
        assert!(hacks.contains(Hack::DrainMayNotReturn));
        assert!(!hacks.contains(Hack::NoComponentReconfigure));

        assert_eq!("".parse::<Hacks>(), Ok(Hacks::default()));
        assert!("no-such-hack".parse::<Hacks>().is_err());
    }

    #[test]
    fn error_codes() {
        assert_eq!(ErrorCode::from_raw(0x8000_100b), ErrorCode::StreamCorrupt);
        assert_eq!(ErrorCode::from_raw(0x1234), ErrorCode::Undefined);
        assert_eq!(ErrorCode::Hardware.to_string(), "Hardware (0x80001009)");
    }
}
