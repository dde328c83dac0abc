// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ports of a component and the ownership of their buffers.
//!
//! Every buffer of a port is at any time owned by exactly one party: the port itself (the buffer
//! is queued and can be acquired), the caller (the buffer has been acquired and not released
//! yet), or the component (the buffer has been handed over for filling or emptying). Acquiring
//! blocks until a buffer is queued, and can be cancelled by setting the port flushing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use log::debug;
use log::error;
use thiserror::Error;

use crate::component::buffer::BufferFlags;
use crate::component::buffer::BufferHeader;
use crate::component::buffer::BufferId;
use crate::component::buffer::Slot;
use crate::component::params::Direction;
use crate::component::params::Param;
use crate::component::params::PortDefinition;
use crate::component::Command;
use crate::component::ComponentState;
use crate::component::ErrorCode;
use crate::component::Shared;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("component error: {0}")]
    Component(#[from] ErrorCode),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0} buffers are still owned by the component")]
    BuffersOutstanding(usize),
    #[error("buffers are already allocated")]
    AlreadyAllocated,
    #[error("port is populated and enabled, its definition cannot change")]
    Populated,
    #[error("buffer {0} is not owned by the caller")]
    NotOwned(BufferId),
}

/// Result of `Port::acquire_buffer`.
#[derive(Debug)]
pub enum AcquireOutcome {
    Buffer(Slot),
    /// The port is flushing. No buffer can be acquired until it is unset.
    Flushing,
    /// The component signalled the end of the stream and every output buffer has been acquired.
    EndOfStream,
    /// The port settings changed. The port must be reconfigured, then `mark_reconfigured` called.
    Reconfigure,
    ComponentError(ErrorCode),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Owner {
    Port,
    Caller,
    Component,
}

struct SlotEntry {
    id: BufferId,
    owner: Owner,
}

/// Bookkeeping of one port, protected by the component state lock.
pub(crate) struct PortInner {
    definition: PortDefinition,
    slots: Vec<SlotEntry>,
    /// Buffers owned by the port, in the order they were returned.
    pending: VecDeque<BufferHeader>,
    /// Bumped every time the buffers are reallocated.
    generation: u64,
    flushing: bool,
    /// Whether the last flush command has completed.
    flushed: bool,
    enabled: bool,
    /// Target of the enable or disable command in flight, if any.
    enable_pending: Option<bool>,
    settings_changed: bool,
    eos: bool,
}

impl PortInner {
    pub(crate) fn new(definition: PortDefinition) -> Self {
        Self {
            enabled: definition.enabled,
            definition,
            slots: Vec::new(),
            pending: VecDeque::new(),
            generation: 0,
            flushing: false,
            flushed: true,
            enable_pending: None,
            settings_changed: false,
            eos: false,
        }
    }

    pub(crate) fn index(&self) -> u32 {
        self.definition.index
    }

    fn is_output(&self) -> bool {
        self.definition.direction == Direction::Output
    }

    /// Whether buffers released on this port must stay with the port.
    fn is_holding(&self) -> bool {
        self.flushing || !self.enabled || self.enable_pending == Some(false)
    }

    fn count(&self, owner: Owner) -> usize {
        self.slots.iter().filter(|slot| slot.owner == owner).count()
    }

    fn slot_mut(&mut self, id: BufferId) -> Option<&mut SlotEntry> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    pub(crate) fn command_complete(&mut self, command: Command) {
        match command {
            Command::Flush(_) => self.flushed = true,
            Command::PortEnable(_) => {
                self.enabled = true;
                self.enable_pending = None;
            }
            Command::PortDisable(_) => {
                self.enabled = false;
                self.enable_pending = None;
            }
            Command::StateSet(_) => (),
        }
    }

    pub(crate) fn settings_changed(&mut self) {
        self.settings_changed = true;
    }

    pub(crate) fn buffer_flag(&mut self, flags: BufferFlags) {
        if self.is_output() && flags.contains(BufferFlags::EOS) {
            debug!("Port {} got EOS flag", self.index());
            self.eos = true;
        }
    }

    pub(crate) fn buffer_done(&mut self, header: BufferHeader) {
        let index = self.index();
        let is_output = self.is_output();
        let Some(slot) = self.slot_mut(header.id) else {
            debug!("Dropping buffer {} returned after port {} was reallocated", header.id, index);
            return;
        };
        if slot.owner != Owner::Component {
            error!("Component returned buffer {} it did not own ({:?})", header.id, slot.owner);
        }
        slot.owner = Owner::Port;

        if is_output && header.flags.contains(BufferFlags::EOS) {
            debug!("Output buffer {} carries EOS", header.id);
            self.eos = true;
        }
        self.pending.push_back(header);
    }
}

/// Handle to a port of a component.
#[derive(Clone)]
pub struct Port {
    index: u32,
    shared: Arc<Shared>,
}

/// Weak reference to a port that does not keep the component alive.
#[derive(Clone)]
pub struct WeakPort {
    index: u32,
    shared: Weak<Shared>,
}

impl WeakPort {
    pub fn upgrade(&self) -> Option<Port> {
        self.shared.upgrade().map(|shared| Port { index: self.index, shared })
    }
}

impl Port {
    pub(crate) fn new(index: u32, shared: Arc<Shared>) -> Self {
        Self { index, shared }
    }

    /// Runs `f` on this port's bookkeeping, under the state lock.
    fn with_inner<R>(&self, f: impl FnOnce(&mut PortInner) -> R) -> Option<R> {
        let mut inner = self.shared.core.lock();
        inner.port_mut(self.index).map(f)
    }

    /// Remembers `err` as the component's error unless one is already set.
    fn record_error(&self, err: ErrorCode) {
        let mut inner = self.shared.core.lock();
        inner.last_error.get_or_insert(err);
        drop(inner);
        self.shared.core.notify();
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn downgrade(&self) -> WeakPort {
        WeakPort { index: self.index, shared: Arc::downgrade(&self.shared) }
    }

    /// Last known definition of the port.
    pub fn definition(&self) -> Option<PortDefinition> {
        self.with_inner(|port| port.definition.clone())
    }

    pub fn is_output(&self) -> bool {
        self.with_inner(|port| port.is_output()).unwrap_or(false)
    }

    pub fn is_flushing(&self) -> bool {
        self.with_inner(|port| port.flushing).unwrap_or(true)
    }

    pub fn is_enabled(&self) -> bool {
        self.with_inner(|port| port.enabled).unwrap_or(false)
    }

    pub fn num_buffers(&self) -> usize {
        self.with_inner(|port| port.slots.len()).unwrap_or(0)
    }

    /// Number of buffers currently owned by the caller or by the component.
    pub fn num_outstanding(&self) -> usize {
        self.with_inner(|port| port.count(Owner::Caller) + port.count(Owner::Component))
            .unwrap_or(0)
    }

    /// Takes ownership of the next buffer queued on the port, blocking until one is available.
    ///
    /// A component error takes precedence over everything else, then flushing. On output ports
    /// queued buffers are returned before reporting a settings change or the end of the stream,
    /// on input ports a settings change is reported first. Disabled ports block.
    pub fn acquire_buffer(&self) -> AcquireOutcome {
        let core = &self.shared.core;
        let mut inner = core.lock();

        loop {
            if let Some(err) = inner.last_error {
                debug!("Component in error state: {}", err);
                return AcquireOutcome::ComponentError(err);
            }

            let Some(port) = inner.port_mut(self.index) else {
                return AcquireOutcome::ComponentError(ErrorCode::BadPortIndex);
            };

            if port.flushing {
                debug!("Port {} is flushing", self.index);
                return AcquireOutcome::Flushing;
            }

            let usable = port.enabled && port.enable_pending.is_none();
            if port.is_output() {
                if usable {
                    if let Some(header) = port.pending.pop_front() {
                        return self.hand_out(port, header);
                    }
                }
                if port.settings_changed {
                    return AcquireOutcome::Reconfigure;
                }
                if port.eos {
                    return AcquireOutcome::EndOfStream;
                }
            } else {
                if port.settings_changed {
                    return AcquireOutcome::Reconfigure;
                }
                if usable {
                    if let Some(header) = port.pending.pop_front() {
                        return self.hand_out(port, header);
                    }
                }
            }

            inner = core.wait(inner);
        }
    }

    fn hand_out(&self, port: &mut PortInner, header: BufferHeader) -> AcquireOutcome {
        if let Some(slot) = port.slot_mut(header.id) {
            slot.owner = Owner::Caller;
        }
        AcquireOutcome::Buffer(Slot::new(header, port.generation))
    }

    /// Gives `slot` back. Unless the port is flushing or disabled, the buffer goes straight to
    /// the component: input buffers to be consumed, output buffers to be filled.
    ///
    /// Slots acquired before the port was reallocated are dropped.
    pub fn release_buffer(&self, slot: Slot) -> Result<(), PortError> {
        let mut inner = self.shared.core.lock();
        let last_error = inner.last_error;
        let Some(port) = inner.port_mut(self.index) else {
            return Err(PortError::Component(ErrorCode::BadPortIndex));
        };

        if slot.generation() != port.generation {
            debug!("Dropping stale buffer {} of port {}", slot.id, self.index);
            return Ok(());
        }

        let id = slot.id;
        let is_output = port.is_output();
        let holding = port.is_holding();
        let Some(entry) = port.slot_mut(id) else {
            debug!("Dropping unknown buffer {} of port {}", id, self.index);
            return Ok(());
        };
        if entry.owner != Owner::Caller {
            return Err(PortError::NotOwned(id));
        }

        let mut header = slot.into_header();
        if last_error.is_some() || holding {
            debug!("Port {} not accepting buffers, keeping buffer {}", self.index, id);
            entry.owner = Owner::Port;
            header.reset();
            port.pending.push_back(header);
            drop(inner);
            self.shared.core.notify();

            return match last_error {
                Some(err) => Err(err.into()),
                None => Ok(()),
            };
        }

        entry.owner = Owner::Component;
        drop(inner);

        if is_output {
            header.reset();
        }
        let mut backend = self.shared.backend();
        let res = if is_output {
            backend.fill_this_buffer(header)
        } else {
            backend.empty_this_buffer(header)
        };
        drop(backend);

        res.map_err(|err| {
            error!("Failed to release buffer {} to port {}: {}", id, self.index, err);
            self.record_error(err);
            err.into()
        })
    }

    /// Sets or unsets the flushing state.
    ///
    /// Setting it wakes any blocked acquirer immediately, then asks the component to return all
    /// the buffers of the port and waits up to `timeout` for that to complete. Unsetting it also
    /// clears the end of stream condition.
    pub fn set_flushing(&self, timeout: Duration, flush: bool) -> Result<(), PortError> {
        let core = &self.shared.core;
        let mut inner = core.lock();
        let state = inner.state;
        let Some(port) = inner.port_mut(self.index) else {
            return Ok(());
        };

        if port.flushing == flush {
            debug!("Port {} flushing already {}", self.index, flush);
            return Ok(());
        }
        port.flushing = flush;

        if !flush {
            port.eos = false;
            drop(inner);
            core.notify();
            debug!("Port {} not flushing anymore", self.index);
            return Ok(());
        }

        let needs_command = port.enabled
            && matches!(
                state,
                ComponentState::Idle | ComponentState::Executing | ComponentState::Pause
            );
        if needs_command {
            port.flushed = false;
        }
        drop(inner);
        core.notify();

        if !needs_command {
            return Ok(());
        }

        debug!("Flushing port {}", self.index);
        if let Err(err) = self.shared.backend().send_command(Command::Flush(self.index)) {
            self.record_error(err);
            return Err(err.into());
        }

        let inner = core.lock();
        let (inner, timed_out) = core.wait_while(inner, Some(timeout), |inner| {
            inner.last_error.is_none()
                && inner.port(self.index).map(|port| !port.flushed).unwrap_or(false)
        });

        if let Some(err) = inner.last_error {
            return Err(err.into());
        }
        if timed_out {
            error!("Timed out flushing port {}", self.index);
            return Err(PortError::Timeout(timeout));
        }

        debug!("Port {} flushed", self.index);
        Ok(())
    }

    /// Asks the component to enable or disable the port. Completion can be awaited with
    /// `wait_enabled`.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), PortError> {
        let mut inner = self.shared.core.lock();
        if let Some(err) = inner.last_error {
            return Err(err.into());
        }
        let Some(port) = inner.port_mut(self.index) else {
            return Ok(());
        };
        if port.enabled == enabled && port.enable_pending.is_none() {
            debug!("Port {} already {}", self.index, if enabled { "enabled" } else { "disabled" });
            return Ok(());
        }
        port.enable_pending = Some(enabled);
        drop(inner);
        self.shared.core.notify();

        debug!("{} port {}", if enabled { "Enabling" } else { "Disabling" }, self.index);
        let command = if enabled {
            Command::PortEnable(self.index)
        } else {
            Command::PortDisable(self.index)
        };

        if let Err(err) = self.shared.backend().send_command(command) {
            self.with_inner(|port| port.enable_pending = None);
            self.record_error(err);
            return Err(err.into());
        }

        Ok(())
    }

    /// Waits for the enable or disable command in flight, if any, to complete.
    pub fn wait_enabled(&self, timeout: Duration) -> Result<(), PortError> {
        let core = &self.shared.core;
        let inner = core.lock();
        let (inner, timed_out) = core.wait_while(inner, Some(timeout), |inner| {
            inner.last_error.is_none()
                && inner
                    .port(self.index)
                    .map(|port| port.enable_pending.is_some())
                    .unwrap_or(false)
        });

        if let Some(err) = inner.last_error {
            return Err(err.into());
        }
        if timed_out {
            return Err(PortError::Timeout(timeout));
        }
        Ok(())
    }

    /// Waits until neither the caller nor the component owns any buffer of the port.
    pub fn wait_buffers_released(&self, timeout: Duration) -> Result<(), PortError> {
        let core = &self.shared.core;
        let inner = core.lock();
        let (inner, timed_out) = core.wait_while(inner, Some(timeout), |inner| {
            inner.last_error.is_none()
                && inner
                    .port(self.index)
                    .map(|port| port.count(Owner::Caller) + port.count(Owner::Component) > 0)
                    .unwrap_or(false)
        });

        if let Some(err) = inner.last_error {
            return Err(err.into());
        }
        if timed_out {
            error!("Timed out waiting for the buffers of port {} to be released", self.index);
            return Err(PortError::Timeout(timeout));
        }
        Ok(())
    }

    /// Allocates the number of buffers required by the current port definition. The new buffers
    /// are all owned by the port.
    pub fn allocate_buffers(&self) -> Result<(), PortError> {
        {
            let inner = self.shared.core.lock();
            if let Some(err) = inner.last_error {
                return Err(err.into());
            }
            if inner.port(self.index).map(|port| !port.slots.is_empty()).unwrap_or(false) {
                return Err(PortError::AlreadyAllocated);
            }
        }

        let definition = self.shared.query_port_definition(self.index)?;
        let count = definition.buffer_count_actual as usize;
        debug!(
            "Allocating {} buffers of {} bytes on port {}",
            count, definition.buffer_size, self.index
        );

        let mut headers = Vec::with_capacity(count);
        {
            let mut backend = self.shared.backend();
            for _ in 0..count {
                match backend.allocate_buffer(self.index, definition.buffer_size) {
                    Ok(header) => headers.push(header),
                    Err(err) => {
                        for header in &headers {
                            let _ = backend.free_buffer(self.index, header.id);
                        }
                        drop(backend);
                        self.record_error(err);
                        return Err(err.into());
                    }
                }
            }
        }

        self.with_inner(|port| {
            port.definition = definition;
            port.generation += 1;
            port.slots = headers
                .iter()
                .map(|header| SlotEntry { id: header.id, owner: Owner::Port })
                .collect();
            port.pending = headers.into();
        });
        self.shared.core.notify();

        Ok(())
    }

    /// Frees all the buffers of the port.
    ///
    /// Fails if the component still owns any of them. Buffers owned by the caller are forgotten,
    /// and dropped when they are eventually released.
    pub fn deallocate_buffers(&self) -> Result<(), PortError> {
        let ids = {
            let mut inner = self.shared.core.lock();
            let Some(port) = inner.port_mut(self.index) else {
                return Ok(());
            };

            let held = port.count(Owner::Component);
            if held > 0 {
                error!("Cannot deallocate port {}: component owns {} buffers", self.index, held);
                return Err(PortError::BuffersOutstanding(held));
            }

            port.pending.clear();
            port.generation += 1;
            port.slots.drain(..).map(|slot| slot.id).collect::<Vec<_>>()
        };

        if ids.is_empty() {
            return Ok(());
        }

        debug!("Deallocating {} buffers of port {}", ids.len(), self.index);
        let mut res = Ok(());
        {
            let mut backend = self.shared.backend();
            for id in ids {
                if let Err(err) = backend.free_buffer(self.index, id) {
                    error!("Failed to free buffer {} of port {}: {}", id, self.index, err);
                    if res.is_ok() {
                        res = Err(err.into());
                    }
                }
            }
        }
        self.shared.core.notify();

        res
    }

    /// Hands every queued buffer of an output port to the component for filling.
    ///
    /// Does nothing on input ports, or while the port is flushing or disabled.
    pub fn populate(&self) -> Result<(), PortError> {
        let headers = {
            let mut inner = self.shared.core.lock();
            if let Some(err) = inner.last_error {
                return Err(err.into());
            }
            let Some(port) = inner.port_mut(self.index) else {
                return Ok(());
            };
            if !port.is_output() || port.is_holding() {
                return Ok(());
            }

            let headers: Vec<BufferHeader> = port.pending.drain(..).collect();
            for header in &headers {
                if let Some(slot) = port.slot_mut(header.id) {
                    slot.owner = Owner::Component;
                }
            }
            headers
        };

        debug!("Populating port {} with {} buffers", self.index, headers.len());
        let mut backend = self.shared.backend();
        for mut header in headers {
            header.reset();
            if let Err(err) = backend.fill_this_buffer(header) {
                drop(backend);
                self.record_error(err);
                return Err(err.into());
            }
        }

        Ok(())
    }

    /// Acknowledges a settings change reported through `AcquireOutcome::Reconfigure`.
    pub fn mark_reconfigured(&self) {
        self.with_inner(|port| port.settings_changed = false);
        self.shared.core.notify();
    }

    /// Puts an output port in the end of stream condition, as if the component had returned a
    /// buffer flagged EOS.
    pub fn signal_eos(&self) {
        self.with_inner(|port| port.eos = true);
        self.shared.core.notify();
    }

    /// Pushes `definition` to the component if given, then refreshes the cached definition.
    ///
    /// A new definition is refused while the port is enabled and has buffers allocated.
    pub fn update_port_definition(
        &self,
        definition: Option<&PortDefinition>,
    ) -> Result<(), PortError> {
        if let Some(definition) = definition {
            let populated = self
                .with_inner(|port| port.enabled && !port.slots.is_empty())
                .unwrap_or(false);
            if populated {
                return Err(PortError::Populated);
            }

            debug!("Updating definition of port {}", self.index);
            self.shared.backend().set_parameter(&Param::PortDefinition(definition.clone()))?;
        }

        let definition = self.shared.query_port_definition(self.index)?;
        self.with_inner(|port| port.definition = definition);

        Ok(())
    }
}
