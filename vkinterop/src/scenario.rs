// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Verification sequences that prove the export/import semantics hold on a device.
//!
//! Every scenario provisions its own device with the extensions its handle type needs, runs a
//! fixed sequence of exports, imports, signals and waits, and reports one of three outcomes:
//!
//! - [`ScenarioOutcome::Pass`] when every step succeeded and every check held.
//! - [`ScenarioOutcome::Skip`] when the device, the driver or the OS lacks support for the
//!   combination. A skip is never a failure.
//! - [`ScenarioOutcome::Fail`] otherwise.
//!
//! Sync scenarios are written once against [`SyncPrimitive`] and run for both semaphores and
//! fences. Whether a scenario expects aliasing or a snapshot is decided by the
//! [`Transference`] of the handle type under test.

use crate::{
    capabilities::{query_buffer_support, query_image_support},
    carrier::{import_twice, ExternalHandleType},
    device::{Device, DeviceCreateInfo, DeviceExtensions, PhysicalDevice, Queue},
    handle::{HandleKind, NativeHandle},
    memory::{
        choose_host_visible_memory_type, choose_memory_type, Buffer, BufferCreateInfo,
        BufferUsage, DedicatedAllocation, DeviceMemory, ExternalMemoryHandleType, Format, Image,
        ImageCreateInfo, ImageUsage, MemoryRequirements,
    },
    relay,
    submit::{CommandSubmission, SubmissionConfig, SyncPrimitive},
    sync::{
        ExternalFenceHandleType, ExternalSemaphoreHandleType, Fence, Permanence, Semaphore,
        Transference,
    },
    InteropError,
};
use std::{
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
    sync::Arc,
    time::Duration,
};

const SEMAPHORE_HANDLE_TYPES: [ExternalSemaphoreHandleType; 5] = [
    ExternalSemaphoreHandleType::OpaqueFd,
    ExternalSemaphoreHandleType::OpaqueWin32,
    ExternalSemaphoreHandleType::OpaqueWin32Kmt,
    ExternalSemaphoreHandleType::D3D12Fence,
    ExternalSemaphoreHandleType::SyncFd,
];

const FENCE_HANDLE_TYPES: [ExternalFenceHandleType; 4] = [
    ExternalFenceHandleType::OpaqueFd,
    ExternalFenceHandleType::OpaqueWin32,
    ExternalFenceHandleType::OpaqueWin32Kmt,
    ExternalFenceHandleType::SyncFd,
];

const MEMORY_HANDLE_TYPES: [ExternalMemoryHandleType; 5] = [
    ExternalMemoryHandleType::OpaqueFd,
    ExternalMemoryHandleType::OpaqueWin32,
    ExternalMemoryHandleType::OpaqueWin32Kmt,
    ExternalMemoryHandleType::DmaBuf,
    ExternalMemoryHandleType::AndroidHardwareBuffer,
];

const MEMORY_BUFFER_SIZE: u64 = 1024;
const MEMORY_DATA_SEED: u32 = 0x7a3c_91e5;
const SOCKET_PAYLOAD: &[u8; 4] = b"deqp";

/// Tunables of the scenarios.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScenarioConfig {
    /// How many times the multiple-exports scenarios export the same object.
    ///
    /// The default value is `1024`.
    pub export_count: u32,

    /// How many objects the multiple-imports scenarios import the same handle into.
    ///
    /// The default value is `4096`.
    pub import_count: u32,

    /// The GPU work submitted before signals that must still be pending when the payload is
    /// exported.
    ///
    /// The default value is [`SubmissionConfig::default()`].
    pub submission: SubmissionConfig,
}

impl Default for ScenarioConfig {
    #[inline]
    fn default() -> Self {
        Self {
            export_count: 1024,
            import_count: 4096,
            submission: SubmissionConfig::default(),
        }
    }
}

/// What every scenario needs: a physical device to provision devices from, and the tunables.
#[derive(Clone, Debug)]
pub struct ScenarioContext {
    physical_device: Arc<PhysicalDevice>,
    config: ScenarioConfig,
}

impl ScenarioContext {
    #[inline]
    pub fn new(physical_device: Arc<PhysicalDevice>, config: ScenarioConfig) -> Self {
        Self {
            physical_device,
            config,
        }
    }

    /// Like [`new`](Self::new), but first calibrates `config.submission` on a device provisioned
    /// from `physical_device`.
    pub fn calibrated(
        physical_device: Arc<PhysicalDevice>,
        mut config: ScenarioConfig,
    ) -> Result<Self, InteropError> {
        let (_device, queue) = Device::new(physical_device.clone(), DeviceCreateInfo::default())?;
        config.submission = SubmissionConfig::calibrate(&queue, config.submission)?;

        Ok(Self::new(physical_device, config))
    }

    #[inline]
    pub fn physical_device(&self) -> &Arc<PhysicalDevice> {
        &self.physical_device
    }

    #[inline]
    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn provision(
        &self,
        enabled_extensions: DeviceExtensions,
    ) -> Result<(Arc<Device>, Arc<Queue>), InteropError> {
        Device::new(
            self.physical_device.clone(),
            DeviceCreateInfo {
                enabled_extensions,
                ..Default::default()
            },
        )
    }
}

/// Why a scenario did not pass.
#[derive(Debug)]
pub enum ScenarioError {
    /// An operation failed. Errors for which [`InteropError::is_skip`] is true turn into skips.
    Interop(InteropError),

    /// An operation succeeded, but what it observed contradicts the expected semantics.
    CheckFailed(String),
}

impl Error for ScenarioError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Interop(err) => Some(err),
            Self::CheckFailed(_) => None,
        }
    }
}

impl Display for ScenarioError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Interop(_) => write!(f, "an operation failed"),
            Self::CheckFailed(problem) => write!(f, "check failed: {}", problem),
        }
    }
}

impl From<InteropError> for ScenarioError {
    #[inline]
    fn from(err: InteropError) -> Self {
        Self::Interop(err)
    }
}

macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(ScenarioError::CheckFailed(format!($($arg)+)));
        }
    };
}

/// The result of one scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScenarioOutcome {
    Pass,
    Fail(String),
    Skip(String),
}

impl ScenarioOutcome {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[inline]
    pub fn is_fail(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    #[inline]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }
}

/// A named scenario outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioReport {
    pub name: String,
    pub outcome: ScenarioOutcome,
}

/// Runs `scenario` and classifies its result.
pub fn run_scenario(
    name: &str,
    scenario: impl FnOnce() -> Result<(), ScenarioError>,
) -> ScenarioOutcome {
    let outcome = match scenario() {
        Ok(()) => ScenarioOutcome::Pass,
        Err(ScenarioError::Interop(err)) if err.is_skip() => ScenarioOutcome::Skip(err.to_string()),
        Err(ScenarioError::Interop(err)) => ScenarioOutcome::Fail(error_chain(&err)),
        Err(err) => ScenarioOutcome::Fail(err.to_string()),
    };

    match &outcome {
        ScenarioOutcome::Pass => log::info!("{}: pass", name),
        ScenarioOutcome::Skip(reason) => log::warn!("{}: skipped: {}", name, reason),
        ScenarioOutcome::Fail(reason) => log::error!("{}: failed: {}", name, reason),
    }

    outcome
}

fn error_chain(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();

    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }

    message
}

/// Runs every scenario for every handle type, in a fixed order.
pub fn run_all(ctx: &ScenarioContext) -> Vec<ScenarioReport> {
    let mut reports = Vec::new();
    let mut report = |name: String, outcome: ScenarioOutcome| {
        reports.push(ScenarioReport { name, outcome });
    };

    for handle_type in SEMAPHORE_HANDLE_TYPES {
        for scenario in SyncScenario::ALL {
            let name = scenario_name::<Semaphore>(handle_type, scenario.name());
            let outcome = run_scenario(&name, || scenario.run::<Semaphore>(ctx, handle_type));
            report(name, outcome);
        }
    }

    for handle_type in FENCE_HANDLE_TYPES {
        for scenario in SyncScenario::ALL {
            let name = scenario_name::<Fence>(handle_type, scenario.name());
            let outcome = run_scenario(&name, || scenario.run::<Fence>(ctx, handle_type));
            report(name, outcome);
        }

        let name = scenario_name::<Fence>(handle_type, "copy_zero_timeout");
        let outcome = run_scenario(&name, || copy_fence_zero_timeout(ctx, handle_type));
        report(name, outcome);
    }

    for handle_type in MEMORY_HANDLE_TYPES {
        for scenario in MemoryScenario::ALL {
            let host_visible_variants: &[bool] = if scenario.uses_host_access() {
                &[false, true]
            } else {
                &[false]
            };

            for &host_visible in host_visible_variants {
                let mut name = format!("memory.{}.{}", handle_type.name(), scenario.name());
                if host_visible {
                    name.push_str(".host_visible");
                }

                let outcome =
                    run_scenario(&name, || scenario.run(ctx, handle_type, host_visible));
                report(name, outcome);
            }
        }
    }

    reports
}

fn scenario_name<S: SyncPrimitive>(handle_type: S::HandleType, scenario: &str) -> String {
    format!("{}.{}.{}", S::CLASS, handle_type.name(), scenario)
}

/// The scenarios shared by semaphores and fences.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncScenario {
    /// Two imports of one exported handle share the payload.
    ImportTwice,
    /// A second handle of the same payload is imported into an object that already imported
    /// the first one.
    Reimport,
    /// The payload is exported while a signal is still pending, then imported and waited on.
    SignalExportImportWait,
    /// The payload is exported, signaled, then imported and waited on.
    ExportSignalImportWait,
    /// The payload is exported and imported, then signaled through the exporter and waited on
    /// through the importer, and the other way around.
    ExportImportSignalWait,
    /// The payload is imported into an object that is already signaled.
    SignalImport,
    /// The payload is imported into an object that was signaled and waited on.
    SignalWaitImport,
    /// One object is exported many times, and the first handle still works afterwards.
    MultipleExports,
    /// One handle is imported into many objects.
    MultipleImports,
    /// A duplicate of the handle is imported into an exportable object, which is exported and
    /// imported again.
    ReexportImported,
    /// The payload is imported with the default permanence of the handle type, and the
    /// effect of a wait on the import is checked.
    Permanence,
    /// The payload is imported temporarily, and a wait restores the payload of the importer.
    TemporaryImport,
    /// An exported descriptor is duplicated with `dup` before the import.
    FdDup,
    /// An exported descriptor is duplicated onto a live descriptor with `dup2`.
    FdDup2,
    /// An exported descriptor is duplicated onto a live descriptor with `dup3`.
    FdDup3,
    /// An exported descriptor is passed over a Unix domain socket before the import.
    FdSendOverSocket,
}

impl SyncScenario {
    pub const ALL: [SyncScenario; 16] = [
        Self::ImportTwice,
        Self::Reimport,
        Self::SignalExportImportWait,
        Self::ExportSignalImportWait,
        Self::ExportImportSignalWait,
        Self::SignalImport,
        Self::SignalWaitImport,
        Self::MultipleExports,
        Self::MultipleImports,
        Self::ReexportImported,
        Self::Permanence,
        Self::TemporaryImport,
        Self::FdDup,
        Self::FdDup2,
        Self::FdDup3,
        Self::FdSendOverSocket,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::ImportTwice => "import_twice",
            Self::Reimport => "reimport",
            Self::SignalExportImportWait => "signal_export_import_wait",
            Self::ExportSignalImportWait => "export_signal_import_wait",
            Self::ExportImportSignalWait => "export_import_signal_wait",
            Self::SignalImport => "signal_import",
            Self::SignalWaitImport => "signal_wait_import",
            Self::MultipleExports => "multiple_exports",
            Self::MultipleImports => "multiple_imports",
            Self::ReexportImported => "reexport_imported",
            Self::Permanence => "permanence",
            Self::TemporaryImport => "temporary_import",
            Self::FdDup => "dup",
            Self::FdDup2 => "dup2",
            Self::FdDup3 => "dup3",
            Self::FdSendOverSocket => "send_over_socket",
        }
    }

    /// Runs the scenario for objects of class `S` and `handle_type`.
    pub fn run<S: SyncPrimitive>(
        self,
        ctx: &ScenarioContext,
        handle_type: S::HandleType,
    ) -> Result<(), ScenarioError> {
        let fixture = SyncFixture::<S>::new(ctx, handle_type)?;

        match self {
            Self::ImportTwice => fixture.import_twice(),
            Self::Reimport => fixture.reimport(),
            Self::SignalExportImportWait => fixture.signal_export_import_wait(ctx),
            Self::ExportSignalImportWait => fixture.export_signal_import_wait(),
            Self::ExportImportSignalWait => fixture.export_import_signal_wait(),
            Self::SignalImport => fixture.signal_import(),
            Self::SignalWaitImport => fixture.signal_wait_import(),
            Self::MultipleExports => fixture.multiple_exports(ctx.config.export_count),
            Self::MultipleImports => fixture.multiple_imports(ctx.config.import_count),
            Self::ReexportImported => fixture.reexport_imported(),
            Self::Permanence => fixture.check_permanence(),
            Self::TemporaryImport => fixture.temporary_import(),
            Self::FdDup => fixture.relayed(Relay::Dup),
            Self::FdDup2 => fixture.relayed(Relay::Dup2),
            Self::FdDup3 => fixture.relayed(Relay::Dup3),
            Self::FdSendOverSocket => fixture.relayed(Relay::Socket),
        }?;

        fixture.queue.wait_idle()?;

        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Relay {
    Dup,
    Dup2,
    Dup3,
    Socket,
}

struct SyncFixture<S: SyncPrimitive> {
    device: Arc<Device>,
    queue: Arc<Queue>,
    submission: SubmissionConfig,
    handle_type: S::HandleType,
    exporter: S,
}

impl<S: SyncPrimitive> SyncFixture<S> {
    fn new(ctx: &ScenarioContext, handle_type: S::HandleType) -> Result<Self, InteropError> {
        let (device, queue) = ctx.provision(handle_type.device_extensions())?;
        S::check_support(&device, handle_type)?;
        let exporter = S::new_exportable(device.clone(), handle_type)?;

        Ok(Self {
            device,
            queue,
            submission: ctx.config.submission,
            handle_type,
            exporter,
        })
    }

    #[inline]
    fn is_copy(&self) -> bool {
        self.handle_type.transference() == Transference::Copy
    }

    #[inline]
    fn import_permanence(&self) -> Permanence {
        S::default_permanence(self.handle_type)
    }

    fn require_reference(&self) -> Result<(), InteropError> {
        if self.is_copy() {
            return Err(InteropError::not_supported(
                "a copied payload cannot observe signals submitted after the export",
            ));
        }

        Ok(())
    }

    fn require_copy(&self) -> Result<(), InteropError> {
        if !self.is_copy() {
            return Err(InteropError::not_supported(
                "the handle type aliases the payload instead of copying it",
            ));
        }

        Ok(())
    }

    /// Exports the payload of the exporter. A copy export needs a signal to copy, so one is
    /// submitted first.
    fn export(&self) -> Result<NativeHandle, InteropError> {
        if self.is_copy() {
            self.exporter.submit_signal(&self.queue)?;
        }

        self.exporter.export_handle(self.handle_type)
    }

    fn import(&self, handle: &mut NativeHandle) -> Result<S, InteropError> {
        S::import_handle(&self.device, self.handle_type, handle, self.import_permanence())
    }

    /// Checks that `imported` observes the payload it received: a signal through the exporter
    /// for aliasing handle types, the copied signal for the others.
    fn observe(&self, imported: &S) -> Result<(), InteropError> {
        if !self.is_copy() {
            self.exporter.submit_signal(&self.queue)?;
        }

        imported.wait_signaled(&self.queue, &self.submission)
    }

    fn import_twice(&self) -> Result<(), ScenarioError> {
        let handle = self.export()?;
        let (a, b) =
            import_twice::<S>(&self.device, self.handle_type, &handle, self.import_permanence())?;

        if self.is_copy() {
            a.wait_signaled(&self.queue, &self.submission)?;
            b.wait_signaled(&self.queue, &self.submission)?;
        } else {
            a.submit_signal(&self.queue)?;
            b.wait_signaled(&self.queue, &self.submission)?;
        }

        Ok(())
    }

    fn reimport(&self) -> Result<(), ScenarioError> {
        let mut first = self.export()?;
        let mut second = first.duplicate()?;

        let imported = self.import(&mut first)?;
        imported.import_into(self.handle_type, &mut second, self.import_permanence())?;
        self.observe(&imported)?;

        Ok(())
    }

    fn signal_export_import_wait(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError> {
        self.exporter
            .submit_work_then_signal(&self.queue, &ctx.config.submission)?;
        let mut handle = self.exporter.export_handle(self.handle_type)?;

        let imported = self.import(&mut handle)?;
        imported.wait_signaled(&self.queue, &self.submission)?;

        Ok(())
    }

    fn export_signal_import_wait(&self) -> Result<(), ScenarioError> {
        self.require_reference()?;

        let mut handle = self.exporter.export_handle(self.handle_type)?;
        self.exporter.submit_signal(&self.queue)?;

        let imported = self.import(&mut handle)?;
        imported.wait_signaled(&self.queue, &self.submission)?;

        Ok(())
    }

    fn export_import_signal_wait(&self) -> Result<(), ScenarioError> {
        self.require_reference()?;

        let mut handle = self.exporter.export_handle(self.handle_type)?;
        let imported = self.import(&mut handle)?;

        self.exporter.submit_signal(&self.queue)?;
        imported.wait_signaled(&self.queue, &self.submission)?;

        if self.import_permanence() == Permanence::Permanent {
            imported.submit_signal(&self.queue)?;
            self.exporter.wait_signaled(&self.queue, &self.submission)?;
        }

        Ok(())
    }

    fn signal_import(&self) -> Result<(), ScenarioError> {
        let target = S::new_unexportable(self.device.clone())?;
        target.submit_signal(&self.queue)?;
        self.queue.wait_idle()?;

        let mut handle = self.export()?;
        target.import_into(self.handle_type, &mut handle, self.import_permanence())?;
        self.observe(&target)?;

        Ok(())
    }

    fn signal_wait_import(&self) -> Result<(), ScenarioError> {
        let target = S::new_unexportable(self.device.clone())?;
        let mut handle = self.export()?;

        target.submit_signal(&self.queue)?;
        target.wait_signaled(&self.queue, &self.submission)?;

        target.import_into(self.handle_type, &mut handle, self.import_permanence())?;
        self.observe(&target)?;

        Ok(())
    }

    fn multiple_exports(&self, count: u32) -> Result<(), ScenarioError> {
        let mut first = None;

        for index in 0..count {
            let handle = self.export()?;

            if index == 0 {
                first = Some(handle);
            }
        }

        if let Some(mut first) = first {
            let imported = self.import(&mut first)?;
            self.observe(&imported)?;
        }

        Ok(())
    }

    fn multiple_imports(&self, count: u32) -> Result<(), ScenarioError> {
        let handle = self.export()?;
        let mut last = None;

        for _ in 0..count {
            let mut duplicate = handle.duplicate()?;
            last = Some(self.import(&mut duplicate)?);
        }

        if let Some(imported) = last {
            self.observe(&imported)?;
        }

        Ok(())
    }

    fn reexport_imported(&self) -> Result<(), ScenarioError> {
        self.require_reference()?;

        let handle = self.export()?;
        let mut duplicate = handle.duplicate()?;
        let first = S::new_exportable(self.device.clone(), self.handle_type)?;
        first.import_into(self.handle_type, &mut duplicate, self.import_permanence())?;

        let mut reexported = first.export_handle(self.handle_type)?;
        let second = self.import(&mut reexported)?;
        self.observe(&second)?;

        Ok(())
    }

    fn check_permanence(&self) -> Result<(), ScenarioError> {
        let mut handle = self.export()?;
        let imported = self.import(&mut handle)?;

        match self.import_permanence() {
            Permanence::Temporary => {
                self.observe(&imported)?;
                ensure!(
                    !imported.has_temporary_import(),
                    "the temporary import outlived the wait",
                );
                ensure!(
                    imported.check_import_undone(&self.exporter, &self.queue, &self.submission)?,
                    "the object still uses the imported payload after the wait",
                );
            }
            Permanence::Permanent => {
                self.exporter.submit_signal(&self.queue)?;
                imported.wait_signaled(&self.queue, &self.submission)?;

                imported.submit_signal(&self.queue)?;
                self.exporter.wait_signaled(&self.queue, &self.submission)?;
            }
        }

        Ok(())
    }

    fn temporary_import(&self) -> Result<(), ScenarioError> {
        let target = S::new_unexportable(self.device.clone())?;
        let mut handle = self.export()?;
        target.import_into(self.handle_type, &mut handle, Permanence::Temporary)?;
        ensure!(
            target.has_temporary_import(),
            "the import was not recorded as temporary",
        );

        self.observe(&target)?;
        ensure!(
            !target.has_temporary_import(),
            "the temporary import outlived the wait",
        );
        ensure!(
            target.check_import_undone(&self.exporter, &self.queue, &self.submission)?,
            "the target still uses the imported payload after the wait",
        );

        // The target signals its own payload again.
        target.submit_signal(&self.queue)?;
        target.wait_signaled(&self.queue, &self.submission)?;

        Ok(())
    }

    fn relayed(&self, method: Relay) -> Result<(), ScenarioError> {
        if self.handle_type.handle_kind() != HandleKind::Fd {
            return Err(require_fd_failed().into());
        }

        let handle = self.export()?;
        require_descriptor(&handle)?;

        let mut relayed = match method {
            Relay::Dup => {
                // A closed duplicate leaves the original usable.
                drop(relay::duplicate(&handle)?);

                relay::duplicate(&handle)?
            }
            Relay::Dup2 | Relay::Dup3 => duplicate_into_slot(&handle, method)?,
            Relay::Socket => send_through_socket(&handle)?,
        };

        let imported = self.import(&mut relayed)?;
        self.observe(&imported)?;

        Ok(())
    }
}

fn require_fd_failed() -> InteropError {
    InteropError::not_supported("the handle type is not carried by an fd")
}

fn require_descriptor(handle: &NativeHandle) -> Result<(), InteropError> {
    if handle.is_signaled_sentinel() {
        return Err(InteropError::not_supported(
            "the driver exported the already-signaled sentinel, which has no descriptor",
        ));
    }

    Ok(())
}

/// Duplicates `handle` onto a slot that holds one end of a fresh stream, and checks through the
/// other end that the stream was released by the duplication.
#[cfg(unix)]
fn duplicate_into_slot(
    handle: &NativeHandle,
    method: Relay,
) -> Result<NativeHandle, ScenarioError> {
    use std::{
        io::{self, Read},
        os::unix::net::UnixStream,
    };

    let (slot, witness) = UnixStream::pair().map_err(InteropError::TransferFailed)?;
    let slot = NativeHandle::from_fd(slot.into());
    let source_identity = relay::descriptor_identity(handle)?;

    let slot = match method {
        Relay::Dup3 => relay::duplicate_onto_with_flags(handle, slot, true)?,
        _ => relay::duplicate_onto(handle, slot)?,
    };
    ensure!(
        relay::descriptor_identity(&slot)? == source_identity,
        "the duplicated descriptor refers to a different file",
    );

    witness
        .set_nonblocking(true)
        .map_err(InteropError::TransferFailed)?;
    let released = match (&witness).read(&mut [0u8; 1]) {
        Ok(read) => read == 0,
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
        Err(err) => return Err(InteropError::TransferFailed(err).into()),
    };
    ensure!(
        released,
        "the slot still holds the stream it owned before the duplication",
    );

    Ok(slot)
}

#[cfg(not(unix))]
fn duplicate_into_slot(
    _handle: &NativeHandle,
    _method: Relay,
) -> Result<NativeHandle, ScenarioError> {
    Err(InteropError::not_supported("file descriptors are not available").into())
}

#[cfg(unix)]
fn send_through_socket(handle: &NativeHandle) -> Result<NativeHandle, ScenarioError> {
    use std::os::unix::net::UnixStream;

    let (sender, receiver) = UnixStream::pair().map_err(InteropError::TransferFailed)?;
    relay::send_over_socket(handle, &sender, SOCKET_PAYLOAD)?;

    let mut payload = vec![0u8; SOCKET_PAYLOAD.len()];
    let (received, handle) = relay::receive_from_socket(&receiver, &mut payload)?;
    ensure!(
        payload[..received] == SOCKET_PAYLOAD[..],
        "the socket delivered {:?} instead of {:?}",
        &payload[..received],
        SOCKET_PAYLOAD,
    );

    Ok(handle)
}

#[cfg(not(unix))]
fn send_through_socket(_handle: &NativeHandle) -> Result<NativeHandle, ScenarioError> {
    Err(InteropError::not_supported("Unix domain sockets are not available").into())
}

/// Exports an unsignaled fence as a copy, imports the copy, and checks that a signal submitted
/// afterwards through the exporter is not observed by a zero-timeout wait on the importer.
pub fn copy_fence_zero_timeout(
    ctx: &ScenarioContext,
    handle_type: ExternalFenceHandleType,
) -> Result<(), ScenarioError> {
    let fixture = SyncFixture::<Fence>::new(ctx, handle_type)?;
    fixture.require_copy()?;

    let mut handle = fixture.exporter.export(handle_type)?;
    let imported = Fence::new_imported(
        fixture.device.clone(),
        handle_type,
        &mut handle,
        Permanence::Temporary,
    )?;

    fixture.exporter.submit_signal(&fixture.queue)?;
    ensure!(
        !imported.wait(Some(Duration::ZERO))?,
        "a copied payload observed a signal submitted after the export",
    );

    fixture
        .exporter
        .wait_signaled(&fixture.queue, &fixture.submission)?;
    fixture.queue.wait_idle()?;

    Ok(())
}

/// The memory scenarios.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryScenario {
    /// Two exports of one allocation are both imported.
    ImportTwice,
    /// One allocation is exported many times.
    MultipleExports,
    /// One handle is imported into many allocations.
    MultipleImports,
    /// An exported descriptor is duplicated with `dup` before the import.
    FdDup,
    /// An exported descriptor is duplicated onto a live descriptor with `dup2`.
    FdDup2,
    /// An exported descriptor is duplicated onto a live descriptor with `dup3`.
    FdDup3,
    /// An exported descriptor is passed over a Unix domain socket before the import.
    FdSendOverSocket,
    BufferBindExportImportBind,
    BufferExportBindImportBind,
    BufferExportImportBindBind,
    ImageBindExportImportBind,
    ImageExportBindImportBind,
    ImageExportImportBindBind,
}

impl MemoryScenario {
    pub const ALL: [MemoryScenario; 13] = [
        Self::ImportTwice,
        Self::MultipleExports,
        Self::MultipleImports,
        Self::FdDup,
        Self::FdDup2,
        Self::FdDup3,
        Self::FdSendOverSocket,
        Self::BufferBindExportImportBind,
        Self::BufferExportBindImportBind,
        Self::BufferExportImportBindBind,
        Self::ImageBindExportImportBind,
        Self::ImageExportBindImportBind,
        Self::ImageExportImportBindBind,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::ImportTwice => "import_twice",
            Self::MultipleExports => "multiple_exports",
            Self::MultipleImports => "multiple_imports",
            Self::FdDup => "dup",
            Self::FdDup2 => "dup2",
            Self::FdDup3 => "dup3",
            Self::FdSendOverSocket => "send_over_socket",
            Self::BufferBindExportImportBind => "buffer.bind_export_import_bind",
            Self::BufferExportBindImportBind => "buffer.export_bind_import_bind",
            Self::BufferExportImportBindBind => "buffer.export_import_bind_bind",
            Self::ImageBindExportImportBind => "image.bind_export_import_bind",
            Self::ImageExportBindImportBind => "image.export_bind_import_bind",
            Self::ImageExportImportBindBind => "image.export_import_bind_bind",
        }
    }

    /// Returns whether the scenario can also check contents written from the host.
    pub const fn uses_host_access(self) -> bool {
        matches!(
            self,
            Self::ImportTwice
                | Self::MultipleImports
                | Self::FdDup
                | Self::FdDup2
                | Self::FdDup3
                | Self::FdSendOverSocket
        )
    }

    /// Runs the scenario for `handle_type`.
    ///
    /// With `host_visible`, the allocation is made from a host-visible memory type and the
    /// scenario checks that data written through one allocation is read back through the
    /// others.
    pub fn run(
        self,
        ctx: &ScenarioContext,
        handle_type: ExternalMemoryHandleType,
        host_visible: bool,
    ) -> Result<(), ScenarioError> {
        let host_visible = host_visible && self.uses_host_access();

        match self {
            Self::ImportTwice => {
                MemoryFixture::<Buffer>::new(ctx, handle_type, host_visible)?.import_twice()
            }
            Self::MultipleExports => MemoryFixture::<Buffer>::new(ctx, handle_type, false)?
                .multiple_exports(ctx.config.export_count),
            Self::MultipleImports => MemoryFixture::<Buffer>::new(ctx, handle_type, host_visible)?
                .multiple_imports(ctx.config.import_count),
            Self::FdDup => {
                MemoryFixture::<Buffer>::new(ctx, handle_type, host_visible)?.relayed(Relay::Dup)
            }
            Self::FdDup2 => {
                MemoryFixture::<Buffer>::new(ctx, handle_type, host_visible)?.relayed(Relay::Dup2)
            }
            Self::FdDup3 => {
                MemoryFixture::<Buffer>::new(ctx, handle_type, host_visible)?.relayed(Relay::Dup3)
            }
            Self::FdSendOverSocket => MemoryFixture::<Buffer>::new(ctx, handle_type, host_visible)?
                .relayed(Relay::Socket),
            Self::BufferBindExportImportBind => {
                MemoryFixture::<Buffer>::new(ctx, handle_type, false)?
                    .bind_in_order(BindOrder::BindExportImportBind)
            }
            Self::BufferExportBindImportBind => {
                MemoryFixture::<Buffer>::new(ctx, handle_type, false)?
                    .bind_in_order(BindOrder::ExportBindImportBind)
            }
            Self::BufferExportImportBindBind => {
                MemoryFixture::<Buffer>::new(ctx, handle_type, false)?
                    .bind_in_order(BindOrder::ExportImportBindBind)
            }
            Self::ImageBindExportImportBind => {
                MemoryFixture::<Image>::new(ctx, handle_type, false)?
                    .bind_in_order(BindOrder::BindExportImportBind)
            }
            Self::ImageExportBindImportBind => {
                MemoryFixture::<Image>::new(ctx, handle_type, false)?
                    .bind_in_order(BindOrder::ExportBindImportBind)
            }
            Self::ImageExportImportBindBind => {
                MemoryFixture::<Image>::new(ctx, handle_type, false)?
                    .bind_in_order(BindOrder::ExportImportBindBind)
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum BindOrder {
    BindExportImportBind,
    ExportBindImportBind,
    ExportImportBindBind,
}

/// A resource that memory is bound to.
trait BindTarget: Sized {
    fn check_support(
        physical_device: &PhysicalDevice,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<(), InteropError>;

    fn new_external(
        device: Arc<Device>,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<Self, InteropError>;

    fn memory_requirements(&self) -> &MemoryRequirements;

    fn dedicated(&self) -> DedicatedAllocation<'_>;

    fn bind(&self, memory: Arc<DeviceMemory>) -> Result<(), InteropError>;
}

impl BindTarget for Buffer {
    fn check_support(
        physical_device: &PhysicalDevice,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<(), InteropError> {
        query_buffer_support(
            physical_device,
            handle_type,
            BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
        )
        .require_export_import()
    }

    fn new_external(
        device: Arc<Device>,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<Self, InteropError> {
        Buffer::new(
            device,
            BufferCreateInfo {
                size: MEMORY_BUFFER_SIZE,
                external_memory_handle_types: handle_type.into(),
                ..Default::default()
            },
        )
    }

    #[inline]
    fn memory_requirements(&self) -> &MemoryRequirements {
        Buffer::memory_requirements(self)
    }

    #[inline]
    fn dedicated(&self) -> DedicatedAllocation<'_> {
        DedicatedAllocation::Buffer(self)
    }

    #[inline]
    fn bind(&self, memory: Arc<DeviceMemory>) -> Result<(), InteropError> {
        self.bind_memory(memory, 0)
    }
}

impl BindTarget for Image {
    fn check_support(
        physical_device: &PhysicalDevice,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<(), InteropError> {
        query_image_support(
            physical_device,
            handle_type,
            Format::R8G8B8A8_UNORM,
            ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
        )?
        .require_export_import()
    }

    fn new_external(
        device: Arc<Device>,
        handle_type: ExternalMemoryHandleType,
    ) -> Result<Self, InteropError> {
        Image::new(
            device,
            ImageCreateInfo {
                external_memory_handle_types: handle_type.into(),
                ..Default::default()
            },
        )
    }

    #[inline]
    fn memory_requirements(&self) -> &MemoryRequirements {
        Image::memory_requirements(self)
    }

    #[inline]
    fn dedicated(&self) -> DedicatedAllocation<'_> {
        DedicatedAllocation::Image(self)
    }

    #[inline]
    fn bind(&self, memory: Arc<DeviceMemory>) -> Result<(), InteropError> {
        self.bind_memory(memory, 0)
    }
}

struct MemoryFixture<R: BindTarget> {
    device: Arc<Device>,
    handle_type: ExternalMemoryHandleType,
    host_visible: bool,
    resource: R,
    requirements: MemoryRequirements,
    memory_type_index: u32,
    memory: Arc<DeviceMemory>,
}

impl<R: BindTarget> MemoryFixture<R> {
    fn new(
        ctx: &ScenarioContext,
        handle_type: ExternalMemoryHandleType,
        host_visible: bool,
    ) -> Result<Self, InteropError> {
        let (device, _queue) = ctx.provision(handle_type.device_extensions())?;
        R::check_support(device.physical_device(), handle_type)?;

        let resource = R::new_external(device.clone(), handle_type)?;
        let requirements = *resource.memory_requirements();
        let memory_type_index = if host_visible {
            choose_host_visible_memory_type(
                device.physical_device(),
                requirements.memory_type_bits,
            )?
        } else {
            choose_memory_type(requirements.memory_type_bits)?
        };

        let dedicated = requirements
            .requires_dedicated_allocation
            .then(|| resource.dedicated());
        let memory = DeviceMemory::allocate_exportable(
            device.clone(),
            requirements.size,
            memory_type_index,
            handle_type,
            dedicated,
        )?;

        Ok(Self {
            device,
            handle_type,
            host_visible,
            resource,
            requirements,
            memory_type_index,
            memory: Arc::new(memory),
        })
    }

    /// Imports `handle` for a new resource, dedicated to it when the handle type requires it.
    fn import(&self, handle: &mut NativeHandle) -> Result<(R, DeviceMemory), InteropError> {
        let resource = R::new_external(self.device.clone(), self.handle_type)?;

        let memory = if self.requirements.requires_dedicated_allocation {
            DeviceMemory::import_dedicated(
                self.device.clone(),
                resource.dedicated(),
                self.handle_type,
                self.memory_type_index,
                handle,
            )?
        } else {
            DeviceMemory::import(
                self.device.clone(),
                &self.requirements,
                self.handle_type,
                self.memory_type_index,
                handle,
            )?
        };

        Ok((resource, memory))
    }

    /// Fills the exported allocation with data derived from `seed`, if the scenario checks
    /// contents.
    fn fill(&self, seed: u32) -> Result<Option<Vec<u8>>, InteropError> {
        if !self.host_visible {
            return Ok(None);
        }

        let data = test_data(seed, MEMORY_BUFFER_SIZE as usize);
        write_memory(&self.memory, &data)?;

        Ok(Some(data))
    }

    /// Checks that `imported` holds `expected`, then that a write through `imported` is visible
    /// through the exported allocation.
    fn check_shared(
        &self,
        imported: &DeviceMemory,
        expected: Option<&[u8]>,
        seed: u32,
    ) -> Result<(), ScenarioError> {
        let Some(expected) = expected else {
            return Ok(());
        };

        check_contents(imported, expected, "the imported allocation")?;

        let written = test_data(seed, expected.len());
        write_memory(imported, &written)?;
        check_contents(&self.memory, &written, "the exported allocation")?;

        Ok(())
    }

    fn import_twice(&self) -> Result<(), ScenarioError> {
        let data = self.fill(MEMORY_DATA_SEED)?;
        let mut handle_a = self.memory.export(self.handle_type)?;
        let mut handle_b = self.memory.export(self.handle_type)?;

        let (_resource_a, memory_a) = self.import(&mut handle_a)?;
        let (_resource_b, memory_b) = self.import(&mut handle_b)?;

        if let Some(data) = &data {
            check_contents(&memory_a, data, "the first import")?;
            check_contents(&memory_b, data, "the second import")?;

            let written = test_data(MEMORY_DATA_SEED ^ 1, data.len());
            write_memory(&memory_a, &written)?;
            check_contents(&memory_b, &written, "the second import")?;
            check_contents(&self.memory, &written, "the exported allocation")?;
        }

        Ok(())
    }

    fn multiple_exports(&self, count: u32) -> Result<(), ScenarioError> {
        for _ in 0..count {
            self.memory.export(self.handle_type)?;
        }

        Ok(())
    }

    fn multiple_imports(&self, count: u32) -> Result<(), ScenarioError> {
        let data = self.fill(MEMORY_DATA_SEED)?;
        let handle = self.memory.export(self.handle_type)?;
        let mut last = None;

        for _ in 0..count {
            let mut duplicate = handle.duplicate()?;
            last = Some(self.import(&mut duplicate)?);
        }

        if let Some((_resource, memory)) = &last {
            self.check_shared(memory, data.as_deref(), MEMORY_DATA_SEED ^ 1)?;
        }

        Ok(())
    }

    fn relayed(&self, method: Relay) -> Result<(), ScenarioError> {
        if self.handle_type.handle_kind() != HandleKind::Fd {
            return Err(require_fd_failed().into());
        }

        let data = self.fill(MEMORY_DATA_SEED)?;
        let handle = self.memory.export(self.handle_type)?;

        let mut relayed = match method {
            Relay::Dup => {
                drop(relay::duplicate(&handle)?);

                relay::duplicate(&handle)?
            }
            Relay::Dup2 | Relay::Dup3 => duplicate_into_slot(&handle, method)?,
            Relay::Socket => send_through_socket(&handle)?,
        };

        let (_resource, imported) = self.import(&mut relayed)?;
        self.check_shared(&imported, data.as_deref(), MEMORY_DATA_SEED ^ 2)?;

        Ok(())
    }

    fn bind_in_order(&self, order: BindOrder) -> Result<(), ScenarioError> {
        let (resource, imported) = match order {
            BindOrder::BindExportImportBind => {
                self.resource.bind(self.memory.clone())?;
                let mut handle = self.memory.export(self.handle_type)?;
                self.import(&mut handle)?
            }
            BindOrder::ExportBindImportBind => {
                let mut handle = self.memory.export(self.handle_type)?;
                self.resource.bind(self.memory.clone())?;
                self.import(&mut handle)?
            }
            BindOrder::ExportImportBindBind => {
                let mut handle = self.memory.export(self.handle_type)?;
                let imported = self.import(&mut handle)?;
                self.resource.bind(self.memory.clone())?;
                imported
            }
        };

        resource.bind(Arc::new(imported))?;

        Ok(())
    }
}

/// Deterministic bytes derived from `seed`.
fn test_data(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed;

    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect()
}

fn write_memory(memory: &DeviceMemory, data: &[u8]) -> Result<(), InteropError> {
    let mut mapped = memory.map()?;
    mapped.write(0, data)?;
    mapped.flush()
}

fn check_contents(
    memory: &DeviceMemory,
    expected: &[u8],
    what: &str,
) -> Result<(), ScenarioError> {
    let mapped = memory.map()?;
    mapped.invalidate()?;

    let mut contents = vec![0u8; expected.len()];
    mapped.read(0, &mut contents)?;

    if let Some(offset) = contents.iter().zip(expected).position(|(a, b)| a != b) {
        return Err(ScenarioError::CheckFailed(format!(
            "{} differs from the written data at byte {}",
            what, offset,
        )));
    }

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::{
        copy_fence_zero_timeout, duplicate_into_slot, run_all, run_scenario, MemoryScenario, Relay,
        ScenarioConfig, ScenarioContext, ScenarioError, ScenarioOutcome, SyncScenario,
    };
    use crate::{
        device::DeviceExtensions,
        driver::soft::SoftDriverConfig,
        handle::NativeHandle,
        memory::{DeviceMemory, ExternalMemoryHandleType, ExternalMemoryHandleTypes},
        relay,
        submit::SubmissionConfig,
        sync::{ExternalFenceHandleType, ExternalSemaphoreHandleType, Fence, Semaphore},
        InteropError,
    };

    fn small_config() -> ScenarioConfig {
        ScenarioConfig {
            export_count: 16,
            import_count: 32,
            submission: SubmissionConfig {
                work_buffer_size: 4096,
                ..Default::default()
            },
        }
    }

    fn assert_pass(outcome: ScenarioOutcome) {
        assert_eq!(outcome, ScenarioOutcome::Pass);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_from_json() {
        let config: ScenarioConfig = serde_json::from_str(
            r#"{"import_count": 8, "submission": {"work_iterations": 4}}"#,
        )
        .unwrap();

        assert_eq!(config.import_count, 8);
        assert_eq!(config.export_count, 1024);
        assert_eq!(config.submission.work_iterations, 4);
        assert_eq!(config.submission.work_buffer_size, 1 << 20);
    }

    #[test]
    fn outcome_classification() {
        assert!(run_scenario("pass", || Ok(())).is_pass());
        assert!(run_scenario("skip", || {
            Err(InteropError::not_supported("no driver").into())
        })
        .is_skip());
        assert!(run_scenario("fail", || Err(InteropError::InvalidHandle(
            "closed".into()
        )
        .into()))
        .is_fail());
        assert!(run_scenario("check", || Err(ScenarioError::CheckFailed(
            "mismatch".to_owned()
        )))
        .is_fail());
    }

    #[test]
    fn semaphore_scenarios_pass_on_soft_driver() {
        let ctx = ScenarioContext::new(soft_physical_device!(), small_config());

        for handle_type in [
            ExternalSemaphoreHandleType::OpaqueFd,
            ExternalSemaphoreHandleType::SyncFd,
        ] {
            for scenario in SyncScenario::ALL {
                let outcome = run_scenario(scenario.name(), || {
                    scenario.run::<Semaphore>(&ctx, handle_type)
                });

                assert!(
                    !outcome.is_fail(),
                    "{:?} {:?}: {:?}",
                    handle_type,
                    scenario,
                    outcome,
                );
            }
        }
    }

    #[test]
    fn fence_scenarios_pass_on_soft_driver() {
        let ctx = ScenarioContext::new(soft_physical_device!(), small_config());

        for handle_type in [
            ExternalFenceHandleType::OpaqueFd,
            ExternalFenceHandleType::SyncFd,
        ] {
            for scenario in SyncScenario::ALL {
                let outcome = run_scenario(scenario.name(), || {
                    scenario.run::<Fence>(&ctx, handle_type)
                });

                assert!(
                    !outcome.is_fail(),
                    "{:?} {:?}: {:?}",
                    handle_type,
                    scenario,
                    outcome,
                );
            }
        }
    }

    #[test]
    fn reference_only_scenarios_skip_for_copies() {
        let ctx = ScenarioContext::new(soft_physical_device!(), small_config());

        let outcome = run_scenario("export_signal_import_wait", || {
            SyncScenario::ExportSignalImportWait
                .run::<Semaphore>(&ctx, ExternalSemaphoreHandleType::SyncFd)
        });
        assert!(outcome.is_skip());

        assert_pass(run_scenario("export_signal_import_wait", || {
            SyncScenario::ExportSignalImportWait
                .run::<Semaphore>(&ctx, ExternalSemaphoreHandleType::OpaqueFd)
        }));
    }

    #[test]
    fn unsupported_handle_types_skip() {
        let ctx = ScenarioContext::new(soft_physical_device!(), small_config());

        let outcome = run_scenario("import_twice", || {
            SyncScenario::ImportTwice
                .run::<Semaphore>(&ctx, ExternalSemaphoreHandleType::OpaqueWin32)
        });
        assert!(outcome.is_skip());

        let outcome = run_scenario("dup", || {
            MemoryScenario::FdDup.run(&ctx, ExternalMemoryHandleType::AndroidHardwareBuffer, true)
        });
        assert!(outcome.is_skip());
    }

    #[test]
    fn signaled_sentinel_skips_relays() {
        let physical_device = soft_physical_device!(SoftDriverConfig {
            sync_fd_signaled_sentinel: true,
            ..Default::default()
        });
        let ctx = ScenarioContext::new(physical_device, small_config());

        assert_pass(run_scenario("import_twice", || {
            SyncScenario::ImportTwice.run::<Semaphore>(&ctx, ExternalSemaphoreHandleType::SyncFd)
        }));
        assert!(run_scenario("dup", || {
            SyncScenario::FdDup.run::<Semaphore>(&ctx, ExternalSemaphoreHandleType::SyncFd)
        })
        .is_skip());
    }

    #[test]
    fn copied_fence_ignores_later_signals() {
        let ctx = ScenarioContext::new(soft_physical_device!(), small_config());

        assert_pass(run_scenario("copy_zero_timeout", || {
            copy_fence_zero_timeout(&ctx, ExternalFenceHandleType::SyncFd)
        }));
        assert!(run_scenario("copy_zero_timeout", || {
            copy_fence_zero_timeout(&ctx, ExternalFenceHandleType::OpaqueFd)
        })
        .is_skip());
    }

    #[test]
    fn memory_scenarios_pass_on_soft_driver() {
        let ctx = ScenarioContext::new(soft_physical_device!(), small_config());

        for handle_type in [ExternalMemoryHandleType::OpaqueFd, ExternalMemoryHandleType::DmaBuf] {
            for scenario in MemoryScenario::ALL {
                for host_visible in [false, true] {
                    assert_pass(run_scenario(scenario.name(), || {
                        scenario.run(&ctx, handle_type, host_visible)
                    }));
                }
            }
        }
    }

    #[test]
    fn dedicated_only_memory() {
        let physical_device = soft_physical_device!(SoftDriverConfig {
            dedicated_only_memory_handle_types: ExternalMemoryHandleTypes::DMA_BUF,
            ..Default::default()
        });
        let ctx = ScenarioContext::new(physical_device, small_config());

        for scenario in [
            MemoryScenario::ImportTwice,
            MemoryScenario::FdSendOverSocket,
            MemoryScenario::ImageExportImportBindBind,
        ] {
            assert_pass(run_scenario(scenario.name(), || {
                scenario.run(&ctx, ExternalMemoryHandleType::DmaBuf, true)
            }));
        }
    }

    #[test]
    fn dedicated_only_memory_is_never_shared() {
        let physical_device = soft_physical_device!(SoftDriverConfig {
            dedicated_only_memory_handle_types: ExternalMemoryHandleTypes::DMA_BUF,
            ..Default::default()
        });
        let ctx = ScenarioContext::new(physical_device, small_config());
        let handle_type = ExternalMemoryHandleType::DmaBuf;
        let (device, _queue) = ctx
            .provision(DeviceExtensions::for_memory(handle_type))
            .unwrap();

        assert!(matches!(
            DeviceMemory::allocate_exportable(device, 1024, 0, handle_type, None),
            Err(InteropError::ValidationFailed { .. }),
        ));
    }

    #[test]
    fn repeated_exports_and_imports_at_default_counts() {
        let config = ScenarioConfig::default();
        assert!(config.export_count >= 1024 && config.import_count >= 4096);
        let ctx = ScenarioContext::new(soft_physical_device!(), config);

        for scenario in [SyncScenario::MultipleExports, SyncScenario::MultipleImports] {
            assert_pass(run_scenario(scenario.name(), || {
                scenario.run::<Semaphore>(&ctx, ExternalSemaphoreHandleType::OpaqueFd)
            }));
            assert_pass(run_scenario(scenario.name(), || {
                scenario.run::<Fence>(&ctx, ExternalFenceHandleType::OpaqueFd)
            }));
        }

        for scenario in [MemoryScenario::MultipleExports, MemoryScenario::MultipleImports] {
            assert_pass(run_scenario(scenario.name(), || {
                scenario.run(&ctx, ExternalMemoryHandleType::OpaqueFd, true)
            }));
        }
    }

    #[test]
    fn slot_is_released_by_dup2_and_dup3() {
        for method in [Relay::Dup2, Relay::Dup3] {
            let (stream, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
            let handle = NativeHandle::from_fd(stream.into());

            let slot = duplicate_into_slot(&handle, method).unwrap();
            assert_ne!(slot.raw(), handle.raw());
            assert_eq!(
                relay::descriptor_identity(&slot).unwrap(),
                relay::descriptor_identity(&handle).unwrap(),
            );
        }
    }

    #[test]
    fn run_all_reports_every_combination() {
        let ctx = ScenarioContext::new(soft_physical_device!(), small_config());
        let reports = run_all(&ctx);

        assert!(reports.iter().all(|report| !report.outcome.is_fail()));
        assert!(reports
            .iter()
            .any(|report| report.name == "semaphore.sync_fd.permanence"));
        assert!(reports
            .iter()
            .any(|report| report.name == "memory.dma_buf.dup2.host_visible"));
        assert!(reports
            .iter()
            .filter(|report| report.name.starts_with("fence.opaque_win32."))
            .all(|report| report.outcome.is_skip()));
    }

    #[test]
    fn calibrated_context() {
        let ctx = ScenarioContext::calibrated(soft_physical_device!(), small_config()).unwrap();

        assert!(ctx.config().submission.work_iterations >= 1);
        assert_pass(run_scenario("signal_export_import_wait", || {
            SyncScenario::SignalExportImportWait
                .run::<Fence>(&ctx, ExternalFenceHandleType::OpaqueFd)
        }));
    }
}
