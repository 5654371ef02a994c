//! The [`Probe`] is the composition root: it owns the decoding data path,
//! the resolution caches, the filtering registries and the raw event
//! transport, and exposes the entry points a rule engine calls to push
//! filtering down to the kernel.

use std::sync::Arc;

use argus_core::{
    dispatcher::{Dispatcher, EventConsumer},
    event::{Event, EventKind},
    resolvers::{mount::MountinfoError, Resolvers},
    stats::{EventStats, MetricSink, SinkError, StatsSnapshot},
};
use kernel_filtering::{
    defaults::{default_approvers, default_discarders},
    policy::{apply_filter_policy, policy_table_name},
    ApproverRegistry, Approvers, Discarder, DiscarderRegistry, FilterError, FilterPolicy,
    FilterValue, KernelTables, PolicyFlags, PolicyMode, TableError,
};
use probe_common::{BpfContext, Program, ProgramBuilder, ProgramError};
use strum::IntoEnumIterator;

use crate::{config::Config, syscall_monitor::SyscallMonitor};

const PROBE_NAME: &str = "runtime-security";

/// Perf event array the kernel-side programs write event buffers to.
const EVENTS_MAP: &str = "map_output_events";

/// Build and attach the kernel-side programs. `probe` is the compiled eBPF
/// bytecode, produced and versioned externally.
///
/// LSM hooks provide the perfect intercept point for file system
/// operations. When LSM eBPF programs are not supported, we attach to the
/// same kernel functions, but using kprobes.
pub async fn program(ctx: BpfContext, probe: Vec<u8>) -> Result<Program, ProgramError> {
    probe_common::bump_memlock_rlimit();
    let attach_to_lsm = ctx.lsm_supported();
    let mut builder = ProgramBuilder::new(ctx, PROBE_NAME, probe);
    if attach_to_lsm {
        builder = builder
            .lsm("file_open")
            .lsm("path_mkdir")
            .lsm("path_rmdir")
            .lsm("path_unlink")
            .lsm("path_rename")
            .lsm("path_link")
            .lsm("inode_setattr")
            .lsm("inode_setxattr")
            .lsm("inode_removexattr")
            .lsm("sb_mount")
            .lsm("sb_umount");
    } else {
        builder = builder
            .kprobe("security_file_open")
            .kprobe("security_path_mkdir")
            .kprobe("security_path_rmdir")
            .kprobe("security_path_unlink")
            .kprobe("security_path_rename")
            .kprobe("security_path_link")
            .kprobe("security_inode_setattr")
            .kprobe("security_inode_setxattr")
            .kprobe("security_inode_removexattr")
            .kprobe("security_sb_mount")
            .kprobe("security_sb_umount");
    }
    builder.start().await
}

pub struct Probe {
    config: Config,
    tables: Arc<dyn KernelTables>,
    resolvers: Arc<Resolvers>,
    stats: Arc<EventStats>,
    discarders: DiscarderRegistry,
    approvers: ApproverRegistry,
    dispatcher: Dispatcher,
    syscall_monitor: Option<SyscallMonitor>,
    program: Option<Program>,
}

impl Probe {
    /// Compose a new probe. The discarder and approver registries are built
    /// here, explicitly: registration order and completeness are decided by
    /// this function alone.
    pub fn new(
        config: Config,
        tables: Arc<dyn KernelTables>,
        consumer: Arc<dyn EventConsumer>,
    ) -> Self {
        let resolvers = Arc::new(Resolvers::new());
        let stats = Arc::new(EventStats::new());
        let dispatcher = Dispatcher::new(resolvers.clone(), stats.clone(), consumer);
        let discarders = default_discarders(tables.clone()).build(config.enable_discarders);
        let approvers = default_approvers(tables.clone());
        let syscall_monitor = config.syscall_monitor.then(SyscallMonitor::new);

        Self {
            config,
            tables,
            resolvers,
            stats,
            discarders,
            approvers,
            dispatcher,
            syscall_monitor,
            program: None,
        }
    }

    /// Initialise the kernel-side policy state.
    ///
    /// With filtering disabled, every event type gets an explicit
    /// pass-everything record: the default must never rely on the policy
    /// tables happening to be zeroed. Event types without a policy table
    /// are skipped.
    pub fn init(&self) -> Result<(), TableError> {
        if self.config.enable_kernel_filters {
            return Ok(());
        }
        log::warn!(
            "Forcing in-kernel filter policy to `{}`: filtering not enabled",
            PolicyMode::NoFilter
        );
        for kind in EventKind::iter() {
            match self
                .tables
                .write_policy(&policy_table_name(kind), FilterPolicy::pass())
            {
                Ok(()) | Err(TableError::TableNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Start consuming events from an attached program. Buffers flow from
    /// the per-CPU readers straight into the dispatcher.
    pub async fn start(&mut self, mut program: Program) -> Result<(), ProgramError> {
        program
            .read_raw_events(EVENTS_MAP, self.dispatcher.clone())
            .await?;
        if let Some(monitor) = &self.syscall_monitor {
            monitor.start(&mut program).await?;
        }
        self.program = Some(program);
        Ok(())
    }

    /// Sync the resolution caches with the current state of the system.
    pub fn snapshot(&self) -> Result<(), MountinfoError> {
        self.resolvers.snapshot()
    }

    /// Stop the transport: per-CPU readers and pollers shut down with it.
    /// In-flight callbacks run to completion, no new ones are scheduled.
    pub fn close(&mut self) {
        if self.program.take().is_some() {
            log::info!("stopping {PROBE_NAME} event source");
        }
    }

    /// Called by the rule engine when evaluation discovers a new discarder.
    /// A guaranteed no-op when discarders are disabled by configuration.
    pub fn notify_discarder(
        &self,
        event_type: EventKind,
        event: &Event,
        field: &str,
        value: FilterValue,
    ) -> Result<(), FilterError> {
        self.discarders.notify(
            event_type,
            event,
            &Discarder {
                field: field.to_string(),
                value,
            },
        )
    }

    /// Install the static approvers the rule set derived for `event_type`.
    pub fn apply_approvers(
        &self,
        event_type: EventKind,
        approvers: &Approvers,
    ) -> Result<(), FilterError> {
        self.approvers.apply(event_type, approvers)
    }

    /// Write the coarse filtering policy for `event_type`.
    pub fn apply_filter_policy(
        &self,
        event_type: EventKind,
        table_name: &str,
        mode: PolicyMode,
        flags: PolicyFlags,
    ) -> Result<(), TableError> {
        apply_filter_policy(self.tables.as_ref(), event_type, table_name, mode, flags)
    }

    /// Non-destructive counters snapshot for on-demand inspection.
    pub fn get_stats(&self) -> StatsSnapshot {
        let syscalls = self
            .syscall_monitor
            .as_ref()
            .map(|monitor| serde_json::to_value(monitor.get_stats()).unwrap_or_default());
        self.stats.snapshot(syscalls)
    }

    /// Destructive periodic export of all counters to `sink`.
    pub fn send_stats(&self, sink: &mut dyn MetricSink) -> Result<(), SinkError> {
        if let Some(monitor) = &self.syscall_monitor {
            monitor.send(sink)?;
        }
        self.stats.send(sink)
    }

    pub fn stats(&self) -> &EventStats {
        &self.stats
    }

    pub fn resolvers(&self) -> &Resolvers {
        &self.resolvers
    }

    /// The per-buffer entry point, exposed for embedding the probe on top
    /// of a transport other than the built-in one, and for tests.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}
